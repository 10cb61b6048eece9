pub mod auth;
pub mod catalog;
pub mod config;
pub mod context;
pub mod data_types;
pub mod flow;
pub mod frontend;
pub mod repository;
pub mod resolver;
pub mod sync;
