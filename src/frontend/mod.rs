pub mod http;
pub mod http_utils;
