//! Flow definitions: the stored graph, its validation and its execution.

pub mod config;
pub mod graph;
pub mod interpreter;
pub mod model;
pub mod predicate;
pub mod transform;
pub mod validate;

pub use interpreter::{ExecutionError, FlowInterpreter, FlowRequest, FlowResponse, NodeFailure};
pub use model::Flow;
pub use validate::{validate, FlowValidationError};
