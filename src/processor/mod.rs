//! Operation processors: the layer between a client call and a backend's
//! wire protocol.

pub mod async_processor;
pub mod multi_processor;

pub use async_processor::AsyncOperationProcessor;
pub use multi_processor::MultiBackendOperationProcessor;
