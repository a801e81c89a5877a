pub mod dispatcher;
pub mod protocol;
pub mod providers;
pub mod tools;

pub use dispatcher::Dispatcher;
pub use protocol::{JsonRpcRequest, JsonRpcResponse};
