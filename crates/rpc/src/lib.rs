//! JSON-RPC dispatcher (§4.F): schema validation, method registry, and a
//! per-method override mechanism, sitting behind the message-bus adapter
//! and the reactor.

mod dispatcher;
mod handler;
mod overrides;
mod registry;
mod schema;
pub mod types;

pub use dispatcher::Dispatcher;
pub use handler::MethodHandler;
pub use overrides::{MethodOverride, OverrideTable, PostExtract};
pub use registry::{MethodRegistry, RegisteredMethod};
pub use schema::{MethodArg, MethodSchema};
pub use types::{RpcBody, RpcError, RpcRequest, RpcResponse};
