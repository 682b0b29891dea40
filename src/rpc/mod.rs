//! # JSON-RPC Layer
//!
//! Transport-free JSON-RPC 2.0 handling on top of
//! [`PlumberService`](crate::api::PlumberService). An HTTP or WebSocket
//! server only needs to feed request bodies to [`RpcRouter::handle_raw`].
//!
//! Steps are delivered by agent polling (`plumber.agent.pollTask`); the
//! server never pushes work to agents.

pub mod jsonrpc;
pub mod methods;
pub mod router;

pub use jsonrpc::{RpcError, RpcRequest, RpcResponse};
pub use methods::{MethodParseError, RpcMethod};
pub use router::RpcRouter;
