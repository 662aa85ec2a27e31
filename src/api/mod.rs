//! Typed request/response contract and its HTTP transport
pub mod messages;
pub mod router;
pub mod server;
pub mod tab_socket;

pub use messages::{ErrorCode, Request, Response};
pub use router::Router;
