//! Single-process HTTP/1.1 server over the cooperative runtime.
//!
//! The server is a consumer of the core contracts: it loops on `Accept`,
//! spawns one detached task per connection, reads request heads through
//! the buffered stream, and writes responses with `SendAll` and
//! `SendFile`. Request parsing is deliberately minimal — just enough
//! head handling to drive application handlers.

pub mod conn;
pub mod proto;
pub mod server;

pub use conn::ConnTask;
pub use proto::{Body, Handler, HttpVersion, Request, Response};
pub use server::{listen, serve};
