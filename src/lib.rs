//! Line-oriented multi-client chat relay.
//!
//! Clients connect over TCP, pick a nickname and exchange newline-terminated
//! messages that are broadcast to every connected client.
//!
//! - [`server`] owns the listener, the accept loop and server-wide shutdown.
//! - [`registry`] keeps the set of live sessions and fans messages out.
//! - [`session`] is the per-client handle other sessions send through.
//! - [`conn`] drives one connection: handshake, commands, relay, teardown.
//! - [`protocol`] parses client lines and formats the fixed wire strings.

pub mod config;
pub mod conn;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::SendError;
pub use registry::Registry;
pub use server::{Acceptor, Server, ServerHandle};
pub use session::{SessionHandle, SessionId};
