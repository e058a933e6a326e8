//! The Client Waiter: an SDK-side component that opens
//! a realtime stream to the Gateway, tolerates reconnects, and surfaces a
//! single terminal result to the caller.

pub mod config;
pub mod error;
mod sse;
pub mod waiter;

pub use config::WaiterConfig;
pub use error::ClientError;
pub use waiter::{OcrbaseClient, TerminalResult};
