//! Forwarding to the monitoring server.
//!
//! The [`Sender`] drains the result buffer when the send threshold is
//! crossed, when the send interval elapsed since the last successful send,
//! and once more on shutdown. Transmission goes through a
//! [`ServerTransport`]; [`JsonLineTransport`] is the built-in one.

mod address_pool;
mod runner;
mod transport;

pub use address_pool::AddressPool;
pub use runner::{SendResult, Sender, SenderConfig};
pub use transport::{JsonLineTransport, Redirect, SendAck, SendError, ServerTransport};
