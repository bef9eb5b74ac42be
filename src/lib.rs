//! Reactor-driven, multi-transport JSON-RPC 2.0 client core.
//!
//! This crate is the connection engine behind a virtualization-management
//! stack's communication with host agents: a single-threaded [`reactor`]
//! multiplexes non-blocking I/O across many connections, a pluggable
//! [`transport`] layer frames messages (length-prefixed binary or
//! WebSocket, either optionally wrapped in TLS), and a [`tracker`]
//! correlates outgoing requests with incoming responses, retries them
//! according to policy, and times them out. [`client::JsonRpcClient`] ties
//! the three together into a small facade applications actually call.
//!
//! Configuration loading, TLS material loading, and wiring a `tracing`
//! subscriber are left to the embedding binary; this crate only consumes
//! already-built values for those.

#![allow(dead_code)]

pub mod client;
pub mod codec;
pub mod error;
pub mod msgs;
pub mod policy;
pub mod reactor;
pub mod tls;
pub mod tracker;
pub mod transport;
#[cfg(test)]
mod testing;
mod util;

pub use client::JsonRpcClient;
pub use error::{CallError, CallFailure, DecodeError, PolicyError, SendError, SubmitError, WireError};
pub use msgs::RequestId;
pub use policy::ClientPolicy;
pub use reactor::{ClientId, Reactor};
pub use tracker::{BatchCall, Call, CallResult, ResponseTracker};
pub use transport::{TransportConfig, TransportKind};
