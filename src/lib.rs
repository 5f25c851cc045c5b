//! kernelcomm - the remote-call bus between a scientific IDE frontend
//! and its computation kernel.
//!
//! A *comm* is a duplex channel carrying `(JSON dictionary, buffer-list)`
//! messages, identified by an opaque id. On top of a set of comms this
//! crate runs a symmetric, JSON-RPC-style call protocol: either side
//! registers named handlers and invokes the peer's handlers by name, with
//! fire-and-forget, callback-delivered, or strictly-blocking semantics.
//! Byte-valued arguments and returns ride out-of-band in the buffer list
//! rather than base64-inflating the JSON, and errors raised while
//! servicing a call cross the wire as structured [`ErrorWrapper`]s that
//! re-raise on the caller side.
//!
//! # Architecture
//!
//! ```text
//! CallBuilder ──► CommEngine ──► CommMux ──► transport
//! transport ──► CommEngine::on_incoming ──► CallRegistry handler
//!                                      └──► wait list / reply inbox
//! ```
//!
//! The engine is logically single-threaded: the host delivers messages on
//! one cooperative loop, handlers run to completion inside dispatch, and
//! the only suspension point is the pluggable [`WaitReply`] primitive
//! used by blocking calls. The transport below provides ordered, reliable
//! per-comm delivery and framing; see [`Comm`].
//!
//! # Usage
//!
//! ```ignore
//! use kernelcomm::{CommEngine, Payload};
//! use serde_json::json;
//!
//! let engine = CommEngine::new();
//! engine.register_call_handler("echo", |args| {
//!     Ok(args.arg(0).cloned().unwrap_or(Payload::null()))
//! });
//! engine.register_comm(Box::new(my_comm));
//!
//! let reply = engine
//!     .remote_call()
//!     .comm("kernel-0")
//!     .blocking()
//!     .call("echo")
//!     .arg(json!("hi"))
//!     .invoke()?;
//! ```

pub mod builder;
pub mod engine;
pub mod error;
pub mod message;
pub mod mux;
pub mod registry;
pub mod wait;

pub use builder::{BoundCall, CallBuilder};
pub use engine::{CommEngine, ReplyCallback, DEFAULT_TIMEOUT};
pub use error::{CommError, ErrorWrapper, FrameSummary, HandlerError};
pub use message::{CallArgs, CallContent, CallSettings, Message, Payload, ReplyContent};
pub use mux::{Comm, CommId, CommMux, CommState};
pub use registry::{CallHandler, CallRegistry};
pub use wait::WaitReply;
