//! The pluggable blocking-wait primitive.
//!
//! The engine's only suspension point is the wait for a blocking call's
//! reply. How that wait is realized belongs to the host environment - a
//! condition variable under a real thread model, a cooperative pump that
//! drains the transport until the matching reply lands, a future on the
//! host scheduler - so the engine delegates it to this trait and ships no
//! event-loop integration of its own.

use std::time::Duration;

use crate::engine::CommEngine;
use crate::error::CommError;
use crate::mux::CommId;

/// Host-provided blocking wait for a reply.
///
/// # Contract
///
/// An implementation must return:
///
/// - `Ok(())` once `engine.has_pending_reply(call_id)` is true (the reply
///   landed in the inbox),
/// - `Err(CommError::Timeout { .. })` once `timeout` has elapsed without
///   a reply,
/// - `Err(CommError::TransportClosed)` when the awaited comm closes
///   mid-wait (`engine.is_open(comm_id)` turns false).
///
/// Implementations that pump the transport may dispatch messages into the
/// engine while waiting; the engine supports that re-entrancy, which is
/// what makes nested blocking calls from inside handlers work.
pub trait WaitReply {
    fn wait_reply(
        &self,
        engine: &CommEngine,
        comm_id: Option<&CommId>,
        call_id: &str,
        call_name: &str,
        timeout: Duration,
    ) -> Result<(), CommError>;
}
