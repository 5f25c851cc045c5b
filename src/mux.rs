//! Comm multiplexer: the open set of comms and outgoing message routing.
//!
//! A comm is a bidirectional channel identified by an opaque id. The
//! multiplexer owns every registered comm, tracks its lifecycle, and
//! directs outgoing messages: to one comm by id, or to all of them
//! (broadcast) when no id is given. Closed comms leave the set entirely,
//! so membership doubles as the open check.
//!
//! The transport below is expected to deliver `(dictionary, buffer-list)`
//! pairs in order per comm and to call back into the engine with
//! `on_incoming` / `on_comm_closed`. Framing, encoding, and
//! authentication all belong to the transport.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CommError;
use crate::message::Message;

/// Opaque identifier of one comm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommId(String);

impl CommId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CommId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One side of a duplex channel provided by the transport.
///
/// `send` must queue the message for delivery and return; it must not
/// re-enter the engine synchronously. Incoming traffic reaches the engine
/// through `CommEngine::on_incoming`, driven by the host loop.
pub trait Comm {
    fn comm_id(&self) -> &CommId;

    /// Hand the dictionary part and the buffer list to the transport.
    fn send(&self, message: &Message, buffers: &[Vec<u8>]) -> anyhow::Result<()>;

    /// Release the underlying channel. Called once when the comm leaves
    /// the open set.
    fn close(&self) {}
}

/// Lifecycle state of a registered comm. Closed comms are removed from
/// the set rather than tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    /// Registered, no traffic seen yet.
    Opening,
    /// At least one message has arrived.
    Open,
}

struct CommEntry {
    comm: Box<dyn Comm>,
    state: CommState,
}

/// The open set of comms.
#[derive(Default)]
pub struct CommMux {
    comms: HashMap<CommId, CommEntry>,
}

impl CommMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a comm in the `Opening` state.
    pub fn register(&mut self, comm: Box<dyn Comm>) {
        let comm_id = comm.comm_id().clone();
        debug!(%comm_id, "comm registered");
        self.comms.insert(
            comm_id,
            CommEntry {
                comm,
                state: CommState::Opening,
            },
        );
    }

    /// Promote a comm to `Open` on first incoming traffic.
    pub fn mark_open(&mut self, comm_id: &CommId) {
        if let Some(entry) = self.comms.get_mut(comm_id) {
            entry.state = CommState::Open;
        }
    }

    /// Lifecycle state, `None` for unknown (closed) comms.
    pub fn state(&self, comm_id: &CommId) -> Option<CommState> {
        self.comms.get(comm_id).map(|entry| entry.state)
    }

    /// Close one comm, or all of them when `comm_id` is `None`.
    /// Closing an unknown id is a no-op.
    pub fn close(&mut self, comm_id: Option<&CommId>) {
        for id in self.comm_ids(comm_id) {
            if let Some(entry) = self.comms.remove(&id) {
                debug!(comm_id = %id, "comm closed");
                entry.comm.close();
            }
        }
    }

    /// Whether a specific comm is open, or whether any comm is.
    pub fn is_open(&self, comm_id: Option<&CommId>) -> bool {
        match comm_id {
            Some(id) => self.comms.contains_key(id),
            None => !self.comms.is_empty(),
        }
    }

    /// The ids a send would address: the given one, or every open comm.
    pub fn comm_ids(&self, comm_id: Option<&CommId>) -> Vec<CommId> {
        match comm_id {
            Some(id) => vec![id.clone()],
            None => self.comms.keys().cloned().collect(),
        }
    }

    /// Send a message to one comm, or broadcast it to all open comms.
    ///
    /// # Errors
    ///
    /// `CommError::TransportClosed` when the target is not open (for
    /// broadcast: when no comm is open). `CommError::Protocol` when the
    /// transport rejects the send.
    pub fn send(
        &self,
        message: &Message,
        comm_id: Option<&CommId>,
        buffers: &[Vec<u8>],
    ) -> Result<(), CommError> {
        if !self.is_open(comm_id) {
            return Err(CommError::TransportClosed);
        }
        for id in self.comm_ids(comm_id) {
            let entry = self.comms.get(&id).ok_or(CommError::TransportClosed)?;
            entry
                .comm
                .send(message, buffers)
                .map_err(|e| CommError::Protocol(format!("send on comm {id} failed: {e}")))?;
        }
        Ok(())
    }
}
