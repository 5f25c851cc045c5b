//! In-memory loopback harness for integration tests.
//!
//! Two (or more) engines are joined by paired loopback comms over a
//! shared delivery queue. Sends never re-enter an engine synchronously;
//! they enqueue, and [`Net::pump_one`] drives delivery - which is exactly
//! the transport contract the engine documents. The blocking-wait
//! primitive is [`PumpWait`]: it pumps the queue until the matching reply
//! lands, the deadline passes, or the awaited comm closes. Pumping from
//! inside a wait is what makes the nested-blocking scenarios work.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use kernelcomm::{Comm, CommEngine, CommError, CommId, Message, WaitReply};

/// Which endpoint of a linked comm pair.
pub type Side = u8;

enum Delivery {
    Message {
        comm_id: CommId,
        to: Side,
        data: serde_json::Value,
        buffers: Vec<Vec<u8>>,
    },
    Close {
        comm_id: CommId,
        to: Side,
    },
}

/// One send observed on the wire, for assertions.
pub struct LoggedSend {
    pub comm_id: CommId,
    pub message: Message,
    pub buffer_count: usize,
}

struct NetInner {
    queue: RefCell<VecDeque<Delivery>>,
    /// Replies parked while `hold_replies` is set, to simulate a slow
    /// peer.
    held: RefCell<VecDeque<Delivery>>,
    hold_replies: Cell<bool>,
    endpoints: RefCell<HashMap<(CommId, Side), CommEngine>>,
    log: RefCell<Vec<LoggedSend>>,
}

/// The shared loopback network.
#[derive(Clone)]
pub struct Net {
    inner: Rc<NetInner>,
}

impl Net {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(NetInner {
                queue: RefCell::new(VecDeque::new()),
                held: RefCell::new(VecDeque::new()),
                hold_replies: Cell::new(false),
                endpoints: RefCell::new(HashMap::new()),
                log: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Join two engines with a comm pair sharing `comm_id`. Also installs
    /// the pumping wait primitive on both engines (idempotent).
    pub fn link(&self, comm_id: &str, a: &CommEngine, b: &CommEngine) -> CommId {
        let comm_id = CommId::from(comm_id);
        a.register_comm(Box::new(LoopComm {
            comm_id: comm_id.clone(),
            side: 0,
            net: Rc::clone(&self.inner),
        }));
        b.register_comm(Box::new(LoopComm {
            comm_id: comm_id.clone(),
            side: 1,
            net: Rc::clone(&self.inner),
        }));
        let mut endpoints = self.inner.endpoints.borrow_mut();
        endpoints.insert((comm_id.clone(), 0), a.clone());
        endpoints.insert((comm_id.clone(), 1), b.clone());
        drop(endpoints);
        a.set_wait_reply(PumpWait { net: self.clone() });
        b.set_wait_reply(PumpWait { net: self.clone() });
        comm_id
    }

    /// Park reply messages instead of delivering them.
    pub fn hold_replies(&self, hold: bool) {
        self.inner.hold_replies.set(hold);
    }

    /// Move every parked reply back onto the delivery queue.
    pub fn release_held(&self) {
        let mut queue = self.inner.queue.borrow_mut();
        queue.extend(self.inner.held.borrow_mut().drain(..));
    }

    /// Schedule a close notification for the endpoint on `side` of
    /// `comm_id`, delivered in queue order like any message.
    pub fn schedule_close(&self, comm_id: &CommId, side: Side) {
        self.inner.queue.borrow_mut().push_back(Delivery::Close {
            comm_id: comm_id.clone(),
            to: side,
        });
    }

    /// Deliver the next queued item. Returns false when the queue is
    /// empty.
    pub fn pump_one(&self) -> bool {
        let delivery = self.inner.queue.borrow_mut().pop_front();
        let Some(delivery) = delivery else {
            return false;
        };
        match delivery {
            Delivery::Message {
                comm_id,
                to,
                data,
                buffers,
            } => {
                let engine = self
                    .inner
                    .endpoints
                    .borrow()
                    .get(&(comm_id.clone(), to))
                    .cloned();
                if let Some(engine) = engine {
                    // Protocol errors are logged by the engine; the
                    // transport just moves on.
                    let _ = engine.on_incoming(&comm_id, data, buffers);
                }
            }
            Delivery::Close { comm_id, to } => {
                let engine = self
                    .inner
                    .endpoints
                    .borrow()
                    .get(&(comm_id.clone(), to))
                    .cloned();
                if let Some(engine) = engine {
                    engine.on_comm_closed(&comm_id);
                }
            }
        }
        true
    }

    /// Deliver everything, including items enqueued while pumping.
    pub fn pump_all(&self) {
        while self.pump_one() {}
    }

    /// Every `remote_call` observed on the wire.
    pub fn sent_calls(&self) -> Vec<LoggedSend> {
        self.filter_log(|message| matches!(message, Message::RemoteCall(_)))
    }

    /// Every `remote_call_reply` observed on the wire.
    pub fn sent_replies(&self) -> Vec<LoggedSend> {
        self.filter_log(|message| matches!(message, Message::RemoteCallReply(_)))
    }

    fn filter_log(&self, keep: impl Fn(&Message) -> bool) -> Vec<LoggedSend> {
        self.inner
            .log
            .borrow()
            .iter()
            .filter(|entry| keep(&entry.message))
            .map(|entry| LoggedSend {
                comm_id: entry.comm_id.clone(),
                message: entry.message.clone(),
                buffer_count: entry.buffer_count,
            })
            .collect()
    }
}

struct LoopComm {
    comm_id: CommId,
    side: Side,
    net: Rc<NetInner>,
}

impl Comm for LoopComm {
    fn comm_id(&self) -> &CommId {
        &self.comm_id
    }

    fn send(&self, message: &Message, buffers: &[Vec<u8>]) -> anyhow::Result<()> {
        self.net.log.borrow_mut().push(LoggedSend {
            comm_id: self.comm_id.clone(),
            message: message.clone(),
            buffer_count: buffers.len(),
        });
        let delivery = Delivery::Message {
            comm_id: self.comm_id.clone(),
            to: 1 - self.side,
            data: serde_json::to_value(message)?,
            buffers: buffers.to_vec(),
        };
        let is_reply = matches!(message, Message::RemoteCallReply(_));
        if is_reply && self.net.hold_replies.get() {
            self.net.held.borrow_mut().push_back(delivery);
        } else {
            self.net.queue.borrow_mut().push_back(delivery);
        }
        Ok(())
    }
}

/// Wait primitive that drains the loopback queue until the reply lands.
pub struct PumpWait {
    net: Net,
}

impl WaitReply for PumpWait {
    fn wait_reply(
        &self,
        engine: &CommEngine,
        comm_id: Option<&CommId>,
        call_id: &str,
        call_name: &str,
        timeout: Duration,
    ) -> Result<(), CommError> {
        let deadline = Instant::now() + timeout;
        loop {
            if engine.has_pending_reply(call_id) {
                return Ok(());
            }
            if !engine.is_open(comm_id) {
                return Err(CommError::TransportClosed);
            }
            if Instant::now() >= deadline {
                return Err(CommError::Timeout {
                    call_name: call_name.to_string(),
                    secs: timeout.as_secs_f64(),
                });
            }
            self.net.pump_one();
        }
    }
}
