//! The remote-call engine: encoding, dispatch, and reply matching.
//!
//! `CommEngine` owns the comm set, the call registry, the wait list of
//! outstanding calls, and the reply inbox. It is logically
//! single-threaded: the host delivers incoming messages on one
//! cooperative loop via [`CommEngine::on_incoming`], handlers run to
//! completion inside that dispatch, and the only suspension point is the
//! pluggable [`WaitReply`] hook during a blocking outgoing call.
//!
//! The engine is `Clone` (shared state behind an `Rc`), and no internal
//! borrow is held across a handler, callback, or hook invocation, so
//! handlers may re-enter the engine - including issuing nested blocking
//! calls when the host's wait primitive pumps messages.
//!
//! # Ordering
//!
//! Messages are processed in transport arrival order per comm; across
//! comms there is no ordering guarantee. Callers needing ordered
//! completion across several non-blocking calls sequence via callbacks or
//! make the dependent call blocking.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::builder::CallBuilder;
use crate::error::{CommError, ErrorWrapper};
use crate::message::{
    pack_return_value, unpack_return_value, CallArgs, CallContent, CallSettings, Message, Payload,
    ReplyContent,
};
use crate::mux::{Comm, CommId, CommMux};
use crate::registry::CallRegistry;
use crate::wait::WaitReply;

/// Default upper bound for blocking waits when no per-call timeout is
/// given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Callback attached to a non-blocking call, invoked with the reply
/// value.
pub type ReplyCallback = Rc<dyn Fn(Payload)>;

/// Observer of outgoing or incoming calls, for host-side bookkeeping.
pub type CallObserver = Rc<dyn Fn(&CallContent)>;

type AsyncErrorReporter = Rc<dyn Fn(&ErrorWrapper)>;

/// A wait-list entry for an issued call expecting a reply.
struct PendingCall {
    blocking: bool,
    callback: Option<ReplyCallback>,
}

/// A completed blocking call parked until the waiter picks it up.
type InboxRecord = Result<Payload, Box<ErrorWrapper>>;

struct EngineState {
    mux: RefCell<CommMux>,
    registry: RefCell<CallRegistry>,
    waitlist: RefCell<HashMap<String, PendingCall>>,
    inbox: RefCell<HashMap<String, InboxRecord>>,
    calling_comm_id: RefCell<Option<CommId>>,
    wait_reply: RefCell<Option<Rc<dyn WaitReply>>>,
    async_error: RefCell<AsyncErrorReporter>,
    on_outgoing_call: RefCell<Option<CallObserver>>,
    on_incoming_call: RefCell<Option<CallObserver>>,
    default_timeout: Cell<Duration>,
}

/// The kernel-to-frontend remote-call engine.
///
/// Both sides of the comms run one of these; requests and replies flow
/// symmetrically in either direction.
#[derive(Clone)]
pub struct CommEngine {
    state: Rc<EngineState>,
}

impl Default for CommEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CommEngine {
    pub fn new() -> Self {
        Self {
            state: Rc::new(EngineState {
                mux: RefCell::new(CommMux::new()),
                registry: RefCell::new(CallRegistry::new()),
                waitlist: RefCell::new(HashMap::new()),
                inbox: RefCell::new(HashMap::new()),
                calling_comm_id: RefCell::new(None),
                wait_reply: RefCell::new(None),
                async_error: RefCell::new(Rc::new(default_async_error_reporter)),
                on_outgoing_call: RefCell::new(None),
                on_incoming_call: RefCell::new(None),
                default_timeout: Cell::new(DEFAULT_TIMEOUT),
            }),
        }
    }

    // ---- Comm management -------------------------------------------------

    /// Register a comm with the multiplexer. The comm starts in the
    /// `Opening` state and is promoted on first incoming traffic.
    pub fn register_comm(&self, comm: Box<dyn Comm>) {
        self.state.mux.borrow_mut().register(comm);
    }

    /// Close one comm, or all of them when `comm_id` is `None`.
    pub fn close(&self, comm_id: Option<&CommId>) {
        self.state.mux.borrow_mut().close(comm_id);
    }

    /// Whether a specific comm is open, or whether any comm is.
    pub fn is_open(&self, comm_id: Option<&CommId>) -> bool {
        self.state.mux.borrow().is_open(comm_id)
    }

    /// The comm the message currently being dispatched arrived on.
    pub fn calling_comm_id(&self) -> Option<CommId> {
        self.state.calling_comm_id.borrow().clone()
    }

    // ---- Handler registration --------------------------------------------

    /// Register a remote-call handler, replacing any previous one under
    /// that name.
    pub fn register_call_handler(
        &self,
        call_name: impl Into<String>,
        handler: impl Fn(CallArgs) -> anyhow::Result<Payload> + 'static,
    ) {
        self.state.registry.borrow_mut().register(call_name, handler);
    }

    /// Remove a remote-call handler. Idempotent.
    pub fn unregister_call_handler(&self, call_name: &str) {
        self.state.registry.borrow_mut().unregister(call_name);
    }

    // ---- Configuration ---------------------------------------------------

    /// Install the host's blocking-wait primitive. Without one, blocking
    /// calls fail with [`CommError::Unsupported`].
    pub fn set_wait_reply(&self, wait: impl WaitReply + 'static) {
        *self.state.wait_reply.borrow_mut() = Some(Rc::new(wait));
    }

    /// Default timeout for blocking calls without a per-call bound.
    pub fn set_default_timeout(&self, timeout: Duration) {
        self.state.default_timeout.set(timeout);
    }

    /// Replace the asynchronous error reporter. The default prints the
    /// formatted wrapper through `tracing::error!`.
    pub fn set_async_error_reporter(&self, reporter: impl Fn(&ErrorWrapper) + 'static) {
        *self.state.async_error.borrow_mut() = Rc::new(reporter);
    }

    /// Observe every call about to be sent.
    pub fn set_on_outgoing_call(&self, observer: impl Fn(&CallContent) + 'static) {
        *self.state.on_outgoing_call.borrow_mut() = Some(Rc::new(observer));
    }

    /// Observe every call received, before its handler runs.
    pub fn set_on_incoming_call(&self, observer: impl Fn(&CallContent) + 'static) {
        *self.state.on_incoming_call.borrow_mut() = Some(Rc::new(observer));
    }

    // ---- Outgoing calls --------------------------------------------------

    /// Compose a remote call. See [`CallBuilder`].
    pub fn remote_call(&self) -> CallBuilder {
        CallBuilder::new(self.clone())
    }

    /// Whether the reply for `call_id` has landed in the inbox. For
    /// [`WaitReply`] implementations.
    pub fn has_pending_reply(&self, call_id: &str) -> bool {
        self.state.inbox.borrow().contains_key(call_id)
    }

    /// The full outgoing-call flow: encode, register, send, and - for
    /// blocking calls - wait and resolve the reply.
    ///
    /// Returns `Ok(Some(value))` for blocking calls, `Ok(None)` otherwise.
    pub(crate) fn send_call(
        &self,
        comm_id: Option<CommId>,
        callback: Option<ReplyCallback>,
        blocking: bool,
        display_error: bool,
        timeout: Option<Duration>,
        call_name: String,
        args: CallArgs,
    ) -> Result<Option<Payload>, CommError> {
        if comm_id.is_none() {
            // A broadcast has no unique pending-call identity: every comm
            // could answer, so nothing reply-bearing is allowed.
            if blocking {
                return Err(CommError::Unsupported(
                    "broadcast calls cannot block: there is no single reply to wait for",
                ));
            }
            if callback.is_some() {
                return Err(CommError::Unsupported(
                    "broadcast calls cannot take a callback: every comm could reply",
                ));
            }
        }

        let wait_hook = if blocking {
            Some(self.state.wait_reply.borrow().clone().ok_or(
                CommError::Unsupported("blocking call without an installed wait primitive"),
            )?)
        } else {
            None
        };

        let send_reply = blocking || callback.is_some();
        let settings = CallSettings {
            blocking,
            send_reply,
            display_error,
            timeout: timeout.map(|t| t.as_secs_f64()),
            broadcast: comm_id.is_none(),
        };

        let call_id = Uuid::new_v4().simple().to_string();
        let (content, buffers) = CallContent::build(call_name, call_id, settings, args);
        let call_id = content.call_id.clone();
        let call_name = content.call_name.clone();

        if !self.is_open(comm_id.as_ref()) {
            // Only an error if the call is blocking.
            if blocking {
                return Err(CommError::TransportClosed);
            }
            debug!(%call_name, "call to unconnected comm dropped");
            return Ok(None);
        }

        if let Some(observer) = self.state.on_outgoing_call.borrow().clone() {
            observer(&content);
        }

        if send_reply {
            self.state
                .waitlist
                .borrow_mut()
                .insert(call_id.clone(), PendingCall { blocking, callback });
        }

        let sent = self
            .state
            .mux
            .borrow()
            .send(&Message::RemoteCall(content), comm_id.as_ref(), &buffers);
        if let Err(e) = sent {
            self.state.waitlist.borrow_mut().remove(&call_id);
            if blocking {
                return Err(e);
            }
            warn!(%call_name, error = %e, "failed to send non-blocking call");
            return Ok(None);
        }

        let Some(wait_hook) = wait_hook else {
            return Ok(None);
        };

        let timeout = timeout.unwrap_or_else(|| self.state.default_timeout.get());
        if let Err(e) =
            wait_hook.wait_reply(self, comm_id.as_ref(), &call_id, &call_name, timeout)
        {
            self.state.waitlist.borrow_mut().remove(&call_id);
            self.state.inbox.borrow_mut().remove(&call_id);
            return Err(e);
        }

        let record = self
            .state
            .inbox
            .borrow_mut()
            .remove(&call_id)
            .ok_or_else(|| {
                CommError::Protocol(format!(
                    "wait primitive returned without a reply for call '{call_name}'"
                ))
            })?;

        match record {
            Ok(value) => Ok(Some(value)),
            Err(wrapper) => Err(wrapper.raise_error()),
        }
    }

    // ---- Incoming dispatch -----------------------------------------------

    /// Entry point for the transport: one `(dictionary, buffer-list)`
    /// pair arrived on `comm_id`.
    ///
    /// Handler failures never propagate out of this method; they are
    /// captured and, when a reply is expected, returned to the peer.
    ///
    /// # Errors
    ///
    /// `CommError::Protocol` for malformed messages (unknown msg_type,
    /// missing fields, buffer count mismatch).
    pub fn on_incoming(
        &self,
        comm_id: &CommId,
        data: Value,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), CommError> {
        let message: Message = serde_json::from_value(data).map_err(|e| {
            warn!(%comm_id, error = %e, "malformed message dropped");
            CommError::Protocol(format!("malformed message: {e}"))
        })?;

        *self.state.calling_comm_id.borrow_mut() = Some(comm_id.clone());
        self.state.mux.borrow_mut().mark_open(comm_id);

        match message {
            Message::RemoteCall(content) => self.handle_remote_call(content, buffers),
            Message::RemoteCallReply(content) => self.handle_remote_call_reply(content, buffers),
        }
    }

    /// Entry point for the transport: `comm_id` closed on the peer side.
    pub fn on_comm_closed(&self, comm_id: &CommId) {
        debug!(%comm_id, "comm closed by peer");
        self.state.mux.borrow_mut().close(Some(comm_id));
    }

    fn handle_remote_call(
        &self,
        content: CallContent,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), CommError> {
        if let Some(observer) = self.state.on_incoming_call.borrow().clone() {
            observer(&content);
        }

        let args = match content.restore_args(buffers) {
            Ok(args) => args,
            Err(e) => {
                warn!(call_name = %content.call_name, error = %e, "dropping malformed call");
                return Err(e);
            }
        };

        // Clone the handler out so the registry borrow is released before
        // user code runs.
        let handler = self.state.registry.borrow().handler(&content.call_name);
        let result = match handler {
            Ok(handler) => handler(args),
            Err(e) => Err(e.into()),
        };

        self.send_call_return_value(&content, result);
        Ok(())
    }

    /// Reply to a processed call when its settings ask for it.
    fn send_call_return_value(&self, call: &CallContent, result: anyhow::Result<Payload>) {
        let (is_error, call_return_value, buffers) = match result {
            Ok(value) => {
                let (value, buffers) = pack_return_value(value);
                (false, value, buffers)
            }
            Err(error) => {
                let wrapper = ErrorWrapper::capture(&call.call_name, &call.call_id, &error);
                if call.settings.display_error {
                    let _ = wrapper.print(&mut io::stderr());
                }
                let value = serde_json::to_value(&wrapper).unwrap_or(Value::Null);
                (true, value, Vec::new())
            }
        };

        if !call.settings.send_reply {
            return;
        }

        let reply = Message::RemoteCallReply(ReplyContent {
            is_error,
            call_id: call.call_id.clone(),
            call_name: call.call_name.clone(),
            call_return_value,
        });

        let target = self.calling_comm_id();
        if let Err(e) = self.state.mux.borrow().send(&reply, target.as_ref(), &buffers) {
            warn!(call_name = %call.call_name, error = %e, "failed to send reply");
        }
    }

    fn handle_remote_call_reply(
        &self,
        content: ReplyContent,
        buffers: Vec<Vec<u8>>,
    ) -> Result<(), CommError> {
        let ReplyContent {
            is_error,
            call_id,
            call_name,
            call_return_value,
        } = content;

        let outcome: InboxRecord = if is_error {
            let wrapper: ErrorWrapper =
                serde_json::from_value(call_return_value).map_err(|e| {
                    CommError::Protocol(format!(
                        "reply for '{call_name}' carried an undecodable error: {e}"
                    ))
                })?;
            Err(Box::new(wrapper))
        } else {
            Ok(unpack_return_value(call_return_value, buffers)?)
        };

        let pending = self.state.waitlist.borrow_mut().remove(&call_id);
        let Some(pending) = pending else {
            // Unexpected reply: its wait-list entry is gone (never made,
            // or timed out).
            match outcome {
                Err(wrapper) => self.report_async_error(&wrapper),
                Ok(_) => debug!(%call_name, %call_id, "unexpected reply dropped"),
            }
            return Ok(());
        };

        match outcome {
            Err(wrapper) if !pending.blocking => {
                self.report_async_error(&wrapper);
            }
            outcome => {
                if let (Some(callback), Ok(value)) = (&pending.callback, &outcome) {
                    callback(value.clone());
                }
                if pending.blocking {
                    self.state.inbox.borrow_mut().insert(call_id, outcome);
                }
            }
        }
        Ok(())
    }

    fn report_async_error(&self, wrapper: &ErrorWrapper) {
        let reporter = self.state.async_error.borrow().clone();
        reporter(wrapper);
    }
}

fn default_async_error_reporter(wrapper: &ErrorWrapper) {
    error!("{wrapper}");
}
