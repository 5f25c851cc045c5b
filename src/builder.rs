//! Fluent composition of remote calls.
//!
//! The source of this protocol expressed `remote.foo(...)` through
//! dynamic attribute access; here that is a builder with an explicit
//! [`CallBuilder::call`] step. Writes are rejected at the type level: the
//! builder exposes nothing to assign through, only named calls.
//!
//! ```ignore
//! // Fire-and-forget broadcast:
//! engine.remote_call().call("refresh_namespace").invoke()?;
//!
//! // Blocking call with a byte argument:
//! let value = engine
//!     .remote_call()
//!     .comm(comm_id)
//!     .blocking()
//!     .timeout(Duration::from_secs(1))
//!     .call("load_data")
//!     .arg(json!("array"))
//!     .kwarg_bytes("raw", bytes)
//!     .invoke()?;
//! ```

use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use crate::engine::{CommEngine, ReplyCallback};
use crate::error::CommError;
use crate::message::{CallArgs, Payload};
use crate::mux::CommId;

/// Per-call settings, collected before the call name is bound.
///
/// Obtained from [`CommEngine::remote_call`]. The target defaults to
/// broadcast (every open comm); [`comm`](Self::comm) narrows it to one.
pub struct CallBuilder {
    engine: CommEngine,
    comm_id: Option<CommId>,
    callback: Option<ReplyCallback>,
    blocking: bool,
    display_error: bool,
    timeout: Option<Duration>,
}

impl CallBuilder {
    pub(crate) fn new(engine: CommEngine) -> Self {
        Self {
            engine,
            comm_id: None,
            callback: None,
            blocking: false,
            display_error: false,
            timeout: None,
        }
    }

    /// Address one comm instead of broadcasting.
    pub fn comm(mut self, comm_id: impl Into<CommId>) -> Self {
        self.comm_id = Some(comm_id.into());
        self
    }

    /// Deliver the reply value to `callback`. Implies a reply is
    /// requested; the callback fires exactly once, on success only.
    /// Requires a targeted comm, like [`blocking`](Self::blocking).
    pub fn callback(mut self, callback: impl Fn(Payload) + 'static) -> Self {
        self.callback = Some(Rc::new(callback));
        self
    }

    /// Wait for the reply and return its value from
    /// [`BoundCall::invoke`]. Requires a targeted comm; blocking
    /// broadcasts are rejected.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Ask the serving side to print a handler failure locally, in
    /// addition to any reply.
    pub fn display_error(mut self) -> Self {
        self.display_error = true;
        self
    }

    /// Upper bound for the blocking wait. The engine default applies
    /// when absent.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bind the remote function name, yielding a [`BoundCall`] to attach
    /// arguments to.
    pub fn call(self, name: impl Into<String>) -> BoundCall {
        BoundCall {
            builder: self,
            name: name.into(),
            args: CallArgs::new(),
        }
    }
}

/// A composed call, ready to receive arguments and go out.
pub struct BoundCall {
    builder: CallBuilder,
    name: String,
    args: CallArgs,
}

impl BoundCall {
    /// Append a positional JSON argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push_arg(value.into());
        self
    }

    /// Append a positional byte argument; it rides out-of-band in the
    /// buffer list.
    pub fn arg_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.args.push_arg(bytes.into());
        self
    }

    /// Set a named JSON argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert_kwarg(name, value.into());
        self
    }

    /// Set a named byte argument; it rides out-of-band in the buffer
    /// list.
    pub fn kwarg_bytes(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.args.insert_kwarg(name, bytes.into());
        self
    }

    /// Transmit the call.
    ///
    /// Blocking calls return `Ok(Some(value))` with the reply;
    /// non-blocking calls return `Ok(None)` immediately.
    ///
    /// # Errors
    ///
    /// - [`CommError::Unsupported`] for a blocking broadcast.
    /// - [`CommError::TransportClosed`] for a blocking call on a closed
    ///   comm (non-blocking calls are logged and dropped instead).
    /// - [`CommError::Timeout`] when the blocking wait expires.
    /// - [`CommError::Remote`] when the handler on the peer side failed.
    pub fn invoke(self) -> Result<Option<Payload>, CommError> {
        let BoundCall {
            builder,
            name,
            args,
        } = self;
        builder.engine.send_call(
            builder.comm_id,
            builder.callback,
            builder.blocking,
            builder.display_error,
            builder.timeout,
            name,
            args,
        )
    }
}
