//! Per-engine mapping from call name to handler.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::CommError;
use crate::message::{CallArgs, Payload};

/// A registered remote-call handler.
///
/// Handlers receive the reassembled arguments (byte slots refilled from
/// the buffer list) and return a payload or fail with any `anyhow` error;
/// failures are captured into an [`crate::ErrorWrapper`] by the engine
/// and never escape the dispatch loop. Handlers run to completion
/// synchronously and may issue further calls through the engine.
pub type CallHandler = Rc<dyn Fn(CallArgs) -> anyhow::Result<Payload>>;

/// The set of remote-callable functions on this side of the comms.
#[derive(Default)]
pub struct CallRegistry {
    handlers: HashMap<String, CallHandler>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under that name.
    pub fn register(
        &mut self,
        call_name: impl Into<String>,
        handler: impl Fn(CallArgs) -> anyhow::Result<Payload> + 'static,
    ) {
        self.handlers.insert(call_name.into(), Rc::new(handler));
    }

    /// Remove a handler. Removing an unknown name is a no-op.
    pub fn unregister(&mut self, call_name: &str) {
        self.handlers.remove(call_name);
    }

    /// Look up a handler by name.
    ///
    /// Returns a clone so the caller can drop its registry borrow before
    /// invoking; a handler may therefore re-enter the registry.
    ///
    /// # Errors
    ///
    /// `CommError::UnknownCall` when the name is not registered.
    pub fn handler(&self, call_name: &str) -> Result<CallHandler, CommError> {
        self.handlers
            .get(call_name)
            .cloned()
            .ok_or_else(|| CommError::UnknownCall(call_name.to_string()))
    }

    /// Invoke the handler registered under `call_name`.
    pub fn invoke(&self, call_name: &str, args: CallArgs) -> anyhow::Result<Payload> {
        let handler = self.handler(call_name)?;
        handler(args)
    }
}
