//! Error types for the remote-call bus.
//!
//! Two families live here:
//!
//! - [`CommError`] - errors surfaced locally by the bus itself (closed
//!   comms, timeouts, protocol violations, unknown call names).
//! - [`ErrorWrapper`] - a serializable snapshot of an error raised on the
//!   *other* side while servicing a remote call. It crosses the wire as
//!   JSON and is re-raised on the caller side as [`CommError::Remote`].
//!
//! # Remote error formatting
//!
//! There is no process-wide exception hook to patch in Rust, so the
//! equivalent behavior is provided through `Display`: formatting a
//! [`CommError::Remote`] (or the wrapper itself) yields the full
//! multi-line report - call name, traceback frames, then the error kind
//! and message - so any top-level reporter the host installs prints
//! remote errors as if they had been raised locally.

use std::fmt;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the remote-call bus.
#[derive(Debug, Error)]
pub enum CommError {
    /// The target comm is closed or was never registered.
    #[error("the comm is not connected")]
    TransportClosed,

    /// An incoming request referenced an unregistered call name.
    #[error("no such call handler: {0}")]
    UnknownCall(String),

    /// A blocking wait exceeded its bound.
    #[error("remote call '{call_name}' timed out after {secs}s")]
    Timeout {
        /// Name of the call that was awaiting a reply.
        call_name: String,
        /// The timeout bound that expired, in seconds.
        secs: f64,
    },

    /// Malformed incoming message (missing fields, unknown msg_type,
    /// buffer count mismatch).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An error raised on the peer side, re-raised locally. Carries the
    /// full [`ErrorWrapper`]; `Display` prints the formatted report.
    #[error("{0}")]
    Remote(Box<ErrorWrapper>),

    /// An operation the bus rejects by design (blocking broadcast,
    /// blocking call without an installed wait primitive).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// A typed error a call handler raises to name a remote error kind.
///
/// The `etype` tag travels verbatim in the [`ErrorWrapper`], so the caller
/// side observes the same kind name the handler chose. Construction
/// records the raising file and line (`#[track_caller]`), which becomes
/// the innermost traceback frame of the wrapper.
///
/// # Example
///
/// ```ignore
/// engine.register_call_handler("divide", |args| {
///     let d = args.arg(1).unwrap();
///     if d.is_zero() {
///         return Err(HandlerError::new("ZeroDivisionError", "division by zero").into());
///     }
///     // ...
/// });
/// ```
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// The error kind name reported to the peer.
    pub etype: String,
    /// Constructor-style arguments, JSON-serializable.
    pub args: Vec<Value>,
    /// Optional user-visible name attribute.
    pub error_name: Option<String>,
    file: &'static str,
    line: u32,
}

impl HandlerError {
    /// Create a handler error with a kind name and a single message
    /// argument.
    #[track_caller]
    pub fn new(etype: impl Into<String>, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            etype: etype.into(),
            args: vec![Value::String(message.into())],
            error_name: None,
            file: location.file(),
            line: location.line(),
        }
    }

    /// Create a handler error with explicit constructor arguments.
    #[track_caller]
    pub fn with_args(etype: impl Into<String>, args: Vec<Value>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            etype: etype.into(),
            args,
            error_name: None,
            file: location.file(),
            line: location.line(),
        }
    }

    /// Attach a user-visible name attribute.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.error_name = Some(name.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.etype, format_error_args(&self.args))
    }
}

impl std::error::Error for HandlerError {}

/// One traceback frame, matching the wire schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub filename: String,
    pub lineno: u32,
    pub name: String,
    pub line: String,
}

/// Serializable snapshot of an error raised while servicing a remote call.
///
/// Captured on the serving side at the moment a handler fails, transported
/// as the reply's `call_return_value` with `is_error = true`, and
/// reconstructed on the caller side. An `etype` naming a kind unknown to
/// the receiver is carried through as an opaque tag - args and traceback
/// are preserved either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorWrapper {
    /// The call that was being serviced.
    pub call_name: String,
    /// The id of that call.
    pub call_id: String,
    /// The error kind name (e.g. "ZeroDivisionError", "CommError").
    pub etype: String,
    /// Constructor-style arguments of the error.
    pub args: Vec<Value>,
    /// Optional user-visible name attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    /// Traceback frames, outermost caller first.
    pub tb: Vec<FrameSummary>,
}

impl ErrorWrapper {
    /// Capture a handler failure.
    ///
    /// The kind name is taken from a [`HandlerError`] anywhere in the
    /// error chain, or `"CommError"` for bus errors (an unregistered call
    /// name reports this way), or `"RuntimeError"` for anything else.
    /// Rust has no structured traceback to extract, so frames are
    /// synthesized from the error chain, outermost context first; when a
    /// `HandlerError` is present its recorded raising site becomes the
    /// innermost frame's file and line.
    pub fn capture(call_name: &str, call_id: &str, error: &anyhow::Error) -> Self {
        let (etype, args, error_name) = classify(error);

        let mut tb: Vec<FrameSummary> = error
            .chain()
            .map(|cause| FrameSummary {
                filename: "<comms>".to_string(),
                lineno: 0,
                name: call_name.to_string(),
                line: cause.to_string(),
            })
            .collect();

        if let Some(raised) = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<HandlerError>())
        {
            if let Some(innermost) = tb.last_mut() {
                innermost.filename = raised.file.to_string();
                innermost.lineno = raised.line;
            }
        }

        Self {
            call_name: call_name.to_string(),
            call_id: call_id.to_string(),
            etype,
            args,
            error_name,
            tb,
        }
    }

    /// Re-raise on the caller side.
    ///
    /// The resulting [`CommError::Remote`] carries this wrapper as its
    /// sole payload, so upstream catchers can inspect the formatted trace.
    pub fn raise_error(self) -> CommError {
        CommError::Remote(Box::new(self))
    }

    /// Produce the human-readable multi-line report.
    pub fn format_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Exception in comms call {}:", self.call_name)];
        for frame in &self.tb {
            lines.push(format!(
                "  File \"{}\", line {}, in {}",
                frame.filename, frame.lineno, frame.name
            ));
            if !frame.line.is_empty() {
                lines.push(format!("    {}", frame.line));
            }
        }
        if self.args.is_empty() {
            lines.push(self.etype.clone());
        } else {
            lines.push(format!("{}: {}", self.etype, format_error_args(&self.args)));
        }
        lines
    }

    /// Write the formatted report to `out`, one line per entry.
    pub fn print(&self, out: &mut impl Write) -> io::Result<()> {
        for line in self.format_lines() {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_lines().join("\n"))
    }
}

/// Format error args the way a message line reads: bare strings
/// unquoted, everything else as JSON, comma-separated.
fn format_error_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn classify(error: &anyhow::Error) -> (String, Vec<Value>, Option<String>) {
    for cause in error.chain() {
        if let Some(raised) = cause.downcast_ref::<HandlerError>() {
            return (
                raised.etype.clone(),
                raised.args.clone(),
                raised.error_name.clone(),
            );
        }
        if let Some(comm) = cause.downcast_ref::<CommError>() {
            return (
                "CommError".to_string(),
                vec![Value::String(comm.to_string())],
                None,
            );
        }
    }
    (
        "RuntimeError".to_string(),
        vec![Value::String(error.to_string())],
        None,
    )
}
