//! Wire schema for the remote-call bus.
//!
//! Every comm transports two payloads per message: a JSON-serializable
//! dictionary and an ordered list of opaque byte buffers. The dictionary
//! always has the shape:
//!
//! ```text
//! { "msg_type": "remote_call" | "remote_call_reply", "content": { ... } }
//! ```
//!
//! Byte-valued arguments never ride inside the JSON (that would mean
//! base64 inflation); they are stripped into the buffer list and their
//! slot is nulled, with `buffered_args` / `buffered_kwargs` recording
//! which slots to refill on the receiving side. A byte-valued *return*
//! travels as the reply's single buffer.
//!
//! # Buffer ordering
//!
//! Buffers appear in the order implied by `buffered_args` (ascending
//! positional index) followed by `buffered_kwargs` (the order the names
//! are listed). Restoring consumes the buffer list front to back and
//! requires it to be exactly exhausted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CommError;

/// A call argument or return value: either in-band JSON or out-of-band
/// bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Payload {
    /// JSON null, the return value of handlers with nothing to say.
    pub fn null() -> Self {
        Payload::Json(Value::Null)
    }

    pub fn is_bytes(&self) -> bool {
        matches!(self, Payload::Bytes(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Bytes(bytes) => Some(bytes),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

/// Positional and named arguments of one call, byte arguments included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Payload>,
    pub kwargs: BTreeMap<String, Payload>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_arg(&mut self, arg: impl Into<Payload>) {
        self.args.push(arg.into());
    }

    pub fn insert_kwarg(&mut self, name: impl Into<String>, arg: impl Into<Payload>) {
        self.kwargs.insert(name.into(), arg.into());
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Payload> {
        self.args.get(index)
    }

    /// Named argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Payload> {
        self.kwargs.get(name)
    }
}

/// Per-call option bag, as it appears on the wire. Absent keys take the
/// documented defaults, so a bare `{}` parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSettings {
    #[serde(default)]
    pub blocking: bool,
    /// Derived: true when blocking or a callback is attached. A call with
    /// `send_reply = false` must never be answered.
    #[serde(default)]
    pub send_reply: bool,
    #[serde(default)]
    pub display_error: bool,
    /// Upper bound for the blocking wait, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default = "default_broadcast")]
    pub broadcast: bool,
}

fn default_broadcast() -> bool {
    true
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            blocking: false,
            send_reply: false,
            display_error: false,
            timeout: None,
            broadcast: true,
        }
    }
}

/// Content of a `remote_call` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContent {
    pub call_name: String,
    pub call_id: String,
    pub settings: CallSettings,
    pub call_args: Vec<Value>,
    pub call_kwargs: Map<String, Value>,
    pub buffered_args: Vec<usize>,
    pub buffered_kwargs: Vec<String>,
}

impl CallContent {
    /// Encode a call: strip byte arguments into the buffer list and
    /// record which slots they came from.
    pub fn build(
        call_name: impl Into<String>,
        call_id: impl Into<String>,
        settings: CallSettings,
        args: CallArgs,
    ) -> (Self, Vec<Vec<u8>>) {
        let mut buffers = Vec::new();
        let mut buffered_args = Vec::new();
        let mut buffered_kwargs = Vec::new();

        let call_args = args
            .args
            .into_iter()
            .enumerate()
            .map(|(index, arg)| match arg {
                Payload::Json(value) => value,
                Payload::Bytes(bytes) => {
                    buffers.push(bytes);
                    buffered_args.push(index);
                    Value::Null
                }
            })
            .collect();

        let mut call_kwargs = Map::new();
        for (name, arg) in args.kwargs {
            match arg {
                Payload::Json(value) => {
                    call_kwargs.insert(name, value);
                }
                Payload::Bytes(bytes) => {
                    buffers.push(bytes);
                    buffered_kwargs.push(name.clone());
                    call_kwargs.insert(name, Value::Null);
                }
            }
        }

        let content = Self {
            call_name: call_name.into(),
            call_id: call_id.into(),
            settings,
            call_args,
            call_kwargs,
            buffered_args,
            buffered_kwargs,
        };
        (content, buffers)
    }

    /// Decode a received call: refill the byte slots from the buffer
    /// list.
    ///
    /// # Errors
    ///
    /// `CommError::Protocol` when a recorded index or name does not match
    /// a slot, or when the buffer list is not exactly exhausted.
    pub fn restore_args(&self, buffers: Vec<Vec<u8>>) -> Result<CallArgs, CommError> {
        let mut remaining = buffers.into_iter();

        let mut args: Vec<Payload> = self
            .call_args
            .iter()
            .cloned()
            .map(Payload::Json)
            .collect();
        let mut kwargs: BTreeMap<String, Payload> = self
            .call_kwargs
            .iter()
            .map(|(name, value)| (name.clone(), Payload::Json(value.clone())))
            .collect();

        for &index in &self.buffered_args {
            let buffer = remaining.next().ok_or_else(|| {
                CommError::Protocol(format!(
                    "call '{}': missing buffer for arg {index}",
                    self.call_name
                ))
            })?;
            let slot = args.get_mut(index).ok_or_else(|| {
                CommError::Protocol(format!(
                    "call '{}': buffered arg index {index} out of range",
                    self.call_name
                ))
            })?;
            *slot = Payload::Bytes(buffer);
        }

        for name in &self.buffered_kwargs {
            let buffer = remaining.next().ok_or_else(|| {
                CommError::Protocol(format!(
                    "call '{}': missing buffer for kwarg '{name}'",
                    self.call_name
                ))
            })?;
            let slot = kwargs.get_mut(name).ok_or_else(|| {
                CommError::Protocol(format!(
                    "call '{}': buffered kwarg '{name}' not in call_kwargs",
                    self.call_name
                ))
            })?;
            *slot = Payload::Bytes(buffer);
        }

        let leftover = remaining.count();
        if leftover != 0 {
            return Err(CommError::Protocol(format!(
                "call '{}': {leftover} unclaimed buffer(s)",
                self.call_name
            )));
        }

        Ok(CallArgs { args, kwargs })
    }
}

/// Content of a `remote_call_reply` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyContent {
    pub is_error: bool,
    pub call_id: String,
    pub call_name: String,
    pub call_return_value: Value,
}

/// A message as it crosses a comm, dictionary part only. The buffer list
/// travels alongside, never inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "content")]
pub enum Message {
    #[serde(rename = "remote_call")]
    RemoteCall(CallContent),
    #[serde(rename = "remote_call_reply")]
    RemoteCallReply(ReplyContent),
}

/// Encode a reply's return value: bytes become the single buffer, the
/// in-content value is nulled.
pub fn pack_return_value(value: Payload) -> (Value, Vec<Vec<u8>>) {
    match value {
        Payload::Json(value) => (value, Vec::new()),
        Payload::Bytes(bytes) => (Value::Null, vec![bytes]),
    }
}

/// Decode a reply's return value, substituting the single buffer when one
/// is present.
///
/// # Errors
///
/// `CommError::Protocol` when the reply carries more than one buffer.
pub fn unpack_return_value(
    value: Value,
    mut buffers: Vec<Vec<u8>>,
) -> Result<Payload, CommError> {
    match buffers.len() {
        0 => Ok(Payload::Json(value)),
        1 => Ok(Payload::Bytes(buffers.remove(0))),
        n => Err(CommError::Protocol(format!(
            "reply carried {n} buffers, at most one allowed"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mixed_args() -> CallArgs {
        let mut args = CallArgs::new();
        args.push_arg(json!("first"));
        args.push_arg(vec![0u8, 1, 2]);
        args.push_arg(json!(3));
        args.insert_kwarg("data", vec![0xffu8, 0xfe]);
        args.insert_kwarg("label", json!("x"));
        args
    }

    #[test]
    fn test_build_strips_bytes_into_buffers() {
        let (content, buffers) = CallContent::build(
            "process",
            "id1",
            CallSettings::default(),
            mixed_args(),
        );

        assert_eq!(content.call_args, vec![json!("first"), json!(null), json!(3)]);
        assert_eq!(content.buffered_args, vec![1]);
        assert_eq!(content.buffered_kwargs, vec!["data".to_string()]);
        assert_eq!(content.call_kwargs["data"], json!(null));
        assert_eq!(content.call_kwargs["label"], json!("x"));
        // Positional holes first, then kwarg holes.
        assert_eq!(buffers, vec![vec![0u8, 1, 2], vec![0xffu8, 0xfe]]);
    }

    #[test]
    fn test_restore_round_trips_mixed_args() {
        let original = mixed_args();
        let (content, buffers) = CallContent::build(
            "process",
            "id1",
            CallSettings::default(),
            original.clone(),
        );

        let restored = content.restore_args(buffers).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_restore_rejects_missing_buffer() {
        let (content, _buffers) =
            CallContent::build("process", "id1", CallSettings::default(), mixed_args());

        let err = content.restore_args(vec![]).unwrap_err();
        assert!(matches!(err, CommError::Protocol(_)));
    }

    #[test]
    fn test_restore_rejects_leftover_buffers() {
        let mut args = CallArgs::new();
        args.push_arg(json!("only"));
        let (content, _) = CallContent::build("noop", "id1", CallSettings::default(), args);

        let err = content.restore_args(vec![vec![1, 2, 3]]).unwrap_err();
        match err {
            CommError::Protocol(msg) => assert!(msg.contains("unclaimed")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_restore_rejects_out_of_range_index() {
        let (mut content, buffers) =
            CallContent::build("process", "id1", CallSettings::default(), mixed_args());
        content.buffered_args = vec![99];

        let err = content.restore_args(buffers).unwrap_err();
        match err {
            CommError::Protocol(msg) => assert!(msg.contains("out of range")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_message_wire_shape() {
        let mut args = CallArgs::new();
        args.push_arg(json!("hi"));
        let settings = CallSettings {
            blocking: true,
            send_reply: true,
            ..CallSettings::default()
        };
        let (content, _) = CallContent::build("echo", "abc", settings, args);
        let value = serde_json::to_value(Message::RemoteCall(content)).unwrap();

        assert_eq!(value["msg_type"], "remote_call");
        assert_eq!(value["content"]["call_name"], "echo");
        assert_eq!(value["content"]["call_id"], "abc");
        assert_eq!(value["content"]["settings"]["blocking"], true);
        assert_eq!(value["content"]["settings"]["send_reply"], true);
        assert_eq!(value["content"]["call_args"], json!(["hi"]));
        assert_eq!(value["content"]["buffered_args"], json!([]));
        // Absent timeout is omitted entirely.
        assert!(value["content"]["settings"].get("timeout").is_none());
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = Message::RemoteCallReply(ReplyContent {
            is_error: false,
            call_id: "abc".to_string(),
            call_name: "echo".to_string(),
            call_return_value: json!("hi"),
        });
        let value = serde_json::to_value(reply).unwrap();

        assert_eq!(value["msg_type"], "remote_call_reply");
        assert_eq!(value["content"]["is_error"], false);
        assert_eq!(value["content"]["call_return_value"], "hi");
    }

    #[test]
    fn test_settings_defaults_from_empty_object() {
        let settings: CallSettings = serde_json::from_value(json!({})).unwrap();
        assert!(!settings.blocking);
        assert!(!settings.send_reply);
        assert!(!settings.display_error);
        assert_eq!(settings.timeout, None);
        assert!(settings.broadcast);
    }

    #[test]
    fn test_unknown_msg_type_fails_to_parse() {
        let value = json!({ "msg_type": "remote_poke", "content": {} });
        assert!(serde_json::from_value::<Message>(value).is_err());
    }

    #[test]
    fn test_return_value_packing() {
        let (value, buffers) = pack_return_value(Payload::Bytes(vec![9, 9]));
        assert_eq!(value, json!(null));
        assert_eq!(buffers, vec![vec![9u8, 9]]);

        let (value, buffers) = pack_return_value(Payload::Json(json!(42)));
        assert_eq!(value, json!(42));
        assert!(buffers.is_empty());
    }

    #[test]
    fn test_return_value_unpacking() {
        let payload = unpack_return_value(json!(null), vec![vec![7]]).unwrap();
        assert_eq!(payload, Payload::Bytes(vec![7]));

        let payload = unpack_return_value(json!("ok"), vec![]).unwrap();
        assert_eq!(payload, Payload::Json(json!("ok")));

        let err = unpack_return_value(json!(null), vec![vec![1], vec![2]]).unwrap_err();
        assert!(matches!(err, CommError::Protocol(_)));
    }
}
