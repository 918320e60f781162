//! Typed model of the message descriptions emitted by the agent.
//!
//! The agent serializes every libxpc object as a JSON node tagged by `type`.
//! Containers (`dictionary`, `array`) nest further nodes, `nsxpc` describes an
//! NSXPC method invocation, `data` points into the raw bytes shipped alongside
//! the frame, and every other libxpc type is a scalar leaf.

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Reasons a message description cannot be modeled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("`{kind}` node is missing field `{field}`")]
    MissingField { kind: String, field: &'static str },

    #[error("dictionary has {keys} keys but {values} values")]
    KeyValueMismatch { keys: usize, values: usize },

    #[error("selector {sel:?} has {segments} segments but {args} arguments")]
    SelectorMismatch {
        sel: String,
        segments: usize,
        args: usize,
    },
}

/// libxpc leaf types, named after their `_xpc_type_*` export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    String,
    Uuid,
    Double,
    Int64,
    Uint64,
    Bool,
    Fd,
    Null,
    Date,
    Endpoint,
    Error,
    Connection,
    Shmem,
    MachSend,
    MachRecv,
    Activity,
    Pointer,
    Session,
    RichError,
    Bundle,
    FileTransfer,
    Service,
    ServiceInstance,
    Serializer,
}

impl ScalarKind {
    /// Maps a wire tag to a scalar kind. Container tags are not scalars.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "string" => Self::String,
            "uuid" => Self::Uuid,
            "double" => Self::Double,
            "int64" => Self::Int64,
            "uint64" => Self::Uint64,
            "bool" => Self::Bool,
            "fd" => Self::Fd,
            "null" => Self::Null,
            "date" => Self::Date,
            "endpoint" => Self::Endpoint,
            "error" => Self::Error,
            "connection" => Self::Connection,
            "shmem" => Self::Shmem,
            "mach_send" => Self::MachSend,
            "mach_recv" => Self::MachRecv,
            "activity" => Self::Activity,
            "pointer" => Self::Pointer,
            "session" => Self::Session,
            "rich_error" => Self::RichError,
            "bundle" => Self::Bundle,
            "file_transfer" => Self::FileTransfer,
            "service" => Self::Service,
            "service_instance" => Self::ServiceInstance,
            "serializer" => Self::Serializer,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Uuid => "uuid",
            Self::Double => "double",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Bool => "bool",
            Self::Fd => "fd",
            Self::Null => "null",
            Self::Date => "date",
            Self::Endpoint => "endpoint",
            Self::Error => "error",
            Self::Connection => "connection",
            Self::Shmem => "shmem",
            Self::MachSend => "mach_send",
            Self::MachRecv => "mach_recv",
            Self::Activity => "activity",
            Self::Pointer => "pointer",
            Self::Session => "session",
            Self::RichError => "rich_error",
            Self::Bundle => "bundle",
            Self::FileTransfer => "file_transfer",
            Self::Service => "service",
            Self::ServiceInstance => "service_instance",
            Self::Serializer => "serializer",
        }
    }

    /// Whether the agent always extracts a `value` for this kind.
    ///
    /// `double` and `fd` are left out: a NaN double arrives as `null` and an
    /// fd whose path cannot be resolved has no `value` at all. The remaining
    /// kinds only carry their `xpc_copy_description` text.
    pub fn requires_value(self) -> bool {
        matches!(
            self,
            Self::String | Self::Uuid | Self::Int64 | Self::Uint64 | Self::Bool
        )
    }
}

/// One decoded message node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawNode")]
pub enum Message {
    /// A libxpc leaf. `path` is the resolved file of an `fd`; `offset`
    /// locates a `uuid`'s 16 bytes in the event's raw data.
    Scalar {
        kind: ScalarKind,
        description: String,
        value: Option<String>,
        path: Option<String>,
        offset: Option<usize>,
    },
    /// Bytes shipped out of band; `offset`/`length` locate them in the
    /// event's raw data when the agent reports them.
    Data {
        description: String,
        offset: Option<usize>,
        length: Option<usize>,
    },
    /// Elements in wire order.
    Array {
        description: String,
        values: Vec<Message>,
    },
    /// Keys pair with values by index and may repeat.
    Dictionary {
        description: String,
        keys: Vec<String>,
        values: Vec<Message>,
    },
    /// An NSXPC method call. `args` pair with the colon-terminated segments
    /// of `sel`.
    Nsxpc {
        sel: String,
        args: Vec<String>,
        description: Option<String>,
    },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Scalar { kind, .. } => kind.as_str(),
            Message::Data { .. } => "data",
            Message::Array { .. } => "array",
            Message::Dictionary { .. } => "dictionary",
            Message::Nsxpc { .. } => "nsxpc",
        }
    }

    /// Full (possibly multi-line) description. NSXPC calls without one fall
    /// back to their selector.
    pub fn description(&self) -> &str {
        match self {
            Message::Scalar { description, .. }
            | Message::Data { description, .. }
            | Message::Array { description, .. }
            | Message::Dictionary { description, .. } => description,
            Message::Nsxpc {
                sel, description, ..
            } => description.as_deref().unwrap_or(sel.as_str()),
        }
    }
}

/// Splits `sel` into one colon-terminated segment per argument.
///
/// A selector without arguments must not contain a colon; one with arguments
/// must end in a colon and carry exactly one colon per argument.
pub fn selector_segments(sel: &str, args: usize) -> Result<Vec<&str>, MessageError> {
    let colons = sel.matches(':').count();
    let well_formed = if args == 0 {
        colons == 0
    } else {
        colons == args && sel.ends_with(':')
    };

    if !well_formed {
        return Err(MessageError::SelectorMismatch {
            sel: sel.to_owned(),
            segments: sel.split_inclusive(':').count(),
            args,
        });
    }

    if args == 0 {
        return Ok(Vec::new());
    }
    Ok(sel.split_inclusive(':').collect())
}

/// Wire shape of a node before its tag is checked.
#[derive(Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    ty: String,
    description: Option<String>,
    value: Option<serde_json::Value>,
    keys: Option<Vec<String>>,
    values: Option<Vec<Message>>,
    sel: Option<String>,
    args: Option<Vec<String>>,
    offset: Option<usize>,
    length: Option<usize>,
    path: Option<String>,
}

fn required<T>(field: Option<T>, kind: &str, name: &'static str) -> Result<T, MessageError> {
    field.ok_or_else(|| MessageError::MissingField {
        kind: kind.to_owned(),
        field: name,
    })
}

/// Renders a JSON scalar as display text. Strings are taken verbatim.
fn value_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl TryFrom<RawNode> for Message {
    type Error = MessageError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let ty = raw.ty;
        match ty.as_str() {
            "nsxpc" => Ok(Message::Nsxpc {
                sel: required(raw.sel, &ty, "sel")?,
                args: required(raw.args, &ty, "args")?,
                description: raw.description,
            }),
            "data" => Ok(Message::Data {
                description: required(raw.description, &ty, "description")?,
                offset: raw.offset,
                length: raw.length,
            }),
            "array" => Ok(Message::Array {
                description: required(raw.description, &ty, "description")?,
                values: required(raw.values, &ty, "values")?,
            }),
            "dictionary" => {
                let description = required(raw.description, &ty, "description")?;
                let keys = required(raw.keys, &ty, "keys")?;
                let values = required(raw.values, &ty, "values")?;
                if keys.len() != values.len() {
                    return Err(MessageError::KeyValueMismatch {
                        keys: keys.len(),
                        values: values.len(),
                    });
                }
                Ok(Message::Dictionary {
                    description,
                    keys,
                    values,
                })
            }
            tag => {
                let kind = ScalarKind::from_tag(tag)
                    .ok_or_else(|| MessageError::UnknownType(tag.to_owned()))?;
                let description = required(raw.description, &ty, "description")?;
                let value = raw.value.and_then(value_text);
                if kind.requires_value() && value.is_none() {
                    return Err(MessageError::MissingField {
                        kind: ty,
                        field: "value",
                    });
                }
                Ok(Message::Scalar {
                    kind,
                    description,
                    value,
                    path: raw.path,
                    offset: raw.offset,
                })
            }
        }
    }
}

/// Borrowed wire view used to re-encode a node in the agent's format.
#[derive(Serialize)]
struct NodeRef<'a> {
    #[serde(rename = "type")]
    ty: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    keys: Option<&'a [String]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<&'a [Message]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    sel: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a [String]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
}

impl<'a> NodeRef<'a> {
    fn tagged(ty: &'a str) -> Self {
        Self {
            ty,
            description: None,
            value: None,
            keys: None,
            values: None,
            sel: None,
            args: None,
            offset: None,
            length: None,
            path: None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut node = NodeRef::tagged(self.type_name());
        match self {
            Message::Scalar {
                description,
                value,
                path,
                offset,
                ..
            } => {
                node.description = Some(description);
                node.value = value.as_deref();
                node.path = path.as_deref();
                node.offset = *offset;
            }
            Message::Data {
                description,
                offset,
                length,
            } => {
                node.description = Some(description);
                node.offset = *offset;
                node.length = *length;
            }
            Message::Array {
                description,
                values,
            } => {
                node.description = Some(description);
                node.values = Some(values);
            }
            Message::Dictionary {
                description,
                keys,
                values,
            } => {
                node.description = Some(description);
                node.keys = Some(keys);
                node.values = Some(values);
            }
            Message::Nsxpc {
                sel,
                args,
                description,
            } => {
                node.description = description.as_deref();
                node.sel = Some(sel);
                node.args = Some(args);
            }
        }
        node.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: serde_json::Value) -> Result<Message, serde_json::Error> {
        serde_json::from_value(v)
    }

    #[test]
    fn decodes_nested_dictionary() {
        let msg = decode(json!({
            "type": "dictionary",
            "description": "<dictionary: 0x1> { count = 2 }",
            "keys": ["name", "items"],
            "values": [
                { "type": "string", "description": "<string: 0x2> \"x\"", "value": "x" },
                { "type": "array", "description": "<array: 0x3>", "values": [
                    { "type": "int64", "description": "<int64: 0x4> 7", "value": "7" }
                ]}
            ]
        }))
        .unwrap();

        let Message::Dictionary { keys, values, .. } = msg else {
            panic!("expected dictionary");
        };
        assert_eq!(keys, vec!["name", "items"]);
        assert!(matches!(
            &values[0],
            Message::Scalar { kind: ScalarKind::String, value: Some(v), .. } if v == "x"
        ));
        assert!(matches!(&values[1], Message::Array { values, .. } if values.len() == 1));
    }

    #[test]
    fn non_string_values_render_as_text() {
        let msg = decode(json!({ "type": "bool", "description": "<bool> true", "value": true }))
            .unwrap();
        assert!(matches!(msg, Message::Scalar { value: Some(ref v), .. } if v == "true"));

        let msg = decode(json!({ "type": "double", "description": "<double> 1.5", "value": 1.5 }))
            .unwrap();
        assert!(matches!(msg, Message::Scalar { value: Some(ref v), .. } if v == "1.5"));
    }

    #[test]
    fn description_only_kinds_need_no_value() {
        let msg = decode(json!({ "type": "null", "description": "<null>" })).unwrap();
        assert!(matches!(
            msg,
            Message::Scalar { kind: ScalarKind::Null, value: None, .. }
        ));
    }

    #[test]
    fn unresolved_fd_and_nan_double_decode() {
        let msg = decode(json!({ "type": "fd", "description": "<fd: 0x1> { fd = 5 }" })).unwrap();
        assert!(matches!(
            msg,
            Message::Scalar { kind: ScalarKind::Fd, value: None, path: None, .. }
        ));

        let msg = decode(json!({ "type": "double", "description": "<double: 0x2> nan", "value": null }))
            .unwrap();
        assert!(matches!(
            msg,
            Message::Scalar { kind: ScalarKind::Double, value: None, .. }
        ));
    }

    #[test]
    fn scalar_extras_are_kept() {
        let msg = decode(json!({
            "type": "fd",
            "description": "<fd: 0x1> { fd = 5 }",
            "value": "/dev/null",
            "path": "/dev/null"
        }))
        .unwrap();
        assert!(matches!(msg, Message::Scalar { path: Some(ref p), .. } if p == "/dev/null"));

        let msg = decode(json!({ "type": "uuid", "description": "<uuid>", "value": "00", "offset": 16 }))
            .unwrap();
        assert!(matches!(msg, Message::Scalar { offset: Some(16), .. }));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = decode(json!({ "type": "blob", "description": "?" })).unwrap_err();
        assert!(err.to_string().contains("unknown message type \"blob\""), "{err}");
    }

    #[test]
    fn rejects_missing_fields() {
        let err = decode(json!({ "type": "string", "description": "<string>" })).unwrap_err();
        assert!(err.to_string().contains("missing field `value`"), "{err}");

        let err = decode(json!({ "type": "nsxpc", "sel": "ping" })).unwrap_err();
        assert!(err.to_string().contains("missing field `args`"), "{err}");
    }

    #[test]
    fn rejects_unbalanced_dictionary() {
        let err = decode(json!({
            "type": "dictionary",
            "description": "d",
            "keys": ["a", "b"],
            "values": [{ "type": "null", "description": "<null>" }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("2 keys but 1 values"), "{err}");
    }

    #[test]
    fn errors_in_nested_nodes_fail_the_root() {
        let err = decode(json!({
            "type": "array",
            "description": "a",
            "values": [{ "type": "mystery", "description": "?" }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("mystery"), "{err}");
    }

    #[test]
    fn reencodes_in_agent_format() {
        let wire = json!({
            "type": "dictionary",
            "description": "d",
            "keys": ["blob", "fd", "uuid"],
            "values": [
                { "type": "data", "description": "<data>", "offset": 0, "length": 4 },
                { "type": "fd", "description": "<fd>", "value": "/tmp/x", "path": "/tmp/x" },
                { "type": "uuid", "description": "<uuid>", "value": "A-B", "offset": 4 }
            ]
        });
        let msg = decode(wire.clone()).unwrap();
        assert_eq!(serde_json::to_value(&msg).unwrap(), wire);
    }

    #[test]
    fn selector_segments_pair_with_arguments() {
        assert_eq!(
            selector_segments("doThing:withOption:", 2).unwrap(),
            vec!["doThing:", "withOption:"]
        );
        assert!(selector_segments("ping", 0).unwrap().is_empty());
    }

    #[test]
    fn selector_mismatch_is_an_error() {
        assert_eq!(
            selector_segments("doThing:", 2),
            Err(MessageError::SelectorMismatch {
                sel: "doThing:".into(),
                segments: 1,
                args: 2,
            })
        );
        assert!(selector_segments("doThing:", 0).is_err());
        assert!(selector_segments("doThing:tail", 1).is_err());
    }

    #[test]
    fn nsxpc_description_falls_back_to_selector() {
        let msg = Message::Nsxpc {
            sel: "ping".into(),
            args: vec![],
            description: None,
        };
        assert_eq!(msg.description(), "ping");
    }
}
