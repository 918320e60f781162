//! Agent events decoded from XPCS frames, and the JSON metadata written in
//! front of each pcap record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::Message;
use crate::util::collapse_lines;

/// Error substrings that mean the script landed in a process it cannot
/// instrument (no Objective-C runtime / libxpc).
pub const FATAL_ERROR_MARKERS: &[&str] = &[
    "unable to find module 'libobjc.A.dylib'",
    "libxpc.dylib not found",
    "Objective-C runtime is not available",
];

/// Returns true when an agent error description names a platform mismatch.
pub fn is_platform_mismatch(description: &str) -> bool {
    FATAL_ERROR_MARKERS
        .iter()
        .any(|marker| description.contains(marker))
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed agent envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed capture payload: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Which way a message travelled relative to the hooked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Handed to libxpc / NSXPC for delivery to the peer.
    Sent,
    /// Delivered to one of the process's handlers.
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    /// Arrow used by the agent and the dissector: `>` out, `<` in.
    pub fn arrow(self) -> &'static str {
        match self {
            Direction::Sent => ">",
            Direction::Received => "<",
        }
    }
}

/// One observed message crossing a connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvent {
    pub direction: Direction,
    pub peer_pid: Option<i32>,
    pub service_name: Option<String>,
    pub message: Message,
    /// Symbolicated sender backtrace (sent messages only).
    pub backtrace: Vec<String>,
    pub raw_data: Vec<u8>,
}

impl CaptureEvent {
    pub fn new(direction: Direction, message: Message) -> Self {
        Self {
            direction,
            peer_pid: None,
            service_name: None,
            message,
            backtrace: Vec::new(),
            raw_data: Vec::new(),
        }
    }

    pub fn with_peer(mut self, pid: i32, service_name: impl Into<String>) -> Self {
        self.peer_pid = Some(pid);
        self.service_name = Some(service_name.into());
        self
    }

    pub fn with_raw_data(mut self, raw_data: impl Into<Vec<u8>>) -> Self {
        self.raw_data = raw_data.into();
        self
    }

    pub fn metadata(&self) -> Metadata<'_> {
        Metadata {
            event: self.direction.as_str(),
            direction: self.direction.arrow(),
            peer: self.peer_pid,
            name: self.service_name.as_deref(),
            message: &self.message,
            backtrace: &self.backtrace,
            data_length: self.raw_data.len(),
        }
    }

    /// One-line list entry: `#n > pid=123 com.apple.foo <dictionary...>`.
    pub fn summary(&self, index: u64) -> String {
        let peer = self
            .peer_pid
            .map_or_else(|| "N/A".to_owned(), |pid| pid.to_string());
        format!(
            "#{index} {} pid={peer} {} {}",
            self.direction.arrow(),
            self.service_name.as_deref().unwrap_or("N/A"),
            collapse_lines(self.message.description()),
        )
    }
}

/// JSON metadata placed in front of the raw bytes of each record.
///
/// Absent fields are omitted; `data_length` tells readers where the JSON ends
/// and the raw bytes begin.
#[derive(Debug, Serialize)]
pub struct Metadata<'a> {
    /// "sent" or "received".
    pub event: &'a str,
    /// ">" or "<".
    pub direction: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,

    pub message: &'a Message,

    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub backtrace: &'a [String],

    pub data_length: usize,
}

/// Everything the agent can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Capture(CaptureEvent),
    /// Script error or agent-reported failure.
    Error(String),
    /// `console.log` and friends.
    Log { level: String, text: String },
    /// A `send()` payload that is not a capture.
    Other(serde_json::Value),
}

impl AgentEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentEvent::Error(desc) if is_platform_mismatch(desc))
    }
}

/// Frida `on('message')` envelope.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Send {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Error {
        description: String,
    },
    Log {
        #[serde(default)]
        level: String,
        #[serde(default)]
        payload: String,
    },
}

#[derive(Deserialize)]
struct CapturePayload {
    event: Direction,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    peer: Option<i32>,
    message: Message,
    #[serde(default)]
    backtrace: Vec<String>,
}

/// Decodes one agent envelope plus the raw bytes that came with it.
pub fn decode_event(json: &[u8], data: &[u8]) -> Result<AgentEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(json).map_err(DecodeError::Envelope)?;

    let payload = match envelope {
        Envelope::Error { description } => return Ok(AgentEvent::Error(description)),
        Envelope::Log { level, payload } => {
            return Ok(AgentEvent::Log {
                level,
                text: payload,
            })
        }
        Envelope::Send { payload } => payload,
    };

    if payload.get("type").and_then(|v| v.as_str()) == Some("error") {
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown agent error");
        return Ok(AgentEvent::Error(message.to_owned()));
    }

    let is_capture = matches!(
        payload.get("event").and_then(|v| v.as_str()),
        Some("sent" | "received")
    );
    if !is_capture {
        return Ok(AgentEvent::Other(payload));
    }

    let p: CapturePayload = serde_json::from_value(payload).map_err(DecodeError::Payload)?;
    Ok(AgentEvent::Capture(CaptureEvent {
        direction: p.event,
        peer_pid: p.peer,
        service_name: p.name,
        message: p.message,
        backtrace: p.backtrace,
        raw_data: data.to_vec(),
    }))
}
