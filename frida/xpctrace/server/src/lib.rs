//! Capture XPC traffic reported by a Frida agent and stream it as pcap.
//!
//! - [`frame`]: datagram framing between the agent and this server.
//! - [`event`]: agent envelopes and capture events.
//! - [`message`] / [`tree`]: the typed message model and its display tree.
//! - [`pcap`]: the capture-file encoder.
//! - [`capture`]: the session tying them together.

pub mod capture;
pub mod event;
pub mod frame;
pub mod message;
pub mod pcap;
pub mod tree;
pub mod util;

pub use capture::{CaptureSession, CaptureStats, StopReason};
pub use event::{AgentEvent, CaptureEvent, Direction};
pub use message::{Message, MessageError, ScalarKind};
pub use pcap::{EncodeError, PcapWriter};
pub use tree::{Detail, MessageTree, Node};
