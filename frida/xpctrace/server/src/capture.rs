//! Capture session: turns incoming agent frames into pcap records.
//!
//! Each datagram is handled to completion before the next one, and the
//! returned [`ControlFlow`] tells the caller whether to keep feeding it.
//! [`CaptureSession::run`] drains a channel on a dedicated thread so a
//! stalled pcap consumer never blocks the task that reads the socket or
//! waits for signals.

use std::io::{self, Write};
use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::{decode_event, is_platform_mismatch, AgentEvent, CaptureEvent};
use crate::frame::parse_frame;
use crate::pcap::{EncodeError, PcapWriter};
use crate::tree::MessageTree;

/// Why a capture loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The pcap consumer went away (broken pipe, closed file).
    SinkClosed,
    /// The agent runs in a process it cannot instrument.
    PlatformMismatch(String),
    /// Ctrl-C or SIGTERM.
    Interrupted,
    /// Nothing is left to feed the session.
    SourceClosed,
}

/// Running totals for the final log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub captured: u64,
    pub skipped: u64,
}

pub struct CaptureSession<W: Write> {
    writer: PcapWriter<W>,
    tree_out: Option<Box<dyn Write + Send>>,
    stats: CaptureStats,
}

impl<W: Write> CaptureSession<W> {
    pub fn new(writer: PcapWriter<W>) -> Self {
        Self {
            writer,
            tree_out: None,
            stats: CaptureStats::default(),
        }
    }

    /// Prints a summary line and the message tree of every capture to `out`.
    pub fn with_tree_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.tree_out = Some(out);
        self
    }

    /// Writes the pcap global header.
    pub fn start(&mut self) -> Result<(), EncodeError> {
        self.writer.write_header()
    }

    /// Handles one raw datagram. Malformed frames and envelopes are logged
    /// and skipped.
    pub fn on_datagram(&mut self, buf: &[u8]) -> ControlFlow<StopReason> {
        let frame = match parse_frame(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, size = buf.len(), "bad frame");
                self.stats.skipped += 1;
                return ControlFlow::Continue(());
            }
        };

        match decode_event(frame.json, frame.data) {
            Ok(ev) => self.on_event(ev),
            Err(e) => {
                warn!(error = %e, "dropping undecodable event");
                self.stats.skipped += 1;
                ControlFlow::Continue(())
            }
        }
    }

    pub fn on_event(&mut self, ev: AgentEvent) -> ControlFlow<StopReason> {
        match ev {
            AgentEvent::Capture(capture) => self.on_capture(&capture),

            AgentEvent::Error(description) if is_platform_mismatch(&description) => {
                error!(%description, "script injected but the target has no Objective-C runtime");
                ControlFlow::Break(StopReason::PlatformMismatch(description))
            }

            AgentEvent::Error(description) => {
                warn!(%description, "agent error");
                ControlFlow::Continue(())
            }

            AgentEvent::Log { level, text } => {
                info!(%level, "agent: {text}");
                ControlFlow::Continue(())
            }

            AgentEvent::Other(payload) => {
                debug!(%payload, "ignoring agent payload");
                ControlFlow::Continue(())
            }
        }
    }

    fn on_capture(&mut self, capture: &CaptureEvent) -> ControlFlow<StopReason> {
        if let Err(e) = self.writer.write(capture) {
            if e.is_terminal() {
                warn!(error = %e, "pcap consumer went away, stopping capture");
                return ControlFlow::Break(StopReason::SinkClosed);
            }
            warn!(error = %e, "dropping event");
            self.stats.skipped += 1;
            return ControlFlow::Continue(());
        }

        self.stats.captured += 1;
        if let Err(e) = self.print_tree(capture) {
            debug!(error = %e, "tree output failed");
        }
        ControlFlow::Continue(())
    }

    fn print_tree(&mut self, capture: &CaptureEvent) -> io::Result<()> {
        let Some(out) = self.tree_out.as_mut() else {
            return Ok(());
        };

        writeln!(out, "{}", capture.summary(self.stats.captured))?;
        match MessageTree::build(&capture.message, &capture.raw_data) {
            Ok(tree) => out.write_all(tree.render().as_bytes())?,
            Err(e) => warn!(error = %e, "cannot build message tree"),
        }
        out.flush()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Handles datagrams from `rx` until the session stops or every sender
    /// is dropped. Blocks the calling thread; call it outside the runtime.
    pub fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>) -> (StopReason, CaptureStats) {
        while let Some(datagram) = rx.blocking_recv() {
            if let ControlFlow::Break(reason) = self.on_datagram(&datagram) {
                return (reason, self.stats);
            }
        }
        (StopReason::SourceClosed, self.stats)
    }

    /// Ends the session and releases the sink.
    pub fn finish(self) -> (W, CaptureStats) {
        (self.writer.into_inner(), self.stats)
    }
}
