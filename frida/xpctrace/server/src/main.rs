//! Collects XPC capture frames over an AF_UNIX datagram socket and streams
//! them as pcap.
//!
//! This binary pairs with the xpctrace Frida agent:
//! - The agent hooks libxpc / NSXPC delivery and emits XPCS frames (JSON
//!   envelope + raw bytes) to a UNIX datagram socket.
//! - The server decodes frames and appends one pcap record per captured
//!   message to stdout or `--output`.
//!
//! Typical use: `xpctrace-server /tmp/xpc.sock | wireshark -k -i -`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{fs, io, io::Write, path::PathBuf, thread, time::Duration};
use tokio::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use xpctrace::util::{init_tracing, open_to_all_users};
use xpctrace::{CaptureSession, CaptureStats, PcapWriter, StopReason};

/// Datagrams buffered between the socket and a slow pcap consumer.
const QUEUE_DEPTH: usize = 1024;

/// How long an interrupted capture may spend flushing queued datagrams.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "xpctrace-server", version, about = "Collect XPC capture frames over AF_UNIX datagram and stream them as pcap")]
struct Cli {
    /// UNIX datagram socket path to bind (will unlink if exists)
    #[arg(env = "XPCTRACE_SOCKET")]
    socket: PathBuf,

    /// pcap destination, `-` for stdout
    #[arg(short, long, env = "XPCTRACE_OUTPUT", default_value = "-")]
    output: PathBuf,

    /// Print every captured message tree to stderr
    #[arg(long, env = "XPCTRACE_TREE")]
    tree: bool,

    /// Receive buffer size in bytes; larger datagrams are dropped
    #[arg(long, env = "XPCTRACE_MAX_DATAGRAM", default_value_t = 4 * 1024 * 1024)]
    max_datagram: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if cli.socket.exists() {
        fs::remove_file(&cli.socket)
            .with_context(|| format!("remove {}", cli.socket.display()))?;
    }

    let sock = UnixDatagram::bind(&cli.socket)
        .with_context(|| format!("bind {}", cli.socket.display()))?;

    // sandboxed targets run as other users
    open_to_all_users(&cli.socket)
        .with_context(|| format!("chmod {}", cli.socket.display()))?;

    let result = if cli.output.as_os_str() == "-" {
        capture(&cli, sock, PcapWriter::stdout()).await
    } else {
        let writer = PcapWriter::create(&cli.output)
            .with_context(|| format!("create {}", cli.output.display()))?;
        capture(&cli, sock, writer).await
    };
    let _ = fs::remove_file(&cli.socket);

    if let StopReason::PlatformMismatch(description) = result? {
        bail!("target has no Objective-C runtime, likely the wrong platform binary: {description}");
    }
    Ok(())
}

async fn capture<W>(cli: &Cli, sock: UnixDatagram, writer: PcapWriter<W>) -> Result<StopReason>
where
    W: Write + Send + 'static,
{
    let mut session = CaptureSession::new(writer);
    if cli.tree {
        session = session.with_tree_output(Box::new(io::stderr()));
    }
    session.start().context("write pcap header")?;

    info!(
        socket = %cli.socket.display(),
        output = %cli.output.display(),
        "listening"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    // Writes block on the consumer, so they run on their own thread. The
    // thread is not joined: a consumer that never reads must not keep the
    // process alive after a signal.
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (done_tx, mut done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("pcap-writer".into())
        .spawn(move || {
            let _ = done_tx.send(session.run(rx));
        })
        .context("spawn pcap writer")?;

    let reader = tokio::spawn(forward_datagrams(sock, tx, cli.max_datagram));

    let stopped = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        _ = sigterm.recv() => None,
        r = &mut done_rx => Some(r),
    };
    reader.abort();

    let (reason, stats) = match stopped {
        Some(Ok((reason, stats))) => (reason, Some(stats)),
        Some(Err(_)) => bail!("pcap writer thread died"),
        None => {
            // the aborted reader drops the sender, so the writer ends once the
            // queue is empty
            let stats = match tokio::time::timeout(DRAIN_TIMEOUT, done_rx).await {
                Ok(Ok((_, stats))) => Some(stats),
                _ => {
                    warn!("pcap consumer is not reading, abandoning queued records");
                    None
                }
            };
            (StopReason::Interrupted, stats)
        }
    };

    let CaptureStats { captured, skipped } = stats.unwrap_or_default();
    info!(captured, skipped, ?reason, "capture stopped");
    Ok(reason)
}

/// Moves datagrams from the socket to the writer thread. A full queue stalls
/// `recv`, which pushes back on the agent instead of dropping captures.
async fn forward_datagrams(sock: UnixDatagram, tx: mpsc::Sender<Vec<u8>>, max_datagram: usize) {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let n = match sock.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "recv failed");
                continue;
            }
        };

        if tx.send(buf[..n].to_vec()).await.is_err() {
            break;
        }
    }
}
