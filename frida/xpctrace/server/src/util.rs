//! Utility helpers shared by the xpctrace server.

use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

/// Installs the stderr log subscriber. stdout is reserved for the pcap stream.
pub fn init_tracing() {
    // RUST_LOG=xpctrace=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}

/// Makes the socket file at `path` writable by every user.
///
/// Connecting to a UNIX socket is checked against the permissions of the
/// file node, so this goes through the path and not the bound descriptor.
pub fn open_to_all_users(path: &Path) -> nix::Result<()> {
    fchmodat(
        None,
        path,
        Mode::from_bits_truncate(0o666),
        FchmodatFlags::FollowSymlink,
    )
}

/// First line of a (possibly multi-line) description.
pub fn first_line(s: &str) -> &str {
    s.split('\n').next().unwrap_or_default()
}

/// Joins a multi-line description into one line, dropping each newline and
/// the indentation that follows it.
pub fn collapse_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut lines = s.split('\n');
    if let Some(first) = lines.next() {
        out.push_str(first);
    }
    for line in lines {
        out.push_str(line.trim_start());
    }
    out
}

/// Maps bytes to printable ASCII for the hexdump gutter.
fn printable(chunk: &[u8]) -> String {
    chunk
        .iter()
        .map(|&c| if (32..=126).contains(&c) { c as char } else { '.' })
        .collect()
}

/// Classic 16-bytes-per-line hexdump: `OFFSET: HH .. HH  HH .. HH  ascii`.
pub fn hexdump(data: &[u8]) -> String {
    let mut lines = Vec::with_capacity(data.len().div_ceil(16));
    for (i, chunk) in data.chunks(16).enumerate() {
        let encoded = hex::encode_upper(chunk);
        let bytes: Vec<&str> = (0..chunk.len())
            .map(|j| &encoded[j * 2..j * 2 + 2])
            .collect();
        let (left, right) = bytes.split_at(bytes.len().min(8));
        let columns = if right.is_empty() {
            left.join(" ")
        } else {
            format!("{}  {}", left.join(" "), right.join(" "))
        };
        lines.push(format!("{:08X}: {:<48}  {}", i * 16, columns, printable(chunk)));
    }
    lines.join("\n")
}

/// Splits a wall-clock instant into whole seconds and the nanosecond
/// remainder. Seconds saturate at `u32::MAX`.
pub fn timestamp_parts(at: SystemTime) -> (u32, u32) {
    let dur = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = u32::try_from(dur.as_secs()).unwrap_or(u32::MAX);
    (secs, dur.subsec_nanos())
}
