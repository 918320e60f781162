//! XPCS frame parser shared between the Frida agent and this server.
//!
//! Each datagram carries one agent message: a fixed 16-byte header followed by
//! the JSON envelope and the raw bytes that travelled next to it.
//!
//! ```text
//! magic u32 | ver u8 | reserved[3] | json_len u32 | data_len u32 | json | data
//! ```
//!
//! All integers are little-endian.

use thiserror::Error;

/// Magic constant for XPCS frames ('XPCS' in little-endian).
pub const MAGIC_XPCS: u32 = 0x5343_5058;
/// Supported wire format version.
pub const VER: u8 = 1;
/// Size of the fixed header preceding the variable sections.
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The datagram ended inside the named header field.
    #[error("short read {0}")]
    Short(&'static str),

    /// The first four bytes are not `XPCS`.
    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    /// A frame version this server does not speak.
    #[error("unsupported ver: {0}")]
    UnsupportedVersion(u8),

    /// The declared sections run past the end of the datagram.
    #[error("lengths exceed packet: json={json} data={data} total={total}")]
    LengthsExceed { json: usize, data: usize, total: usize },

    /// A section does not fit the header's `u32` length field.
    #[error("section too large for frame: {0} bytes")]
    TooLarge(usize),
}

/// Parsed view into a single XPCS frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    /// JSON envelope bytes (Frida `send()` message shape).
    pub json: &'a [u8],
    /// Raw data bytes sent alongside the envelope.
    pub data: &'a [u8],
}

fn read_u8(b: &[u8], off: &mut usize) -> Result<u8, FrameError> {
    let v = *b.get(*off).ok_or(FrameError::Short("u8"))?;
    *off += 1;
    Ok(v)
}

fn read_u32_le(b: &[u8], off: &mut usize) -> Result<u32, FrameError> {
    let bytes = b
        .get(*off..*off + 4)
        .ok_or(FrameError::Short("u32"))?;
    let v = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    *off += 4;
    Ok(v)
}

/// Parses an XPCS datagram into a [`Frame`].
pub fn parse_frame(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    let mut off = 0;

    let magic = read_u32_le(buf, &mut off)?;
    if magic != MAGIC_XPCS {
        return Err(FrameError::BadMagic(magic));
    }

    let ver = read_u8(buf, &mut off)?;
    if ver != VER {
        return Err(FrameError::UnsupportedVersion(ver));
    }

    // reserved(3)
    if off + 3 > buf.len() {
        return Err(FrameError::Short("reserved"));
    }
    off += 3;

    let json_len = read_u32_le(buf, &mut off)? as usize;
    let data_len = read_u32_le(buf, &mut off)? as usize;

    let rest = buf.len() - off;
    if json_len.checked_add(data_len).map_or(true, |n| n > rest) {
        return Err(FrameError::LengthsExceed {
            json: json_len,
            data: data_len,
            total: buf.len(),
        });
    }

    let json = &buf[off..off + json_len];
    off += json_len;
    let data = &buf[off..off + data_len];

    Ok(Frame { json, data })
}

/// Builds an XPCS datagram. Counterpart of [`parse_frame`] for agents and
/// replay tooling.
pub fn encode_frame(json: &[u8], data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let json_len = u32::try_from(json.len()).map_err(|_| FrameError::TooLarge(json.len()))?;
    let data_len = u32::try_from(data.len()).map_err(|_| FrameError::TooLarge(data.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + json.len() + data.len());
    out.extend_from_slice(&MAGIC_XPCS.to_le_bytes());
    out.push(VER);
    out.extend_from_slice(&[0; 3]);
    out.extend_from_slice(&json_len.to_le_bytes());
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(json);
    out.extend_from_slice(data);
    Ok(out)
}
