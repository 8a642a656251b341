//! Length-prefixed, checksummed frames
//!
//! Commit files and data file sections share one framing:
//!
//! ```text
//! [4-byte length LE][payload][4-byte checksum LE]
//! ```
//!
//! The checksum is a rotating XOR fold of the payload bytes. A frame that is short,
//! truncated or fails its checksum is reported as a storage failure so that
//! a corrupted file is never interpreted.

use crate::error::{Error, Result};

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.rotate_left(5) ^ (b as u32))
}

/// Wrap a payload in a frame, appending it to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::StorageUnavailable(format!("Frame too large: {} bytes", payload.len())))?;
    out.reserve(payload.len() + HEADER_LEN + TRAILER_LEN);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(payload).to_le_bytes());
    Ok(())
}

/// Read one frame from the start of `bytes`.
///
/// Returns the payload and the number of bytes consumed.
pub fn read_frame(bytes: &[u8]) -> Result<(&[u8], usize)> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::StorageUnavailable("Frame too short".to_string()));
    }

    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let total = HEADER_LEN + len + TRAILER_LEN;
    if bytes.len() < total {
        return Err(Error::StorageUnavailable(format!(
            "Incomplete frame: expected {} bytes, got {}",
            total,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let t = HEADER_LEN + len;
    let stored = u32::from_le_bytes([bytes[t], bytes[t + 1], bytes[t + 2], bytes[t + 3]]);
    if stored != checksum(payload) {
        return Err(Error::StorageUnavailable("Checksum mismatch".to_string()));
    }

    Ok((payload, total))
}
