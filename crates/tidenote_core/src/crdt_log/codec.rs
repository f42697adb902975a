//! Record framing (magic + length + crc32c).
//!
//! ```text
//! +---------+----------+----------+------------------+
//! | magic   | body len | crc32c   | body (len bytes) |
//! | u32 LE  | u32 LE   | u32 LE   |                  |
//! +---------+----------+----------+------------------+
//! ```
//!
//! Files delivered by copy-based sync tools routinely end mid-frame, or end in
//! a run of zero bytes where the tool pre-allocated space. Decoding therefore
//! separates an *incomplete tail* (stop cleanly, try again later) from
//! *corruption* (bytes that can never become a valid frame).

use crc32c::crc32c;

pub(crate) const FRAME_MAGIC: u32 = 0x544E_4C31; // "TNL1"
pub(crate) const FRAME_HEADER_LEN: usize = 12;

/// Largest accepted record body.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// A frame that can never decode, at a byte offset within the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptFrame {
    pub offset: u64,
    pub reason: String,
}

/// Result of decoding a byte buffer into frames.
#[derive(Debug)]
pub struct DecodedFrames<'a> {
    /// Complete frame bodies in file order, with their starting offsets.
    pub bodies: Vec<(u64, &'a [u8])>,
    /// Number of bytes covered by complete frames.
    pub complete_len: u64,
    /// Whether bytes after `complete_len` hold a not-yet-complete frame.
    pub incomplete_tail: bool,
}

/// Frame a record body.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, CorruptFrame> {
    if body.is_empty() || body.len() > MAX_RECORD_BYTES {
        return Err(CorruptFrame {
            offset: 0,
            reason: format!("record body of {} bytes cannot be framed", body.len()),
        });
    }
    let length = body.len() as u32;
    let crc = crc32c(body);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decode every complete frame in `bytes`, stopping at the first incomplete one.
pub fn decode_frames(bytes: &[u8]) -> Result<DecodedFrames<'_>, CorruptFrame> {
    let mut bodies = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let remaining = &bytes[pos..];
        let corrupt = |reason: String| CorruptFrame {
            offset: pos as u64,
            reason,
        };

        // A zero-filled region is space a sync tool reserved but hasn't written yet.
        if remaining.len() < FRAME_HEADER_LEN || remaining[..FRAME_HEADER_LEN].iter().all(|b| *b == 0)
        {
            if remaining[..remaining.len().min(FRAME_HEADER_LEN)]
                .iter()
                .any(|b| *b != 0)
                && remaining.len() >= 4
                && read_u32(remaining, 0) != FRAME_MAGIC
            {
                return Err(corrupt("bad frame magic".to_string()));
            }
            return Ok(DecodedFrames {
                bodies,
                complete_len: pos as u64,
                incomplete_tail: true,
            });
        }

        let magic = read_u32(remaining, 0);
        if magic != FRAME_MAGIC {
            return Err(corrupt(format!("bad frame magic {:#010x}", magic)));
        }
        let length = read_u32(remaining, 4) as usize;
        if length == 0 || length > MAX_RECORD_BYTES {
            return Err(corrupt(format!("invalid frame length {}", length)));
        }

        let frame_end = FRAME_HEADER_LEN + length;
        if remaining.len() < frame_end {
            return Ok(DecodedFrames {
                bodies,
                complete_len: pos as u64,
                incomplete_tail: true,
            });
        }

        let body = &remaining[FRAME_HEADER_LEN..frame_end];
        let expected_crc = read_u32(remaining, 8);
        if crc32c(body) != expected_crc {
            if remaining.len() == frame_end {
                // Last frame: its bytes may still be in flight.
                return Ok(DecodedFrames {
                    bodies,
                    complete_len: pos as u64,
                    incomplete_tail: true,
                });
            }
            return Err(corrupt("checksum mismatch".to_string()));
        }

        bodies.push((pos as u64, body));
        pos += frame_end;
    }

    Ok(DecodedFrames {
        bodies,
        complete_len: pos as u64,
        incomplete_tail: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_frames() -> Vec<u8> {
        let mut buf = encode_frame(b"{\"a\":1}").unwrap();
        buf.extend(encode_frame(b"{\"b\":2}").unwrap());
        buf
    }

    #[test]
    fn test_every_truncation_point_yields_prefix() {
        let buf = two_frames();
        let first_len = FRAME_HEADER_LEN + 7;
        for cut in 0..buf.len() {
            let decoded = decode_frames(&buf[..cut]).unwrap();
            let expected = if cut >= first_len { 1 } else { 0 };
            assert_eq!(decoded.bodies.len(), expected, "cut at {}", cut);
            assert_eq!(decoded.incomplete_tail, cut != 0 && cut != first_len);
        }
        let full = decode_frames(&buf).unwrap();
        assert_eq!(full.bodies.len(), 2);
        assert!(!full.incomplete_tail);
        assert_eq!(full.complete_len, buf.len() as u64);
    }

    #[test]
    fn test_zero_filled_tail_is_incomplete() {
        let mut buf = encode_frame(b"{\"a\":1}").unwrap();
        let complete = buf.len() as u64;
        buf.extend(std::iter::repeat_n(0u8, 64));
        let decoded = decode_frames(&buf).unwrap();
        assert_eq!(decoded.bodies.len(), 1);
        assert_eq!(decoded.complete_len, complete);
        assert!(decoded.incomplete_tail);
    }

    #[test]
    fn test_unwritten_last_body_is_incomplete() {
        let mut buf = two_frames();
        let len = buf.len();
        // Header delivered, body still zeros.
        for b in &mut buf[len - 7..] {
            *b = 0;
        }
        let decoded = decode_frames(&buf).unwrap();
        assert_eq!(decoded.bodies.len(), 1);
        assert!(decoded.incomplete_tail);
    }

    #[test]
    fn test_checksum_mismatch_mid_file_is_corrupt() {
        let mut buf = two_frames();
        buf[FRAME_HEADER_LEN] ^= 0xFF;
        let err = decode_frames(&buf).unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.reason.contains("checksum"));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut buf = two_frames();
        buf[0] = b'X';
        assert!(decode_frames(&buf).is_err());
    }
}
