use crc32fast::Hasher;

use crate::directory::SegmentFile;

/// Block type for a serialized event.
pub const RECORD_TYPE_EVENT: u8 = 0x01;

/// Fixed-size header written before each record payload.
///
/// Layout (little-endian):
///   type      : u8   (1)
///   len       : u32  (4)   payload length
///   crc32     : u32  (4)   CRC of the payload
///   ─────────────────────
///   total     : 9 bytes
pub const RECORD_HEADER_SIZE: usize = 9;

/// Encode one payload into its on-disk frame (header + payload).
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.push(RECORD_TYPE_EVENT);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compute_crc(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Size on disk of a payload of `payload_len` bytes.
pub fn framed_len(payload_len: usize) -> u64 {
    (RECORD_HEADER_SIZE + payload_len) as u64
}

/// Append one framed record to `file` as a single write.
///
/// Returns the number of bytes appended.
pub fn append_record(file: &SegmentFile, payload: &[u8]) -> Result<u64, std::io::Error> {
    let frame = encode_record(payload);
    file.append(&frame)?;
    Ok(frame.len() as u64)
}

pub(crate) fn compute_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}
