use std::ops::Range;

use crate::writer::{compute_crc, RECORD_HEADER_SIZE, RECORD_TYPE_EVENT};

/// Outcome of trying to read one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Payload byte range of a valid record.
    Record(Range<usize>),
    /// Clean end of data.
    Eof,
    /// Header or payload cut short, e.g. by a crash mid-append.
    Truncated { offset: usize },
    /// Framing is intact but the payload fails its CRC; safe to skip.
    Corrupted { offset: usize },
    /// Unknown type byte or implausible length; nothing after this point
    /// can be trusted.
    Unframed { offset: usize },
}

/// Walks the frames of an in-memory segment.
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
    max_record_size: u64,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8], max_record_size: u64) -> Self {
        Self {
            data,
            pos: 0,
            max_record_size,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read one record starting at the current position.
    pub fn read_record(&mut self) -> ReadResult {
        let offset = self.pos;
        let remaining = &self.data[offset..];
        if remaining.is_empty() {
            return ReadResult::Eof;
        }
        if remaining.len() < RECORD_HEADER_SIZE {
            return ReadResult::Truncated { offset };
        }

        let header = decode_header(&remaining[..RECORD_HEADER_SIZE]);
        if header.record_type != RECORD_TYPE_EVENT || header.len as u64 > self.max_record_size {
            return ReadResult::Unframed { offset };
        }

        let start = offset + RECORD_HEADER_SIZE;
        let end = start + header.len as usize;
        if end > self.data.len() {
            return ReadResult::Truncated { offset };
        }

        self.pos = end;
        if compute_crc(&self.data[start..end]) != header.crc32 {
            return ReadResult::Corrupted { offset };
        }
        ReadResult::Record(start..end)
    }
}

/// Why decoding stopped before the end of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Truncated { offset: usize },
    Unframed { offset: usize },
}

/// Result of decoding a whole segment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Payload ranges of every valid record, in write order.
    pub records: Vec<Range<usize>>,
    /// Records dropped because of a CRC mismatch.
    pub skipped: usize,
    pub stopped: Option<StopReason>,
}

impl Decoded {
    /// Non-empty data that produced nothing usable.
    pub fn is_unrecoverable(&self, data_len: usize) -> bool {
        data_len > 0 && self.records.is_empty()
    }
}

/// Decode every record in `data`, salvaging the valid prefix.
pub fn decode_records(data: &[u8], max_record_size: u64) -> Decoded {
    let mut reader = RecordReader::new(data, max_record_size);
    let mut decoded = Decoded::default();
    loop {
        match reader.read_record() {
            ReadResult::Record(range) => decoded.records.push(range),
            ReadResult::Corrupted { .. } => decoded.skipped += 1,
            ReadResult::Eof => break,
            ReadResult::Truncated { offset } => {
                decoded.stopped = Some(StopReason::Truncated { offset });
                break;
            }
            ReadResult::Unframed { offset } => {
                decoded.stopped = Some(StopReason::Unframed { offset });
                break;
            }
        }
    }
    decoded
}

struct RecordHeader {
    record_type: u8,
    len: u32,
    crc32: u32,
}

fn decode_header(buf: &[u8]) -> RecordHeader {
    let mut len = [0u8; 4];
    let mut crc = [0u8; 4];
    len.copy_from_slice(&buf[1..5]);
    crc.copy_from_slice(&buf[5..9]);
    RecordHeader {
        record_type: buf[0],
        len: u32::from_le_bytes(len),
        crc32: u32::from_le_bytes(crc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::encode_record;

    const MAX: u64 = 1024;

    fn segment_of(payloads: &[&[u8]]) -> Vec<u8> {
        payloads.iter().flat_map(|p| encode_record(p)).collect()
    }

    fn payloads<'a>(data: &'a [u8], decoded: &Decoded) -> Vec<&'a [u8]> {
        decoded.records.iter().map(|r| &data[r.clone()]).collect()
    }

    #[test]
    fn test_decode_in_write_order() {
        let data = segment_of(&[b"first", b"second", b"third"]);
        let decoded = decode_records(&data, MAX);

        assert_eq!(payloads(&data, &decoded), vec![&b"first"[..], b"second", b"third"]);
        assert_eq!(decoded.skipped, 0);
        assert_eq!(decoded.stopped, None);
    }

    #[test]
    fn test_truncated_trailing_record_is_skipped() {
        let mut data = segment_of(&[b"complete", b"cut short by a crash"]);
        data.truncate(data.len() - 5);

        let decoded = decode_records(&data, MAX);
        assert_eq!(payloads(&data, &decoded), vec![&b"complete"[..]]);
        assert!(matches!(decoded.stopped, Some(StopReason::Truncated { .. })));
    }

    #[test]
    fn test_truncated_header_is_skipped() {
        let mut data = segment_of(&[b"complete"]);
        data.extend_from_slice(&[RECORD_TYPE_EVENT, 4, 0]);

        let decoded = decode_records(&data, MAX);
        assert_eq!(decoded.records.len(), 1);
        assert!(matches!(decoded.stopped, Some(StopReason::Truncated { .. })));
    }

    #[test]
    fn test_crc_mismatch_skips_only_that_record() {
        let mut data = segment_of(&[b"one", b"two", b"three"]);
        // Flip a payload byte of "two".
        let second_payload = encode_record(b"one").len() + RECORD_HEADER_SIZE;
        data[second_payload] ^= 0xFF;

        let decoded = decode_records(&data, MAX);
        assert_eq!(payloads(&data, &decoded), vec![&b"one"[..], b"three"]);
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_garbage_is_unrecoverable() {
        let data = vec![0x7Fu8; 64];
        let decoded = decode_records(&data, MAX);
        assert!(decoded.records.is_empty());
        assert!(decoded.is_unrecoverable(data.len()));
        assert_eq!(decoded.stopped, Some(StopReason::Unframed { offset: 0 }));
    }

    #[test]
    fn test_length_above_max_record_size_stops_decoding() {
        let mut data = segment_of(&[b"ok"]);
        data.extend(encode_record(&vec![0u8; 2048]));

        let decoded = decode_records(&data, MAX);
        assert_eq!(decoded.records.len(), 1);
        assert!(matches!(decoded.stopped, Some(StopReason::Unframed { .. })));
    }

    #[test]
    fn test_empty_segment_is_not_unrecoverable() {
        let decoded = decode_records(&[], MAX);
        assert!(decoded.records.is_empty());
        assert!(!decoded.is_unrecoverable(0));
    }
}
