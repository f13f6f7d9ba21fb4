pub mod directory;
pub mod orchestrator;
pub mod reader;
pub mod writer;

pub use directory::{Directory, SegmentFile};
pub use orchestrator::{
    creation_time_from, segment_name_from, FilesOrchestrator, ReadableConditions, ReadableSegment,
    WritableConditions, WritableSegment,
};
pub use reader::{decode_records, Decoded, ReadResult, RecordReader, StopReason};
pub use writer::{append_record, encode_record, framed_len, RECORD_HEADER_SIZE, RECORD_TYPE_EVENT};
