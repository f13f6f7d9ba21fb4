use std::borrow::Cow;
use std::collections::HashSet;
use std::io;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use mini_spool_common::{DeletionReason, Timestamp};
use mini_spool_segment::{decode_records, FilesOrchestrator, ReadableSegment, StopReason};
use tracing::{debug, error, warn};

use crate::lock;

/// Decoded content of one segment.
#[derive(Debug, Clone)]
pub struct Batch {
    segment: ReadableSegment,
    data: Vec<u8>,
    records: Vec<Range<usize>>,
}

impl Batch {
    /// Name of the originating segment.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn created(&self) -> Timestamp {
        self.segment.created()
    }

    /// Record payloads in write order.
    pub fn events(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.records.iter().map(|r| &self.data[r.clone()])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Produces batches from the oldest readable segment and deletes them once
/// the caller reports a terminal outcome.
pub struct BatchReader {
    orchestrator: Arc<Mutex<FilesOrchestrator>>,
    max_record_size: u64,
    track: String,
}

impl BatchReader {
    pub fn new(
        orchestrator: Arc<Mutex<FilesOrchestrator>>,
        max_record_size: u64,
        track: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            max_record_size,
            track: track.into(),
        }
    }

    /// Next batch, skipping segments named in `excluding`. `None` when no
    /// segment is old enough, which is the common case.
    pub fn read_next_batch(&self, excluding: &HashSet<String>) -> Option<Batch> {
        self.read(excluding, false)
    }

    /// Next batch regardless of segment age. Used when flushing.
    pub fn read_next_batch_ignoring_age(&self, excluding: &HashSet<String>) -> Option<Batch> {
        self.read(excluding, true)
    }

    /// Delete the batch's segment. Consumes the batch so it cannot be
    /// finalized twice.
    pub fn mark_as_read(&self, batch: Batch, reason: DeletionReason) {
        lock(&self.orchestrator).delete(&batch.segment, reason);
    }

    fn read(&self, excluding: &HashSet<String>, ignore_age: bool) -> Option<Batch> {
        let mut excluding = Cow::Borrowed(excluding);
        loop {
            let segment = {
                let mut orchestrator = lock(&self.orchestrator);
                if ignore_age {
                    orchestrator.get_readable_segment_ignoring_age(&excluding)
                } else {
                    orchestrator.get_readable_segment(&excluding)
                }
            }?;

            let data = match segment.read_all() {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Removed between listing and reading; try the next one.
                    continue;
                }
                Err(e) => {
                    // Left on disk until it ages out; younger segments go first meanwhile.
                    error!(track = %self.track, segment = segment.name(), error = %e, "failed to read segment, skipping it");
                    excluding.to_mut().insert(segment.name().to_string());
                    continue;
                }
            };

            let decoded = decode_records(&data, self.max_record_size);
            if decoded.is_unrecoverable(data.len()) {
                error!(
                    track = %self.track,
                    segment = segment.name(),
                    size = data.len(),
                    "segment has no decodable record, deleting it"
                );
                self.delete(&segment, DeletionReason::Invalid);
                continue;
            }
            if decoded.records.is_empty() {
                debug!(track = %self.track, segment = segment.name(), "deleting empty segment");
                self.delete(&segment, DeletionReason::Invalid);
                continue;
            }
            if decoded.skipped > 0 || decoded.stopped.is_some() {
                let stopped_at = match decoded.stopped {
                    Some(StopReason::Truncated { offset }) | Some(StopReason::Unframed { offset }) => Some(offset),
                    None => None,
                };
                warn!(
                    track = %self.track,
                    segment = segment.name(),
                    records = decoded.records.len(),
                    skipped = decoded.skipped,
                    ?stopped_at,
                    "salvaged the decodable part of a damaged segment"
                );
            }

            return Some(Batch {
                segment,
                data,
                records: decoded.records,
            });
        }
    }

    fn delete(&self, segment: &ReadableSegment, reason: DeletionReason) {
        lock(&self.orchestrator).delete(segment, reason);
    }
}
