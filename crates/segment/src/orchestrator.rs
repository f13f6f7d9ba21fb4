use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mini_spool_common::{Clock, DeletionReason, PipelineMetrics, SpoolError, Timestamp};
use tracing::{debug, error, warn};

use crate::directory::{Directory, SegmentFile};
use crate::writer::append_record;

/// How many times a new segment name is bumped by 1 ms when another
/// orchestrator already created a file with the same name.
const MAX_NAME_COLLISIONS: u32 = 16;

/// Rules deciding whether the current segment can take one more write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritableConditions {
    /// Maximum size of a single segment in bytes.
    pub max_file_size: u64,
    /// Maximum total size of the directory in bytes. Oldest segments are
    /// purged to stay under it.
    pub max_directory_size: u64,
    /// A segment older than this is never appended to again.
    pub max_file_age_for_write: Duration,
    /// Maximum number of appends into one segment.
    pub max_objects_in_file: u64,
}

/// Rules deciding whether a segment can be handed to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadableConditions {
    /// A segment younger than this is not readable. Must exceed
    /// `max_file_age_for_write` so the reader never sees a segment the
    /// writer may still append to.
    pub min_file_age_for_read: Duration,
    /// A segment older than this is deleted without upload.
    pub max_file_age_for_read: Duration,
}

/// Handle granted to the writer for one append.
#[derive(Debug, Clone)]
pub struct WritableSegment {
    file: SegmentFile,
}

impl WritableSegment {
    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Append one framed record. Returns bytes written.
    pub fn append(&self, payload: &[u8]) -> Result<u64, io::Error> {
        append_record(&self.file, payload)
    }
}

/// Handle granted to the reader. The segment is immutable from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadableSegment {
    file: SegmentFile,
    created: Timestamp,
}

impl ReadableSegment {
    pub fn name(&self) -> &str {
        self.file.name()
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn read_all(&self) -> Result<Vec<u8>, io::Error> {
        self.file.read_all()
    }
}

struct CurrentSegment {
    file: SegmentFile,
    created: Timestamp,
    /// Appends granted so far, including the one that created it.
    uses: u64,
    approximate_size: u64,
}

/// Decides which segment the writer appends to and which one the reader
/// consumes next, for a single directory.
pub struct FilesOrchestrator {
    directory: Directory,
    clock: Arc<dyn Clock>,
    writable: WritableConditions,
    readable: ReadableConditions,
    metrics: Arc<PipelineMetrics>,
    track: String,
    current: Option<CurrentSegment>,
    last_created: Timestamp,
    /// Bytes believed to be on disk. Re-listed whenever the next write
    /// might push the directory over budget.
    known_directory_size: Option<u64>,
}

impl FilesOrchestrator {
    pub fn new(
        directory: Directory,
        writable: WritableConditions,
        readable: ReadableConditions,
        clock: Arc<dyn Clock>,
        metrics: Arc<PipelineMetrics>,
        track: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            clock,
            writable,
            readable,
            metrics,
            track: track.into(),
            current: None,
            last_created: Timestamp::ZERO,
            known_directory_size: None,
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn current_segment_name(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.file.name())
    }

    // -----------------------------------------------------------------------
    // Writable segment orchestration
    // -----------------------------------------------------------------------

    /// Segment to append `write_size` bytes to: the current one if it still
    /// satisfies every writable condition, a new one otherwise.
    pub fn get_writable_segment(&mut self, write_size: u64) -> Result<WritableSegment, SpoolError> {
        self.validate(write_size)?;

        if self.can_reuse_current(write_size) && self.ensure_directory_budget(write_size)? {
            if let Some(current) = self.current.as_mut() {
                current.uses += 1;
                current.approximate_size += write_size;
                let file = current.file.clone();
                self.add_known_size(write_size);
                return Ok(WritableSegment { file });
            }
        }

        self.close_current(false);
        self.create_new_segment(write_size)
    }

    /// Always start a new segment, ignoring the reuse heuristic.
    pub fn get_new_writable_segment(&mut self, write_size: u64) -> Result<WritableSegment, SpoolError> {
        self.validate(write_size)?;
        self.close_current(true);
        self.create_new_segment(write_size)
    }

    /// Stop appending to the current segment so it becomes readable by age.
    pub fn retire_current(&mut self) {
        self.close_current(true);
    }

    fn validate(&self, write_size: u64) -> Result<(), SpoolError> {
        if write_size > self.writable.max_file_size {
            return Err(SpoolError::RecordTooLarge {
                size: write_size,
                max: self.writable.max_file_size,
            });
        }
        Ok(())
    }

    fn can_reuse_current(&self, write_size: u64) -> bool {
        let current = match &self.current {
            Some(current) => current,
            None => return false,
        };
        if !current.file.exists() {
            // Deleted underneath us (purged, expired, or removed externally).
            return false;
        }
        let size = match current.file.size() {
            Ok(size) => size,
            Err(e) => {
                warn!(track = %self.track, segment = current.file.name(), error = %e, "failed to stat current segment");
                return false;
            }
        };

        let age = self.clock.now().duration_since(current.created);
        let recent_enough = age <= self.writable.max_file_age_for_write;
        let has_room = size + write_size <= self.writable.max_file_size;
        let has_uses_left = current.uses < self.writable.max_objects_in_file;

        recent_enough && has_room && has_uses_left
    }

    fn create_new_segment(&mut self, write_size: u64) -> Result<WritableSegment, SpoolError> {
        self.purge_directory(write_size)?;

        let floor = Timestamp::from_millis(self.last_created.as_millis().saturating_add(1));
        let mut created = self.clock.now().max(floor);

        for _ in 0..MAX_NAME_COLLISIONS {
            let name = segment_name_from(created);
            match self.directory.create_file(&name) {
                Ok(file) => {
                    self.last_created = created;
                    self.current = Some(CurrentSegment {
                        file: file.clone(),
                        created,
                        uses: 1,
                        approximate_size: write_size,
                    });
                    self.add_known_size(write_size);
                    self.metrics.record_segment_created();
                    debug!(track = %self.track, segment = %name, "created segment");
                    return Ok(WritableSegment { file });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    created = created + Duration::from_millis(1);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // The directory itself was removed; recreate and retry.
                    Directory::open(self.directory.path())?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SpoolError::Other(format!(
            "no free segment name after {MAX_NAME_COLLISIONS} attempts"
        )))
    }

    fn close_current(&mut self, forced: bool) {
        if let Some(closed) = self.current.take() {
            self.metrics.record_segment_closed();
            let duration = self.clock.now().duration_since(closed.created);
            debug!(
                track = %self.track,
                segment = closed.file.name(),
                size = closed.approximate_size,
                events = closed.uses,
                duration_ms = duration.as_millis() as u64,
                forced,
                "batch closed"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Readable segment orchestration
    // -----------------------------------------------------------------------

    /// Oldest segment old enough to read, skipping `excluding` and the
    /// current writable segment. Deletes expired segments on the way.
    pub fn get_readable_segment(&mut self, excluding: &HashSet<String>) -> Option<ReadableSegment> {
        self.next_readable(excluding, false)
    }

    /// Like [`get_readable_segment`](Self::get_readable_segment) but without
    /// the minimum age gate. Used when flushing.
    pub fn get_readable_segment_ignoring_age(&mut self, excluding: &HashSet<String>) -> Option<ReadableSegment> {
        self.next_readable(excluding, true)
    }

    fn next_readable(&mut self, excluding: &HashSet<String>, ignore_age: bool) -> Option<ReadableSegment> {
        let now = self.clock.now();

        // Past its write window the current segment can never be appended to
        // again, so it stops being current and becomes readable by age.
        let current_expired = self
            .current
            .as_ref()
            .map(|c| now.duration_since(c.created) > self.writable.max_file_age_for_write)
            .unwrap_or(false);
        if current_expired {
            self.close_current(false);
        }

        let files = match self.sorted_files() {
            Ok(files) => files,
            Err(e) => {
                error!(track = %self.track, error = %e, "failed to list segments");
                return None;
            }
        };

        let mut oldest: Option<(SegmentFile, Timestamp)> = None;
        for (file, created) in files {
            if now.duration_since(created) > self.readable.max_file_age_for_read {
                self.delete_file(&file, created, DeletionReason::Obsolete);
                continue;
            }
            if oldest.is_none() && !excluding.contains(file.name()) && !self.is_current(file.name()) {
                oldest = Some((file, created));
            }
        }

        let (file, created) = oldest?;
        let old_enough = now.duration_since(created) >= self.readable.min_file_age_for_read;
        if ignore_age || old_enough {
            Some(ReadableSegment { file, created })
        } else {
            None
        }
    }

    /// Remove a segment after a terminal outcome. Idempotent.
    pub fn delete(&mut self, segment: &ReadableSegment, reason: DeletionReason) {
        self.delete_file(&segment.file, segment.created, reason);
    }

    // -----------------------------------------------------------------------
    // Consent migration
    // -----------------------------------------------------------------------

    /// Move every segment of `source` into this directory. Names are kept
    /// unless already taken here, in which case the creation time is bumped
    /// like a colliding new segment. Returns the number of segments moved.
    pub fn adopt_all(&mut self, source: &mut FilesOrchestrator) -> Result<usize, SpoolError> {
        source.close_current(true);
        let mut moved = 0;
        for (file, created) in source.sorted_files()? {
            match self.adopt(&file, created) {
                Ok(true) => {
                    if let Err(e) = file.delete() {
                        error!(track = %self.track, segment = file.name(), error = %e, "failed to remove migrated segment");
                    }
                    moved += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(track = %self.track, segment = file.name(), error = %e, "failed to migrate segment");
                }
            }
        }
        // Neither estimate covers the moved bytes any more.
        source.known_directory_size = None;
        self.known_directory_size = None;
        self.metrics.record_segments_migrated(moved as u64);
        debug!(track = %self.track, moved, "adopted segments");
        Ok(moved)
    }

    /// Returns `false` if `file` vanished before it could be linked.
    fn adopt(&self, file: &SegmentFile, created: Timestamp) -> Result<bool, io::Error> {
        let mut created = created;
        for _ in 0..MAX_NAME_COLLISIONS {
            match self.directory.link_file(file, &segment_name_from(created)) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    created = created + Duration::from_millis(1);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if !file.exists() {
                        return Ok(false);
                    }
                    Directory::open(self.directory.path())?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free segment name after {MAX_NAME_COLLISIONS} attempts"),
        ))
    }

    /// Delete every segment, the current one included. Returns the number
    /// of segments removed.
    pub fn delete_all(&mut self, reason: DeletionReason) -> usize {
        self.close_current(true);
        let files = match self.sorted_files() {
            Ok(files) => files,
            Err(e) => {
                error!(track = %self.track, error = %e, "failed to list segments");
                return 0;
            }
        };
        let mut deleted = 0;
        for (file, created) in files {
            if self.delete_file(&file, created, reason) {
                deleted += 1;
            }
        }
        deleted
    }

    // -----------------------------------------------------------------------
    // Directory bookkeeping
    // -----------------------------------------------------------------------

    /// Returns `false` if the current segment had to be purged.
    fn ensure_directory_budget(&mut self, write_size: u64) -> Result<bool, SpoolError> {
        if let Some(known) = self.known_directory_size {
            if known + write_size <= self.writable.max_directory_size {
                return Ok(true);
            }
        }
        self.purge_directory(write_size)
    }

    /// Delete oldest segments until `write_size` more bytes fit the
    /// directory budget. The current segment goes last. Returns whether a
    /// current segment still exists afterwards.
    fn purge_directory(&mut self, write_size: u64) -> Result<bool, SpoolError> {
        let max = self.writable.max_directory_size;
        let mut with_size: Vec<(SegmentFile, Timestamp, u64)> = self
            .sorted_files()?
            .into_iter()
            .filter_map(|(file, created)| file.size().ok().map(|size| (file, created, size)))
            .collect();
        let mut total: u64 = with_size.iter().map(|(_, _, size)| size).sum();

        if total + write_size > max {
            // Stable sort keeps age order within each group.
            with_size.sort_by_key(|(file, _, _)| self.is_current(file.name()));
            for (file, created, size) in with_size {
                if total + write_size <= max {
                    break;
                }
                if self.delete_file(&file, created, DeletionReason::Purged) {
                    total = total.saturating_sub(size);
                }
            }
            warn!(track = %self.track, total, max, "directory over budget, purged oldest segments");
        }

        self.known_directory_size = Some(total);
        Ok(self.current.is_some())
    }

    fn sorted_files(&self) -> Result<Vec<(SegmentFile, Timestamp)>, io::Error> {
        let files = match self.directory.files() {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Directory::open(self.directory.path())?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let mut files: Vec<(SegmentFile, Timestamp)> = files
            .into_iter()
            .map(|file| {
                let created = creation_time_from(file.name());
                (file, created)
            })
            .collect();
        files.sort_by(|(a, a_created), (b, b_created)| {
            a_created.cmp(b_created).then_with(|| a.name().cmp(b.name()))
        });
        Ok(files)
    }

    fn is_current(&self, name: &str) -> bool {
        self.current_segment_name() == Some(name)
    }

    fn delete_file(&mut self, file: &SegmentFile, created: Timestamp, reason: DeletionReason) -> bool {
        let size = file.size().unwrap_or(0);
        let existed = file.exists();
        if let Err(e) = file.delete() {
            error!(track = %self.track, segment = file.name(), error = %e, "failed to delete segment");
            return false;
        }
        if self.is_current(file.name()) {
            self.current = None;
        }
        if let Some(known) = self.known_directory_size.as_mut() {
            *known = known.saturating_sub(size);
        }
        if existed {
            self.metrics.record_deletion(reason);
            let age = self.clock.now().duration_since(created);
            debug!(
                track = %self.track,
                segment = file.name(),
                %reason,
                age_ms = age.as_millis() as u64,
                "deleted segment"
            );
        }
        true
    }

    fn add_known_size(&mut self, bytes: u64) {
        if let Some(known) = self.known_directory_size.as_mut() {
            *known += bytes;
        }
    }
}

/// Segment names are creation timestamps in milliseconds, zero-padded so
/// that lexical order equals chronological order.
pub fn segment_name_from(created: Timestamp) -> String {
    format!("{:020}", created.as_millis())
}

/// Creation time encoded in a segment name. Unparsable names map to the
/// epoch, so they are the first to expire.
pub fn creation_time_from(name: &str) -> Timestamp {
    Timestamp::from_millis(name.parse::<u64>().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::framed_len;
    use mini_spool_common::ManualClock;
    use tempfile::TempDir;

    const START_MS: u64 = 1_700_000_000_000;

    fn writable() -> WritableConditions {
        WritableConditions {
            max_file_size: 1_000,
            max_directory_size: 10_000,
            max_file_age_for_write: Duration::from_secs(10),
            max_objects_in_file: 5,
        }
    }

    fn readable() -> ReadableConditions {
        ReadableConditions {
            min_file_age_for_read: Duration::from_secs(11),
            max_file_age_for_read: Duration::from_secs(3_600),
        }
    }

    fn orchestrator_with(
        dir: &TempDir,
        writable: WritableConditions,
        readable: ReadableConditions,
    ) -> (FilesOrchestrator, ManualClock, Arc<PipelineMetrics>) {
        let clock = ManualClock::new(START_MS);
        let metrics = Arc::new(PipelineMetrics::new());
        let directory = Directory::open(&dir.path().join("logs")).unwrap();
        let orchestrator = FilesOrchestrator::new(
            directory,
            writable,
            readable,
            Arc::new(clock.clone()),
            metrics.clone(),
            "logs",
        );
        (orchestrator, clock, metrics)
    }

    fn orchestrator(dir: &TempDir) -> (FilesOrchestrator, ManualClock, Arc<PipelineMetrics>) {
        orchestrator_with(dir, writable(), readable())
    }

    fn write(orchestrator: &mut FilesOrchestrator, payload: &[u8]) -> String {
        let segment = orchestrator
            .get_writable_segment(framed_len(payload.len()))
            .unwrap();
        segment.append(payload).unwrap();
        segment.name().to_string()
    }

    fn directory_size(orchestrator: &FilesOrchestrator) -> u64 {
        orchestrator
            .directory()
            .files()
            .unwrap()
            .iter()
            .map(|f| f.size().unwrap())
            .sum()
    }

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    /// Orchestrator over `dir/<sub>` sharing `clock` and `metrics`.
    fn sibling(dir: &TempDir, sub: &str, clock: &ManualClock, metrics: &Arc<PipelineMetrics>) -> FilesOrchestrator {
        FilesOrchestrator::new(
            Directory::open(&dir.path().join(sub)).unwrap(),
            writable(),
            readable(),
            Arc::new(clock.clone()),
            metrics.clone(),
            sub,
        )
    }

    #[test]
    fn test_adopt_all_moves_every_segment_and_avoids_collisions() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START_MS);
        let metrics = Arc::new(PipelineMetrics::new());
        let mut pending = sibling(&dir, "pending", &clock, &metrics);
        let mut granted = sibling(&dir, "granted", &clock, &metrics);

        // Same creation time in both directories.
        let taken = write(&mut pending, b"pending-1");
        assert_eq!(write(&mut granted, b"granted-1"), taken);
        clock.advance(Duration::from_secs(11));
        write(&mut pending, b"pending-2");

        let moved = granted.adopt_all(&mut pending).unwrap();

        assert_eq!(moved, 2);
        assert!(pending.directory().files().unwrap().is_empty());
        assert!(pending.current_segment_name().is_none());
        let mut names: Vec<String> = granted
            .directory()
            .files()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], taken);
        assert_eq!(creation_time_from(&names[1]), Timestamp(START_MS + 1));
        assert_eq!(metrics.snapshot().segments_migrated, 2);
    }

    #[test]
    fn test_adopted_segments_count_towards_directory_budget() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(START_MS);
        let metrics = Arc::new(PipelineMetrics::new());
        let mut pending = sibling(&dir, "pending", &clock, &metrics);
        let mut granted = FilesOrchestrator::new(
            Directory::open(&dir.path().join("granted")).unwrap(),
            WritableConditions {
                max_directory_size: 2_000,
                ..writable()
            },
            readable(),
            Arc::new(clock.clone()),
            metrics.clone(),
            "granted",
        );

        write(&mut granted, &[0u8; 900]);
        for _ in 0..2 {
            clock.advance(Duration::from_secs(11));
            write(&mut pending, &[0u8; 900]);
        }
        granted.adopt_all(&mut pending).unwrap();

        clock.advance(Duration::from_secs(11));
        write(&mut granted, &[0u8; 100]);
        assert!(directory_size(&granted) <= 2_000);
        assert!(metrics.snapshot().deleted_purged >= 1);
    }

    #[test]
    fn test_delete_all_removes_current_segment_too() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, metrics) = orchestrator(&dir);
        write(&mut orch, b"a");
        clock.advance(Duration::from_secs(11));
        write(&mut orch, b"b");

        assert_eq!(orch.delete_all(DeletionReason::Unauthorized), 2);
        assert!(orch.directory().files().unwrap().is_empty());
        assert!(orch.current_segment_name().is_none());
        assert_eq!(metrics.snapshot().deleted_unauthorized, 2);
    }

    #[test]
    fn test_segment_name_roundtrip_and_ordering() {
        let a = segment_name_from(Timestamp(999));
        let b = segment_name_from(Timestamp(1_000));
        assert_eq!(a.len(), 20);
        assert!(a < b);
        assert_eq!(creation_time_from(&b), Timestamp(1_000));
        assert_eq!(creation_time_from("not-a-timestamp"), Timestamp::ZERO);
    }

    #[test]
    fn test_writes_within_bounds_share_one_segment() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        let first = write(&mut orch, b"a");
        clock.advance(Duration::from_secs(3));
        let second = write(&mut orch, b"b");
        clock.advance(Duration::from_secs(3));
        let third = write(&mut orch, b"c");

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(orch.directory().files().unwrap().len(), 1);
    }

    #[test]
    fn test_rotation_on_size() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);

        let payload = vec![0u8; 400];
        let first = write(&mut orch, &payload);
        let second = write(&mut orch, &payload);
        // 2 × 409 bytes on disk; a third would exceed 1000.
        let third = write(&mut orch, &payload);

        assert_eq!(first, second);
        assert_ne!(second, third);
        assert_eq!(orch.current_segment_name(), Some(third.as_str()));
    }

    #[test]
    fn test_rotation_on_age() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        let first = write(&mut orch, b"a");
        clock.advance(Duration::from_secs(10));
        let at_limit = write(&mut orch, b"b");
        clock.advance(Duration::from_millis(1));
        let past_limit = write(&mut orch, b"c");

        assert_eq!(first, at_limit);
        assert_ne!(first, past_limit);
    }

    #[test]
    fn test_rotation_on_uses() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, metrics) = orchestrator(&dir);

        let names: Vec<String> = (0..6).map(|_| write(&mut orch, b"x")).collect();
        assert!(names[..5].iter().all(|n| n == &names[0]));
        assert_ne!(names[5], names[0]);

        let summary = metrics.snapshot();
        assert_eq!(summary.segments_created, 2);
        assert_eq!(summary.segments_closed, 1);
    }

    #[test]
    fn test_new_segment_when_current_was_deleted() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);

        let first = write(&mut orch, b"a");
        orch.directory().file(&first).delete().unwrap();
        let second = write(&mut orch, b"b");

        assert_ne!(first, second);
    }

    #[test]
    fn test_new_segment_names_are_unique_within_same_millisecond() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);

        let a = orch.get_new_writable_segment(10).unwrap().name().to_string();
        let b = orch.get_new_writable_segment(10).unwrap().name().to_string();
        let c = orch.get_new_writable_segment(10).unwrap().name().to_string();

        assert!(a < b && b < c);
        assert_eq!(orch.directory().files().unwrap().len(), 3);
    }

    #[test]
    fn test_name_collision_with_another_instance() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);
        // Another process already claimed this millisecond.
        orch.directory()
            .create_file(&segment_name_from(Timestamp(START_MS)))
            .unwrap();

        let name = write(&mut orch, b"mine");
        assert_eq!(name, segment_name_from(Timestamp(START_MS + 1)));
    }

    #[test]
    fn test_record_larger_than_segment_is_refused() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);

        let result = orch.get_writable_segment(1_001);
        assert!(matches!(result, Err(SpoolError::RecordTooLarge { .. })));
        assert!(orch.directory().files().unwrap().is_empty());
    }

    #[test]
    fn test_directory_size_bound_purges_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut conditions = writable();
        conditions.max_directory_size = 2_500;
        conditions.max_objects_in_file = 1;
        let (mut orch, clock, metrics) = orchestrator_with(&dir, conditions, readable());

        let payload = vec![7u8; 491]; // 500 bytes framed
        let mut names = Vec::new();
        for _ in 0..8 {
            names.push(write(&mut orch, &payload));
            clock.advance(Duration::from_millis(5));
            assert!(directory_size(&orch) <= 2_500);
        }

        let mut remaining: Vec<String> = orch
            .directory()
            .files()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining, names[3..].to_vec());
        assert_eq!(metrics.snapshot().deleted_purged, 3);
    }

    #[test]
    fn test_directory_bound_holds_while_reusing_current() {
        let dir = TempDir::new().unwrap();
        let mut conditions = writable();
        conditions.max_file_size = 1_000;
        conditions.max_directory_size = 1_500;
        conditions.max_objects_in_file = 100;
        let (mut orch, clock, _) = orchestrator_with(&dir, conditions, readable());

        for _ in 0..20 {
            write(&mut orch, &[1u8; 91]); // 100 bytes framed
            clock.advance(Duration::from_millis(1));
            assert!(directory_size(&orch) <= 1_500);
        }
    }

    #[test]
    fn test_segment_not_readable_before_min_age() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        write(&mut orch, b"a");
        orch.retire_current();

        clock.advance(Duration::from_secs(10));
        assert!(orch.get_readable_segment(&none()).is_none());

        clock.advance(Duration::from_secs(1));
        assert!(orch.get_readable_segment(&none()).is_some());
    }

    #[test]
    fn test_current_segment_is_never_readable() {
        let dir = TempDir::new().unwrap();
        let mut conditions = readable();
        conditions.min_file_age_for_read = Duration::ZERO;
        let (mut orch, _, _) = orchestrator_with(&dir, writable(), conditions);

        write(&mut orch, b"a");
        assert!(orch.get_readable_segment(&none()).is_none());
        assert!(orch.get_readable_segment_ignoring_age(&none()).is_none());
    }

    #[test]
    fn test_current_segment_retires_after_write_window() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        let name = write(&mut orch, b"a");
        clock.advance(Duration::from_secs(11));

        let readable = orch.get_readable_segment(&none()).unwrap();
        assert_eq!(readable.name(), name);
        assert_eq!(orch.current_segment_name(), None);

        // The next write starts a fresh segment.
        assert_ne!(write(&mut orch, b"b"), name);
    }

    #[test]
    fn test_obsolete_segments_are_deleted_without_read() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, metrics) = orchestrator(&dir);

        write(&mut orch, b"old");
        orch.retire_current();
        clock.advance(Duration::from_secs(3_601));

        assert!(orch.get_readable_segment(&none()).is_none());
        assert!(orch.directory().files().unwrap().is_empty());
        assert_eq!(metrics.snapshot().deleted_obsolete, 1);
    }

    #[test]
    fn test_readable_segments_in_fifo_order() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        let mut created = Vec::new();
        for i in 0..4u8 {
            let segment = orch.get_new_writable_segment(10).unwrap();
            segment.append(&[i]).unwrap();
            created.push(segment.name().to_string());
            clock.advance(Duration::from_secs(1));
        }
        orch.retire_current();
        clock.advance(Duration::from_secs(20));

        let mut read = Vec::new();
        while let Some(segment) = orch.get_readable_segment(&none()) {
            read.push(segment.name().to_string());
            orch.delete(&segment, DeletionReason::Delivered { status: 202 });
        }
        assert_eq!(read, created);
    }

    #[test]
    fn test_excluded_segments_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, _) = orchestrator(&dir);

        let first = orch.get_new_writable_segment(10).unwrap().name().to_string();
        clock.advance(Duration::from_secs(1));
        let second = orch.get_new_writable_segment(10).unwrap().name().to_string();
        orch.retire_current();
        clock.advance(Duration::from_secs(20));

        let excluding: HashSet<String> = [first.clone()].into_iter().collect();
        assert_eq!(orch.get_readable_segment(&excluding).unwrap().name(), second);
        assert_eq!(orch.get_readable_segment(&none()).unwrap().name(), first);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut orch, clock, metrics) = orchestrator(&dir);

        write(&mut orch, b"a");
        orch.retire_current();
        clock.advance(Duration::from_secs(20));

        let segment = orch.get_readable_segment(&none()).unwrap();
        orch.delete(&segment, DeletionReason::Delivered { status: 202 });
        orch.delete(&segment, DeletionReason::Delivered { status: 202 });

        assert!(orch.get_readable_segment(&none()).is_none());
        assert_eq!(metrics.snapshot().deleted_delivered, 1);
    }

    #[test]
    fn test_directory_removed_externally_is_recreated() {
        let dir = TempDir::new().unwrap();
        let (mut orch, _, _) = orchestrator(&dir);

        write(&mut orch, b"a");
        std::fs::remove_dir_all(orch.directory().path()).unwrap();

        write(&mut orch, b"b");
        assert_eq!(orch.directory().files().unwrap().len(), 1);
    }
}
