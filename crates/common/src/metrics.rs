use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::DeletionReason;

/// Counters shared by the orchestrator, writer, reader and upload worker of
/// one feature. Cheap to update from any thread.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_written: AtomicU64,
    bytes_written: AtomicU64,
    dropped_oversize: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_no_consent: AtomicU64,
    write_failures: AtomicU64,
    segments_created: AtomicU64,
    segments_closed: AtomicU64,
    segments_migrated: AtomicU64,
    deleted_delivered: AtomicU64,
    deleted_rejected: AtomicU64,
    deleted_obsolete: AtomicU64,
    deleted_purged: AtomicU64,
    deleted_invalid: AtomicU64,
    deleted_flushed: AtomicU64,
    deleted_unauthorized: AtomicU64,
    upload_attempts: AtomicU64,
    upload_retries: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub events_written: u64,
    pub bytes_written: u64,
    pub dropped_oversize: u64,
    pub dropped_overflow: u64,
    pub dropped_no_consent: u64,
    pub write_failures: u64,
    pub segments_created: u64,
    pub segments_closed: u64,
    pub segments_migrated: u64,
    pub deleted_delivered: u64,
    pub deleted_rejected: u64,
    pub deleted_obsolete: u64,
    pub deleted_purged: u64,
    pub deleted_invalid: u64,
    pub deleted_flushed: u64,
    pub deleted_unauthorized: u64,
    pub upload_attempts: u64,
    pub upload_retries: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: u64) {
        self.events_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dropped_oversize(&self) {
        self.dropped_oversize.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_overflow(&self) {
        self.dropped_overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Event written while tracking consent was not granted.
    pub fn record_dropped_no_consent(&self) {
        self.dropped_no_consent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_created(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_closed(&self) {
        self.segments_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segments_migrated(&self, count: u64) {
        self.segments_migrated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_upload_attempt(&self, retry: bool) {
        self.upload_attempts.fetch_add(1, Ordering::Relaxed);
        if retry {
            self.upload_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deletion(&self, reason: DeletionReason) {
        let counter = match reason {
            DeletionReason::Delivered { .. } => &self.deleted_delivered,
            DeletionReason::Rejected { .. } => &self.deleted_rejected,
            DeletionReason::Obsolete => &self.deleted_obsolete,
            DeletionReason::Purged => &self.deleted_purged,
            DeletionReason::Invalid => &self.deleted_invalid,
            DeletionReason::Flushed => &self.deleted_flushed,
            DeletionReason::Unauthorized => &self.deleted_unauthorized,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            events_written: load(&self.events_written),
            bytes_written: load(&self.bytes_written),
            dropped_oversize: load(&self.dropped_oversize),
            dropped_overflow: load(&self.dropped_overflow),
            dropped_no_consent: load(&self.dropped_no_consent),
            write_failures: load(&self.write_failures),
            segments_created: load(&self.segments_created),
            segments_closed: load(&self.segments_closed),
            segments_migrated: load(&self.segments_migrated),
            deleted_delivered: load(&self.deleted_delivered),
            deleted_rejected: load(&self.deleted_rejected),
            deleted_obsolete: load(&self.deleted_obsolete),
            deleted_purged: load(&self.deleted_purged),
            deleted_invalid: load(&self.deleted_invalid),
            deleted_flushed: load(&self.deleted_flushed),
            deleted_unauthorized: load(&self.deleted_unauthorized),
            upload_attempts: load(&self.upload_attempts),
            upload_retries: load(&self.upload_retries),
        }
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  events written:     {} ({} bytes)", self.events_written, self.bytes_written)?;
        writeln!(
            f,
            "  events dropped:     {} oversize, {} overflow, {} without consent, {} write failures",
            self.dropped_oversize, self.dropped_overflow, self.dropped_no_consent, self.write_failures
        )?;
        writeln!(
            f,
            "  segments:           {} created, {} closed, {} migrated",
            self.segments_created, self.segments_closed, self.segments_migrated
        )?;
        writeln!(
            f,
            "  segments deleted:   {} delivered, {} rejected, {} obsolete, {} purged, {} invalid, {} flushed, {} unauthorized",
            self.deleted_delivered,
            self.deleted_rejected,
            self.deleted_obsolete,
            self.deleted_purged,
            self.deleted_invalid,
            self.deleted_flushed,
            self.deleted_unauthorized
        )?;
        write!(
            f,
            "  upload attempts:    {} ({} retries)",
            self.upload_attempts, self.upload_retries
        )
    }
}
