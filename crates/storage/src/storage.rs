use std::path::Path;
use std::sync::{Arc, Mutex};

use mini_spool_common::{Clock, DeletionReason, MetricsSummary, PipelineMetrics, SpoolError};
use mini_spool_segment::{Directory, FilesOrchestrator};
use tracing::info;

use crate::config::PerformancePreset;
use crate::consent::{ConsentProvider, TrackingConsent, GRANTED_DIR, PENDING_DIR};
use crate::lock;
use crate::reader::BatchReader;
use crate::writer::{BatchWriter, WriteTargets};

/// Writer, reader and orchestrators of one feature.
///
/// Events land in `<path>/granted` or `<path>/pending` depending on the
/// tracking consent; only `granted` is ever read for upload.
pub struct FeatureStorage {
    name: String,
    granted: Arc<Mutex<FilesOrchestrator>>,
    writer: BatchWriter,
    reader: BatchReader,
    metrics: Arc<PipelineMetrics>,
}

impl FeatureStorage {
    /// Open the feature directory at `path` with consent granted.
    pub fn open(
        path: &Path,
        name: impl Into<String>,
        preset: &PerformancePreset,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SpoolError> {
        Self::open_with_consent(path, name, preset, clock, &ConsentProvider::default())
    }

    /// Open the feature directory at `path`, creating it if needed, and
    /// follow `consent` from now on.
    pub fn open_with_consent(
        path: &Path,
        name: impl Into<String>,
        preset: &PerformancePreset,
        clock: Arc<dyn Clock>,
        consent: &ConsentProvider,
    ) -> Result<Self, SpoolError> {
        preset.validate()?;
        let name = name.into();
        let metrics = Arc::new(PipelineMetrics::new());
        let orchestrator = |dir: &str| -> Result<Arc<Mutex<FilesOrchestrator>>, SpoolError> {
            Ok(Arc::new(Mutex::new(FilesOrchestrator::new(
                Directory::open(&path.join(dir))?,
                preset.writable_conditions(),
                preset.readable_conditions(),
                clock.clone(),
                metrics.clone(),
                name.clone(),
            ))))
        };
        let granted = orchestrator(GRANTED_DIR)?;
        let pending = orchestrator(PENDING_DIR)?;

        // Whatever the previous run left pending was never authorized.
        let wiped = lock(&pending).delete_all(DeletionReason::Unauthorized);
        if wiped > 0 {
            info!(track = %name, segments = wiped, "discarded data left pending by a previous run");
        }

        let initial = consent.consent();
        let writer = BatchWriter::spawn(
            WriteTargets {
                granted: granted.clone(),
                pending,
            },
            initial,
            preset.max_object_size,
            preset.write_queue_capacity,
            metrics.clone(),
            name.clone(),
        )?;
        let observer = writer.consent_observer();
        let current = consent.subscribe(Arc::downgrade(&observer));
        if current != initial {
            observer.consent_changed(initial, current);
        }
        let reader = BatchReader::new(granted.clone(), preset.max_object_size, name.clone());

        info!(track = %name, path = %path.display(), consent = ?current, "feature storage opened");
        Ok(Self {
            name,
            granted,
            writer,
            reader,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn reader(&self) -> &BatchReader {
        &self.reader
    }

    pub fn consent(&self) -> TrackingConsent {
        self.writer.consent()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.snapshot()
    }

    pub fn shared_metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Wait for pending writes, then close the current segment so every
    /// event written so far is readable.
    pub async fn flush(&self) {
        self.writer.flush().await;
        lock(&self.granted).retire_current();
    }

    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}
