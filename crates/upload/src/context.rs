use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use mini_spool_common::{Clock, DataUploader, MetricsSummary, SpoolError, UploadConditions};
use mini_spool_storage::{ConsentProvider, FeatureStorage, PerformancePreset, TrackingConsent};
use serde::Serialize;
use tracing::info;

use crate::delay::UploadDelay;
use crate::payload::PayloadFormat;
use crate::worker::{DataUploadWorker, UploadLoop};

/// Everything needed to register one feature.
pub struct FeatureSpec {
    /// Directory name under the core root; also the log field `feature`.
    pub name: String,
    pub uploader: Arc<dyn DataUploader>,
    pub conditions: Arc<dyn UploadConditions>,
    pub payload_format: PayloadFormat,
    /// Replaces the core preset for this feature.
    pub preset: Option<PerformancePreset>,
}

/// Owns the storage root. Each registered feature gets its own directory,
/// orchestrators, writer, reader and upload loop; all of them follow one
/// tracking consent.
pub struct SpoolCore {
    root: PathBuf,
    preset: PerformancePreset,
    clock: Arc<dyn Clock>,
    consent: Arc<ConsentProvider>,
    registered: Arc<Mutex<HashSet<String>>>,
}

impl SpoolCore {
    pub fn new(root: &Path, preset: PerformancePreset, clock: Arc<dyn Clock>) -> Result<Self, SpoolError> {
        Self::with_tracking_consent(root, preset, clock, TrackingConsent::Granted)
    }

    pub fn with_tracking_consent(
        root: &Path,
        preset: PerformancePreset,
        clock: Arc<dyn Clock>,
        consent: TrackingConsent,
    ) -> Result<Self, SpoolError> {
        preset.validate()?;
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            preset,
            clock,
            consent: Arc::new(ConsentProvider::new(consent)),
            registered: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn tracking_consent(&self) -> TrackingConsent {
        self.consent.consent()
    }

    /// Apply `consent` to every registered feature. Data collected while
    /// pending is moved to upload on grant and discarded on refusal.
    pub fn set_tracking_consent(&self, consent: TrackingConsent) {
        self.consent.change_consent(consent);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn preset(&self) -> &PerformancePreset {
        &self.preset
    }

    /// Open `root/<name>/` and start its upload loop. Must be called from
    /// within a tokio runtime.
    pub fn register_feature(&self, feature: FeatureSpec) -> Result<FeatureHandle, SpoolError> {
        validate_feature_name(&feature.name)?;
        {
            let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
            if !registered.insert(feature.name.clone()) {
                return Err(SpoolError::InvalidConfig(format!(
                    "feature {} is already registered",
                    feature.name
                )));
            }
        }

        match self.start_feature(&feature) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.registered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&feature.name);
                Err(e)
            }
        }
    }

    fn start_feature(&self, feature: &FeatureSpec) -> Result<FeatureHandle, SpoolError> {
        let preset = feature.preset.clone().unwrap_or_else(|| self.preset.clone());
        let storage = Arc::new(FeatureStorage::open_with_consent(
            &self.root.join(&feature.name),
            feature.name.clone(),
            &preset,
            self.clock.clone(),
            &self.consent,
        )?);

        let worker = Arc::new(DataUploadWorker::new(
            storage.clone(),
            feature.uploader.clone(),
            feature.conditions.clone(),
            feature.payload_format.clone(),
            UploadDelay::from_preset(&preset),
            preset.max_batches_per_upload,
            self.clock.clone(),
        )
        .with_upload_timeout(preset.upload_timeout));
        let upload_loop = worker.clone().spawn();

        info!(feature = %feature.name, "feature registered");
        Ok(FeatureHandle {
            name: feature.name.clone(),
            storage,
            worker,
            upload_loop: Some(upload_loop),
            registered: self.registered.clone(),
        })
    }
}

fn validate_feature_name(name: &str) -> Result<(), SpoolError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(SpoolError::InvalidConfig(format!("invalid feature name {name:?}")))
    }
}

/// Producer-facing handle of one registered feature.
pub struct FeatureHandle {
    name: String,
    storage: Arc<FeatureStorage>,
    worker: Arc<DataUploadWorker>,
    upload_loop: Option<UploadLoop>,
    registered: Arc<Mutex<HashSet<String>>>,
}

impl FeatureHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget. Never blocks on I/O and never fails.
    pub fn write<T: Serialize + ?Sized>(&self, event: &T) {
        self.storage.writer().write(event);
    }

    pub fn write_bytes(&self, payload: Vec<u8>) {
        self.storage.writer().write_bytes(payload);
    }

    /// Drain pending writes and upload everything on disk now. Returns the
    /// number of batches flushed.
    pub async fn flush(&self) -> usize {
        self.worker.flush_synchronously().await
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.storage.metrics()
    }

    pub fn worker(&self) -> &Arc<DataUploadWorker> {
        &self.worker
    }

    /// Stop the upload loop, then drain and stop the writer. Data not yet
    /// uploaded stays on disk for the next start.
    pub async fn shutdown(mut self) {
        if let Some(upload_loop) = self.upload_loop.take() {
            upload_loop.cancel().await;
        }
        self.storage.shutdown();
        info!(feature = %self.name, "feature stopped");
    }
}

impl Drop for FeatureHandle {
    fn drop(&mut self) {
        if let Some(upload_loop) = &self.upload_loop {
            upload_loop.stop();
        }
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mini_spool_common::{AlwaysUpload, ManualClock, UploadContext, UploadStatus};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl DataUploader for Recording {
        async fn upload(&self, payload: &[u8], _context: &UploadContext) -> Result<UploadStatus, SpoolError> {
            self.payloads.lock().unwrap().push(payload.to_vec());
            Ok(UploadStatus::from_response(202, None))
        }
    }

    fn feature_spec(name: &str, uploader: Arc<Recording>) -> FeatureSpec {
        FeatureSpec {
            name: name.to_string(),
            uploader,
            conditions: Arc::new(AlwaysUpload),
            payload_format: PayloadFormat::newline_delimited(),
            preset: None,
        }
    }

    #[tokio::test]
    async fn test_features_use_independent_directories() {
        let dir = TempDir::new().unwrap();
        let core = SpoolCore::new(dir.path(), PerformancePreset::default(), Arc::new(ManualClock::new(0))).unwrap();
        let logs_uploader = Arc::new(Recording::default());
        let rum_uploader = Arc::new(Recording::default());

        let logs = core.register_feature(feature_spec("logs", logs_uploader.clone())).unwrap();
        let rum = core.register_feature(feature_spec("rum", rum_uploader.clone())).unwrap();

        logs.write(&"log line");
        rum.write(&"view");
        rum.write(&"action");
        assert_eq!(logs.flush().await, 1);
        assert_eq!(rum.flush().await, 1);

        assert_eq!(*logs_uploader.payloads.lock().unwrap(), vec![br#""log line""#.to_vec()]);
        assert_eq!(*rum_uploader.payloads.lock().unwrap(), vec![b"\"view\"\n\"action\"".to_vec()]);
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("rum").is_dir());

        logs.shutdown().await;
        rum.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_feature_is_rejected_until_released() {
        let dir = TempDir::new().unwrap();
        let core = SpoolCore::new(dir.path(), PerformancePreset::default(), Arc::new(ManualClock::new(0))).unwrap();

        let first = core.register_feature(feature_spec("logs", Arc::new(Recording::default()))).unwrap();
        let second = core.register_feature(feature_spec("logs", Arc::new(Recording::default())));
        assert!(matches!(second, Err(SpoolError::InvalidConfig(_))));

        first.shutdown().await;
        assert!(core.register_feature(feature_spec("logs", Arc::new(Recording::default()))).is_ok());
    }

    #[tokio::test]
    async fn test_consent_change_applies_to_every_feature() {
        let dir = TempDir::new().unwrap();
        let core = SpoolCore::with_tracking_consent(
            dir.path(),
            PerformancePreset::default(),
            Arc::new(ManualClock::new(0)),
            TrackingConsent::Pending,
        )
        .unwrap();
        let logs_uploader = Arc::new(Recording::default());
        let rum_uploader = Arc::new(Recording::default());
        let logs = core.register_feature(feature_spec("logs", logs_uploader.clone())).unwrap();
        let rum = core.register_feature(feature_spec("rum", rum_uploader.clone())).unwrap();

        logs.write(&"before consent");
        rum.write(&"before consent");
        assert_eq!(logs.flush().await, 0);
        assert_eq!(rum.flush().await, 0);

        core.set_tracking_consent(TrackingConsent::Granted);
        assert_eq!(core.tracking_consent(), TrackingConsent::Granted);
        assert_eq!(logs.flush().await, 1);
        assert_eq!(*logs_uploader.payloads.lock().unwrap(), vec![br#""before consent""#.to_vec()]);

        core.set_tracking_consent(TrackingConsent::NotGranted);
        rum.write(&"refused");
        assert_eq!(rum.flush().await, 1);
        assert_eq!(*rum_uploader.payloads.lock().unwrap(), vec![br#""before consent""#.to_vec()]);
        assert_eq!(rum.metrics().dropped_no_consent, 1);

        logs.shutdown().await;
        rum.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_feature_names() {
        let dir = TempDir::new().unwrap();
        let core = SpoolCore::new(dir.path(), PerformancePreset::default(), Arc::new(ManualClock::new(0))).unwrap();
        for name in ["", "..", "a/b", "logs\\rum"] {
            assert!(core.register_feature(feature_spec(name, Arc::new(Recording::default()))).is_err(), "{name}");
        }
    }
}
