use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mini_spool_common::{
    Clock, DataUploader, DeletionReason, PipelineMetrics, SpoolError, UploadConditions, UploadContext,
    UploadError, UploadOutcome, UploadStatus,
};
use mini_spool_storage::{Batch, FeatureStorage};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delay::UploadDelay;
use crate::payload::PayloadFormat;

/// What one cycle ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Upload conditions disallowed the cycle; nothing was read.
    Blocked,
    /// No readable batch.
    NoBatch,
    Delivered,
    /// Recoverable failure; the batch stays on disk.
    Retry,
    /// Terminal refusal; the batch was deleted.
    Rejected,
    /// The request could not be built; the batch was deleted.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Batches attempted in this cycle.
    pub batches: usize,
    pub outcome: CycleOutcome,
    /// Delay before the next cycle.
    pub next_delay: Duration,
}

/// Assumed when the caller does not set one.
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

struct WorkerState {
    delay: UploadDelay,
    /// Segment of the last recoverable failure and the attempts it has had.
    /// Batches are read oldest first, so only that segment can come back.
    last_retry: Option<(String, u32)>,
}

/// Reads batches of one feature and delivers them.
///
/// Cycles, flushes and the background loop all serialize on one internal
/// lock, so at most one upload is in flight.
pub struct DataUploadWorker {
    feature: String,
    storage: Arc<FeatureStorage>,
    uploader: Arc<dyn DataUploader>,
    conditions: Arc<dyn UploadConditions>,
    format: PayloadFormat,
    clock: Arc<dyn Clock>,
    metrics: Arc<PipelineMetrics>,
    max_batches_per_upload: usize,
    upload_timeout: Duration,
    state: Mutex<WorkerState>,
}

impl DataUploadWorker {
    pub fn new(
        storage: Arc<FeatureStorage>,
        uploader: Arc<dyn DataUploader>,
        conditions: Arc<dyn UploadConditions>,
        format: PayloadFormat,
        delay: UploadDelay,
        max_batches_per_upload: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feature: storage.name().to_string(),
            metrics: storage.shared_metrics(),
            storage,
            uploader,
            conditions,
            format,
            clock,
            max_batches_per_upload: max_batches_per_upload.max(1),
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            state: Mutex::new(WorkerState {
                delay,
                last_retry: None,
            }),
        }
    }

    /// Give up on an upload after `timeout` and treat it as a network error.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.delay.current()
    }

    /// One pass of the upload loop: check conditions, then upload batches
    /// back-to-back while they succeed, up to `max_batches_per_upload`.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut state = self.state.lock().await;

        let blockers = self.conditions.blockers();
        if !blockers.is_empty() {
            let reasons: Vec<String> = blockers.iter().map(|b| b.to_string()).collect();
            debug!(feature = %self.feature, blockers = %reasons.join(", "), "upload skipped");
            state.delay.increase();
            return CycleReport {
                batches: 0,
                outcome: CycleOutcome::Blocked,
                next_delay: state.delay.current(),
            };
        }

        let in_flight = HashSet::new();
        let mut batches = 0;
        let mut outcome = CycleOutcome::NoBatch;
        while batches < self.max_batches_per_upload {
            let batch = match self.storage.reader().read_next_batch(&in_flight) {
                Some(batch) => batch,
                None => break,
            };
            batches += 1;
            outcome = self.upload_batch(&mut state, batch).await;
            if outcome == CycleOutcome::Delivered {
                state.delay.decrease();
            } else {
                state.delay.increase();
                break;
            }
        }
        if batches == 0 {
            // A segment still awaiting retry would have been read first.
            state.last_retry = None;
            state.delay.increase();
        }

        CycleReport {
            batches,
            outcome,
            next_delay: state.delay.current(),
        }
    }

    async fn upload_batch(&self, state: &mut WorkerState, batch: Batch) -> CycleOutcome {
        let name = batch.name().to_string();
        let attempt = match &state.last_retry {
            Some((retried, attempts)) if *retried == name => attempts + 1,
            _ => 1,
        };
        state.last_retry = None;

        let status = match self.attempt(&batch, attempt).await {
            Ok(status) => status,
            Err(e) => {
                error!(feature = %self.feature, segment = %name, error = %e, "failed to initiate upload, dropping batch");
                self.storage.reader().mark_as_read(batch, DeletionReason::Invalid);
                return CycleOutcome::Invalid;
            }
        };

        let description = status.user_debug_description();
        match status.outcome() {
            UploadOutcome::Delivered => {
                info!(feature = %self.feature, segment = %name, attempt, "accepted, won't be retransmitted: {description}");
                let code = status.response_code.unwrap_or(200);
                self.storage
                    .reader()
                    .mark_as_read(batch, DeletionReason::Delivered { status: code });
                CycleOutcome::Delivered
            }
            UploadOutcome::Retry => {
                warn!(feature = %self.feature, segment = %name, attempt, "not delivered, will be retransmitted: {description}");
                state.last_retry = Some((name, attempt));
                CycleOutcome::Retry
            }
            UploadOutcome::Rejected => {
                if status.error == Some(UploadError::Unauthorized) {
                    error!(feature = %self.feature, "intake rejected the API key, check the client token: {description}");
                } else {
                    warn!(feature = %self.feature, segment = %name, attempt, "not delivered, won't be retransmitted: {description}");
                }
                self.storage.reader().mark_as_read(
                    batch,
                    DeletionReason::Rejected {
                        status: status.response_code,
                    },
                );
                CycleOutcome::Rejected
            }
        }
    }

    async fn attempt(&self, batch: &Batch, attempt: u32) -> Result<UploadStatus, SpoolError> {
        let payload = self.format.join(batch.events());
        let context = UploadContext {
            feature: self.feature.clone(),
            request_id: Uuid::new_v4().to_string(),
            attempt,
            events: batch.len(),
            batch_age: self.clock.now().duration_since(batch.created()),
        };
        self.metrics.record_upload_attempt(attempt > 1);
        debug!(
            feature = %self.feature,
            segment = batch.name(),
            events = context.events,
            bytes = payload.len(),
            request_id = %context.request_id,
            "uploading batch"
        );
        let status = match tokio::time::timeout(self.upload_timeout, self.uploader.upload(&payload, &context)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    feature = %self.feature,
                    segment = batch.name(),
                    timeout_ms = self.upload_timeout.as_millis() as u64,
                    "upload timed out"
                );
                UploadStatus::from_network_error(format!("no response within {:?}", self.upload_timeout))
            }
        };
        Ok(status.with_attempt(attempt))
    }

    /// Upload everything on disk now, regardless of age and upload
    /// conditions. Each batch gets one retry and is deleted afterwards
    /// whatever the outcome. Returns the number of batches flushed.
    pub async fn flush_synchronously(&self) -> usize {
        self.storage.flush().await;
        let mut state = self.state.lock().await;
        state.last_retry = None;

        let mut seen = HashSet::new();
        let mut flushed = 0;
        while let Some(batch) = self.storage.reader().read_next_batch_ignoring_age(&seen) {
            seen.insert(batch.name().to_string());
            for attempt in 1..=2 {
                match self.attempt(&batch, attempt).await {
                    Ok(status) if !status.needs_retry => break,
                    Ok(status) => {
                        debug!(feature = %self.feature, attempt, "flush upload failed: {}", status.user_debug_description());
                    }
                    Err(e) => {
                        debug!(feature = %self.feature, attempt, error = %e, "flush upload could not be initiated");
                        break;
                    }
                }
            }
            self.storage.reader().mark_as_read(batch, DeletionReason::Flushed);
            flushed += 1;
        }
        info!(feature = %self.feature, batches = flushed, "flushed");
        flushed
    }

    /// Run the upload loop on the current runtime until cancelled.
    pub fn spawn(self: Arc<Self>) -> UploadLoop {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = worker.current_delay().await;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                // Dropping the cycle abandons its upload; the batch stays on disk.
                let report = tokio::select! {
                    _ = token.cancelled() => break,
                    report = worker.run_cycle() => report,
                };
                debug!(
                    feature = %worker.feature,
                    outcome = ?report.outcome,
                    batches = report.batches,
                    next_delay_ms = report.next_delay.as_millis() as u64,
                    "upload cycle finished"
                );
            }
            debug!(feature = %worker.feature, "upload loop stopped");
        });
        UploadLoop {
            worker: self,
            cancel,
            task,
        }
    }
}

/// Handle to a running upload loop.
pub struct UploadLoop {
    worker: Arc<DataUploadWorker>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UploadLoop {
    pub fn worker(&self) -> &Arc<DataUploadWorker> {
        &self.worker
    }

    /// Stop scheduling without waiting for the loop to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for it to exit. An upload in flight is
    /// abandoned and its batch retried by the next run.
    pub async fn cancel(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(feature = %self.worker.feature, error = %e, "upload loop panicked");
        }
    }
}
