use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use mini_spool_common::{DeletionReason, PipelineMetrics, SpoolError};
use mini_spool_segment::{framed_len, FilesOrchestrator};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::consent::{ConsentObserver, Migration, TrackingConsent};
use crate::lock;

/// Orchestrators a writer routes events to.
#[derive(Clone)]
pub struct WriteTargets {
    pub granted: Arc<Mutex<FilesOrchestrator>>,
    pub pending: Arc<Mutex<FilesOrchestrator>>,
}

/// An accepted event and the consent it was written under.
struct Event {
    consent: TrackingConsent,
    payload: Vec<u8>,
}

enum Control {
    Flush(oneshot::Sender<()>),
    Migrate(Migration),
    Shutdown,
}

struct Shared {
    events: ArrayQueue<Event>,
    /// Coalesced "events available" signal.
    wake: Sender<()>,
    control: Sender<Control>,
    /// Held while enqueueing, so an event tagged with the old consent is
    /// always queued before the migration for the new one.
    consent: Mutex<TrackingConsent>,
    closed: AtomicBool,
    track: String,
}

impl ConsentObserver for Shared {
    fn consent_changed(&self, previous: TrackingConsent, current: TrackingConsent) {
        let mut consent = lock(&self.consent);
        *consent = current;
        if let Some(migration) = Migration::between(previous, current) {
            if self.control.send(Control::Migrate(migration)).is_err() {
                warn!(track = %self.track, ?migration, "writer stopped, migration skipped");
            }
        }
    }
}

/// Fire-and-forget event writer for one feature.
///
/// Producers serialize on their own thread and enqueue the bytes; a single
/// background thread appends them in submission order. The queue is bounded:
/// when full, the oldest pending event is dropped. Events are routed by the
/// tracking consent in effect when they were written.
pub struct BatchWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_object_size: u64,
    metrics: Arc<PipelineMetrics>,
}

impl BatchWriter {
    pub fn spawn(
        targets: WriteTargets,
        consent: TrackingConsent,
        max_object_size: u64,
        capacity: usize,
        metrics: Arc<PipelineMetrics>,
        track: impl Into<String>,
    ) -> Result<Self, SpoolError> {
        let track = track.into();
        let (wake, wake_rx) = channel::bounded(1);
        let (control, control_rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            events: ArrayQueue::new(capacity.max(1)),
            wake,
            control,
            consent: Mutex::new(consent),
            closed: AtomicBool::new(false),
            track: track.clone(),
        });

        let worker = {
            let context = WriterThread {
                shared: shared.clone(),
                targets,
                metrics: metrics.clone(),
                track: track.clone(),
            };
            thread::Builder::new()
                .name(format!("spool-writer-{track}"))
                .spawn(move || context.run(wake_rx, control_rx))?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            max_object_size,
            metrics,
        })
    }

    /// Subscribe with `ConsentProvider::subscribe` to follow consent changes.
    pub fn consent_observer(&self) -> Arc<dyn ConsentObserver> {
        self.shared.clone()
    }

    pub fn consent(&self) -> TrackingConsent {
        *lock(&self.shared.consent)
    }

    /// Serialize `event` as JSON and enqueue it. Never fails; problems are
    /// logged and counted.
    pub fn write<T: Serialize + ?Sized>(&self, event: &T) {
        match serde_json::to_vec(event) {
            Ok(bytes) => self.write_bytes(bytes),
            Err(e) => {
                self.metrics.record_write_failure();
                warn!(track = %self.shared.track, error = %e, "failed to serialize event, dropping it");
            }
        }
    }

    /// Enqueue an already serialized event.
    pub fn write_bytes(&self, payload: Vec<u8>) {
        let track = &self.shared.track;
        if payload.len() as u64 > self.max_object_size {
            self.metrics.record_dropped_oversize();
            warn!(
                track = %track,
                size = payload.len(),
                max = self.max_object_size,
                "event exceeds the maximum record size, dropping it"
            );
            return;
        }
        if self.shared.closed.load(Ordering::Acquire) {
            self.metrics.record_write_failure();
            warn!(track = %track, "writer is closed, dropping event");
            return;
        }

        let evicted = {
            let consent = lock(&self.shared.consent);
            if *consent == TrackingConsent::NotGranted {
                self.metrics.record_dropped_no_consent();
                return;
            }
            self.shared.events.force_push(Event {
                consent: *consent,
                payload,
            })
        };
        if evicted.is_some() {
            self.metrics.record_dropped_overflow();
            warn!(
                track = %track,
                capacity = self.shared.events.capacity(),
                "write queue full, dropped oldest pending event"
            );
        }
        // Full means a wake-up is already pending.
        let _ = self.shared.wake.try_send(());
    }

    /// Resolve once every event enqueued before this call is on disk.
    pub async fn flush(&self) {
        if let Some(done) = self.enqueue_flush() {
            let _ = done.await;
        }
    }

    /// Blocking variant of [`flush`](Self::flush). Must not be called from
    /// inside an async runtime.
    pub fn flush_blocking(&self) {
        if let Some(done) = self.enqueue_flush() {
            let _ = done.blocking_recv();
        }
    }

    fn enqueue_flush(&self) -> Option<oneshot::Receiver<()>> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.shared.control.send(Control::Flush(tx)).ok()?;
        Some(rx)
    }

    /// Pending events not yet written.
    pub fn pending(&self) -> usize {
        self.shared.events.len()
    }

    /// Drain the queue and stop the background thread. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shared.control.send(Control::Shutdown);
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                error!(track = %self.shared.track, "writer thread panicked");
            }
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WriterThread {
    shared: Arc<Shared>,
    targets: WriteTargets,
    metrics: Arc<PipelineMetrics>,
    track: String,
}

impl WriterThread {
    fn run(self, wake: Receiver<()>, control: Receiver<Control>) {
        debug!(track = %self.track, "writer thread started");
        loop {
            channel::select! {
                recv(control) -> command => match command {
                    Ok(Control::Flush(done)) => {
                        self.drain();
                        let _ = done.send(());
                    }
                    Ok(Control::Migrate(migration)) => {
                        // Events queued before the change keep their routing.
                        self.drain();
                        self.migrate(migration);
                    }
                    Ok(Control::Shutdown) | Err(_) => {
                        self.drain();
                        break;
                    }
                },
                recv(wake) -> _ => self.drain(),
            }
        }
        debug!(track = %self.track, "writer thread stopped");
    }

    fn drain(&self) {
        while let Some(event) = self.shared.events.pop() {
            let target = match event.consent {
                TrackingConsent::Pending => &self.targets.pending,
                _ => &self.targets.granted,
            };
            self.write_payload(target, &event.payload);
        }
    }

    fn write_payload(&self, orchestrator: &Mutex<FilesOrchestrator>, payload: &[u8]) {
        let track = self.track.as_str();
        let mut orchestrator = lock(orchestrator);
        let result = orchestrator
            .get_writable_segment(framed_len(payload.len()))
            .and_then(|segment| segment.append(payload).map_err(SpoolError::from));

        match result {
            Ok(bytes) => self.metrics.record_write(bytes),
            Err(SpoolError::RecordTooLarge { size, max }) => {
                self.metrics.record_dropped_oversize();
                warn!(track, size, max, "event does not fit in a segment, dropping it");
            }
            Err(e) => {
                self.metrics.record_write_failure();
                error!(track, error = %e, "failed to write event");
            }
        }
    }

    fn migrate(&self, migration: Migration) {
        let mut pending = lock(&self.targets.pending);
        match migration {
            Migration::MovePendingToGranted => {
                let mut granted = lock(&self.targets.granted);
                match granted.adopt_all(&mut pending) {
                    Ok(moved) => info!(track = %self.track, moved, "pending data authorized"),
                    Err(e) => error!(track = %self.track, error = %e, "failed to move pending data"),
                }
            }
            Migration::WipePending => {
                let deleted = pending.delete_all(DeletionReason::Unauthorized);
                info!(track = %self.track, deleted, "pending data discarded");
            }
        }
    }
}
