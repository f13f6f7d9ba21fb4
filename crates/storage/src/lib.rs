use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod consent;
pub mod reader;
pub mod storage;
pub mod writer;

pub use config::{BatchSize, PerformancePreset, PresetOverride, UploadFrequency};
pub use consent::{ConsentObserver, ConsentProvider, Migration, TrackingConsent, GRANTED_DIR, PENDING_DIR};
pub use reader::{Batch, BatchReader};
pub use storage::FeatureStorage;
pub use writer::{BatchWriter, WriteTargets};

/// Lock a mutex, recovering the guard if a previous holder panicked. The
/// guarded state is bookkeeping that stays consistent between calls.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
