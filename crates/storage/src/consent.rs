use std::sync::{Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lock;

/// Subdirectory of a feature holding data that may be uploaded.
pub const GRANTED_DIR: &str = "granted";
/// Subdirectory of a feature holding data collected before the user decided.
pub const PENDING_DIR: &str = "pending";

/// The user's decision about data collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingConsent {
    /// Collect and upload.
    #[default]
    Granted,
    /// Collect nothing.
    NotGranted,
    /// Collect without uploading until the user decides.
    Pending,
}

/// What happens to pending data when consent changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Pending data becomes uploadable.
    MovePendingToGranted,
    /// Pending data is discarded.
    WipePending,
}

impl Migration {
    /// Migration for a `previous` → `current` change. Granted data is never
    /// touched.
    pub fn between(previous: TrackingConsent, current: TrackingConsent) -> Option<Migration> {
        match (previous, current) {
            (TrackingConsent::Pending, TrackingConsent::Granted) => Some(Migration::MovePendingToGranted),
            (TrackingConsent::Pending, TrackingConsent::NotGranted) => Some(Migration::WipePending),
            _ => None,
        }
    }
}

/// Notified synchronously on every consent change.
pub trait ConsentObserver: Send + Sync {
    fn consent_changed(&self, previous: TrackingConsent, current: TrackingConsent);
}

struct ProviderState {
    consent: TrackingConsent,
    observers: Vec<Weak<dyn ConsentObserver>>,
}

/// Current tracking consent, shared by every feature of a core.
pub struct ConsentProvider {
    state: Mutex<ProviderState>,
}

impl ConsentProvider {
    pub fn new(initial: TrackingConsent) -> Self {
        Self {
            state: Mutex::new(ProviderState {
                consent: initial,
                observers: Vec::new(),
            }),
        }
    }

    pub fn consent(&self) -> TrackingConsent {
        lock(&self.state).consent
    }

    /// Register `observer` and return the consent in effect. Dropped
    /// observers are forgotten on the next change.
    pub fn subscribe(&self, observer: Weak<dyn ConsentObserver>) -> TrackingConsent {
        let mut state = lock(&self.state);
        state.observers.push(observer);
        state.consent
    }

    /// Observers run under the provider lock, so they see changes in the
    /// order they were made.
    pub fn change_consent(&self, consent: TrackingConsent) {
        let mut state = lock(&self.state);
        let previous = state.consent;
        if previous == consent {
            return;
        }
        state.consent = consent;
        state.observers.retain(|o| o.strong_count() > 0);
        info!(?previous, current = ?consent, "tracking consent changed");
        for observer in state.observers.iter().filter_map(Weak::upgrade) {
            observer.consent_changed(previous, consent);
        }
    }
}

impl Default for ConsentProvider {
    fn default() -> Self {
        Self::new(TrackingConsent::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Changes(Mutex<Vec<(TrackingConsent, TrackingConsent)>>);

    impl ConsentObserver for Changes {
        fn consent_changed(&self, previous: TrackingConsent, current: TrackingConsent) {
            self.0.lock().unwrap().push((previous, current));
        }
    }

    #[test]
    fn test_migrations_per_transition() {
        use TrackingConsent::*;
        assert_eq!(Migration::between(Pending, Granted), Some(Migration::MovePendingToGranted));
        assert_eq!(Migration::between(Pending, NotGranted), Some(Migration::WipePending));
        for (previous, current) in [(Granted, Pending), (Granted, NotGranted), (NotGranted, Granted), (NotGranted, Pending)] {
            assert_eq!(Migration::between(previous, current), None, "{previous:?} -> {current:?}");
        }
    }

    #[test]
    fn test_observers_see_each_change_once() {
        let provider = ConsentProvider::new(TrackingConsent::Pending);
        let changes = Arc::new(Changes::default());
        let observer: Arc<dyn ConsentObserver> = changes.clone();
        assert_eq!(provider.subscribe(Arc::downgrade(&observer)), TrackingConsent::Pending);

        provider.change_consent(TrackingConsent::Granted);
        provider.change_consent(TrackingConsent::Granted);
        provider.change_consent(TrackingConsent::NotGranted);

        assert_eq!(
            *changes.0.lock().unwrap(),
            vec![
                (TrackingConsent::Pending, TrackingConsent::Granted),
                (TrackingConsent::Granted, TrackingConsent::NotGranted),
            ]
        );
        assert_eq!(provider.consent(), TrackingConsent::NotGranted);
    }

    #[test]
    fn test_dropped_observer_is_forgotten() {
        let provider = ConsentProvider::new(TrackingConsent::Granted);
        let observer: Arc<dyn ConsentObserver> = Arc::new(Changes::default());
        provider.subscribe(Arc::downgrade(&observer));
        drop(observer);

        provider.change_consent(TrackingConsent::Pending);
        assert!(lock(&provider.state).observers.is_empty());
    }
}
