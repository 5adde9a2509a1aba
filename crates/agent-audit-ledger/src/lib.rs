#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use agent_audit_domain::ObserverEvent;

/// Append-only ledger of run lifecycle events.
///
/// The backing log is monitor-guarded so concurrent runs sharing one ledger
/// keep insertion-order semantics: each append is a single exclusive write.
/// Past entries are never mutated or deleted, and reads hand out a snapshot
/// copy, never a reference into the live sequence. The ledger observes runs
/// by `run_id`; it holds no business logic and owns no run data.
#[derive(Debug, Default)]
pub struct EventLedger {
    events: Mutex<Vec<ObserverEvent>>,
}

impl EventLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: ObserverEvent) {
        // A poisoned lock only means another writer panicked mid-append of
        // its own entry; the log itself stays usable.
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        events.push(event);
    }

    /// Snapshot of all events recorded so far, in insertion order.
    #[must_use]
    pub fn recorded_events(&self) -> Vec<ObserverEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
