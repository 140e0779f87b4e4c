// Debounced code persistence.
//
// Coalesces rapid code-change events on the same session within a quiet
// window (2000ms). The last content wins; a new schedule call fully
// supersedes the pending one, it does not merge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::SessionStore;

/// Quiet interval before a pending save fires.
const SAVE_QUIET_WINDOW_MS: u64 = 2_000;
/// How often the worker checks for ready saves.
const SAVE_POLL_INTERVAL_MS: u64 = 250;

/// A coalesced save that is ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSave {
    pub session_id: Uuid,
    pub code: String,
}

struct PendingEntry {
    code: String,
    last_seen: Instant,
}

/// Debounces code saves, coalescing rapid schedules on the same session.
///
/// Call `push()` for each incoming code change, then `drain_ready()`
/// periodically to collect saves whose quiet window has elapsed.
pub struct SaveDebouncer {
    window: Duration,
    pending: HashMap<Uuid, PendingEntry>,
}

impl Default for SaveDebouncer {
    fn default() -> Self {
        Self::with_window(Duration::from_millis(SAVE_QUIET_WINDOW_MS))
    }
}

impl SaveDebouncer {
    pub fn with_window(window: Duration) -> Self {
        Self { window, pending: HashMap::new() }
    }

    /// Record a code change. If there's already a pending save for this
    /// session it gets superseded entirely (last content wins, timer
    /// resets).
    pub fn push(&mut self, session_id: Uuid, code: String) {
        self.push_at(session_id, code, Instant::now());
    }

    /// Like `push` but with a specific timestamp (for testing).
    fn push_at(&mut self, session_id: Uuid, code: String, now: Instant) {
        self.pending.insert(session_id, PendingEntry { code, last_seen: now });
    }

    /// Drain all saves whose quiet window has elapsed.
    pub fn drain_ready(&mut self) -> Vec<PendingSave> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp (for testing).
    fn drain_ready_at(&mut self, now: Instant) -> Vec<PendingSave> {
        let window = self.window;
        let mut ready = Vec::new();

        self.pending.retain(|session_id, entry| {
            if now.duration_since(entry.last_seen) >= window {
                ready.push(PendingSave {
                    session_id: *session_id,
                    code: std::mem::take(&mut entry.code),
                });
                false
            } else {
                true
            }
        });

        ready
    }

    /// Number of sessions with a save still inside the quiet window.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time at which the next pending save becomes ready, or None if empty.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.last_seen + self.window).min()
    }
}

/// Shared handle around the debouncer: event handlers schedule, the worker
/// drains and writes.
#[derive(Clone)]
pub struct SaveQueue {
    debouncer: Arc<Mutex<SaveDebouncer>>,
}

impl Default for SaveQueue {
    fn default() -> Self {
        Self { debouncer: Arc::new(Mutex::new(SaveDebouncer::default())) }
    }
}

impl SaveQueue {
    /// Arm (or re-arm) the save timer for a session with the latest code.
    pub fn schedule(&self, session_id: Uuid, code: String) {
        self.debouncer.lock().expect("save debouncer lock poisoned").push(session_id, code);
    }

    pub fn pending_count(&self) -> usize {
        self.debouncer.lock().expect("save debouncer lock poisoned").pending_count()
    }

    /// Worker loop: polls for ready saves and writes each one through the
    /// store. A write failure is logged and not retried; the next
    /// code-change reschedules.
    pub async fn run(self, store: SessionStore) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(SAVE_POLL_INTERVAL_MS));
        loop {
            ticker.tick().await;
            let ready = {
                self.debouncer.lock().expect("save debouncer lock poisoned").drain_ready()
            };
            for save in ready {
                match store.update_code(save.session_id, &save.code).await {
                    Ok(()) => {
                        debug!(session_id = %save.session_id, bytes = save.code.len(), "persisted session code");
                    }
                    Err(error) => {
                        warn!(session_id = %save.session_id, error = %error, "debounced code save failed");
                    }
                }
            }
        }
    }
}
