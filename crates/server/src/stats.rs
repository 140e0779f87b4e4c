// Platform metrics aggregation.
//
// Holds the process-wide counters (active sessions, collaborating users,
// total lines of code), recomputes them from the presence registry on a
// fixed interval, persists them with merge semantics, and broadcasts them
// to every connection. A separate daily task snapshots the counters into a
// dated historical record, first firing at the next local midnight.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, Utc};
use codehive_common::protocol::events::ServerEvent;
use codehive_common::types::{GlobalStats, StatsSnapshot};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::presence::PresenceRegistry;
use crate::rooms::RoomHub;
use crate::store::SessionStore;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    stats: Arc<RwLock<GlobalStats>>,
}

impl StatsAggregator {
    /// Load the persisted counters as the starting baseline, falling back
    /// to zeros when none exist. `last_updated` is reset to now either way.
    pub async fn load_baseline(store: &SessionStore) -> Self {
        let mut baseline = match store.load_global_stats().await {
            Ok(Some(stats)) => stats,
            Ok(None) => GlobalStats::default(),
            Err(error) => {
                warn!(error = %error, "failed to load persisted platform stats, starting from zeros");
                GlobalStats::default()
            }
        };
        baseline.last_updated = Some(Utc::now());
        info!(
            total_lines_of_code = baseline.total_lines_of_code,
            "platform stats baseline loaded"
        );
        Self { stats: Arc::new(RwLock::new(baseline)) }
    }

    /// Current counters.
    pub async fn snapshot(&self) -> GlobalStats {
        self.stats.read().await.clone()
    }

    /// Record a code change for a session. When the new line count exceeds
    /// the session's highest recorded count, the total grows by the delta
    /// and the per-session high-water mark advances; shrinking content
    /// never decreases the total. Returns the applied delta.
    pub async fn record_code_change(&self, session_id: Uuid, line_count: u64) -> Option<u64> {
        let mut guard = self.stats.write().await;
        let previous = guard.last_line_count.get(&session_id).copied().unwrap_or(0);
        if line_count <= previous {
            return None;
        }
        let delta = line_count - previous;
        guard.total_lines_of_code += delta;
        guard.last_line_count.insert(session_id, line_count);
        Some(delta)
    }

    /// Recompute the presence-derived counters and stamp the update time.
    pub async fn recompute(&self, presence: &PresenceRegistry) -> GlobalStats {
        let active_sessions = presence.active_session_count().await;
        let collaborating_users = presence.member_count().await;

        let mut guard = self.stats.write().await;
        guard.active_sessions = active_sessions;
        guard.collaborating_users = collaborating_users;
        guard.last_updated = Some(Utc::now());
        guard.clone()
    }

    /// Periodic cycle: recompute, persist (merge, non-fatal on failure),
    /// broadcast `global-stats` to every connection.
    pub async fn run_recompute_loop(
        self,
        presence: PresenceRegistry,
        rooms: RoomHub,
        store: SessionStore,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            let stats = self.recompute(&presence).await;
            if let Err(error) = store.merge_global_stats(&stats).await {
                warn!(error = %error, "failed to persist platform stats, will retry next cycle");
            }
            let delivered = rooms.broadcast_to_all(ServerEvent::GlobalStats(stats)).await;
            debug!(delivered, "broadcast platform stats");
        }
    }

    /// Daily snapshot task. Sleeps until the next local midnight, then
    /// appends a dated record every 24 hours. Failures are swallowed; the
    /// next day's run self-heals.
    pub async fn run_daily_snapshot_loop(self, store: SessionStore) {
        let mut delay = duration_until_next_local_midnight();
        loop {
            tokio::time::sleep(delay).await;
            let stats = self.snapshot().await;
            let snapshot = StatsSnapshot {
                timestamp: Utc::now(),
                active_sessions: stats.active_sessions,
                collaborating_users: stats.collaborating_users,
                total_lines_of_code: stats.total_lines_of_code,
            };
            match store.append_stats_snapshot(&snapshot).await {
                Ok(()) => info!(
                    active_sessions = snapshot.active_sessions,
                    collaborating_users = snapshot.collaborating_users,
                    total_lines_of_code = snapshot.total_lines_of_code,
                    "captured daily platform stats snapshot"
                ),
                Err(error) => {
                    warn!(error = %error, "failed to capture daily platform stats snapshot");
                }
            }
            delay = DAY;
        }
    }
}

fn duration_until_next_local_midnight() -> Duration {
    let now = Local::now().naive_local();
    now.date()
        .checked_add_days(Days::new(1))
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(DAY)
}
