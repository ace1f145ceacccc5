// Sync Engine - RADIUS session-state reconciliation
//
// Each cycle fetches the authoritative session state for the active
// subscribers, diffs it against the last recorded observation, and writes a
// SyncRecord plus a state-change event only when something actually changed.
// An unchanged snapshot produces nothing, which is what makes re-running a
// cycle under retry or overlap-skip semantics safe.

pub mod store;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use uplink_shared::SessionState;

use crate::events::{EventBus, StateChangeEvent};
use crate::gateways::SessionAuthority;

pub use store::{MemorySyncStore, PgSyncStore, SyncRecord, SyncStore};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub checked: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    authority: Arc<dyn SessionAuthority>,
    events: EventBus,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        authority: Arc<dyn SessionAuthority>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            authority,
            events,
        }
    }

    /// One sync cycle over `subjects`. Per-subject fetch failures are counted
    /// and retried next cycle; they never block the subjects that responded.
    pub async fn run(&self, subjects: &[String]) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        if subjects.is_empty() {
            return Ok(report);
        }

        let states = self.authority.session_states(subjects).await;

        for (subject, result) in states {
            report.checked += 1;

            let remote = match result {
                Ok(state) => state,
                Err(e) => {
                    warn!(subject = %subject, error = %e, "Session fetch failed; will retry next cycle");
                    report.failed += 1;
                    continue;
                }
            };

            let previous = self
                .store
                .latest(&subject)
                .await?
                .map(|record| record.remote_state)
                .unwrap_or(SessionState::Unknown);

            if previous == remote {
                report.unchanged += 1;
                continue;
            }

            let observed_at = Utc::now();
            self.store
                .record(SyncRecord {
                    subject_id: subject.clone(),
                    local_state: previous,
                    remote_state: remote,
                    observed_at,
                })
                .await?;

            self.events.publish(StateChangeEvent {
                subject_id: subject.clone(),
                previous,
                current: remote,
                observed_at,
            });

            info!(
                subject = %subject,
                from = previous.as_str(),
                to = remote.as_str(),
                "Session state changed"
            );
            report.changed += 1;
        }

        Ok(report)
    }
}
