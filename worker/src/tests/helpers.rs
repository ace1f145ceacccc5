// Shared test setup

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;

use crate::clock::ManualClock;
use crate::jobs::scheduler::RecentRuns;
use crate::notify::NoticeThresholds;

/// A fixed instant every clock-driven test starts from.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

pub fn recent_runs() -> RecentRuns {
    Arc::new(RwLock::new(Vec::new()))
}

pub fn thresholds() -> NoticeThresholds {
    NoticeThresholds {
        reminder_days: vec![1, 3, 7],
        disconnect_after_days: 14,
    }
}

pub fn email_payload(to: &str) -> serde_json::Value {
    serde_json::json!({
        "to": to,
        "to_name": null,
        "subject": "Test",
        "html_body": "<p>Test</p>",
        "text_body": "Test",
        "attachment": null,
    })
}
