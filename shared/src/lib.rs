use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Subscriber username on the RADIUS server.
    pub radius_username: String,
    pub status: String, // active, suspended, closed
    pub autopay: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub invoice_number: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub status: String, // sent, paid, overdue, void
    pub total_amount: Decimal,
    pub currency: String,
    /// Day-offset of the last overdue notice sent for this invoice, if any.
    pub last_notice_days: Option<i32>,
    pub last_notice_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Connectivity state of a subscriber session as reported by the RADIUS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Online,
    Offline,
    Unknown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Online => "online",
            SessionState::Offline => "offline",
            SessionState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(SessionState::Online),
            "offline" => Some(SessionState::Offline),
            "unknown" => Some(SessionState::Unknown),
            _ => None,
        }
    }
}

/// Kind of customer notice the notification pipeline dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Reminder,
    Disconnection,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Reminder => "reminder",
            NoticeKind::Disconnection => "disconnection",
        }
    }
}
