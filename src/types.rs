use serde::{Deserialize, Serialize};

/// Envelope of every realtime feed frame. Only `type == "event"` carries
/// a document payload; `connected`, `response` and friends are ignored, so
/// `data` stays untyped until the kind is known.
#[derive(Debug, Deserialize)]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct FeedEventData {
    /// Appwrite event names, e.g. `databases.*.documents.*.create`.
    #[serde(default)]
    pub events: Vec<String>,
    pub payload: QuestionPayload,
}

/// The question document carried by a feed event.
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionPayload {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "$createdAt")]
    pub created_at: String,
    #[serde(rename = "isLocked", default)]
    pub is_locked: bool,
}

/// Response of the account endpoint; only the id matters.
#[derive(Debug, Deserialize)]
pub struct Identity {
    #[serde(rename = "$id")]
    pub id: String,
}

/// Response of a document list query.
#[derive(Debug, Deserialize)]
pub struct DocumentList {
    pub total: u64,
}

/// Why an event was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotEligible,
    AlreadyLocked,
    TooOld,
}

impl SkipReason {
    pub fn label(self) -> &'static str {
        match self {
            SkipReason::NotEligible => "lock held",
            SkipReason::AlreadyLocked => "already locked",
            SkipReason::TooOld => "too old",
        }
    }
}

/// Classification result for one feed event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Dispatch,
    Skip(SkipReason),
}

/// A claim that has been scheduled but not fired yet.
#[derive(Debug, Clone)]
pub struct PendingClaim {
    pub question_id: String,
    /// Age of the question when the event arrived, in seconds.
    pub age_secs: f64,
    /// Total wait before firing (catch-up + human delay), in seconds.
    pub wait_secs: f64,
}

/// Result of one claim attempt, emitted as a JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub timestamp: String,
    pub question_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub dry_run: bool,
}

/// Counters printed when the bot exits.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub uptime_secs: f64,
    pub events_seen: u64,
    pub events_malformed: u64,
    pub skipped_not_eligible: u64,
    pub skipped_already_locked: u64,
    pub skipped_too_old: u64,
    pub claims_scheduled: u64,
    pub claims_succeeded: u64,
    pub claims_failed: u64,
    pub claims_dry_run: u64,
    pub claims_dropped: u64,
    pub claims_aborted: u64,
    pub monitor_checks: u64,
    pub monitor_failures: u64,
    pub feed_connections: u64,
}
