//! Units of work: identity, kind, status and the committed snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::error::QuantopsError;
use super::ownership::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn generate() -> Self {
        EntityId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kinds of unit of work tracked by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Job,
    BacktestTask,
    TradingSignal,
    TradeOrder,
}

impl WorkKind {
    pub const ALL: [WorkKind; 4] = [
        WorkKind::Job,
        WorkKind::BacktestTask,
        WorkKind::TradingSignal,
        WorkKind::TradeOrder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkKind::Job => "job",
            WorkKind::BacktestTask => "backtest_task",
            WorkKind::TradingSignal => "trading_signal",
            WorkKind::TradeOrder => "trade_order",
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `Job`, `job`, `BacktestTask`, `backtest_task`, `backtest-task`.
impl FromStr for WorkKind {
    type Err = QuantopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "job" => Ok(WorkKind::Job),
            "backtesttask" => Ok(WorkKind::BacktestTask),
            "tradingsignal" => Ok(WorkKind::TradingSignal),
            "tradeorder" => Ok(WorkKind::TradeOrder),
            _ => Err(QuantopsError::invalid_input(format!("unknown kind {s:?}"))),
        }
    }
}

/// Every status any kind may declare. Which subset applies, and how the
/// members connect, is decided per kind by [`super::state_machine::Lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Pending,
    Processing,
    Processed,
    Expired,
    Submitted,
    PartiallyFilled,
    Filled,
    Rejected,
}

impl Status {
    pub const ALL: [Status; 13] = [
        Status::Queued,
        Status::Running,
        Status::Succeeded,
        Status::Failed,
        Status::Cancelled,
        Status::Pending,
        Status::Processing,
        Status::Processed,
        Status::Expired,
        Status::Submitted,
        Status::PartiallyFilled,
        Status::Filled,
        Status::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Processed => "processed",
            Status::Expired => "expired",
            Status::Submitted => "submitted",
            Status::PartiallyFilled => "partially_filled",
            Status::Filled => "filled",
            Status::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = QuantopsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| QuantopsError::invalid_input(format!("unknown status {s:?}")))
    }
}

/// A committed (or about-to-be-committed) snapshot of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub kind: WorkKind,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub status: Status,
    pub result: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub executor_name: Option<String>,
    pub dispatch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every committed update. A write derived from
    /// an older revision is refused.
    #[serde(default)]
    pub revision: u64,
}

impl Entity {
    /// A fresh entity in its kind's initial status.
    pub fn new(
        owner_id: OwnerId,
        kind: WorkKind,
        payload: Value,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Entity {
            id: EntityId::generate(),
            owner_id,
            kind,
            payload,
            idempotency_key,
            status: kind.lifecycle().initial,
            result: None,
            error_code: None,
            error_message: None,
            executor_name: None,
            dispatch_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            revision: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.kind.lifecycle().is_finished(self.status)
    }
}
