//! Per-kind transition tables and the status side effects they trigger.
//!
//! Side effects hang off the status being entered, never off a particular
//! edge: entering the running status stamps `started_at`, entering a finished
//! status stamps `finished_at`, entering the initial status again (a retry)
//! wipes the previous attempt.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::entity::{Entity, Status, WorkKind};
use super::error::QuantopsError;

type Edges = &'static [(Status, &'static [Status])];

/// The declared statuses of one kind, their outgoing edges and the roles
/// the orchestration layer relies on.
#[derive(Debug)]
pub struct Lifecycle {
    pub initial: Status,
    pub running: Status,
    pub success: Status,
    pub failure: Status,
    pub cancel: Status,
    edges: Edges,
}

impl Lifecycle {
    pub fn statuses(&self) -> impl Iterator<Item = Status> + '_ {
        self.edges.iter().map(|(status, _)| *status)
    }

    pub fn declares(&self, status: Status) -> bool {
        self.edges.iter().any(|(s, _)| *s == status)
    }

    /// Outgoing edges of `from`; empty for terminal or undeclared statuses.
    pub fn targets(&self, from: Status) -> &'static [Status] {
        self.edges
            .iter()
            .find(|(s, _)| *s == from)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn allows(&self, from: Status, to: Status) -> bool {
        self.targets(from).contains(&to)
    }

    pub fn is_terminal(&self, status: Status) -> bool {
        self.declares(status) && self.targets(status).is_empty()
    }

    /// Terminal statuses plus the failure status, which only leads back
    /// to the initial status through an explicit retry.
    pub fn is_finished(&self, status: Status) -> bool {
        self.is_terminal(status) || (self.declares(status) && status == self.failure)
    }
}

static JOB_EDGES: Edges = &[
    (Status::Queued, &[Status::Running, Status::Cancelled]),
    (
        Status::Running,
        &[Status::Succeeded, Status::Failed, Status::Cancelled],
    ),
    (Status::Failed, &[Status::Queued]),
    (Status::Succeeded, &[]),
    (Status::Cancelled, &[]),
];

static SIGNAL_EDGES: Edges = &[
    (
        Status::Pending,
        &[Status::Processing, Status::Expired, Status::Cancelled],
    ),
    (Status::Processing, &[Status::Processed, Status::Failed]),
    (Status::Failed, &[Status::Pending]),
    (Status::Processed, &[]),
    (Status::Expired, &[]),
    (Status::Cancelled, &[]),
];

static ORDER_EDGES: Edges = &[
    (
        Status::Pending,
        &[Status::Submitted, Status::Rejected, Status::Cancelled],
    ),
    (
        Status::Submitted,
        &[
            Status::PartiallyFilled,
            Status::Filled,
            Status::Rejected,
            Status::Cancelled,
        ],
    ),
    (Status::PartiallyFilled, &[Status::Filled, Status::Cancelled]),
    (Status::Filled, &[]),
    (Status::Rejected, &[]),
    (Status::Cancelled, &[]),
];

static JOB: Lifecycle = Lifecycle {
    initial: Status::Queued,
    running: Status::Running,
    success: Status::Succeeded,
    failure: Status::Failed,
    cancel: Status::Cancelled,
    edges: JOB_EDGES,
};

static BACKTEST_TASK: Lifecycle = Lifecycle {
    initial: Status::Queued,
    running: Status::Running,
    success: Status::Succeeded,
    failure: Status::Failed,
    cancel: Status::Cancelled,
    edges: JOB_EDGES,
};

static TRADING_SIGNAL: Lifecycle = Lifecycle {
    initial: Status::Pending,
    running: Status::Processing,
    success: Status::Processed,
    failure: Status::Failed,
    cancel: Status::Cancelled,
    edges: SIGNAL_EDGES,
};

static TRADE_ORDER: Lifecycle = Lifecycle {
    initial: Status::Pending,
    running: Status::Submitted,
    success: Status::Filled,
    failure: Status::Rejected,
    cancel: Status::Cancelled,
    edges: ORDER_EDGES,
};

impl WorkKind {
    pub fn lifecycle(self) -> &'static Lifecycle {
        match self {
            WorkKind::Job => &JOB,
            WorkKind::BacktestTask => &BACKTEST_TASK,
            WorkKind::TradingSignal => &TRADING_SIGNAL,
            WorkKind::TradeOrder => &TRADE_ORDER,
        }
    }
}

pub const DEFAULT_FAILURE_CODE: &str = "FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: String,
    pub message: String,
}

impl Failure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Failure {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchInfo {
    pub executor_name: String,
    pub dispatch_id: Option<String>,
}

/// A requested status change plus the outcome data the target status needs.
/// `result` is only read when entering the success status, `failure` only
/// when entering the failure status, `dispatch` only when entering running.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub to: Status,
    pub result: Option<Value>,
    pub failure: Option<Failure>,
    pub dispatch: Option<DispatchInfo>,
}

impl TransitionRequest {
    pub fn to(status: Status) -> Self {
        TransitionRequest {
            to: status,
            result: None,
            failure: None,
            dispatch: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_failure(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.failure = Some(Failure::new(code, message));
        self
    }

    pub fn with_dispatch(mut self, executor_name: impl Into<String>, dispatch_id: Option<String>) -> Self {
        self.dispatch = Some(DispatchInfo {
            executor_name: executor_name.into(),
            dispatch_id,
        });
        self
    }
}

/// Accept or reject `from -> to` for `kind`. Total over every status pair.
pub fn check(kind: WorkKind, from: Status, to: Status) -> Result<(), QuantopsError> {
    if kind.lifecycle().allows(from, to) {
        Ok(())
    } else {
        Err(QuantopsError::InvalidTransition { from, to })
    }
}

/// Apply `request` to a working copy. On error `entity` is left untouched.
pub fn apply(
    entity: &mut Entity,
    request: TransitionRequest,
    now: DateTime<Utc>,
) -> Result<(), QuantopsError> {
    let lifecycle = entity.kind.lifecycle();
    check(entity.kind, entity.status, request.to)?;

    let to = request.to;
    let stamp = now.max(entity.updated_at);

    if to == lifecycle.initial {
        entity.result = None;
        entity.error_code = None;
        entity.error_message = None;
        entity.executor_name = None;
        entity.dispatch_id = None;
        entity.started_at = None;
        entity.finished_at = None;
    }

    if to == lifecycle.running {
        if entity.started_at.is_none() {
            entity.started_at = Some(stamp);
        }
        if let Some(dispatch) = request.dispatch {
            entity.executor_name = Some(dispatch.executor_name);
            entity.dispatch_id = dispatch.dispatch_id;
        }
    }

    if to == lifecycle.success {
        entity.result = Some(request.result.unwrap_or(Value::Null));
        entity.error_code = None;
        entity.error_message = None;
    } else if to == lifecycle.failure {
        let failure = request
            .failure
            .unwrap_or_else(|| Failure::new(DEFAULT_FAILURE_CODE, "unspecified failure"));
        entity.result = None;
        entity.error_code = Some(failure.code);
        entity.error_message = Some(failure.message);
    }

    if lifecycle.is_finished(to) && entity.finished_at.is_none() {
        entity.finished_at = Some(stamp);
    }

    entity.status = to;
    entity.updated_at = stamp;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ownership::OwnerId;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn entity(kind: WorkKind) -> Entity {
        Entity::new(OwnerId::new("u-1").unwrap(), kind, json!({}), None, t0())
    }

    /// Forces `e` into `status` without going through the table.
    fn at(kind: WorkKind, status: Status) -> Entity {
        let mut e = entity(kind);
        e.status = status;
        e
    }

    #[test]
    fn every_kind_declares_its_roles() {
        for kind in WorkKind::ALL {
            let lc = kind.lifecycle();
            for role in [lc.initial, lc.running, lc.success, lc.failure, lc.cancel] {
                assert!(lc.declares(role), "{kind} does not declare {role}");
            }
            assert!(!lc.is_finished(lc.initial));
            assert!(lc.is_finished(lc.success));
            assert!(lc.is_finished(lc.failure));
            assert!(lc.is_terminal(lc.success));
        }
    }

    #[test]
    fn table_is_total_for_every_kind() {
        for kind in WorkKind::ALL {
            let lc = kind.lifecycle();
            for from in Status::ALL {
                for to in Status::ALL {
                    let mut e = at(kind, from);
                    let before = e.clone();
                    let later = t0() + Duration::seconds(5);
                    let outcome = apply(&mut e, TransitionRequest::to(to), later);
                    if lc.declares(from) && lc.targets(from).contains(&to) {
                        assert!(outcome.is_ok(), "{kind}: {from} -> {to} should pass");
                        assert_eq!(e.status, to);
                        assert_eq!(e.updated_at, later);
                    } else {
                        match outcome {
                            Err(QuantopsError::InvalidTransition { from: f, to: t }) => {
                                assert_eq!((f, t), (from, to));
                            }
                            other => panic!("{kind}: {from} -> {to} gave {other:?}"),
                        }
                        assert_eq!(e, before, "rejected transition mutated the entity");
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        let lc = WorkKind::Job.lifecycle();
        for to in Status::ALL {
            assert!(check(WorkKind::Job, Status::Succeeded, to).is_err());
            assert!(check(WorkKind::Job, Status::Cancelled, to).is_err());
        }
        assert!(lc.is_terminal(Status::Succeeded));
        assert!(!lc.is_terminal(Status::Failed));
    }

    #[test]
    fn job_scenario_runs_fails_and_retries() {
        let mut job = entity(WorkKind::Job);

        apply(&mut job, TransitionRequest::to(Status::Running), t0() + Duration::seconds(1)).unwrap();
        assert_eq!(job.started_at, Some(t0() + Duration::seconds(1)));
        assert!(job.finished_at.is_none());

        apply(
            &mut job,
            TransitionRequest::to(Status::Failed).with_failure("TIMEOUT", "took too long"),
            t0() + Duration::seconds(2),
        )
        .unwrap();
        assert_eq!(job.finished_at, Some(t0() + Duration::seconds(2)));
        assert_eq!(job.error_code.as_deref(), Some("TIMEOUT"));
        assert_eq!(job.error_message.as_deref(), Some("took too long"));
        assert!(job.result.is_none());

        apply(&mut job, TransitionRequest::to(Status::Queued), t0() + Duration::seconds(3)).unwrap();
        assert_eq!(job.status, Status::Queued);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
        assert!(job.error_code.is_none());
        assert!(job.error_message.is_none());
        assert!(job.executor_name.is_none());
        assert!(job.dispatch_id.is_none());
    }

    #[test]
    fn success_sets_result_and_only_result() {
        let mut job = at(WorkKind::Job, Status::Running);
        apply(
            &mut job,
            TransitionRequest::to(Status::Succeeded)
                .with_result(json!({"pnl": 12}))
                .with_failure("IGNORED", "not read on success"),
            t0(),
        )
        .unwrap();
        assert_eq!(job.result, Some(json!({"pnl": 12})));
        assert!(job.error_code.is_none());
    }

    #[test]
    fn success_without_result_stores_null() {
        let mut job = at(WorkKind::Job, Status::Running);
        apply(&mut job, TransitionRequest::to(Status::Succeeded), t0()).unwrap();
        assert_eq!(job.result, Some(Value::Null));
    }

    #[test]
    fn failure_without_detail_uses_default_code() {
        let mut job = at(WorkKind::Job, Status::Running);
        apply(&mut job, TransitionRequest::to(Status::Failed), t0()).unwrap();
        assert_eq!(job.error_code.as_deref(), Some(DEFAULT_FAILURE_CODE));
    }

    #[test]
    fn started_at_is_set_once() {
        let mut order = entity(WorkKind::TradeOrder);
        let first = t0() + Duration::seconds(1);
        apply(&mut order, TransitionRequest::to(Status::Submitted), first).unwrap();
        apply(
            &mut order,
            TransitionRequest::to(Status::PartiallyFilled),
            first + Duration::seconds(1),
        )
        .unwrap();
        assert_eq!(order.started_at, Some(first));
        apply(
            &mut order,
            TransitionRequest::to(Status::Filled),
            first + Duration::seconds(2),
        )
        .unwrap();
        assert_eq!(order.finished_at, Some(first + Duration::seconds(2)));
    }

    #[test]
    fn dispatch_info_lands_on_running_entry() {
        let mut job = entity(WorkKind::Job);
        apply(
            &mut job,
            TransitionRequest::to(Status::Running).with_dispatch("local", Some("d-1".into())),
            t0(),
        )
        .unwrap();
        assert_eq!(job.executor_name.as_deref(), Some("local"));
        assert_eq!(job.dispatch_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut job = entity(WorkKind::Job);
        job.updated_at = t0() + Duration::seconds(10);
        apply(&mut job, TransitionRequest::to(Status::Running), t0()).unwrap();
        assert_eq!(job.updated_at, t0() + Duration::seconds(10));
    }

    #[test]
    fn orders_cannot_be_retried() {
        assert!(check(WorkKind::TradeOrder, Status::Rejected, Status::Pending).is_err());
        assert!(check(WorkKind::Job, Status::Failed, Status::Queued).is_ok());
        assert!(check(WorkKind::TradingSignal, Status::Failed, Status::Pending).is_ok());
    }

    fn any_kind() -> impl Strategy<Value = WorkKind> {
        prop::sample::select(WorkKind::ALL.to_vec())
    }

    fn any_status() -> impl Strategy<Value = Status> {
        prop::sample::select(Status::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn check_agrees_with_declared_edges(kind in any_kind(), from in any_status(), to in any_status()) {
            let declared = kind.lifecycle().targets(from).contains(&to);
            prop_assert_eq!(check(kind, from, to).is_ok(), declared);
        }

        #[test]
        fn accepted_transitions_keep_outcome_fields_exclusive(
            kind in any_kind(),
            path in prop::collection::vec(any_status(), 0..12),
        ) {
            let mut e = entity(kind);
            let lc = kind.lifecycle();
            for (step, to) in path.into_iter().enumerate() {
                let now = t0() + Duration::seconds(step as i64);
                let request = TransitionRequest::to(to)
                    .with_result(json!(step))
                    .with_failure("E", "boom");
                let _ = apply(&mut e, request, now);

                prop_assert!(lc.declares(e.status));
                prop_assert!(!(e.result.is_some() && e.error_code.is_some()));
                prop_assert_eq!(e.result.is_some(), e.status == lc.success);
                prop_assert_eq!(e.error_code.is_some(), e.status == lc.failure);
                prop_assert_eq!(e.finished_at.is_some(), lc.is_finished(e.status));
            }
        }
    }
}
