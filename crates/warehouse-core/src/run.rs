//! Production-run state machine.
//!
//! A run walks the eleven canonical steps `0..=10`. [`plan_transition`] is the
//! single place that decides whether a transition is legal and what it does;
//! the store only executes the returned [`TransitionPlan`] inside one
//! transaction.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{Date, OffsetDateTime};

use crate::audit::AuditEventType;
use crate::quality::Decision;
use crate::{
    check_text_len, FlowVersionId, IdempotencyKey, LotId, RunId, StepExecutionId, WarehouseError,
};

pub const FINAL_STEP_INDEX: u8 = 10;
pub const STEP_COUNT: usize = 11;
pub const DEFAULT_SITE_CODE: &str = "DUNA";

const NOTE_MIN_CHARS: usize = 10;
const NOTE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Idle,
    Running,
    Hold,
    Completed,
    Aborted,
    Archived,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Hold => "HOLD",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Archived => "ARCHIVED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "HOLD" => Some(Self::Hold),
            "COMPLETED" => Some(Self::Completed),
            "ABORTED" => Some(Self::Aborted),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Human-readable run identifier: `RUN-YYYYMMDD-SITE-NNNN`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RunCode(String);

impl RunCode {
    pub const MAX_SEQUENCE: u16 = 9_999;

    /// Prefix shared by every run code of one site on one day.
    #[must_use]
    pub fn prefix(date: Date, site: &str) -> String {
        format!(
            "RUN-{:04}{:02}{:02}-{site}-",
            date.year(),
            u8::from(date.month()),
            date.day()
        )
    }

    /// Builds a run code from its parts.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] for a malformed site code and
    /// [`WarehouseError::Conflict`] when the daily sequence is exhausted.
    pub fn compose(date: Date, site: &str, sequence: u16) -> Result<Self, WarehouseError> {
        validate_site_code(site)?;
        if sequence == 0 || sequence > Self::MAX_SEQUENCE {
            return Err(WarehouseError::Conflict(format!(
                "run code sequence {sequence} outside 1..={} for site {site}",
                Self::MAX_SEQUENCE
            )));
        }
        Self::parse(&format!("{}{sequence:04}", Self::prefix(date, site)))
    }

    /// Parses and validates `RUN-\d{8}-[A-Z]{4}-\d{4}`.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when `raw` does not match.
    pub fn parse(raw: &str) -> Result<Self, WarehouseError> {
        let invalid = || {
            WarehouseError::Validation(format!(
                "run code `{raw}` MUST match RUN-YYYYMMDD-SITE-NNNN"
            ))
        };
        let mut parts = raw.split('-');
        let (Some("RUN"), Some(date), Some(site), Some(sequence), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if site.len() != 4 || !site.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(invalid());
        }
        if sequence.len() != 4 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.0
            .rsplit('-')
            .next()
            .and_then(|tail| tail.parse().ok())
            .unwrap_or(0)
    }
}

impl TryFrom<String> for RunCode {
    type Error = WarehouseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunCode> for String {
    fn from(value: RunCode) -> Self {
        value.0
    }
}

impl Display for RunCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a four-letter uppercase site code.
///
/// # Errors
/// Returns [`WarehouseError::Validation`] when `site` is not `[A-Z]{4}`.
pub fn validate_site_code(site: &str) -> Result<(), WarehouseError> {
    if site.len() != 4 || !site.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(WarehouseError::Validation(format!(
            "site code `{site}` MUST be four uppercase letters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductionRun {
    pub id: RunId,
    pub run_code: RunCode,
    pub flow_version_id: FlowVersionId,
    pub status: RunStatus,
    pub current_step_index: u8,
    pub idempotency_key: IdempotencyKey,
    pub created_by: String,
    pub hold_reason: Option<String>,
    pub resume_resolution: Option<String>,
    pub abort_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProductionRun {
    /// Status and step snapshot recorded in audit `old_state`/`new_state`.
    #[must_use]
    pub fn state_snapshot(&self) -> Value {
        json!({
            "status": self.status.as_str(),
            "current_step_index": self.current_step_index,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStepExecution {
    pub id: StepExecutionId,
    pub run_id: RunId,
    pub step_index: u8,
    pub node_id: String,
    pub status: StepStatus,
    pub operator_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[must_use]
pub fn step_node_id(step_index: u8) -> String {
    if step_index == 0 {
        "start".to_string()
    } else {
        format!("step-{step_index}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub flow_version_id: FlowVersionId,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum RunTransition {
    Start,
    Advance,
    Hold { reason: String },
    Resume { resolution: String },
    Complete,
    Abort { reason: String },
}

impl RunTransition {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Advance => "advance",
            Self::Hold { .. } => "hold",
            Self::Resume { .. } => "resume",
            Self::Complete => "complete",
            Self::Abort { .. } => "abort",
        }
    }

    /// Validates the free-text note carried by hold/resume/abort.
    ///
    /// # Errors
    /// Returns [`WarehouseError::Validation`] when a note is outside
    /// 10..=500 characters.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        match self {
            Self::Hold { reason } | Self::Abort { reason } => {
                check_text_len("reason", reason, NOTE_MIN_CHARS, NOTE_MAX_CHARS)
            }
            Self::Resume { resolution } => {
                check_text_len("resolution", resolution, NOTE_MIN_CHARS, NOTE_MAX_CHARS)
            }
            Self::Start | Self::Advance | Self::Complete => Ok(()),
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Self::Hold { reason } | Self::Abort { reason } => Some(reason.trim().to_string()),
            Self::Resume { resolution } => Some(resolution.trim().to_string()),
            Self::Start | Self::Advance | Self::Complete => None,
        }
    }
}

/// A lot/step pair whose latest inspection is not a PASS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenFinding {
    pub lot_id: LotId,
    pub step_index: u8,
    pub decision: Decision,
}

/// Facts the store gathers before planning `advance` or `complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardFacts {
    /// Latest inspection per lot at the current step is HOLD or FAIL.
    pub unresolved_at_step: Vec<OpenFinding>,
    /// Codes of this run's lots at the current step that are on HOLD.
    pub held_lots_at_step: Vec<String>,
    /// Latest inspection per (lot, step) anywhere in the run is not PASS.
    pub unresolved_in_run: Vec<OpenFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from_status: RunStatus,
    pub to_status: RunStatus,
    pub from_step: u8,
    pub to_step: u8,
    /// Step execution to mark COMPLETED.
    pub close_step: Option<u8>,
    /// Step execution to open as IN_PROGRESS.
    pub open_step: Option<u8>,
    pub marks_started: bool,
    pub marks_completed: bool,
    pub marks_ended: bool,
    pub note: Option<String>,
    pub event_type: AuditEventType,
}

impl TransitionPlan {
    fn new(status: RunStatus, step: u8, to_status: RunStatus, event_type: AuditEventType) -> Self {
        Self {
            from_status: status,
            to_status,
            from_step: step,
            to_step: step,
            close_step: None,
            open_step: None,
            marks_started: false,
            marks_completed: false,
            marks_ended: false,
            note: None,
            event_type,
        }
    }
}

/// Decides whether `transition` is legal for a run at `status`/`step`.
///
/// # Errors
/// Returns [`WarehouseError::Precondition`] naming the current and required
/// state, or when a QC/lot guard blocks `advance`/`complete`, and
/// [`WarehouseError::Validation`] for a malformed note.
pub fn plan_transition(
    status: RunStatus,
    step: u8,
    transition: &RunTransition,
    guards: &GuardFacts,
) -> Result<TransitionPlan, WarehouseError> {
    transition.validate()?;
    if step > FINAL_STEP_INDEX {
        return Err(WarehouseError::Precondition(format!(
            "run step index {step} exceeds final step {FINAL_STEP_INDEX}"
        )));
    }

    let mut plan = match transition {
        RunTransition::Start => {
            if status != RunStatus::Idle {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot start run in {status} status. Must be IDLE."
                )));
            }
            let mut plan =
                TransitionPlan::new(status, step, RunStatus::Running, AuditEventType::RunStarted);
            plan.open_step = Some(step);
            plan.marks_started = true;
            plan
        }
        RunTransition::Advance => {
            if status != RunStatus::Running {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot advance run in {status} status. Must be RUNNING."
                )));
            }
            if step >= FINAL_STEP_INDEX {
                return Err(WarehouseError::Precondition(format!(
                    "Run is at final step ({FINAL_STEP_INDEX}). Use complete to finish."
                )));
            }
            if let Some(finding) = guards.unresolved_at_step.first() {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot advance: QC for lot {} at step {} is {}. Record a PASS first.",
                    finding.lot_id,
                    finding.step_index,
                    finding.decision.as_str()
                )));
            }
            if !guards.held_lots_at_step.is_empty() {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot advance: lots on HOLD at step {step}: {}",
                    guards.held_lots_at_step.join(", ")
                )));
            }
            let mut plan = TransitionPlan::new(
                status,
                step,
                RunStatus::Running,
                AuditEventType::RunStepAdvanced,
            );
            plan.to_step = step + 1;
            plan.close_step = Some(step);
            plan.open_step = Some(step + 1);
            plan
        }
        RunTransition::Hold { .. } => {
            if status != RunStatus::Running {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot hold run in {status} status. Must be RUNNING."
                )));
            }
            TransitionPlan::new(status, step, RunStatus::Hold, AuditEventType::RunHeld)
        }
        RunTransition::Resume { .. } => {
            if status != RunStatus::Hold {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot resume run in {status} status. Must be HOLD."
                )));
            }
            TransitionPlan::new(status, step, RunStatus::Running, AuditEventType::RunResumed)
        }
        RunTransition::Complete => {
            if status != RunStatus::Running {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot complete run in {status} status. Must be RUNNING."
                )));
            }
            if step != FINAL_STEP_INDEX {
                return Err(WarehouseError::Precondition(format!(
                    "Run must be at step {FINAL_STEP_INDEX} (Shipment) to complete. Current step: {step}"
                )));
            }
            if let Some(finding) = guards.unresolved_in_run.first() {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot complete: QC for lot {} at step {} is {}. All QC must pass.",
                    finding.lot_id,
                    finding.step_index,
                    finding.decision.as_str()
                )));
            }
            let mut plan = TransitionPlan::new(
                status,
                step,
                RunStatus::Completed,
                AuditEventType::RunCompleted,
            );
            plan.close_step = Some(step);
            plan.marks_completed = true;
            plan.marks_ended = true;
            plan
        }
        RunTransition::Abort { .. } => {
            if !matches!(status, RunStatus::Running | RunStatus::Hold) {
                return Err(WarehouseError::Precondition(format!(
                    "Cannot abort run in {status} status. Must be RUNNING or HOLD."
                )));
            }
            let mut plan =
                TransitionPlan::new(status, step, RunStatus::Aborted, AuditEventType::RunAborted);
            plan.marks_ended = true;
            plan
        }
    };

    plan.note = transition.note();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T, WarehouseError>) -> WarehouseError {
        match result {
            Ok(value) => panic!("expected error, got {value:?}"),
            Err(err) => err,
        }
    }

    fn fixture_date() -> Date {
        must_ok(Date::from_calendar_date(2026, time::Month::February, 7))
    }

    fn hold() -> RunTransition {
        RunTransition::Hold {
            reason: "chiller door left open".to_string(),
        }
    }

    #[test]
    fn run_code_is_composed_and_validated() {
        let code = must_ok(RunCode::compose(fixture_date(), "DUNA", 7));
        assert_eq!(code.as_str(), "RUN-20260207-DUNA-0007");
        assert_eq!(code.sequence(), 7);
        assert!(RunCode::compose(fixture_date(), "duna", 1).is_err());
        assert!(matches!(
            RunCode::compose(fixture_date(), "DUNA", 10_000),
            Err(WarehouseError::Conflict(_))
        ));
        assert!(RunCode::parse("RUN-2026020-DUNA-0001").is_err());
        assert!(RunCode::parse("RUN-20260207-DUNA-0001-X").is_err());
        assert!(RunCode::parse("RUN-20260207-DUNA-0001").is_ok());
    }

    #[test]
    fn start_opens_step_zero() {
        let plan = must_ok(plan_transition(
            RunStatus::Idle,
            0,
            &RunTransition::Start,
            &GuardFacts::default(),
        ));
        assert_eq!(plan.to_status, RunStatus::Running);
        assert_eq!(plan.open_step, Some(0));
        assert!(plan.marks_started);
        assert_eq!(step_node_id(0), "start");
        assert_eq!(step_node_id(4), "step-4");
    }

    #[test]
    fn start_requires_idle() {
        let err = must_err(plan_transition(
            RunStatus::Running,
            0,
            &RunTransition::Start,
            &GuardFacts::default(),
        ));
        assert_eq!(
            err,
            WarehouseError::Precondition(
                "Cannot start run in RUNNING status. Must be IDLE.".to_string()
            )
        );
    }

    #[test]
    fn advance_closes_current_and_opens_next() {
        let plan = must_ok(plan_transition(
            RunStatus::Running,
            3,
            &RunTransition::Advance,
            &GuardFacts::default(),
        ));
        assert_eq!(plan.close_step, Some(3));
        assert_eq!(plan.open_step, Some(4));
        assert_eq!(plan.to_step, 4);
    }

    #[test]
    fn advance_at_final_step_is_rejected() {
        let err = must_err(plan_transition(
            RunStatus::Running,
            FINAL_STEP_INDEX,
            &RunTransition::Advance,
            &GuardFacts::default(),
        ));
        assert!(err.message().contains("final step (10)"));
    }

    #[test]
    fn advance_is_blocked_by_open_qc_and_held_lots() {
        let guards = GuardFacts {
            unresolved_at_step: vec![OpenFinding {
                lot_id: LotId::new(),
                step_index: 2,
                decision: Decision::Hold,
            }],
            ..GuardFacts::default()
        };
        let err = must_err(plan_transition(
            RunStatus::Running,
            2,
            &RunTransition::Advance,
            &guards,
        ));
        assert!(err.message().contains("is HOLD"));

        let guards = GuardFacts {
            held_lots_at_step: vec!["LOT-A".to_string()],
            ..GuardFacts::default()
        };
        let err = must_err(plan_transition(
            RunStatus::Running,
            2,
            &RunTransition::Advance,
            &guards,
        ));
        assert!(err.message().contains("LOT-A"));
    }

    #[test]
    fn complete_requires_final_step_and_passing_qc() {
        let err = must_err(plan_transition(
            RunStatus::Running,
            9,
            &RunTransition::Complete,
            &GuardFacts::default(),
        ));
        assert!(err.message().contains("Current step: 9"));

        let guards = GuardFacts {
            unresolved_in_run: vec![OpenFinding {
                lot_id: LotId::new(),
                step_index: 4,
                decision: Decision::Fail,
            }],
            ..GuardFacts::default()
        };
        assert!(plan_transition(
            RunStatus::Running,
            FINAL_STEP_INDEX,
            &RunTransition::Complete,
            &guards
        )
        .is_err());

        let plan = must_ok(plan_transition(
            RunStatus::Running,
            FINAL_STEP_INDEX,
            &RunTransition::Complete,
            &GuardFacts::default(),
        ));
        assert_eq!(plan.close_step, Some(FINAL_STEP_INDEX));
        assert!(plan.marks_completed && plan.marks_ended);
    }

    #[test]
    fn hold_resume_abort_follow_status_rules() {
        let plan = must_ok(plan_transition(
            RunStatus::Running,
            5,
            &hold(),
            &GuardFacts::default(),
        ));
        assert_eq!(plan.to_status, RunStatus::Hold);
        assert_eq!(plan.note.as_deref(), Some("chiller door left open"));
        assert!(plan.close_step.is_none() && plan.open_step.is_none());

        let resume = RunTransition::Resume {
            resolution: "door closed, product re-checked".to_string(),
        };
        assert!(plan_transition(RunStatus::Running, 5, &resume, &GuardFacts::default()).is_err());
        assert!(plan_transition(RunStatus::Hold, 5, &resume, &GuardFacts::default()).is_ok());

        let abort = RunTransition::Abort {
            reason: "contamination suspected".to_string(),
        };
        assert!(plan_transition(RunStatus::Hold, 5, &abort, &GuardFacts::default()).is_ok());
        let err = must_err(plan_transition(
            RunStatus::Idle,
            0,
            &abort,
            &GuardFacts::default(),
        ));
        assert!(err.message().contains("Must be RUNNING or HOLD"));
    }

    #[test]
    fn short_notes_are_rejected() {
        let err = must_err(plan_transition(
            RunStatus::Running,
            1,
            &RunTransition::Hold {
                reason: "too short".to_string(),
            },
            &GuardFacts::default(),
        ));
        assert_eq!(err.code(), "validation_error");
    }

    fn transition_from_code(code: u8) -> RunTransition {
        match code % 6 {
            0 => RunTransition::Start,
            1 => RunTransition::Advance,
            2 => hold(),
            3 => RunTransition::Resume {
                resolution: "issue resolved on line".to_string(),
            },
            4 => RunTransition::Complete,
            _ => RunTransition::Abort {
                reason: "operator aborted the run".to_string(),
            },
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_step_index_is_monotonic_and_bounded(codes in prop::collection::vec(0u8..6, 1..80)) {
            let mut status = RunStatus::Idle;
            let mut step = 0_u8;
            for code in codes {
                let transition = transition_from_code(code);
                if let Ok(plan) = plan_transition(status, step, &transition, &GuardFacts::default()) {
                    prop_assert!(plan.to_step >= step);
                    prop_assert!(plan.to_step <= FINAL_STEP_INDEX);
                    if matches!(transition, RunTransition::Start) {
                        prop_assert_eq!(status, RunStatus::Idle);
                    }
                    if matches!(transition, RunTransition::Complete) {
                        prop_assert_eq!(step, FINAL_STEP_INDEX);
                    }
                    status = plan.to_status;
                    step = plan.to_step;
                }
            }
        }
    }
}
