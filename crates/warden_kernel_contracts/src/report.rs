#![forbid(unsafe_code)]

use crate::bioverify::VerificationId;
use crate::common::validate_id;
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const REPORT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportId(String);

impl ReportId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("report_id", &v, 128)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ReportId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("report_id", &self.0, 128)
    }
}

/// The person a report concerns; the biometric sample must match this subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("subject_id", &v, 128)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SubjectId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("subject_id", &self.0, 128)
    }
}

/// Caller identity resolved by the session layer (supervisor, reviewer, comment author).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = v.into();
        validate_id("actor_id", &v, 128)?;
        Ok(Self(v))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ActorId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("actor_id", &self.0, 128)
    }
}

/// Optimistic concurrency token. Every committed transition bumps it by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportVersion(pub u64);

impl ReportVersion {
    pub const INITIAL: ReportVersion = ReportVersion(0);

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportState {
    Pending,
    UnderReview,
    Approved,
    Rejected,
}

impl ReportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Legal edges of the approval lifecycle. `UnderReview -> Pending` is the revert edge
    /// for failed attempts; nothing leaves a terminal state.
    pub fn can_transition_to(self, to: ReportState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::UnderReview)
                | (Self::UnderReview, Self::UnderReview)
                | (Self::UnderReview, Self::Pending)
                | (Self::UnderReview, Self::Approved)
                | (Self::UnderReview, Self::Rejected)
        )
    }
}

/// Why a report sits in `UnderReview`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewHold {
    /// A verification cycle is in flight.
    Verifying { started_at: MonotonicTimeNs },
    /// A policy-accepted result waits for an explicit human decision.
    AwaitingConfirmation { verification_id: VerificationId },
    /// A human opened an override review without a passing verification.
    ManualReview {
        opened_by: ActorId,
        opened_at: MonotonicTimeNs,
    },
}

impl ReviewHold {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verifying { .. } => "VERIFYING",
            Self::AwaitingConfirmation { .. } => "AWAITING_CONFIRMATION",
            Self::ManualReview { .. } => "MANUAL_REVIEW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub schema_version: SchemaVersion,
    pub report_id: ReportId,
    pub subject_id: SubjectId,
    pub state: ReportState,
    pub hold: Option<ReviewHold>,
    pub last_verification: Option<VerificationId>,
    pub version: ReportVersion,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

impl Report {
    /// A freshly created report as handed over by the CRUD layer.
    pub fn v1_pending(
        report_id: ReportId,
        subject_id: SubjectId,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: REPORT_CONTRACT_VERSION,
            report_id,
            subject_id,
            state: ReportState::Pending,
            hold: None,
            last_verification: None,
            version: ReportVersion::INITIAL,
            created_at,
            updated_at: created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for Report {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != REPORT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "report.schema_version",
                reason: "must match REPORT_CONTRACT_VERSION",
            });
        }
        self.report_id.validate()?;
        self.subject_id.validate()?;
        match (self.state, &self.hold) {
            (ReportState::UnderReview, None) => {
                return Err(ContractViolation::InvalidValue {
                    field: "report.hold",
                    reason: "must be present while UNDER_REVIEW",
                })
            }
            (ReportState::UnderReview, Some(_)) => {}
            (_, Some(_)) => {
                return Err(ContractViolation::InvalidValue {
                    field: "report.hold",
                    reason: "must be absent outside UNDER_REVIEW",
                })
            }
            (_, None) => {}
        }
        if self.updated_at.0 < self.created_at.0 {
            return Err(ContractViolation::InvalidValue {
                field: "report.updated_at",
                reason: "must be >= created_at",
            });
        }
        Ok(())
    }
}

/// A single conditional write against a report, computed by the approval state machine and
/// committed by the store only if the report still carries `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTransition {
    pub expected_version: ReportVersion,
    pub from: ReportState,
    pub to: ReportState,
    pub hold: Option<ReviewHold>,
    /// When present, replaces `Report::last_verification`.
    pub last_verification: Option<VerificationId>,
    pub reason_code: ReasonCodeId,
    pub actor: Option<ActorId>,
    pub at: MonotonicTimeNs,
}

impl Validate for ReportTransition {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !self.from.can_transition_to(self.to) {
            return Err(ContractViolation::InvalidValue {
                field: "report_transition.to",
                reason: "transition not allowed from current state",
            });
        }
        if (self.to == ReportState::UnderReview) != self.hold.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "report_transition.hold",
                reason: "must be present iff target state is UNDER_REVIEW",
            });
        }
        if let Some(actor) = &self.actor {
            actor.validate()?;
        }
        Ok(())
    }
}

/// Append-only audit row written for every committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTransitionRecord {
    pub schema_version: SchemaVersion,
    pub transition_seq: u64,
    pub report_id: ReportId,
    pub from: ReportState,
    pub to: ReportState,
    pub version_after: ReportVersion,
    pub reason_code: ReasonCodeId,
    pub actor: Option<ActorId>,
    pub at: MonotonicTimeNs,
}
