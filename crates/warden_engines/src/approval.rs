#![forbid(unsafe_code)]

use warden_kernel_contracts::bioverify::{
    PolicyClassification, VerificationFailureKind, VerificationId,
};
use warden_kernel_contracts::report::{
    ActorId, Report, ReportState, ReportTransition, ReportVersion, ReviewHold,
};
use warden_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};

pub mod reason_codes {
    use warden_kernel_contracts::ReasonCodeId;

    // Approval workflow reason-code namespace ("WD").
    pub const WFL_VERIFICATION_STARTED: ReasonCodeId = ReasonCodeId(0x5744_0001);
    pub const WFL_OK_ACCEPT_AUTO_APPROVED: ReasonCodeId = ReasonCodeId(0x5744_0002);
    pub const WFL_OK_ACCEPT_HELD_FOR_CONFIRMATION: ReasonCodeId = ReasonCodeId(0x5744_0003);
    pub const WFL_REJECT_LOW_SCORE: ReasonCodeId = ReasonCodeId(0x5744_0010);
    pub const WFL_REJECT_LOW_QUALITY: ReasonCodeId = ReasonCodeId(0x5744_0011);
    pub const WFL_REJECT_NOT_MATCHED: ReasonCodeId = ReasonCodeId(0x5744_0012);
    pub const WFL_FAIL_VERIFIER_UNREACHABLE: ReasonCodeId = ReasonCodeId(0x5744_0020);
    pub const WFL_FAIL_VERIFIER_TIMEOUT: ReasonCodeId = ReasonCodeId(0x5744_0021);
    pub const WFL_FAIL_VERIFIER_SERVER_FAULT: ReasonCodeId = ReasonCodeId(0x5744_0022);
    pub const WFL_FAIL_INVALID_SAMPLE: ReasonCodeId = ReasonCodeId(0x5744_0023);
    pub const WFL_STALE_RECONCILED: ReasonCodeId = ReasonCodeId(0x5744_0024);
    pub const WFL_HUMAN_APPROVED: ReasonCodeId = ReasonCodeId(0x5744_0030);
    pub const WFL_HUMAN_REJECTED: ReasonCodeId = ReasonCodeId(0x5744_0031);
    pub const WFL_MANUAL_REVIEW_OPENED: ReasonCodeId = ReasonCodeId(0x5744_0032);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowRefusal {
    #[error("report is {} and not eligible for this operation", .state.as_str())]
    NotEligible { state: ReportState },
    #[error("a verification is already in progress for this report")]
    AlreadyInProgress,
    #[error("stale version: caller observed {expected}, report is at {actual}")]
    StaleVersion { expected: u64, actual: u64 },
    #[error("report is {} and not awaiting a human decision", .state.as_str())]
    NotAwaitingDecision { state: ReportState },
    #[error("no verification is in flight for this report")]
    NotVerifying,
    #[error("a reason is required when deviating from policy")]
    ReasonRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRejection {
    LowScore,
    LowQuality,
    /// Thresholds passed but the verifier itself reported no match.
    NotMatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationResolution {
    Accepted,
    Rejected(PolicyRejection),
    Failed(VerificationFailureKind),
}

impl VerificationResolution {
    pub fn from_classification(classification: PolicyClassification, matched: bool) -> Self {
        match classification {
            PolicyClassification::RejectLowQuality => Self::Rejected(PolicyRejection::LowQuality),
            PolicyClassification::RejectLowScore => Self::Rejected(PolicyRejection::LowScore),
            PolicyClassification::Accept if !matched => {
                Self::Rejected(PolicyRejection::NotMatched)
            }
            PolicyClassification::Accept => Self::Accepted,
        }
    }

    pub fn reason_code(self, auto_approve: bool) -> ReasonCodeId {
        match self {
            Self::Accepted if auto_approve => reason_codes::WFL_OK_ACCEPT_AUTO_APPROVED,
            Self::Accepted => reason_codes::WFL_OK_ACCEPT_HELD_FOR_CONFIRMATION,
            Self::Rejected(PolicyRejection::LowScore) => reason_codes::WFL_REJECT_LOW_SCORE,
            Self::Rejected(PolicyRejection::LowQuality) => reason_codes::WFL_REJECT_LOW_QUALITY,
            Self::Rejected(PolicyRejection::NotMatched) => reason_codes::WFL_REJECT_NOT_MATCHED,
            Self::Failed(VerificationFailureKind::Unreachable) => {
                reason_codes::WFL_FAIL_VERIFIER_UNREACHABLE
            }
            Self::Failed(VerificationFailureKind::Timeout) => {
                reason_codes::WFL_FAIL_VERIFIER_TIMEOUT
            }
            Self::Failed(VerificationFailureKind::ServerFault) => {
                reason_codes::WFL_FAIL_VERIFIER_SERVER_FAULT
            }
            Self::Failed(VerificationFailureKind::InvalidSample) => {
                reason_codes::WFL_FAIL_INVALID_SAMPLE
            }
            Self::Failed(VerificationFailureKind::Abandoned) => reason_codes::WFL_STALE_RECONCILED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HumanDecision {
    Approve,
    Reject,
}

impl HumanDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalWorkflowConfig {
    /// When false, a policy accept is held in `UnderReview` until a human confirms it.
    pub auto_approve: bool,
}

impl ApprovalWorkflowConfig {
    pub fn mvp_v1() -> Self {
        Self {
            auto_approve: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPlan {
    pub transition: ReportTransition,
    /// The decision contradicts the policy result and must be explained in a comment.
    pub deviates_from_policy: bool,
}

/// Pure lifecycle rules for a report. Computes transitions; the caller commits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalWorkflow {
    config: ApprovalWorkflowConfig,
}

impl ApprovalWorkflow {
    pub fn new(config: ApprovalWorkflowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ApprovalWorkflowConfig {
        &self.config
    }

    pub fn begin_verification(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        actor: Option<ActorId>,
        now: MonotonicTimeNs,
    ) -> Result<ReportTransition, WorkflowRefusal> {
        match report.state {
            ReportState::Pending => {}
            ReportState::UnderReview => return Err(WorkflowRefusal::AlreadyInProgress),
            state => return Err(WorkflowRefusal::NotEligible { state }),
        }
        check_version(report, expected_version)?;
        Ok(ReportTransition {
            expected_version,
            from: ReportState::Pending,
            to: ReportState::UnderReview,
            hold: Some(ReviewHold::Verifying { started_at: now }),
            last_verification: None,
            reason_code: reason_codes::WFL_VERIFICATION_STARTED,
            actor,
            at: now,
        })
    }

    pub fn resolve_verification(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        resolution: VerificationResolution,
        verification_id: VerificationId,
        now: MonotonicTimeNs,
    ) -> Result<ReportTransition, WorkflowRefusal> {
        if !matches!(report.hold, Some(ReviewHold::Verifying { .. })) {
            return Err(WorkflowRefusal::NotVerifying);
        }
        check_version(report, expected_version)?;
        let (to, hold) = match resolution {
            VerificationResolution::Accepted if self.config.auto_approve => {
                (ReportState::Approved, None)
            }
            VerificationResolution::Accepted => (
                ReportState::UnderReview,
                Some(ReviewHold::AwaitingConfirmation { verification_id }),
            ),
            // A failed or rejected read is inconclusive, not evidence against the report.
            VerificationResolution::Rejected(_) | VerificationResolution::Failed(_) => {
                (ReportState::Pending, None)
            }
        };
        Ok(ReportTransition {
            expected_version,
            from: report.state,
            to,
            hold,
            last_verification: Some(verification_id),
            reason_code: resolution.reason_code(self.config.auto_approve),
            actor: None,
            at: now,
        })
    }

    /// Commits a verifier answer after policy classification.
    pub fn record_outcome(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        classification: PolicyClassification,
        verifier_matched: bool,
        verification_id: VerificationId,
        now: MonotonicTimeNs,
    ) -> Result<ReportTransition, WorkflowRefusal> {
        self.resolve_verification(
            report,
            expected_version,
            VerificationResolution::from_classification(classification, verifier_matched),
            verification_id,
            now,
        )
    }

    /// Reverts an in-flight verification that produced no usable answer.
    pub fn record_failure(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        failure: VerificationFailureKind,
        verification_id: VerificationId,
        now: MonotonicTimeNs,
    ) -> Result<ReportTransition, WorkflowRefusal> {
        self.resolve_verification(
            report,
            expected_version,
            VerificationResolution::Failed(failure),
            verification_id,
            now,
        )
    }

    pub fn decide(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        decision: HumanDecision,
        reason: Option<&str>,
        actor: ActorId,
        now: MonotonicTimeNs,
    ) -> Result<DecisionPlan, WorkflowRefusal> {
        let deviates_from_policy = match (&report.hold, decision) {
            (Some(ReviewHold::AwaitingConfirmation { .. }), HumanDecision::Approve) => false,
            (Some(ReviewHold::AwaitingConfirmation { .. }), HumanDecision::Reject) => true,
            (Some(ReviewHold::ManualReview { .. }), HumanDecision::Approve) => true,
            (Some(ReviewHold::ManualReview { .. }), HumanDecision::Reject) => false,
            _ => {
                return Err(WorkflowRefusal::NotAwaitingDecision {
                    state: report.state,
                })
            }
        };
        check_version(report, expected_version)?;
        if deviates_from_policy && !has_reason(reason) {
            return Err(WorkflowRefusal::ReasonRequired);
        }
        let (to, reason_code) = match decision {
            HumanDecision::Approve => (ReportState::Approved, reason_codes::WFL_HUMAN_APPROVED),
            HumanDecision::Reject => (ReportState::Rejected, reason_codes::WFL_HUMAN_REJECTED),
        };
        Ok(DecisionPlan {
            transition: ReportTransition {
                expected_version,
                from: report.state,
                to,
                hold: None,
                last_verification: None,
                reason_code,
                actor: Some(actor),
                at: now,
            },
            deviates_from_policy,
        })
    }

    pub fn open_manual_review(
        &self,
        report: &Report,
        expected_version: ReportVersion,
        actor: ActorId,
        reason: &str,
        now: MonotonicTimeNs,
    ) -> Result<ReportTransition, WorkflowRefusal> {
        match report.state {
            ReportState::Pending => {}
            ReportState::UnderReview => return Err(WorkflowRefusal::AlreadyInProgress),
            state => return Err(WorkflowRefusal::NotEligible { state }),
        }
        check_version(report, expected_version)?;
        if !has_reason(Some(reason)) {
            return Err(WorkflowRefusal::ReasonRequired);
        }
        Ok(ReportTransition {
            expected_version,
            from: ReportState::Pending,
            to: ReportState::UnderReview,
            hold: Some(ReviewHold::ManualReview {
                opened_by: actor.clone(),
                opened_at: now,
            }),
            last_verification: None,
            reason_code: reason_codes::WFL_MANUAL_REVIEW_OPENED,
            actor: Some(actor),
            at: now,
        })
    }

    /// True when a verification cycle has been in flight for at least `stale_after_ns`.
    pub fn is_verification_stale(
        &self,
        report: &Report,
        stale_after_ns: u64,
        now: MonotonicTimeNs,
    ) -> bool {
        match report.hold {
            Some(ReviewHold::Verifying { started_at }) => {
                now.saturating_elapsed_since(started_at) >= stale_after_ns
            }
            _ => false,
        }
    }
}

fn check_version(report: &Report, expected: ReportVersion) -> Result<(), WorkflowRefusal> {
    if report.version != expected {
        return Err(WorkflowRefusal::StaleVersion {
            expected: expected.0,
            actual: report.version.0,
        });
    }
    Ok(())
}

fn has_reason(reason: Option<&str>) -> bool {
    reason.map(|r| !r.trim().is_empty()).unwrap_or(false)
}
