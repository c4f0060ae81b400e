#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Instant;

use tracing::{info, warn};
use warden_engines::approval::{ApprovalWorkflow, HumanDecision, WorkflowRefusal};
use warden_engines::threshold::ThresholdPolicy;
use warden_engines::verifier::{
    sample_sha256_hex, VerificationClient, VerificationError, VerifierResponse,
};
use warden_kernel_contracts::bioverify::{
    BiometricSample, PolicyClassification, VerificationFailureKind, VerificationId,
    VerificationRecord, VerificationRecordInput,
};
use warden_kernel_contracts::comment::{CommentId, CommentInput};
use warden_kernel_contracts::report::{
    ActorId, Report, ReportId, ReportState, ReportTransitionRecord, ReportVersion, SubjectId,
};
use warden_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use warden_storage::repo::{ReportRepo, VerificationRecordRepo, WorkflowRepo};
use warden_storage::store::StorageError;

use crate::comment_thread::{append_comment_locked, CommentThread};
use crate::config::WorkflowConfig;

/// Author recorded on comments the gateway writes itself.
pub const WORKFLOW_SYSTEM_ACTOR: &str = "warden_workflow";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Refused(#[from] WorkflowRefusal),
    #[error("report {report_id} not found")]
    ReportNotFound { report_id: String },
    #[error("invalid sample: {0}")]
    InvalidSample(ContractViolation),
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ContractViolation),
    /// The verifier never produced a usable answer. The attempt is recorded and the report
    /// is back in `Pending`.
    #[error("{error}")]
    Verification {
        error: VerificationError,
        record_id: VerificationId,
        report: Box<Report>,
    },
    #[error("storage: {0}")]
    Storage(StorageError),
    #[error("workflow store lock poisoned")]
    LockPoisoned,
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                expected, actual, ..
            } => GatewayError::Refused(WorkflowRefusal::StaleVersion { expected, actual }),
            StorageError::NotFound { key, .. } => GatewayError::ReportNotFound { report_id: key },
            other => GatewayError::Storage(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationCycleRequest {
    pub report_id: ReportId,
    pub expected_version: ReportVersion,
    pub actor_id: Option<ActorId>,
    pub sample: BiometricSample,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCycleOutcome {
    pub report: Report,
    pub record: VerificationRecord,
    pub classification: PolicyClassification,
    pub comment_id: CommentId,
    pub awaiting_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub report_id: ReportId,
    pub expected_version: ReportVersion,
    pub actor_id: ActorId,
    pub decision: HumanDecision,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmOutcome {
    pub report: Report,
    pub comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub report: Report,
    /// Present only when a stale verification was reverted.
    pub record: Option<VerificationRecord>,
    pub comment_id: Option<CommentId>,
}

pub type GatewayClock = Arc<dyn Fn() -> MonotonicTimeNs + Send + Sync>;

fn process_monotonic_now() -> MonotonicTimeNs {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    MonotonicTimeNs(u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX))
}

/// The only component that mutates report state. Orchestrates verifier, policy, workflow and
/// persistence for one report at a time; the store lock is never held across the verifier call.
pub struct WorkflowGateway<S, V> {
    store: Arc<Mutex<S>>,
    verifier: V,
    policy: ThresholdPolicy,
    workflow: ApprovalWorkflow,
    config: WorkflowConfig,
    stale_after_ns: u64,
    clock: GatewayClock,
}

impl<S, V> WorkflowGateway<S, V>
where
    S: WorkflowRepo,
    V: VerificationClient,
{
    pub fn new(
        store: Arc<Mutex<S>>,
        verifier: V,
        policy: ThresholdPolicy,
        config: WorkflowConfig,
    ) -> Self {
        let stale_after_ns = config.effective_stale_after_ns(verifier.call_timeout());
        if stale_after_ns > config.stale_after_ns() {
            warn!(
                configured_ms = config.stale_verification_ms,
                effective_ms = stale_after_ns / 1_000_000,
                "stale window raised to cover the longest verification cycle"
            );
        }
        Self {
            store,
            verifier,
            policy,
            workflow: ApprovalWorkflow::new(config.approval_workflow_config()),
            config,
            stale_after_ns,
            clock: Arc::new(process_monotonic_now),
        }
    }

    pub fn with_clock(mut self, clock: GatewayClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Stale window in force, never shorter than a full verification cycle.
    pub fn stale_after_ns(&self) -> u64 {
        self.stale_after_ns
    }

    pub fn policy(&self) -> &ThresholdPolicy {
        &self.policy
    }

    pub fn comment_thread(&self) -> CommentThread<S> {
        CommentThread::new(self.store.clone())
    }

    pub fn now(&self) -> MonotonicTimeNs {
        (self.clock)()
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>, GatewayError> {
        self.store.lock().map_err(|_| GatewayError::LockPoisoned)
    }

    /// Seeds a new `Pending` report. Stands in for the surrounding report CRUD layer.
    pub fn create_report(
        &self,
        report_id: ReportId,
        subject_id: SubjectId,
    ) -> Result<Report, GatewayError> {
        let report = Report::v1_pending(report_id, subject_id, self.now())?;
        let mut store = self.lock()?;
        store.insert_report_row(report.clone())?;
        Ok(report)
    }

    pub fn report(&self, report_id: &ReportId) -> Result<Report, GatewayError> {
        let store = self.lock()?;
        load_report(&*store, report_id)
    }

    pub fn verification_records(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<VerificationRecord>, GatewayError> {
        let store = self.lock()?;
        load_report(&*store, report_id)?;
        Ok(store
            .verification_rows_for_report(report_id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn report_transitions(
        &self,
        report_id: &ReportId,
    ) -> Result<Vec<ReportTransitionRecord>, GatewayError> {
        let store = self.lock()?;
        load_report(&*store, report_id)?;
        Ok(store
            .report_transition_rows(report_id)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn run_verification_cycle(
        &self,
        req: VerificationCycleRequest,
    ) -> Result<VerificationCycleOutcome, GatewayError> {
        // Rejected samples never touch the report.
        req.sample.validate().map_err(GatewayError::InvalidSample)?;
        let sample_sha256 = sample_sha256_hex(&req.sample);

        let began = {
            let mut store = self.lock()?;
            let report = load_report(&*store, &req.report_id)?;
            let transition = self.workflow.begin_verification(
                &report,
                req.expected_version,
                req.actor_id.clone(),
                self.now(),
            )?;
            store.compare_and_set_report_row(&req.report_id, transition)?
        };
        info!(
            report_id = req.report_id.as_str(),
            version = began.version.0,
            sample_len = req.sample.len(),
            sample_sha256 = sample_sha256.as_str(),
            "verification started"
        );

        let (result, attempts) = self.verify_with_retry(&began.subject_id, &req.sample);

        let mut store = self.lock()?;
        let now = self.now();
        match result {
            Ok(response) => self.commit_answer(
                &mut *store,
                &began,
                response,
                sample_sha256,
                attempts,
                now,
            ),
            Err(error) => {
                let (record_id, report) = self.commit_failure(
                    &mut *store,
                    &began,
                    &error,
                    sample_sha256,
                    attempts,
                    now,
                )?;
                Err(GatewayError::Verification {
                    error,
                    record_id,
                    report: Box::new(report),
                })
            }
        }
    }

    fn verify_with_retry(
        &self,
        subject_id: &SubjectId,
        sample: &BiometricSample,
    ) -> (Result<VerifierResponse, VerificationError>, u8) {
        let mut attempt: u8 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.verifier.verify(subject_id, sample) {
                Ok(response) => return (Ok(response), attempt),
                Err(err) if err.is_transient() && attempt <= self.config.max_transport_retries => {
                    let backoff = self.config.backoff_for_retry(attempt);
                    warn!(
                        subject_id = subject_id.as_str(),
                        attempt,
                        failure = err.failure_kind().as_str(),
                        backoff_ms = backoff.as_millis() as u64,
                        "verifier attempt failed; retrying"
                    );
                    if !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    fn commit_answer(
        &self,
        store: &mut S,
        began: &Report,
        response: VerifierResponse,
        sample_sha256: String,
        attempts: u8,
        now: MonotonicTimeNs,
    ) -> Result<VerificationCycleOutcome, GatewayError> {
        let m = response.verifier_match;
        let classification = self.policy.classify(m.score, m.quality);
        // The attempt is recorded before the transition so it survives a lost CAS.
        let record_id = store.append_verification_row(VerificationRecordInput::resolved_v1(
            began.report_id.clone(),
            now,
            m,
            classification,
            response.raw_response,
            Some(sample_sha256),
            attempts,
        )?)?;
        let record = load_verification(store, record_id)?;
        let transition = self.workflow.record_outcome(
            began,
            began.version,
            classification,
            m.matched,
            record_id,
            now,
        )?;
        let report = store.compare_and_set_report_row(&began.report_id, transition)?;
        let body = outcome_comment_body(&self.policy, &record, &report);
        let comment = append_comment_locked(
            store,
            CommentInput::v1(
                began.report_id.clone(),
                system_actor()?,
                body,
                now,
                Some(format!("verification_outcome:{}", record_id.0)),
            )?,
        )?;
        info!(
            report_id = report.report_id.as_str(),
            verification_id = record_id.0,
            classification = classification.as_str(),
            outcome = record.outcome.as_str(),
            state = report.state.as_str(),
            version = report.version.0,
            attempts,
            "verification resolved"
        );
        Ok(VerificationCycleOutcome {
            awaiting_confirmation: report.state == ReportState::UnderReview,
            report,
            record,
            classification,
            comment_id: comment.comment_id,
        })
    }

    fn commit_failure(
        &self,
        store: &mut S,
        began: &Report,
        error: &VerificationError,
        sample_sha256: String,
        attempts: u8,
        now: MonotonicTimeNs,
    ) -> Result<(VerificationId, Report), GatewayError> {
        let failure = error.failure_kind();
        let record_id = store.append_verification_row(VerificationRecordInput::inconclusive_v1(
            began.report_id.clone(),
            now,
            failure,
            error.detail().to_string(),
            Some(sample_sha256),
            attempts,
        )?)?;
        let transition =
            self.workflow
                .record_failure(began, began.version, failure, record_id, now)?;
        let report = store.compare_and_set_report_row(&began.report_id, transition)?;
        append_comment_locked(
            store,
            CommentInput::v1(
                began.report_id.clone(),
                system_actor()?,
                failure_comment_body(failure, attempts),
                now,
                Some(format!("verification_outcome:{}", record_id.0)),
            )?,
        )?;
        warn!(
            report_id = report.report_id.as_str(),
            verification_id = record_id.0,
            failure = failure.as_str(),
            attempts,
            version = report.version.0,
            "verification inconclusive"
        );
        Ok((record_id, report))
    }

    /// Records a human decision on a report held in review.
    pub fn confirm(&self, req: ConfirmRequest) -> Result<ConfirmOutcome, GatewayError> {
        let mut store = self.lock()?;
        let report = load_report(&*store, &req.report_id)?;
        let now = self.now();
        let plan = self.workflow.decide(
            &report,
            req.expected_version,
            req.decision,
            req.reason.as_deref(),
            req.actor_id.clone(),
            now,
        )?;
        // Built before the commit so an invalid comment cannot leave a decision without it.
        let comment_input = match req.reason.as_deref().map(str::trim) {
            Some(reason) if !reason.is_empty() => {
                let verb = match req.decision {
                    HumanDecision::Approve => "approved",
                    HumanDecision::Reject => "rejected",
                };
                let body = if plan.deviates_from_policy {
                    format!("report {verb} against policy result: {reason}")
                } else {
                    format!("report {verb}: {reason}")
                };
                Some(CommentInput::v1(
                    req.report_id.clone(),
                    req.actor_id.clone(),
                    body,
                    now,
                    Some(format!("decision:{}", plan.transition.expected_version.next().0)),
                )?)
            }
            _ => None,
        };
        let report = store.compare_and_set_report_row(&req.report_id, plan.transition)?;
        let comment_id = match comment_input {
            Some(input) => Some(append_comment_locked(&mut *store, input)?.comment_id),
            None => None,
        };
        info!(
            report_id = report.report_id.as_str(),
            actor_id = req.actor_id.as_str(),
            decision = req.decision.as_str(),
            deviates_from_policy = plan.deviates_from_policy,
            state = report.state.as_str(),
            version = report.version.0,
            "human decision recorded"
        );
        Ok(ConfirmOutcome { report, comment_id })
    }

    pub fn open_manual_review(
        &self,
        report_id: &ReportId,
        expected_version: ReportVersion,
        actor_id: ActorId,
        reason: &str,
    ) -> Result<ConfirmOutcome, GatewayError> {
        let mut store = self.lock()?;
        let report = load_report(&*store, report_id)?;
        let now = self.now();
        let transition = self.workflow.open_manual_review(
            &report,
            expected_version,
            actor_id.clone(),
            reason,
            now,
        )?;
        let comment_input = CommentInput::v1(
            report_id.clone(),
            actor_id.clone(),
            format!("manual review opened: {}", reason.trim()),
            now,
            Some(format!("manual_review:{}", expected_version.next().0)),
        )?;
        let report = store.compare_and_set_report_row(report_id, transition)?;
        let comment = append_comment_locked(&mut *store, comment_input)?;
        info!(
            report_id = report_id.as_str(),
            actor_id = actor_id.as_str(),
            version = report.version.0,
            "manual review opened"
        );
        Ok(ConfirmOutcome {
            report,
            comment_id: Some(comment.comment_id),
        })
    }

    /// Reverts a verification that has been in flight for longer than the enforced stale
    /// window. Anything else is a no-op returning the current report.
    pub fn reconcile_stale(&self, report_id: &ReportId) -> Result<ReconcileOutcome, GatewayError> {
        let mut store = self.lock()?;
        let report = load_report(&*store, report_id)?;
        let now = self.now();
        if !self
            .workflow
            .is_verification_stale(&report, self.stale_after_ns, now)
        {
            return Ok(ReconcileOutcome {
                report,
                record: None,
                comment_id: None,
            });
        }
        let record_id = store.append_verification_row(VerificationRecordInput::inconclusive_v1(
            report_id.clone(),
            now,
            VerificationFailureKind::Abandoned,
            "verification cycle did not complete".to_string(),
            None,
            0,
        )?)?;
        let record = load_verification(&*store, record_id)?;
        let transition = self.workflow.record_failure(
            &report,
            report.version,
            VerificationFailureKind::Abandoned,
            record_id,
            now,
        )?;
        let reverted = store.compare_and_set_report_row(report_id, transition)?;
        let comment = append_comment_locked(
            &mut *store,
            CommentInput::v1(
                report_id.clone(),
                system_actor()?,
                "verification abandoned: no result within the stale window; report returned to pending"
                    .to_string(),
                now,
                Some(format!("verification_outcome:{}", record_id.0)),
            )?,
        )?;
        warn!(
            report_id = report_id.as_str(),
            verification_id = record_id.0,
            version = reverted.version.0,
            "stale verification reconciled"
        );
        Ok(ReconcileOutcome {
            report: reverted,
            record: Some(record),
            comment_id: Some(comment.comment_id),
        })
    }
}

fn load_report<S: WorkflowRepo>(store: &S, report_id: &ReportId) -> Result<Report, GatewayError> {
    store
        .report_row(report_id)
        .cloned()
        .ok_or_else(|| GatewayError::ReportNotFound {
            report_id: report_id.as_str().to_string(),
        })
}

fn load_verification<S: WorkflowRepo>(
    store: &S,
    verification_id: VerificationId,
) -> Result<VerificationRecord, GatewayError> {
    store
        .verification_row(verification_id)
        .cloned()
        .ok_or_else(|| {
            GatewayError::Storage(StorageError::NotFound {
                table: "verification_ledger.verification_id",
                key: verification_id.0.to_string(),
            })
        })
}

fn system_actor() -> Result<ActorId, GatewayError> {
    Ok(ActorId::new(WORKFLOW_SYSTEM_ACTOR)?)
}

fn outcome_comment_body(
    policy: &ThresholdPolicy,
    record: &VerificationRecord,
    report: &Report,
) -> String {
    let cfg = policy.config();
    let (Some(score), Some(quality), Some(classification)) =
        (record.score(), record.quality(), record.classification)
    else {
        return "verification resolved without a verifier result".to_string();
    };
    match classification {
        PolicyClassification::RejectLowScore => format!(
            "verification rejected: score {} below threshold {}",
            score, cfg.score_min
        ),
        PolicyClassification::RejectLowQuality => format!(
            "verification rejected: quality {} below threshold {}",
            quality, cfg.quality_min
        ),
        PolicyClassification::Accept
            if record.verifier_match.map(|m| !m.matched).unwrap_or(true) =>
        {
            format!(
                "verification rejected: verifier reported no match (score {}, quality {})",
                score, quality
            )
        }
        PolicyClassification::Accept => {
            let tail = if report.state == ReportState::Approved {
                "report approved"
            } else {
                "awaiting confirmation"
            };
            format!(
                "verification matched: score {} (threshold {}), quality {} (threshold {}); {}",
                score, cfg.score_min, quality, cfg.quality_min, tail
            )
        }
    }
}

fn failure_comment_body(failure: VerificationFailureKind, attempts: u8) -> String {
    let what = match failure {
        VerificationFailureKind::Unreachable => "verifier unreachable",
        VerificationFailureKind::Timeout => "verifier timeout",
        VerificationFailureKind::ServerFault => "verifier fault",
        VerificationFailureKind::InvalidSample => "sample rejected by verifier",
        VerificationFailureKind::Abandoned => "verification abandoned",
    };
    let plural = if attempts == 1 { "" } else { "s" };
    format!(
        "verification inconclusive: {what} after {attempts} attempt{plural}; report returned to pending"
    )
}
