#![forbid(unsafe_code)]

use std::env;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use warden_engines::approval::{HumanDecision, WorkflowRefusal};
use warden_engines::threshold::{ThresholdPolicy, ThresholdPolicyConfig};
use warden_engines::verifier::{VerificationClient, VerificationError, VerifierRuntime};
use warden_kernel_contracts::bioverify::{BiometricSample, SampleFormat, VerificationRecord};
use warden_kernel_contracts::comment::Comment;
use warden_kernel_contracts::report::{
    ActorId, Report, ReportId, ReportTransitionRecord, ReportVersion, ReviewHold, SubjectId,
};
use warden_os::config::WorkflowConfig;
use warden_os::gateway::{
    ConfirmRequest, GatewayError, VerificationCycleOutcome, VerificationCycleRequest,
    WorkflowGateway,
};
use warden_storage::store::WardenStore;

pub type AdapterGateway = WorkflowGateway<WardenStore, Box<dyn VerificationClient>>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub auto_approve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CreateReportAdapterRequest {
    pub report_id: String,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReportAdapterView {
    pub report_id: String,
    pub subject_id: String,
    pub state: String,
    pub hold: Option<String>,
    pub last_verification_id: Option<u64>,
    pub version: u64,
    pub created_at_ns: u64,
    pub updated_at_ns: u64,
}

impl ReportAdapterView {
    pub fn from_report(report: &Report) -> Self {
        Self {
            report_id: report.report_id.as_str().to_string(),
            subject_id: report.subject_id.as_str().to_string(),
            state: report.state.as_str().to_string(),
            hold: report.hold.as_ref().map(|h| h.as_str().to_string()),
            last_verification_id: report.last_verification.map(|v| v.0),
            version: report.version.0,
            created_at_ns: report.created_at.0,
            updated_at_ns: report.updated_at.0,
        }
    }

    fn awaiting_confirmation(report: &Report) -> bool {
        matches!(report.hold, Some(ReviewHold::AwaitingConfirmation { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VerifyReportAdapterRequest {
    pub expected_version: u64,
    pub sample_b64: String,
    pub sample_format: Option<String>,
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerificationAdapterView {
    pub verification_id: u64,
    pub attempted_at_ns: u64,
    pub outcome: String,
    pub classification: Option<String>,
    pub failure: Option<String>,
    pub matched: Option<bool>,
    pub score: Option<f32>,
    pub quality: Option<f32>,
    pub attempt_count: u8,
    pub sample_sha256: Option<String>,
    pub raw_response_truncated: bool,
}

impl VerificationAdapterView {
    pub fn from_record(record: &VerificationRecord) -> Self {
        Self {
            verification_id: record.verification_id.0,
            attempted_at_ns: record.attempted_at.0,
            outcome: record.outcome.as_str().to_string(),
            classification: record.classification.map(|c| c.as_str().to_string()),
            failure: record.failure.map(|f| f.as_str().to_string()),
            matched: record.verifier_match.map(|m| m.matched),
            score: record.score().map(|s| s.value()),
            quality: record.quality().map(|q| q.value()),
            attempt_count: record.attempt_count,
            sample_sha256: record.sample_sha256.clone(),
            raw_response_truncated: record.raw_verifier_response_truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VerifyReportAdapterResponse {
    pub status: String,
    pub outcome: String,
    pub classification: String,
    pub awaiting_confirmation: bool,
    pub comment_id: u64,
    pub report: ReportAdapterView,
    pub verification: VerificationAdapterView,
}

impl VerifyReportAdapterResponse {
    fn from_outcome(out: &VerificationCycleOutcome) -> Self {
        Self {
            status: "ok".to_string(),
            outcome: out.record.outcome.as_str().to_string(),
            classification: out.classification.as_str().to_string(),
            awaiting_confirmation: out.awaiting_confirmation,
            comment_id: out.comment_id.0,
            report: ReportAdapterView::from_report(&out.report),
            verification: VerificationAdapterView::from_record(&out.record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfirmReportAdapterRequest {
    pub expected_version: u64,
    pub actor_id: String,
    pub decision: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManualReviewAdapterRequest {
    pub expected_version: u64,
    pub actor_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReportActionAdapterResponse {
    pub status: String,
    pub report: ReportAdapterView,
    pub awaiting_confirmation: bool,
    pub comment_id: Option<u64>,
    pub verification_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppendCommentAdapterRequest {
    pub author_id: String,
    pub body: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommentAdapterView {
    pub comment_id: u64,
    pub author_id: String,
    pub body: String,
    pub created_at_ns: u64,
}

impl CommentAdapterView {
    pub fn from_comment(comment: &Comment) -> Self {
        Self {
            comment_id: comment.comment_id.0,
            author_id: comment.author_id.as_str().to_string(),
            body: comment.body.clone(),
            created_at_ns: comment.created_at.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransitionAdapterView {
    pub transition_seq: u64,
    pub from: String,
    pub to: String,
    pub version_after: u64,
    pub reason_code: String,
    pub actor_id: Option<String>,
    pub at_ns: u64,
}

impl TransitionAdapterView {
    pub fn from_record(record: &ReportTransitionRecord) -> Self {
        Self {
            transition_seq: record.transition_seq,
            from: record.from.as_str().to_string(),
            to: record.to.as_str().to_string(),
            version_after: record.version_after.0,
            reason_code: record.reason_code.to_string(),
            actor_id: record.actor.as_ref().map(|a| a.as_str().to_string()),
            at_ns: record.at.0,
        }
    }
}

/// Error body returned by every route. `http_status` drives the response code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub outcome: String,
    pub reason: String,
    #[serde(skip)]
    pub http_status: u16,
    pub report: Option<ReportAdapterView>,
    pub verification_id: Option<u64>,
}

impl AdapterErrorResponse {
    fn new(http_status: u16, outcome: &str, reason: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            outcome: outcome.to_string(),
            reason: reason.into(),
            http_status,
            report: None,
            verification_id: None,
        }
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(400, "INVALID_INPUT", reason)
    }
}

impl From<GatewayError> for AdapterErrorResponse {
    fn from(err: GatewayError) -> Self {
        let reason = err.to_string();
        match err {
            GatewayError::Refused(refusal) => {
                let (status, outcome) = match refusal {
                    WorkflowRefusal::NotEligible { .. } => (409, "NOT_ELIGIBLE"),
                    WorkflowRefusal::AlreadyInProgress => (409, "ALREADY_IN_PROGRESS"),
                    WorkflowRefusal::StaleVersion { .. } => (409, "STALE_VERSION"),
                    WorkflowRefusal::NotAwaitingDecision { .. } => (409, "NOT_AWAITING_DECISION"),
                    WorkflowRefusal::NotVerifying => (409, "NOT_VERIFYING"),
                    WorkflowRefusal::ReasonRequired => (400, "REASON_REQUIRED"),
                };
                Self::new(status, outcome, reason)
            }
            GatewayError::ReportNotFound { .. } => Self::new(404, "REPORT_NOT_FOUND", reason),
            GatewayError::InvalidSample(_) => Self::new(400, "INVALID_SAMPLE", reason),
            GatewayError::InvalidInput(_) => Self::bad_request(reason),
            GatewayError::Verification {
                error,
                record_id,
                report,
            } => {
                let (status, outcome) = match error {
                    VerificationError::InvalidSample { .. } => (400, "INVALID_SAMPLE"),
                    VerificationError::Timeout { .. } => (504, "VERIFIER_TIMEOUT"),
                    VerificationError::Unreachable { .. } => (502, "VERIFIER_UNREACHABLE"),
                    VerificationError::ServerFault { .. } => (502, "VERIFIER_SERVER_FAULT"),
                };
                let mut out = Self::new(status, outcome, reason);
                out.report = Some(ReportAdapterView::from_report(&report));
                out.verification_id = Some(record_id.0);
                out
            }
            GatewayError::Storage(_) => Self::new(500, "STORAGE_ERROR", reason),
            GatewayError::LockPoisoned => Self::new(500, "INTERNAL", reason),
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterErrorResponse>;

pub struct AdapterRuntime {
    gateway: AdapterGateway,
}

impl AdapterRuntime {
    pub fn new(gateway: AdapterGateway) -> Self {
        Self { gateway }
    }

    pub fn default_from_env() -> Result<Self, String> {
        let policy = ThresholdPolicy::new(ThresholdPolicyConfig::from_env())
            .map_err(|err| format!("threshold policy config invalid: {err}"))?;
        let config = WorkflowConfig::from_env();
        let verifier: Box<dyn VerificationClient> =
            Box::new(VerifierRuntime::from_env_or_loopback());
        let store = Arc::new(Mutex::new(WardenStore::new_in_memory()));
        Ok(Self::new(WorkflowGateway::new(store, verifier, policy, config)))
    }

    pub fn health(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            auto_approve: self.gateway.config().auto_approve,
        }
    }

    pub fn create_report(
        &self,
        request: CreateReportAdapterRequest,
    ) -> AdapterResult<ReportAdapterView> {
        let report_id = parse_report_id(&request.report_id)?;
        let subject_id = SubjectId::new(request.subject_id)
            .map_err(|err| AdapterErrorResponse::bad_request(err.to_string()))?;
        let report = self
            .gateway
            .create_report(report_id, subject_id)
            .map_err(|err| match err {
                GatewayError::Storage(warden_storage::store::StorageError::DuplicateKey {
                    ..
                }) => AdapterErrorResponse::new(409, "DUPLICATE_REPORT", err.to_string()),
                other => other.into(),
            })?;
        Ok(ReportAdapterView::from_report(&report))
    }

    pub fn get_report(&self, report_id: &str) -> AdapterResult<ReportAdapterView> {
        let report = self.gateway.report(&parse_report_id(report_id)?)?;
        Ok(ReportAdapterView::from_report(&report))
    }

    pub fn run_verification(
        &self,
        report_id: &str,
        request: VerifyReportAdapterRequest,
    ) -> AdapterResult<VerifyReportAdapterResponse> {
        let report_id = parse_report_id(report_id)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(request.sample_b64.trim())
            .map_err(|_| {
                AdapterErrorResponse::new(400, "INVALID_SAMPLE", "sample_b64 is not valid base64")
            })?;
        let format = request
            .sample_format
            .as_deref()
            .map(SampleFormat::parse)
            .transpose()
            .map_err(|err| AdapterErrorResponse::new(400, "INVALID_SAMPLE", err.to_string()))?;
        let sample = BiometricSample::v1(bytes, format)
            .map_err(|err| AdapterErrorResponse::new(400, "INVALID_SAMPLE", err.to_string()))?;
        let actor_id = request.actor_id.map(parse_actor_id).transpose()?;
        let out = self.gateway.run_verification_cycle(VerificationCycleRequest {
            report_id,
            expected_version: ReportVersion(request.expected_version),
            actor_id,
            sample,
        })?;
        Ok(VerifyReportAdapterResponse::from_outcome(&out))
    }

    /// Runs the cycle on tokio's blocking pool so the verifier call never parks an async worker.
    pub async fn run_verification_async(
        self: Arc<Self>,
        report_id: String,
        request: VerifyReportAdapterRequest,
    ) -> AdapterResult<VerifyReportAdapterResponse> {
        tokio::task::spawn_blocking(move || self.run_verification(&report_id, request))
            .await
            .map_err(|err| {
                let reason = format!("verification task failed: {err}");
                AdapterErrorResponse::new(500, "INTERNAL", reason)
            })?
    }

    pub fn confirm(
        &self,
        report_id: &str,
        request: ConfirmReportAdapterRequest,
    ) -> AdapterResult<ReportActionAdapterResponse> {
        let decision = match request.decision.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => HumanDecision::Approve,
            "REJECT" => HumanDecision::Reject,
            _ => {
                return Err(AdapterErrorResponse::bad_request(
                    "decision must be APPROVE or REJECT",
                ))
            }
        };
        let out = self.gateway.confirm(ConfirmRequest {
            report_id: parse_report_id(report_id)?,
            expected_version: ReportVersion(request.expected_version),
            actor_id: parse_actor_id(request.actor_id)?,
            decision,
            reason: request.reason,
        })?;
        Ok(action_response(&out.report, out.comment_id.map(|c| c.0), None))
    }

    pub fn open_manual_review(
        &self,
        report_id: &str,
        request: ManualReviewAdapterRequest,
    ) -> AdapterResult<ReportActionAdapterResponse> {
        let out = self.gateway.open_manual_review(
            &parse_report_id(report_id)?,
            ReportVersion(request.expected_version),
            parse_actor_id(request.actor_id)?,
            &request.reason,
        )?;
        Ok(action_response(&out.report, out.comment_id.map(|c| c.0), None))
    }

    pub fn reconcile(&self, report_id: &str) -> AdapterResult<ReportActionAdapterResponse> {
        let out = self.gateway.reconcile_stale(&parse_report_id(report_id)?)?;
        Ok(action_response(
            &out.report,
            out.comment_id.map(|c| c.0),
            out.record.map(|r| r.verification_id.0),
        ))
    }

    pub fn list_comments(&self, report_id: &str) -> AdapterResult<Vec<CommentAdapterView>> {
        let comments = self
            .gateway
            .comment_thread()
            .list(&parse_report_id(report_id)?)?;
        Ok(comments.iter().map(CommentAdapterView::from_comment).collect())
    }

    pub fn append_comment(
        &self,
        report_id: &str,
        request: AppendCommentAdapterRequest,
    ) -> AdapterResult<CommentAdapterView> {
        let comment = self.gateway.comment_thread().append(
            &parse_report_id(report_id)?,
            parse_actor_id(request.author_id)?,
            request.body,
            self.gateway.now(),
            request.idempotency_key,
        )?;
        Ok(CommentAdapterView::from_comment(&comment))
    }

    pub fn list_verifications(
        &self,
        report_id: &str,
    ) -> AdapterResult<Vec<VerificationAdapterView>> {
        let records = self
            .gateway
            .verification_records(&parse_report_id(report_id)?)?;
        Ok(records
            .iter()
            .map(VerificationAdapterView::from_record)
            .collect())
    }

    pub fn list_transitions(&self, report_id: &str) -> AdapterResult<Vec<TransitionAdapterView>> {
        let rows = self
            .gateway
            .report_transitions(&parse_report_id(report_id)?)?;
        Ok(rows.iter().map(TransitionAdapterView::from_record).collect())
    }
}

fn action_response(
    report: &Report,
    comment_id: Option<u64>,
    verification_id: Option<u64>,
) -> ReportActionAdapterResponse {
    ReportActionAdapterResponse {
        status: "ok".to_string(),
        report: ReportAdapterView::from_report(report),
        awaiting_confirmation: ReportAdapterView::awaiting_confirmation(report),
        comment_id,
        verification_id,
    }
}

fn parse_report_id(raw: &str) -> AdapterResult<ReportId> {
    ReportId::new(raw).map_err(|err| AdapterErrorResponse::bad_request(err.to_string()))
}

fn parse_actor_id(raw: String) -> AdapterResult<ActorId> {
    ActorId::new(raw).map_err(|err| AdapterErrorResponse::bad_request(err.to_string()))
}

pub fn http_bind_from_env() -> String {
    env::var("WARDEN_HTTP_BIND")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
}
