#![forbid(unsafe_code)]

use std::fmt;

use crate::common::validate_percent;
use crate::report::ReportId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const BIOVERIFY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Upper bound for a single capture handed to the verifier.
pub const SAMPLE_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Raw verifier payloads are kept for audit only; anything beyond this is truncated.
pub const RAW_VERIFIER_RESPONSE_MAX_CHARS: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    Png,
    Jpeg,
    /// Wavelet scalar quantization, the usual fingerprint image encoding.
    Wsq,
    Raw,
}

impl SampleFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Wsq => "wsq",
            Self::Raw => "raw",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "wsq" => Ok(Self::Wsq),
            "raw" => Ok(Self::Raw),
            _ => Err(ContractViolation::InvalidValue {
                field: "sample_format",
                reason: "must be one of png, jpeg, wsq, raw",
            }),
        }
    }
}

/// A biometric capture travelling from the caller to the verifier. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct BiometricSample {
    bytes: Vec<u8>,
    format: Option<SampleFormat>,
}

impl BiometricSample {
    pub fn v1(bytes: Vec<u8>, format: Option<SampleFormat>) -> Result<Self, ContractViolation> {
        let s = Self { bytes, format };
        s.validate()?;
        Ok(s)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> Option<SampleFormat> {
        self.format
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Sample bytes stay out of debug output and logs.
impl fmt::Debug for BiometricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiometricSample")
            .field("len", &self.bytes.len())
            .field("format", &self.format)
            .finish()
    }
}

impl Validate for BiometricSample {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.bytes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "biometric_sample.bytes",
                reason: "must not be empty",
            });
        }
        if self.bytes.len() > SAMPLE_MAX_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "biometric_sample.bytes",
                reason: "exceeds SAMPLE_MAX_BYTES",
            });
        }
        Ok(())
    }
}

/// Similarity between the sample and the subject's reference, on [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MatchScore(f32);

impl MatchScore {
    pub fn new(value: f32) -> Result<Self, ContractViolation> {
        validate_percent("match_score", value)?;
        Ok(Self(value))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl fmt::Display for MatchScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Usability of the capture itself, on [0, 100], independent of any match.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct SampleQuality(f32);

impl SampleQuality {
    pub fn new(value: f32) -> Result<Self, ContractViolation> {
        validate_percent("sample_quality", value)?;
        Ok(Self(value))
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl fmt::Display for SampleQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result shape every verifier transport must produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifierMatch {
    pub matched: bool,
    pub score: MatchScore,
    pub quality: SampleQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyClassification {
    Accept,
    RejectLowScore,
    RejectLowQuality,
}

impl PolicyClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::RejectLowScore => "REJECT_LOW_SCORE",
            Self::RejectLowQuality => "REJECT_LOW_QUALITY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    Matched,
    NotMatched,
    Inconclusive,
}

impl VerificationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::NotMatched => "NOT_MATCHED",
            Self::Inconclusive => "INCONCLUSIVE",
        }
    }
}

/// Why an attempt produced no usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationFailureKind {
    Unreachable,
    Timeout,
    ServerFault,
    InvalidSample,
    /// The cycle never resolved and was reverted by a stale-state recovery check.
    Abandoned,
}

impl VerificationFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "UNREACHABLE",
            Self::Timeout => "TIMEOUT",
            Self::ServerFault => "SERVER_FAULT",
            Self::InvalidSample => "INVALID_SAMPLE",
            Self::Abandoned => "ABANDONED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerificationId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecordInput {
    pub schema_version: SchemaVersion,
    pub report_id: ReportId,
    pub attempted_at: MonotonicTimeNs,
    pub verifier_match: Option<VerifierMatch>,
    pub classification: Option<PolicyClassification>,
    pub outcome: VerificationOutcome,
    pub failure: Option<VerificationFailureKind>,
    pub raw_verifier_response: String,
    /// Set when `raw_verifier_response` was cut to `RAW_VERIFIER_RESPONSE_MAX_CHARS`.
    pub raw_verifier_response_truncated: bool,
    pub sample_sha256: Option<String>,
    pub attempt_count: u8,
}

impl VerificationRecordInput {
    /// An attempt where the verifier answered. `Matched` requires both a policy accept and the
    /// verifier's own match flag.
    #[allow(clippy::too_many_arguments)]
    pub fn resolved_v1(
        report_id: ReportId,
        attempted_at: MonotonicTimeNs,
        verifier_match: VerifierMatch,
        classification: PolicyClassification,
        raw_verifier_response: String,
        sample_sha256: Option<String>,
        attempt_count: u8,
    ) -> Result<Self, ContractViolation> {
        let outcome = if classification == PolicyClassification::Accept && verifier_match.matched
        {
            VerificationOutcome::Matched
        } else {
            VerificationOutcome::NotMatched
        };
        let (raw_verifier_response, raw_verifier_response_truncated) =
            bounded_raw(raw_verifier_response);
        let r = Self {
            schema_version: BIOVERIFY_CONTRACT_VERSION,
            report_id,
            attempted_at,
            verifier_match: Some(verifier_match),
            classification: Some(classification),
            outcome,
            failure: None,
            raw_verifier_response,
            raw_verifier_response_truncated,
            sample_sha256,
            attempt_count,
        };
        r.validate()?;
        Ok(r)
    }

    /// An attempt that produced no usable result.
    pub fn inconclusive_v1(
        report_id: ReportId,
        attempted_at: MonotonicTimeNs,
        failure: VerificationFailureKind,
        raw_verifier_response: String,
        sample_sha256: Option<String>,
        attempt_count: u8,
    ) -> Result<Self, ContractViolation> {
        let (raw_verifier_response, raw_verifier_response_truncated) =
            bounded_raw(raw_verifier_response);
        let r = Self {
            schema_version: BIOVERIFY_CONTRACT_VERSION,
            report_id,
            attempted_at,
            verifier_match: None,
            classification: None,
            outcome: VerificationOutcome::Inconclusive,
            failure: Some(failure),
            raw_verifier_response,
            raw_verifier_response_truncated,
            sample_sha256,
            attempt_count,
        };
        r.validate()?;
        Ok(r)
    }
}

fn bounded_raw(raw: String) -> (String, bool) {
    if raw.chars().count() > RAW_VERIFIER_RESPONSE_MAX_CHARS {
        (raw.chars().take(RAW_VERIFIER_RESPONSE_MAX_CHARS).collect(), true)
    } else {
        (raw, false)
    }
}

impl Validate for VerificationRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != BIOVERIFY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "verification_record_input.schema_version",
                reason: "must match BIOVERIFY_CONTRACT_VERSION",
            });
        }
        self.report_id.validate()?;
        match self.outcome {
            VerificationOutcome::Inconclusive => {
                if self.failure.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "verification_record_input.failure",
                        reason: "must be present when outcome is INCONCLUSIVE",
                    });
                }
                if self.verifier_match.is_some() || self.classification.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "verification_record_input.verifier_match",
                        reason: "must be absent when outcome is INCONCLUSIVE",
                    });
                }
            }
            VerificationOutcome::Matched | VerificationOutcome::NotMatched => {
                if self.failure.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "verification_record_input.failure",
                        reason: "must be absent when the verifier answered",
                    });
                }
                let (Some(m), Some(c)) = (self.verifier_match, self.classification) else {
                    return Err(ContractViolation::InvalidValue {
                        field: "verification_record_input.verifier_match",
                        reason: "must be present when the verifier answered",
                    });
                };
                let matched = c == PolicyClassification::Accept && m.matched;
                if matched != (self.outcome == VerificationOutcome::Matched) {
                    return Err(ContractViolation::InvalidValue {
                        field: "verification_record_input.outcome",
                        reason: "MATCHED requires ACCEPT and a verifier match",
                    });
                }
            }
        }
        if self.raw_verifier_response.chars().count() > RAW_VERIFIER_RESPONSE_MAX_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "verification_record_input.raw_verifier_response",
                reason: "exceeds RAW_VERIFIER_RESPONSE_MAX_CHARS",
            });
        }
        if let Some(digest) = &self.sample_sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ContractViolation::InvalidValue {
                    field: "verification_record_input.sample_sha256",
                    reason: "must be 64 hex chars",
                });
            }
        }
        if self.attempt_count == 0 && self.failure != Some(VerificationFailureKind::Abandoned) {
            return Err(ContractViolation::InvalidValue {
                field: "verification_record_input.attempt_count",
                reason: "must be > 0 unless the attempt was abandoned",
            });
        }
        Ok(())
    }
}

/// Immutable audit row for one verification attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRecord {
    pub schema_version: SchemaVersion,
    pub verification_id: VerificationId,
    pub report_id: ReportId,
    pub attempted_at: MonotonicTimeNs,
    pub verifier_match: Option<VerifierMatch>,
    pub classification: Option<PolicyClassification>,
    pub outcome: VerificationOutcome,
    pub failure: Option<VerificationFailureKind>,
    pub raw_verifier_response: String,
    /// Set when `raw_verifier_response` was cut to `RAW_VERIFIER_RESPONSE_MAX_CHARS`.
    pub raw_verifier_response_truncated: bool,
    pub sample_sha256: Option<String>,
    pub attempt_count: u8,
}

impl VerificationRecord {
    pub fn from_input_v1(
        verification_id: VerificationId,
        input: VerificationRecordInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        Ok(Self {
            schema_version: BIOVERIFY_CONTRACT_VERSION,
            verification_id,
            report_id: input.report_id,
            attempted_at: input.attempted_at,
            verifier_match: input.verifier_match,
            classification: input.classification,
            outcome: input.outcome,
            failure: input.failure,
            raw_verifier_response: input.raw_verifier_response,
            raw_verifier_response_truncated: input.raw_verifier_response_truncated,
            sample_sha256: input.sample_sha256,
            attempt_count: input.attempt_count,
        })
    }

    pub fn score(&self) -> Option<MatchScore> {
        self.verifier_match.map(|m| m.score)
    }

    pub fn quality(&self) -> Option<SampleQuality> {
        self.verifier_match.map(|m| m.quality)
    }
}
