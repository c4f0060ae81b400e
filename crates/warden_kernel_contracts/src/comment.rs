#![forbid(unsafe_code)]

use crate::common::validate_id;
use crate::report::{ActorId, ReportId};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const COMMENT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const COMMENT_BODY_MAX_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommentId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentInput {
    pub schema_version: SchemaVersion,
    pub report_id: ReportId,
    pub author_id: ActorId,
    pub body: String,
    pub created_at: MonotonicTimeNs,
    pub idempotency_key: Option<String>,
}

impl CommentInput {
    pub fn v1(
        report_id: ReportId,
        author_id: ActorId,
        body: String,
        created_at: MonotonicTimeNs,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let c = Self {
            schema_version: COMMENT_CONTRACT_VERSION,
            report_id,
            author_id,
            body,
            created_at,
            idempotency_key,
        };
        c.validate()?;
        Ok(c)
    }
}

impl Validate for CommentInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != COMMENT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "comment_input.schema_version",
                reason: "must match COMMENT_CONTRACT_VERSION",
            });
        }
        self.report_id.validate()?;
        self.author_id.validate()?;
        if self.body.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "comment_input.body",
                reason: "must not be empty",
            });
        }
        if self.body.chars().count() > COMMENT_BODY_MAX_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "comment_input.body",
                reason: "exceeds COMMENT_BODY_MAX_CHARS",
            });
        }
        if let Some(k) = &self.idempotency_key {
            validate_id("comment_input.idempotency_key", k, 128)?;
        }
        Ok(())
    }
}

/// Append-only remark on a report. Never edited or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub schema_version: SchemaVersion,
    pub comment_id: CommentId,
    pub report_id: ReportId,
    pub author_id: ActorId,
    pub body: String,
    pub created_at: MonotonicTimeNs,
    pub idempotency_key: Option<String>,
}

impl Comment {
    pub fn from_input_v1(
        comment_id: CommentId,
        input: CommentInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        Ok(Self {
            schema_version: COMMENT_CONTRACT_VERSION,
            comment_id,
            report_id: input.report_id,
            author_id: input.author_id,
            body: input.body,
            created_at: input.created_at,
            idempotency_key: input.idempotency_key,
        })
    }
}
