#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use warden_kernel_contracts::bioverify::{
    VerificationId, VerificationRecord, VerificationRecordInput,
};
use warden_kernel_contracts::comment::{Comment, CommentId, CommentInput};
use warden_kernel_contracts::report::{
    Report, ReportId, ReportTransition, ReportTransitionRecord, ReportVersion,
    REPORT_CONTRACT_VERSION,
};
use warden_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ForeignKeyViolation {
        table: &'static str,
        key: String,
    },
    DuplicateKey {
        table: &'static str,
        key: String,
    },
    AppendOnlyViolation {
        table: &'static str,
    },
    NotFound {
        table: &'static str,
        key: String,
    },
    /// Compare-and-set lost: the row moved on since the caller read it.
    VersionConflict {
        report_id: String,
        expected: u64,
        actual: u64,
    },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignKeyViolation { table, key } => {
                write!(f, "foreign key violation on {table}: {key}")
            }
            Self::DuplicateKey { table, key } => write!(f, "duplicate key on {table}: {key}"),
            Self::AppendOnlyViolation { table } => write!(f, "{table} is append-only"),
            Self::NotFound { table, key } => write!(f, "{table}: {key} not found"),
            Self::VersionConflict {
                report_id,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on report {report_id}: expected {expected}, found {actual}"
            ),
            Self::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// In-memory persistence for reports, their transitions, verification attempts and comments.
/// Every table except `reports` is append-only.
#[derive(Debug, Default)]
pub struct WardenStore {
    reports: BTreeMap<ReportId, Report>,

    report_transition_ledger: Vec<ReportTransitionRecord>,

    verification_ledger: Vec<VerificationRecord>,
    next_verification_id: u64,

    comment_ledger: Vec<Comment>,
    next_comment_id: u64,
    // (report_id, idempotency_key) -> deterministic no-op on retry.
    comment_idempotency_index: BTreeMap<(ReportId, String), CommentId>,
}

impl WardenStore {
    pub fn new_in_memory() -> Self {
        Self {
            next_verification_id: 1,
            next_comment_id: 1,
            ..Self::default()
        }
    }

    pub fn insert_report(&mut self, report: Report) -> Result<(), StorageError> {
        report.validate()?;
        if report.schema_version != REPORT_CONTRACT_VERSION {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "report.schema_version",
                    reason: "must match REPORT_CONTRACT_VERSION",
                },
            ));
        }
        if self.reports.contains_key(&report.report_id) {
            return Err(StorageError::DuplicateKey {
                table: "reports.report_id",
                key: report.report_id.as_str().to_string(),
            });
        }
        self.reports.insert(report.report_id.clone(), report);
        Ok(())
    }

    pub fn report(&self, report_id: &ReportId) -> Option<&Report> {
        self.reports.get(report_id)
    }

    pub fn reports(&self) -> &BTreeMap<ReportId, Report> {
        &self.reports
    }

    /// Applies `transition` only if the stored report still carries
    /// `transition.expected_version`. On success the version is bumped by exactly one and a
    /// transition row is appended. On any error the report is left untouched.
    pub fn compare_and_set_report(
        &mut self,
        report_id: &ReportId,
        transition: ReportTransition,
    ) -> Result<Report, StorageError> {
        transition.validate()?;
        let current = self
            .reports
            .get(report_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "reports.report_id",
                key: report_id.as_str().to_string(),
            })?;
        if current.version != transition.expected_version {
            return Err(StorageError::VersionConflict {
                report_id: report_id.as_str().to_string(),
                expected: transition.expected_version.0,
                actual: current.version.0,
            });
        }
        if current.state != transition.from {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "report_transition.from",
                    reason: "must match the stored report state",
                },
            ));
        }
        if let Some(id) = transition.last_verification {
            match self.verification_record(id) {
                Some(rec) if &rec.report_id == report_id => {}
                _ => {
                    return Err(StorageError::ForeignKeyViolation {
                        table: "reports.last_verification",
                        key: id.0.to_string(),
                    })
                }
            }
        }

        let mut next = current.clone();
        next.state = transition.to;
        next.hold = transition.hold;
        if let Some(id) = transition.last_verification {
            next.last_verification = Some(id);
        }
        next.version = current.version.next();
        next.updated_at = transition.at.max(current.updated_at);
        next.validate()?;

        let seq = self.report_transition_ledger.len() as u64 + 1;
        self.report_transition_ledger.push(ReportTransitionRecord {
            schema_version: REPORT_CONTRACT_VERSION,
            transition_seq: seq,
            report_id: report_id.clone(),
            from: transition.from,
            to: transition.to,
            version_after: next.version,
            reason_code: transition.reason_code,
            actor: transition.actor,
            at: transition.at,
        });
        self.reports.insert(report_id.clone(), next.clone());
        Ok(next)
    }

    pub fn report_transition_ledger(&self) -> &[ReportTransitionRecord] {
        &self.report_transition_ledger
    }

    pub fn report_transitions_for_report(
        &self,
        report_id: &ReportId,
    ) -> Vec<&ReportTransitionRecord> {
        self.report_transition_ledger
            .iter()
            .filter(|r| &r.report_id == report_id)
            .collect()
    }

    pub fn attempt_overwrite_report_transition(
        &mut self,
        _transition_seq: u64,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "report_transition_ledger",
        })
    }

    pub fn append_verification_record(
        &mut self,
        input: VerificationRecordInput,
    ) -> Result<VerificationId, StorageError> {
        input.validate()?;
        if !self.reports.contains_key(&input.report_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "verification_ledger.report_id",
                key: input.report_id.as_str().to_string(),
            });
        }
        let verification_id = VerificationId(self.next_verification_id);
        self.next_verification_id = self.next_verification_id.saturating_add(1);
        let rec = VerificationRecord::from_input_v1(verification_id, input)?;
        self.verification_ledger.push(rec);
        Ok(verification_id)
    }

    pub fn verification_record(
        &self,
        verification_id: VerificationId,
    ) -> Option<&VerificationRecord> {
        // Ids are dense and start at 1.
        let idx = verification_id.0.checked_sub(1)? as usize;
        self.verification_ledger
            .get(idx)
            .filter(|r| r.verification_id == verification_id)
    }

    pub fn verification_ledger(&self) -> &[VerificationRecord] {
        &self.verification_ledger
    }

    pub fn verification_records_for_report(
        &self,
        report_id: &ReportId,
    ) -> Vec<&VerificationRecord> {
        self.verification_ledger
            .iter()
            .filter(|r| &r.report_id == report_id)
            .collect()
    }

    pub fn attempt_overwrite_verification_record(
        &mut self,
        _verification_id: VerificationId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "verification_ledger",
        })
    }

    pub fn append_comment(&mut self, input: CommentInput) -> Result<CommentId, StorageError> {
        input.validate()?;
        if !self.reports.contains_key(&input.report_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "comment_ledger.report_id",
                key: input.report_id.as_str().to_string(),
            });
        }
        if let Some(k) = &input.idempotency_key {
            if let Some(existing) = self
                .comment_idempotency_index
                .get(&(input.report_id.clone(), k.clone()))
            {
                // Deterministic no-op on retry: return the original comment_id.
                return Ok(*existing);
            }
        }

        let comment_id = CommentId(self.next_comment_id);
        self.next_comment_id = self.next_comment_id.saturating_add(1);
        let rec = Comment::from_input_v1(comment_id, input)?;
        if let Some(k) = &rec.idempotency_key {
            self.comment_idempotency_index
                .insert((rec.report_id.clone(), k.clone()), rec.comment_id);
        }
        self.comment_ledger.push(rec);
        Ok(comment_id)
    }

    pub fn comment(&self, comment_id: CommentId) -> Option<&Comment> {
        let idx = comment_id.0.checked_sub(1)? as usize;
        self.comment_ledger
            .get(idx)
            .filter(|c| c.comment_id == comment_id)
    }

    pub fn comment_ledger(&self) -> &[Comment] {
        &self.comment_ledger
    }

    /// Comments for one report in insertion order.
    pub fn comments_for_report(&self, report_id: &ReportId) -> Vec<&Comment> {
        self.comment_ledger
            .iter()
            .filter(|c| &c.report_id == report_id)
            .collect()
    }

    pub fn attempt_overwrite_comment(
        &mut self,
        _comment_id: CommentId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "comment_ledger",
        })
    }

    pub fn attempt_delete_comment(&mut self, _comment_id: CommentId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "comment_ledger",
        })
    }

    pub fn current_report_version(&self, report_id: &ReportId) -> Option<ReportVersion> {
        self.reports.get(report_id).map(|r| r.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_kernel_contracts::report::{ReportState, ReviewHold, SubjectId};
    use warden_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};

    fn rid(id: &str) -> ReportId {
        ReportId::new(id).unwrap()
    }

    fn seeded() -> WardenStore {
        let mut s = WardenStore::new_in_memory();
        s.insert_report(
            Report::v1_pending(rid("rpt_1"), SubjectId::new("subj_1").unwrap(), MonotonicTimeNs(1))
                .unwrap(),
        )
        .unwrap();
        s
    }

    fn begin(expected: u64) -> ReportTransition {
        ReportTransition {
            expected_version: ReportVersion(expected),
            from: ReportState::Pending,
            to: ReportState::UnderReview,
            hold: Some(ReviewHold::Verifying {
                started_at: MonotonicTimeNs(5),
            }),
            last_verification: None,
            reason_code: ReasonCodeId(1),
            actor: None,
            at: MonotonicTimeNs(5),
        }
    }

    #[test]
    fn at_store_01_cas_bumps_version_once() {
        let mut s = seeded();
        let r = s.compare_and_set_report(&rid("rpt_1"), begin(0)).unwrap();
        assert_eq!(r.version, ReportVersion(1));
        assert_eq!(s.report_transition_ledger().len(), 1);
        assert_eq!(s.report_transition_ledger()[0].version_after, ReportVersion(1));
    }

    #[test]
    fn at_store_02_cas_conflict_leaves_row_untouched() {
        let mut s = seeded();
        s.compare_and_set_report(&rid("rpt_1"), begin(0)).unwrap();
        let before = s.report(&rid("rpt_1")).unwrap().clone();
        let err = s
            .compare_and_set_report(&rid("rpt_1"), begin(0))
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::VersionConflict {
                report_id: "rpt_1".to_string(),
                expected: 0,
                actual: 1,
            }
        );
        assert_eq!(s.report(&rid("rpt_1")).unwrap(), &before);
        assert_eq!(s.report_transition_ledger().len(), 1);
    }

    #[test]
    fn at_store_03_missing_report_is_not_found() {
        let mut s = seeded();
        assert!(matches!(
            s.compare_and_set_report(&rid("rpt_missing"), begin(0)),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn at_store_04_duplicate_report_refused() {
        let mut s = seeded();
        let dup =
            Report::v1_pending(rid("rpt_1"), SubjectId::new("subj_2").unwrap(), MonotonicTimeNs(2))
                .unwrap();
        assert!(matches!(
            s.insert_report(dup),
            Err(StorageError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn at_store_05_last_verification_must_reference_own_record() {
        let mut s = seeded();
        let mut t = begin(0);
        t.last_verification = Some(VerificationId(42));
        assert!(matches!(
            s.compare_and_set_report(&rid("rpt_1"), t),
            Err(StorageError::ForeignKeyViolation { .. })
        ));
        assert_eq!(s.current_report_version(&rid("rpt_1")), Some(ReportVersion(0)));
    }
}
