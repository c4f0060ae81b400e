#![forbid(unsafe_code)]

use warden_kernel_contracts::bioverify::{
    VerificationId, VerificationRecord, VerificationRecordInput,
};
use warden_kernel_contracts::comment::{Comment, CommentId, CommentInput};
use warden_kernel_contracts::report::{
    Report, ReportId, ReportTransition, ReportTransitionRecord,
};

use crate::store::{StorageError, WardenStore};

/// Typed repository interface for `reports` + `report_transition_ledger`.
pub trait ReportRepo {
    fn insert_report_row(&mut self, report: Report) -> Result<(), StorageError>;
    fn report_row(&self, report_id: &ReportId) -> Option<&Report>;
    fn compare_and_set_report_row(
        &mut self,
        report_id: &ReportId,
        transition: ReportTransition,
    ) -> Result<Report, StorageError>;
    fn report_transition_rows(&self, report_id: &ReportId) -> Vec<&ReportTransitionRecord>;
}

/// Typed repository interface for `verification_ledger`.
pub trait VerificationRecordRepo {
    fn append_verification_row(
        &mut self,
        input: VerificationRecordInput,
    ) -> Result<VerificationId, StorageError>;
    fn verification_row(&self, verification_id: VerificationId) -> Option<&VerificationRecord>;
    fn verification_rows_for_report(&self, report_id: &ReportId) -> Vec<&VerificationRecord>;
}

/// Typed repository interface for `comment_ledger`.
pub trait CommentRepo {
    fn append_comment_row(&mut self, input: CommentInput) -> Result<CommentId, StorageError>;
    fn comment_row(&self, comment_id: CommentId) -> Option<&Comment>;
    fn comment_rows_for_report(&self, report_id: &ReportId) -> Vec<&Comment>;
}

/// Everything the approval workflow needs from persistence.
pub trait WorkflowRepo: ReportRepo + VerificationRecordRepo + CommentRepo {}

impl<T: ReportRepo + VerificationRecordRepo + CommentRepo> WorkflowRepo for T {}

impl ReportRepo for WardenStore {
    fn insert_report_row(&mut self, report: Report) -> Result<(), StorageError> {
        self.insert_report(report)
    }

    fn report_row(&self, report_id: &ReportId) -> Option<&Report> {
        self.report(report_id)
    }

    fn compare_and_set_report_row(
        &mut self,
        report_id: &ReportId,
        transition: ReportTransition,
    ) -> Result<Report, StorageError> {
        self.compare_and_set_report(report_id, transition)
    }

    fn report_transition_rows(&self, report_id: &ReportId) -> Vec<&ReportTransitionRecord> {
        self.report_transitions_for_report(report_id)
    }
}

impl VerificationRecordRepo for WardenStore {
    fn append_verification_row(
        &mut self,
        input: VerificationRecordInput,
    ) -> Result<VerificationId, StorageError> {
        self.append_verification_record(input)
    }

    fn verification_row(&self, verification_id: VerificationId) -> Option<&VerificationRecord> {
        self.verification_record(verification_id)
    }

    fn verification_rows_for_report(&self, report_id: &ReportId) -> Vec<&VerificationRecord> {
        self.verification_records_for_report(report_id)
    }
}

impl CommentRepo for WardenStore {
    fn append_comment_row(&mut self, input: CommentInput) -> Result<CommentId, StorageError> {
        self.append_comment(input)
    }

    fn comment_row(&self, comment_id: CommentId) -> Option<&Comment> {
        self.comment(comment_id)
    }

    fn comment_rows_for_report(&self, report_id: &ReportId) -> Vec<&Comment> {
        self.comments_for_report(report_id)
    }
}
