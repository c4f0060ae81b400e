#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use warden_kernel_contracts::comment::{Comment, CommentInput};
use warden_kernel_contracts::report::{ActorId, ReportId};
use warden_kernel_contracts::MonotonicTimeNs;
use warden_storage::repo::{CommentRepo, ReportRepo};
use warden_storage::store::StorageError;

use crate::gateway::GatewayError;

/// Append-only discussion attached to a report. No edit, no delete.
pub struct CommentThread<S> {
    store: Arc<Mutex<S>>,
}

impl<S> Clone for CommentThread<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> CommentThread<S>
where
    S: CommentRepo + ReportRepo,
{
    pub fn new(store: Arc<Mutex<S>>) -> Self {
        Self { store }
    }

    pub fn append(
        &self,
        report_id: &ReportId,
        author_id: ActorId,
        body: String,
        now: MonotonicTimeNs,
        idempotency_key: Option<String>,
    ) -> Result<Comment, GatewayError> {
        let input = CommentInput::v1(report_id.clone(), author_id, body, now, idempotency_key)?;
        let mut store = self.store.lock().map_err(|_| GatewayError::LockPoisoned)?;
        if store.report_row(report_id).is_none() {
            return Err(GatewayError::ReportNotFound {
                report_id: report_id.as_str().to_string(),
            });
        }
        Ok(append_comment_locked(&mut *store, input)?)
    }

    /// Oldest first.
    pub fn list(&self, report_id: &ReportId) -> Result<Vec<Comment>, GatewayError> {
        let store = self.store.lock().map_err(|_| GatewayError::LockPoisoned)?;
        if store.report_row(report_id).is_none() {
            return Err(GatewayError::ReportNotFound {
                report_id: report_id.as_str().to_string(),
            });
        }
        Ok(store
            .comment_rows_for_report(report_id)
            .into_iter()
            .cloned()
            .collect())
    }
}

/// Appends while the caller already holds the store lock, so a workflow transition and its
/// comment land together.
pub(crate) fn append_comment_locked<S: CommentRepo>(
    store: &mut S,
    input: CommentInput,
) -> Result<Comment, StorageError> {
    let comment_id = store.append_comment_row(input)?;
    store
        .comment_row(comment_id)
        .cloned()
        .ok_or_else(|| StorageError::NotFound {
            table: "comment_ledger.comment_id",
            key: comment_id.0.to_string(),
        })
}
