#![forbid(unsafe_code)]

use warden_kernel_contracts::comment::{CommentId, CommentInput};
use warden_kernel_contracts::report::{ActorId, Report, ReportId, SubjectId};
use warden_kernel_contracts::MonotonicTimeNs;
use warden_storage::repo::{CommentRepo, ReportRepo};
use warden_storage::store::{StorageError, WardenStore};

fn rid(id: &str) -> ReportId {
    ReportId::new(id).unwrap()
}

fn seeded() -> WardenStore {
    let mut s = WardenStore::new_in_memory();
    for id in ["rpt_1", "rpt_2"] {
        s.insert_report_row(
            Report::v1_pending(rid(id), SubjectId::new("subj_1").unwrap(), MonotonicTimeNs(1))
                .unwrap(),
        )
        .unwrap();
    }
    s
}

fn comment(report: &str, body: &str, at: u64, key: Option<&str>) -> CommentInput {
    CommentInput::v1(
        rid(report),
        ActorId::new("reviewer_1").unwrap(),
        body.to_string(),
        MonotonicTimeNs(at),
        key.map(str::to_string),
    )
    .unwrap()
}

#[test]
fn at_comment_db_01_comments_listed_in_insertion_order() {
    let mut s = seeded();
    s.append_comment_row(comment("rpt_1", "first", 5, None)).unwrap();
    s.append_comment_row(comment("rpt_2", "elsewhere", 6, None)).unwrap();
    // Older timestamp inserted later still sorts after.
    s.append_comment_row(comment("rpt_1", "second", 3, None)).unwrap();
    let bodies: Vec<_> = s
        .comment_rows_for_report(&rid("rpt_1"))
        .iter()
        .map(|c| c.body.as_str())
        .collect();
    assert_eq!(bodies, vec!["first", "second"]);
}

#[test]
fn at_comment_db_02_idempotent_retry_returns_original_id() {
    let mut s = seeded();
    let a = s
        .append_comment_row(comment("rpt_1", "hello", 5, Some("k1")))
        .unwrap();
    let b = s
        .append_comment_row(comment("rpt_1", "hello again", 6, Some("k1")))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(s.comment_rows_for_report(&rid("rpt_1")).len(), 1);
    // Keys are scoped per report.
    let c = s
        .append_comment_row(comment("rpt_2", "hello", 5, Some("k1")))
        .unwrap();
    assert_ne!(a, c);
}

#[test]
fn at_comment_db_03_comments_are_append_only() {
    let mut s = seeded();
    let id = s.append_comment_row(comment("rpt_1", "hello", 5, None)).unwrap();
    assert!(matches!(
        s.attempt_overwrite_comment(id),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert!(matches!(
        s.attempt_delete_comment(id),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(s.comment_row(id).unwrap().body, "hello");
    assert!(s.comment_row(CommentId(99)).is_none());
}

#[test]
fn at_comment_db_04_comment_requires_existing_report() {
    let mut s = seeded();
    assert!(matches!(
        s.append_comment_row(comment("rpt_ghost", "hello", 5, None)),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}
