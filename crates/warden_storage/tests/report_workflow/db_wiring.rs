#![forbid(unsafe_code)]

use warden_kernel_contracts::bioverify::{
    MatchScore, PolicyClassification, SampleQuality, VerificationFailureKind, VerificationId,
    VerificationOutcome, VerificationRecordInput, VerifierMatch,
};
use warden_kernel_contracts::report::{
    ActorId, Report, ReportId, ReportState, ReportTransition, ReportVersion, ReviewHold,
    SubjectId,
};
use warden_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use warden_storage::repo::{ReportRepo, VerificationRecordRepo};
use warden_storage::store::{StorageError, WardenStore};

fn rid(id: &str) -> ReportId {
    ReportId::new(id).unwrap()
}

fn seed_report(store: &mut WardenStore, id: &str) {
    store
        .insert_report_row(
            Report::v1_pending(rid(id), SubjectId::new("subj_1").unwrap(), MonotonicTimeNs(1))
                .unwrap(),
        )
        .unwrap();
}

fn begin(expected: u64, at: u64) -> ReportTransition {
    ReportTransition {
        expected_version: ReportVersion(expected),
        from: ReportState::Pending,
        to: ReportState::UnderReview,
        hold: Some(ReviewHold::Verifying {
            started_at: MonotonicTimeNs(at),
        }),
        last_verification: None,
        reason_code: ReasonCodeId(0x5744_0001),
        actor: Some(ActorId::new("supervisor_1").unwrap()),
        at: MonotonicTimeNs(at),
    }
}

fn resolved(
    report: &str,
    score: f32,
    quality: f32,
    classification: PolicyClassification,
) -> VerificationRecordInput {
    VerificationRecordInput::resolved_v1(
        rid(report),
        MonotonicTimeNs(10),
        VerifierMatch {
            matched: true,
            score: MatchScore::new(score).unwrap(),
            quality: SampleQuality::new(quality).unwrap(),
        },
        classification,
        r#"{"matched":true}"#.to_string(),
        Some("a".repeat(64)),
        1,
    )
    .unwrap()
}

#[test]
fn at_report_db_01_full_lifecycle_is_recorded() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");

    let r = s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 5)).unwrap();
    assert_eq!(r.state, ReportState::UnderReview);

    let vid = s
        .append_verification_row(resolved("rpt_1", 92.0, 80.0, PolicyClassification::Accept))
        .unwrap();
    let r = s
        .compare_and_set_report_row(
            &rid("rpt_1"),
            ReportTransition {
                expected_version: ReportVersion(1),
                from: ReportState::UnderReview,
                to: ReportState::Approved,
                hold: None,
                last_verification: Some(vid),
                reason_code: ReasonCodeId(0x5744_0002),
                actor: None,
                at: MonotonicTimeNs(11),
            },
        )
        .unwrap();
    assert_eq!(r.state, ReportState::Approved);
    assert_eq!(r.version, ReportVersion(2));
    assert_eq!(r.last_verification, Some(vid));

    let transitions = s.report_transition_rows(&rid("rpt_1"));
    assert_eq!(transitions.len(), 2);
    assert_eq!(transitions[0].to, ReportState::UnderReview);
    assert_eq!(transitions[1].to, ReportState::Approved);
    assert!(transitions[0].transition_seq < transitions[1].transition_seq);
}

#[test]
fn at_report_db_02_only_one_of_two_racing_cas_wins() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");
    assert!(s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 5)).is_ok());
    assert!(matches!(
        s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 6)),
        Err(StorageError::VersionConflict {
            expected: 0,
            actual: 1,
            ..
        })
    ));
    assert_eq!(s.report_row(&rid("rpt_1")).unwrap().version, ReportVersion(1));
}

#[test]
fn at_report_db_03_terminal_report_cannot_move() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");
    s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 5)).unwrap();
    s.compare_and_set_report_row(
        &rid("rpt_1"),
        ReportTransition {
            expected_version: ReportVersion(1),
            from: ReportState::UnderReview,
            to: ReportState::Rejected,
            hold: None,
            last_verification: None,
            reason_code: ReasonCodeId(0x5744_0031),
            actor: Some(ActorId::new("supervisor_1").unwrap()),
            at: MonotonicTimeNs(7),
        },
    )
    .unwrap();
    let reopen = ReportTransition {
        expected_version: ReportVersion(2),
        from: ReportState::Rejected,
        to: ReportState::UnderReview,
        ..begin(2, 8)
    };
    assert!(matches!(
        s.compare_and_set_report_row(&rid("rpt_1"), reopen),
        Err(StorageError::ContractViolation(_))
    ));
    assert_eq!(
        s.report_row(&rid("rpt_1")).unwrap().state,
        ReportState::Rejected
    );
}

#[test]
fn at_report_db_04_inconclusive_records_are_retained() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");
    for _ in 0..3 {
        s.append_verification_row(
            VerificationRecordInput::inconclusive_v1(
                rid("rpt_1"),
                MonotonicTimeNs(10),
                VerificationFailureKind::Timeout,
                "timed out".to_string(),
                None,
                3,
            )
            .unwrap(),
        )
        .unwrap();
    }
    let rows = s.verification_rows_for_report(&rid("rpt_1"));
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| r.outcome == VerificationOutcome::Inconclusive));
    assert_eq!(
        s.attempt_overwrite_verification_record(VerificationId(1)),
        Err(StorageError::AppendOnlyViolation {
            table: "verification_ledger"
        })
    );
}

#[test]
fn at_report_db_05_verification_requires_existing_report() {
    let mut s = WardenStore::new_in_memory();
    assert!(matches!(
        s.append_verification_row(resolved(
            "rpt_ghost",
            40.0,
            80.0,
            PolicyClassification::RejectLowScore
        )),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_report_db_06_record_of_other_report_cannot_be_linked() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");
    seed_report(&mut s, "rpt_2");
    let other = s
        .append_verification_row(resolved(
            "rpt_2",
            40.0,
            80.0,
            PolicyClassification::RejectLowScore,
        ))
        .unwrap();
    s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 5)).unwrap();
    let err = s
        .compare_and_set_report_row(
            &rid("rpt_1"),
            ReportTransition {
                expected_version: ReportVersion(1),
                from: ReportState::UnderReview,
                to: ReportState::Pending,
                hold: None,
                last_verification: Some(other),
                reason_code: ReasonCodeId(0x5744_0010),
                actor: None,
                at: MonotonicTimeNs(9),
            },
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
}

#[test]
fn at_report_db_07_transition_ledger_is_append_only() {
    let mut s = WardenStore::new_in_memory();
    seed_report(&mut s, "rpt_1");
    s.compare_and_set_report_row(&rid("rpt_1"), begin(0, 5)).unwrap();
    let seq = s.report_transition_rows(&rid("rpt_1"))[0].transition_seq;
    assert!(matches!(
        s.attempt_overwrite_report_transition(seq),
        Err(StorageError::AppendOnlyViolation {
            table: "report_transition_ledger"
        })
    ));
    let rows = s.report_transition_rows(&rid("rpt_1"));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].transition_seq, seq);
    assert_eq!(rows[0].to, ReportState::UnderReview);
}
