mod common;

use common::*;
use facegate::audit::AuditKind;
use facegate::core::{AuthState, EnrollState, FailureReason};
use facegate::notify::{ChannelNotifier, Status, TracingNotifier};
use facegate::{CancelToken, FaceGateError};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const ALICE: u64 = 1;
const BOB: u64 = 2;
const STRANGER: u64 = 3;

fn enroll(harness: &Harness, name: &str, seed: u64) -> u32 {
    let target = harness.gate.config().enrollment.target_sample_count;
    let mut source = ScriptedSource::new(frames_of(seed, target));
    let report = harness
        .gate
        .enroll(name, &mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();
    match report.state {
        EnrollState::Done(id) => id,
        other => panic!("enrollment of {} ended in {:?}", name, other),
    }
}

#[test]
fn enrolled_user_is_recognised_on_first_attempt() {
    let mut config = test_config();
    config.enrollment.target_sample_count = 30;
    let harness = open_gate(config);

    let id = enroll(&harness, "Alice", ALICE);
    assert_eq!(id, 1);
    assert!(harness.gate.is_trained().unwrap());
    let sample_dir = harness.dir.path().join("users").join("1");
    assert_eq!(std::fs::read_dir(sample_dir).unwrap().count(), 30);

    let (tx, rx) = mpsc::channel();
    let mut source = ScriptedSource::new(frames_of(ALICE, 5));
    let report = harness
        .gate
        .authenticate(&mut source, &ChannelNotifier::new(tx), &CancelToken::new())
        .unwrap();

    match report.state {
        AuthState::Succeeded(success) => {
            assert_eq!(success.identity_id, 1);
            assert_eq!(success.name, "Alice");
            assert_eq!(success.attempt, 1);
            assert!(success.distance < 1e-6);
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(source.remaining(), 4);

    let events: Vec<Status> = rx.try_iter().collect();
    assert_eq!(events.first(), Some(&Status::AuthStarted { max_attempts: 10 }));
    assert_eq!(events.last(), Some(&Status::AuthSucceeded { name: "Alice".into() }));

    let kinds: Vec<AuditKind> = harness.audit.entries().unwrap().into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![AuditKind::Enrolled, AuditKind::AuthSuccess]);
}

#[test]
fn empty_store_fails_without_touching_the_camera() {
    let harness = open_gate(test_config());
    let mut source = ScriptedSource::new(frames_of(ALICE, 3));

    let report = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();

    assert_eq!(report.state, AuthState::Failed(FailureReason::NoRegisteredUsers));
    assert_eq!(report.attempts, 0);
    assert_eq!(source.grabs, 0);

    let entries = harness.audit.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, AuditKind::AuthFailure(FailureReason::NoRegisteredUsers));
}

#[test]
fn stranger_exhausts_exactly_max_attempts() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);

    let mut frames = frames_of(STRANGER, 6);
    frames.extend([blank(), blank(), blank(), blank()]);
    frames.extend(frames_of(STRANGER, 5));
    let mut source = ScriptedSource::new(frames);

    let report = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();

    assert_eq!(report.state, AuthState::Failed(FailureReason::AttemptsExhausted));
    assert_eq!(report.attempts, 10);
    assert_eq!(source.remaining(), 5);
    assert_eq!(report.records.iter().filter(|r| !r.detected).count(), 4);
    assert!(report.records.iter().all(|r| !r.accepted));
    assert!(report
        .records
        .iter()
        .filter(|r| r.detected)
        .all(|r| r.score.map_or(false, |s| s >= 60.0)));
}

#[test]
fn missing_frames_do_not_cost_attempts() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);

    let mut source = ScriptedSource::new(Vec::new());
    source.frames.extend([None, None, None, Some(face(ALICE))]);

    let report = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();

    assert!(matches!(report.state, AuthState::Succeeded(_)));
    assert_eq!(report.attempts, 1);
}

#[test]
fn dead_camera_aborts_without_a_decision() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);
    let before = harness.audit.entries().unwrap().len();

    let mut source = ScriptedSource::new(Vec::new());
    let err = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, FaceGateError::Camera(_)));
    assert_eq!(source.grabs, 5);
    assert_eq!(harness.audit.entries().unwrap().len(), before);
}

#[test]
fn cancelled_authentication_writes_no_audit_entry() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);
    let before = harness.audit.entries().unwrap().len();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut source = ScriptedSource::new(frames_of(ALICE, 3));
    let report = harness.gate.authenticate(&mut source, &TracingNotifier, &cancel).unwrap();

    assert_eq!(report.state, AuthState::Cancelled);
    assert_eq!(report.attempts, 0);
    assert_eq!(harness.audit.entries().unwrap().len(), before);
}

#[test]
fn cancelled_enrollment_leaves_nothing_behind() {
    let harness = open_gate(test_config());

    let cancel = CancelToken::new();
    let mut source = ScriptedSource::new(frames_of(ALICE, 3));
    let worker = {
        let gate = harness.gate.clone();
        let cancel = cancel.clone();
        thread::spawn(move || {
            // Never reaches the target: the source runs dry and is cancelled.
            gate.enroll("Alice", &mut source, &TracingNotifier, &cancel)
        })
    };
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    let report = worker.join().unwrap().unwrap();

    assert_eq!(report.state, EnrollState::Cancelled);
    assert!(harness.gate.identities().unwrap().is_empty());
    assert!(!harness.gate.is_trained().unwrap());
    assert!(!harness.dir.path().join("users").join("1").exists());
    assert!(harness.audit.entries().unwrap().is_empty());
}

#[test]
fn deleted_identity_is_rejected_until_retrain_forgets_it() {
    let harness = open_gate(test_config());
    let alice = enroll(&harness, "Alice", ALICE);
    let bob = enroll(&harness, "Bob", BOB);

    let deleted = harness.gate.delete_identity(alice).unwrap();
    assert_eq!(deleted.identity.display_name, "Alice");
    assert_eq!(deleted.samples_removed, 10);
    assert!(harness.gate.is_model_stale().unwrap());

    // The stale model still matches Alice, but she is no longer registered.
    let (tx, rx) = mpsc::channel();
    let mut source = ScriptedSource::new(frames_of(ALICE, 10));
    let report = harness
        .gate
        .authenticate(&mut source, &ChannelNotifier::new(tx), &CancelToken::new())
        .unwrap();
    assert_eq!(report.state, AuthState::Failed(FailureReason::AttemptsExhausted));
    assert_eq!(report.records[0].predicted_identity, Some(alice));
    assert!(rx.try_iter().any(|s| s == Status::ModelStale));

    assert_eq!(harness.gate.retrain().unwrap(), 10);
    assert!(!harness.gate.is_model_stale().unwrap());

    let mut source = ScriptedSource::new(frames_of(ALICE, 10));
    let report = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();
    assert_eq!(report.state, AuthState::Failed(FailureReason::AttemptsExhausted));
    assert_eq!(report.records[0].predicted_identity, Some(bob));

    let kinds: Vec<AuditKind> = harness.audit.entries().unwrap().into_iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditKind::Deleted));
}

#[test]
fn retrain_after_last_deletion_removes_the_model() {
    let harness = open_gate(test_config());
    let alice = enroll(&harness, "Alice", ALICE);
    let model = harness.dir.path().join("face_model.bin");
    assert!(model.exists());

    harness.gate.delete_identity(alice).unwrap();
    assert_eq!(harness.gate.retrain().unwrap(), 0);
    assert!(!model.exists());
    assert!(!harness.gate.is_trained().unwrap());

    let mut source = ScriptedSource::new(frames_of(ALICE, 1));
    let report = harness
        .gate
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();
    assert_eq!(report.state, AuthState::Failed(FailureReason::NoRegisteredUsers));
}

#[test]
fn ids_are_not_reused_after_deletion() {
    let harness = open_gate(test_config());
    let alice = enroll(&harness, "Alice", ALICE);
    let bob = enroll(&harness, "Bob", BOB);
    harness.gate.delete_identity(bob).unwrap();

    let carol = enroll(&harness, "Carol", STRANGER);
    assert_eq!((alice, bob, carol), (1, 2, 3));
}

#[test]
fn state_survives_reopen() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);
    harness.gate.rename_identity(1, "Alice Smith").unwrap();

    let (reopened, _) = open_in(test_config(), harness.dir.path());
    let identities = reopened.identities().unwrap();
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].display_name, "Alice Smith");
    assert!(reopened.is_trained().unwrap());

    let mut source = ScriptedSource::new(frames_of(ALICE, 1));
    let report = reopened
        .authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        .unwrap();
    match report.state {
        AuthState::Succeeded(success) => assert_eq!(success.name, "Alice Smith"),
        other => panic!("expected success, got {:?}", other),
    }
}

#[test]
fn operator_changes_wait_for_running_authentication() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);

    let (started_tx, started_rx) = mpsc::channel();
    let worker = {
        let gate = harness.gate.clone();
        thread::spawn(move || {
            let mut source = ScriptedSource::new(frames_of(STRANGER, 10)).with_delay(Duration::from_millis(20));
            started_tx.send(()).unwrap();
            gate.authenticate(&mut source, &TracingNotifier, &CancelToken::new())
        })
    };

    started_rx.recv().unwrap();
    // Give the session time to take its read lock.
    thread::sleep(Duration::from_millis(30));
    let begun = Instant::now();
    harness.gate.rename_identity(1, "Renamed").unwrap();
    let waited = begun.elapsed();

    let report = worker.join().unwrap().unwrap();
    assert_eq!(report.state, AuthState::Failed(FailureReason::AttemptsExhausted));
    assert!(waited >= Duration::from_millis(100), "rename finished after {:?}", waited);
}

#[test]
fn unusable_samples_abort_enrollment_and_retrain() {
    let harness = open_gate(test_config());
    enroll(&harness, "Alice", ALICE);

    // Alice's stored samples no longer match the canonical size.
    let mut resized = test_config();
    resized.normalizer.sample_width = 48;
    resized.normalizer.sample_height = 48;
    let (gate, _) = open_in(resized, harness.dir.path());

    let frames = (0..10).map(|_| image::imageops::resize(&face(BOB), 48, 48, image::imageops::FilterType::Nearest));
    let mut source = ScriptedSource::new(frames);
    let err = gate
        .enroll("Bob", &mut source, &TracingNotifier, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, FaceGateError::Persistence(_)), "{}", err);

    let names: Vec<String> = gate.identities().unwrap().into_iter().map(|i| i.display_name).collect();
    assert_eq!(names, vec!["Alice".to_string()]);
    assert!(!harness.dir.path().join("users").join("2").exists());

    assert!(matches!(gate.retrain(), Err(FaceGateError::Persistence(_))));
}
