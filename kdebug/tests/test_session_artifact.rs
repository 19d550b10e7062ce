use kdebug::breakpoints::BreakpointSet;
use kdebug::capture::{SyntheticBackend, SyntheticEvent};
use kdebug::config::CaptureConfig;
use kdebug::controller::{Controller, NO_SESSION};
use kdebug::domain::{
    ControllerError, ControllerState, FrameId, NavigationError, SessionError, ValidationFailure,
};
use kdebug::session::{self, ProjectInfo, SessionStatus};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn controller(dir: &Path) -> (Controller<SyntheticBackend>, SyntheticBackend) {
    let backend = SyntheticBackend::new();
    let mut controller = Controller::new(
        backend.clone(),
        CaptureConfig::default(),
        ProjectInfo::from_root(dir),
        BreakpointSet::new(),
    );
    controller.add_breakpoint("mm/mmap.c", 40, Some("vm_mmap"));
    (controller, backend)
}

/// Record `count` frames and return the autosaved artifact
async fn record(dir: &Path, count: u64) -> PathBuf {
    let (mut controller, backend) = controller(dir);
    controller.start_recording(Some("mmap")).expect("start");
    let probe = backend.probe();
    for i in 1..=count {
        let event = SyntheticEvent::new("vm_mmap").timestamp_ns(i * 1_000).arg(0, i).stack(0, i);
        probe.fire(&event.build()).expect("ring has room");
    }
    let summary = controller.stop_recording().await.expect("stop");
    summary.saved_to.expect("autosaved")
}

fn edit(path: &Path, change: impl FnOnce(&mut Value)) {
    let mut doc: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
    change(&mut doc);
    fs::write(path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
}

#[tokio::test]
async fn test_save_load_save_is_byte_stable() {
    let dir = TempDir::new().expect("tempdir");
    let original = record(dir.path(), 3).await;

    let loaded = session::load(&original, false).expect("load");
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.status(), SessionStatus::Ended);
    assert_eq!(loaded.current_index(), Some(0), "cursor resets on load");
    assert_eq!(loaded.name(), "mmap");

    let first = dir.path().join("first.frames");
    let second = dir.path().join("second.frames");
    session::save(&loaded, &first).expect("save");
    session::save(&session::load(&first, false).expect("reload"), &second).expect("save");
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap(), "re-save must be byte-equal");

    let again = session::load(&second, true).expect("strict load of own output");
    assert_eq!(again.frames(), loaded.frames());
    assert_eq!(again.id(), loaded.id());
}

#[tokio::test]
async fn test_frame_id_gap_is_invalid() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 3).await;
    edit(&path, |doc| doc["frames"][2]["id"] = Value::from(4));

    let err = session::load(&path, false).expect_err("gap must be rejected");
    assert!(
        matches!(
            err,
            SessionError::Invalid(ValidationFailure::Gap { expected: FrameId(3), found: FrameId(4) })
        ),
        "got {err}"
    );
}

#[tokio::test]
async fn test_backwards_timestamp_is_invalid() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 3).await;
    edit(&path, |doc| doc["frames"][1]["timestamp"] = Value::from("1970-01-01T00:00:00Z"));

    let err = session::load(&path, false).expect_err("time must not run backwards");
    assert!(
        matches!(
            err,
            SessionError::Invalid(ValidationFailure::TimestampInversion { frame: FrameId(2) })
        ),
        "got {err}"
    );
}

#[tokio::test]
async fn test_truncated_raw_event_is_schema_mismatch() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 1).await;
    edit(&path, |doc| doc["frames"][0]["raw_event"] = Value::from("00ff"));

    let err = session::load(&path, false).expect_err("short raw event");
    assert!(matches!(err, SessionError::SchemaMismatch(_)), "got {err}");
}

#[tokio::test]
async fn test_unknown_fields_only_fail_strict_loads() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 2).await;
    edit(&path, |doc| doc["viewer_layout"] = Value::from("split"));

    assert!(session::load(&path, false).is_ok(), "lenient load ignores unknown fields");
    let err = session::load(&path, true).expect_err("strict load rejects them");
    assert!(err.to_string().contains("viewer_layout"), "got {err}");
}

#[tokio::test]
async fn test_newer_format_version_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 1).await;
    edit(&path, |doc| doc["format_version"] = Value::from(99));
    assert!(matches!(session::load(&path, false), Err(SessionError::SchemaMismatch(_))));
}

#[test]
fn test_missing_and_garbage_files() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("nope.frames");
    assert!(matches!(session::load(&missing, false), Err(SessionError::NotFound(_))));

    let garbage = dir.path().join("garbage.frames");
    fs::write(&garbage, "not json").unwrap();
    assert!(matches!(session::load(&garbage, false), Err(SessionError::SchemaMismatch(_))));
}

#[test]
fn test_list_sessions_newest_first() {
    let dir = TempDir::new().expect("tempdir");
    let now = SystemTime::now();
    for (name, age) in [("old.frames", 30), ("new.frames", 0), ("mid.frames", 10)] {
        let file = fs::File::create(dir.path().join(name)).unwrap();
        file.set_modified(now - Duration::from_secs(age)).unwrap();
    }
    fs::write(dir.path().join("notes.txt"), "x").unwrap();

    let names = session::list_sessions(dir.path()).expect("list");
    assert_eq!(names, ["new.frames", "mid.frames", "old.frames"]);
}

#[tokio::test]
async fn test_time_travel_through_controller() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 3).await;
    let (mut controller, _) = controller(dir.path());

    controller.load_session(&path).expect("load");
    assert_eq!(controller.state(), ControllerState::Playback);

    let mut seen = vec![controller.jump_frame(0).unwrap().id];
    seen.push(controller.next_frame().unwrap().id);
    seen.push(controller.next_frame().unwrap().id);
    seen.push(controller.prev_frame().unwrap().id);
    seen.push(controller.prev_frame().unwrap().id);
    assert_eq!(seen, [1, 2, 3, 2, 1].map(FrameId));

    assert!(matches!(
        controller.prev_frame(),
        Err(ControllerError::Navigation(NavigationError::AtBoundary))
    ));
    assert!(matches!(
        controller.jump_frame(3),
        Err(ControllerError::Navigation(NavigationError::OutOfRange { index: 3, len: 3 }))
    ));
    assert!(controller.current_frame_info().starts_with("frame 1/3 - "));

    controller.close_session();
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(controller.current_frame_info(), NO_SESSION);
}

#[tokio::test]
async fn test_failed_load_keeps_loaded_session() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 2).await;
    let (mut controller, _) = controller(dir.path());
    controller.load_session(&path).expect("load");
    controller.next_frame().expect("step");

    assert!(controller.load_session(&dir.path().join("missing.frames")).is_err());
    assert_eq!(controller.state(), ControllerState::Playback);
    assert!(controller.current_frame_info().starts_with("frame 2/2 - "), "cursor untouched");
}

#[tokio::test]
async fn test_save_session_from_playback() {
    let dir = TempDir::new().expect("tempdir");
    let path = record(dir.path(), 2).await;
    let (mut controller, _) = controller(dir.path());

    let copy = dir.path().join("copy.frames");
    assert!(matches!(
        controller.save_session(&copy),
        Err(ControllerError::Navigation(NavigationError::NoSession))
    ));
    controller.load_session(&path).expect("load");
    controller.save_session(&copy).expect("save");
    assert_eq!(session::load(&copy, true).expect("load copy").len(), 2);
}
