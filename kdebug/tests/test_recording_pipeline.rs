use kdebug::breakpoints::{BreakpointSet, BreakpointSnapshot};
use kdebug::capture::{SyntheticBackend, SyntheticEvent};
use kdebug::config::CaptureConfig;
use kdebug::controller::Controller;
use kdebug::domain::{CaptureError, ControllerError, ControllerState, FrameId, Pid};
use kdebug::frames::{EventKind, Frame, FrameProcessor};
use kdebug::session::{self, ProjectInfo};
use kdebug_common::EVENT_KIND_EXIT;
use tempfile::TempDir;

fn recorder(dir: &TempDir, config: CaptureConfig) -> (Controller<SyntheticBackend>, SyntheticBackend) {
    let backend = SyntheticBackend::new();
    let mut controller = Controller::new(
        backend.clone(),
        config,
        ProjectInfo::from_root(dir.path()),
        BreakpointSet::new(),
    );
    controller.add_breakpoint("fs/open.c", 1200, Some("do_sys_open"));
    (controller, backend)
}

#[tokio::test]
async fn test_three_calls_become_three_frames() {
    let dir = TempDir::new().expect("tempdir");
    let (mut controller, backend) = recorder(&dir, CaptureConfig::default());
    controller.start_recording(Some("open")).expect("start");

    let probe = backend.probe();
    for ts in [1_000, 2_000, 3_000] {
        probe.fire(&SyntheticEvent::new("do_sys_open").pid(7).timestamp_ns(ts).build()).unwrap();
    }
    let summary = controller.stop_recording().await.expect("stop");

    assert_eq!(summary.frames, 3);
    assert_eq!(summary.drain.events_fired, 3);
    assert_eq!(summary.drain.events_dropped, 0);
    assert!(summary.drain.is_balanced(), "accounting: {:?}", summary.drain);

    let session = controller.last_session().expect("session kept");
    let ids: Vec<FrameId> = session.frames().iter().map(|f| f.id).collect();
    assert_eq!(ids, [1, 2, 3].map(FrameId));
    assert_eq!(session.current_index(), Some(2), "cursor rests on the last frame");
    assert!(session.frames().windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let frame = &session.frames()[0];
    assert_eq!(frame.function(), "do_sys_open");
    assert_eq!(frame.breakpoint_info.file, "fs/open.c");
    assert_eq!(frame.breakpoint_info.line, 1200);
    assert!(!frame.breakpoint_info.synthetic);
    assert_eq!(frame.tgid, 7);
}

#[tokio::test]
async fn test_pid_filter_counts_filtered_events() {
    let dir = TempDir::new().expect("tempdir");
    let config = CaptureConfig { target_pid: Pid(100), ..CaptureConfig::default() };
    let (mut controller, backend) = recorder(&dir, config);
    controller.start_recording(None).expect("start");

    let probe = backend.probe();
    for (pid, ts) in [(100, 1), (200, 2), (200, 3)] {
        probe.fire(&SyntheticEvent::new("do_sys_open").pid(pid).timestamp_ns(ts).build()).unwrap();
    }
    let summary = controller.stop_recording().await.expect("stop");

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.statistics.events_filtered, 2);
    assert_eq!(summary.statistics.events_fired, 1, "filtered calls never count as fired");
}

#[tokio::test]
async fn test_ring_overflow_is_counted_not_blocking() {
    let dir = TempDir::new().expect("tempdir");
    let config = CaptureConfig { ring_size: 4096, ..CaptureConfig::default() };
    let (mut controller, backend) = recorder(&dir, config);
    controller.start_recording(None).expect("start");

    // The reader cannot run between these calls, so the ring fills up
    let probe = backend.probe();
    let accepted = (1..=20)
        .filter(|&ts| probe.fire(&SyntheticEvent::new("do_sys_open").timestamp_ns(ts).build()).is_ok())
        .count();
    assert_eq!(accepted, 8, "4096 bytes hold 8 records of 464 bytes");

    let summary = controller.stop_recording().await.expect("stop");
    assert_eq!(summary.frames, 8);
    assert_eq!(summary.drain.ring_drops, 12);
    assert_eq!(summary.statistics.events_fired, 20);
    assert!(summary.drain.is_balanced(), "accounting: {:?}", summary.drain);
}

#[tokio::test]
async fn test_exit_events_become_return_frames() {
    let dir = TempDir::new().expect("tempdir");
    let config = CaptureConfig { exit_probes: true, ..CaptureConfig::default() };
    let (mut controller, backend) = recorder(&dir, config);
    controller.start_recording(None).expect("start");

    let probe = backend.probe();
    probe.fire(&SyntheticEvent::new("do_sys_open").timestamp_ns(1).build()).unwrap();
    probe
        .fire(&SyntheticEvent::new("do_sys_open").timestamp_ns(2).kind(EVENT_KIND_EXIT).build())
        .unwrap();
    controller.stop_recording().await.expect("stop");

    let session = controller.last_session().expect("session kept");
    let kinds: Vec<EventKind> = session.frames().iter().map(|f| f.event_kind).collect();
    assert_eq!(kinds, [EventKind::Entry, EventKind::Exit]);
    assert_eq!(session.frames()[1].stack_frames[0].function, "do_sys_open (return)");
}

#[tokio::test]
async fn test_unprobeable_function_leaves_controller_idle() {
    let dir = TempDir::new().expect("tempdir");
    let (mut controller, backend) = recorder(&dir, CaptureConfig::default());
    backend.probe().reject("do_sys_open");

    let err = controller.start_recording(None).expect_err("install must fail");
    assert!(matches!(err, ControllerError::Capture(CaptureError::KernelReject { .. })));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(!backend.probe().is_installed());
}

#[tokio::test]
async fn test_events_after_stop_are_not_recorded() {
    let dir = TempDir::new().expect("tempdir");
    let (mut controller, backend) = recorder(&dir, CaptureConfig::default());
    controller.start_recording(None).expect("start");
    let probe = backend.probe();
    probe.fire(&SyntheticEvent::new("do_sys_open").timestamp_ns(1).build()).unwrap();
    controller.stop_recording().await.expect("stop");

    probe.fire(&SyntheticEvent::new("do_sys_open").timestamp_ns(2).build()).unwrap();
    let session = controller.last_session().expect("session kept");
    assert_eq!(session.len(), 1, "sealed session is immutable");
    assert!(!probe.is_installed(), "probes removed at stop");
}

#[tokio::test]
async fn test_recorded_frames_rebuild_from_raw_events() {
    let dir = TempDir::new().expect("tempdir");
    let (mut controller, backend) = recorder(&dir, CaptureConfig::default());
    controller.add_breakpoint("mm/mmap.c", 40, Some("vm_mmap"));
    controller.start_recording(None).expect("start");

    // Two CPUs interleaving: 2_000 and 1_500 arrive after 3_000 and get clamped
    let probe = backend.probe();
    let calls = [
        ("do_sys_open", 1_000),
        ("vm_mmap", 3_000),
        ("do_sys_open", 2_000),
        ("vm_mmap", 1_500),
        ("unprobed", 4_000),
        ("vm_mmap", 5_000),
    ];
    for (function, ts) in calls {
        let event = SyntheticEvent::new(function).pid(9).timestamp_ns(ts).arg(0, ts).stack(1, ts);
        probe.fire(&event.build()).unwrap();
    }
    let summary = controller.stop_recording().await.expect("stop");
    assert_eq!(summary.frames, 5, "unprobed functions never fire");
    assert_eq!(summary.statistics.clamped_timestamps, 2);

    let loaded = session::load(&summary.saved_to.expect("autosaved"), true).expect("load");
    let processor = FrameProcessor::new(loaded.clock_anchor());
    let snapshot = BreakpointSnapshot::from_breakpoints(loaded.breakpoints().to_vec());

    let mut clamped = 0;
    for frame in loaded.frames() {
        let rebuilt = processor.reprocess(frame, &snapshot).expect("raw event decodes");
        if rebuilt.timestamp != frame.timestamp {
            assert!(rebuilt.timestamp < frame.timestamp, "only clamping moves wall time forward");
            clamped += 1;
        }
        assert_eq!(Frame { timestamp: frame.timestamp, ..rebuilt }, *frame, "frame {}", frame.id);
    }
    assert_eq!(clamped, 2);

    let hits = &loaded.statistics().breakpoint_hits;
    assert_eq!(hits.values().sum::<u64>(), 5);
    assert_eq!(hits.len(), 2, "both breakpoints triggered");
}
