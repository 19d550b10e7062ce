//! # Frame Processor
//!
//! Turns decoded events into [`Frame`]s. [`FrameProcessor::build_frame`] is a
//! pure function of the event, the frame id, the breakpoint snapshot and the
//! session's clock anchor, so any stored frame can be rebuilt from its raw
//! bytes with [`FrameProcessor::reprocess`].
//!
//! [`ProcessorTask`] is the consumer side of the collector queue: it checks
//! the controller state and takes a fresh breakpoint snapshot for every event,
//! then appends the frame to the session.

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use kdebug_common::{
    DebugEvent, ARG_REGISTERS, REGISTER_NAMES, REG_A0, REG_GP, REG_PC, REG_RA, REG_TP,
};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

use super::frame::{
    BreakpointRef, CallEntry, EventKind, Frame, Scalar, StackFrame, UNKNOWN_FUNCTION, UNRESOLVED,
};
use crate::breakpoints::BreakpointSnapshot;
use crate::capture::event::{decode_event, decode_name, encode_event};
use crate::domain::{ControllerState, DecodeError, FrameId};
use crate::session::Session;
use crate::symbols::SymbolSource;

/// Maps kernel monotonic timestamps onto wall-clock time
///
/// Taken once per recording and stored with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockAnchor {
    pub monotonic_ns: u64,
    pub wall: DateTime<Utc>,
}

impl ClockAnchor {
    /// Pair the current `CLOCK_MONOTONIC` reading with the current UTC time
    pub fn now() -> Self {
        Self { monotonic_ns: monotonic_now_ns(), wall: Utc::now() }
    }

    pub fn fixed(monotonic_ns: u64, wall: DateTime<Utc>) -> Self {
        Self { monotonic_ns, wall }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_wall(&self, monotonic_ns: u64) -> DateTime<Utc> {
        let delta = i128::from(monotonic_ns) - i128::from(self.monotonic_ns);
        let delta = delta.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        self.wall
            .checked_add_signed(chrono::Duration::nanoseconds(delta))
            .unwrap_or(self.wall)
    }
}

/// Same clock as `bpf_ktime_get_ns`
#[allow(unsafe_code, clippy::cast_sign_loss)]
fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid, writable timespec
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[derive(Clone)]
pub struct FrameProcessor {
    anchor: ClockAnchor,
    symbols: Option<Arc<dyn SymbolSource>>,
}

impl FrameProcessor {
    pub fn new(anchor: ClockAnchor) -> Self {
        Self { anchor, symbols: None }
    }

    /// Name caller frames through `symbols`
    #[must_use]
    pub fn with_symbols(mut self, symbols: Arc<dyn SymbolSource>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn anchor(&self) -> ClockAnchor {
        self.anchor
    }

    pub fn build_frame(
        &self,
        event: &DebugEvent,
        id: FrameId,
        breakpoints: &BreakpointSnapshot,
    ) -> Frame {
        let name = decode_name(&event.function).to_display();
        let function = if name.is_empty() { UNKNOWN_FUNCTION.to_string() } else { name.clone() };
        let kind = EventKind::from_wire(event.kind);

        let registers: BTreeMap<String, u64> = REGISTER_NAMES
            .iter()
            .enumerate()
            .map(|(slot, reg)| ((*reg).to_string(), event.regs[slot]))
            .collect();
        let pc = event.regs[REG_PC];
        let ra = event.regs[REG_RA];
        let arguments: Vec<u64> = event.regs[REG_A0..REG_A0 + ARG_REGISTERS].to_vec();

        let mut locals: BTreeMap<String, Scalar> = event
            .locals
            .iter()
            .enumerate()
            .filter(|(_, value)| **value != 0)
            .map(|(i, value)| (format!("local_var_{i}"), Scalar::from(*value)))
            .collect();
        for (n, value) in arguments.iter().enumerate() {
            locals.insert(format!("arg{n}"), Scalar::from(*value));
        }

        let mut globals = BTreeMap::new();
        globals.insert("current_pid".to_string(), Scalar::from(u64::from(event.pid)));
        globals.insert("current_tgid".to_string(), Scalar::from(u64::from(event.tgid)));
        globals.insert("timestamp".to_string(), Scalar::from(event.timestamp_ns));
        if event.regs[REG_GP] != 0 {
            globals.insert("global_pointer".to_string(), Scalar::from(event.regs[REG_GP]));
        }
        if event.regs[REG_TP] != 0 {
            globals.insert("thread_pointer".to_string(), Scalar::from(event.regs[REG_TP]));
        }

        let breakpoint_info = breakpoints.find_by_function(&name).map_or_else(
            || BreakpointRef::placeholder(&name),
            |bp| BreakpointRef {
                id: Some(bp.id),
                file: bp.file.clone(),
                line: bp.line,
                function: bp.function.clone(),
                synthetic: false,
            },
        );

        Frame {
            id,
            timestamp: self.anchor.to_wall(event.timestamp_ns),
            monotonic_ns: event.timestamp_ns,
            event_kind: kind,
            pid: event.pid,
            tgid: event.tgid,
            comm: decode_name(&event.comm).to_display(),
            breakpoint_info,
            registers,
            locals,
            globals,
            stack_slots: event.stack.to_vec(),
            stack_frames: self.stack_frames(&function, kind, pc, ra),
            call_chain: vec![CallEntry { function, return_address: ra, arguments }],
            raw_event: encode_event(event),
        }
    }

    fn stack_frames(&self, function: &str, kind: EventKind, pc: u64, ra: u64) -> Vec<StackFrame> {
        let resolved = |address: u64| self.symbols.as_ref().and_then(|s| s.resolve(address));

        let current = resolved(pc);
        let label = match kind {
            EventKind::Entry => function.to_string(),
            EventKind::Exit => format!("{function} (return)"),
        };
        let mut frames = vec![StackFrame {
            function: label,
            address: pc,
            file: current.as_ref().and_then(|s| s.file.clone()).unwrap_or_else(|| UNRESOLVED.into()),
            line: current.as_ref().and_then(|s| s.line).unwrap_or(0),
        }];

        if ra != 0 && ra != pc {
            let caller = resolved(ra);
            frames.push(StackFrame {
                function: caller.as_ref().map_or_else(|| UNRESOLVED.into(), |s| s.function.clone()),
                address: ra,
                file: caller.as_ref().and_then(|s| s.file.clone()).unwrap_or_else(|| UNRESOLVED.into()),
                line: caller.as_ref().and_then(|s| s.line).unwrap_or(0),
            });
        }
        frames
    }

    /// Rebuild `frame` from its raw event bytes
    ///
    /// # Errors
    /// Returns `DecodeError` if the stored bytes are not one event
    pub fn reprocess(
        &self,
        frame: &Frame,
        breakpoints: &BreakpointSnapshot,
    ) -> Result<Frame, DecodeError> {
        let event = decode_event(&frame.raw_event)?;
        Ok(self.build_frame(&event, frame.id, breakpoints))
    }
}

/// Why the processor task returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorExit {
    /// The collector dropped its end of the queue
    Disconnected { processed: u64 },
    /// A frame broke a session invariant; the recording cannot continue
    Fatal(String),
}

/// Consumer of the collector queue for one recording
///
/// Blocking; run it with `spawn_blocking`.
pub struct ProcessorTask {
    pub processor: FrameProcessor,
    pub session: Arc<RwLock<Session>>,
    pub state: watch::Receiver<ControllerState>,
    pub breakpoints: watch::Receiver<BreakpointSnapshot>,
}

impl ProcessorTask {
    pub fn run(self, events: &Receiver<DebugEvent>) -> ProcessorExit {
        let mut processed = 0u64;

        for event in events {
            if *self.state.borrow() != ControllerState::Recording {
                self.lock_session().statistics_mut().ignored_events += 1;
                continue;
            }
            let snapshot = self.breakpoints.borrow().clone();

            let mut session = self.lock_session();
            let id = session.next_frame_id();
            let mut frame = self.processor.build_frame(&event, id, &snapshot);

            let stats = session.statistics_mut();
            if decode_name(&event.function).is_binary() || decode_name(&event.comm).is_binary() {
                stats.binary_names += 1;
            }
            if let Some(last) = session.last_timestamp() {
                // Events from different CPUs may arrive slightly out of order
                if frame.timestamp < last {
                    frame.timestamp = last;
                    session.statistics_mut().clamped_timestamps += 1;
                }
            }
            session.statistics_mut().record_hit(&frame);

            if let Err(e) = session.append(frame) {
                error!("Frame {id} rejected: {e}");
                return ProcessorExit::Fatal(format!("frame {id} rejected: {e}"));
            }
            processed += 1;
        }

        debug!("Processor finished after {processed} frames");
        ProcessorExit::Disconnected { processed }
    }

    fn lock_session(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::Breakpoint;
    use crate::capture::synthetic::SyntheticEvent;
    use crate::domain::BreakpointId;
    use crate::symbols::ResolvedSymbol;
    use kdebug_common::{EVENT_KIND_EXIT, REG_SP};

    fn anchor() -> ClockAnchor {
        ClockAnchor::fixed(0, DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    fn snapshot() -> BreakpointSnapshot {
        BreakpointSnapshot::from_breakpoints(vec![
            Breakpoint {
                id: BreakpointId(2),
                file: "b.c".into(),
                line: 5,
                function: "foo".into(),
                enabled: true,
            },
            Breakpoint {
                id: BreakpointId(1),
                file: "a.c".into(),
                line: 10,
                function: "foo".into(),
                enabled: true,
            },
            Breakpoint {
                id: BreakpointId(3),
                file: "a.c".into(),
                line: 1,
                function: "bar".into(),
                enabled: false,
            },
        ])
    }

    #[test]
    fn test_register_and_local_maps() {
        let event = SyntheticEvent::new("foo")
            .register(REG_PC, 0x1000)
            .register(REG_SP, 0x2000)
            .arg(0, 7)
            .local(3, 42)
            .build();
        let frame = FrameProcessor::new(anchor()).build_frame(&event, FrameId(1), &snapshot());

        assert_eq!(frame.registers.len(), REGISTER_NAMES.len());
        assert_eq!(frame.register("PC"), 0x1000);
        assert_eq!(frame.register("A0"), 7);
        assert_eq!(frame.locals["local_var_3"].decimal, 42);
        assert!(!frame.locals.contains_key("local_var_0"), "zero locals are skipped");
        assert_eq!(frame.locals["arg0"].hex, "0x0000000000000007");
        assert_eq!(frame.locals.keys().filter(|k| k.starts_with("arg")).count(), 8);
    }

    #[test]
    fn test_globals_only_list_set_pointers() {
        let plain = SyntheticEvent::new("foo").pid(9).build();
        let frame = FrameProcessor::new(anchor()).build_frame(&plain, FrameId(1), &snapshot());
        assert_eq!(frame.globals["current_pid"].decimal, 9);
        assert!(!frame.globals.contains_key("global_pointer"));

        let with_tp = SyntheticEvent::new("foo").register(REG_TP, 0xabc).build();
        let frame = FrameProcessor::new(anchor()).build_frame(&with_tp, FrameId(1), &snapshot());
        assert_eq!(frame.globals["thread_pointer"].hex, "0x0000000000000abc");
    }

    #[test]
    fn test_breakpoint_tie_break_picks_lowest_file_line() {
        let event = SyntheticEvent::new("foo").build();
        let frame = FrameProcessor::new(anchor()).build_frame(&event, FrameId(1), &snapshot());
        assert_eq!(frame.breakpoint_info.id, Some(BreakpointId(1)));
        assert_eq!(frame.breakpoint_info.file, "a.c");
        assert!(!frame.breakpoint_info.synthetic);
    }

    #[test]
    fn test_unmatched_and_disabled_get_placeholder() {
        let processor = FrameProcessor::new(anchor());
        let frame =
            processor.build_frame(&SyntheticEvent::new("bar").build(), FrameId(1), &snapshot());
        assert!(frame.breakpoint_info.synthetic, "disabled breakpoints never match");
        assert_eq!(frame.breakpoint_info.function, "bar");
        assert_eq!(frame.breakpoint_info.id, None);
    }

    #[test]
    fn test_stack_frames_and_call_chain() {
        let event = SyntheticEvent::new("foo")
            .register(REG_PC, 0x1000)
            .register(REG_RA, 0x2000)
            .arg(1, 5)
            .build();
        let frame = FrameProcessor::new(anchor()).build_frame(&event, FrameId(1), &snapshot());
        assert_eq!(frame.stack_frames.len(), 2);
        assert_eq!(frame.stack_frames[0].function, "foo");
        assert_eq!(frame.stack_frames[1].function, UNRESOLVED);
        assert_eq!(frame.stack_frames[1].line, 0);
        assert_eq!(frame.call_chain[0].return_address, 0x2000);
        assert_eq!(frame.call_chain[0].arguments, vec![0, 5, 0, 0, 0, 0, 0, 0]);

        let leaf = SyntheticEvent::new("foo").register(REG_PC, 0x1000).register(REG_RA, 0x1000);
        let frame =
            FrameProcessor::new(anchor()).build_frame(&leaf.build(), FrameId(1), &snapshot());
        assert_eq!(frame.stack_frames.len(), 1, "RA == PC has no caller frame");
    }

    #[test]
    fn test_exit_frames_are_labelled() {
        let event = SyntheticEvent::new("foo").kind(EVENT_KIND_EXIT).build();
        let frame = FrameProcessor::new(anchor()).build_frame(&event, FrameId(1), &snapshot());
        assert_eq!(frame.event_kind, EventKind::Exit);
        assert_eq!(frame.stack_frames[0].function, "foo (return)");
        assert_eq!(frame.function(), "foo");
    }

    struct FixedSymbols;

    impl SymbolSource for FixedSymbols {
        fn resolve(&self, address: u64) -> Option<ResolvedSymbol> {
            (address == 0x2000).then(|| ResolvedSymbol {
                function: "caller+0x10".into(),
                file: Some("fs/open.c".into()),
                line: Some(99),
            })
        }
    }

    #[test]
    fn test_injected_symbols_name_the_caller() {
        let processor = FrameProcessor::new(anchor()).with_symbols(Arc::new(FixedSymbols));
        let event = SyntheticEvent::new("foo").register(REG_PC, 0x1000).register(REG_RA, 0x2000);
        let frame = processor.build_frame(&event.build(), FrameId(1), &snapshot());
        assert_eq!(frame.stack_frames[1].function, "caller+0x10");
        assert_eq!(frame.stack_frames[1].file, "fs/open.c");
        assert_eq!(frame.stack_frames[0].file, UNRESOLVED);
    }

    #[test]
    fn test_reprocess_yields_equal_frame() {
        let processor = FrameProcessor::new(anchor());
        let event = SyntheticEvent::new("foo")
            .pid(42)
            .timestamp_ns(1_234)
            .register(REG_PC, 0x1000)
            .register(REG_RA, 0x2000)
            .stack(2, 77)
            .build();
        let frame = processor.build_frame(&event, FrameId(4), &snapshot());
        assert_eq!(processor.reprocess(&frame, &snapshot()).unwrap(), frame);
    }

    #[test]
    fn test_empty_and_binary_names() {
        let processor = FrameProcessor::new(anchor());
        let empty = processor.build_frame(&SyntheticEvent::new("").build(), FrameId(1), &snapshot());
        assert_eq!(empty.function(), UNKNOWN_FUNCTION);
        assert_eq!(empty.breakpoint_info.function, "");

        let binary = SyntheticEvent::new("foo").comm(&[0xff, 0xfe]).build();
        let frame = processor.build_frame(&binary, FrameId(1), &snapshot());
        assert_eq!(frame.comm, "\u{fffd}\u{fffd}", "invalid UTF-8 is rendered lossily");
    }

    #[test]
    fn test_nameless_event_ignores_unnamed_breakpoint() {
        let unnamed = BreakpointSnapshot::from_breakpoints(vec![Breakpoint {
            id: BreakpointId(9),
            file: "a.c".into(),
            line: 1,
            function: String::new(),
            enabled: true,
        }]);
        let event = SyntheticEvent::new("").build();
        let frame = FrameProcessor::new(anchor()).build_frame(&event, FrameId(1), &unnamed);
        assert!(frame.breakpoint_info.synthetic, "placeholder, not breakpoint 9");
        assert_eq!(frame.breakpoint_info.id, None);
    }

    #[test]
    fn test_anchor_maps_monotonic_to_wall() {
        let anchor = ClockAnchor::fixed(1_000, DateTime::from_timestamp(100, 0).unwrap());
        assert_eq!(anchor.to_wall(1_000), anchor.wall);
        assert_eq!(anchor.to_wall(1_000 + 1_500_000_000).timestamp_millis(), 101_500);
        assert_eq!(anchor.to_wall(0).timestamp_nanos_opt(), Some(100_000_000_000 - 1_000));
    }
}
