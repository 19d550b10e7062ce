//! Synthetic probe backend
//!
//! Emulates the probe program in userspace: the same [`DebuggerControl`]
//! filter, the same counters and a byte-bounded [`RingChannel`]. Tests fire
//! events through a [`SyntheticProbe`]; the CLI uses [`SyntheticProbe::generate`]
//! to demo the pipeline on machines where kprobes are unavailable.

use kdebug_common::{
    DebugEvent, DebuggerControl, ARG_REGISTERS, COMM_LEN, EVENT_KIND_ENTRY, FUNCTION_NAME_LEN,
    LOCAL_SLOTS, REG_A0, REG_PC, REG_RA, REG_SP, STACK_SLOTS,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::event::{decode_name, encode_event};
use super::ring::RingChannel;
use super::source::{EventSource, ProbeBackend, ProbeCounters};
use crate::breakpoints::ProbeTarget;
use crate::config::CaptureConfig;
use crate::domain::CaptureError;

#[derive(Default)]
struct Installed {
    ring: Option<Arc<RingChannel>>,
    control: DebuggerControl,
    /// function name → breakpoint id
    functions: BTreeMap<String, u32>,
    allow: BTreeSet<u32>,
}

/// Userspace stand-in for the loaded probe program
#[derive(Default)]
pub struct SyntheticProbe {
    installed: Mutex<Installed>,
    rejected: Mutex<BTreeSet<String>>,
    fired: AtomicU64,
    filtered: AtomicU64,
}

impl SyntheticProbe {
    fn lock(&self) -> MutexGuard<'_, Installed> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `install` fail for `function`, as a kernel would for an
    /// unprobeable symbol
    pub fn reject(&self, function: &str) {
        self.rejected.lock().unwrap_or_else(PoisonError::into_inner).insert(function.to_string());
    }

    pub fn is_installed(&self) -> bool {
        self.lock().ring.is_some()
    }

    /// Simulate one firing of the probe on `event.function`
    ///
    /// Functions without an installed probe never fire. Otherwise the filter
    /// runs cheapest first, the breakpoint id is stamped in and the record is
    /// written to the ring.
    ///
    /// # Errors
    /// Returns `RING_FULL` if the ring has no room
    pub fn fire(&self, event: &DebugEvent) -> Result<(), i64> {
        let (ring, record) = {
            let installed = self.lock();
            let Some(ring) = installed.ring.clone() else {
                return Ok(());
            };
            let name = decode_name(&event.function).to_display();
            let Some(&breakpoint_id) = installed.functions.get(&name) else {
                return Ok(());
            };

            let control = installed.control;
            if !control.admits_process(event.tgid)
                || (control.requires_allow_list() && !installed.allow.contains(&breakpoint_id))
            {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            let mut stamped = *event;
            stamped.breakpoint_id = breakpoint_id;
            (ring, encode_event(&stamped))
        };

        self.fired.fetch_add(1, Ordering::Relaxed);
        ring.try_output(&record)
    }

    /// Fire `count` plausible events round-robin over the installed functions
    ///
    /// Returns the number of events that made it into the ring.
    pub fn generate(&self, count: usize, start_ns: u64) -> usize {
        let functions: Vec<String> = self.lock().functions.keys().cloned().collect();
        if functions.is_empty() {
            return 0;
        }
        let pid = std::process::id();
        (0..count)
            .filter(|&i| {
                let function = &functions[i % functions.len()];
                let seq = i as u64;
                let event = SyntheticEvent::new(function)
                    .pid(pid)
                    .timestamp_ns(start_ns + seq * 1_000)
                    .register(REG_PC, 0xffff_ffff_8100_0000 + seq * 0x40)
                    .register(REG_RA, 0xffff_ffff_8120_0000 + seq * 0x10)
                    .register(REG_SP, 0xffff_c900_0000_0000_u64.wrapping_sub(seq * 0x100))
                    .arg(0, seq)
                    .arg(1, seq * 2)
                    .local(0, seq + 1)
                    .build();
                self.fire(&event).is_ok()
            })
            .count()
    }

    fn counters(&self) -> ProbeCounters {
        let dropped = self.lock().ring.as_ref().map_or(0, |r| r.dropped());
        ProbeCounters {
            fired: self.fired.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped,
        }
    }
}

/// Backend whose probes live in a [`SyntheticProbe`]
#[derive(Clone, Default)]
pub struct SyntheticBackend {
    probe: Arc<SyntheticProbe>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle used to fire events into the installed probe set
    pub fn probe(&self) -> Arc<SyntheticProbe> {
        Arc::clone(&self.probe)
    }
}

impl ProbeBackend for SyntheticBackend {
    type Source = SyntheticSource;

    fn install(
        &mut self,
        targets: &[ProbeTarget],
        config: &CaptureConfig,
    ) -> Result<SyntheticSource, CaptureError> {
        if targets.is_empty() {
            return Err(CaptureError::NoTargets);
        }
        {
            let rejected = self.probe.rejected.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(target) = targets.iter().find(|t| rejected.contains(&t.function)) {
                return Err(CaptureError::KernelReject {
                    function: target.function.clone(),
                    reason: "probe installation refused".to_string(),
                });
            }
        }

        let ring = Arc::new(RingChannel::new(config.ring_size));
        self.probe.fired.store(0, Ordering::Relaxed);
        self.probe.filtered.store(0, Ordering::Relaxed);

        let mut installed = self.probe.lock();
        installed.functions =
            targets.iter().map(|t| (t.function.clone(), t.breakpoint_id.0)).collect();
        installed.allow = targets.iter().map(|t| t.breakpoint_id.0).collect();
        installed.control = DebuggerControl {
            global_enable: 1,
            target_pid: config.target_pid.0,
            use_allow_list: u32::from(config.use_allow_list),
            _padding: 0,
        };
        installed.ring = Some(Arc::clone(&ring));
        debug!("Installed {} synthetic probes", targets.len());

        Ok(SyntheticSource { probe: Arc::clone(&self.probe), ring })
    }
}

pub struct SyntheticSource {
    probe: Arc<SyntheticProbe>,
    ring: Arc<RingChannel>,
}

impl EventSource for SyntheticSource {
    fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.ring.drain()
    }

    async fn wait_readable(&mut self, timeout: Duration) -> io::Result<()> {
        self.ring.wait_readable(timeout).await;
        Ok(())
    }

    fn quiesce(&mut self) -> io::Result<()> {
        self.probe.lock().control.global_enable = 0;
        Ok(())
    }

    fn counters(&mut self) -> ProbeCounters {
        self.probe.counters()
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        let mut installed = self.probe.lock();
        installed.ring = None;
        installed.functions.clear();
        installed.allow.clear();
        installed.control = DebuggerControl::default();
    }
}

/// Builder for the events a probe would emit
#[derive(Clone, Copy)]
pub struct SyntheticEvent {
    event: DebugEvent,
}

impl SyntheticEvent {
    pub fn new(function: &str) -> Self {
        let mut event = DebugEvent::zeroed();
        copy_name(&mut event.function, function.as_bytes());
        copy_name(&mut event.comm, b"synthetic");
        event.kind = EVENT_KIND_ENTRY;
        Self { event }
    }

    /// Sets both thread and process id
    #[must_use]
    pub fn pid(mut self, pid: u32) -> Self {
        self.event.pid = pid;
        self.event.tgid = pid;
        self
    }

    #[must_use]
    pub fn timestamp_ns(mut self, ns: u64) -> Self {
        self.event.timestamp_ns = ns;
        self
    }

    #[must_use]
    pub fn kind(mut self, kind: u32) -> Self {
        self.event.kind = kind;
        self
    }

    #[must_use]
    pub fn comm(mut self, comm: &[u8]) -> Self {
        self.event.comm = [0; COMM_LEN];
        copy_name(&mut self.event.comm, comm);
        self
    }

    #[must_use]
    pub fn register(mut self, slot: usize, value: u64) -> Self {
        self.event.regs[slot] = value;
        self
    }

    /// Argument register `A<n>`
    #[must_use]
    pub fn arg(self, n: usize, value: u64) -> Self {
        debug_assert!(n < ARG_REGISTERS);
        self.register(REG_A0 + n, value)
    }

    #[must_use]
    pub fn stack(mut self, slot: usize, value: u64) -> Self {
        debug_assert!(slot < STACK_SLOTS);
        self.event.stack[slot] = value;
        self
    }

    #[must_use]
    pub fn local(mut self, slot: usize, value: u64) -> Self {
        debug_assert!(slot < LOCAL_SLOTS);
        self.event.locals[slot] = value;
        self
    }

    pub fn build(self) -> DebugEvent {
        self.event
    }
}

fn copy_name(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len().saturating_sub(1)).min(FUNCTION_NAME_LEN);
    dst[..len].copy_from_slice(&src[..len]);
}
