//! Kernel kprobe backend
//!
//! Resolves target functions through `/proc/kallsyms`, loads the probe
//! program, fills its maps and attaches one kprobe (plus an optional
//! kretprobe) per function. The returned [`KernelSource`] owns the loaded
//! program; dropping it detaches every probe.

use aya::maps::{Array, MapData, PerCpuArray, RingBuf};
use aya::Ebpf;
use kdebug_common::{DebuggerControl, EVENT_SIZE};
use log::{info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;

use super::diagnostics::read_probe_counters;
use super::ebpf_setup::{
    attach_probes, init_ebpf_logger, load_ebpf_program, register_functions, write_control,
    ResolvedTarget,
};
use super::ring::record_footprint;
use super::source::{EventSource, ProbeBackend, ProbeCounters};
use crate::breakpoints::ProbeTarget;
use crate::config::CaptureConfig;
use crate::domain::CaptureError;
use crate::symbols::KernelSymbols;

pub struct KernelBackend {
    symbols: Arc<KernelSymbols>,
}

impl KernelBackend {
    pub fn new(symbols: Arc<KernelSymbols>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> Arc<KernelSymbols> {
        Arc::clone(&self.symbols)
    }

    fn resolve(&self, targets: &[ProbeTarget]) -> Result<Vec<ResolvedTarget>, CaptureError> {
        targets
            .iter()
            .map(|target| {
                let address = self.symbols.address_of(&target.function).ok_or_else(|| {
                    CaptureError::KernelReject {
                        function: target.function.clone(),
                        reason: "not a text symbol in /proc/kallsyms".to_string(),
                    }
                })?;
                Ok(ResolvedTarget {
                    function: target.function.clone(),
                    address,
                    breakpoint_id: target.breakpoint_id.0,
                })
            })
            .collect()
    }
}

fn setup_error(e: &anyhow::Error) -> CaptureError {
    CaptureError::Setup(format!("{e:#}"))
}

fn take_map(bpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map, CaptureError> {
    bpf.take_map(name).ok_or_else(|| CaptureError::Setup(format!("{name} map not found")))
}

impl ProbeBackend for KernelBackend {
    type Source = KernelSource;

    fn install(
        &mut self,
        targets: &[ProbeTarget],
        config: &CaptureConfig,
    ) -> Result<KernelSource, CaptureError> {
        if targets.is_empty() {
            return Err(CaptureError::NoTargets);
        }
        let resolved = self.resolve(targets)?;

        let mut bpf = load_ebpf_program(config.ring_size_u32())?;
        init_ebpf_logger(&mut bpf);
        register_functions(&mut bpf, &resolved).map_err(|e| setup_error(&e))?;

        let mut control: Array<MapData, DebuggerControl> =
            Array::try_from(take_map(&mut bpf, "CONTROL")?)?;
        write_control(
            &mut control,
            DebuggerControl {
                global_enable: 1,
                target_pid: config.target_pid.0,
                use_allow_list: u32::from(config.use_allow_list),
                _padding: 0,
            },
        )
        .map_err(|e| setup_error(&e))?;

        let attached = attach_probes(&mut bpf, &resolved, config.exit_probes)?;
        info!("✓ {attached} probes live (target: {})", config.target_pid);

        let ring = RingBuf::try_from(take_map(&mut bpf, "EVENTS")?)?;
        let counters = PerCpuArray::try_from(take_map(&mut bpf, "COUNTERS")?)?;

        Ok(KernelSource {
            ring: AsyncFd::new(ring)?,
            control,
            counters,
            drain_budget: config.ring_size / record_footprint(EVENT_SIZE) + 1,
            _bpf: bpf,
        })
    }
}

pub struct KernelSource {
    ring: AsyncFd<RingBuf<MapData>>,
    control: Array<MapData, DebuggerControl>,
    counters: PerCpuArray<MapData, u64>,
    /// Upper bound on records per drain: one full ring
    drain_budget: usize,
    _bpf: Ebpf,
}

impl EventSource for KernelSource {
    fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        let ring = self.ring.get_mut();
        std::iter::from_fn(move || ring.next().map(|item| item.to_vec())).take(self.drain_budget)
    }

    async fn wait_readable(&mut self, timeout: Duration) -> io::Result<()> {
        match tokio::time::timeout(timeout, self.ring.readable_mut()).await {
            Ok(Ok(mut guard)) => {
                guard.clear_ready();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(()),
        }
    }

    fn quiesce(&mut self) -> io::Result<()> {
        write_control(&mut self.control, DebuggerControl::default()).map_err(io::Error::other)
    }

    fn counters(&mut self) -> ProbeCounters {
        read_probe_counters(&self.counters).unwrap_or_else(|e| {
            warn!("Failed to read probe counters: {e}");
            ProbeCounters::default()
        })
    }
}
