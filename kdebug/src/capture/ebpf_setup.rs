//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled probe program and wires its maps for one recording.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load bytecode with the configured ring size
//! - [`write_control()`] - Set enable flag, target PID and allow-list switch
//! - [`register_functions()`] - Populate `FUNCTIONS` and `ALLOW`
//! - [`attach_probes()`] - Attach `debug_entry` (and `debug_exit`) per function

use anyhow::{Context, Result};
use aya::{
    include_bytes_aligned,
    maps::{Array, HashMap, MapData},
    programs::KProbe,
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use kdebug_common::{DebuggerControl, FunctionSlot};
use log::{info, warn};

use crate::domain::CaptureError;

/// Resolved probe target: function name, kernel address and breakpoint id
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub function: String,
    pub address: u64,
    pub breakpoint_id: u32,
}

/// Load the eBPF program binary, sizing the `EVENTS` ring buffer
///
/// Always uses the release build; debug builds pull in formatting code the
/// BPF linker cannot handle.
///
/// # Errors
/// Returns an error if the kernel refuses the program or the ring size
pub fn load_ebpf_program(ring_size: u32) -> Result<Ebpf, CaptureError> {
    let bpf = EbpfLoader::new()
        .set_max_entries("EVENTS", ring_size)
        .load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/kdebug"))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write the control block to `CONTROL[0]`
///
/// # Errors
/// Returns an error if the map is missing or the update fails
pub fn write_control(control: &mut Array<MapData, DebuggerControl>, value: DebuggerControl) -> Result<()> {
    control.set(0, value, 0).context("Failed to update CONTROL map")?;
    Ok(())
}

/// Fill `FUNCTIONS` (address → slot) and `ALLOW` (breakpoint id → 1)
///
/// # Errors
/// Returns an error if either map is missing or an insert fails
pub fn register_functions(bpf: &mut Ebpf, targets: &[ResolvedTarget]) -> Result<()> {
    let mut functions: HashMap<_, u64, FunctionSlot> =
        HashMap::try_from(bpf.map_mut("FUNCTIONS").context("FUNCTIONS map not found")?)?;
    for target in targets {
        functions.insert(
            target.address,
            FunctionSlot::new(target.breakpoint_id, target.function.as_bytes()),
            0,
        )?;
    }

    let mut allow: HashMap<_, u32, u8> =
        HashMap::try_from(bpf.map_mut("ALLOW").context("ALLOW map not found")?)?;
    for target in targets {
        allow.insert(target.breakpoint_id, 1, 0)?;
    }

    info!("✓ Registered {} probe targets", targets.len());
    Ok(())
}

/// Load and attach the entry program (and optionally the exit program) to
/// every target
///
/// Returns the number of attached probes.
///
/// # Errors
/// Returns `CaptureError::KernelReject` naming the first function the kernel
/// refused
pub fn attach_probes(
    bpf: &mut Ebpf,
    targets: &[ResolvedTarget],
    exit_probes: bool,
) -> Result<usize, CaptureError> {
    let mut programs = vec!["debug_entry"];
    if exit_probes {
        programs.push("debug_exit");
    }

    let mut attached = 0;
    for name in programs {
        let reject = |function: &str, reason: String| CaptureError::KernelReject {
            function: function.to_string(),
            reason,
        };
        let program: &mut KProbe = bpf
            .program_mut(name)
            .ok_or_else(|| reject(name, "program not found in object".to_string()))?
            .try_into()
            .map_err(|e| reject(name, format!("{e}")))?;
        program.load().map_err(|e| reject(name, format!("{e}")))?;

        for target in targets {
            program
                .attach(&target.function, 0)
                .map_err(|e| reject(&target.function, format!("{e}")))?;
            attached += 1;
        }
        info!("✓ Attached {name} to {} functions", targets.len());
    }

    Ok(attached)
}
