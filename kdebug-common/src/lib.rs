//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the wire record and control structures shared between the kernel-side
//! probe program and the userspace collector. All types use `#[repr(C)]` and are
//! laid out without implicit padding so both sides agree byte-for-byte.
//!
//! ## Key Types
//!
//! - [`DebugEvent`] - One record per probe firing, passed via ring buffer
//! - [`DebuggerControl`] - Global enable, target PID and allow-list switch
//! - [`FunctionSlot`] - Per-function metadata keyed by kernel address
//!
//! The layout is load-bearing: changing any field requires rebuilding both the
//! probe program and the userspace binary.

#![no_std]

// ============================================================================
// Event Kinds
// ============================================================================

/// Probe fired on function entry (`kprobe`)
pub const EVENT_KIND_ENTRY: u32 = 0;

/// Probe fired on function return (`kretprobe`)
pub const EVENT_KIND_EXIT: u32 = 1;

// ============================================================================
// Field Sizes
// ============================================================================

/// Process name length (matches kernel `TASK_COMM_LEN`)
pub const COMM_LEN: usize = 16;

/// Function name length, NUL-padded
pub const FUNCTION_NAME_LEN: usize = 64;

/// General-purpose register slots carried per event
pub const REGISTER_SLOTS: usize = 20;

/// Raw stack words copied from the stack pointer upwards
pub const STACK_SLOTS: usize = 8;

/// Raw words copied from below the frame pointer
pub const LOCAL_SLOTS: usize = 16;

/// Compiled-in size of [`DebugEvent`]. Records of any other length are rejected.
pub const EVENT_SIZE: usize = 456;

// ============================================================================
// Register Slot Layout
// ============================================================================
//
// Slot order follows the RISC-V calling convention. On other architectures the
// probe fills the closest equivalent register and leaves the rest zeroed.

pub const REG_PC: usize = 0;
pub const REG_RA: usize = 1;
pub const REG_SP: usize = 2;
pub const REG_GP: usize = 3;
pub const REG_TP: usize = 4;
pub const REG_T0: usize = 5;
pub const REG_T1: usize = 6;
pub const REG_T2: usize = 7;
pub const REG_S0: usize = 8;
pub const REG_S1: usize = 9;
pub const REG_A0: usize = 10;
pub const REG_A7: usize = 17;

/// Number of argument registers (A0..A7)
pub const ARG_REGISTERS: usize = 8;

/// Canonical names for the named register slots, indexed by slot
///
/// Slots beyond this table are reserved and never reported.
pub const REGISTER_NAMES: [&str; 18] = [
    "PC", "RA", "SP", "GP", "TP", "T0", "T1", "T2", "S0", "S1", "A0", "A1", "A2", "A3", "A4",
    "A5", "A6", "A7",
];

// ============================================================================
// Counter Indices (COUNTERS per-CPU array)
// ============================================================================

/// Invocations that passed the filter and tried to emit an event
pub const COUNTER_FIRED: u32 = 0;

/// Invocations rejected by the enable flag, PID filter or allow-list
pub const COUNTER_FILTERED: u32 = 1;

/// Invocations that passed the filter but found the ring buffer full
pub const COUNTER_DROPPED: u32 = 2;

/// Number of counter slots
pub const COUNTER_SLOTS: u32 = 3;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from the probe program to userspace via ring buffer
///
/// **Memory Layout**: `#[repr(C)]`, 8-byte aligned, no padding holes
/// **Size**: [`EVENT_SIZE`] bytes
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DebugEvent {
    /// Thread ID (kernel `pid`)
    pub pid: u32,

    /// Process ID (kernel `tgid`), the value the PID filter compares against
    pub tgid: u32,

    /// Monotonic timestamp from `bpf_ktime_get_ns()`
    pub timestamp_ns: u64,

    /// Breakpoint id registered for the probed function
    ///
    /// Treated as a hint only. Userspace correlates by function name.
    pub breakpoint_id: u32,

    /// [`EVENT_KIND_ENTRY`] or [`EVENT_KIND_EXIT`]
    pub kind: u32,

    /// Current task name, NUL-padded
    pub comm: [u8; COMM_LEN],

    /// Probed function name, NUL-padded
    pub function: [u8; FUNCTION_NAME_LEN],

    /// Register snapshot, see `REG_*` slot indices
    pub regs: [u64; REGISTER_SLOTS],

    /// Raw words read from `SP`, `SP+8`, ...
    pub stack: [u64; STACK_SLOTS],

    /// Raw words read from `FP-8`, `FP-16`, ...
    pub locals: [u64; LOCAL_SLOTS],
}

const _: () = assert!(core::mem::size_of::<DebugEvent>() == EVENT_SIZE);

impl DebugEvent {
    /// All-zero event, used as a template by writers
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            tgid: 0,
            timestamp_ns: 0,
            breakpoint_id: 0,
            kind: EVENT_KIND_ENTRY,
            comm: [0; COMM_LEN],
            function: [0; FUNCTION_NAME_LEN],
            regs: [0; REGISTER_SLOTS],
            stack: [0; STACK_SLOTS],
            locals: [0; LOCAL_SLOTS],
        }
    }
}

/// Runtime control block, stored at index 0 of the `CONTROL` array
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DebuggerControl {
    /// 0 = probes return immediately, 1 = capture
    pub global_enable: u32,

    /// Target process (tgid). 0 = all processes
    pub target_pid: u32,

    /// When non-zero, only breakpoint ids present in `ALLOW` are captured
    pub use_allow_list: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,
}

impl DebuggerControl {
    /// Cheap part of the filter: enable flag, then PID
    #[must_use]
    pub const fn admits_process(&self, tgid: u32) -> bool {
        if self.global_enable == 0 {
            return false;
        }
        self.target_pid == 0 || self.target_pid == tgid
    }

    #[must_use]
    pub const fn requires_allow_list(&self) -> bool {
        self.use_allow_list != 0
    }
}

/// Per-function metadata, keyed by kernel function address in `FUNCTIONS`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FunctionSlot {
    /// Breakpoint id stamped into events for this function
    pub breakpoint_id: u32,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Function name, NUL-padded
    pub name: [u8; FUNCTION_NAME_LEN],
}

impl FunctionSlot {
    /// Build a slot, truncating `name` to [`FUNCTION_NAME_LEN`] - 1 bytes
    #[must_use]
    pub fn new(breakpoint_id: u32, name: &[u8]) -> Self {
        let mut buf = [0u8; FUNCTION_NAME_LEN];
        let len = if name.len() < FUNCTION_NAME_LEN { name.len() } else { FUNCTION_NAME_LEN - 1 };
        buf[..len].copy_from_slice(&name[..len]);
        Self { breakpoint_id, _padding: 0, name: buf }
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// Plain bytes on both sides of the map and ring buffer boundary
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for DebugEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for DebuggerControl {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for FunctionSlot {}
