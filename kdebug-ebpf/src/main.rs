//! # eBPF Kernel-Side Probes
//!
//! Generic kprobe/kretprobe programs attached by userspace to every function
//! that has an enabled breakpoint. Each firing that passes the filter writes
//! exactly one [`DebugEvent`] into the ring buffer, or is counted as dropped.
//!
//! ## Programs
//!
//! - **Kprobe**: `debug_entry` - function entry
//! - **Kretprobe**: `debug_exit` - function return (optional)
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (1MB default, resized by the loader)
//! - `CONTROL` - Global enable, target PID, allow-list switch
//! - `FUNCTIONS` - Function address → breakpoint id and name
//! - `ALLOW` - Breakpoint ids admitted when the allow-list is active
//! - `COUNTERS` - Per-CPU fired/filtered/dropped counters
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    bindings::pt_regs,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
        gen,
    },
    macros::{kprobe, kretprobe, map},
    maps::{Array, HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use kdebug_common::{
    DebugEvent, DebuggerControl, FunctionSlot, COMM_LEN, COUNTER_DROPPED, COUNTER_FILTERED,
    COUNTER_FIRED, COUNTER_SLOTS, EVENT_KIND_ENTRY, EVENT_KIND_EXIT, FUNCTION_NAME_LEN,
    LOCAL_SLOTS, REGISTER_SLOTS, REG_S0, REG_SP, STACK_SLOTS,
};

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace
///
/// - **Size**: 1MB (userspace overrides with `set_max_entries`)
/// - **Overflow**: reservation fails, `COUNTERS[DROPPED]` is incremented
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

/// Index 0 holds the [`DebuggerControl`] block
#[map]
static CONTROL: Array<DebuggerControl> = Array::with_max_entries(1, 0);

/// Map: kernel function address → breakpoint id and name
///
/// Keyed by `bpf_get_func_ip`, so one generic program serves every target.
#[map]
static FUNCTIONS: HashMap<u64, FunctionSlot> = HashMap::with_max_entries(256, 0);

/// Map: breakpoint id → 1, consulted only when `use_allow_list` is set
#[map]
static ALLOW: HashMap<u32, u8> = HashMap::with_max_entries(256, 0);

/// Per-CPU event accounting, indexed by `COUNTER_*`
#[map]
static COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(COUNTER_SLOTS, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: entry of any probed kernel function
#[kprobe]
pub fn debug_entry(ctx: ProbeContext) -> u32 {
    match try_capture(&ctx, ctx.regs, EVENT_KIND_ENTRY) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: return from any probed kernel function
#[kretprobe]
pub fn debug_exit(ctx: RetProbeContext) -> u32 {
    match try_capture(&ctx, ctx.regs, EVENT_KIND_EXIT) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_capture<C: EbpfContext>(ctx: &C, regs: *mut pt_regs, kind: u32) -> Result<(), i64> {
    // Filter, cheapest first: enable flag, PID, allow-list
    let Some(control) = CONTROL.get(0).copied() else {
        bump(COUNTER_FILTERED);
        return Ok(());
    };

    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let tgid = (pid_tgid >> 32) as u32;
    if !control.admits_process(tgid) {
        bump(COUNTER_FILTERED);
        return Ok(());
    }

    let func_ip = unsafe { gen::bpf_get_func_ip(ctx.as_ptr()) };
    let slot = unsafe { FUNCTIONS.get(&func_ip).copied() };
    let breakpoint_id = slot.map_or(0, |s| s.breakpoint_id);

    if control.requires_allow_list() && unsafe { ALLOW.get(&breakpoint_id) }.is_none() {
        bump(COUNTER_FILTERED);
        return Ok(());
    }

    bump(COUNTER_FIRED);
    if slot.is_none() {
        warn!(ctx, "probe fired for unregistered address 0x{:x}", func_ip);
    }

    // Write in place: the event is too large for the 512-byte BPF stack
    let Some(mut entry) = EVENTS.reserve::<DebugEvent>(0) else {
        bump(COUNTER_DROPPED);
        return Err(1);
    };

    let event = entry.as_mut_ptr();
    let registers = read_registers(regs, func_ip, kind);
    unsafe {
        (*event).pid = pid_tgid as u32;
        (*event).tgid = tgid;
        (*event).timestamp_ns = bpf_ktime_get_ns();
        (*event).breakpoint_id = breakpoint_id;
        (*event).kind = kind;
        (*event).comm = bpf_get_current_comm().unwrap_or([0u8; COMM_LEN]);
        (*event).function = slot.map_or([0u8; FUNCTION_NAME_LEN], |s| s.name);
        (*event).regs = registers;
        (*event).stack = read_stack(registers[REG_SP]);
        (*event).locals = read_locals(registers[REG_S0]);
    }
    entry.submit(0);

    Ok(())
}

fn bump(index: u32) {
    if let Some(counter) = COUNTERS.get_ptr_mut(index) {
        unsafe { *counter += 1 };
    }
}

/// Copy `STACK_SLOTS` words starting at the stack pointer (one bounded read)
fn read_stack(sp: u64) -> [u64; STACK_SLOTS] {
    if sp == 0 {
        return [0; STACK_SLOTS];
    }
    unsafe { bpf_probe_read_kernel(sp as *const [u64; STACK_SLOTS]).unwrap_or([0; STACK_SLOTS]) }
}

/// Copy `LOCAL_SLOTS` words below the frame pointer, nearest first
fn read_locals(fp: u64) -> [u64; LOCAL_SLOTS] {
    let mut locals = [0u64; LOCAL_SLOTS];
    let span = (LOCAL_SLOTS * 8) as u64;
    if fp < span {
        return locals;
    }
    let raw: [u64; LOCAL_SLOTS] = unsafe {
        bpf_probe_read_kernel((fp - span) as *const [u64; LOCAL_SLOTS]).unwrap_or([0; LOCAL_SLOTS])
    };
    // raw[LOCAL_SLOTS - 1] sits at fp-8
    for i in 0..LOCAL_SLOTS {
        locals[i] = raw[LOCAL_SLOTS - 1 - i];
    }
    locals
}

// ============================================================================
// Register Capture (per architecture)
// ============================================================================

#[cfg(bpf_target_arch = "riscv64")]
fn read_registers(regs: *mut pt_regs, func_ip: u64, _kind: u32) -> [u64; REGISTER_SLOTS] {
    let mut out = [0u64; REGISTER_SLOTS];
    if regs.is_null() {
        return out;
    }
    unsafe {
        let r = &*regs;
        out[0] = func_ip;
        out[1] = r.ra;
        out[2] = r.sp;
        out[3] = r.gp;
        out[4] = r.tp;
        out[5] = r.t0;
        out[6] = r.t1;
        out[7] = r.t2;
        out[8] = r.s0;
        out[9] = r.s1;
        out[10] = r.a0;
        out[11] = r.a1;
        out[12] = r.a2;
        out[13] = r.a3;
        out[14] = r.a4;
        out[15] = r.a5;
        out[16] = r.a6;
        out[17] = r.a7;
    }
    out
}

#[cfg(bpf_target_arch = "x86_64")]
fn read_registers(regs: *mut pt_regs, func_ip: u64, kind: u32) -> [u64; REGISTER_SLOTS] {
    let mut out = [0u64; REGISTER_SLOTS];
    if regs.is_null() {
        return out;
    }
    unsafe {
        let r = &*regs;
        out[0] = func_ip;
        // Return address is only on top of the stack at entry
        if kind == EVENT_KIND_ENTRY {
            out[1] = bpf_probe_read_kernel(r.rsp as *const u64).unwrap_or(0);
        }
        out[2] = r.rsp;
        out[5] = r.rax;
        out[6] = r.r10;
        out[7] = r.r11;
        out[8] = r.rbp;
        out[9] = r.rbx;
        out[10] = r.rdi;
        out[11] = r.rsi;
        out[12] = r.rdx;
        out[13] = r.rcx;
        out[14] = r.r8;
        out[15] = r.r9;
    }
    out
}

#[cfg(not(any(bpf_target_arch = "riscv64", bpf_target_arch = "x86_64")))]
fn read_registers(_regs: *mut pt_regs, func_ip: u64, _kind: u32) -> [u64; REGISTER_SLOTS] {
    let mut out = [0u64; REGISTER_SLOTS];
    out[0] = func_ip;
    out
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
