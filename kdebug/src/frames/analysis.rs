//! Quick findings for a single frame and the difference between two frames

use std::collections::BTreeMap;

use super::frame::Frame;

/// Lowest stack pointer considered a plausible user-space stack
const USER_STACK_LOW: u64 = 0x7fff_0000_0000;
const USER_STACK_HIGH: u64 = 0x7fff_ffff_0000;
/// Start of the kernel half of the address space on 64-bit targets
const KERNEL_SPACE_LOW: u64 = 0xffff_8000_0000_0000;

/// Where a stack pointer value lies
pub fn stack_region(sp: u64) -> &'static str {
    if sp > USER_STACK_LOW && sp < USER_STACK_HIGH {
        "user stack"
    } else if sp > KERNEL_SPACE_LOW {
        "kernel stack"
    } else {
        "suspicious"
    }
}

pub fn analyze_frame(frame: &Frame) -> BTreeMap<String, String> {
    let mut findings = BTreeMap::new();
    let sp = frame.register("SP");
    let pc = frame.register("PC");
    let ra = frame.register("RA");

    if sp != 0 {
        findings.insert("stack_pointer".to_string(), format!("0x{sp:016x}"));
        findings.insert("stack_region".to_string(), stack_region(sp).to_string());
    }

    if ra != 0 && ra != pc {
        findings.insert("return_address".to_string(), format!("0x{ra:016x}"));
        findings.insert("call".to_string(), "call detected".to_string());
    } else {
        findings.insert("call".to_string(), "no caller recorded".to_string());
    }

    let args = frame.arguments().filter(|&a| a != 0).count();
    findings.insert("nonzero_args".to_string(), args.to_string());

    let stack = frame.stack_slots.iter().filter(|&&s| s != 0).count();
    findings.insert(
        "stack_data".to_string(),
        format!("{stack}/{}", frame.stack_slots.len()),
    );

    findings
}

/// Register changes among PC, SP and A0, plus the time between the frames
pub fn diff_frames(a: &Frame, b: &Frame) -> BTreeMap<String, String> {
    let mut diff = BTreeMap::new();

    let changes: Vec<String> = ["PC", "SP", "A0"]
        .iter()
        .filter_map(|reg| {
            let (before, after) = (a.register(reg), b.register(reg));
            (before != after).then(|| format!("{reg}: 0x{before:x} -> 0x{after:x}"))
        })
        .collect();
    let registers = if changes.is_empty() {
        "no register changes".to_string()
    } else {
        changes.join(", ")
    };
    diff.insert("registers".to_string(), registers);

    let delta = b.timestamp - a.timestamp;
    let delta_us = delta.num_microseconds().unwrap_or(i64::MAX);
    diff.insert("time_diff".to_string(), format!("{delta_us}us"));

    diff
}
