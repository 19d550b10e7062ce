//! Canonical frame record
//!
//! One [`Frame`] per captured event. Frames are created by the processor and
//! never mutated afterwards; the raw event bytes travel with the frame so it
//! can be rebuilt from scratch.

use chrono::{DateTime, Utc};
use kdebug_common::{EVENT_KIND_EXIT, REGISTER_NAMES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::{BreakpointId, FrameId};

/// Placeholder for file names and functions no symbol source could resolve
pub const UNRESOLVED: &str = "??";

/// Function name used when the event's name field is empty
pub const UNKNOWN_FUNCTION: &str = "unknown_function";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Entry,
    Exit,
}

impl EventKind {
    pub fn from_wire(kind: u32) -> Self {
        if kind == EVENT_KIND_EXIT {
            EventKind::Exit
        } else {
            EventKind::Entry
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Entry => write!(f, "entry"),
            EventKind::Exit => write!(f, "exit"),
        }
    }
}

/// A 64-bit value shown both ways
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scalar {
    /// `0x` + 16 lowercase hex digits
    pub hex: String,
    pub decimal: u64,
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar { hex: format!("0x{value:016x}"), decimal: value }
    }
}

/// Breakpoint a frame was attributed to
///
/// `synthetic` frames matched no enabled breakpoint; only `function` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRef {
    pub id: Option<BreakpointId>,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub synthetic: bool,
}

impl BreakpointRef {
    pub fn placeholder(function: &str) -> Self {
        BreakpointRef {
            id: None,
            file: String::new(),
            line: 0,
            function: function.to_string(),
            synthetic: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub address: u64,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEntry {
    pub function: String,
    pub return_address: u64,
    /// `A0..A7`
    pub arguments: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: DateTime<Utc>,
    /// Kernel timestamp of the event (`CLOCK_MONOTONIC`)
    pub monotonic_ns: u64,
    pub event_kind: EventKind,
    pub pid: u32,
    pub tgid: u32,
    pub comm: String,
    pub breakpoint_info: BreakpointRef,
    pub registers: BTreeMap<String, u64>,
    pub locals: BTreeMap<String, Scalar>,
    pub globals: BTreeMap<String, Scalar>,
    pub stack_slots: Vec<u64>,
    pub stack_frames: Vec<StackFrame>,
    pub call_chain: Vec<CallEntry>,
    /// Lowercase hex in artifacts
    #[serde(with = "hex")]
    pub raw_event: Vec<u8>,
}

impl Frame {
    /// Name of the function the event fired in
    pub fn function(&self) -> &str {
        self.call_chain.first().map_or(UNKNOWN_FUNCTION, |c| c.function.as_str())
    }

    /// Register by canonical name (`PC`, `SP`, `A0`, ...); 0 if absent
    pub fn register(&self, name: &str) -> u64 {
        self.registers.get(name).copied().unwrap_or(0)
    }

    /// Argument registers in order
    pub fn arguments(&self) -> impl Iterator<Item = u64> + '_ {
        REGISTER_NAMES.iter().filter(|n| n.starts_with('A')).map(|n| self.register(n))
    }
}
