//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the many `u32`/`u64` identifiers in the
//! pipeline apart: a breakpoint id is never a frame id, and a thread id is
//! never the process id the filter compares against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID (kernel `tgid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl Pid {
    /// Filter value meaning "every process"
    pub const ALL: Pid = Pid(0);

    pub fn is_all(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Breakpoint identifier
///
/// Sequential within a breakpoint set, starting at 1. The probe program stamps
/// it into events, but correlation happens by function name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BP#{}", self.0)
    }
}

/// Frame identifier, dense and 1-based within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

impl FrameId {
    pub const FIRST: FrameId = FrameId(1);

    #[must_use]
    pub fn next(self) -> FrameId {
        FrameId(self.0 + 1)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Controller state, published to the pipeline tasks on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Recording,
    Playback,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Recording => "recording",
            ControllerState::Playback => "playback",
        };
        f.write_str(name)
    }
}
