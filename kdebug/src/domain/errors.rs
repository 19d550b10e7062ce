//! Structured error types for kdebug
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{ControllerState, FrameId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("A collector is already running")]
    AlreadyRunning,

    #[error("No probe targets: no enabled breakpoint names a kernel function")]
    NoTargets,

    #[error("Kernel rejected probe on {function}: {reason}")]
    KernelReject { function: String, reason: String },

    #[error("Invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Probe setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Aya(#[from] aya::EbpfError),
}

/// Raw record whose length does not match the compiled-in event size
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("event size mismatch: expected {expected} bytes, got {actual}")]
pub struct DecodeError {
    pub expected: usize,
    pub actual: usize,
}

/// Why a session artifact failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("gap in frame ids: expected {expected}, found {found}")]
    Gap { expected: FrameId, found: FrameId },

    #[error("frame ids out of order: {found} after {previous}")]
    Inversion { previous: FrameId, found: FrameId },

    #[error("timestamp of frame {frame} precedes the previous frame")]
    TimestampInversion { frame: FrameId },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session artifact not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid session artifact: {0}")]
    Invalid(ValidationFailure),

    #[error("Session artifact schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Failed to write session artifact {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Frame rejected by an append-only session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    #[error("session is sealed")]
    Sealed,

    #[error("frame id {found} breaks the sequence, expected {expected}")]
    OutOfSequence { expected: FrameId, found: FrameId },

    #[error("frame {frame} is older than its predecessor")]
    TimestampRegression { frame: FrameId },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationError {
    #[error("Frame index {index} out of range (session has {len} frames)")]
    OutOfRange { index: usize, len: usize },

    #[error("Already at the session boundary")]
    AtBoundary,

    #[error("No session loaded")]
    NoSession,
}

#[derive(Error, Debug)]
pub enum BreakpointError {
    #[error("No breakpoint at {file}:{line}")]
    NotFound { file: String, line: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("No enabled breakpoints")]
    NoBreakpoints,

    #[error("A recording is already in progress")]
    CollectorBusy,

    #[error("Not recording")]
    NotRecording,

    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: ControllerState },

    #[error("Controller is no longer running")]
    Stopped,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
}
