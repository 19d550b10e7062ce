//! Frames: the normalised, replayable form of captured events

pub mod analysis;
pub mod frame;
pub mod processor;

pub use analysis::{analyze_frame, diff_frames};
pub use frame::{BreakpointRef, CallEntry, EventKind, Frame, Scalar, StackFrame};
pub use processor::{ClockAnchor, FrameProcessor, ProcessorExit, ProcessorTask};
