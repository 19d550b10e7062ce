//! Event capture
//!
//! Everything between the probed kernel function and the processor queue:
//! - Probe backends (kernel kprobes, synthetic for tests and demos)
//! - Ring channel and wire decoding
//! - The collector's reader task and its drop accounting

pub mod collector;
pub mod diagnostics;
pub mod ebpf_setup;
pub mod event;
pub mod kernel;
pub mod ring;
pub mod source;
pub mod synthetic;

pub use collector::{Collector, CollectorHandle, DrainSummary};
pub use diagnostics::print_drain_diagnostics;
pub use event::{decode_event, decode_name, encode_event, EventDecoder, NameField};
pub use kernel::{KernelBackend, KernelSource};
pub use ring::{RingChannel, RING_FULL};
pub use source::{EventSource, ProbeBackend, ProbeCounters};
pub use synthetic::{SyntheticBackend, SyntheticEvent, SyntheticProbe, SyntheticSource};
