//! Event source and probe backend capabilities
//!
//! The collector only knows these two traits. [`KernelBackend`] installs real
//! kprobes; [`SyntheticBackend`] drives the same pipeline from test code.
//!
//! [`KernelBackend`]: super::kernel::KernelBackend
//! [`SyntheticBackend`]: super::synthetic::SyntheticBackend

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::time::Duration;

use crate::breakpoints::ProbeTarget;
use crate::config::CaptureConfig;
use crate::domain::CaptureError;

/// Probe-side event accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCounters {
    /// Invocations that passed the filter and tried to emit an event
    pub fired: u64,
    /// Invocations rejected by enable flag, PID filter or allow-list
    pub filtered: u64,
    /// Emit attempts that found the ring full
    pub dropped: u64,
}

/// Readable end of an installed probe set
///
/// Dropping the source uninstalls the probes.
pub trait EventSource: Send + 'static {
    /// Records buffered right now, in ring order. Finite per call.
    fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_;

    /// Block until records may be available or `timeout` elapses
    ///
    /// A timeout is not an error. An error means the channel is unusable.
    fn wait_readable(&mut self, timeout: Duration) -> impl Future<Output = io::Result<()>> + Send + '_;

    /// Stop the probes from emitting further events
    ///
    /// # Errors
    /// Returns an error if the control block cannot be updated
    fn quiesce(&mut self) -> io::Result<()>;

    fn counters(&mut self) -> ProbeCounters;
}

/// Installs probes for a set of targets
pub trait ProbeBackend: Send + 'static {
    type Source: EventSource;

    /// # Errors
    /// - `CaptureError::NoTargets` if `targets` is empty
    /// - `CaptureError::KernelReject` if a probe cannot be installed
    fn install(
        &mut self,
        targets: &[ProbeTarget],
        config: &CaptureConfig,
    ) -> Result<Self::Source, CaptureError>;
}
