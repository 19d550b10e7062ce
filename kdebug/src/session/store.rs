//! In-memory session: an append-only frame log plus its metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breakpoints::Breakpoint;
use crate::capture::DrainSummary;
use crate::domain::{AppendError, FrameId, ValidationFailure};
use crate::frames::{ClockAnchor, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub root_path: PathBuf,
    pub name: String,
}

impl ProjectInfo {
    pub fn from_root(root: &Path) -> Self {
        let name = root
            .file_name()
            .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self { root_path: root.to_path_buf(), name }
    }
}

/// Machine a session was recorded on
///
/// Register values and kernel addresses only make sense against this kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemEnvironment {
    pub kernel_release: String,
    pub machine: String,
    pub hostname: String,
}

impl SystemEnvironment {
    /// Read `uname(2)`; empty fields if the call fails
    #[allow(unsafe_code)]
    pub fn current() -> Self {
        // SAFETY: utsname only holds byte arrays, all zeroes is a valid value
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: uts is a valid, writable utsname
        if unsafe { libc::uname(&mut uts) } != 0 {
            return Self::default();
        }
        Self {
            kernel_release: uts_field(&uts.release),
            machine: uts_field(&uts.machine),
            hostname: uts_field(&uts.nodename),
        }
    }

    /// True when both sides name the same kernel build and architecture
    pub fn same_kernel(&self, other: &Self) -> bool {
        self.kernel_release == other.kernel_release && self.machine == other.machine
    }
}

#[allow(clippy::cast_sign_loss)]
fn uts_field(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Counters of one recording, monotonic while it runs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStatistics {
    pub frame_count: u64,
    pub duration_ms: u64,
    pub events_fired: u64,
    pub events_filtered: u64,
    pub events_dropped: u64,
    pub ring_drops: u64,
    pub queue_drops: u64,
    pub late_drops: u64,
    pub decode_errors: u64,
    /// Events whose name fields were not valid UTF-8
    pub binary_names: u64,
    /// Events delivered while the controller was not recording
    pub ignored_events: u64,
    /// Frames whose wall-clock time was raised to their predecessor's
    pub clamped_timestamps: u64,
    /// Frames per breakpoint id; only breakpoints that triggered appear
    pub breakpoint_hits: BTreeMap<u32, u64>,
    pub stop_reason: Option<String>,
}

impl SessionStatistics {
    /// Fold the collector's final accounting in
    pub fn absorb(&mut self, summary: &DrainSummary) {
        self.events_fired = summary.events_fired;
        self.events_filtered = summary.events_filtered;
        self.events_dropped = summary.events_dropped;
        self.ring_drops = summary.ring_drops;
        self.queue_drops = summary.queue_drops;
        self.late_drops = summary.late_drops;
        self.decode_errors = summary.decode_errors;
        if summary.stop_reason.is_some() {
            self.stop_reason.clone_from(&summary.stop_reason);
        }
    }

    pub fn record_hit(&mut self, frame: &Frame) {
        if let Some(id) = frame.breakpoint_info.id {
            *self.breakpoint_hits.entry(id.0).or_default() += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) start_time: DateTime<Utc>,
    pub(super) end_time: Option<DateTime<Utc>>,
    pub(super) status: SessionStatus,
    pub(super) project: ProjectInfo,
    pub(super) environment: SystemEnvironment,
    pub(super) statistics: SessionStatistics,
    pub(super) clock_anchor: ClockAnchor,
    pub(super) breakpoints: Vec<Breakpoint>,
    pub(super) frames: Vec<Frame>,
    pub(super) current_index: usize,
}

impl Session {
    /// Start an active session
    ///
    /// `breakpoints` is the snapshot frames are correlated against.
    pub fn new(
        name: String,
        project: ProjectInfo,
        clock_anchor: ClockAnchor,
        breakpoints: Vec<Breakpoint>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            start_time: clock_anchor.wall,
            end_time: None,
            status: SessionStatus::Active,
            project,
            environment: SystemEnvironment::current(),
            statistics: SessionStatistics::default(),
            clock_anchor,
            breakpoints,
            frames: Vec::new(),
            current_index: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    pub fn environment(&self) -> &SystemEnvironment {
        &self.environment
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.statistics
    }

    pub fn statistics_mut(&mut self) -> &mut SessionStatistics {
        &mut self.statistics
    }

    pub fn clock_anchor(&self) -> ClockAnchor {
        self.clock_anchor
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Cursor position; `None` for an empty session
    pub fn current_index(&self) -> Option<usize> {
        (!self.frames.is_empty()).then_some(self.current_index)
    }

    /// Id the next appended frame must carry
    pub fn next_frame_id(&self) -> FrameId {
        self.frames.last().map_or(FrameId::FIRST, |f| f.id.next())
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.frames.last().map(|f| f.timestamp)
    }

    /// Time from start to end, or to now while active
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or_default()
    }

    /// Append the next frame and move the cursor onto it
    ///
    /// # Errors
    /// - `AppendError::Sealed` once the session has ended
    /// - `AppendError::OutOfSequence` if `frame.id` is not `len + 1`
    /// - `AppendError::TimestampRegression` if `frame` is older than the last frame
    pub fn append(&mut self, frame: Frame) -> Result<(), AppendError> {
        if self.status == SessionStatus::Ended {
            return Err(AppendError::Sealed);
        }
        let expected = self.next_frame_id();
        if frame.id != expected {
            return Err(AppendError::OutOfSequence { expected, found: frame.id });
        }
        if self.last_timestamp().is_some_and(|last| frame.timestamp < last) {
            return Err(AppendError::TimestampRegression { frame: frame.id });
        }
        self.frames.push(frame);
        self.current_index = self.frames.len() - 1;
        self.statistics.frame_count = self.frames.len() as u64;
        Ok(())
    }

    /// End the session; it is immutable afterwards
    #[allow(clippy::cast_possible_truncation)]
    pub fn seal(&mut self, end_time: DateTime<Utc>) {
        if self.status == SessionStatus::Ended {
            return;
        }
        self.status = SessionStatus::Ended;
        self.end_time = Some(end_time.max(self.start_time));
        self.statistics.frame_count = self.frames.len() as u64;
        self.statistics.duration_ms = self.duration().as_millis() as u64;
    }
}

/// Check the frame-id and timestamp invariants of a frame sequence
///
/// # Errors
/// Returns the first violation found
pub fn validate_frames(frames: &[Frame]) -> Result<(), ValidationFailure> {
    let mut previous: Option<&Frame> = None;
    let mut expected = FrameId::FIRST;
    for frame in frames {
        if frame.id != expected {
            return Err(match previous {
                Some(prev) if frame.id <= prev.id => {
                    ValidationFailure::Inversion { previous: prev.id, found: frame.id }
                }
                _ => ValidationFailure::Gap { expected, found: frame.id },
            });
        }
        if previous.is_some_and(|prev| frame.timestamp < prev.timestamp) {
            return Err(ValidationFailure::TimestampInversion { frame: frame.id });
        }
        previous = Some(frame);
        expected = expected.next();
    }
    Ok(())
}
