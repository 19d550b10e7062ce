//! # Session Controller
//!
//! Owns the Idle / Recording / Playback state machine and everything that
//! hangs off it: the breakpoint set, the collector, the processor task of the
//! active recording and the replay cursor of the loaded session.
//!
//! State and breakpoint changes are published on `watch` channels; the
//! processor reads both before every event, so a transition is visible to it
//! before the next frame is built.
//!
//! ```text
//! Idle ──start──▶ Recording ──stop──▶ Idle (artifact written)
//! Idle ──load───▶ Playback  ──close─▶ Idle
//! ```

mod handle;

pub use handle::ControllerHandle;

use chrono::{Local, Utc};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breakpoints::{AddOutcome, Breakpoint, BreakpointSet, BreakpointSnapshot};
use crate::capture::{Collector, CollectorHandle, DrainSummary, ProbeBackend};
use crate::config::CaptureConfig;
use crate::domain::{CaptureError, ControllerError, ControllerState, NavigationError};
use crate::frames::{ClockAnchor, Frame, FrameProcessor, ProcessorExit, ProcessorTask};
use crate::session::{self, ProjectInfo, ReplayCursor, Session, SessionStatistics};
use crate::symbols::SymbolSource;

/// Returned by [`Controller::current_frame_info`] when there is nothing to show
pub const NO_SESSION: &str = "no session";

/// Outcome of a finished recording
#[derive(Debug, Clone)]
pub struct StopSummary {
    pub drain: DrainSummary,
    /// Frames kept in the session (0 after an abnormal stop)
    pub frames: usize,
    /// Where the session was autosaved, if it was
    pub saved_to: Option<PathBuf>,
    pub statistics: SessionStatistics,
}

struct ActiveRecording {
    collector: CollectorHandle,
    processor: JoinHandle<ProcessorExit>,
    session: Arc<RwLock<Session>>,
}

pub struct Controller<B: ProbeBackend> {
    backend: B,
    config: CaptureConfig,
    project: ProjectInfo,
    breakpoints: BreakpointSet,
    breakpoints_tx: watch::Sender<BreakpointSnapshot>,
    state_tx: watch::Sender<ControllerState>,
    collector: Collector,
    symbols: Option<Arc<dyn SymbolSource>>,
    recording: Option<ActiveRecording>,
    playback: Option<ReplayCursor>,
    last_stop: Option<StopSummary>,
    last_session: Option<Arc<Session>>,
}

impl<B: ProbeBackend> Controller<B> {
    pub fn new(
        backend: B,
        config: CaptureConfig,
        project: ProjectInfo,
        breakpoints: BreakpointSet,
    ) -> Self {
        let (breakpoints_tx, _) = watch::channel(breakpoints.snapshot());
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            backend,
            config,
            project,
            breakpoints,
            breakpoints_tx,
            state_tx,
            collector: Collector::new(),
            symbols: None,
            recording: None,
            playback: None,
            last_stop: None,
            last_session: None,
        }
    }

    /// Resolve caller addresses in recorded frames through `symbols`
    #[must_use]
    pub fn with_symbols(mut self, symbols: Arc<dyn SymbolSource>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    fn publish_state(&self, state: ControllerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("State: {previous} -> {state}");
        }
    }

    fn publish_breakpoints(&self) {
        self.breakpoints_tx.send_replace(self.breakpoints.snapshot());
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    pub fn add_breakpoint(&mut self, file: &str, line: u32, function: Option<&str>) -> AddOutcome {
        let outcome = self.breakpoints.add(file, line, function);
        self.publish_breakpoints();
        outcome
    }

    /// # Errors
    /// Returns an error if no breakpoint exists at `file:line`
    pub fn remove_breakpoint(&mut self, file: &str, line: u32) -> Result<Breakpoint, ControllerError> {
        let removed = self.breakpoints.remove(file, line)?;
        self.publish_breakpoints();
        Ok(removed)
    }

    /// Returns the new enabled flag
    ///
    /// # Errors
    /// Returns an error if no breakpoint exists at `file:line`
    pub fn toggle_breakpoint(&mut self, file: &str, line: u32) -> Result<bool, ControllerError> {
        let enabled = self.breakpoints.toggle(file, line)?;
        self.publish_breakpoints();
        Ok(enabled)
    }

    pub fn list_breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.list()
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.publish_breakpoints();
    }

    /// # Errors
    /// Returns an error if the breakpoint file cannot be written
    pub fn save_breakpoints(&self) -> Result<(), ControllerError> {
        self.breakpoints.save(&self.project.root_path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Install probes for the enabled breakpoints and start recording
    ///
    /// From Playback the loaded session is closed first. On failure the
    /// controller is Idle again.
    ///
    /// # Errors
    /// - `ControllerError::CollectorBusy` while already recording
    /// - `ControllerError::NoBreakpoints` without an enabled breakpoint
    /// - `ControllerError::Capture` if probe installation fails
    pub fn start_recording(&mut self, name: Option<&str>) -> Result<(), ControllerError> {
        if self.recording.is_some() {
            return Err(ControllerError::CollectorBusy);
        }
        if self.playback.is_some() {
            self.close_session();
        }
        if !self.breakpoints.has_enabled() {
            return Err(ControllerError::NoBreakpoints);
        }

        let targets = self.breakpoints.probe_targets();
        let snapshot = self.breakpoints.snapshot();
        let anchor = ClockAnchor::now();
        let name = name.map_or_else(
            || format!("session_{}", Local::now().format("%Y%m%d_%H%M%S")),
            str::to_string,
        );
        let session = Arc::new(RwLock::new(Session::new(
            name,
            self.project.clone(),
            anchor,
            snapshot.breakpoints().to_vec(),
        )));

        // Recording must be visible before the first event can arrive
        self.publish_state(ControllerState::Recording);
        let (collector, events) =
            match self.collector.start(&mut self.backend, &targets, &self.config) {
                Ok(started) => started,
                Err(e) => {
                    self.publish_state(ControllerState::Idle);
                    return Err(match e {
                        CaptureError::AlreadyRunning => ControllerError::CollectorBusy,
                        other => other.into(),
                    });
                }
            };

        let mut processor = FrameProcessor::new(anchor);
        if let Some(symbols) = &self.symbols {
            processor = processor.with_symbols(Arc::clone(symbols));
        }
        let task = ProcessorTask {
            processor,
            session: Arc::clone(&session),
            state: self.state_tx.subscribe(),
            breakpoints: self.breakpoints_tx.subscribe(),
        };
        let processor = tokio::task::spawn_blocking(move || task.run(&events));

        info!("✓ Recording {} functions", targets.len());
        self.recording = Some(ActiveRecording { collector, processor, session });
        self.last_stop = None;
        Ok(())
    }

    /// Stop the active recording, seal and autosave its session
    ///
    /// A second call returns the summary of the first.
    ///
    /// # Errors
    /// Returns `ControllerError::NotRecording` if no recording was ever stopped
    pub async fn stop_recording(&mut self) -> Result<StopSummary, ControllerError> {
        if self.recording.is_none() {
            return self.last_stop.clone().ok_or(ControllerError::NotRecording);
        }
        Ok(self.finish_recording().await)
    }

    /// Detect a recording whose reader or processor ended on its own
    ///
    /// Such a recording is torn down and its frames are discarded. Returns the
    /// summary if that happened.
    pub async fn check_health(&mut self) -> Option<StopSummary> {
        let recording = self.recording.as_ref()?;
        if !recording.collector.is_finished() && !recording.processor.is_finished() {
            return None;
        }
        Some(self.finish_recording().await)
    }

    async fn finish_recording(&mut self) -> StopSummary {
        let Some(mut recording) = self.recording.take() else {
            return self.last_stop.clone().unwrap_or_else(empty_summary);
        };

        let drain = recording.collector.stop().await;
        let exit = recording.processor.await.unwrap_or_else(|e| {
            ProcessorExit::Fatal(format!("processor task failed: {e}"))
        });
        self.publish_state(ControllerState::Idle);

        let mut session = match Arc::try_unwrap(recording.session) {
            Ok(lock) => lock.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared.read().unwrap_or_else(PoisonError::into_inner).clone(),
        };
        session.statistics_mut().absorb(&drain);
        let abnormal = match exit {
            ProcessorExit::Fatal(reason) => {
                session.statistics_mut().stop_reason = Some(reason);
                true
            }
            ProcessorExit::Disconnected { .. } => drain.stop_reason.is_some(),
        };
        session.seal(Utc::now());

        let saved_to = if abnormal {
            error!(
                "Recording ended abnormally ({}); discarding {} frames",
                session.statistics().stop_reason.as_deref().unwrap_or("unknown"),
                session.len()
            );
            None
        } else {
            self.autosave(&session)
        };

        let summary = StopSummary {
            drain,
            frames: if abnormal { 0 } else { session.len() },
            saved_to,
            statistics: session.statistics().clone(),
        };
        self.last_session = (!abnormal).then(|| Arc::new(session));
        self.last_stop = Some(summary.clone());
        summary
    }

    fn autosave(&self, session: &Session) -> Option<PathBuf> {
        let path = session::autosave_path(&self.project.root_path, session.start_time());
        match session::save(session, &path) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Autosave failed, session kept in memory: {e}");
                None
            }
        }
    }

    /// Session of the last completed recording
    pub fn last_session(&self) -> Option<Arc<Session>> {
        self.last_session.clone()
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    /// Session currently open for playback
    pub fn loaded_session(&self) -> Option<Arc<Session>> {
        self.playback.as_ref().map(|cursor| Arc::clone(cursor.session()))
    }

    /// Load an artifact and enter Playback
    ///
    /// A failed load leaves the controller as it was.
    ///
    /// # Errors
    /// - `ControllerError::InvalidState` while recording
    /// - `ControllerError::Session` if the artifact is missing or invalid
    pub fn load_session(&mut self, path: &Path) -> Result<(), ControllerError> {
        let state = self.state();
        if state == ControllerState::Recording {
            return Err(ControllerError::InvalidState { action: "load a session", state });
        }
        let session = session::load(path, self.config.strict_load)?;
        info!("✓ Loaded {} ({} frames)", path.display(), session.len());
        self.playback = Some(ReplayCursor::new(Arc::new(session)));
        self.publish_state(ControllerState::Playback);
        Ok(())
    }

    /// Save the loaded session, or the last recorded one
    ///
    /// # Errors
    /// - `ControllerError::InvalidState` while recording
    /// - `ControllerError::Navigation(NoSession)` if there is nothing to save
    /// - `ControllerError::Session` if the file cannot be written
    pub fn save_session(&self, path: &Path) -> Result<(), ControllerError> {
        let state = self.state();
        if state == ControllerState::Recording {
            return Err(ControllerError::InvalidState { action: "save a session", state });
        }
        let session = self
            .playback
            .as_ref()
            .map(ReplayCursor::session)
            .or(self.last_session.as_ref())
            .ok_or(NavigationError::NoSession)?;
        session::save(session, path)?;
        Ok(())
    }

    /// Leave Playback; a no-op in any other state
    pub fn close_session(&mut self) {
        if self.playback.take().is_some() {
            self.publish_state(ControllerState::Idle);
        }
    }

    /// Artifacts in the project directory, newest first
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read
    pub fn list_sessions(&self) -> Result<Vec<String>, ControllerError> {
        Ok(session::list_sessions(&self.project.root_path)?)
    }

    fn cursor(&mut self) -> Result<&mut ReplayCursor, NavigationError> {
        self.playback.as_mut().ok_or(NavigationError::NoSession)
    }

    /// # Errors
    /// `NavigationError` outside Playback or for an invalid index
    pub fn jump_frame(&mut self, index: usize) -> Result<Frame, ControllerError> {
        Ok(self.cursor()?.jump(index)?.clone())
    }

    /// # Errors
    /// `NavigationError` outside Playback or on the last frame
    pub fn next_frame(&mut self) -> Result<Frame, ControllerError> {
        Ok(self.cursor()?.next_frame()?.clone())
    }

    /// # Errors
    /// `NavigationError` outside Playback or on the first frame
    pub fn prev_frame(&mut self) -> Result<Frame, ControllerError> {
        Ok(self.cursor()?.prev_frame()?.clone())
    }

    /// Frame under the cursor, or the newest frame while recording
    pub fn current_frame(&self) -> Option<Frame> {
        if let Some(cursor) = &self.playback {
            return cursor.current().ok().cloned();
        }
        let recording = self.recording.as_ref()?;
        let session = recording.session.read().unwrap_or_else(PoisonError::into_inner);
        session.current_index().and_then(|i| session.frame(i)).cloned()
    }

    /// `frame {n}/{total} - {HH:MM:SS.mmm} - {function}()`, or [`NO_SESSION`]
    pub fn current_frame_info(&self) -> String {
        let position = if let Some(cursor) = &self.playback {
            cursor.index().zip(cursor.current().ok()).map(|(i, f)| frame_info(f, i, cursor.len()))
        } else if let Some(recording) = &self.recording {
            let session = recording.session.read().unwrap_or_else(PoisonError::into_inner);
            session
                .current_index()
                .and_then(|i| session.frame(i).map(|f| frame_info(f, i, session.len())))
        } else {
            None
        };
        position.unwrap_or_else(|| NO_SESSION.to_string())
    }

    /// Counters of the recording in progress, the loaded session or the last
    /// recording, in that order
    pub fn statistics(&self) -> SessionStatistics {
        if let Some(recording) = &self.recording {
            return recording
                .session
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .statistics()
                .clone();
        }
        if let Some(cursor) = &self.playback {
            return cursor.session().statistics().clone();
        }
        self.last_stop.as_ref().map(|s| s.statistics.clone()).unwrap_or_default()
    }
}

fn frame_info(frame: &Frame, index: usize, total: usize) -> String {
    format!(
        "frame {}/{} - {} - {}()",
        index + 1,
        total,
        frame.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f"),
        frame.function()
    )
}

fn empty_summary() -> StopSummary {
    StopSummary {
        drain: DrainSummary::default(),
        frames: 0,
        saved_to: None,
        statistics: SessionStatistics::default(),
    }
}
