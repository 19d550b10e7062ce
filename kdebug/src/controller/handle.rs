//! Actor front-end for the controller
//!
//! The controller runs on its own task and is driven through a bounded
//! command channel; every command carries a oneshot for its reply. A periodic
//! tick lets the actor notice a recording whose pipeline died on its own.

use log::{debug, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{Controller, StopSummary};
use crate::breakpoints::{AddOutcome, Breakpoint};
use crate::capture::ProbeBackend;
use crate::domain::{ControllerError, ControllerState};
use crate::frames::Frame;
use crate::session::SessionStatistics;

const COMMAND_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum Command {
    AddBreakpoint {
        file: String,
        line: u32,
        function: Option<String>,
        reply: oneshot::Sender<AddOutcome>,
    },
    RemoveBreakpoint { file: String, line: u32, reply: Reply<Breakpoint> },
    ToggleBreakpoint { file: String, line: u32, reply: Reply<bool> },
    ListBreakpoints { reply: oneshot::Sender<Vec<Breakpoint>> },
    ClearBreakpoints { reply: oneshot::Sender<()> },
    StartRecording { name: Option<String>, reply: Reply<()> },
    StopRecording { reply: Reply<StopSummary> },
    LoadSession { path: PathBuf, reply: Reply<()> },
    SaveSession { path: PathBuf, reply: Reply<()> },
    CloseSession { reply: oneshot::Sender<()> },
    ListSessions { reply: Reply<Vec<String>> },
    JumpFrame { index: usize, reply: Reply<Frame> },
    NextFrame { reply: Reply<Frame> },
    PrevFrame { reply: Reply<Frame> },
    CurrentFrameInfo { reply: oneshot::Sender<String> },
    Statistics { reply: oneshot::Sender<SessionStatistics> },
    State { reply: oneshot::Sender<ControllerState> },
    Shutdown,
}

/// Cloneable handle to a controller running on its own task
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    /// Move `controller` onto a task and return a handle to it
    ///
    /// The task ends after [`ControllerHandle::shutdown`] or once every handle
    /// is dropped; a recording still running at that point is stopped.
    pub fn spawn<B: ProbeBackend>(
        controller: Controller<B>,
        health_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(run_actor(controller, rx, health_interval));
        (Self { tx }, task)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    async fn call_fallible<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControllerError> {
        self.call(make).await?
    }

    pub async fn add_breakpoint(
        &self,
        file: &str,
        line: u32,
        function: Option<&str>,
    ) -> Result<AddOutcome, ControllerError> {
        let (file, function) = (file.to_string(), function.map(str::to_string));
        self.call(|reply| Command::AddBreakpoint { file, line, function, reply }).await
    }

    pub async fn remove_breakpoint(
        &self,
        file: &str,
        line: u32,
    ) -> Result<Breakpoint, ControllerError> {
        let file = file.to_string();
        self.call_fallible(|reply| Command::RemoveBreakpoint { file, line, reply }).await
    }

    pub async fn toggle_breakpoint(&self, file: &str, line: u32) -> Result<bool, ControllerError> {
        let file = file.to_string();
        self.call_fallible(|reply| Command::ToggleBreakpoint { file, line, reply }).await
    }

    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>, ControllerError> {
        self.call(|reply| Command::ListBreakpoints { reply }).await
    }

    pub async fn clear_breakpoints(&self) -> Result<(), ControllerError> {
        self.call(|reply| Command::ClearBreakpoints { reply }).await
    }

    pub async fn start_recording(&self, name: Option<&str>) -> Result<(), ControllerError> {
        let name = name.map(str::to_string);
        self.call_fallible(|reply| Command::StartRecording { name, reply }).await
    }

    pub async fn stop_recording(&self) -> Result<StopSummary, ControllerError> {
        self.call_fallible(|reply| Command::StopRecording { reply }).await
    }

    pub async fn load_session(&self, path: impl Into<PathBuf>) -> Result<(), ControllerError> {
        let path = path.into();
        self.call_fallible(|reply| Command::LoadSession { path, reply }).await
    }

    pub async fn save_session(&self, path: impl Into<PathBuf>) -> Result<(), ControllerError> {
        let path = path.into();
        self.call_fallible(|reply| Command::SaveSession { path, reply }).await
    }

    pub async fn close_session(&self) -> Result<(), ControllerError> {
        self.call(|reply| Command::CloseSession { reply }).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, ControllerError> {
        self.call_fallible(|reply| Command::ListSessions { reply }).await
    }

    pub async fn jump_frame(&self, index: usize) -> Result<Frame, ControllerError> {
        self.call_fallible(|reply| Command::JumpFrame { index, reply }).await
    }

    pub async fn next_frame(&self) -> Result<Frame, ControllerError> {
        self.call_fallible(|reply| Command::NextFrame { reply }).await
    }

    pub async fn prev_frame(&self) -> Result<Frame, ControllerError> {
        self.call_fallible(|reply| Command::PrevFrame { reply }).await
    }

    pub async fn current_frame_info(&self) -> Result<String, ControllerError> {
        self.call(|reply| Command::CurrentFrameInfo { reply }).await
    }

    pub async fn statistics(&self) -> Result<SessionStatistics, ControllerError> {
        self.call(|reply| Command::Statistics { reply }).await
    }

    pub async fn state(&self) -> Result<ControllerState, ControllerError> {
        self.call(|reply| Command::State { reply }).await
    }

    /// Ask the actor to stop; in-flight commands are answered first
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

async fn run_actor<B: ProbeBackend>(
    mut controller: Controller<B>,
    mut rx: mpsc::Receiver<Command>,
    health_interval: Duration,
) {
    let mut health = tokio::time::interval(health_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                if matches!(command, Command::Shutdown) {
                    break;
                }
                dispatch(&mut controller, command).await;
            }
            _ = health.tick() => {
                if let Some(summary) = controller.check_health().await {
                    warn!(
                        "Recording stopped on its own: {}",
                        summary.drain.stop_reason.as_deref().unwrap_or("pipeline ended")
                    );
                }
            }
        }
    }

    if controller.state() == ControllerState::Recording {
        if let Err(e) = controller.stop_recording().await {
            warn!("Failed to stop recording on shutdown: {e}");
        }
    }
    debug!("Controller task exiting");
}

// A dropped reply receiver only means the caller gave up waiting
async fn dispatch<B: ProbeBackend>(controller: &mut Controller<B>, command: Command) {
    match command {
        Command::AddBreakpoint { file, line, function, reply } => {
            let _ = reply.send(controller.add_breakpoint(&file, line, function.as_deref()));
        }
        Command::RemoveBreakpoint { file, line, reply } => {
            let _ = reply.send(controller.remove_breakpoint(&file, line));
        }
        Command::ToggleBreakpoint { file, line, reply } => {
            let _ = reply.send(controller.toggle_breakpoint(&file, line));
        }
        Command::ListBreakpoints { reply } => {
            let _ = reply.send(controller.list_breakpoints());
        }
        Command::ClearBreakpoints { reply } => {
            controller.clear_breakpoints();
            let _ = reply.send(());
        }
        Command::StartRecording { name, reply } => {
            let _ = reply.send(controller.start_recording(name.as_deref()));
        }
        Command::StopRecording { reply } => {
            let _ = reply.send(controller.stop_recording().await);
        }
        Command::LoadSession { path, reply } => {
            let _ = reply.send(controller.load_session(&path));
        }
        Command::SaveSession { path, reply } => {
            let _ = reply.send(controller.save_session(&path));
        }
        Command::CloseSession { reply } => {
            controller.close_session();
            let _ = reply.send(());
        }
        Command::ListSessions { reply } => {
            let _ = reply.send(controller.list_sessions());
        }
        Command::JumpFrame { index, reply } => {
            let _ = reply.send(controller.jump_frame(index));
        }
        Command::NextFrame { reply } => {
            let _ = reply.send(controller.next_frame());
        }
        Command::PrevFrame { reply } => {
            let _ = reply.send(controller.prev_frame());
        }
        Command::CurrentFrameInfo { reply } => {
            let _ = reply.send(controller.current_frame_info());
        }
        Command::Statistics { reply } => {
            let _ = reply.send(controller.statistics());
        }
        Command::State { reply } => {
            let _ = reply.send(controller.state());
        }
        Command::Shutdown => {}
    }
}
