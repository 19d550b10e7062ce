//! CLI argument definitions

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    CaptureConfig, DEFAULT_DRAIN_TIMEOUT, DEFAULT_POLL_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_RING_SIZE,
};
use crate::domain::Pid;

#[derive(Parser)]
#[command(
    name = "kdebug",
    version,
    about = "Record kernel function calls and replay them frame by frame",
    after_help = "\
EXAMPLES:
    kdebug break add --project . fs/open.c 1200 --function do_sys_openat2
    sudo kdebug record --project . --duration 10     Record for ten seconds
    kdebug record --project . --synthetic 50         Demo without kprobes
    kdebug replay debug_session_20240101_120000.frames --jump 3"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Install probes on the enabled breakpoints and record frames
    Record(RecordArgs),

    /// Load a session artifact and print its frames
    Replay(ReplayArgs),

    /// List session artifacts, newest first
    Sessions {
        /// Directory holding the artifacts
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
    },

    /// Manage the project's breakpoints
    Break {
        /// Project directory holding `.debug_breakpoints.json`
        #[arg(short, long, default_value = ".", global = true)]
        project: PathBuf,

        #[command(subcommand)]
        action: BreakAction,
    },
}

#[derive(ClapArgs)]
pub struct RecordArgs {
    /// Project directory (breakpoints are read from it, sessions saved to it)
    #[arg(short, long, default_value = ".")]
    pub project: PathBuf,

    /// Only record calls made by this process (0 = every process)
    #[arg(long, default_value = "0")]
    pub pid: u32,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Session name (default: session_<timestamp>)
    #[arg(long)]
    pub name: Option<String>,

    /// Also record function returns
    #[arg(long)]
    pub exit_probes: bool,

    /// Drop events whose breakpoint id is not on the installed allow-list
    #[arg(long)]
    pub allow_list: bool,

    /// Ring buffer size in bytes (power of two)
    #[arg(long, default_value_t = DEFAULT_RING_SIZE)]
    pub ring_size: usize,

    /// Capacity of the reader to processor queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue: usize,

    /// Ring buffer poll timeout in milliseconds
    #[arg(long, default_value_t = millis(DEFAULT_POLL_TIMEOUT))]
    pub poll_ms: u64,

    /// How long to keep draining after stop, in milliseconds
    #[arg(long, default_value_t = millis(DEFAULT_DRAIN_TIMEOUT))]
    pub drain_ms: u64,

    /// Generate N events from a userspace probe instead of kprobes
    #[arg(long, value_name = "N")]
    pub synthetic: Option<usize>,
}

impl RecordArgs {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            ring_size: self.ring_size,
            queue_capacity: self.queue,
            poll_timeout: Duration::from_millis(self.poll_ms),
            drain_timeout: Duration::from_millis(self.drain_ms),
            target_pid: Pid(self.pid),
            exit_probes: self.exit_probes,
            use_allow_list: self.allow_list,
            ..CaptureConfig::default()
        }
    }

    /// `None` records until interrupted
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}

#[derive(ClapArgs)]
pub struct ReplayArgs {
    /// Session artifact (`.frames`)
    pub file: PathBuf,

    /// Reject artifacts with unknown top-level fields
    #[arg(long)]
    pub strict: bool,

    /// Print only the frame at this zero-based index
    #[arg(long, value_name = "N")]
    pub jump: Option<usize>,
}

#[derive(Subcommand)]
pub enum BreakAction {
    /// Add a breakpoint, or toggle it if one exists at FILE:LINE
    Add {
        file: String,
        line: u32,
        /// Kernel function to probe (inferred from the source if omitted)
        #[arg(short, long)]
        function: Option<String>,
    },
    /// Remove the breakpoint at FILE:LINE
    Remove { file: String, line: u32 },
    /// Flip the enabled flag of the breakpoint at FILE:LINE
    Toggle { file: String, line: u32 },
    /// Print every breakpoint
    List,
    /// Remove every breakpoint
    Clear,
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
