//! # kdebug - Main Entry Point
//!
//! - **record**: install kprobes on the enabled breakpoints, record until
//!   Ctrl+C / SIGTERM / `--duration`, autosave the session
//! - **replay**: load a `.frames` artifact and step through it
//! - **sessions**, **break**: manage artifacts and breakpoints of a project

#![allow(clippy::cast_precision_loss)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use kdebug::breakpoints::{AddOutcome, BreakpointSet};
use kdebug::capture::{
    print_drain_diagnostics, KernelBackend, ProbeBackend, SyntheticBackend, SyntheticProbe,
};
use kdebug::cli::{Args, BreakAction, Command, RecordArgs, ReplayArgs};
use kdebug::config::CaptureConfig;
use kdebug::controller::{Controller, StopSummary};
use kdebug::domain::{ControllerError, NavigationError};
use kdebug::frames::{analyze_frame, diff_frames, ClockAnchor};
use kdebug::preflight::run_preflight_checks;
use kdebug::session::{self, ProjectInfo, SystemEnvironment};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// How often the record loop checks that the pipeline is still alive
const HEALTH_INTERVAL: Duration = Duration::from_millis(250);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Record(record_args) => record(record_args).await,
        Command::Replay(replay_args) => replay(&replay_args),
        Command::Sessions { project } => {
            for name in session::list_sessions(&project)? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Break { project, action } => manage_breakpoints(&project, action),
    }
}

async fn record(args: RecordArgs) -> Result<()> {
    let config = args.capture_config();
    config.validate()?;

    let root = std::fs::canonicalize(&args.project)
        .with_context(|| format!("Failed to resolve project path: {}", args.project.display()))?;
    let breakpoints = BreakpointSet::load(&root).context("Failed to load breakpoints")?;
    let project = ProjectInfo::from_root(&root);

    println!("kdebug v{}", env!("CARGO_PKG_VERSION"));
    println!("project: {}", root.display());
    if !config.target_pid.is_all() {
        println!("pid: {}", config.target_pid.0);
    }

    if let Some(count) = args.synthetic {
        println!("backend: synthetic ({count} events)");
        let backend = SyntheticBackend::new();
        let probe = backend.probe();
        let controller = Controller::new(backend, config, project, breakpoints);
        return record_with(controller, &args, Some((probe, count))).await;
    }

    // ── Pre-flight: root, kernel version, kallsyms ──────────────────────
    let symbols = Arc::new(run_preflight_checks(&root, config.exit_probes)?);
    info!("✓ Loaded {} kernel symbols", symbols.len());
    let backend = KernelBackend::new(Arc::clone(&symbols));
    let controller = Controller::new(backend, config, project, breakpoints).with_symbols(symbols);
    record_with(controller, &args, None).await
}

async fn record_with<B: ProbeBackend>(
    mut controller: Controller<B>,
    args: &RecordArgs,
    synthetic: Option<(Arc<SyntheticProbe>, usize)>,
) -> Result<()> {
    controller.start_recording(args.name.as_deref())?;
    let started = Instant::now();
    println!("breakpoints: {}", controller.list_breakpoints().iter().filter(|b| b.enabled).count());

    let (reason, early) = match synthetic {
        Some((probe, count)) if args.duration_limit().is_none() => {
            let accepted = probe.generate(count, ClockAnchor::now().monotonic_ns);
            info!("Generated {count} synthetic events, {accepted} accepted by the ring");
            // Give the reader a poll cycle before the stop drain
            tokio::time::sleep(Duration::from_millis(args.poll_ms)).await;
            ("synthetic events generated", None)
        }
        Some((probe, count)) => {
            probe.generate(count, ClockAnchor::now().monotonic_ns);
            wait_for_stop(&mut controller, args.duration_limit()).await?
        }
        None => wait_for_stop(&mut controller, args.duration_limit()).await?,
    };

    let summary = match early {
        Some(summary) => summary,
        None => controller.stop_recording().await?,
    };
    print_summary(reason, started.elapsed(), &summary);

    if let Some(stop_reason) = &summary.statistics.stop_reason {
        bail!("recording aborted: {stop_reason}");
    }
    Ok(())
}

/// Block until the recording should end
///
/// Returns why, plus the summary when the pipeline ended on its own.
async fn wait_for_stop<B: ProbeBackend>(
    controller: &mut Controller<B>,
    limit: Option<Duration>,
) -> Result<(&'static str, Option<StopSummary>)> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => return Ok(("interrupted", None)),
            _ = sigterm.recv() => return Ok(("terminated", None)),
            () = &mut deadline => return Ok(("duration limit reached", None)),
            _ = health.tick() => {
                if let Some(summary) = controller.check_health().await {
                    warn!("Capture pipeline stopped before the recording ended");
                    return Ok(("pipeline stopped", Some(summary)));
                }
            }
        }
    }
}

fn print_summary(reason: &str, elapsed: Duration, summary: &StopSummary) {
    let stats = &summary.statistics;
    eprintln!(
        "\n{}: {:.1}s, {} frames (fired: {}, filtered: {}, dropped: {}, decode errors: {})",
        reason,
        elapsed.as_secs_f64(),
        summary.frames,
        stats.events_fired,
        stats.events_filtered,
        stats.events_dropped,
        stats.decode_errors,
    );
    for (id, hits) in &stats.breakpoint_hits {
        eprintln!("   breakpoint {id}: {hits} hits");
    }
    if stats.binary_names > 0 {
        eprintln!("warning: {} events carried non-UTF-8 names", stats.binary_names);
    }
    print_drain_diagnostics(&summary.drain);
    if let Some(path) = &summary.saved_to {
        println!("saved: {}", path.display());
    }
}

fn replay(args: &ReplayArgs) -> Result<()> {
    let root = args
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let config = CaptureConfig { strict_load: args.strict, ..CaptureConfig::default() };
    let mut controller = Controller::new(
        SyntheticBackend::new(),
        config,
        ProjectInfo::from_root(&root),
        BreakpointSet::new(),
    );
    controller.load_session(&args.file)?;
    if let Some(loaded) = controller.loaded_session() {
        print_environment(loaded.environment());
    }

    if let Some(index) = args.jump {
        let frame = controller.jump_frame(index)?;
        println!("{}", controller.current_frame_info());
        for (key, value) in analyze_frame(&frame) {
            println!("   {key}: {value}");
        }
        if let Some(previous) = index.checked_sub(1) {
            let previous = controller.jump_frame(previous)?;
            println!("since frame {}:", previous.id.0);
            for (key, value) in diff_frames(&previous, &frame) {
                println!("   {key}: {value}");
            }
        }
        return Ok(());
    }

    if controller.current_frame().is_none() {
        println!("{}", controller.current_frame_info());
        return Ok(());
    }
    loop {
        println!("{}", controller.current_frame_info());
        match controller.next_frame() {
            Ok(_) => {}
            Err(ControllerError::Navigation(NavigationError::AtBoundary)) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn print_environment(recorded: &SystemEnvironment) {
    if recorded.kernel_release.is_empty() {
        return;
    }
    println!(
        "recorded on {} (Linux {}, {})",
        recorded.hostname, recorded.kernel_release, recorded.machine
    );
    if !recorded.same_kernel(&SystemEnvironment::current()) {
        eprintln!("warning: recorded on another kernel, addresses may not match this machine");
    }
}

fn manage_breakpoints(project: &Path, action: BreakAction) -> Result<()> {
    let mut set = BreakpointSet::load(project).context("Failed to load breakpoints")?;

    match action {
        BreakAction::Add { file, line, function } => {
            match set.add(&file, line, function.as_deref()) {
                AddOutcome::Added(bp) => {
                    println!("added {} {}:{} {}", bp.id, bp.file, bp.line, bp.function);
                }
                AddOutcome::Toggled(bp) => {
                    println!("{} {}:{} now {}", bp.id, bp.file, bp.line, enabled_label(bp.enabled));
                }
            }
        }
        BreakAction::Remove { file, line } => {
            let bp = set.remove(&file, line)?;
            println!("removed {} {}:{}", bp.id, bp.file, bp.line);
        }
        BreakAction::Toggle { file, line } => {
            let enabled = set.toggle(&file, line)?;
            println!("{file}:{line} now {}", enabled_label(enabled));
        }
        BreakAction::List => {
            for bp in set.list() {
                println!(
                    "{:<6} {:<9} {}:{} {}",
                    bp.id.to_string(),
                    enabled_label(bp.enabled),
                    bp.file,
                    bp.line,
                    bp.function
                );
            }
            return Ok(());
        }
        BreakAction::Clear => {
            set.clear();
            println!("cleared");
        }
    }

    set.save(project).context("Failed to save breakpoints")
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
