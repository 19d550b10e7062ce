//! Pre-flight checks for kdebug
//!
//! Validates system requirements before attempting to load the probe program.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::symbols::{KernelSymbols, KALLSYMS_PATH};

/// Minimum kernel version for `bpf_get_func_ip` in kprobe programs
const MIN_KERNEL_VERSION: (u32, u32) = (5, 15);

/// Minimum kernel version where `bpf_get_func_ip` reports the probed
/// function from a kretprobe
const MIN_EXIT_PROBE_KERNEL_VERSION: (u32, u32) = (6, 3);

/// Run all pre-flight checks before probe loading
///
/// Returns the parsed kallsyms so the caller does not read them twice.
pub fn run_preflight_checks(project: &Path, exit_probes: bool) -> Result<KernelSymbols> {
    check_privileges()?;
    check_kernel_version(exit_probes)?;
    check_project_dir(project)?;
    check_kallsyms()
}

/// Check if running with sufficient privileges for kprobes
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do, but kallsyms addresses still need root
    bail!(
        "Permission denied: kdebug requires root privileges to install kprobes.\n\n\
         Run with: sudo kdebug record ...\n\
         Or try the pipeline without probes: kdebug record --synthetic 100"
    );
}

/// Check if the kernel can load the probe programs
fn check_kernel_version(exit_probes: bool) -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    check_release(release, exit_probes)
}

fn check_release(release: &str, exit_probes: bool) -> Result<()> {
    let Some(version) = parse_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             kdebug requires Linux {}.{} or newer (bpf_get_func_ip in kprobes).\n\
             Current kernel: {}",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    if exit_probes && version < MIN_EXIT_PROBE_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} cannot identify functions in return probes.\n\n\
             --exit-probes requires Linux {}.{} or newer.\n\
             Record without --exit-probes to capture function entries only.",
            version.0,
            version.1,
            MIN_EXIT_PROBE_KERNEL_VERSION.0,
            MIN_EXIT_PROBE_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// `"6.1.0-arch1-1"` → `(6, 1)`
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check that the project directory exists, sessions are autosaved there
fn check_project_dir(project: &Path) -> Result<()> {
    if !project.is_dir() {
        bail!(
            "Project directory not found: {}\n\n\
             --project must point to an existing directory.",
            project.display()
        );
    }
    Ok(())
}

/// Read kallsyms and make sure the addresses are not hidden
fn check_kallsyms() -> Result<KernelSymbols> {
    let symbols = KernelSymbols::load().with_context(|| {
        format!(
            "Cannot read {KALLSYMS_PATH}\n\n\
             This usually means:\n\
             - /proc is not mounted\n\
             - Permission denied (run with sudo)"
        )
    })?;
    check_symbols_visible(&symbols)?;
    Ok(symbols)
}

fn check_symbols_visible(symbols: &KernelSymbols) -> Result<()> {
    if symbols.is_empty() {
        bail!("{KALLSYMS_PATH} is empty; the kernel was built without CONFIG_KALLSYMS");
    }
    if !symbols.addresses_visible() {
        bail!(
            "Kernel symbol addresses are hidden.\n\n\
             Check: cat /proc/sys/kernel/kptr_restrict\n\
             Run as root, or lower it with: sysctl kernel.kptr_restrict=1"
        );
    }
    Ok(())
}
