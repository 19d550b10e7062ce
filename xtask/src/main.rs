use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::Command;

/// Package holding the kprobe program
const EBPF_PACKAGE: &str = "kdebug-ebpf";
/// Binary name of the probe object; `kdebug` embeds it from this path
const EBPF_OBJECT: &str = "kdebug";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Cross-compile the kprobe program
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Target architecture whose register layout the probe reads
        #[arg(long)]
        arch: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, arch } => build_ebpf(&target, arch.as_deref())?,
    }

    Ok(())
}

fn build_ebpf(target: &str, arch: Option<&str>) -> Result<()> {
    // Debug builds pull in formatting code the BPF linker rejects; release
    // uses LTO to strip it.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg(EBPF_PACKAGE)
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release");
    if let Some(arch) = arch {
        cmd.env("CARGO_CFG_BPF_TARGET_ARCH", arch);
    }

    let status = cmd.status().context("Failed to build kprobe program")?;
    if !status.success() {
        anyhow::bail!("Failed to build kprobe program");
    }

    let object = Path::new("target").join(target).join("release").join(EBPF_OBJECT);
    if !object.exists() {
        anyhow::bail!("Build succeeded but {} is missing", object.display());
    }

    println!("✓ kprobe program built successfully");
    println!("  Object: {}", object.display());
    println!("  Arch: {}", arch.unwrap_or(std::env::consts::ARCH));

    Ok(())
}
