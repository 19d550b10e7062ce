//! # kdebug - kprobe-based Record/Replay Debugger for Kernel Functions
//!
//! kdebug installs kprobes on the kernel functions named by a project's
//! breakpoints, records every invocation as a frame (registers, arguments,
//! stack snapshot) and lets you step back and forth through the recording
//! after the fact.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Probed kernel functions                      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ kprobe / kretprobe
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   eBPF Program (Kernel)                         │
//! │  • CONTROL filter: enable flag, target pid, allow-list          │
//! │  • FUNCTIONS: func ip → (breakpoint id, name)                   │
//! │  • COUNTERS: fired / filtered / dropped (per CPU)               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer (drop on full)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   kdebug (This Crate)                           │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Collector   │──▶│    Frame     │──▶│   Session    │         │
//! │  │ (reader task)│   │  Processor   │   │    Store     │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │   bounded queue       state + bp watch        │ .frames         │
//! │                                               ▼                 │
//! │                 ┌──────────────────────────────────────┐        │
//! │                 │  Controller (Idle/Recording/Playback)│        │
//! │                 └──────────────────────────────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`capture`]: probe backends, ring channel, event decoding and the
//!   collector's reader task with its drop accounting
//!   - `kernel` / `ebpf_setup`: load the probe object, fill its maps, attach kprobes
//!   - `synthetic`: the same filter and ring in userspace, for tests and demos
//! - [`frames`]: event → frame normalisation, frame analysis and diffing
//! - [`session`]: append-only frame log, `.frames` artifacts, replay cursor
//! - [`controller`]: the state machine tying it together, plus an actor handle
//! - [`breakpoints`]: the per-project breakpoint set
//! - [`symbols`]: `/proc/kallsyms` lookups
//! - [`config`], [`cli`], [`preflight`], [`domain`]
//!
//! ## Back-pressure
//!
//! Nothing in the pipeline blocks on a slower consumer. The ring drops when
//! full (kernel `DROPPED` counter), the reader drops the newest event when the
//! processor queue is full, and events still buffered past the drain deadline
//! are dropped at stop. Every drop is counted, so that at the end of a recording
//!
//! ```text
//! fired = delivered + dropped + decode_errors
//! ```
//!
//! ## Typical Usage
//!
//! ```bash
//! kdebug break add --project . fs/open.c 1200 --function do_sys_openat2
//! sudo kdebug record --project . --duration 10
//! kdebug replay debug_session_20240101_120000.frames
//! ```

pub mod breakpoints;
pub mod capture;
pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod frames;
pub mod preflight;
pub mod session;
pub mod symbols;
