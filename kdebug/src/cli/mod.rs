//! Command-line interface

mod args;

pub use args::{Args, BreakAction, Command, RecordArgs, ReplayArgs};
