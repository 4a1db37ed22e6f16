//! Command-line interface for fieldproof.
//!
//! This module provides the CLI structure for the `fieldproof` binary, which
//! inspects and drains the offline artifact queue.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, QueueCommand, StatusCommand, VerifyCommand};

/// fieldproof - Sealed field captures, kept safe until uploaded
///
/// Lists, verifies and uploads the tamper-evident recordings held in the
/// local offline queue.
#[derive(Debug, Parser)]
#[command(name = "fieldproof")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or drain the offline queue
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Show queue and storage status
    Status(StatusCommand),

    /// Recompute an artifact's digests and compare them to its seal
    Verify(VerifyCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
