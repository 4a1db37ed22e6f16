//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Offline queue commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List queued artifacts, newest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Only show artifacts for this organization
        #[arg(short, long)]
        org: Option<String>,
    },

    /// Upload queued artifacts
    Upload {
        /// Upload a single artifact by ID
        #[arg(conflicts_with = "all", required_unless_present = "all")]
        id: Option<String>,

        /// Upload every artifact that is not yet uploaded
        #[arg(short, long)]
        all: bool,
    },

    /// Permanently delete an artifact, whatever its upload state
    Remove {
        /// Artifact ID
        id: String,

        /// Confirm deletion
        #[arg(short, long)]
        yes: bool,
    },
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Verify command arguments.
#[derive(Debug, Args)]
pub struct VerifyCommand {
    /// Artifact ID
    pub id: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
