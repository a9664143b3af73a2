//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`,
//! `--memory-store`) and one [`Command`] per operation.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Retrieve carrier billing invoices and archive them to object storage.
#[derive(Debug, Parser)]
#[command(name = "billfetch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file. Environment variables override it.
    #[arg(long, short, global = true, env = "BILLFETCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Track job status in process memory instead of Redis.
    #[arg(long, global = true, default_value_t = false)]
    pub memory_store: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one invoice retrieval job and wait for it to finish.
    Run {
        /// Portal account name.
        #[arg(long, short)]
        username: String,

        /// Portal password.
        #[arg(long, env = "BILLFETCH_PASSWORD", hide_env_values = true)]
        password: String,

        /// Carrier whose portal to use.
        #[arg(long, default_value = "UPS")]
        carrier: String,
    },

    /// Show the recorded status of a job.
    Status {
        job_id: String,
    },

    /// Remove the recorded status of a job.
    Forget {
        job_id: String,
    },

    /// Upload every file in a directory under today's date prefix.
    Upload {
        dir: PathBuf,
    },
}
