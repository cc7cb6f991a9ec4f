use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, name = "qram")]
pub struct Cli {
    /// Increase verbosity level (can be specified multiple times.) The first level sets level
    /// "info", second sets level "debug", and third sets level "trace" for the logger.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to the local working copy to operate on (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enqueue a pull request at the tail of the staging queue
    Prepare {
        /// Pull request number
        pr: u64,
    },

    /// Mark a pull request good and drain the head of the queue
    Merge {
        /// Pull request number
        pr: u64,
    },

    /// Mark a pull request bad and evict it from the queue
    Bad {
        /// Pull request number
        pr: u64,
    },

    /// Create a throwaway branch with a single commit and open a pull
    /// request for it. Useful for smoke-testing a fresh deployment.
    Generate {
        /// Number used for the generated branch name (do-<N>)
        pr: u64,
    },

    /// Run the webhook server and the event dispatcher
    Serve {
        /// Log request details and verification steps
        #[arg(long)]
        debug: bool,

        /// Expose POST /stop to shut the server down remotely
        #[arg(long)]
        provide_stop: bool,

        /// Skip the initial listing and (re-)cloning of repositories
        #[arg(long)]
        skip_init: bool,
    },
}
