use std::path::PathBuf;

use clap::{Parser, Subcommand};

//
// For parsing user specified command.
//
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the workloads that can be submitted.
    Workloads,
    /// Run a job to completion on this machine.
    Submit {
        /// Glob pattern for the input files
        #[arg(short, long)]
        input: String,

        // Name of the workload
        #[arg(short, long)]
        workload: String,

        /// Output file, one `key value` line per result pair
        #[arg(short, long)]
        output: PathBuf,

        /// Number of map tasks (M)
        #[arg(short, long, default_value_t = 9)]
        map_tasks: usize,

        /// Number of reduce tasks (R)
        #[arg(short, long, default_value_t = 3)]
        reduce_tasks: usize,

        /// Directory for intermediate stores. A temporary directory is
        /// used (and removed afterwards) when omitted.
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Give up on a single map or reduce call after this many seconds
        #[arg(short, long)]
        timeout_secs: Option<u64>,
    },
}

/// Parse the user command, either `workloads` or `submit`.
pub fn parse_args() -> Commands {
    Args::parse().command
}
