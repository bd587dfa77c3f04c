use std::path::PathBuf;

use clap::{command, Parser, Subcommand};

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
    /// Run a build and stream its progress.
    Build {
        /// The address of the coordinator server
        #[arg(short, long, default_value = "http://[::1]:8030")]
        address: String,

        /// JSON file describing the build graph.
        #[arg(short, long)]
        graph: PathBuf,

        /// Directory the graph's source file paths are relative to.
        #[arg(short, long, default_value = ".")]
        sources: PathBuf,
    },
    /// Print the content id of a file.
    Hash {
        file: PathBuf,
    },
}

/// Parse the user command.
/// Can be 1 of 2:
/// - build
/// - hash
pub fn parse_args() -> Commands {
    Args::parse().command
}
