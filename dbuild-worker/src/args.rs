use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The address of the coordinator server
    #[arg(short = 'j', long = "join", default_value = "http://[::1]:8030")]
    pub address: String,

    /// The port to serve artifacts on.
    #[arg(short, long)]
    pub port: u16,

    /// Host peers use to reach this worker. Together with the port it
    /// forms the worker id.
    #[arg(long, default_value = "[::1]")]
    pub host: String,

    /// Number of jobs to run in parallel.
    #[arg(short, long, default_value = "4")]
    pub slots: usize,

    /// Directory for cached source files and artifacts.
    /// Defaults to /tmp/dbuild/worker-<port>.
    #[arg(short, long)]
    pub cache_dir: Option<PathBuf>,

    /// Milliseconds between heartbeats while every slot is busy.
    #[arg(long, default_value = "100")]
    pub heartbeat_interval_ms: u64,

    /// Milliseconds to wait before retrying a failed heartbeat.
    #[arg(long, default_value = "500")]
    pub retry_interval_ms: u64,
}

impl Args {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/dbuild/worker-{}", self.port)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
