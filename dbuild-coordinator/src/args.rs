use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use dbuild_coordinator::scheduler;
use dbuild_coordinator::Options;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The port for the server to run on.
    #[arg(short, long, default_value = "8030")]
    pub port: u16,

    /// Directory of the source file cache.
    #[arg(short, long, default_value = "/tmp/dbuild/coordinator")]
    pub file_cache_dir: PathBuf,

    /// Milliseconds a job waits for a worker holding its cached result.
    #[arg(long, default_value = "10")]
    pub cache_timeout_ms: u64,

    /// Milliseconds a job waits for a worker near its dependencies.
    #[arg(long, default_value = "100")]
    pub deps_timeout_ms: u64,

    /// Milliseconds a heartbeat waits for work before returning empty.
    #[arg(long, default_value = "1000")]
    pub pick_timeout_ms: u64,

    /// Milliseconds a heartbeat from a worker with running jobs waits for
    /// work.
    #[arg(long, default_value = "20")]
    pub busy_pick_timeout_ms: u64,

    /// Capacity of each worker's preference queues.
    #[arg(long, default_value = "1024")]
    pub max_offers_per_worker: usize,
}

impl Args {
    pub fn options(&self) -> Options {
        Options {
            scheduler: scheduler::Config {
                cache_timeout: Duration::from_millis(self.cache_timeout_ms),
                deps_timeout: Duration::from_millis(self.deps_timeout_ms),
                max_offers_per_worker: self.max_offers_per_worker,
            },
            pick_timeout: Duration::from_millis(self.pick_timeout_ms),
            busy_pick_timeout: Duration::from_millis(self.busy_pick_timeout_ms),
        }
    }
}
