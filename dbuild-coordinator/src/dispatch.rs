//! The coordinator context: drives builds through the scheduler, serves
//! worker heartbeats and owns the coordinator's source file cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::cache::{Cache, CacheError, Lease};
use common::{BuildGraph, Id, IdHasher, Job, JobResult, JobSpec, WorkerId};

use crate::artifacts::ArtifactLocations;
use crate::error::CoordinatorError;
use crate::scheduler::{self, Scheduler};

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct Options {
    pub scheduler: scheduler::Config,

    /// How long a heartbeat from an idle worker waits for a first job.
    pub pick_timeout: Duration,

    /// The same wait for a worker that still runs jobs. Kept short so the
    /// worker can report finished jobs soon after they finish.
    pub busy_pick_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scheduler: scheduler::Config::default(),
            pick_timeout: Duration::from_secs(1),
            busy_pick_timeout: Duration::from_millis(20),
        }
    }
}

/// Progress of a build, as streamed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Started { build_id: Id, missing_files: Vec<Id> },
    JobFinished(JobResult),
    Failed(String),
    Finished,
}

/// A worker's periodic report.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub worker: WorkerId,
    pub running_jobs: Vec<Id>,
    pub free_slots: usize,
    pub finished_jobs: Vec<JobResult>,
    pub added_artifacts: Vec<Id>,
}

#[derive(Debug)]
pub struct Coordinator {
    scheduler: Scheduler,
    artifacts: ArtifactLocations,

    /// Running builds, with the latch released by the upload-done signal.
    builds: DashMap<Id, CancellationToken>,

    files: Cache,

    /// Serializes concurrent uploads of the same file.
    uploads: DashMap<Id, Arc<Mutex<()>>>,

    pick_timeout: Duration,
    busy_pick_timeout: Duration,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(files: Cache, options: Options) -> Self {
        Self {
            scheduler: Scheduler::new(options.scheduler),
            artifacts: ArtifactLocations::new(),
            builds: DashMap::new(),
            files,
            uploads: DashMap::new(),
            pick_timeout: options.pick_timeout,
            busy_pick_timeout: options.busy_pick_timeout.min(options.pick_timeout),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn artifacts(&self) -> &ArtifactLocations {
        &self.artifacts
    }

    pub fn files(&self) -> &Cache {
        &self.files
    }

    /// Validate `graph` and start running it in the background.
    ///
    /// An invalid graph is rejected before anything is registered. The
    /// returned channel yields `Started` first, then one `JobFinished` per
    /// completed job in completion order, then a single `Finished` or
    /// `Failed`. Dropping the receiver abandons the build.
    pub fn start_build(
        self: &Arc<Self>,
        graph: BuildGraph,
    ) -> Result<mpsc::Receiver<BuildEvent>, CoordinatorError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShuttingDown);
        }
        graph.topological_order()?;

        let build_id = Id::random();
        let upload_done = CancellationToken::new();
        self.builds.insert(build_id, upload_done.clone());
        info!(build = %build_id, jobs = graph.jobs.len(), files = graph.source_files.len(), "starting build");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let coordinator = self.clone();
        tokio::spawn(async move {
            if coordinator
                .run_build(build_id, &graph, upload_done, &tx)
                .await
                .is_err()
            {
                debug!(build = %build_id, "client went away, abandoning build");
            }
            coordinator.builds.remove(&build_id);
        });

        Ok(rx)
    }

    async fn run_build(
        &self,
        build_id: Id,
        graph: &BuildGraph,
        upload_done: CancellationToken,
        tx: &mpsc::Sender<BuildEvent>,
    ) -> Result<(), SendError<BuildEvent>> {
        let missing_files = self.missing_files(graph);
        let waiting_for_uploads = !missing_files.is_empty();
        tx.send(BuildEvent::Started {
            build_id,
            missing_files,
        })
        .await?;

        if waiting_for_uploads {
            debug!(build = %build_id, "waiting for uploads");
            tokio::select! {
                _ = upload_done.cancelled() => {}
                _ = tx.closed() => return Ok(()),
                _ = self.shutdown.cancelled() => {
                    return tx.send(BuildEvent::Failed(CoordinatorError::ShuttingDown.to_string())).await;
                }
            }

            let missing_files = self.missing_files(graph);
            if let Some(file) = missing_files.first() {
                warn!(build = %build_id, missing = missing_files.len(), "upload incomplete");
                let error = format!(
                    "{} source files still missing after upload, including {}",
                    missing_files.len(),
                    file
                );
                return tx.send(BuildEvent::Failed(error)).await;
            }
        }

        self.execute(build_id, graph, tx).await
    }

    async fn execute(
        &self,
        build_id: Id,
        graph: &BuildGraph,
        tx: &mpsc::Sender<BuildEvent>,
    ) -> Result<(), SendError<BuildEvent>> {
        let jobs: HashMap<Id, &Job> = graph.jobs.iter().map(|job| (job.id, job)).collect();
        let mut waiting_on: HashMap<Id, usize> = HashMap::with_capacity(jobs.len());
        let mut dependents: HashMap<Id, Vec<Id>> = HashMap::new();
        for job in &graph.jobs {
            let deps: HashSet<&Id> = job.deps.iter().collect();
            waiting_on.insert(job.id, deps.len());
            for dep in deps {
                dependents.entry(*dep).or_default().push(job.id);
            }
        }

        let mut running = JoinSet::new();
        for job in &graph.jobs {
            if waiting_on[&job.id] == 0 {
                self.submit(job, graph, &mut running);
            }
        }

        let mut finished = 0;
        while finished < graph.jobs.len() {
            let joined = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return tx.send(BuildEvent::Failed(CoordinatorError::ShuttingDown.to_string())).await;
                }
                _ = tx.closed() => return Ok(()),
                joined = running.join_next() => joined,
            };

            let result = match joined {
                Some(Ok(result)) => result,
                Some(Err(err)) => {
                    return tx
                        .send(BuildEvent::Failed(format!("lost track of a job: {err}")))
                        .await;
                }
                None => {
                    return tx
                        .send(BuildEvent::Failed("no runnable jobs left".into()))
                        .await;
                }
            };
            finished += 1;

            let id = result.id;
            let failed = result.is_failure();
            tx.send(BuildEvent::JobFinished(result)).await?;

            if failed {
                let name = jobs.get(&id).map(|job| job.name.as_str()).unwrap_or_default();
                info!(build = %build_id, job = %id, name, "build failed");
                return tx
                    .send(BuildEvent::Failed(format!("job {name} ({id}) failed")))
                    .await;
            }

            for dependent in dependents.get(&id).into_iter().flatten() {
                let Some(count) = waiting_on.get_mut(dependent) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    if let Some(job) = jobs.get(dependent) {
                        self.submit(job, graph, &mut running);
                    }
                }
            }
        }

        info!(build = %build_id, jobs = finished, "build finished");
        tx.send(BuildEvent::Finished).await
    }

    fn submit(&self, job: &Job, graph: &BuildGraph, running: &mut JoinSet<JobResult>) {
        let pending = self.scheduler.schedule_job(self.job_spec(job, graph));
        running.spawn(async move { pending.wait().await.clone() });
    }

    /// Build the spec a worker needs to run `job`. Each dependency artifact
    /// points at the worker that announced it, or failing that, the worker
    /// the dependency last ran on.
    fn job_spec(&self, job: &Job, graph: &BuildGraph) -> JobSpec {
        let mut spec = JobSpec::new(job.clone());
        spec.source_files = graph.source_files.clone();
        for dep in &job.deps {
            let location = self
                .artifacts
                .locate(dep)
                .or_else(|| self.scheduler.locate_artifact(dep));
            if let Some(worker) = location {
                spec.artifacts.insert(*dep, worker);
            }
        }
        spec
    }

    /// Source files of `graph` that are not in the file cache, sorted.
    pub fn missing_files(&self, graph: &BuildGraph) -> Vec<Id> {
        let mut missing: Vec<Id> = graph
            .source_files
            .keys()
            .filter(|id| !self.files.contains(id))
            .copied()
            .collect();
        missing.sort();
        missing
    }

    /// Process a heartbeat and return the jobs admitted to the worker.
    ///
    /// Artifacts are recorded before completions, so that jobs unblocked by
    /// a completion already see the announced artifact locations.
    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> HashMap<Id, JobSpec> {
        let Heartbeat {
            worker,
            running_jobs,
            free_slots,
            finished_jobs,
            added_artifacts,
        } = heartbeat;

        self.scheduler.register_worker(&worker);
        for artifact in added_artifacts {
            self.artifacts.record(artifact, &worker);
        }
        for result in finished_jobs {
            let id = result.id;
            self.scheduler.on_job_complete(&worker, id, result);
        }
        debug!(%worker, running = running_jobs.len(), free_slots, "heartbeat");

        let mut jobs = HashMap::new();
        if free_slots == 0 {
            return jobs;
        }

        // Finished jobs wait on the worker until this returns.
        let wait = if running_jobs.is_empty() {
            self.pick_timeout
        } else {
            self.busy_pick_timeout
        };
        let ctx = self.shutdown.child_token();
        let first = tokio::time::timeout(wait, self.scheduler.pick_job(&ctx, &worker)).await;
        let Ok(Some(job)) = first else {
            return jobs;
        };
        jobs.insert(job.id(), job.spec().clone());

        for _ in 1..free_slots {
            match self.scheduler.try_pick_job(&worker) {
                Some(job) => {
                    jobs.insert(job.id(), job.spec().clone());
                }
                None => break,
            }
        }

        jobs
    }

    /// Handle a signal for a running build.
    pub fn signal(&self, build_id: Id, upload_done: bool) -> Result<(), CoordinatorError> {
        let build = self
            .builds
            .get(&build_id)
            .ok_or(CoordinatorError::UnknownBuild(build_id))?;
        if upload_done {
            debug!(build = %build_id, "upload done");
            build.cancel();
        }
        Ok(())
    }

    /// Lease a source file for reading.
    pub fn open_file(&self, id: Id) -> Result<Lease, CoordinatorError> {
        Ok(self.files.get(id)?)
    }

    /// Store an uploaded source file, replacing any stored copy. The
    /// content must hash to `id`. Uploads of one id run one at a time.
    pub async fn put_file<S>(&self, id: Id, chunks: S) -> Result<(), CoordinatorError>
    where
        S: Stream<Item = Result<Bytes, CoordinatorError>>,
    {
        tokio::pin!(chunks);

        let lock = self.uploads.entry(id).or_default().clone();
        let guard = lock.lock_owned().await;
        let result = self.write_file(id, &mut chunks).await;
        drop(guard);
        self.uploads
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn write_file<S>(&self, id: Id, chunks: &mut S) -> Result<(), CoordinatorError>
    where
        S: Stream<Item = Result<Bytes, CoordinatorError>> + Unpin,
    {
        if self.files.contains(&id) {
            match self.files.remove(id).await {
                Ok(()) => debug!(file = %id, "replacing stored file"),
                Err(CacheError::Busy(_)) => {
                    // Workers are reading it. Check the body, keep the copy.
                    let mut hasher = IdHasher::new();
                    while let Some(chunk) = chunks.next().await {
                        hasher.update(chunk?);
                    }
                    return verify(id, hasher.finish());
                }
                Err(err) => return Err(err.into()),
            }
        }

        let tx = self.files.create(id)?;
        let mut file = tokio::fs::File::create(tx.path()).await?;
        let mut hasher = IdHasher::new();
        let mut size = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            size += chunk.len();
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        if let Err(err) = verify(id, hasher.finish()) {
            tx.abort().await?;
            return Err(err);
        }
        tx.commit().await?;
        debug!(file = %id, size, "stored file");
        Ok(())
    }

    /// Stop scheduling and abort all running builds.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.scheduler.stop();
        info!("coordinator stopped");
    }
}

fn verify(expected: Id, actual: Id) -> Result<(), CoordinatorError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoordinatorError::ContentMismatch { expected, actual })
    }
}
