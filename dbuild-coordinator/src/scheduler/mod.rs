//! Delay scheduling of jobs onto workers.
//!
//! Every submitted job moves through a small state machine:
//!
//! ```text
//! AwaitingCache -> AwaitingLocality -> Global -> Assigned -> Done
//! ```
//!
//! A job whose result some worker already holds starts in `AwaitingCache`
//! and is offered on those workers' cache tier. Otherwise it starts in
//! `AwaitingLocality` and is offered on the locality tier of the workers that
//! host its dependencies' artifacts. `CacheTimeout` widens a cache-tier job
//! to the locality tier, `DepsTimeout` moves any still waiting job onto the
//! global queue where every worker may take it. The first successful pick
//! wins, all other offers of that job go stale.
//!
//! All state lives behind one mutex. No critical section awaits, and offers
//! into per-worker queues never block: the queues are bounded and an offer
//! to a full queue is dropped (the job stays reachable through its timers).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::{Id, JobResult, JobSpec, WorkerId};

mod pending;
mod queue;

pub use pending::{JobKey, PendingJob};
use queue::WorkerQueues;

/// Scheduler timeouts and limits.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a job waits for a worker that already holds its result
    /// before it is also offered to workers near its dependencies.
    pub cache_timeout: Duration,

    /// How long a job waits for a preferred worker before any worker may
    /// take it.
    pub deps_timeout: Duration,

    /// Capacity of each per-worker preference queue.
    pub max_offers_per_worker: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_millis(10),
            deps_timeout: Duration::from_millis(100),
            max_offers_per_worker: 1024,
        }
    }
}

/// Where a job is in its placement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Offered only to workers holding a cached result.
    AwaitingCache,

    /// Offered to workers hosting a dependency's artifact.
    AwaitingLocality,

    /// On the global queue, any worker may take it.
    Global,

    /// Picked by a worker, waiting for its completion report.
    Assigned,

    /// A result was recorded.
    Done,
}

impl JobPhase {
    fn is_waiting(self) -> bool {
        matches!(
            self,
            JobPhase::AwaitingCache | JobPhase::AwaitingLocality | JobPhase::Global
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Cache,
    Locality,
    Global,
}

#[derive(Debug, Clone, Copy)]
enum Escalation {
    CacheTimeout,
    DepsTimeout,
}

#[derive(Debug)]
struct Entry {
    spec: Arc<JobSpec>,
    phase: JobPhase,

    /// Handle returned to the submitter.
    submitted: PendingJob,

    /// Cancelled when the job is picked or finished; stops its timers.
    offers: CancellationToken,
}

#[derive(Debug)]
struct Assignment {
    key: JobKey,
    handle: PendingJob,
}

#[derive(Debug, Default)]
struct State {
    next_key: u64,

    /// Submitted jobs that have not finished yet.
    jobs: HashMap<JobKey, Entry>,

    workers: HashMap<WorkerId, WorkerQueues>,
    global: VecDeque<JobKey>,

    /// Job id -> workers known to hold its result. Append-only.
    placement: HashMap<Id, Vec<WorkerId>>,

    /// Worker -> job id -> assignments waiting for a completion report.
    active: HashMap<WorkerId, HashMap<Id, Vec<Assignment>>>,

    /// Job id -> worker it was most recently assigned to.
    last_assigned: HashMap<Id, WorkerId>,

    stopped: bool,
}

fn is_live(jobs: &HashMap<JobKey, Entry>, key: JobKey) -> bool {
    jobs.get(&key).is_some_and(|entry| entry.phase.is_waiting())
}

/// Workers hosting at least one of the job's dependencies, in dependency
/// order and without duplicates.
fn locality_targets(spec: &JobSpec) -> Vec<WorkerId> {
    let mut seen = HashSet::new();
    spec.job
        .deps
        .iter()
        .filter_map(|dep| spec.artifacts.get(dep))
        .filter(|worker| seen.insert(*worker))
        .cloned()
        .collect()
}

impl State {
    fn queues(&mut self, worker: &WorkerId, capacity: usize) -> &mut WorkerQueues {
        self.workers
            .entry(worker.clone())
            .or_insert_with(|| WorkerQueues::new(capacity))
    }

    /// Offer a job on one of a worker's preference queues. Never blocks.
    fn offer(&mut self, tier: Tier, worker: &WorkerId, key: JobKey, capacity: usize) {
        let State { jobs, workers, .. } = self;
        let queues = workers
            .entry(worker.clone())
            .or_insert_with(|| WorkerQueues::new(capacity));

        let queue = match tier {
            Tier::Cache => &mut queues.cache_tier,
            _ => &mut queues.locality_tier,
        };

        if queue.offer(key, |key| is_live(jobs, key)) {
            queues.notify.notify_waiters();
        } else {
            debug!(%worker, job = %key, ?tier, "preference queue full, dropping offer");
        }
    }

    /// Pop the best job available to `worker`: cache tier first, then
    /// locality tier, then the global queue.
    fn take(&mut self, worker: &WorkerId, capacity: usize) -> Option<(JobKey, Tier)> {
        let State {
            jobs,
            workers,
            global,
            stopped,
            ..
        } = self;
        let live = |key: JobKey| is_live(jobs, key);
        let queues = workers
            .entry(worker.clone())
            .or_insert_with(|| WorkerQueues::new(capacity));

        if let Some(key) = queues.cache_tier.take(live) {
            return Some((key, Tier::Cache));
        }
        if let Some(key) = queues.locality_tier.take(live) {
            return Some((key, Tier::Locality));
        }
        if *stopped {
            return None;
        }
        while let Some(key) = global.pop_front() {
            if live(key) {
                return Some((key, Tier::Global));
            }
        }
        None
    }

    /// Hand a waiting job to `worker`.
    fn assign(&mut self, key: JobKey, worker: &WorkerId) -> Option<PendingJob> {
        let entry = self.jobs.get_mut(&key)?;
        entry.phase = JobPhase::Assigned;
        entry.offers.cancel();

        let id = entry.spec.id();
        let handle = PendingJob::new(key, entry.spec.clone());

        self.last_assigned.insert(id, worker.clone());
        self.active
            .entry(worker.clone())
            .or_default()
            .entry(id)
            .or_default()
            .push(Assignment {
                key,
                handle: handle.clone(),
            });

        Some(handle)
    }
}

#[derive(Debug)]
struct Shared {
    config: Config,
    state: Mutex<State>,

    /// Woken whenever a job lands on the global queue, and on stop.
    global_notify: Notify,

    stop: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // No critical section leaves the state half-updated on panic.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn escalate(&self, key: JobKey, step: Escalation) {
        let capacity = self.config.max_offers_per_worker;
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(&key) else {
            return;
        };

        match (step, entry.phase) {
            (Escalation::CacheTimeout, JobPhase::AwaitingCache) => {
                entry.phase = JobPhase::AwaitingLocality;
                let spec = entry.spec.clone();
                let targets = locality_targets(&spec);
                debug!(job = %spec.id(), %key, workers = targets.len(), "cache timeout, widening to locality tier");
                for worker in &targets {
                    state.offer(Tier::Locality, worker, key, capacity);
                }
            }
            (Escalation::DepsTimeout, JobPhase::AwaitingCache | JobPhase::AwaitingLocality) => {
                entry.phase = JobPhase::Global;
                debug!(job = %entry.spec.id(), %key, "deps timeout, moving to global queue");
                if !state.stopped {
                    state.global.push_back(key);
                    self.global_notify.notify_waiters();
                }
            }
            // Picked, finished, or already widened further.
            _ => {}
        }
    }
}

/// Assigns jobs to workers. Cheap to clone; all clones share one state.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                global_notify: Notify::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Allocate the worker's preference queues.
    ///
    /// Idempotent. Offers made before registration are kept, so a job
    /// targeting a worker that has not shown up yet never blocks.
    pub fn register_worker(&self, worker: &WorkerId) {
        let capacity = self.shared.config.max_offers_per_worker;
        let mut state = self.shared.lock();
        if !state.workers.contains_key(worker) {
            info!(%worker, "registered worker");
        }
        state.queues(worker, capacity);
    }

    /// Submit a job. Returns immediately; the handle fires once a worker
    /// reports the job's result.
    ///
    /// Must be called from within a tokio runtime, the escalation timers run
    /// as background tasks.
    pub fn schedule_job(&self, spec: JobSpec) -> PendingJob {
        let config = &self.shared.config;
        let capacity = config.max_offers_per_worker;
        let spec = Arc::new(spec);
        let now = Instant::now();

        let (submitted, offers) = {
            let mut state = self.shared.lock();
            let key = JobKey(state.next_key);
            state.next_key += 1;

            let submitted = PendingJob::new(key, spec.clone());
            let offers = submitted.finished_token().child_token();
            let cached = state.placement.get(&spec.id()).cloned().unwrap_or_default();
            let phase = if cached.is_empty() {
                JobPhase::AwaitingLocality
            } else {
                JobPhase::AwaitingCache
            };

            state.jobs.insert(
                key,
                Entry {
                    spec: spec.clone(),
                    phase,
                    submitted: submitted.clone(),
                    offers: offers.clone(),
                },
            );

            if cached.is_empty() {
                for worker in &locality_targets(&spec) {
                    state.offer(Tier::Locality, worker, key, capacity);
                }
            } else {
                for worker in &cached {
                    state.offer(Tier::Cache, worker, key, capacity);
                }
            }

            debug!(job = %spec.id(), name = %spec.job.name, %key, ?phase, "scheduled job");
            (submitted, offers)
        };

        let key = submitted.key();
        self.arm(
            key,
            offers.clone(),
            now + config.cache_timeout,
            Escalation::CacheTimeout,
        );
        self.arm(key, offers, now + config.deps_timeout, Escalation::DepsTimeout);

        submitted
    }

    fn arm(&self, key: JobKey, offers: CancellationToken, deadline: Instant, step: Escalation) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = offers.cancelled() => {}
                _ = shared.stop.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => shared.escalate(key, step),
            }
        });
    }

    /// Take a job for `worker` without waiting.
    pub fn try_pick_job(&self, worker: &WorkerId) -> Option<PendingJob> {
        let capacity = self.shared.config.max_offers_per_worker;
        let mut state = self.shared.lock();
        let (key, tier) = state.take(worker, capacity)?;
        let job = state.assign(key, worker)?;
        debug!(%worker, job = %job.id(), %key, ?tier, "assigned job");
        Some(job)
    }

    /// Wait for a job for `worker`, or until `ctx` is cancelled.
    ///
    /// Returns `None` on cancellation, without having consumed a job, and
    /// once the scheduler is stopped and the worker's own queues are empty.
    pub async fn pick_job(&self, ctx: &CancellationToken, worker: &WorkerId) -> Option<PendingJob> {
        if ctx.is_cancelled() {
            return None;
        }

        let capacity = self.shared.config.max_offers_per_worker;
        let worker_notify = self.shared.lock().queues(worker, capacity).notify.clone();

        loop {
            // Register for wakeups before looking at the queues, so an offer
            // landing in between is not missed.
            let worker_wakeup = worker_notify.notified();
            let global_wakeup = self.shared.global_notify.notified();
            tokio::pin!(worker_wakeup);
            tokio::pin!(global_wakeup);
            worker_wakeup.as_mut().enable();
            global_wakeup.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some((key, tier)) = state.take(worker, capacity) {
                    if let Some(job) = state.assign(key, worker) {
                        debug!(%worker, job = %job.id(), %key, ?tier, "assigned job");
                        return Some(job);
                    }
                }
                if state.stopped {
                    return None;
                }
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return None,
                _ = &mut worker_wakeup => {}
                _ = &mut global_wakeup => {}
            }
        }
    }

    /// Record that `worker` finished `job`.
    ///
    /// The worker is added to the job's placement cache unconditionally.
    /// Returns true if the report resolved an active assignment, false for
    /// stale or duplicate reports.
    pub fn on_job_complete(&self, worker: &WorkerId, job: Id, result: JobResult) -> bool {
        let mut state = self.shared.lock();

        let holders = state.placement.entry(job).or_default();
        if !holders.contains(worker) {
            holders.push(worker.clone());
        }

        let assignments = state
            .active
            .get_mut(worker)
            .and_then(|jobs| jobs.remove(&job));
        if state.active.get(worker).is_some_and(HashMap::is_empty) {
            state.active.remove(worker);
        }

        let Some(assignments) = assignments else {
            debug!(%worker, %job, "completion without active assignment");
            return false;
        };

        for assignment in assignments {
            assignment.handle.complete(result.clone());
            if let Some(entry) = state.jobs.remove(&assignment.key) {
                entry.offers.cancel();
                entry.submitted.complete(result.clone());
            }
        }

        debug!(%worker, %job, exit_code = result.exit_code, "job completed");
        true
    }

    /// Workers known to hold a result for `job`.
    pub fn placement(&self, job: &Id) -> Vec<WorkerId> {
        self.shared
            .lock()
            .placement
            .get(job)
            .cloned()
            .unwrap_or_default()
    }

    /// The worker `job` was most recently assigned to, i.e. where its
    /// artifact is expected to appear.
    pub fn locate_artifact(&self, job: &Id) -> Option<WorkerId> {
        self.shared.lock().last_assigned.get(job).cloned()
    }

    /// Current phase of a submitted job.
    pub fn phase(&self, job: &PendingJob) -> JobPhase {
        if job.is_finished() {
            return JobPhase::Done;
        }
        self.shared
            .lock()
            .jobs
            .get(&job.key())
            .map(|entry| entry.phase)
            .unwrap_or(JobPhase::Done)
    }

    /// Close the global queue and stop all timers. Pulls with nothing in
    /// their worker's own queues return `None`.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.global.clear();
            for queues in state.workers.values() {
                queues.notify.notify_waiters();
            }
        }
        self.shared.stop.cancel();
        self.shared.global_notify.notify_waiters();
        info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Job;

    fn spec(name: &str, deps: &[(Id, &str)]) -> JobSpec {
        let mut spec = JobSpec::new(Job {
            id: Id::of(name),
            name: name.into(),
            deps: deps.iter().map(|(id, _)| *id).collect(),
            cmds: vec![],
        });
        for (dep, worker) in deps {
            spec.artifacts.insert(*dep, WorkerId::from(*worker));
        }
        spec
    }

    #[test]
    fn locality_targets_are_unique_and_ordered() {
        let a = Id::of("a");
        let b = Id::of("b");
        let c = Id::of("c");
        let mut spec = spec("job", &[(a, "w1"), (b, "w2"), (c, "w1")]);
        spec.job.deps.push(Id::of("unknown"));

        assert_eq!(
            locality_targets(&spec),
            vec![WorkerId::from("w1"), WorkerId::from("w2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn phases_follow_the_timeouts() {
        let scheduler = Scheduler::new(Config::default());
        let w0 = WorkerId::from("w0");
        let job = spec("cached", &[]);
        scheduler.on_job_complete(&w0, job.id(), JobResult::success(job.id()));

        // Not registered as picker yet: the offer waits in w0's cache tier.
        let pending = scheduler.schedule_job(job);
        assert_eq!(scheduler.phase(&pending), JobPhase::AwaitingCache);

        tokio::time::sleep(scheduler.config().cache_timeout + Duration::from_millis(1)).await;
        assert_eq!(scheduler.phase(&pending), JobPhase::AwaitingLocality);

        tokio::time::sleep(scheduler.config().deps_timeout).await;
        assert_eq!(scheduler.phase(&pending), JobPhase::Global);

        let picked = scheduler.try_pick_job(&w0).unwrap();
        assert_eq!(picked.key(), pending.key());
        assert_eq!(scheduler.phase(&pending), JobPhase::Assigned);

        assert!(scheduler.on_job_complete(&w0, pending.id(), JobResult::success(pending.id())));
        assert_eq!(scheduler.phase(&pending), JobPhase::Done);
        assert!(pending.is_finished());
        assert!(picked.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn picked_job_is_not_offered_again() {
        let scheduler = Scheduler::new(Config::default());
        let dep = Id::of("dep");
        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");

        let pending = scheduler.schedule_job(spec("job", &[(dep, "w1")]));
        assert!(scheduler.try_pick_job(&w1).is_some());

        // Long past both timeouts, nobody else sees the job.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(scheduler.try_pick_job(&w1).is_none());
        assert!(scheduler.try_pick_job(&w2).is_none());
        assert_eq!(scheduler.phase(&pending), JobPhase::Assigned);
    }

    #[tokio::test(start_paused = true)]
    async fn full_preference_queue_falls_back_to_global() {
        let config = Config {
            max_offers_per_worker: 1,
            ..Config::default()
        };
        let scheduler = Scheduler::new(config);
        let dep = Id::of("dep");
        let w1 = WorkerId::from("w1");
        let w2 = WorkerId::from("w2");

        let first = scheduler.schedule_job(spec("first", &[(dep, "w1")]));
        let second = scheduler.schedule_job(spec("second", &[(dep, "w1")]));

        // Only the first offer fit into w1's locality tier, yet both jobs
        // reach the global queue.
        tokio::time::sleep(scheduler.config().deps_timeout + Duration::from_millis(1)).await;
        assert_eq!(scheduler.phase(&second), JobPhase::Global);

        let a = scheduler.try_pick_job(&w2).unwrap();
        let b = scheduler.try_pick_job(&w1).unwrap();
        let mut keys = vec![a.key(), b.key()];
        keys.sort();
        assert_eq!(keys, vec![first.key(), second.key()]);
        assert!(scheduler.try_pick_job(&w1).is_none());
    }

    #[tokio::test]
    async fn duplicate_submissions_complete_together() {
        let scheduler = Scheduler::new(Config::default());
        let w0 = WorkerId::from("w0");
        let job = spec("dup", &[]);
        let id = job.id();
        let dep = Id::of("dep");
        let mut a = job.clone();
        a.artifacts.insert(dep, w0.clone());
        a.job.deps.push(dep);

        let first = scheduler.schedule_job(a.clone());
        let second = scheduler.schedule_job(a);
        assert!(scheduler.try_pick_job(&w0).is_some());
        assert!(scheduler.try_pick_job(&w0).is_some());

        assert!(scheduler.on_job_complete(&w0, id, JobResult::success(id)));
        assert!(first.is_finished());
        assert!(second.is_finished());
        assert!(!scheduler.on_job_complete(&w0, id, JobResult::success(id)));
    }

    #[tokio::test]
    async fn stop_releases_waiters() {
        let scheduler = Scheduler::new(Config::default());
        let w0 = WorkerId::from("w0");
        scheduler.register_worker(&w0);

        let waiter = {
            let scheduler = scheduler.clone();
            let w0 = w0.clone();
            tokio::spawn(async move { scheduler.pick_job(&CancellationToken::new(), &w0).await })
        };
        tokio::task::yield_now().await;

        scheduler.stop();
        assert!(waiter.await.unwrap().is_none());
        assert!(scheduler.is_stopped());
        assert!(scheduler
            .pick_job(&CancellationToken::new(), &w0)
            .await
            .is_none());
    }
}
