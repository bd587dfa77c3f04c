use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use common::convert::{format_ids, ConvertError};
use common::coordinator::{HeartbeatRequest, HeartbeatResponse};
use common::{Id, JobResult, JobSpec, WorkerId};

use crate::core::CoordinatorClient;
use crate::executor::{Executor, Outcome};

/// What the next heartbeat reports.
#[derive(Debug, Default)]
struct Report {
    running: HashSet<Id>,
    finished: Vec<JobResult>,
    added_artifacts: Vec<Id>,
}

impl Report {
    fn record(&mut self, id: Id, outcome: Outcome) {
        self.running.remove(&id);
        self.added_artifacts.extend(outcome.fetched);
        if !outcome.result.is_failure() {
            self.added_artifacts.push(id);
        }
        self.finished.push(outcome.result);
    }
}

/// Polls the coordinator for work and runs what it hands out.
#[derive(Debug)]
pub struct HeartbeatLoop {
    worker: WorkerId,
    coordinator: CoordinatorClient<Channel>,
    executor: Executor,
    slots: usize,
    heartbeat_interval: Duration,
    retry_interval: Duration,
    report: Arc<Mutex<Report>>,
    /// Signalled whenever a job finishes.
    finished: Arc<Notify>,
}

impl HeartbeatLoop {
    pub fn new(
        worker: WorkerId,
        coordinator: CoordinatorClient<Channel>,
        executor: Executor,
        slots: usize,
        heartbeat_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        // Announce what survived a restart.
        let report = Report {
            added_artifacts: executor.artifacts().list(),
            ..Report::default()
        };

        Self {
            worker,
            coordinator,
            executor,
            slots,
            heartbeat_interval,
            retry_interval,
            report: Arc::new(Mutex::new(report)),
            finished: Arc::new(Notify::new()),
        }
    }

    fn report(&self) -> MutexGuard<'_, Report> {
        self.report.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run until `shutdown` is cancelled, then wait for running jobs.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let jobs = TaskTracker::new();
        info!(worker = %self.worker, slots = self.slots, "starting heartbeats");

        while !shutdown.is_cancelled() {
            // A full worker cannot be handed work, so the coordinator would
            // answer at once. Pace those heartbeats.
            if self.report().running.len() >= self.slots {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.finished.notified() => {}
                    _ = tokio::time::sleep(self.heartbeat_interval) => {}
                }
            }

            let request = self.next_request();
            let response = tokio::select! {
                _ = shutdown.cancelled() => None,
                response = self.coordinator.heartbeat(request.clone()) => Some(response),
            };
            let Some(response) = response else {
                self.restore(request);
                break;
            };

            match response {
                Ok(response) => self.admit(response.into_inner(), &jobs),
                Err(status) => {
                    warn!(worker = %self.worker, "heartbeat failed: {}", status.message());
                    self.restore(request);
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        }

        jobs.close();
        info!(running = jobs.len(), "waiting for running jobs");
        jobs.wait().await;
    }

    fn next_request(&self) -> HeartbeatRequest {
        let mut report = self.report();
        let finished = std::mem::take(&mut report.finished);
        let added_artifacts = std::mem::take(&mut report.added_artifacts);
        let running: Vec<Id> = report.running.iter().copied().collect();

        HeartbeatRequest {
            worker_id: self.worker.to_string(),
            running_jobs: format_ids(&running),
            free_slots: self.slots.saturating_sub(running.len()) as u32,
            finished_jobs: finished.iter().map(Into::into).collect(),
            added_artifacts: format_ids(&added_artifacts),
        }
    }

    /// Put back what an undelivered heartbeat carried.
    fn restore(&self, request: HeartbeatRequest) {
        let mut report = self.report();
        for result in request.finished_jobs {
            match JobResult::try_from(result) {
                Ok(result) => report.finished.push(result),
                Err(err) => warn!("dropping unreportable result: {err}"),
            }
        }
        for id in request.added_artifacts {
            if let Ok(id) = id.parse::<Id>() {
                report.added_artifacts.push(id);
            }
        }
    }

    fn admit(&self, response: HeartbeatResponse, jobs: &TaskTracker) {
        for (id, spec) in response.jobs_to_run {
            let spec = match JobSpec::try_from(spec) {
                Ok(spec) => spec,
                Err(err) => {
                    self.reject(&id, err);
                    continue;
                }
            };

            if !self.report().running.insert(spec.id()) {
                debug!(job = %spec.id(), "job already running");
                continue;
            }

            let executor = self.executor.clone();
            let report = self.report.clone();
            let finished = self.finished.clone();
            jobs.spawn(async move {
                let outcome = executor.run(&spec).await;
                report
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(spec.id(), outcome);
                finished.notify_one();
            });
        }
    }

    fn reject(&self, id: &str, err: ConvertError) {
        warn!(job = id, "rejecting malformed job: {err}");
        if let Ok(id) = id.parse::<Id>() {
            self.report()
                .finished
                .push(JobResult::failed(id, format!("malformed job spec: {err}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use common::cache::Cache;
    use common::coordinator as pb;
    use common::{Cmd, Job};

    use super::*;

    async fn heartbeat_loop(root: &Path, slots: usize) -> HeartbeatLoop {
        // Never dialed: these tests drive the loop's steps directly.
        let channel = Channel::from_static("http://[::1]:1").connect_lazy();
        let coordinator = CoordinatorClient::new(channel);
        let executor = Executor::new(
            coordinator.clone(),
            Cache::open(root.join("files")).await.unwrap(),
            Cache::open(root.join("artifacts")).await.unwrap(),
        );
        HeartbeatLoop::new(
            WorkerId::from("127.0.0.1:9001"),
            coordinator,
            executor,
            slots,
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
    }

    fn response(name: &str, script: &str) -> (Id, HeartbeatResponse) {
        let spec = JobSpec::new(Job {
            id: Id::of(name),
            name: name.to_owned(),
            deps: vec![],
            cmds: vec![Cmd {
                exec: vec!["sh".into(), "-c".into(), script.into()],
            }],
        });
        let response = HeartbeatResponse {
            jobs_to_run: HashMap::from([(spec.id().to_hex(), pb::JobSpec::from(&spec))]),
        };
        (spec.id(), response)
    }

    #[tokio::test]
    async fn free_slots_exclude_running_jobs() {
        let root = tempfile::tempdir().unwrap();
        let heartbeats = heartbeat_loop(root.path(), 3).await;
        {
            let mut report = heartbeats.report();
            report.running.extend([Id::of("a"), Id::of("b")]);
            report.finished.push(JobResult::success(Id::of("c")));
        }

        let request = heartbeats.next_request();
        assert_eq!(request.free_slots, 1);
        assert_eq!(request.running_jobs.len(), 2);
        assert_eq!(request.finished_jobs.len(), 1);

        // Results are sent once.
        let request = heartbeats.next_request();
        assert_eq!(request.running_jobs.len(), 2);
        assert!(request.finished_jobs.is_empty());
    }

    #[tokio::test]
    async fn undelivered_reports_are_sent_again() {
        let root = tempfile::tempdir().unwrap();
        let heartbeats = heartbeat_loop(root.path(), 1).await;
        let id = Id::of("a");
        {
            let mut report = heartbeats.report();
            report.finished.push(JobResult::success(id));
            report.added_artifacts.push(id);
        }

        let lost = heartbeats.next_request();
        heartbeats.restore(lost);

        let request = heartbeats.next_request();
        assert_eq!(request.added_artifacts, vec![id.to_hex()]);
        assert_eq!(request.finished_jobs.len(), 1);
        assert_eq!(request.finished_jobs[0].job_id, id.to_hex());
    }

    #[tokio::test]
    async fn malformed_jobs_are_reported_failed() {
        let root = tempfile::tempdir().unwrap();
        let heartbeats = heartbeat_loop(root.path(), 2).await;
        let id = Id::of("broken");
        let response = HeartbeatResponse {
            jobs_to_run: HashMap::from([
                (id.to_hex(), pb::JobSpec::default()),
                ("not an id".to_owned(), pb::JobSpec::default()),
            ]),
        };

        let jobs = TaskTracker::new();
        heartbeats.admit(response, &jobs);
        assert!(jobs.is_empty());

        let report = heartbeats.report();
        assert!(report.running.is_empty());
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].id, id);
        assert!(report.finished[0].error.as_deref().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn running_job_is_not_started_twice() {
        let root = tempfile::tempdir().unwrap();
        let heartbeats = heartbeat_loop(root.path(), 2).await;
        let (id, response) = response("gen", "echo once");

        let jobs = TaskTracker::new();
        heartbeats.admit(response.clone(), &jobs);
        heartbeats.admit(response, &jobs);
        assert_eq!(jobs.len(), 1);

        jobs.close();
        jobs.wait().await;

        let report = heartbeats.report();
        assert!(report.running.is_empty());
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].stdout, b"once\n");
        assert_eq!(report.added_artifacts, vec![id]);
    }

    #[tokio::test]
    async fn failed_job_announces_no_artifact() {
        let root = tempfile::tempdir().unwrap();
        let heartbeats = heartbeat_loop(root.path(), 1).await;
        let (id, response) = response("broken", "exit 1");

        let jobs = TaskTracker::new();
        heartbeats.admit(response, &jobs);
        jobs.close();
        jobs.wait().await;

        let report = heartbeats.report();
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].id, id);
        assert_eq!(report.finished[0].exit_code, 1);
        assert!(report.added_artifacts.is_empty());
    }

    #[test]
    fn fetched_artifacts_are_announced() {
        let (job, dep) = (Id::of("job"), Id::of("dep"));
        let mut report = Report::default();
        report.running.insert(job);

        report.record(
            job,
            Outcome {
                result: JobResult::failed(job, "no space left"),
                fetched: vec![dep],
            },
        );
        assert!(report.running.is_empty());
        assert_eq!(report.added_artifacts, vec![dep]);
    }
}
