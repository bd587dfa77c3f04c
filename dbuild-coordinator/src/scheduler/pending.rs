use std::fmt;
use std::sync::{Arc, OnceLock};

use common::{Id, JobResult, JobSpec};
use tokio_util::sync::CancellationToken;

/// Identifies one submission of a job to the scheduler.
///
/// The same content id may be submitted several times (e.g. by unrelated
/// builds); every submission gets its own key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(pub(crate) u64);

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Inner {
    key: JobKey,
    spec: Arc<JobSpec>,
    result: OnceLock<JobResult>,
    finished: CancellationToken,
}

/// Handle for an in-flight scheduling decision and its eventual result.
///
/// The result slot is written at most once; the completion signal fires
/// right after it is written, exactly once.
#[derive(Debug, Clone)]
pub struct PendingJob {
    inner: Arc<Inner>,
}

impl PendingJob {
    pub(crate) fn new(key: JobKey, spec: Arc<JobSpec>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                spec,
                result: OnceLock::new(),
                finished: CancellationToken::new(),
            }),
        }
    }

    pub fn key(&self) -> JobKey {
        self.inner.key
    }

    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    pub fn id(&self) -> Id {
        self.inner.spec.id()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// The recorded result, if the job has finished.
    pub fn result(&self) -> Option<&JobResult> {
        self.inner.result.get()
    }

    /// Wait for the job to finish.
    pub async fn wait(&self) -> &JobResult {
        loop {
            // The result is stored before the signal fires.
            if let Some(result) = self.inner.result.get() {
                return result;
            }
            self.inner.finished.cancelled().await;
        }
    }

    /// Store the result and fire the completion signal. Only the first call
    /// has any effect; later calls return false.
    pub(crate) fn complete(&self, result: JobResult) -> bool {
        if self.inner.result.set(result).is_err() {
            return false;
        }
        self.inner.finished.cancel();
        true
    }

    /// Token cancelled when the job finishes.
    pub(crate) fn finished_token(&self) -> &CancellationToken {
        &self.inner.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Job;

    fn pending() -> PendingJob {
        let spec = JobSpec::new(Job {
            id: Id::of("job"),
            name: "job".into(),
            deps: vec![],
            cmds: vec![],
        });
        PendingJob::new(JobKey(1), Arc::new(spec))
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let job = pending();
        assert!(!job.is_finished());
        assert!(job.result().is_none());

        let first = JobResult::success(job.id());
        let second = JobResult {
            exit_code: 1,
            ..JobResult::success(job.id())
        };

        assert!(job.complete(first.clone()));
        assert!(!job.complete(second));
        assert!(job.is_finished());
        assert_eq!(job.wait().await, &first);
        assert_eq!(job.result(), Some(&first));
    }

    #[tokio::test]
    async fn clones_share_the_result() {
        let job = pending();
        let waiter = job.clone();
        let handle = tokio::spawn(async move { waiter.wait().await.clone() });

        job.complete(JobResult::failed(job.id(), "boom"));
        let result = handle.await.unwrap();
        assert_eq!(result.error.as_deref(), Some("boom"));
    }
}
