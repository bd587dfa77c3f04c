use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use super::pending::JobKey;

/// A bounded FIFO of job offers.
///
/// Offers are removed lazily: once a job has been picked from any queue, the
/// copies sitting in other queues are skipped on the next `take`.
#[derive(Debug)]
pub(crate) struct OfferQueue {
    keys: VecDeque<JobKey>,
    capacity: usize,
}

impl OfferQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue an offer. Returns false if the queue is full of live offers
    /// and the offer was dropped.
    pub fn offer(&mut self, key: JobKey, is_live: impl Fn(JobKey) -> bool) -> bool {
        if self.keys.len() >= self.capacity {
            self.keys.retain(|key| is_live(*key));
        }
        if self.keys.len() >= self.capacity {
            return false;
        }
        self.keys.push_back(key);
        true
    }

    /// Pop the oldest offer that is still live.
    pub fn take(&mut self, is_live: impl Fn(JobKey) -> bool) -> Option<JobKey> {
        while let Some(key) = self.keys.pop_front() {
            if is_live(key) {
                return Some(key);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Preference queues of a single worker.
#[derive(Debug)]
pub(crate) struct WorkerQueues {
    /// Jobs whose result this worker already holds.
    pub cache_tier: OfferQueue,

    /// Jobs with a dependency artifact on this worker.
    pub locality_tier: OfferQueue,

    /// Woken whenever an offer lands in one of the queues above.
    pub notify: Arc<Notify>,
}

impl WorkerQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache_tier: OfferQueue::new(capacity),
            locality_tier: OfferQueue::new(capacity),
            notify: Arc::new(Notify::new()),
        }
    }
}
