use dashmap::DashMap;
use tracing::debug;

use common::{Id, WorkerId};

/// Which worker announced which artifact.
///
/// Filled from the `added_artifacts` of worker heartbeats. The most recent
/// announcement wins.
#[derive(Debug, Default)]
pub struct ArtifactLocations {
    locations: DashMap<Id, WorkerId>,
}

impl ArtifactLocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, artifact: Id, worker: &WorkerId) {
        let previous = self.locations.insert(artifact, worker.clone());
        if previous.as_ref() != Some(worker) {
            debug!(%artifact, %worker, "artifact available");
        }
    }

    pub fn locate(&self, artifact: &Id) -> Option<WorkerId> {
        self.locations.get(artifact).map(|worker| worker.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_announcement_wins() {
        let locations = ArtifactLocations::new();
        let id = Id::of("lib.o");
        assert!(locations.locate(&id).is_none());

        locations.record(id, &WorkerId::from("w1"));
        locations.record(id, &WorkerId::from("w2"));
        assert_eq!(locations.locate(&id), Some(WorkerId::from("w2")));
        assert_eq!(locations.locate(&Id::of("other.o")), None);
    }
}
