//
// Import gRPC stubs/definitions.
//
pub use common::coordinator::coordinator_client::CoordinatorClient;
pub use common::worker::worker_client::WorkerClient;
pub use common::worker::worker_server::{Worker, WorkerServer};
use common::worker::{ArtifactChunk, ArtifactRequest};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use common::cache::{Cache, CacheError};
use common::convert::ConvertError;
use common::Id;

use crate::archive;

/// Size of the chunks artifacts are streamed in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Serves this worker's artifacts to its peers.
#[derive(Debug, Clone)]
pub struct ArtifactService {
    artifacts: Cache,
}

impl ArtifactService {
    pub fn new(artifacts: Cache) -> Self {
        Self { artifacts }
    }
}

#[tonic::async_trait]
impl Worker for ArtifactService {
    type GetArtifactStream = ReceiverStream<Result<ArtifactChunk, Status>>;

    async fn get_artifact(
        &self,
        request: Request<ArtifactRequest>,
    ) -> Result<Response<Self::GetArtifactStream>, Status> {
        let id = request
            .into_inner()
            .id
            .parse::<Id>()
            .map_err(ConvertError::from)?;

        let lease = self.artifacts.get(id).map_err(|err| match err {
            CacheError::NotFound(_) => Status::not_found(err.to_string()),
            _ => Status::internal(err.to_string()),
        })?;
        let data = Bytes::from(
            archive::pack(lease.path())
                .await
                .map_err(|err| Status::internal(err.to_string()))?,
        );
        lease.release();
        debug!(artifact = %id, size = data.len(), "serving artifact");

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + CHUNK_SIZE).min(data.len());
                let chunk = ArtifactChunk {
                    data: data.slice(offset..end),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
                offset = end;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
