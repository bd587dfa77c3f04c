use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use common::convert::{format_ids, parse_ids, ConvertError};
use common::coordinator::{
    build_event::Event, BuildEvent as PbBuildEvent, BuildFailed, BuildFinished, BuildRequest,
    BuildStarted, Chunk, FileChunk, FileRequest, HeartbeatRequest, HeartbeatResponse,
    PutFileResponse, SignalRequest, SignalResponse,
};
use common::{BuildGraph, Id, JobResult, WorkerId};

pub use common::coordinator::coordinator_server::{Coordinator as CoordinatorRpc, CoordinatorServer};

use crate::dispatch::{BuildEvent, Coordinator, Heartbeat};
use crate::error::CoordinatorError;

/// Size of the chunks files are streamed in.
pub const CHUNK_SIZE: usize = 64 * 1024;

impl From<BuildEvent> for PbBuildEvent {
    fn from(event: BuildEvent) -> Self {
        let event = match event {
            BuildEvent::Started {
                build_id,
                missing_files,
            } => Event::Started(BuildStarted {
                id: build_id.to_hex(),
                missing_files: format_ids(&missing_files),
            }),
            BuildEvent::JobFinished(result) => Event::JobFinished((&result).into()),
            BuildEvent::Failed(error) => Event::BuildFailed(BuildFailed { error }),
            BuildEvent::Finished => Event::BuildFinished(BuildFinished {}),
        };
        Self { event: Some(event) }
    }
}

impl TryFrom<HeartbeatRequest> for Heartbeat {
    type Error = ConvertError;

    fn try_from(req: HeartbeatRequest) -> Result<Self, Self::Error> {
        if req.worker_id.is_empty() {
            return Err(ConvertError::MissingField("worker_id"));
        }

        Ok(Self {
            worker: WorkerId::from(req.worker_id),
            running_jobs: parse_ids(&req.running_jobs)?,
            free_slots: req.free_slots as usize,
            finished_jobs: req
                .finished_jobs
                .into_iter()
                .map(JobResult::try_from)
                .collect::<Result<_, _>>()?,
            added_artifacts: parse_ids(&req.added_artifacts)?,
        })
    }
}

/// gRPC front of the [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorService {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<PbBuildEvent, Status>> + Send>>;

#[tonic::async_trait]
impl CoordinatorRpc for CoordinatorService {
    type StartBuildStream = EventStream;

    async fn start_build(
        &self,
        request: Request<BuildRequest>,
    ) -> Result<Response<Self::StartBuildStream>, Status> {
        let graph = request
            .into_inner()
            .graph
            .ok_or(ConvertError::MissingField("graph"))?;
        let graph = BuildGraph::try_from(graph)?;

        let events = self.coordinator.start_build(graph)?;
        let stream = ReceiverStream::new(events).map(|event| Ok(event.into()));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn signal_build(
        &self,
        request: Request<SignalRequest>,
    ) -> Result<Response<SignalResponse>, Status> {
        let req = request.into_inner();
        let build_id = req.build_id.parse::<Id>().map_err(ConvertError::from)?;
        self.coordinator
            .signal(build_id, req.upload_done.is_some())?;
        Ok(Response::new(SignalResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let heartbeat = Heartbeat::try_from(request.into_inner())?;
        let jobs = self.coordinator.heartbeat(heartbeat).await;

        let jobs_to_run = jobs
            .iter()
            .map(|(id, spec)| (id.to_hex(), spec.into()))
            .collect();
        Ok(Response::new(HeartbeatResponse { jobs_to_run }))
    }

    type GetFileStream = ReceiverStream<Result<Chunk, Status>>;

    async fn get_file(
        &self,
        request: Request<FileRequest>,
    ) -> Result<Response<Self::GetFileStream>, Status> {
        let id = request
            .into_inner()
            .id
            .parse::<Id>()
            .map_err(ConvertError::from)?;
        let lease = self.coordinator.open_file(id)?;
        let mut file = tokio::fs::File::open(lease.path())
            .await
            .map_err(CoordinatorError::from)?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            // The lease pins the file until the transfer ends.
            let _lease = lease;
            loop {
                let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
                match file.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(Chunk { data: buf.freeze() })).await.is_err() {
                            debug!(file = %id, "download cancelled");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(file = %id, "failed to read file: {err}");
                        let _ = tx.send(Err(Status::internal(err.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn put_file(
        &self,
        request: Request<Streaming<FileChunk>>,
    ) -> Result<Response<PutFileResponse>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("empty upload"))?;
        let id = first.id.parse::<Id>().map_err(ConvertError::from)?;

        let chunks = tokio_stream::once(Ok(first.data)).chain(stream.map(|chunk| {
            chunk
                .map(|chunk| chunk.data)
                .map_err(|status| CoordinatorError::Upload(status.message().to_owned()))
        }));
        self.coordinator.put_file(id, chunks).await?;

        Ok(Response::new(PutFileResponse {}))
    }
}
