use thiserror::Error;
use tonic::Status;

use common::cache::CacheError;
use common::convert::ConvertError;
use common::{GraphError, Id};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("invalid build graph: {0}")]
    Graph(#[from] GraphError),

    #[error("build {0} not found")]
    UnknownBuild(Id),

    #[error("upload interrupted: {0}")]
    Upload(String),

    #[error("uploaded content hashes to {actual}, not {expected}")]
    ContentMismatch { expected: Id, actual: Id },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for CoordinatorError {
    fn from(err: std::io::Error) -> Self {
        CoordinatorError::Cache(err.into())
    }
}

impl From<CoordinatorError> for Status {
    fn from(err: CoordinatorError) -> Self {
        match &err {
            CoordinatorError::Convert(_)
            | CoordinatorError::Graph(_)
            | CoordinatorError::ContentMismatch { .. } => {
                Status::invalid_argument(err.to_string())
            }
            CoordinatorError::UnknownBuild(_) | CoordinatorError::Cache(CacheError::NotFound(_)) => {
                Status::not_found(err.to_string())
            }
            CoordinatorError::Upload(_) => Status::aborted(err.to_string()),
            CoordinatorError::ShuttingDown => Status::unavailable(err.to_string()),
            CoordinatorError::Cache(_) => Status::internal(err.to_string()),
        }
    }
}
