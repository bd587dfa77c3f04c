//! Shared types for the distributed build: content ids, the build graph,
//! job specs and results, the gRPC stubs, and a content-addressed blob
//! store used by both the coordinator and the workers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod cache;
pub mod convert;

pub mod coordinator {
    tonic::include_proto!("coordinator");
}

pub mod worker {
    tonic::include_proto!("worker");
}

/////////////////////////////////////////////////////////////////////////////
// Identifiers
/////////////////////////////////////////////////////////////////////////////

/// Length of an [`Id`] in bytes.
pub const ID_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid id `{0}`: expected {len} hex characters", len = ID_LEN * 2)]
    Length(String),

    #[error("invalid id `{0}`: not hex")]
    NotHex(String),
}

/// Content hash identifying a job or a blob.
///
/// The textual form is the lowercase hex encoding of the SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Hash arbitrary content.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// A fresh random id. Used for build identifiers.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Computes an [`Id`] over content that arrives in pieces.
#[derive(Clone, Default)]
pub struct IdHasher(Sha256);

impl IdHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.0.update(data.as_ref());
    }

    pub fn finish(self) -> Id {
        Id(self.0.finalize().into())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable.
        write!(f, "Id({})", &self.to_hex()[..12])
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN * 2 {
            return Err(IdError::Length(s.to_owned()));
        }
        let mut bytes = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| IdError::NotHex(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Id {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Id> for String {
    fn from(id: Id) -> Self {
        id.to_hex()
    }
}

/// Stable identity of a worker. It is also the address the worker serves
/// artifacts on, e.g. `127.0.0.1:9001`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL used to dial the worker's gRPC server.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/////////////////////////////////////////////////////////////////////////////
// Build graph
/////////////////////////////////////////////////////////////////////////////

/// A single command of a job, as an argv vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    pub exec: Vec<String>,
}

/// A node of the build graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,

    /// Human readable name, only used for logging.
    #[serde(default)]
    pub name: String,

    /// Jobs whose artifacts must exist before this job runs.
    #[serde(default)]
    pub deps: Vec<Id>,

    #[serde(default)]
    pub cmds: Vec<Cmd>,
}

/// Everything a worker needs to run a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub job: Job,

    /// Source file id -> path relative to the source directory.
    pub source_files: HashMap<Id, String>,

    /// Dependency id -> worker believed to hold that dependency's artifact.
    pub artifacts: HashMap<Id, WorkerId>,
}

impl JobSpec {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            source_files: HashMap::new(),
            artifacts: HashMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> Id {
        self.job.id
    }
}

/// Outcome of a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobResult {
    pub id: Id,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,

    /// Set when the job failed outside of the process exit channel,
    /// e.g. the command could not be started.
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(id: Id) -> Self {
        Self {
            id,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: 0,
            error: None,
        }
    }

    pub fn failed(id: Id, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::success(id)
        }
    }

    /// A job failed if it reported an error or exited non-zero.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.exit_code != 0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("job {0} appears more than once")]
    DuplicateJob(Id),

    #[error("job {job} depends on {dep}, which is not part of the graph")]
    UnknownDependency { job: Id, dep: Id },

    #[error("dependency cycle through job {0}")]
    Cycle(Id),
}

/// A build request: the source files it needs and the jobs to run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildGraph {
    #[serde(default)]
    pub source_files: HashMap<Id, String>,

    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl BuildGraph {
    /// Check the graph and return its jobs in dependency order.
    pub fn topological_order(&self) -> Result<Vec<&Job>, GraphError> {
        let mut by_id: HashMap<Id, &Job> = HashMap::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if by_id.insert(job.id, job).is_some() {
                return Err(GraphError::DuplicateJob(job.id));
            }
        }

        let mut indegree: HashMap<Id, usize> = HashMap::with_capacity(self.jobs.len());
        let mut dependents: HashMap<Id, Vec<Id>> = HashMap::new();
        for job in &self.jobs {
            let unique: HashSet<&Id> = job.deps.iter().collect();
            for dep in unique {
                if !by_id.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        job: job.id,
                        dep: *dep,
                    });
                }
                dependents.entry(*dep).or_default().push(job.id);
            }
            indegree.insert(job.id, job.deps.iter().collect::<HashSet<_>>().len());
        }

        let mut ready: VecDeque<Id> = self
            .jobs
            .iter()
            .filter(|job| indegree[&job.id] == 0)
            .map(|job| job.id)
            .collect();

        let mut order = Vec::with_capacity(self.jobs.len());
        while let Some(id) = ready.pop_front() {
            order.push(by_id[&id]);
            for next in dependents.get(&id).into_iter().flatten() {
                if let Some(remaining) = indegree.get_mut(next) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }

        // Jobs left with unmet deps sit on a cycle.
        if let Some(stuck) = self.jobs.iter().find(|job| indegree[&job.id] > 0) {
            return Err(GraphError::Cycle(stuck.id));
        }

        Ok(order)
    }
}
