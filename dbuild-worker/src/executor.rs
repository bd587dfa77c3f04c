use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tonic::transport::Channel;
use tracing::{debug, info};

use common::cache::{Cache, CacheError, Lease, WriteTx};
use common::coordinator::FileRequest;
use common::worker::ArtifactRequest;
use common::{Id, JobResult, JobSpec, WorkerId};

use crate::archive;
use crate::core::{CoordinatorClient, WorkerClient};

/// Environment variable pointing at the directory a job writes its
/// artifact into.
pub const OUTPUT_DIR: &str = "OUTPUT_DIR";

/// Prefix of the environment variables pointing at dependency artifacts,
/// followed by the dependency's hex id.
pub const DEP_PREFIX: &str = "DEP_";

const WRITE_RETRY: Duration = Duration::from_millis(10);

/// What running a job left behind.
#[derive(Debug)]
pub struct Outcome {
    pub result: JobResult,

    /// Dependency artifacts downloaded from peers for this job. They are
    /// now served by this worker too.
    pub fetched: Vec<Id>,
}

/// Runs jobs on this machine.
#[derive(Debug, Clone)]
pub struct Executor {
    coordinator: CoordinatorClient<Channel>,
    files: Cache,
    artifacts: Cache,
}

impl Executor {
    pub fn new(coordinator: CoordinatorClient<Channel>, files: Cache, artifacts: Cache) -> Self {
        Self {
            coordinator,
            files,
            artifacts,
        }
    }

    pub fn artifacts(&self) -> &Cache {
        &self.artifacts
    }

    /// Run a job to completion. Errors that keep the job from running at all
    /// are reported through [`JobResult::error`].
    pub async fn run(&self, spec: &JobSpec) -> Outcome {
        let id = spec.id();
        let mut fetched = Vec::new();

        let result = if self.artifacts.contains(&id) {
            debug!(job = %id, "artifact already cached");
            JobResult::success(id)
        } else {
            match self.execute(spec, &mut fetched).await {
                Ok(result) => result,
                Err(err) => {
                    info!(job = %id, "job could not run: {err:#}");
                    JobResult::failed(id, format!("{err:#}"))
                }
            }
        };

        Outcome { result, fetched }
    }

    async fn execute(&self, spec: &JobSpec, fetched: &mut Vec<Id>) -> anyhow::Result<JobResult> {
        let id = spec.id();
        let workdir = tempfile::tempdir().context("creating source directory")?;

        for (file, path) in &spec.source_files {
            let target = workdir.path().join(checked_relative(path)?);
            let lease = self
                .fetch_file(*file)
                .await
                .with_context(|| format!("fetching source file {path}"))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(lease.path(), &target).await?;
        }

        let mut deps = HashMap::with_capacity(spec.job.deps.len());
        for dep in &spec.job.deps {
            let lease = self
                .fetch_artifact(*dep, spec.artifacts.get(dep), fetched)
                .await
                .with_context(|| format!("fetching artifact of dependency {dep}"))?;
            deps.insert(*dep, lease);
        }

        let output = match self.artifacts.create(id) {
            Ok(tx) => tx,
            // Another slot is building the same job.
            Err(CacheError::WriteInProgress(_)) | Err(CacheError::AlreadyExists(_)) => {
                self.wait_for_artifact(id).await?;
                return Ok(JobResult::success(id));
            }
            Err(err) => return Err(err.into()),
        };
        tokio::fs::create_dir_all(output.path()).await?;

        let mut result = JobResult::success(id);
        for cmd in &spec.job.cmds {
            let Some((program, args)) = cmd.exec.split_first() else {
                bail!("job {} has an empty command", spec.job.name);
            };

            let mut command = Command::new(program);
            command
                .args(args)
                .current_dir(workdir.path())
                .env(OUTPUT_DIR, output.path())
                .stdin(Stdio::null())
                .kill_on_drop(true);
            for (dep, lease) in &deps {
                command.env(format!("{DEP_PREFIX}{}", dep.to_hex()), lease.path());
            }

            debug!(job = %id, ?cmd.exec, "running command");
            let out = command
                .output()
                .await
                .with_context(|| format!("starting {program}"))?;
            result.stdout.extend_from_slice(&out.stdout);
            result.stderr.extend_from_slice(&out.stderr);

            if !out.status.success() {
                result.exit_code = out.status.code().unwrap_or(-1);
                break;
            }
        }

        if result.is_failure() {
            output.abort().await?;
        } else {
            output.commit().await?;
            info!(job = %id, name = %spec.job.name, "job succeeded");
        }
        Ok(result)
    }

    async fn wait_for_artifact(&self, id: Id) -> anyhow::Result<()> {
        loop {
            if self.artifacts.contains(&id) {
                return Ok(());
            }
            match self.artifacts.create(id) {
                Err(CacheError::WriteInProgress(_)) => tokio::time::sleep(WRITE_RETRY).await,
                Err(CacheError::AlreadyExists(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
                Ok(tx) => {
                    tx.abort().await?;
                    bail!("concurrent build of {id} failed");
                }
            }
        }
    }

    /// Lease a source file, downloading it from the coordinator if needed.
    async fn fetch_file(&self, id: Id) -> anyhow::Result<Lease> {
        loop {
            if let Ok(lease) = self.files.get(id) {
                return Ok(lease);
            }

            match self.files.create(id) {
                Ok(tx) => self.download_file(tx).await?,
                Err(CacheError::WriteInProgress(_)) => tokio::time::sleep(WRITE_RETRY).await,
                Err(CacheError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn download_file(&self, tx: WriteTx) -> anyhow::Result<()> {
        let request = FileRequest {
            id: tx.id().to_hex(),
        };
        let mut stream = self
            .coordinator
            .clone()
            .get_file(request)
            .await?
            .into_inner();

        let mut file = tokio::fs::File::create(tx.path()).await?;
        while let Some(chunk) = stream.message().await? {
            file.write_all(&chunk.data).await?;
        }
        file.sync_all().await?;
        drop(file);

        debug!(file = %tx.id(), "downloaded source file");
        tx.commit().await?;
        Ok(())
    }

    /// Lease a dependency's artifact, fetching it from `peer` if needed.
    async fn fetch_artifact(
        &self,
        id: Id,
        peer: Option<&WorkerId>,
        fetched: &mut Vec<Id>,
    ) -> anyhow::Result<Lease> {
        loop {
            if let Ok(lease) = self.artifacts.get(id) {
                return Ok(lease);
            }

            match self.artifacts.create(id) {
                Ok(tx) => {
                    let peer = peer.ok_or_else(|| anyhow!("no known location"))?;
                    self.download_artifact(tx, peer).await?;
                    fetched.push(id);
                }
                Err(CacheError::WriteInProgress(_)) => tokio::time::sleep(WRITE_RETRY).await,
                Err(CacheError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn download_artifact(&self, tx: WriteTx, peer: &WorkerId) -> anyhow::Result<()> {
        let mut client = WorkerClient::connect(peer.endpoint())
            .await
            .with_context(|| format!("connecting to {peer}"))?;
        let request = ArtifactRequest {
            id: tx.id().to_hex(),
        };
        let mut stream = client.get_artifact(request).await?.into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await? {
            data.extend_from_slice(&chunk.data);
        }
        archive::unpack(data, tx.path().to_path_buf()).await?;

        debug!(artifact = %tx.id(), %peer, "downloaded artifact");
        tx.commit().await?;
        Ok(())
    }
}

/// Reject paths that would escape the source directory.
fn checked_relative(path: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || path.as_os_str().is_empty() {
        bail!("invalid source path {}", path.display());
    }
    Ok(path.to_path_buf())
}
