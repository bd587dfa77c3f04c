//! Conversions between the domain types and the generated protobuf types.
//!
//! NOTE: These are TIGHTLY coupled with the stubs generated from
//!       `protos/coordinator.proto`. If you change the proto, propagate
//!       the change here.

use std::collections::HashMap;

use thiserror::Error;

use crate::coordinator as pb;
use crate::{BuildGraph, Cmd, Id, IdError, Job, JobResult, JobSpec, WorkerId};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConvertError {
    #[error(transparent)]
    Id(#[from] IdError),

    #[error("missing field `{0}`")]
    MissingField(&'static str),
}

impl From<ConvertError> for tonic::Status {
    fn from(err: ConvertError) -> Self {
        tonic::Status::invalid_argument(err.to_string())
    }
}

/// Parse a list of hex ids.
pub fn parse_ids(ids: &[String]) -> Result<Vec<Id>, ConvertError> {
    ids.iter()
        .map(|id| id.parse::<Id>().map_err(ConvertError::from))
        .collect()
}

pub fn format_ids(ids: &[Id]) -> Vec<String> {
    ids.iter().map(Id::to_hex).collect()
}

impl From<&Job> for pb::Job {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_hex(),
            name: job.name.clone(),
            deps: format_ids(&job.deps),
            cmds: job
                .cmds
                .iter()
                .map(|cmd| pb::Cmd {
                    exec: cmd.exec.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<pb::Job> for Job {
    type Error = ConvertError;

    fn try_from(job: pb::Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: job.id.parse()?,
            name: job.name,
            deps: parse_ids(&job.deps)?,
            cmds: job.cmds.into_iter().map(|cmd| Cmd { exec: cmd.exec }).collect(),
        })
    }
}

impl From<&JobSpec> for pb::JobSpec {
    fn from(spec: &JobSpec) -> Self {
        Self {
            job: Some((&spec.job).into()),
            source_files: spec
                .source_files
                .iter()
                .map(|(id, path)| (id.to_hex(), path.clone()))
                .collect(),
            artifacts: spec
                .artifacts
                .iter()
                .map(|(id, worker)| (id.to_hex(), worker.to_string()))
                .collect(),
        }
    }
}

impl TryFrom<pb::JobSpec> for JobSpec {
    type Error = ConvertError;

    fn try_from(spec: pb::JobSpec) -> Result<Self, Self::Error> {
        let job = spec.job.ok_or(ConvertError::MissingField("job"))?;

        let source_files = spec
            .source_files
            .into_iter()
            .map(|(id, path)| Ok((id.parse::<Id>()?, path)))
            .collect::<Result<HashMap<_, _>, ConvertError>>()?;

        let artifacts = spec
            .artifacts
            .into_iter()
            .map(|(id, worker)| Ok((id.parse::<Id>()?, WorkerId::from(worker))))
            .collect::<Result<HashMap<_, _>, ConvertError>>()?;

        Ok(Self {
            job: job.try_into()?,
            source_files,
            artifacts,
        })
    }
}

impl From<&JobResult> for pb::JobResult {
    fn from(result: &JobResult) -> Self {
        Self {
            job_id: result.id.to_hex(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
            error: result.error.clone(),
        }
    }
}

impl TryFrom<pb::JobResult> for JobResult {
    type Error = ConvertError;

    fn try_from(result: pb::JobResult) -> Result<Self, Self::Error> {
        Ok(Self {
            id: result.job_id.parse()?,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            error: result.error,
        })
    }
}

impl From<&BuildGraph> for pb::BuildGraph {
    fn from(graph: &BuildGraph) -> Self {
        Self {
            source_files: graph
                .source_files
                .iter()
                .map(|(id, path)| (id.to_hex(), path.clone()))
                .collect(),
            jobs: graph.jobs.iter().map(pb::Job::from).collect(),
        }
    }
}

impl TryFrom<pb::BuildGraph> for BuildGraph {
    type Error = ConvertError;

    fn try_from(graph: pb::BuildGraph) -> Result<Self, Self::Error> {
        let source_files = graph
            .source_files
            .into_iter()
            .map(|(id, path)| Ok((id.parse::<Id>()?, path)))
            .collect::<Result<HashMap<_, _>, ConvertError>>()?;

        let jobs = graph
            .jobs
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { source_files, jobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_spec_through_proto() {
        let dep = Id::of("dep");
        let file = Id::of("main.c");
        let mut spec = JobSpec::new(Job {
            id: Id::of("job"),
            name: "compile".into(),
            deps: vec![dep],
            cmds: vec![Cmd {
                exec: vec!["cc".into(), "-c".into(), "main.c".into()],
            }],
        });
        spec.source_files.insert(file, "src/main.c".into());
        spec.artifacts.insert(dep, WorkerId::from("127.0.0.1:9001"));

        let wire = pb::JobSpec::from(&spec);
        assert_eq!(wire.artifacts[&dep.to_hex()], "127.0.0.1:9001");
        assert_eq!(JobSpec::try_from(wire).unwrap(), spec);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let wire = pb::JobResult {
            job_id: "not-an-id".into(),
            ..Default::default()
        };
        assert!(matches!(
            JobResult::try_from(wire),
            Err(ConvertError::Id(IdError::Length(_)))
        ));

        let spec = pb::JobSpec::default();
        assert_eq!(
            JobSpec::try_from(spec),
            Err(ConvertError::MissingField("job"))
        );
    }
}
