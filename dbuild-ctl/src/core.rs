use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use tonic::transport::Channel;

//
// Import gRPC stubs/definitions.
//
use common::convert::parse_ids;
use common::coordinator::coordinator_client::CoordinatorClient;
use common::coordinator::{
    build_event::Event, BuildRequest, FileChunk, SignalRequest, UploadDone,
};
use common::{BuildGraph, Id, JobResult};

const CHUNK_SIZE: usize = 64 * 1024;

/// Read a build graph from a JSON file.
pub async fn read_graph(path: &Path) -> anyhow::Result<BuildGraph> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let graph: BuildGraph = serde_json::from_slice(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    graph.topological_order()?;
    Ok(graph)
}

/// Run a build, printing its progress. Returns whether it succeeded.
pub async fn build(address: String, graph: &Path, sources: &Path) -> anyhow::Result<bool> {
    let graph = read_graph(graph).await?;
    let names: HashMap<Id, &str> = graph
        .jobs
        .iter()
        .map(|job| (job.id, job.name.as_str()))
        .collect();

    let mut client = CoordinatorClient::connect(address).await?;
    let request = tonic::Request::new(BuildRequest {
        graph: Some((&graph).into()),
    });
    let mut events = client.start_build(request).await?.into_inner();

    let Some(Event::Started(started)) = events.message().await?.and_then(|e| e.event) else {
        bail!("coordinator did not acknowledge the build");
    };
    let missing = parse_ids(&started.missing_files)?;
    println!("[Build {}] {} jobs", started.id, graph.jobs.len());

    if !missing.is_empty() {
        println!("Uploading {} files...", missing.len());
        for id in &missing {
            let path = graph
                .source_files
                .get(id)
                .ok_or_else(|| anyhow!("coordinator asked for unknown file {id}"))?;
            upload(&mut client, *id, &sources.join(path)).await?;
        }

        let signal = tonic::Request::new(SignalRequest {
            build_id: started.id.clone(),
            upload_done: Some(UploadDone {}),
        });
        client.signal_build(signal).await?;
    }

    while let Some(event) = events.message().await? {
        match event.event {
            Some(Event::JobFinished(result)) => {
                let result = JobResult::try_from(result)?;
                let name = names.get(&result.id).copied().unwrap_or("?");
                print_result(name, &result);
            }
            Some(Event::BuildFailed(failed)) => {
                eprintln!("Build failed: {}", failed.error);
                return Ok(false);
            }
            Some(Event::BuildFinished(_)) => {
                println!("Build finished");
                return Ok(true);
            }
            Some(Event::Started(_)) | None => {}
        }
    }

    bail!("build stream ended unexpectedly")
}

fn print_result(name: &str, result: &JobResult) {
    let status = if result.is_failure() { "FAILED" } else { "ok" };
    println!("{} {} (exit {})", status, name, result.exit_code);

    if let Some(error) = &result.error {
        println!("  error: {}", error);
    }
    for line in String::from_utf8_lossy(&result.stdout).lines() {
        println!("  | {}", line);
    }
    for line in String::from_utf8_lossy(&result.stderr).lines() {
        println!("  ! {}", line);
    }
}

/// Split `data` into upload chunks. Only the first one carries the id.
fn chunks(id: Id, data: Bytes) -> Vec<FileChunk> {
    let mut chunks = Vec::with_capacity(data.len() / CHUNK_SIZE + 1);
    let mut offset = 0;
    loop {
        let end = (offset + CHUNK_SIZE).min(data.len());
        chunks.push(FileChunk {
            id: if offset == 0 { id.to_hex() } else { String::new() },
            data: data.slice(offset..end),
        });
        offset = end;
        if offset >= data.len() {
            return chunks;
        }
    }
}

async fn upload(client: &mut CoordinatorClient<Channel>, id: Id, path: &Path) -> anyhow::Result<()> {
    let data = Bytes::from(
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
    );
    if Id::of(&data) != id {
        bail!("{} changed since the build graph was written", path.display());
    }

    client
        .put_file(tokio_stream::iter(chunks(id, data)))
        .await
        .with_context(|| format!("uploading {}", path.display()))?;
    println!("  uploaded {}", path.display());
    Ok(())
}

/// Print the content id of a file.
pub async fn hash(path: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    println!("{}", Id::of(&data));
    Ok(())
}
