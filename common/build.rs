fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the proto files via `prost`, generating service stubs
    // and proto definitions for use with `tonic`. Chunk payloads are
    // generated as `Bytes` so they can be forwarded without copying.
    tonic_build::configure()
        .bytes([
            ".coordinator.Chunk.data",
            ".coordinator.FileChunk.data",
            ".worker.ArtifactChunk.data",
        ])
        .compile(
            &["../protos/coordinator.proto", "../protos/worker.proto"],
            &["../protos"],
        )?;
    Ok(())
}
