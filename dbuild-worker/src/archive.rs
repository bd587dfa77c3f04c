//! Artifacts travel between workers as tar archives of the artifact
//! directory.

use std::io;
use std::path::{Path, PathBuf};

/// Pack the contents of `dir` into an in-memory tar archive.
pub async fn pack(dir: &Path) -> io::Result<Vec<u8>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &dir)?;
        builder.into_inner()
    })
    .await?
}

/// Unpack `data` into `dir`, creating it if needed.
pub async fn unpack(data: Vec<u8>, dir: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        tar::Archive::new(data.as_slice()).unpack(&dir)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_survives_transfer() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(src.path().join("lib")).await.unwrap();
        tokio::fs::write(src.path().join("lib/a.o"), b"\x7fELF").await.unwrap();
        tokio::fs::write(src.path().join("README"), "hi").await.unwrap();

        let data = pack(src.path()).await.unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("artifact");
        unpack(data, target.clone()).await.unwrap();

        assert_eq!(tokio::fs::read(target.join("lib/a.o")).await.unwrap(), b"\x7fELF");
        assert_eq!(tokio::fs::read_to_string(target.join("README")).await.unwrap(), "hi");
    }
}
