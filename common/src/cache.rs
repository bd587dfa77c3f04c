//! Content-addressed blob store on the local filesystem.
//!
//! A blob is either a single file (source files) or a directory (job
//! artifacts), stored under `<root>/<hex id>`. Writers stage into
//! `<root>/tmp` and publish with an atomic rename, so readers never observe
//! a partially written blob. Readers hold a [`Lease`] which pins the blob
//! until it is released.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::Id;

const STAGING_DIR: &str = "tmp";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("blob {0} not found")]
    NotFound(Id),

    #[error("blob {0} already exists")]
    AlreadyExists(Id),

    #[error("blob {0} is being written")]
    WriteInProgress(Id),

    #[error("blob {0} is leased")]
    Busy(Id),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// A write transaction is open.
    Writing,

    /// Committed, with the number of outstanding leases.
    Ready { leases: usize },
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    entries: Mutex<HashMap<Id, Entry>>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<Id, Entry>> {
        // A poisoned lock only means another thread panicked while holding a
        // plain map; the map itself is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn blob_path(&self, id: &Id) -> PathBuf {
        self.root.join(id.to_hex())
    }
}

/// Handle to a blob store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl Cache {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Blobs committed by a previous process are picked up again, and
    /// leftovers of interrupted writes are discarded.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);

        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let mut entries = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|name| name.parse::<Id>().ok()) {
                entries.insert(id, Entry::Ready { leases: 0 });
            }
        }
        debug!(root = %root.display(), blobs = entries.len(), "opened blob store");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                entries: Mutex::new(entries),
            }),
        })
    }

    /// Whether a committed blob exists for `id`.
    pub fn contains(&self, id: &Id) -> bool {
        matches!(self.inner.entries().get(id), Some(Entry::Ready { .. }))
    }

    /// Ids of all committed blobs.
    pub fn list(&self) -> Vec<Id> {
        self.inner
            .entries()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Ready { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Open a write transaction for `id`.
    ///
    /// At most one transaction per id is open at any time; a concurrent
    /// writer gets [`CacheError::WriteInProgress`].
    pub fn create(&self, id: Id) -> Result<WriteTx, CacheError> {
        {
            let mut entries = self.inner.entries();
            match entries.get(&id) {
                Some(Entry::Writing) => return Err(CacheError::WriteInProgress(id)),
                Some(Entry::Ready { .. }) => return Err(CacheError::AlreadyExists(id)),
                None => {
                    entries.insert(id, Entry::Writing);
                }
            }
        }

        let suffix: u64 = rand::thread_rng().gen();
        let path = self
            .inner
            .root
            .join(STAGING_DIR)
            .join(format!("{}-{:016x}", id.to_hex(), suffix));

        Ok(WriteTx {
            id,
            path,
            inner: self.inner.clone(),
            finished: false,
        })
    }

    /// Lease a committed blob for reading.
    pub fn get(&self, id: Id) -> Result<Lease, CacheError> {
        let mut entries = self.inner.entries();
        match entries.get_mut(&id) {
            Some(Entry::Ready { leases }) => {
                *leases += 1;
                Ok(Lease {
                    id,
                    path: self.inner.blob_path(&id),
                    inner: self.inner.clone(),
                })
            }
            _ => Err(CacheError::NotFound(id)),
        }
    }

    /// Delete a committed blob. Fails while any lease on it is held.
    pub async fn remove(&self, id: Id) -> Result<(), CacheError> {
        {
            let mut entries = self.inner.entries();
            match entries.get(&id) {
                None => return Err(CacheError::NotFound(id)),
                Some(Entry::Writing) => return Err(CacheError::WriteInProgress(id)),
                Some(Entry::Ready { leases }) if *leases > 0 => return Err(CacheError::Busy(id)),
                Some(Entry::Ready { .. }) => {
                    entries.remove(&id);
                }
            }
        }

        remove_path(&self.inner.blob_path(&id)).await?;
        Ok(())
    }
}

/// An open write transaction.
///
/// Write a file or a directory at [`WriteTx::path`], then [`commit`]. Dropping
/// the transaction without committing aborts it.
///
/// [`commit`]: WriteTx::commit
#[derive(Debug)]
pub struct WriteTx {
    id: Id,
    path: PathBuf,
    inner: Arc<Inner>,
    finished: bool,
}

impl WriteTx {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Staging location for the blob's content.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically publish the staged content.
    pub async fn commit(mut self) -> Result<(), CacheError> {
        self.finished = true;

        if let Err(err) = tokio::fs::rename(&self.path, self.inner.blob_path(&self.id)).await {
            self.inner.entries().remove(&self.id);
            let _ = remove_path(&self.path).await;
            return Err(err.into());
        }

        self.inner
            .entries()
            .insert(self.id, Entry::Ready { leases: 0 });
        debug!(blob = %self.id, "committed blob");
        Ok(())
    }

    /// Discard the staged content.
    pub async fn abort(mut self) -> Result<(), CacheError> {
        self.finished = true;
        self.inner.entries().remove(&self.id);
        remove_path(&self.path).await?;
        Ok(())
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        self.inner.entries().remove(&self.id);
        let result = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        if let Err(err) = result {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(blob = %self.id, "failed to clean up staged blob: {err}");
            }
        }
    }
}

/// A read lease on a committed blob. The blob is neither replaced nor
/// removed while the lease is held.
#[derive(Debug)]
pub struct Lease {
    id: Id,
    path: PathBuf,
    inner: Arc<Inner>,
}

impl Lease {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up the lease. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(Entry::Ready { leases }) = self.inner.entries().get_mut(&self.id) {
            *leases = leases.saturating_sub(1);
        }
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
