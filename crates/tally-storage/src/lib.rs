//! Store contracts for the registry and snapshot documents, with
//! filesystem-backed implementations and in-memory fakes for tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use tally_core::{Registry, SnapshotKey, SnapshotRecord};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tally-storage";

/// One queued upsert: a deterministic key plus the full document that
/// replaces whatever is stored under it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotWrite {
    pub key: SnapshotKey,
    pub record: SnapshotRecord,
}

/// Whole-document registry persistence. `load` returns `None` on a cold
/// start; `save` replaces the document in full. There is no merge, so at
/// most one run may write at a time (enforced by the deployment, not here).
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Registry>>;
    async fn save(&self, registry: &Registry) -> anyhow::Result<()>;
}

/// Snapshot document persistence. Each `commit` call is one atomic batch of
/// full-document upserts.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn commit(&self, batch: &[SnapshotWrite]) -> anyhow::Result<()>;
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .expect("document path always has a parent directory");
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating document directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp document {}", temp_path.display()))?;

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err)
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
    }
    Ok(())
}

/// Registry persisted as a single JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonRegistryStore {
    path: PathBuf,
}

impl JsonRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistryStore for JsonRegistryStore {
    async fn load(&self) -> anyhow::Result<Option<Registry>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading registry {}", self.path.display()))
            }
        };
        let registry = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing registry {}", self.path.display()))?;
        Ok(Some(registry))
    }

    async fn save(&self, registry: &Registry) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(registry).context("serializing registry")?;
        write_atomic(&self.path, &bytes).await?;
        debug!(profiles = registry.len(), path = %self.path.display(), "registry saved");
        Ok(())
    }
}

/// Snapshot documents laid out as `<root>/<entity_id>/<event_id>/<date>.json`,
/// one full JSON document per key.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, key: &SnapshotKey) -> PathBuf {
        self.root
            .join(key.entity_id.to_string())
            .join(&key.event_id)
            .join(format!("{}.json", key.date_id))
    }

    /// Read one stored snapshot document back, if present.
    pub async fn load(&self, key: &SnapshotKey) -> anyhow::Result<Option<SnapshotRecord>> {
        let path = self.document_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        Ok(Some(record))
    }

    async fn stage(
        &self,
        batch: &[SnapshotWrite],
        staged: &mut Vec<(PathBuf, PathBuf)>,
    ) -> anyhow::Result<()> {
        for write in batch {
            let dest = self.document_path(&write.key);
            let parent = dest
                .parent()
                .expect("document path always has a parent directory");
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
            let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
            let bytes =
                serde_json::to_vec_pretty(&write.record).context("serializing snapshot")?;
            fs::write(&temp, &bytes)
                .await
                .with_context(|| format!("staging snapshot {}", temp.display()))?;
            staged.push((temp, dest));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn commit(&self, batch: &[SnapshotWrite]) -> anyhow::Result<()> {
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(batch.len());
        if let Err(err) = self.stage(batch, &mut staged).await {
            for (temp, _) in &staged {
                let _ = fs::remove_file(temp).await;
            }
            return Err(err);
        }

        // Renames are the commit point. Each one is atomic; a failure partway
        // can leave earlier documents of the batch in place.
        for (index, (temp, dest)) in staged.iter().enumerate() {
            if let Err(err) = fs::rename(temp, dest).await {
                for (remaining, _) in &staged[index..] {
                    let _ = fs::remove_file(remaining).await;
                }
                return Err(err)
                    .with_context(|| format!("committing snapshot {}", dest.display()));
            }
        }
        debug!(documents = batch.len(), "snapshot batch committed");
        Ok(())
    }
}

/// In-memory registry store for tests.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    document: Mutex<Option<Registry>>,
}

impl MemoryRegistryStore {
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            document: Mutex::new(Some(registry)),
        }
    }

    /// The registry as last saved, if any.
    pub fn saved(&self) -> Option<Registry> {
        self.document.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load(&self) -> anyhow::Result<Option<Registry>> {
        Ok(self.document.lock().expect("lock poisoned").clone())
    }

    async fn save(&self, registry: &Registry) -> anyhow::Result<()> {
        *self.document.lock().expect("lock poisoned") = Some(registry.clone());
        Ok(())
    }
}

/// In-memory snapshot store for tests: records every committed batch size
/// and keeps the latest document per key.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    state: Mutex<MemorySnapshotState>,
}

#[derive(Debug, Default)]
struct MemorySnapshotState {
    commit_sizes: Vec<usize>,
    documents: BTreeMap<String, SnapshotWrite>,
}

fn memory_key(key: &SnapshotKey) -> String {
    format!("{}/{}/{}", key.entity_id, key.event_id, key.date_id)
}

impl MemorySnapshotStore {
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.state.lock().expect("lock poisoned").commit_sizes.clone()
    }

    pub fn document_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").documents.len()
    }

    pub fn record(&self, key: &SnapshotKey) -> Option<SnapshotRecord> {
        self.state
            .lock()
            .expect("lock poisoned")
            .documents
            .get(&memory_key(key))
            .map(|write| write.record.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn commit(&self, batch: &[SnapshotWrite]) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.commit_sizes.push(batch.len());
        for write in batch {
            state
                .documents
                .insert(memory_key(&write.key), write.clone());
        }
        Ok(())
    }
}

/// Snapshot store whose commits always fail, for containment tests.
#[derive(Debug, Default)]
pub struct FailingSnapshotStore;

#[async_trait]
impl SnapshotStore for FailingSnapshotStore {
    async fn commit(&self, _batch: &[SnapshotWrite]) -> anyhow::Result<()> {
        anyhow::bail!("snapshot store unavailable")
    }
}

/// Registry store whose reads and writes always fail, for degradation tests.
#[derive(Debug, Default)]
pub struct FailingRegistryStore;

#[async_trait]
impl RegistryStore for FailingRegistryStore {
    async fn load(&self) -> anyhow::Result<Option<Registry>> {
        anyhow::bail!("registry store unavailable")
    }

    async fn save(&self, _registry: &Registry) -> anyhow::Result<()> {
        anyhow::bail!("registry store unavailable")
    }
}
