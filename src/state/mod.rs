//! The on-disk state store. Spec §1/§9 treat the store as an abstract, external
//! collaborator exposing only `Read{Aggregate}(fn)` / `Write{Aggregate}(fn) error`
//! primitives — never passed by import, always injected via [`Dependencies`] so
//! tests can substitute an isolated temp-dir instance.
//!
//! Grounded in the teacher's `project_store::ProjectStore` (JSON-per-aggregate-file
//! persistence, `fs::write`/`serde_json::to_string_pretty`, corrupt-file tolerance via
//! `tracing::warn!` + skip).

pub mod chats;
pub mod cron;
pub mod plan;
pub mod settings;
pub mod workspace;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub use chats::ChatsAggregate;
pub use cron::CronAggregate;
pub use settings::SettingsAggregate;

/// A single JSON-file-backed aggregate, guarded by an async `RwLock` so readers
/// never block each other and writers see a consistent snapshot (spec §5: "all
/// writes happen through `Write{Aggregate}(fn)` which provides serializable
/// semantics per aggregate").
pub struct StateStore<T> {
    path: PathBuf,
    cache: RwLock<T>,
}

impl<T> StateStore<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    pub fn open(dir: &Path, file_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;
        let path = dir.join(file_name);
        let cache = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        "Corrupt state file at {}: {}. Starting from default.",
                        path.display(),
                        e
                    );
                    T::default()
                }
            }
        } else {
            T::default()
        };
        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    /// `Read{Aggregate}(fn)`: run `f` against a read-only snapshot.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.cache.read().await;
        f(&guard)
    }

    /// `Write{Aggregate}(fn) error`: run `f` against a mutable snapshot and
    /// persist it atomically (write-to-temp + rename) if `f` succeeds.
    pub async fn write<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.cache.write().await;
        let result = f(&mut guard)?;
        self.persist(&guard)?;
        Ok(result)
    }

    fn persist(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming into {}", self.path.display()))?;
        Ok(())
    }
}

/// Dependency-injection bundle: every aggregate store plus the workspace file
/// root, handed to request handlers and the turn engine instead of global
/// statics (spec §9 "Global mutable state" design note).
pub struct Dependencies {
    pub chats: StateStore<ChatsAggregate>,
    pub cron: StateStore<CronAggregate>,
    pub settings: StateStore<SettingsAggregate>,
    pub workspace: workspace::WorkspaceStore,
}

impl Dependencies {
    pub fn open(data_dir: &Path) -> Result<Arc<Self>> {
        let state_dir = data_dir.join("state");
        Ok(Arc::new(Self {
            chats: StateStore::open(&state_dir, "chats.json")?,
            cron: StateStore::open(&state_dir, "cron.json")?,
            settings: StateStore::open(&state_dir, "settings.json")?,
            workspace: workspace::WorkspaceStore::new(data_dir.join("workspace")),
        }))
    }

    #[cfg(test)]
    pub fn open_temp(dir: &Path) -> Arc<Self> {
        Self::open(dir).expect("open temp state dir")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn write_then_reopen_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: StateStore<Counter> = StateStore::open(dir.path(), "counter.json").unwrap();
            store
                .write(|c| {
                    c.value += 1;
                    Ok(())
                })
                .await
                .unwrap();
        }
        let store: StateStore<Counter> = StateStore::open(dir.path(), "counter.json").unwrap();
        let value = store.read(|c| c.value).await;
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("counter.json"), "{not json").unwrap();
        let store: StateStore<Counter> = StateStore::open(dir.path(), "counter.json").unwrap();
        assert_eq!(store.read(|c| c.value).await, 0);
    }
}
