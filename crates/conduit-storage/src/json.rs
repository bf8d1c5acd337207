//! One JSON file per key.
//!
//! `["config", "servers"]` lives at `<root>/config/servers.json`. Writes go
//! to a hidden sibling temp file that is renamed into place, so a CLI
//! process and a running supervisor can share the directory.

use crate::{validate_key, validate_segment, Storage, StorageError, StorageResult};
use crate::{WatchCallback, WatchGuard};
use async_trait::async_trait;
use notify::{EventKind, RecursiveMode, Watcher};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, trace, warn};

const EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct JsonStorage {
    root: PathBuf,
}

impl JsonStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key`.
    pub fn path_for(&self, key: &[&str]) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.clone();
        path.extend(key);
        path.set_extension(EXTENSION);
        Ok(path)
    }

    fn dir_for(&self, prefix: &[&str]) -> StorageResult<PathBuf> {
        for segment in prefix {
            validate_segment(segment)?;
        }
        let mut dir = self.root.clone();
        dir.extend(prefix);
        Ok(dir)
    }
}

/// `.servers.json.<pid>.<n>.tmp` next to `servers.json`.
fn temp_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    target.with_file_name(name)
}

#[async_trait]
impl Storage for JsonStorage {
    async fn read<T: DeserializeOwned + Send>(&self, key: &[&str]) -> StorageResult<Option<T>> {
        let path = self.path_for(key)?;
        trace!(path = %path.display(), "Reading");

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        let value: serde_json::Value = serde_json::from_slice(&content)
            .map_err(|source| StorageError::Corrupt {
                path: path.clone(),
                source,
            })?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StorageError::Shape {
                key: key.join("/"),
                source,
            })
    }

    async fn write<T: Serialize + Send + Sync>(
        &self,
        key: &[&str],
        value: &T,
    ) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let mut content = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode {
            key: key.join("/"),
            source,
        })?;
        content.push(b'\n');

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }

        let temp = temp_path(&path);
        if let Err(e) = fs::write(&temp, &content).await {
            return Err(StorageError::io(temp, e));
        }
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::io(path, e));
        }
        debug!(path = %path.display(), bytes = content.len(), "Wrote");
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn list(&self, prefix: &[&str]) -> StorageResult<Vec<Vec<String>>> {
        let dir = self.dir_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };

        let mut keys = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(StorageError::io(&dir, e)),
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let mut key: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
            key.push(stem.to_string());
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    fn watch(&self, key: &[&str], on_change: WatchCallback) -> StorageResult<WatchGuard> {
        let path = self.path_for(key)?;
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(StorageError::invalid_key(key.join("/")));
        };
        let dir = dir.to_path_buf();
        let file_name = file_name.to_os_string();

        // The rename in `write` replaces the inode, so watch the directory.
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let watched = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(path = %watched.display(), error = %e, "Watcher error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                on_change();
            }
        })
        .map_err(|source| StorageError::Watch {
            path: path.clone(),
            source,
        })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| StorageError::Watch {
                path: dir.clone(),
                source,
            })?;
        debug!(path = %path.display(), "Watching");

        Ok(WatchGuard::holding(watcher))
    }
}
