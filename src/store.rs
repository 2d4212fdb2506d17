//! JSON persistence for datasets and alignment checkpoints.
//!
//! Every write lands in a sibling `.tmp` file first and is renamed into place, so a crash
//! leaves either the previous or the new version on disk.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alignment::ClusterTable;
use crate::model::VerifiedPair;

pub const STATE_FILE: &str = "alignment_state.json";
pub const CLUSTERS_FILE: &str = "clusters.json";
const BATCH_PREFIX: &str = "verified_batch_";
const BATCH_SUFFIX: &str = ".json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`read_json`], but a missing file is `None`.
pub fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match read_json(path) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    if let Err(e) = fs::write(&tmp_path, &data).and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(write_err(e));
    }
    debug!(path = %path.display(), bytes = data.len(), "wrote checkpoint");
    Ok(())
}

/// Which verification units are done, and the number of the next batch file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentState {
    #[serde(default)]
    pub processed: BTreeSet<String>,
    #[serde(default)]
    pub next_batch: usize,
}

/// Directory holding verified pair batches, the alignment state and the cluster table.
#[derive(Debug, Clone)]
pub struct CheckpointDir {
    root: PathBuf,
}

impl CheckpointDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Write {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn clusters_path(&self) -> PathBuf {
        self.root.join(CLUSTERS_FILE)
    }

    /// Loads the saved state. The batch counter never points at an existing batch file, even
    /// if the state file is older than the batches on disk.
    pub fn load_state(&self) -> Result<AlignmentState, StoreError> {
        let mut state: AlignmentState =
            read_json_if_exists(&self.root.join(STATE_FILE))?.unwrap_or_default();
        if let Some((last, _)) = self.batch_files()?.last() {
            state.next_batch = state.next_batch.max(last + 1);
        }
        Ok(state)
    }

    pub fn save_state(&self, state: &AlignmentState) -> Result<(), StoreError> {
        write_json_atomic(&self.root.join(STATE_FILE), state)
    }

    /// Existing `verified_batch_{n}.json` files, ordered by `n`.
    pub fn batch_files(&self) -> Result<Vec<(usize, PathBuf)>, StoreError> {
        let read_err = |source| StoreError::Read {
            path: self.root.clone(),
            source,
        };
        let mut batches = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let index = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(BATCH_PREFIX)?.strip_suffix(BATCH_SUFFIX)?.parse().ok());
            if let Some(index) = index {
                batches.push((index, path));
            }
        }
        batches.sort();
        Ok(batches)
    }

    pub fn write_batch(&self, index: usize, pairs: &[VerifiedPair]) -> Result<PathBuf, StoreError> {
        let path = self.root.join(format!("{BATCH_PREFIX}{index}{BATCH_SUFFIX}"));
        write_json_atomic(&path, pairs)?;
        Ok(path)
    }

    /// Every pair from every batch file, in batch order.
    pub fn load_pairs(&self) -> Result<Vec<VerifiedPair>, StoreError> {
        let mut pairs = Vec::new();
        for (_, path) in self.batch_files()? {
            let batch: Vec<VerifiedPair> = read_json(&path)?;
            pairs.extend(batch);
        }
        Ok(pairs)
    }

    pub fn write_clusters(&self, clusters: &ClusterTable) -> Result<(), StoreError> {
        write_json_atomic(&self.clusters_path(), clusters)
    }
}
