use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::layout::{METADATA_DIR, UPGRADING_SUFFIX};

/// Stand-in for a blank version when composing metadata paths.
pub const UNKNOWN_VERSION: &str = "unknown";

/// `YYYYMMDDHHMMSS.mmm` in UTC; lexical order is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%.3f";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("cannot create metadata path with empty version")]
    EmptyVersion,

    #[error("invalid metadata version '{0}'")]
    InvalidVersion(String),

    #[error("cannot create metadata path when timestamp is :latest")]
    CreateLatest,

    #[error("cannot create metadata subdir for empty leaf")]
    EmptyLeaf,

    #[error("failed to access metadata path {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    /// Lexically greatest existing snapshot; never created.
    Latest,
    /// A fresh timestamp for the current instant.
    Now,
    Literal(String),
}

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Versioned, timestamped snapshots under `<cask dir>/.metadata/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataStore {
    cask_dir: PathBuf,
}

impl MetadataStore {
    pub fn new(cask_dir: impl Into<PathBuf>) -> Self {
        Self {
            cask_dir: cask_dir.into(),
        }
    }

    pub fn main_container_path(&self) -> PathBuf {
        self.cask_dir.join(METADATA_DIR)
    }

    pub fn versioned_path(&self, version: Option<&str>) -> Result<PathBuf, MetadataError> {
        let version = match version.map(str::trim) {
            Some(value) if !value.is_empty() => value,
            _ => UNKNOWN_VERSION,
        };
        if version.is_empty() {
            return Err(MetadataError::EmptyVersion);
        }
        if version.contains('/') || version.contains('\\') || version == "." || version == ".." {
            return Err(MetadataError::InvalidVersion(version.to_string()));
        }
        Ok(self.main_container_path().join(version))
    }

    /// Resolves the snapshot directory; `Ok(None)` when `Latest` finds none.
    pub fn timestamped_path(
        &self,
        version: Option<&str>,
        timestamp: &Timestamp,
        create: bool,
    ) -> Result<Option<PathBuf>, MetadataError> {
        let versioned = self.versioned_path(version)?;
        let stamp = match timestamp {
            Timestamp::Latest => {
                if create {
                    return Err(MetadataError::CreateLatest);
                }
                match latest_child(&versioned)? {
                    Some(stamp) => stamp,
                    None => return Ok(None),
                }
            }
            Timestamp::Now => now_timestamp(),
            Timestamp::Literal(value) => value.clone(),
        };

        let path = versioned.join(stamp);
        if create {
            create_dir(&path)?;
        }
        Ok(Some(path))
    }

    pub fn subdir(
        &self,
        leaf: &str,
        version: Option<&str>,
        timestamp: &Timestamp,
        create: bool,
    ) -> Result<Option<PathBuf>, MetadataError> {
        if leaf.trim().is_empty() {
            return Err(MetadataError::EmptyLeaf);
        }
        if create && *timestamp == Timestamp::Latest {
            return Err(MetadataError::CreateLatest);
        }
        let Some(parent) = self.timestamped_path(version, timestamp, create)? else {
            return Ok(None);
        };

        let path = parent.join(leaf);
        if create {
            create_dir(&path)?;
        }
        Ok(Some(path))
    }

    /// Versions with metadata, excluding upgrade backups, sorted lexically.
    pub fn versions(&self) -> Result<Vec<String>, MetadataError> {
        Ok(child_names(&self.main_container_path())?
            .into_iter()
            .filter(|name| !name.ends_with(UPGRADING_SUFFIX))
            .collect())
    }

    /// The `leaf` directory of the most recent snapshot across all versions,
    /// with the version it belongs to.
    pub fn latest_subdir(&self, leaf: &str) -> Result<Option<(String, PathBuf)>, MetadataError> {
        if leaf.trim().is_empty() {
            return Err(MetadataError::EmptyLeaf);
        }

        let mut newest: Option<(String, String)> = None;
        for version in self.versions()? {
            let versioned = self.main_container_path().join(&version);
            if let Some(stamp) = latest_child(&versioned)? {
                let is_newer = newest
                    .as_ref()
                    .map_or(true, |(_, current)| stamp > *current);
                if is_newer && versioned.join(&stamp).join(leaf).is_dir() {
                    newest = Some((version, stamp));
                }
            }
        }

        Ok(newest.map(|(version, stamp)| {
            let path = self.main_container_path().join(&version).join(stamp).join(leaf);
            (version, path)
        }))
    }
}

fn latest_child(dir: &Path) -> Result<Option<String>, MetadataError> {
    Ok(child_names(dir)?.into_iter().max())
}

fn child_names(dir: &Path) -> Result<Vec<String>, MetadataError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(MetadataError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MetadataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn create_dir(path: &Path) -> Result<(), MetadataError> {
    fs::create_dir_all(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })
}
