use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use caskpack_core::{is_valid_token, TapName, CASK_METADATA_LEAF};
use tracing::debug;

use crate::layout::{CaskLayout, UPGRADING_SUFFIX};
use crate::metadata::MetadataStore;

/// Extension of the file saved next to an installed caskfile that names the
/// tap the cask was installed from.
pub const INSTALLED_TAP_EXTENSION: &str = "tap";

/// Installed casks: one directory per token under `<prefix>/Caskroom/`.
/// A token is installed exactly when its directory exists.
#[derive(Debug, Clone)]
pub struct Caskroom {
    layout: CaskLayout,
}

impl Caskroom {
    pub fn new(layout: CaskLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &CaskLayout {
        &self.layout
    }

    pub fn path(&self) -> PathBuf {
        self.layout.caskroom_dir()
    }

    pub fn is_installed(&self, token: &str) -> bool {
        self.layout.cask_dir(token).is_dir()
    }

    pub fn metadata(&self, token: &str) -> MetadataStore {
        MetadataStore::new(self.layout.cask_dir(token))
    }

    /// Installed tokens, sorted. Hidden entries and stray files are ignored.
    pub fn tokens(&self) -> Result<Vec<String>> {
        let root = self.path();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut tokens = Vec::new();
        for entry in
            fs::read_dir(&root).with_context(|| format!("failed reading {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if !is_valid_token(&name) {
                debug!("ignoring Caskroom entry with invalid token: {name}");
                continue;
            }
            tokens.push(name);
        }
        tokens.sort();
        Ok(tokens)
    }

    /// Staged version directories present for `token`, backups excluded.
    pub fn staged_versions(&self, token: &str) -> Result<Vec<String>> {
        let dir = self.layout.cask_dir(token);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("failed reading {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && !name.ends_with(UPGRADING_SUFFIX) {
                    versions.push(name.to_string());
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Version recorded by the most recent metadata snapshot, falling back to
    /// the staged directories.
    pub fn installed_version(&self, token: &str) -> Result<Option<String>> {
        if let Some((version, _)) = self.metadata(token).latest_subdir(CASK_METADATA_LEAF)? {
            return Ok(Some(version));
        }
        Ok(self.staged_versions(token)?.pop())
    }

    /// Definition file saved at install time, if any.
    pub fn installed_caskfile(&self, token: &str) -> Result<Option<PathBuf>> {
        let Some((_, dir)) = self.metadata(token).latest_subdir(CASK_METADATA_LEAF)? else {
            return Ok(None);
        };
        Ok(["cask", "json"]
            .into_iter()
            .map(|extension| dir.join(format!("{token}.{extension}")))
            .find(|path| path.is_file()))
    }

    /// Removes the installation record and everything under it.
    pub fn remove_record(&self, token: &str) -> Result<()> {
        let dir = self.layout.cask_dir(token);
        remove_dir_all_if_exists(&dir)
    }
}

pub fn installed_tap_path(caskfile: &Path) -> PathBuf {
    caskfile.with_extension(INSTALLED_TAP_EXTENSION)
}

/// Tap recorded next to an installed caskfile. `None` for casks installed
/// from a path, a URL or content.
pub fn read_installed_tap(caskfile: &Path) -> Result<Option<TapName>> {
    let path = installed_tap_path(caskfile);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    TapName::parse(raw)
        .map(Some)
        .with_context(|| format!("invalid tap recorded in {}", path.display()))
}

pub(crate) fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
