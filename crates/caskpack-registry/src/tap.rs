use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use caskpack_core::{is_valid_token, TapName};

use crate::fs_ops::read_json_or_default;

pub const CASKS_DIR: &str = "Casks";
pub const CASK_RENAMES_FILE: &str = "cask_renames.json";
pub const TAP_MIGRATIONS_FILE: &str = "tap_migrations.json";

/// Extensions a tap definition file may carry, in lookup order.
pub const CASK_EXTENSIONS: [&str; 2] = ["cask", "json"];

/// A tap checked out under `<taps>/<owner>/<repo>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap {
    name: TapName,
    path: PathBuf,
}

impl Tap {
    pub fn new(name: TapName, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
        }
    }

    pub fn name(&self) -> &TapName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_installed(&self) -> bool {
        self.path.is_dir()
    }

    pub fn casks_dir(&self) -> PathBuf {
        self.path.join(CASKS_DIR)
    }

    /// Existing definition file for `token`, flat or sharded by first character.
    pub fn cask_file(&self, token: &str) -> Option<PathBuf> {
        self.candidate_cask_files(token)
            .into_iter()
            .find(|path| path.is_file())
    }

    /// Path a definition for `token` would have if the tap carried one.
    pub fn expected_cask_file(&self, token: &str) -> PathBuf {
        self.casks_dir().join(format!("{token}.{}", CASK_EXTENSIONS[0]))
    }

    fn candidate_cask_files(&self, token: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::with_capacity(CASK_EXTENSIONS.len() * 2);
        let flat = self.casks_dir();
        let sharded = token
            .chars()
            .next()
            .map(|first| flat.join(first.to_string()));
        for dir in std::iter::once(flat).chain(sharded) {
            for extension in CASK_EXTENSIONS {
                candidates.push(dir.join(format!("{token}.{extension}")));
            }
        }
        candidates
    }

    /// Tokens with a definition file in this tap, sorted.
    pub fn cask_tokens(&self) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        let casks_dir = self.casks_dir();
        if !casks_dir.is_dir() {
            return Ok(tokens);
        }

        let mut dirs = vec![casks_dir];
        while let Some(dir) = dirs.pop() {
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("failed reading tap directory {}", dir.display()))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let is_definition = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| CASK_EXTENSIONS.contains(&ext));
                let stem = path.file_stem().and_then(|stem| stem.to_str());
                if let (true, Some(stem)) = (is_definition, stem) {
                    if is_valid_token(stem) {
                        tokens.push(stem.to_string());
                    }
                }
            }
        }

        tokens.sort();
        tokens.dedup();
        Ok(tokens)
    }

    /// `old token -> new token` within this tap.
    pub fn cask_renames(&self) -> Result<BTreeMap<String, String>> {
        read_json_or_default(&self.path.join(CASK_RENAMES_FILE))
            .with_context(|| format!("invalid cask renames in tap '{}'", self.name))
    }

    /// `token -> owner/repo[/token] | new-token` for casks that moved away.
    pub fn tap_migrations(&self) -> Result<BTreeMap<String, String>> {
        read_json_or_default(&self.path.join(TAP_MIGRATIONS_FILE))
            .with_context(|| format!("invalid tap migrations in tap '{}'", self.name))
    }
}
