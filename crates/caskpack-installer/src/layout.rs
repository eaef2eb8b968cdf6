use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_DIR: &str = ".metadata";
pub const UPGRADING_SUFFIX: &str = ".upgrading";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaskLayout {
    prefix: PathBuf,
}

impl CaskLayout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn caskroom_dir(&self) -> PathBuf {
        self.prefix.join("Caskroom")
    }

    pub fn cask_dir(&self, token: &str) -> PathBuf {
        self.caskroom_dir().join(token)
    }

    pub fn staged_path(&self, token: &str, version: &str) -> PathBuf {
        self.cask_dir(token).join(version)
    }

    pub fn metadata_root(&self, token: &str) -> PathBuf {
        self.cask_dir(token).join(METADATA_DIR)
    }

    pub fn app_dir(&self) -> PathBuf {
        self.prefix.join("Applications")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn taps_dir(&self) -> PathBuf {
        self.prefix.join("taps")
    }

    pub fn api_dir(&self) -> PathBuf {
        self.prefix.join("api")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.prefix.join("cache")
    }

    pub fn downloads_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.prefix.join("state")
    }

    pub fn tmp_state_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn transactions_dir(&self) -> PathBuf {
        self.state_dir().join("transactions")
    }

    pub fn transaction_active_path(&self) -> PathBuf {
        self.transactions_dir().join("active")
    }

    pub fn transaction_metadata_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.json"))
    }

    pub fn transaction_journal_path(&self, txid: &str) -> PathBuf {
        self.transactions_dir().join(format!("{txid}.journal"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.prefix.join("config.toml")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.caskroom_dir(),
            self.app_dir(),
            self.bin_dir(),
            self.taps_dir(),
            self.api_dir(),
            self.downloads_cache_dir(),
            self.tmp_state_dir(),
            self.transactions_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Appends `.upgrading` to the final path component.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(UPGRADING_SUFFIX);
    PathBuf::from(raw)
}

pub fn default_user_prefix() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user prefix")?;
    Ok(PathBuf::from(home).join(".caskpack"))
}
