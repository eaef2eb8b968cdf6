use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use caskpack_core::{normalize_token, TapName, DEFAULT_TAP};
use caskpack_lifecycle::DEFAULT_DOWNLOAD_CONCURRENCY;
use serde::{Deserialize, Serialize};

pub(crate) const ENV_GREEDY_CASKS: &str = "CASKPACK_UPGRADE_GREEDY_CASKS";
pub(crate) const ENV_NO_INSTALL_FROM_API: &str = "CASKPACK_NO_INSTALL_FROM_API";
pub(crate) const ENV_DOWNLOAD_CONCURRENCY: &str = "CASKPACK_DOWNLOAD_CONCURRENCY";

/// `config.toml` under the prefix. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CliConfig {
    pub(crate) default_tap: Option<String>,
    pub(crate) install_from_api: Option<bool>,
    pub(crate) auto_tap: Option<bool>,
    pub(crate) upgrade_greedy_casks: Vec<String>,
    pub(crate) download_concurrency: Option<usize>,
    pub(crate) use_sudo: Option<bool>,
}

impl CliConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed reading config file: {}", path.display()));
            }
        };
        Self::parse(&content)
            .with_context(|| format!("failed parsing config file: {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment values win over the file.
    pub(crate) fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_GREEDY_CASKS) {
            self.upgrade_greedy_casks = split_token_list(&raw);
        }
        if lookup(ENV_NO_INSTALL_FROM_API).is_some_and(|value| !value.trim().is_empty()) {
            self.install_from_api = Some(false);
        }
        if let Some(raw) = lookup(ENV_DOWNLOAD_CONCURRENCY) {
            let value = raw.trim().parse::<usize>().with_context(|| {
                format!("{ENV_DOWNLOAD_CONCURRENCY} must be a positive integer, got '{raw}'")
            })?;
            self.download_concurrency = Some(value);
        }
        Ok(self)
    }

    pub(crate) fn default_tap(&self) -> Result<TapName> {
        let raw = self.default_tap.as_deref().unwrap_or(DEFAULT_TAP);
        TapName::parse(raw).with_context(|| format!("invalid default_tap '{raw}' in config"))
    }

    pub(crate) fn install_from_api(&self) -> bool {
        self.install_from_api.unwrap_or(true)
    }

    pub(crate) fn download_concurrency(&self) -> usize {
        self.download_concurrency
            .unwrap_or(DEFAULT_DOWNLOAD_CONCURRENCY)
            .max(1)
    }

    pub(crate) fn greedy_casks(&self) -> Vec<String> {
        self.upgrade_greedy_casks
            .iter()
            .map(|token| normalize_token(token))
            .filter(|token| !token.is_empty())
            .collect()
    }
}

/// Tokens separated by whitespace or commas.
fn split_token_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(normalize_token)
        .collect()
}
