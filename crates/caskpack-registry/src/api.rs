use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use caskpack_core::{normalize_token, CaskRecord};

use crate::fs_ops::read_json_or_default;

pub const API_CASKS_FILE: &str = "cask.json";
pub const API_RENAMES_FILE: &str = "cask_renames.json";
pub const API_MIGRATIONS_FILE: &str = "cask_tap_migrations.json";

/// Cached JSON API index for the default tap.
#[derive(Debug, Clone, Default)]
pub struct ApiIndex {
    records: BTreeMap<String, CaskRecord>,
    renames: BTreeMap<String, String>,
    migrations: BTreeMap<String, String>,
}

impl ApiIndex {
    pub fn load(api_root: &Path) -> Result<Self> {
        let records: Vec<CaskRecord> = read_json_or_default(&api_root.join(API_CASKS_FILE))
            .context("failed loading cask API index")?;
        let records = records
            .into_iter()
            .map(|record| (normalize_token(&record.token), record))
            .collect();

        Ok(Self {
            records,
            renames: read_json_or_default(&api_root.join(API_RENAMES_FILE))?,
            migrations: read_json_or_default(&api_root.join(API_MIGRATIONS_FILE))?,
        })
    }

    pub fn from_records(records: impl IntoIterator<Item = CaskRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (normalize_token(&record.token), record))
                .collect(),
            ..Self::default()
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.records.contains_key(token)
    }

    pub fn record(&self, token: &str) -> Option<&CaskRecord> {
        self.records.get(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn renames(&self) -> &BTreeMap<String, String> {
        &self.renames
    }

    pub fn migrations(&self) -> &BTreeMap<String, String> {
        &self.migrations
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
