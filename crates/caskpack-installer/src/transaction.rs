use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::layout::CaskLayout;

pub const TRANSACTION_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Applying,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub version: u32,
    pub txid: String,
    pub operation: String,
    pub token: String,
    pub from_version: String,
    pub to_version: String,
    pub status: TransactionStatus,
    pub started_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
}

/// A transaction whose active marker outlived the process that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptedUpgrade {
    pub txid: String,
    pub metadata: Option<TransactionMetadata>,
    pub last_entry: Option<TransactionJournalEntry>,
}

pub fn set_active_transaction(layout: &CaskLayout, txid: &str) -> Result<PathBuf> {
    let path = layout.transaction_active_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_transaction(layout).ok().flatten();
            let detail = existing
                .map(|existing_txid| format!(" (txid={existing_txid})"))
                .unwrap_or_default();
            return Err(anyhow!(
                "an upgrade transaction is already active{detail}; run `caskpack doctor` to inspect it"
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to claim active transaction file: {}",
                    path.display()
                )
            });
        }
    };

    file.write_all(format!("{txid}\n").as_bytes())
        .with_context(|| {
            format!(
                "failed to write active transaction file: {}",
                path.display()
            )
        })?;
    file.flush().with_context(|| {
        format!(
            "failed to flush active transaction file: {}",
            path.display()
        )
    })?;

    Ok(path)
}

pub fn read_active_transaction(layout: &CaskLayout) -> Result<Option<String>> {
    let path = layout.transaction_active_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active transaction file: {}", path.display())
            });
        }
    };

    let txid = raw.trim();
    if txid.is_empty() {
        return Ok(None);
    }

    Ok(Some(txid.to_string()))
}

pub fn clear_active_transaction(layout: &CaskLayout) -> Result<()> {
    let path = layout.transaction_active_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| {
            format!(
                "failed to clear active transaction file: {}",
                path.display()
            )
        }),
    }
}

pub fn write_transaction_metadata(
    layout: &CaskLayout,
    metadata: &TransactionMetadata,
) -> Result<PathBuf> {
    let path = layout.transaction_metadata_path(&metadata.txid);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let payload = serde_json::to_string_pretty(metadata)
        .context("failed to serialize transaction metadata")?;
    fs::write(&path, payload).with_context(|| {
        format!(
            "failed to write transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(path)
}

pub fn read_transaction_metadata(
    layout: &CaskLayout,
    txid: &str,
) -> Result<Option<TransactionMetadata>> {
    let path = layout.transaction_metadata_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read transaction metadata file: {}",
                    path.display()
                )
            });
        }
    };

    let metadata = serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed parsing transaction metadata file: {}",
            path.display()
        )
    })?;
    Ok(Some(metadata))
}

pub fn update_transaction_status(
    layout: &CaskLayout,
    txid: &str,
    status: TransactionStatus,
) -> Result<()> {
    let mut metadata = read_transaction_metadata(layout, txid)?
        .ok_or_else(|| anyhow!("transaction metadata not found for '{txid}'"))?;
    metadata.status = status;
    write_transaction_metadata(layout, &metadata)?;
    Ok(())
}

pub fn append_transaction_journal_entry(
    layout: &CaskLayout,
    txid: &str,
    entry: &TransactionJournalEntry,
) -> Result<PathBuf> {
    let path = layout.transaction_journal_path(txid);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open transaction journal: {}", path.display()))?;
    let mut line =
        serde_json::to_string(entry).context("failed to serialize transaction journal entry")?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append transaction journal: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush transaction journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_transaction_journal(
    layout: &CaskLayout,
    txid: &str,
) -> Result<Vec<TransactionJournalEntry>> {
    let path = layout.transaction_journal_path(txid);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read transaction journal: {}", path.display()));
        }
    };

    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).with_context(|| {
                format!("invalid transaction journal line in {}", path.display())
            })
        })
        .collect()
}

/// Reports an upgrade whose process died before committing or rolling back.
pub fn interrupted_upgrade(layout: &CaskLayout) -> Result<Option<InterruptedUpgrade>> {
    let Some(txid) = read_active_transaction(layout)? else {
        return Ok(None);
    };
    let metadata = read_transaction_metadata(layout, &txid)?;
    let last_entry = read_transaction_journal(layout, &txid)?.pop();
    Ok(Some(InterruptedUpgrade {
        txid,
        metadata,
        last_entry,
    }))
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// Durable record of one cask upgrade: metadata, journal, and the active
/// marker that blocks a second upgrade until this one ends.
#[derive(Debug)]
pub struct UpgradeJournal {
    layout: CaskLayout,
    txid: String,
    seq: u64,
    finished: bool,
}

impl UpgradeJournal {
    pub fn begin(
        layout: &CaskLayout,
        token: &str,
        from_version: &str,
        to_version: &str,
    ) -> Result<Self> {
        let started_at_unix = current_unix_timestamp()?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.subsec_nanos())
            .unwrap_or_default();
        let txid = format!("upgrade-{token}-{started_at_unix}-{nanos:09}");

        set_active_transaction(layout, &txid)?;
        let metadata = TransactionMetadata {
            version: TRANSACTION_FORMAT_VERSION,
            txid: txid.clone(),
            operation: "upgrade".to_string(),
            token: token.to_string(),
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
            status: TransactionStatus::Applying,
            started_at_unix,
        };
        if let Err(err) = write_transaction_metadata(layout, &metadata) {
            let _ = clear_active_transaction(layout);
            return Err(err);
        }

        Ok(Self {
            layout: layout.clone(),
            txid,
            seq: 0,
            finished: false,
        })
    }

    pub fn txid(&self) -> &str {
        &self.txid
    }

    pub fn record(&mut self, step: &str, state: &str) -> Result<()> {
        self.seq += 1;
        append_transaction_journal_entry(
            &self.layout,
            &self.txid,
            &TransactionJournalEntry {
                seq: self.seq,
                step: step.to_string(),
                state: state.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.finish(TransactionStatus::Committed)
    }

    pub fn rolled_back(mut self) -> Result<()> {
        self.finish(TransactionStatus::RolledBack)
    }

    fn finish(&mut self, status: TransactionStatus) -> Result<()> {
        update_transaction_status(&self.layout, &self.txid, status)?;
        clear_active_transaction(&self.layout)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for UpgradeJournal {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                txid = %self.txid,
                "upgrade transaction left unfinished; its marker stays until cleared"
            );
        }
    }
}
