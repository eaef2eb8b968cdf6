mod caskroom;
mod download;
mod installer;
mod layout;
mod metadata;
mod receipt;
mod stage;
mod system;
mod transaction;

pub use caskroom::{installed_tap_path, read_installed_tap, Caskroom, INSTALLED_TAP_EXTENSION};
pub use download::{DownloadQueue, Downloader, HttpDownloader};
pub use installer::{CaskInstaller, InstallContext, PKG_INSTALLER};
pub use layout::{backup_path, default_user_prefix, CaskLayout, METADATA_DIR, UPGRADING_SUFFIX};
pub use metadata::{
    now_timestamp, MetadataError, MetadataStore, Timestamp, TIMESTAMP_FORMAT, UNKNOWN_VERSION,
};
pub use receipt::{
    classify_manifest, default_protected_paths, entry_kind, is_protected, plan_removal,
    BillOfMaterials, EntryKind, PkgutilDatabase, ReceiptDatabase, ReceiptManifest,
    ReceiptUninstaller, RemovalStep, PKGUTIL, PROTECTED_PATHS, RM, RMDIR, XARGS,
};
pub use stage::extract_artifact;
pub use system::{CommandOutput, ProcessExecutor, SystemCommand, SystemExecutor, SUDO};
pub use transaction::{
    append_transaction_journal_entry, clear_active_transaction, current_unix_timestamp,
    interrupted_upgrade, read_active_transaction, read_transaction_journal,
    read_transaction_metadata, set_active_transaction, update_transaction_status,
    write_transaction_metadata, InterruptedUpgrade, TransactionJournalEntry, TransactionMetadata,
    TransactionStatus, UpgradeJournal, TRANSACTION_FORMAT_VERSION,
};
