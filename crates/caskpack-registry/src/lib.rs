mod api;
mod catalog;
mod fs_ops;
mod git_ops;
mod tap;

pub use api::{ApiIndex, API_CASKS_FILE, API_MIGRATIONS_FILE, API_RENAMES_FILE};
pub use catalog::TapCatalog;
pub use tap::{Tap, CASKS_DIR, CASK_EXTENSIONS, CASK_RENAMES_FILE, TAP_MIGRATIONS_FILE};
