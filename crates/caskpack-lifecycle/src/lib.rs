mod dependents;
mod engine;
mod outdated;
mod upgrade;

pub use dependents::installed_dependents;
pub use engine::{
    InstallOptions, LifecycleEngine, UninstallOptions, UninstallReport,
    DEFAULT_DOWNLOAD_CONCURRENCY,
};
pub use outdated::{is_outdated, GreedyFlags, OutdatedCask};
pub use upgrade::{UpgradeOptions, UpgradeReport};

#[cfg(test)]
mod tests;
