use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use caskpack_core::TapName;
use tracing::{debug, info};

use crate::api::ApiIndex;
use crate::fs_ops::{copy_dir_recursive, unique_suffix};
use crate::git_ops::{git_head_revision, run_git_clone};
use crate::tap::Tap;

/// Every piece of tap state the resolver consults: installed taps, the
/// default tap, and the cached API index standing in for an absent default
/// tap.
#[derive(Debug)]
pub struct TapCatalog {
    taps_root: PathBuf,
    api_root: PathBuf,
    default_tap: TapName,
    install_from_api: bool,
    auto_tap: bool,
    api: OnceLock<ApiIndex>,
}

impl TapCatalog {
    pub fn new(
        taps_root: impl Into<PathBuf>,
        api_root: impl Into<PathBuf>,
        default_tap: TapName,
    ) -> Self {
        Self {
            taps_root: taps_root.into(),
            api_root: api_root.into(),
            default_tap,
            install_from_api: true,
            auto_tap: false,
            api: OnceLock::new(),
        }
    }

    pub fn with_install_from_api(mut self, enabled: bool) -> Self {
        self.install_from_api = enabled;
        self
    }

    /// Clone missing migration targets on demand instead of failing.
    pub fn with_auto_tap(mut self, enabled: bool) -> Self {
        self.auto_tap = enabled;
        self
    }

    pub fn with_api_index(self, index: ApiIndex) -> Self {
        let _ = self.api.set(index);
        self
    }

    pub fn taps_root(&self) -> &Path {
        &self.taps_root
    }

    pub fn default_tap_name(&self) -> &TapName {
        &self.default_tap
    }

    pub fn is_default(&self, name: &TapName) -> bool {
        *name == self.default_tap
    }

    pub fn tap(&self, name: &TapName) -> Tap {
        Tap::new(
            name.clone(),
            self.taps_root.join(name.owner()).join(name.repo()),
        )
    }

    pub fn default_tap(&self) -> Tap {
        self.tap(&self.default_tap)
    }

    /// Installed taps sorted by name.
    pub fn installed_taps(&self) -> Result<Vec<Tap>> {
        let mut taps = Vec::new();
        if !self.taps_root.is_dir() {
            return Ok(taps);
        }

        for owner in read_visible_dirs(&self.taps_root)? {
            for repo in read_visible_dirs(&self.taps_root.join(&owner))? {
                match TapName::new(&owner, &repo) {
                    Ok(name) => taps.push(self.tap(&name)),
                    Err(err) => debug!("skipping tap directory {owner}/{repo}: {err}"),
                }
            }
        }

        taps.sort_by(|left, right| left.name().cmp(right.name()));
        Ok(taps)
    }

    /// Whether definitions of `name` come from the API index.
    pub fn uses_api(&self, name: &TapName) -> bool {
        self.install_from_api && self.is_default(name) && !self.tap(name).is_installed()
    }

    pub fn install_from_api(&self) -> bool {
        self.install_from_api
    }

    /// The API index, or `None` when API loading is disabled.
    pub fn api_index(&self) -> Result<Option<&ApiIndex>> {
        if !self.install_from_api {
            return Ok(None);
        }
        if let Some(index) = self.api.get() {
            return Ok(Some(index));
        }
        let index = ApiIndex::load(&self.api_root)?;
        Ok(Some(self.api.get_or_init(|| index)))
    }

    pub fn renames(&self, name: &TapName) -> Result<BTreeMap<String, String>> {
        let tap = self.tap(name);
        if tap.is_installed() {
            return tap.cask_renames();
        }
        if self.uses_api(name) {
            return Ok(self
                .api_index()?
                .map(|index| index.renames().clone())
                .unwrap_or_default());
        }
        Ok(BTreeMap::new())
    }

    pub fn migrations(&self, name: &TapName) -> Result<BTreeMap<String, String>> {
        let tap = self.tap(name);
        if tap.is_installed() {
            return tap.tap_migrations();
        }
        if self.uses_api(name) {
            return Ok(self
                .api_index()?
                .map(|index| index.migrations().clone())
                .unwrap_or_default());
        }
        Ok(BTreeMap::new())
    }

    /// Makes sure `name` can serve definitions, tapping it when auto-tap is on.
    pub fn ensure_installed(&self, name: &TapName) -> Result<Tap> {
        let tap = self.tap(name);
        if tap.is_installed() || self.uses_api(name) {
            return Ok(tap);
        }
        if !self.auto_tap {
            anyhow::bail!("tap '{name}' is not installed; run `caskpack tap {name}`");
        }
        self.add_tap(name, None)
    }

    /// Clones `remote` (default `https://github.com/<owner>/<repo>`) or copies
    /// a local directory into the tap location.
    pub fn add_tap(&self, name: &TapName, remote: Option<&str>) -> Result<Tap> {
        let tap = self.tap(name);
        if tap.is_installed() {
            anyhow::bail!("tap '{name}' is already installed");
        }

        let remote = remote
            .map(str::to_string)
            .unwrap_or_else(|| name.default_remote());
        fs::create_dir_all(&self.taps_root)
            .with_context(|| format!("failed creating {}", self.taps_root.display()))?;
        let staged = self.taps_root.join(format!(
            ".tap-{}-{}-{}",
            name.owner(),
            name.repo(),
            unique_suffix()
        ));

        let result = stage_tap(&remote, &staged, name).and_then(|()| {
            if let Some(parent) = tap.path().parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating {}", parent.display()))?;
            }
            fs::rename(&staged, tap.path()).with_context(|| {
                format!(
                    "failed moving staged tap into place: {}",
                    tap.path().display()
                )
            })
        });
        if result.is_err() && staged.exists() {
            let _ = fs::remove_dir_all(&staged);
        }
        result?;

        info!(tap = %name, remote = %remote, "tapped");
        Ok(tap)
    }

    pub fn remove_tap(&self, name: &TapName) -> Result<()> {
        let tap = self.tap(name);
        if !tap.is_installed() {
            anyhow::bail!("tap '{name}' is not installed");
        }
        fs::remove_dir_all(tap.path())
            .with_context(|| format!("failed removing tap {}", tap.path().display()))?;

        let owner_dir = self.taps_root.join(name.owner());
        if read_visible_dirs(&owner_dir)?.is_empty() {
            let _ = fs::remove_dir(&owner_dir);
        }
        info!(tap = %name, "untapped");
        Ok(())
    }

    /// Short git revision of the tap checkout, `None` for copied taps.
    pub fn tap_revision(&self, name: &TapName) -> Result<Option<String>> {
        let tap = self.tap(name);
        git_head_revision(tap.path(), &name.to_string())
    }
}

fn stage_tap(remote: &str, staged: &Path, name: &TapName) -> Result<()> {
    let local = Path::new(remote);
    if local.is_dir() {
        debug!(tap = %name, source = %local.display(), "copying local tap");
        return copy_dir_recursive(local, staged);
    }
    run_git_clone(remote, staged, &name.to_string())
}

fn read_visible_dirs(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !root.is_dir() {
        return Ok(names);
    }
    for entry in
        fs::read_dir(root).with_context(|| format!("failed reading {}", root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
