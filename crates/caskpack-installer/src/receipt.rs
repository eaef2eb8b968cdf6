//! Removal of OS package receipts: the files a flat package installed,
//! followed by the receipt record itself.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::system::{SystemCommand, SystemExecutor};

pub const PKGUTIL: &str = "/usr/sbin/pkgutil";
pub const XARGS: &str = "/usr/bin/xargs";
pub const RM: &str = "/bin/rm";
pub const RMDIR: &str = "/bin/rmdir";

/// Paths xargs receives per invocation.
const DELETE_BATCH: usize = 500;

/// Directories that are never removed even when a receipt lists them.
pub const PROTECTED_PATHS: &[&str] = &[
    "/",
    "/Applications",
    "/Applications/Utilities",
    "/Library",
    "/Library/Application Support",
    "/Library/Extensions",
    "/Library/Frameworks",
    "/Library/LaunchAgents",
    "/Library/LaunchDaemons",
    "/Library/PreferencePanes",
    "/Library/Preferences",
    "/Library/PrivilegedHelperTools",
    "/Library/QuickLook",
    "/Library/Receipts",
    "/Library/Screen Savers",
    "/System",
    "/Users",
    "/Volumes",
    "/bin",
    "/etc",
    "/opt",
    "/private",
    "/private/etc",
    "/private/tmp",
    "/private/var",
    "/sbin",
    "/tmp",
    "/usr",
    "/usr/bin",
    "/usr/lib",
    "/usr/local",
    "/usr/local/bin",
    "/usr/local/lib",
    "/usr/local/share",
    "/usr/sbin",
    "/usr/share",
    "/var",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    /// Symlinks and character or block devices.
    Special,
    Directory,
    Missing,
}

/// What the receipt database reports for one receipt id, relative to its
/// install root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptManifest {
    pub entries: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

/// The receipt's bill of materials as absolute paths, split into disjoint sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillOfMaterials {
    pub files: BTreeSet<PathBuf>,
    pub specials: BTreeSet<PathBuf>,
    pub directories: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalStep {
    DeleteFiles(Vec<PathBuf>),
    DeleteSpecials(Vec<PathBuf>),
    RemoveDirectory(PathBuf),
}

pub trait ReceiptDatabase: Send + Sync {
    /// Receipt ids matching `pattern` (a regular expression).
    fn matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Volume joined with install location.
    fn install_root(&self, id: &str) -> Result<PathBuf>;

    fn manifest(&self, id: &str) -> Result<ReceiptManifest>;

    fn forget(&self, id: &str) -> Result<()>;
}

/// `pkgutil`-backed receipt database.
#[derive(Clone)]
pub struct PkgutilDatabase {
    executor: Arc<dyn SystemExecutor>,
}

impl PkgutilDatabase {
    pub fn new(executor: Arc<dyn SystemExecutor>) -> Self {
        Self { executor }
    }

    fn lines(&self, command: SystemCommand) -> Result<Vec<String>> {
        Ok(self
            .executor
            .run_checked(&command)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl ReceiptDatabase for PkgutilDatabase {
    fn matching(&self, pattern: &str) -> Result<Vec<String>> {
        let output = self
            .executor
            .run(&SystemCommand::new(PKGUTIL).arg(format!("--pkgs={pattern}")))?;
        // pkgutil exits non-zero when nothing matches.
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn install_root(&self, id: &str) -> Result<PathBuf> {
        let info = self.lines(SystemCommand::new(PKGUTIL).args(["--pkg-info", id]))?;
        let field = |name: &str| {
            info.iter()
                .find_map(|line| line.strip_prefix(name))
                .map(|value| value.trim().to_string())
        };
        let volume = field("volume:").ok_or_else(|| anyhow!("receipt '{id}' has no volume"))?;
        let location = field("location:").unwrap_or_default();
        Ok(Path::new(&volume).join(location.trim_start_matches('/')))
    }

    fn manifest(&self, id: &str) -> Result<ReceiptManifest> {
        let entries = self.lines(SystemCommand::new(PKGUTIL).args(["--files", id]))?;
        let directories =
            self.lines(SystemCommand::new(PKGUTIL).args(["--only-dirs", "--files", id]))?;
        Ok(ReceiptManifest {
            entries: entries.into_iter().map(PathBuf::from).collect(),
            directories: directories.into_iter().map(PathBuf::from).collect(),
        })
    }

    fn forget(&self, id: &str) -> Result<()> {
        self.executor
            .run_checked(&SystemCommand::new(PKGUTIL).args(["--forget", id]).sudo())?;
        Ok(())
    }
}

pub fn entry_kind(path: &Path) -> EntryKind {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return EntryKind::Missing;
    };
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        return EntryKind::Special;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_char_device() || file_type.is_block_device() {
            return EntryKind::Special;
        }
    }
    if file_type.is_dir() {
        return EntryKind::Directory;
    }
    EntryKind::File
}

pub fn is_protected(path: &Path, protected: &BTreeSet<PathBuf>) -> bool {
    protected.contains(path)
}

/// Splits a manifest into files, specials and directories under `root`,
/// dropping protected paths from every set.
pub fn classify_manifest(
    root: &Path,
    manifest: &ReceiptManifest,
    protected: &BTreeSet<PathBuf>,
    kind_of: impl Fn(&Path) -> EntryKind,
) -> BillOfMaterials {
    let mut bom = BillOfMaterials::default();
    let absolute = |relative: &PathBuf| root.join(relative.strip_prefix("/").unwrap_or(relative));

    for path in manifest.entries.iter().map(absolute) {
        if is_protected(&path, protected) {
            continue;
        }
        match kind_of(&path) {
            EntryKind::Special => {
                bom.specials.insert(path);
            }
            EntryKind::File => {
                bom.files.insert(path);
            }
            EntryKind::Directory | EntryKind::Missing => {}
        }
    }

    for path in manifest.directories.iter().map(absolute) {
        if is_protected(&path, protected) || bom.specials.contains(&path) {
            continue;
        }
        bom.directories.insert(path);
    }

    bom
}

/// Files first, then specials, then directories deepest first.
pub fn plan_removal(bom: &BillOfMaterials) -> Vec<RemovalStep> {
    let mut steps = Vec::new();
    for batch in bom.files.iter().cloned().collect::<Vec<_>>().chunks(DELETE_BATCH) {
        steps.push(RemovalStep::DeleteFiles(batch.to_vec()));
    }
    for batch in bom
        .specials
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .chunks(DELETE_BATCH)
    {
        steps.push(RemovalStep::DeleteSpecials(batch.to_vec()));
    }

    let mut directories = bom.directories.iter().cloned().collect::<Vec<_>>();
    directories.sort_by(|left, right| {
        right
            .components()
            .count()
            .cmp(&left.components().count())
            .then_with(|| left.cmp(right))
    });
    steps.extend(directories.into_iter().map(RemovalStep::RemoveDirectory));
    steps
}

pub struct ReceiptUninstaller {
    database: Arc<dyn ReceiptDatabase>,
    executor: Arc<dyn SystemExecutor>,
    protected: BTreeSet<PathBuf>,
}

impl ReceiptUninstaller {
    pub fn new(database: Arc<dyn ReceiptDatabase>, executor: Arc<dyn SystemExecutor>) -> Self {
        Self {
            database,
            executor,
            protected: default_protected_paths(),
        }
    }

    pub fn with_protected_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.protected.extend(paths);
        self
    }

    /// Uninstalls every receipt matching `pattern`; returns the ids removed.
    pub fn uninstall_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let ids = self.database.matching(pattern)?;
        if ids.is_empty() {
            debug!(pattern, "no package receipts matched");
        }
        for id in &ids {
            self.uninstall(id)?;
        }
        Ok(ids)
    }

    pub fn uninstall(&self, id: &str) -> Result<()> {
        info!(receipt = id, "removing files from package receipt");
        let root = self.database.install_root(id)?;
        let manifest = self.database.manifest(id)?;
        let bom = classify_manifest(&root, &manifest, &self.protected, entry_kind);

        for step in plan_removal(&bom) {
            match step {
                RemovalStep::DeleteFiles(paths) | RemovalStep::DeleteSpecials(paths) => {
                    self.delete_paths(&paths)?;
                }
                RemovalStep::RemoveDirectory(path) => self.remove_dir_if_empty(&path)?,
            }
        }

        if !is_protected(&root, &self.protected) {
            self.remove_dir_if_empty(&root)?;
        }

        self.database
            .forget(id)
            .with_context(|| format!("failed to forget package receipt '{id}'"))
    }

    fn delete_paths(&self, paths: &[PathBuf]) -> Result<()> {
        let mut input = Vec::new();
        for path in paths {
            input.extend_from_slice(path.as_os_str().as_encoded_bytes());
            input.push(0);
        }
        let command = SystemCommand::new(XARGS)
            .args(["-0", "--", RM, "-f", "--"])
            .input(input)
            .sudo();
        self.executor.run_checked(&command).map(|_| ())
    }

    /// Removes `.DS_Store` and then the directory, only when nothing else is left.
    fn remove_dir_if_empty(&self, path: &Path) -> Result<()> {
        if entry_kind(path) != EntryKind::Directory {
            return Ok(());
        }

        let mut has_ds_store = false;
        for entry in
            fs::read_dir(path).with_context(|| format!("failed reading {}", path.display()))?
        {
            if entry?.file_name() == ".DS_Store" {
                has_ds_store = true;
            } else {
                debug!(path = %path.display(), "directory not empty; keeping");
                return Ok(());
            }
        }

        let display = path.display().to_string();
        if has_ds_store {
            let ds_store = path.join(".DS_Store").display().to_string();
            self.executor
                .run_checked(&SystemCommand::new(RM).args(["-f", "--", &ds_store]).sudo())?;
        }
        self.executor
            .run_checked(&SystemCommand::new(RMDIR).args(["--", &display]).sudo())?;
        Ok(())
    }
}

pub fn default_protected_paths() -> BTreeSet<PathBuf> {
    let mut paths: BTreeSet<PathBuf> = PROTECTED_PATHS.iter().map(PathBuf::from).collect();
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        for child in [
            "",
            "Applications",
            "Desktop",
            "Documents",
            "Downloads",
            "Library",
            "Library/Application Support",
            "Library/Preferences",
        ] {
            paths.insert(if child.is_empty() {
                home.clone()
            } else {
                home.join(child)
            });
        }
    }
    paths
}
