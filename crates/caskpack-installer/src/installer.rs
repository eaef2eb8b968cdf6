use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use caskpack_core::{
    validated_relative_path, ArchiveType, ArtifactDescriptor, CaskError, PackageDefinition,
    CASK_METADATA_LEAF,
};
use tracing::{debug, info, warn};

use crate::caskroom::{installed_tap_path, remove_dir_all_if_exists, Caskroom};
use crate::download::Downloader;
use crate::layout::{backup_path, CaskLayout};
use crate::metadata::{MetadataStore, Timestamp};
use crate::receipt::{PkgutilDatabase, ReceiptUninstaller};
use crate::stage::{extract_artifact, move_or_copy, remove_tree};
use crate::system::{SystemCommand, SystemExecutor};

pub const PKG_INSTALLER: &str = "/usr/sbin/installer";

/// Shared collaborators of every [`CaskInstaller`].
#[derive(Clone)]
pub struct InstallContext {
    pub layout: CaskLayout,
    pub downloader: Arc<dyn Downloader>,
    pub executor: Arc<dyn SystemExecutor>,
}

impl InstallContext {
    pub fn new(
        layout: CaskLayout,
        downloader: Arc<dyn Downloader>,
        executor: Arc<dyn SystemExecutor>,
    ) -> Self {
        Self {
            layout,
            downloader,
            executor,
        }
    }

    pub fn caskroom(&self) -> Caskroom {
        Caskroom::new(self.layout.clone())
    }

    pub fn receipt_uninstaller(&self) -> ReceiptUninstaller {
        let database = Arc::new(PkgutilDatabase::new(self.executor.clone()));
        ReceiptUninstaller::new(database, self.executor.clone())
    }
}

/// Drives one definition through fetch, stage, artifact install and removal.
pub struct CaskInstaller {
    definition: PackageDefinition,
    context: InstallContext,
    downloaded_path: Option<PathBuf>,
}

impl CaskInstaller {
    pub fn new(definition: PackageDefinition, context: InstallContext) -> Self {
        Self {
            definition,
            context,
            downloaded_path: None,
        }
    }

    pub fn definition(&self) -> &PackageDefinition {
        &self.definition
    }

    pub fn token(&self) -> &str {
        &self.definition.token
    }

    pub fn version(&self) -> &str {
        &self.definition.version
    }

    pub fn staged_path(&self) -> PathBuf {
        self.context
            .layout
            .staged_path(&self.definition.token, &self.definition.version)
    }

    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.context.layout.cask_dir(&self.definition.token))
    }

    fn versioned_metadata_path(&self) -> Result<PathBuf> {
        Ok(self
            .metadata()
            .versioned_path(Some(&self.definition.version))?)
    }

    /// Fails when a cask listed in `conflicts_with` is installed.
    pub fn check_conflicts(&self) -> Result<()> {
        let caskroom = self.context.caskroom();
        for conflict in &self.definition.conflicts_with {
            if caskroom.is_installed(conflict) {
                return Err(CaskError::ConflictDetected {
                    token: self.definition.token.clone(),
                    conflicting: conflict.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn fetch(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.downloaded_path {
            return Ok(path.clone());
        }
        let path = self
            .context
            .downloader
            .fetch(&self.definition)
            .with_context(|| format!("failed to fetch cask '{}'", self.definition.full_token()))?;
        self.downloaded_path = Some(path.clone());
        Ok(path)
    }

    /// Extracts the download into the staged directory and saves the caskfile.
    pub fn stage(&mut self) -> Result<()> {
        let result = self.stage_inner();
        if result.is_err() {
            self.purge_versioned_files()?;
        }
        result
    }

    fn stage_inner(&mut self) -> Result<()> {
        let download = self.fetch()?;
        let staged = self.staged_path();
        if staged.exists() {
            return Err(anyhow!(
                "staged directory already exists: {}",
                staged.display()
            ));
        }

        let cask_dir = self.context.layout.cask_dir(&self.definition.token);
        let extract_dir = cask_dir.join(format!(".extract-{}", std::process::id()));
        fs::create_dir_all(&extract_dir)
            .with_context(|| format!("failed to create {}", extract_dir.display()))?;

        let archive_type = self
            .definition
            .url
            .as_deref()
            .map(ArchiveType::infer_from_url)
            .unwrap_or(ArchiveType::Raw);
        debug!(
            cask = %self.definition.token,
            archive = archive_type.as_str(),
            "extracting primary container"
        );
        let extracted = extract_artifact(&download, &extract_dir, archive_type).and_then(|()| {
            fs::rename(&extract_dir, &staged)
                .with_context(|| format!("failed to move staged files to {}", staged.display()))
        });
        if extracted.is_err() {
            let _ = remove_dir_all_if_exists(&extract_dir);
        }
        extracted?;

        self.save_caskfile()
    }

    fn save_caskfile(&self) -> Result<()> {
        let (extension, content) = self.definition.caskfile()?;
        let dir = self
            .metadata()
            .subdir(
                CASK_METADATA_LEAF,
                Some(&self.definition.version),
                &Timestamp::Now,
                true,
            )?
            .ok_or_else(|| anyhow!("metadata directory was not created"))?;
        let path = dir.join(format!("{}.{extension}", self.definition.token));
        fs::write(&path, content)
            .with_context(|| format!("failed to save caskfile {}", path.display()))?;

        if let Some(tap) = &self.definition.tap {
            let sidecar = installed_tap_path(&path);
            fs::write(&sidecar, format!("{tap}\n"))
                .with_context(|| format!("failed to record tap in {}", sidecar.display()))?;
        }
        Ok(())
    }

    /// Installs every artifact in declaration order. On failure the artifacts
    /// already installed are removed and the versioned files purged.
    pub fn install_artifacts(&self, predecessor: Option<&PackageDefinition>) -> Result<()> {
        let mut installed: Vec<&ArtifactDescriptor> = Vec::new();
        for artifact in &self.definition.artifacts {
            if let Err(err) = self.install_artifact(artifact, predecessor) {
                for done in installed.iter().rev() {
                    if let Err(undo) = self.uninstall_artifact(done, Some(&self.definition)) {
                        warn!("failed to undo {} artifact: {undo:#}", artifact_label(done));
                    }
                }
                self.purge_versioned_files()?;
                return Err(err).with_context(|| {
                    format!(
                        "failed to install {} for cask '{}'",
                        artifact_label(artifact),
                        self.definition.token
                    )
                });
            }
            installed.push(artifact);
        }
        info!(cask = %self.definition.token, version = %self.definition.version, "artifacts installed");
        Ok(())
    }

    fn install_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        predecessor: Option<&PackageDefinition>,
    ) -> Result<()> {
        let staged = self.staged_path();
        match artifact {
            ArtifactDescriptor::App { source, .. } => {
                let source = staged.join(validated_relative_path(source)?);
                let target = self.artifact_target(artifact)?;
                if !source.exists() {
                    return Err(anyhow!("app source not found: {}", source.display()));
                }
                self.clear_target(artifact, &target, predecessor)?;
                move_or_copy(&source, &target)
            }
            ArtifactDescriptor::Binary { source, .. } => {
                let source = staged.join(validated_relative_path(source)?);
                let target = self.artifact_target(artifact)?;
                self.clear_target(artifact, &target, predecessor)?;
                let link_source = self.binary_link_source(&source)?;
                create_symlink(&link_source, &target)
            }
            ArtifactDescriptor::Pkg { path } => {
                let pkg = staged.join(validated_relative_path(path)?);
                if !pkg.is_file() {
                    return Err(anyhow!("pkg not found: {}", pkg.display()));
                }
                let command = SystemCommand::new(PKG_INSTALLER)
                    .args(["-pkg", &pkg.display().to_string(), "-target", "/"])
                    .sudo();
                self.context.executor.run_checked(&command).map(|_| ())
            }
            ArtifactDescriptor::Uninstall { .. } => Ok(()),
        }
    }

    /// A binary inside an app bundle follows the bundle into the app dir.
    fn binary_link_source(&self, staged_source: &Path) -> Result<PathBuf> {
        let staged = self.staged_path();
        for artifact in &self.definition.artifacts {
            if let ArtifactDescriptor::App { source, .. } = artifact {
                let app_source = staged.join(validated_relative_path(source)?);
                if let Ok(rest) = staged_source.strip_prefix(&app_source) {
                    return Ok(self.artifact_target(artifact)?.join(rest));
                }
            }
        }
        if !staged_source.exists() {
            return Err(anyhow!(
                "binary source not found: {}",
                staged_source.display()
            ));
        }
        Ok(staged_source.to_path_buf())
    }

    /// Refuses to overwrite a foreign file; a leftover of the predecessor's
    /// own artifact is replaced.
    fn clear_target(
        &self,
        artifact: &ArtifactDescriptor,
        target: &Path,
        predecessor: Option<&PackageDefinition>,
    ) -> Result<()> {
        if fs::symlink_metadata(target).is_err() {
            return Ok(());
        }
        let owned_by_predecessor = predecessor.is_some_and(|predecessor| {
            predecessor.artifacts.iter().any(|previous| {
                previous.kind() == artifact.kind()
                    && previous.target_name() == artifact.target_name()
            })
        });
        if !owned_by_predecessor {
            return Err(anyhow!(
                "it seems there is already {} at '{}'",
                artifact_label(artifact),
                target.display()
            ));
        }
        debug!(target = %target.display(), "replacing predecessor artifact");
        remove_tree(target)
    }

    fn artifact_target(&self, artifact: &ArtifactDescriptor) -> Result<PathBuf> {
        let name = artifact
            .target_name()
            .ok_or_else(|| anyhow!("{} artifact has no target", artifact.kind()))?;
        let dir = match artifact {
            ArtifactDescriptor::App { .. } => self.context.layout.app_dir(),
            ArtifactDescriptor::Binary { .. } => self.context.layout.bin_dir(),
            _ => return Err(anyhow!("{} artifact has no target", artifact.kind())),
        };
        Ok(dir.join(name))
    }

    /// Removes installed artifacts in reverse order. Apps move back into the
    /// staged directory. Package receipts are only removed when there is no
    /// successor taking over.
    pub fn uninstall_artifacts(&self, successor: Option<&PackageDefinition>) -> Result<()> {
        for artifact in self.definition.artifacts.iter().rev() {
            self.uninstall_artifact(artifact, successor)
                .with_context(|| {
                    format!(
                        "failed to uninstall {} for cask '{}'",
                        artifact_label(artifact),
                        self.definition.token
                    )
                })?;
        }
        Ok(())
    }

    fn uninstall_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        successor: Option<&PackageDefinition>,
    ) -> Result<()> {
        match artifact {
            ArtifactDescriptor::App { source, .. } => {
                let target = self.artifact_target(artifact)?;
                if fs::symlink_metadata(&target).is_err() {
                    return Ok(());
                }
                let staged_source = self.staged_path().join(validated_relative_path(source)?);
                if self.staged_path().is_dir() && fs::symlink_metadata(&staged_source).is_err() {
                    move_or_copy(&target, &staged_source)
                } else {
                    remove_tree(&target)
                }
            }
            ArtifactDescriptor::Binary { .. } => {
                let target = self.artifact_target(artifact)?;
                match fs::symlink_metadata(&target) {
                    Ok(metadata) if metadata.file_type().is_symlink() => fs::remove_file(&target)
                        .with_context(|| format!("failed to remove {}", target.display())),
                    Ok(_) => {
                        warn!(target = %target.display(), "not a symlink; leaving it in place");
                        Ok(())
                    }
                    Err(_) => Ok(()),
                }
            }
            ArtifactDescriptor::Pkg { .. } => Ok(()),
            ArtifactDescriptor::Uninstall { pkgutil } => {
                if successor.is_some() {
                    return Ok(());
                }
                let receipts = self.context.receipt_uninstaller();
                for pattern in pkgutil {
                    receipts.uninstall_matching(pattern)?;
                }
                Ok(())
            }
        }
    }

    /// First destructive upgrade step: artifacts go back into the staged
    /// directory, which is then moved aside with the versioned metadata.
    pub fn start_upgrade(&self, successor: &PackageDefinition) -> Result<()> {
        self.uninstall_artifacts(Some(successor))?;
        self.backup()
    }

    /// Undoes a complete or partial `start_upgrade`.
    pub fn revert_upgrade(&self, predecessor: &PackageDefinition) -> Result<()> {
        warn!(cask = %self.definition.token, "reverting upgrade");
        self.restore_backup()?;
        for artifact in &self.definition.artifacts {
            if self.app_in_place(artifact)? {
                continue;
            }
            self.install_artifact(artifact, Some(predecessor))
                .with_context(|| {
                    format!(
                        "failed to reinstall {} for cask '{}'",
                        artifact_label(artifact),
                        self.definition.token
                    )
                })?;
        }
        info!(
            cask = %self.definition.token,
            version = %self.definition.version,
            "upgrade reverted"
        );
        Ok(())
    }

    /// An app still at its target with nothing staged was never taken down.
    fn app_in_place(&self, artifact: &ArtifactDescriptor) -> Result<bool> {
        let ArtifactDescriptor::App { source, .. } = artifact else {
            return Ok(false);
        };
        let staged_source = self.staged_path().join(validated_relative_path(source)?);
        Ok(fs::symlink_metadata(self.artifact_target(artifact)?).is_ok()
            && fs::symlink_metadata(&staged_source).is_err())
    }

    pub fn finalize_upgrade(&self) -> Result<()> {
        for path in self.backup_paths()? {
            remove_dir_all_if_exists(&path)?;
        }
        Ok(())
    }

    /// Removes this version's staged directory and metadata, then the cask
    /// directory itself when nothing else remains in it.
    pub fn purge_versioned_files(&self) -> Result<()> {
        remove_dir_all_if_exists(&self.staged_path())?;
        remove_dir_all_if_exists(&self.versioned_metadata_path()?)?;

        let metadata_root = self.metadata().main_container_path();
        remove_dir_if_empty(&metadata_root)?;
        remove_dir_if_empty(&self.context.layout.cask_dir(&self.definition.token))
    }

    /// Full uninstall of this cask, including every other staged version.
    pub fn uninstall(&self) -> Result<()> {
        self.uninstall_artifacts(None)?;
        self.purge_versioned_files()?;
        self.context.caskroom().remove_record(&self.definition.token)?;
        info!(cask = %self.definition.token, "uninstalled");
        Ok(())
    }

    /// check_conflicts, fetch, stage, install_artifacts.
    pub fn install(&mut self) -> Result<()> {
        self.check_conflicts()?;
        self.fetch()?;
        self.stage()?;
        self.install_artifacts(None)
    }

    fn backup_paths(&self) -> Result<[PathBuf; 2]> {
        Ok([
            backup_path(&self.staged_path()),
            backup_path(&self.versioned_metadata_path()?),
        ])
    }

    fn backup(&self) -> Result<()> {
        let originals = [self.staged_path(), self.versioned_metadata_path()?];
        for (original, backup) in originals.iter().zip(self.backup_paths()?) {
            if !original.exists() {
                continue;
            }
            remove_dir_all_if_exists(&backup)?;
            fs::rename(original, &backup).with_context(|| {
                format!(
                    "failed to back up {} to {}",
                    original.display(),
                    backup.display()
                )
            })?;
        }
        Ok(())
    }

    /// Moves each backup into place. An original still present was never
    /// backed up, so its stale backup is dropped instead.
    fn restore_backup(&self) -> Result<()> {
        let originals = [self.staged_path(), self.versioned_metadata_path()?];
        for (original, backup) in originals.iter().zip(self.backup_paths()?) {
            if fs::symlink_metadata(&backup).is_err() {
                continue;
            }
            if original.exists() {
                debug!(backup = %backup.display(), "dropping stale backup");
                remove_tree(&backup)?;
                continue;
            }
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::rename(&backup, original).with_context(|| {
                format!(
                    "failed to restore {} from {}",
                    original.display(),
                    backup.display()
                )
            })?;
        }
        Ok(())
    }
}

fn artifact_label(artifact: &ArtifactDescriptor) -> String {
    match artifact.target_name() {
        Some(name) => format!("{} '{name}'", artifact.kind()),
        None => artifact.kind().to_string(),
    }
}

fn remove_dir_if_empty(path: &Path) -> Result<()> {
    let is_empty = match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    if is_empty {
        fs::remove_dir(path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn create_symlink(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, destination).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                destination.display(),
                source.display()
            )
        })
    }

    #[cfg(not(unix))]
    {
        fs::copy(source, destination)
            .map(|_| ())
            .with_context(|| format!("failed to copy binary to {}", destination.display()))
    }
}
