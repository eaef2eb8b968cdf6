use std::collections::BTreeSet;

use anyhow::{Context, Result};
use caskpack_core::{normalize_token, CaskError, PackageDefinition};
use caskpack_installer::{CaskInstaller, Caskroom, DownloadQueue, InstallContext};
use caskpack_resolver::{Reference, ResolveOptions, Resolver};
use tracing::{debug, info, warn};

use crate::dependents::installed_dependents;

pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Reinstall casks that are already installed instead of failing.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UninstallOptions {
    /// Remove whatever is left even when the cask is not installed.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallReport {
    pub removed: Vec<String>,
    /// Installed casks that still require one of the removed casks.
    pub dependents: Vec<String>,
}

/// Install, upgrade, reinstall and uninstall over one resolver and one
/// prefix.
pub struct LifecycleEngine {
    pub(crate) resolver: Resolver,
    pub(crate) context: InstallContext,
    pub(crate) download_concurrency: usize,
    pub(crate) greedy_allowlist: BTreeSet<String>,
}

impl LifecycleEngine {
    pub fn new(resolver: Resolver, context: InstallContext) -> Self {
        Self {
            resolver,
            context,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            greedy_allowlist: BTreeSet::new(),
        }
    }

    pub fn with_download_concurrency(mut self, concurrency: usize) -> Self {
        self.download_concurrency = concurrency.max(1);
        self
    }

    /// Tokens always upgraded as if `--greedy` were given.
    pub fn with_greedy_allowlist<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.greedy_allowlist = tokens
            .into_iter()
            .map(|token| normalize_token(token.as_ref()))
            .filter(|token| !token.is_empty())
            .collect();
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn context(&self) -> &InstallContext {
        &self.context
    }

    pub fn caskroom(&self) -> &Caskroom {
        self.resolver.caskroom()
    }

    pub fn is_allowlisted(&self, token: &str) -> bool {
        self.greedy_allowlist.contains(token)
    }

    /// Resolves every reference, fetches all artifacts up front, then
    /// installs one cask at a time. A cask named twice is installed once.
    pub fn install(
        &self,
        references: Vec<Reference>,
        options: InstallOptions,
    ) -> Result<Vec<PackageDefinition>> {
        let mut errors = Vec::new();
        let mut pending = Vec::new();
        let mut seen = BTreeSet::new();
        for reference in references {
            let definition = self.resolver.resolve(reference, ResolveOptions::default())?;
            if !seen.insert(definition.token.clone()) {
                debug!(cask = %definition.token, "skipping duplicate reference");
                continue;
            }
            if self.caskroom().is_installed(&definition.token) && !options.force {
                errors.push(
                    CaskError::AlreadyInstalled {
                        token: definition.token.clone(),
                    }
                    .into(),
                );
                continue;
            }
            pending.push(definition);
        }

        self.prefetch(&pending)?;

        let mut installed = Vec::new();
        for definition in pending {
            let token = definition.full_token();
            let result = if self.caskroom().is_installed(&definition.token) {
                self.replace_installation(definition.clone())
            } else {
                CaskInstaller::new(definition.clone(), self.context.clone()).install()
            };
            match result.with_context(|| format!("failed to install cask '{token}'")) {
                Ok(()) => {
                    info!(cask = %token, version = %definition.version, "installed");
                    installed.push(definition);
                }
                Err(err) => errors.push(err),
            }
        }

        batch_result(errors)?;
        Ok(installed)
    }

    /// Installs each reference again over whatever is installed now.
    pub fn reinstall(&self, references: Vec<Reference>) -> Result<Vec<PackageDefinition>> {
        self.install(references, InstallOptions { force: true })
    }

    /// Removes every referenced cask. Installed casks that still require one
    /// of them are reported, not treated as an error. With `force`, references
    /// that are neither installed nor resolvable are skipped.
    pub fn uninstall(
        &self,
        references: Vec<Reference>,
        options: UninstallOptions,
    ) -> Result<UninstallReport> {
        let mut definitions: Vec<PackageDefinition> = Vec::new();
        for reference in references {
            let bare_token = reference.bare_token();
            if let Some(token) = &bare_token {
                if !self.caskroom().is_installed(token) && !options.force {
                    return Err(CaskError::NotInstalled {
                        token: token.clone(),
                    }
                    .into());
                }
            }

            let described = reference.describe();
            let definition = match self.installed_or_resolved(reference) {
                Ok(definition) => definition,
                Err(err)
                    if options.force
                        && !bare_token
                            .as_deref()
                            .is_some_and(|token| self.caskroom().is_installed(token)) =>
                {
                    warn!("nothing to uninstall for '{described}': {err:#}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !self.caskroom().is_installed(&definition.token) && !options.force {
                return Err(CaskError::NotInstalled {
                    token: definition.token,
                }
                .into());
            }
            if definitions
                .iter()
                .any(|existing| existing.token == definition.token)
            {
                continue;
            }
            definitions.push(definition);
        }

        let removing = definitions
            .iter()
            .map(|definition| definition.token.clone())
            .collect::<BTreeSet<_>>();
        let installed = self.resolver.installed_definitions()?;
        let dependents = installed_dependents(&installed, &removing);
        if !dependents.is_empty() {
            warn!(
                "{} still required by installed casks: {}",
                removing.iter().cloned().collect::<Vec<_>>().join(", "),
                dependents.join(", ")
            );
        }

        let mut errors = Vec::new();
        let mut removed = Vec::new();
        for definition in definitions {
            let token = definition.token.clone();
            match CaskInstaller::new(definition, self.context.clone())
                .uninstall()
                .with_context(|| format!("failed to uninstall cask '{token}'"))
            {
                Ok(()) => removed.push(token),
                Err(err) => errors.push(err),
            }
        }

        batch_result(errors)?;
        Ok(UninstallReport {
            removed,
            dependents,
        })
    }

    /// Fetches every definition concurrently; returns once all fetches ended.
    pub(crate) fn prefetch(&self, definitions: &[PackageDefinition]) -> Result<()> {
        if definitions.is_empty() {
            return Ok(());
        }
        let mut queue =
            DownloadQueue::new(self.context.downloader.clone(), self.download_concurrency)?;
        for definition in definitions {
            queue.enqueue(definition.clone());
        }
        debug!(count = queue.len(), "fetching artifacts");
        queue.flush()
    }

    /// The installed caskfile for bare tokens, otherwise regular resolution
    /// upgraded to the installed caskfile when one exists.
    fn installed_or_resolved(&self, reference: Reference) -> Result<PackageDefinition> {
        let options = ResolveOptions::default();
        if let Some(token) = reference.bare_token() {
            return Ok(self.resolver.load_prefer_installed(&token, options)?);
        }
        let definition = self.resolver.resolve(reference, options)?;
        if self.caskroom().is_installed(&definition.token) {
            return Ok(self
                .resolver
                .load_prefer_installed(&definition.token, options)?);
        }
        Ok(definition)
    }

    /// Takes down the current installation of `definition.token`, keeping
    /// package receipts, and installs `definition` in its place.
    fn replace_installation(&self, definition: PackageDefinition) -> Result<()> {
        let current = self
            .resolver
            .load_prefer_installed(&definition.token, ResolveOptions::quiet())
            .unwrap_or_else(|err| {
                debug!("using the new definition to remove '{}': {err}", definition.token);
                definition.clone()
            });

        let mut installer = CaskInstaller::new(definition.clone(), self.context.clone());
        installer.check_conflicts()?;
        installer.fetch()?;

        let previous = CaskInstaller::new(current, self.context.clone());
        previous.uninstall_artifacts(Some(&definition))?;
        previous.purge_versioned_files()?;

        installer.stage()?;
        installer.install_artifacts(Some(previous.definition()))
    }
}

/// Nothing failed, one failure as itself, or all of them together.
pub(crate) fn batch_result(mut errors: Vec<anyhow::Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(CaskError::MultipleErrors { errors }.into()),
    }
}
