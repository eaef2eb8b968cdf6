use anyhow::{bail, Context, Result};
use caskpack_core::{normalize_token, CaskError, PackageDefinition};
use caskpack_installer::{interrupted_upgrade, CaskInstaller, UpgradeJournal};
use caskpack_resolver::ResolveOptions;
use tracing::{debug, info, warn};

use crate::engine::{batch_result, LifecycleEngine};
use crate::outdated::{is_outdated, GreedyFlags, OutdatedCask};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeOptions {
    pub greedy: GreedyFlags,
    /// Select casks without touching the prefix.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeReport {
    pub planned: Vec<OutdatedCask>,
    pub upgraded: Vec<String>,
}

/// How far one upgrade got; decides which compensations run. `started` and
/// `staging` are set before their step runs so a step that fails halfway is
/// undone too. `install_artifacts` cleans up after itself.
#[derive(Debug, Clone, Copy, Default)]
struct UpgradeProgress {
    started: bool,
    staging: bool,
    new_artifacts_installed: bool,
}

/// Steps of one upgrade, in order; the names double as journal steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeStep {
    CheckConflicts,
    Fetch,
    StartUpgrade,
    Stage,
    InstallArtifacts,
    FinalizeUpgrade,
}

impl UpgradeStep {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::CheckConflicts => "check_conflicts",
            Self::Fetch => "fetch",
            Self::StartUpgrade => "start_upgrade",
            Self::Stage => "stage",
            Self::InstallArtifacts => "install_artifacts",
            Self::FinalizeUpgrade => "finalize_upgrade",
        }
    }
}

impl LifecycleEngine {
    /// Installed casks with a newer definition, or in a greedy category the
    /// flags enable. An empty `tokens` means every installed cask; casks that
    /// fail to resolve are then skipped instead of failing the listing.
    pub fn outdated(&self, tokens: &[String], flags: GreedyFlags) -> Result<Vec<OutdatedCask>> {
        let explicit = !tokens.is_empty();
        let installed = if explicit {
            let mut installed = Vec::new();
            for token in tokens {
                let token = normalize_token(token);
                if !self.caskroom().is_installed(&token) {
                    return Err(CaskError::NotInstalled { token }.into());
                }
                installed.push(
                    self.resolver
                        .load_prefer_installed(&token, ResolveOptions::quiet())?,
                );
            }
            installed
        } else {
            self.resolver.installed_definitions()?
        };

        let mut outdated = Vec::new();
        for definition in installed {
            let current = match self
                .resolver
                .resolve(definition.qualified_token(), ResolveOptions::default())
            {
                Ok(current) => current,
                Err(err) if !explicit => {
                    debug!("skipping '{}' while checking for updates: {err}", definition.token);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let flags = flags.with_allowlisted(self.is_allowlisted(&definition.token));
            if is_outdated(&definition.version, &current, flags) {
                outdated.push(OutdatedCask {
                    installed: definition,
                    current,
                });
            }
        }
        Ok(outdated)
    }

    /// Upgrades every outdated cask among `tokens` (all installed casks when
    /// empty). All artifacts are fetched before the first cask is touched;
    /// the casks are then upgraded one at a time and failures are reported
    /// together at the end. A failed rollback stops the batch.
    pub fn upgrade(&self, tokens: &[String], options: UpgradeOptions) -> Result<UpgradeReport> {
        if !options.dry_run {
            self.ensure_no_interrupted_upgrade()?;
        }

        let planned = self.outdated(tokens, options.greedy)?;
        let mut report = UpgradeReport {
            planned,
            upgraded: Vec::new(),
        };
        if options.dry_run || report.planned.is_empty() {
            return Ok(report);
        }

        let targets = report
            .planned
            .iter()
            .map(|item| item.current.clone())
            .collect::<Vec<_>>();
        self.prefetch(&targets)?;

        let (upgraded, errors) = upgrade_each(&report.planned, |item| {
            self.upgrade_cask(&item.installed, &item.current)
        });
        report.upgraded = upgraded;
        batch_result(errors)?;
        Ok(report)
    }

    /// Replaces `old` with `new`. Any failure runs the compensations for the
    /// steps already taken before the error is returned, so exactly one of
    /// the two versions stays installed. A failing compensation yields
    /// [`CaskError::RollbackFailed`] carrying both errors and leaves the
    /// transaction marker in place.
    pub fn upgrade_cask(&self, old: &PackageDefinition, new: &PackageDefinition) -> Result<()> {
        self.upgrade_cask_with_hooks(old, new, |_| Ok(()))
    }

    /// `before_step` runs ahead of every step; its error fails that step.
    pub(crate) fn upgrade_cask_with_hooks<BeforeStep>(
        &self,
        old: &PackageDefinition,
        new: &PackageDefinition,
        before_step: BeforeStep,
    ) -> Result<()>
    where
        BeforeStep: FnMut(UpgradeStep) -> Result<()>,
    {
        let old_installer = CaskInstaller::new(old.clone(), self.context.clone());
        let mut new_installer = CaskInstaller::new(new.clone(), self.context.clone());
        let mut journal =
            UpgradeJournal::begin(&self.context.layout, &new.token, &old.version, &new.version)?;
        let mut progress = UpgradeProgress::default();

        match apply_upgrade(
            &old_installer,
            &mut new_installer,
            &mut journal,
            &mut progress,
            before_step,
        ) {
            Ok(()) => {
                journal.commit()?;
                info!(
                    cask = %new.token,
                    from = %old.version,
                    to = %new.version,
                    "upgraded"
                );
                Ok(())
            }
            Err(err) => {
                warn!(cask = %new.token, "upgrade failed, rolling back: {err:#}");
                if let Err(rollback) =
                    roll_back(&old_installer, &new_installer, &mut journal, progress)
                {
                    return Err(CaskError::RollbackFailed {
                        token: new.token.clone(),
                        cause: err,
                        rollback,
                    }
                    .into());
                }
                journal.rolled_back()?;
                Err(err)
            }
        }
    }

    fn ensure_no_interrupted_upgrade(&self) -> Result<()> {
        if let Some(interrupted) = interrupted_upgrade(&self.context.layout)? {
            let token = interrupted
                .metadata
                .as_ref()
                .map(|metadata| metadata.token.as_str())
                .unwrap_or("unknown");
            bail!(
                "an interrupted upgrade of '{token}' (txid={}) needs attention; run `caskpack doctor` to inspect it",
                interrupted.txid
            );
        }
        Ok(())
    }
}

/// Upgrades `planned` in order, collecting failures. A failed rollback ends
/// the batch since the prefix then needs attention first.
pub(crate) fn upgrade_each<UpgradeOne>(
    planned: &[OutdatedCask],
    mut upgrade_one: UpgradeOne,
) -> (Vec<String>, Vec<anyhow::Error>)
where
    UpgradeOne: FnMut(&OutdatedCask) -> Result<()>,
{
    let mut upgraded = Vec::new();
    let mut errors = Vec::new();
    for item in planned {
        let token = item.current.full_token();
        match upgrade_one(item).with_context(|| format!("failed to upgrade cask '{token}'")) {
            Ok(()) => upgraded.push(item.token().to_string()),
            Err(err) if is_rollback_failure(&err) => {
                warn!(cask = %token, "stopping the batch after a failed rollback");
                errors.push(err);
                break;
            }
            Err(err) => errors.push(err),
        }
    }
    (upgraded, errors)
}

fn is_rollback_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::RollbackFailed { .. })
    )
}

fn apply_upgrade<BeforeStep>(
    old: &CaskInstaller,
    new: &mut CaskInstaller,
    journal: &mut UpgradeJournal,
    progress: &mut UpgradeProgress,
    mut before_step: BeforeStep,
) -> Result<()>
where
    BeforeStep: FnMut(UpgradeStep) -> Result<()>,
{
    before_step(UpgradeStep::CheckConflicts)?;
    new.check_conflicts()?;
    journal.record(UpgradeStep::CheckConflicts.as_str(), "done")?;

    before_step(UpgradeStep::Fetch)?;
    new.fetch()?;
    journal.record(UpgradeStep::Fetch.as_str(), "done")?;

    journal.record(UpgradeStep::StartUpgrade.as_str(), "applying")?;
    progress.started = true;
    before_step(UpgradeStep::StartUpgrade)?;
    old.start_upgrade(new.definition())?;
    journal.record(UpgradeStep::StartUpgrade.as_str(), "done")?;

    progress.staging = true;
    before_step(UpgradeStep::Stage)?;
    new.stage()?;
    journal.record(UpgradeStep::Stage.as_str(), "done")?;

    before_step(UpgradeStep::InstallArtifacts)?;
    new.install_artifacts(Some(old.definition()))?;
    progress.new_artifacts_installed = true;
    journal.record(UpgradeStep::InstallArtifacts.as_str(), "done")?;

    before_step(UpgradeStep::FinalizeUpgrade)?;
    old.finalize_upgrade()?;
    journal.record(UpgradeStep::FinalizeUpgrade.as_str(), "done")?;
    Ok(())
}

fn roll_back(
    old: &CaskInstaller,
    new: &CaskInstaller,
    journal: &mut UpgradeJournal,
    progress: UpgradeProgress,
) -> Result<()> {
    if progress.new_artifacts_installed {
        new.uninstall_artifacts(Some(old.definition()))?;
        journal.record("rollback_uninstall_artifacts", "done")?;
    }

    // Same version: both installers own the same paths, which are the new
    // installation's only once staging has begun.
    if progress.staging || old.version() != new.version() {
        new.purge_versioned_files()?;
        journal.record("rollback_purge", "done")?;
    }

    if progress.started {
        old.revert_upgrade(new.definition())?;
        journal.record("rollback_revert", "done")?;
    }
    Ok(())
}
