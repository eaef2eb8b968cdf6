use std::io;
use std::sync::Arc;

use anyhow::Result;
use caskpack_core::CaskError;
use caskpack_installer::{
    default_user_prefix, CaskLayout, Caskroom, HttpDownloader, InstallContext, ProcessExecutor,
};
use caskpack_lifecycle::{GreedyFlags, LifecycleEngine};
use caskpack_registry::TapCatalog;
use caskpack_resolver::{ResolveError, Resolver};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::command_flows::{
    run_doctor_command, run_info_command, run_install_command, run_list_command,
    run_outdated_command, run_reinstall_command, run_tap_command, run_uninstall_command,
    run_untap_command, run_upgrade_command,
};
use crate::completion::write_completions_script;
use crate::config::CliConfig;
use crate::{Cli, Commands, GreedyArgs};

pub(crate) const LOG_ENV: &str = "CASKPACK_LOG";

pub(crate) fn init_logging(verbose: u8) {
    let default_directive = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        return write_completions_script(shell, &mut io::stdout().lock());
    }

    let prefix = match cli.prefix {
        Some(prefix) => prefix,
        None => default_user_prefix()?,
    };
    let layout = CaskLayout::new(prefix);
    debug!("using prefix {}", layout.prefix().display());
    let config = CliConfig::load(&layout.config_path())?.apply_env(|key| std::env::var(key).ok())?;
    debug!(?config, "loaded configuration");

    match cli.command {
        Commands::Install { casks, force } => {
            run_install_command(&build_engine(&layout, &config)?, casks, force)
        }
        Commands::Upgrade {
            casks,
            greedy,
            dry_run,
        } => run_upgrade_command(
            &build_engine(&layout, &config)?,
            &casks,
            greedy.into(),
            dry_run,
        ),
        Commands::Reinstall { casks } => {
            run_reinstall_command(&build_engine(&layout, &config)?, casks)
        }
        Commands::Uninstall { casks, force } => {
            run_uninstall_command(&build_engine(&layout, &config)?, casks, force)
        }
        Commands::List => run_list_command(&build_engine(&layout, &config)?),
        Commands::Outdated { casks, greedy } => {
            run_outdated_command(&build_engine(&layout, &config)?, &casks, greedy.into())
        }
        Commands::Info { cask, json } => {
            run_info_command(&build_engine(&layout, &config)?, &cask, json)
        }
        Commands::Tap { name, remote } => {
            layout.ensure_base_dirs()?;
            run_tap_command(&build_catalog(&layout, &config)?, &name, remote.as_deref())
        }
        Commands::Untap { name } => run_untap_command(&build_catalog(&layout, &config)?, &name),
        Commands::Doctor { clear_interrupted } => {
            run_doctor_command(&layout, &config, clear_interrupted)
        }
        Commands::Completions { .. } => Ok(()),
    }
}

pub(crate) fn build_catalog(layout: &CaskLayout, config: &CliConfig) -> Result<TapCatalog> {
    Ok(
        TapCatalog::new(layout.taps_dir(), layout.api_dir(), config.default_tap()?)
            .with_install_from_api(config.install_from_api())
            .with_auto_tap(config.auto_tap.unwrap_or(false)),
    )
}

pub(crate) fn build_engine(layout: &CaskLayout, config: &CliConfig) -> Result<LifecycleEngine> {
    layout.ensure_base_dirs()?;
    let downloader = Arc::new(HttpDownloader::new(layout.downloads_cache_dir())?);
    let executor = Arc::new(ProcessExecutor::new(config.use_sudo.unwrap_or(true)));
    let context = InstallContext::new(layout.clone(), downloader, executor);
    let resolver = Resolver::new(build_catalog(layout, config)?, Caskroom::new(layout.clone()));

    Ok(LifecycleEngine::new(resolver, context)
        .with_download_concurrency(config.download_concurrency())
        .with_greedy_allowlist(config.greedy_casks()))
}

/// 2 unresolvable, 3 installation state, 4 conflict, 5 several failures,
/// 6 an upgrade that could not be rolled back.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<CaskError>() {
        return match err {
            CaskError::NotInstalled { .. } | CaskError::AlreadyInstalled { .. } => 3,
            CaskError::ConflictDetected { .. } => 4,
            CaskError::MultipleErrors { .. } => 5,
            CaskError::RollbackFailed { .. } => 6,
        };
    }
    if err.downcast_ref::<ResolveError>().is_some() {
        return 2;
    }
    1
}

impl From<GreedyArgs> for GreedyFlags {
    fn from(value: GreedyArgs) -> Self {
        GreedyFlags {
            greedy: value.greedy,
            greedy_latest: value.greedy_latest,
            greedy_auto_updates: value.greedy_auto_updates,
        }
    }
}
