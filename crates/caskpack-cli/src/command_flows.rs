use std::path::Path;

use anyhow::{Context, Result};
use caskpack_core::{ArtifactDescriptor, CaskRecord, PackageDefinition, TapName};
use caskpack_installer::{clear_active_transaction, interrupted_upgrade, CaskLayout, InterruptedUpgrade};
use caskpack_lifecycle::{
    GreedyFlags, InstallOptions, LifecycleEngine, OutdatedCask, UninstallOptions, UpgradeOptions,
};
use caskpack_registry::TapCatalog;
use caskpack_resolver::{Reference, ResolveOptions};

use crate::config::CliConfig;
use crate::dispatch::build_catalog;
use crate::render::TerminalRenderer;

const NO_OUTDATED_CASKS: &str = "No outdated casks";
const GREEDY_HINT: &str =
    "casks with version latest or auto_updates are skipped; pass --greedy to include them";

/// Existing `.cask`/`.json` files are passed as paths, everything else as
/// text for the loader chain.
pub(crate) fn reference_from_arg(arg: String) -> Reference {
    let path = Path::new(&arg);
    let is_definition_file = path.is_file()
        && path
            .extension()
            .is_some_and(|ext| ext == "cask" || ext == "json");
    if is_definition_file {
        Reference::Path(path.to_path_buf())
    } else {
        Reference::Text(arg)
    }
}

pub(crate) fn run_install_command(
    engine: &LifecycleEngine,
    casks: Vec<String>,
    force: bool,
) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let references = casks.into_iter().map(reference_from_arg).collect();

    let spinner = renderer.start_spinner("install");
    let installed = match engine.install(references, InstallOptions { force }) {
        Ok(installed) => {
            spinner.finish_success();
            installed
        }
        Err(err) => {
            spinner.finish_abandon();
            return Err(err);
        }
    };

    for definition in &installed {
        renderer.print_status("ok", &format_installed_line("installed", definition));
    }
    Ok(())
}

pub(crate) fn run_reinstall_command(engine: &LifecycleEngine, casks: Vec<String>) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let references = casks.into_iter().map(reference_from_arg).collect();

    let spinner = renderer.start_spinner("reinstall");
    let reinstalled = match engine.reinstall(references) {
        Ok(reinstalled) => {
            spinner.finish_success();
            reinstalled
        }
        Err(err) => {
            spinner.finish_abandon();
            return Err(err);
        }
    };

    for definition in &reinstalled {
        renderer.print_status("ok", &format_installed_line("reinstalled", definition));
    }
    Ok(())
}

pub(crate) fn run_upgrade_command(
    engine: &LifecycleEngine,
    casks: &[String],
    greedy: GreedyFlags,
    dry_run: bool,
) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let options = UpgradeOptions { greedy, dry_run };

    let spinner = (!dry_run).then(|| renderer.start_spinner("upgrade"));
    let result = engine.upgrade(casks, options);
    if let Some(spinner) = spinner {
        match &result {
            Ok(_) => spinner.finish_success(),
            Err(_) => spinner.finish_abandon(),
        }
    }
    let report = result?;

    if report.planned.is_empty() {
        renderer.print_lines(&format_empty_selection_lines(greedy));
        return Ok(());
    }
    if dry_run {
        renderer.print_section("Would upgrade");
        renderer.print_lines(&format_outdated_lines(&report.planned));
        return Ok(());
    }

    for item in report
        .planned
        .iter()
        .filter(|item| report.upgraded.iter().any(|token| token == item.token()))
    {
        renderer.print_status("ok", &format!("upgraded {}", item.describe()));
    }
    Ok(())
}

pub(crate) fn run_uninstall_command(
    engine: &LifecycleEngine,
    casks: Vec<String>,
    force: bool,
) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let references = casks.into_iter().map(reference_from_arg).collect();
    let report = engine.uninstall(references, UninstallOptions { force })?;

    if !report.dependents.is_empty() {
        renderer.print_status(
            "warn",
            &format!(
                "still required by installed casks: {}",
                report.dependents.join(", ")
            ),
        );
    }
    for token in &report.removed {
        renderer.print_status("ok", &format!("uninstalled {token}"));
    }
    Ok(())
}

pub(crate) fn run_list_command(engine: &LifecycleEngine) -> Result<()> {
    let caskroom = engine.caskroom();
    let mut entries = Vec::new();
    for token in caskroom.tokens()? {
        let version = caskroom.installed_version(&token)?;
        entries.push((token, version));
    }
    TerminalRenderer::current().print_lines(&format_list_lines(&entries));
    Ok(())
}

pub(crate) fn run_outdated_command(
    engine: &LifecycleEngine,
    casks: &[String],
    greedy: GreedyFlags,
) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let outdated = engine.outdated(casks, greedy)?;
    if outdated.is_empty() {
        renderer.print_lines(&format_empty_selection_lines(greedy));
    } else {
        renderer.print_lines(&format_outdated_lines(&outdated));
    }
    Ok(())
}

pub(crate) fn run_info_command(engine: &LifecycleEngine, cask: &str, json: bool) -> Result<()> {
    let definition = engine
        .resolver()
        .resolve(reference_from_arg(cask.to_string()), ResolveOptions::default())?;

    if json {
        let record = CaskRecord::from(&definition);
        let rendered =
            serde_json::to_string_pretty(&record).context("failed to serialize cask record")?;
        println!("{rendered}");
        return Ok(());
    }

    let installed_version = engine.caskroom().installed_version(&definition.token)?;
    TerminalRenderer::current()
        .print_lines(&format_info_lines(&definition, installed_version.as_deref()));
    Ok(())
}

pub(crate) fn run_tap_command(catalog: &TapCatalog, name: &str, remote: Option<&str>) -> Result<()> {
    let name = TapName::parse(name)?;
    let tap = catalog.add_tap(&name, remote)?;
    let casks = tap.cask_tokens()?.len();
    let revision = catalog.tap_revision(&name)?;

    let mut line = format!("tapped {name} ({casks} casks)");
    if let Some(revision) = revision {
        line.push_str(&format!(" at {}", short_revision(&revision)));
    }
    TerminalRenderer::current().print_status("ok", &line);
    Ok(())
}

pub(crate) fn run_untap_command(catalog: &TapCatalog, name: &str) -> Result<()> {
    let name = TapName::parse(name)?;
    catalog.remove_tap(&name)?;
    TerminalRenderer::current().print_status("ok", &format!("untapped {name}"));
    Ok(())
}

pub(crate) fn run_doctor_command(
    layout: &CaskLayout,
    config: &CliConfig,
    clear_interrupted: bool,
) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let catalog = build_catalog(layout, config)?;
    let default_tap = catalog.default_tap();
    let interrupted = interrupted_upgrade(layout)?;

    let mut lines = vec![
        format!("prefix: {}", layout.prefix().display()),
        format!("caskroom: {}", layout.caskroom_dir().display()),
        format!(
            "default tap: {} ({})",
            default_tap.name(),
            if default_tap.is_installed() {
                "installed"
            } else if catalog.install_from_api() {
                "served from API"
            } else {
                "missing"
            }
        ),
    ];
    lines.push(format_transaction_health_line(interrupted.as_ref()));
    renderer.print_lines(&lines);

    if clear_interrupted {
        match interrupted {
            Some(interrupted) => {
                clear_active_transaction(layout)?;
                renderer.print_status(
                    "ok",
                    &format!("cleared interrupted upgrade txid={}", interrupted.txid),
                );
            }
            None => renderer.print_status("skip", "no interrupted upgrade to clear"),
        }
    }
    Ok(())
}

pub(crate) fn format_installed_line(verb: &str, definition: &PackageDefinition) -> String {
    format!("{verb} {} {}", definition.full_token(), definition.version)
}

pub(crate) fn format_outdated_lines(outdated: &[OutdatedCask]) -> Vec<String> {
    outdated
        .iter()
        .map(|item| {
            format!(
                "{} ({}) != {}",
                item.current.full_token(),
                item.installed.version,
                item.current.version
            )
        })
        .collect()
}

pub(crate) fn format_empty_selection_lines(greedy: GreedyFlags) -> Vec<String> {
    let mut lines = vec![NO_OUTDATED_CASKS.to_string()];
    if !greedy.any() {
        lines.push(GREEDY_HINT.to_string());
    }
    lines
}

pub(crate) fn format_list_lines(entries: &[(String, Option<String>)]) -> Vec<String> {
    entries
        .iter()
        .map(|(token, version)| match version {
            Some(version) => format!("{token} {version}"),
            None => token.clone(),
        })
        .collect()
}

pub(crate) fn format_info_lines(
    definition: &PackageDefinition,
    installed_version: Option<&str>,
) -> Vec<String> {
    let mut lines = vec![format!("{}: {}", definition.full_token(), definition.version)];
    if !definition.names.is_empty() {
        lines.push(definition.names.join(", "));
    }
    if let Some(desc) = &definition.desc {
        lines.push(desc.clone());
    }
    if let Some(homepage) = &definition.homepage {
        lines.push(homepage.clone());
    }
    if let Some(tap) = &definition.tap {
        lines.push(format!("From: {tap}"));
    } else if let Some(path) = &definition.source_path {
        lines.push(format!("From: {}", path.display()));
    }
    lines.push(match installed_version {
        Some(version) => format!("Installed: {version}"),
        None => "Not installed".to_string(),
    });
    if !definition.depends_on.is_empty() {
        lines.push(format!("Depends on: {}", definition.depends_on.join(", ")));
    }
    if !definition.conflicts_with.is_empty() {
        lines.push(format!(
            "Conflicts with: {}",
            definition.conflicts_with.join(", ")
        ));
    }
    if !definition.artifacts.is_empty() {
        lines.push("Artifacts:".to_string());
        lines.extend(definition.artifacts.iter().map(format_artifact));
    }
    lines
}

pub(crate) fn format_transaction_health_line(interrupted: Option<&InterruptedUpgrade>) -> String {
    let Some(interrupted) = interrupted else {
        return "transactions: ok".to_string();
    };
    let cask = interrupted
        .metadata
        .as_ref()
        .map(|metadata| {
            format!(
                " cask={} {} -> {}",
                metadata.token, metadata.from_version, metadata.to_version
            )
        })
        .unwrap_or_default();
    let step = interrupted
        .last_entry
        .as_ref()
        .map(|entry| format!(" last_step={}:{}", entry.step, entry.state))
        .unwrap_or_default();
    format!(
        "transactions: interrupted upgrade txid={}{cask}{step}",
        interrupted.txid
    )
}

fn format_artifact(artifact: &ArtifactDescriptor) -> String {
    match artifact {
        ArtifactDescriptor::Pkg { path } => format!("  {path} (pkg)"),
        ArtifactDescriptor::Uninstall { pkgutil } => {
            format!("  pkgutil {} (uninstall)", pkgutil.join(", "))
        }
        _ => format!(
            "  {} ({})",
            artifact.target_name().unwrap_or_default(),
            artifact.kind()
        ),
    }
}

fn short_revision(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
