use super::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use caskpack_core::{CaskError, DefinitionBuilder, PackageDefinition, TapName, DEFAULT_TAP};
use caskpack_installer::{
    backup_path, read_active_transaction, read_transaction_journal, read_transaction_metadata,
    set_active_transaction, CaskLayout, Caskroom, CommandOutput, Downloader, InstallContext,
    SystemCommand, SystemExecutor, TransactionStatus,
};
use caskpack_registry::TapCatalog;
use caskpack_resolver::Resolver;

use crate::upgrade::{upgrade_each, UpgradeStep};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[test]
fn install_places_app_and_refuses_a_second_install() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);

    let installed = fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    assert_eq!(installed.len(), 1);
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");

    let err = fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect_err("second install must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::AlreadyInstalled { token }) if token == "widget"
    ));

    fixture.cleanup();
}

#[test]
fn forced_install_replaces_the_current_installation() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");

    fixture.publish("widget", "1.1", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions { force: true })
        .expect("forced install must succeed");

    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.1");
    assert_eq!(fixture.staged_versions("widget"), vec!["1.1"]);

    fixture.cleanup();
}

#[test]
fn reinstall_restores_removed_artifacts() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    fs::remove_file(fixture.layout.app_dir().join("Widget.app")).expect("must remove app");

    fixture
        .engine
        .reinstall(vec!["widget".into()])
        .expect("must reinstall");

    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert_eq!(fixture.staged_versions("widget"), vec!["1.0"]);

    fixture.cleanup();
}

#[test]
fn install_fetches_every_cask_before_installing_any() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture.publish("gadget", "1.0", &[]);
    fixture.downloader.fail("gadget");

    let err = fixture
        .engine
        .install(
            vec!["widget".into(), "gadget".into()],
            InstallOptions::default(),
        )
        .expect_err("failed fetch must abort");
    assert!(format!("{err:#}").contains("failed to fetch cask 'gadget'"), "{err:#}");
    assert!(!fixture.layout.cask_dir("widget").exists());

    fixture.cleanup();
}

#[test]
fn uninstall_requires_an_installation_unless_forced() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);

    let err = fixture
        .engine
        .uninstall(vec!["widget".into()], UninstallOptions::default())
        .expect_err("uninstalling a missing cask must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::NotInstalled { token }) if token == "widget"
    ));

    let report = fixture
        .engine
        .uninstall(vec!["widget".into()], UninstallOptions { force: true })
        .expect("forced uninstall must succeed");
    assert_eq!(report.removed, vec!["widget"]);

    fixture.cleanup();
}

#[test]
fn uninstall_of_an_unknown_token_is_not_installed_unless_forced() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");

    let err = fixture
        .engine
        .uninstall(vec!["bar".into()], UninstallOptions::default())
        .expect_err("unknown cask must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::NotInstalled { token }) if token == "bar"
    ));

    let report = fixture
        .engine
        .uninstall(vec!["bar".into()], UninstallOptions { force: true })
        .expect("forced uninstall of an unknown cask must be a no-op");
    assert!(report.removed.is_empty());
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");

    let report = fixture
        .engine
        .uninstall(
            vec!["bar".into(), "widget".into()],
            UninstallOptions { force: true },
        )
        .expect("forced uninstall must remove the known cask");
    assert_eq!(report.removed, vec!["widget"]);

    fixture.cleanup();
}

#[test]
fn install_names_the_same_cask_twice_installs_once() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);

    let installed = fixture
        .engine
        .install(
            vec!["widget".into(), "widget".into()],
            InstallOptions::default(),
        )
        .expect("duplicate reference must not fail");
    assert_eq!(installed.len(), 1);
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert_eq!(fixture.staged_versions("widget"), vec!["1.0"]);

    fixture.cleanup();
}

#[test]
fn uninstall_warns_about_transitive_dependents_without_blocking() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture.publish("gadget", "1.0", &["depends_on cask: \"widget\""]);
    fixture.publish("gizmo", "1.0", &["depends_on cask: \"gadget\""]);
    fixture.publish("other", "1.0", &[]);
    fixture
        .engine
        .install(
            vec![
                "widget".into(),
                "gadget".into(),
                "gizmo".into(),
                "other".into(),
            ],
            InstallOptions::default(),
        )
        .expect("must install");

    let report = fixture
        .engine
        .uninstall(vec!["widget".into()], UninstallOptions::default())
        .expect("dependents must not block uninstall");
    assert_eq!(report.removed, vec!["widget"]);
    assert_eq!(report.dependents, vec!["gadget", "gizmo"]);
    assert!(!fixture.layout.cask_dir("widget").exists());
    assert!(!fixture.layout.app_dir().join("Widget.app").exists());
    assert_eq!(fixture.app_contents("Gadget.app"), "gadget 1.0");

    fixture.cleanup();
}

#[test]
fn installed_dependents_handle_requirement_cycles() {
    let installed = vec![
        definition_requiring("a", &["b"]),
        definition_requiring("b", &["a"]),
        definition_requiring("c", &["d"]),
        definition_requiring("d", &[]),
    ];
    let removing = BTreeSet::from(["d".to_string()]);
    assert_eq!(installed_dependents(&installed, &removing), vec!["c"]);

    let removing = BTreeSet::from(["a".to_string()]);
    assert_eq!(installed_dependents(&installed, &removing), vec!["b"]);
}

#[test]
fn outdated_compares_installed_and_current_versions() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture.publish("gadget", "1.0", &[]);
    fixture
        .engine
        .install(
            vec!["widget".into(), "gadget".into()],
            InstallOptions::default(),
        )
        .expect("must install");
    fixture.publish("widget", "2.0", &[]);

    let outdated = fixture
        .engine
        .outdated(&[], GreedyFlags::default())
        .expect("must list outdated");
    let summary = outdated
        .iter()
        .map(|item| item.describe())
        .collect::<Vec<_>>();
    assert_eq!(summary, vec!["widget 1.0 -> 2.0"]);

    let err = fixture
        .engine
        .outdated(&["missing".to_string()], GreedyFlags::default())
        .expect_err("unknown token must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::NotInstalled { .. })
    ));

    fixture.cleanup();
}

#[test]
fn greedy_flags_select_latest_and_auto_updating_casks() {
    let latest = definition_with("nightly", "latest", false);
    let auto = definition_with("updater", "3.0", true);
    let plain = definition_with("plain", "1.0", false);

    let none = GreedyFlags::default();
    assert!(!is_outdated("latest", &latest, none));
    assert!(!is_outdated("3.0", &auto, none));
    assert!(is_outdated("0.9", &plain, none));

    let latest_only = GreedyFlags {
        greedy_latest: true,
        ..GreedyFlags::default()
    };
    assert!(is_outdated("latest", &latest, latest_only));
    assert!(!is_outdated("3.0", &auto, latest_only));

    let auto_only = GreedyFlags {
        greedy_auto_updates: true,
        ..GreedyFlags::default()
    };
    assert!(!is_outdated("latest", &latest, auto_only));
    assert!(is_outdated("3.0", &auto, auto_only));

    let allowlisted = none.with_allowlisted(true);
    assert!(is_outdated("latest", &latest, allowlisted));
    assert!(is_outdated("3.0", &auto, allowlisted));
    assert!(!is_outdated("1.0", &plain, allowlisted));
}

#[test]
fn allowlisted_tokens_are_upgraded_greedily() {
    let fixture = Fixture::with_allowlist(&["nightly"]);
    fixture.publish("nightly", "latest", &[]);
    fixture.publish("daily", "latest", &[]);
    fixture
        .engine
        .install(
            vec!["nightly".into(), "daily".into()],
            InstallOptions::default(),
        )
        .expect("must install");

    let outdated = fixture
        .engine
        .outdated(&[], GreedyFlags::default())
        .expect("must list outdated");
    let tokens = outdated.iter().map(OutdatedCask::token).collect::<Vec<_>>();
    assert_eq!(tokens, vec!["nightly"]);

    fixture.cleanup();
}

#[test]
fn outdated_keeps_the_tap_a_cask_was_installed_from() {
    let fixture = Fixture::new();
    fixture.publish_in("acme/tools", "widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["acme/tools/widget".into()], InstallOptions::default())
        .expect("must install from tap");
    fixture.publish("widget", "9.0", &[]);

    let outdated = fixture
        .engine
        .outdated(&["widget".to_string()], GreedyFlags::default())
        .expect("must list outdated");
    assert!(outdated.is_empty(), "{outdated:?}");
    assert!(fixture
        .engine
        .outdated(&[], GreedyFlags::default())
        .expect("must list outdated")
        .is_empty());

    fixture.publish_in("acme/tools", "widget", "2.0", &[]);
    let outdated = fixture
        .engine
        .outdated(&["widget".to_string()], GreedyFlags::default())
        .expect("must list outdated");
    assert_eq!(outdated.len(), 1);
    assert_eq!(
        outdated[0].installed.tap,
        Some(TapName::parse("acme/tools").expect("tap name must parse"))
    );
    assert_eq!(outdated[0].current.version, "2.0");
    assert_eq!(outdated[0].current.qualified_token(), "acme/tools/widget");

    fixture.cleanup();
}

#[test]
fn upgrade_replaces_old_version_and_commits_journal() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    fixture.publish("widget", "2.0", &[]);

    let report = fixture
        .engine
        .upgrade(&[], UpgradeOptions::default())
        .expect("must upgrade");
    assert_eq!(report.upgraded, vec!["widget"]);
    assert_eq!(fixture.app_contents("Widget.app"), "widget 2.0");
    assert_eq!(fixture.staged_versions("widget"), vec!["2.0"]);
    assert_eq!(
        fixture
            .caskroom()
            .installed_version("widget")
            .expect("must read")
            .as_deref(),
        Some("2.0")
    );
    assert_eq!(fixture.transaction_statuses(), vec![TransactionStatus::Committed]);
    assert!(read_active_transaction(&fixture.layout)
        .expect("must read marker")
        .is_none());

    fixture.cleanup();
}

#[test]
fn dry_run_upgrade_reports_plan_without_changes() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    fixture.publish("widget", "2.0", &[]);

    let report = fixture
        .engine
        .upgrade(
            &[],
            UpgradeOptions {
                dry_run: true,
                ..UpgradeOptions::default()
            },
        )
        .expect("dry run must succeed");
    assert_eq!(report.planned.len(), 1);
    assert!(report.upgraded.is_empty());
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert!(fixture.transaction_statuses().is_empty());

    fixture.cleanup();
}

#[test]
fn failed_artifact_install_rolls_back_to_old_version() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    fixture.publish("widget", "2.0", &["binary \"missing-tool\""]);

    let err = fixture
        .engine
        .upgrade(&["widget".to_string()], UpgradeOptions::default())
        .expect_err("broken new version must fail");
    let rendered = format!("{err:#}");
    assert!(rendered.contains("failed to upgrade cask 'widget'"), "{rendered}");
    assert!(rendered.contains("binary source not found"), "{rendered}");

    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert_eq!(fixture.staged_versions("widget"), vec!["1.0"]);
    assert_eq!(
        fixture
            .caskroom()
            .installed_version("widget")
            .expect("must read")
            .as_deref(),
        Some("1.0")
    );
    assert_eq!(fixture.transaction_statuses(), vec![TransactionStatus::RolledBack]);

    let txid = fixture.transaction_ids().remove(0);
    let steps = read_transaction_journal(&fixture.layout, &txid)
        .expect("must read journal")
        .into_iter()
        .map(|entry| entry.step)
        .collect::<Vec<_>>();
    assert!(steps.contains(&"start_upgrade".to_string()));
    assert_eq!(steps.last().map(String::as_str), Some("rollback_revert"));

    fixture.cleanup();
}

#[test]
fn conflicting_new_version_leaves_old_version_untouched() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture.publish("other", "1.0", &[]);
    fixture
        .engine
        .install(
            vec!["widget".into(), "other".into()],
            InstallOptions::default(),
        )
        .expect("must install");
    fixture.publish("widget", "2.0", &["conflicts_with cask: \"other\""]);

    let err = fixture
        .engine
        .upgrade(&["widget".to_string()], UpgradeOptions::default())
        .expect_err("conflict must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::ConflictDetected { conflicting, .. }) if conflicting == "other"
    ));
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert_eq!(fixture.staged_versions("widget"), vec!["1.0"]);

    fixture.cleanup();
}

#[test]
fn stage_failure_after_start_rolls_back_and_a_rerun_succeeds() {
    let fixture = Fixture::installed_widget();
    fixture.publish("widget", "2.0", &[]);
    let leftover = fixture.layout.staged_path("widget", "2.0");
    fs::create_dir_all(&leftover).expect("must create leftover staged dir");

    let err = fixture
        .engine
        .upgrade(&["widget".to_string()], UpgradeOptions::default())
        .expect_err("leftover staged dir must fail staging");
    assert!(
        format!("{err:#}").contains("staged directory already exists"),
        "{err:#}"
    );
    fixture.assert_old_widget_restored();
    assert_eq!(
        fixture.last_journal_step(),
        Some("rollback_revert".to_string())
    );

    fixture.assert_rerun_upgrades_widget();
    fixture.cleanup();
}

#[test]
fn failure_partway_through_start_upgrade_rolls_back_and_a_rerun_succeeds() {
    let fixture = Fixture::installed_widget();
    fixture.publish("widget", "2.0", &[]);
    let metadata = fixture
        .caskroom()
        .metadata("widget")
        .versioned_path(Some("1.0"))
        .expect("must locate metadata");
    let blocker = backup_path(&metadata);
    fs::write(&blocker, "not a directory").expect("must block metadata backup");

    let err = fixture
        .engine
        .upgrade(&["widget".to_string()], UpgradeOptions::default())
        .expect_err("blocked metadata backup must fail");
    assert!(format!("{err:#}").contains("failed to remove"), "{err:#}");
    fixture.assert_old_widget_restored();
    assert!(!blocker.exists(), "stale backup must be dropped");
    assert!(!backup_path(&fixture.layout.staged_path("widget", "1.0")).exists());

    fixture.assert_rerun_upgrades_widget();
    fixture.cleanup();
}

#[test]
fn finalize_failure_rolls_back_and_a_rerun_succeeds() {
    let fixture = Fixture::installed_widget();
    fixture.publish("widget", "2.0", &[]);
    let (installed, current) = fixture.widget_upgrade_pair();

    let err = fixture
        .engine
        .upgrade_cask_with_hooks(&installed, &current, |step| {
            if step == UpgradeStep::FinalizeUpgrade {
                return Err(anyhow!("simulated finalize failure"));
            }
            Ok(())
        })
        .expect_err("finalize failure must fail the upgrade");
    assert!(
        format!("{err:#}").contains("simulated finalize failure"),
        "{err:#}"
    );
    fixture.assert_old_widget_restored();
    let txid = fixture.transaction_ids().remove(0);
    let steps = read_transaction_journal(&fixture.layout, &txid)
        .expect("must read journal")
        .into_iter()
        .map(|entry| entry.step)
        .collect::<Vec<_>>();
    assert!(steps.contains(&"install_artifacts".to_string()), "{steps:?}");
    assert!(
        steps.contains(&"rollback_uninstall_artifacts".to_string()),
        "{steps:?}"
    );

    fixture.assert_rerun_upgrades_widget();
    fixture.cleanup();
}

#[test]
fn failed_rollback_keeps_both_errors_and_the_transaction_marker() {
    let fixture = Fixture::installed_widget();
    fixture.publish("widget", "2.0", &[]);
    let (installed, current) = fixture.widget_upgrade_pair();
    let old_backup = backup_path(&fixture.layout.staged_path("widget", "1.0"));

    let err = fixture
        .engine
        .upgrade_cask_with_hooks(&installed, &current, |step| {
            if step == UpgradeStep::FinalizeUpgrade {
                fs::remove_dir_all(&old_backup).expect("must remove old backup");
                return Err(anyhow!("simulated finalize failure"));
            }
            Ok(())
        })
        .expect_err("rollback without a backup must fail");
    assert!(matches!(
        err.downcast_ref::<CaskError>(),
        Some(CaskError::RollbackFailed { token, .. }) if token == "widget"
    ));
    let rendered = format!("{err:#}");
    assert!(rendered.contains("simulated finalize failure"), "{rendered}");
    assert!(rendered.contains("app source not found"), "{rendered}");
    assert!(read_active_transaction(&fixture.layout)
        .expect("must read marker")
        .is_some());

    let err = fixture
        .engine
        .upgrade(&[], UpgradeOptions::default())
        .expect_err("interrupted transaction must block upgrades");
    assert!(err.to_string().contains("needs attention"), "{err}");

    fixture.cleanup();
}

#[test]
fn failed_rollback_stops_the_batch() {
    let planned = ["widget", "gadget", "gizmo"]
        .into_iter()
        .map(|token| OutdatedCask {
            installed: definition_with(token, "1.0", false),
            current: definition_with(token, "2.0", false),
        })
        .collect::<Vec<_>>();

    let mut attempted = Vec::new();
    let (upgraded, errors) = upgrade_each(&planned, |item| {
        attempted.push(item.token().to_string());
        if item.token() == "gadget" {
            return Err(CaskError::RollbackFailed {
                token: "gadget".to_string(),
                cause: anyhow!("stage failed"),
                rollback: anyhow!("revert failed"),
            }
            .into());
        }
        Ok(())
    });

    assert_eq!(attempted, vec!["widget", "gadget"]);
    assert_eq!(upgraded, vec!["widget"]);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "failed to upgrade cask 'gadget'");
}

#[test]
fn ordinary_failures_do_not_stop_the_batch() {
    let planned = ["widget", "gadget"]
        .into_iter()
        .map(|token| OutdatedCask {
            installed: definition_with(token, "1.0", false),
            current: definition_with(token, "2.0", false),
        })
        .collect::<Vec<_>>();

    let (upgraded, errors) = upgrade_each(&planned, |item| {
        if item.token() == "widget" {
            return Err(anyhow!("rolled back"));
        }
        Ok(())
    });

    assert_eq!(upgraded, vec!["gadget"]);
    assert_eq!(errors.len(), 1);
}

#[test]
fn same_version_failure_before_start_keeps_existing_files() {
    let fixture = Fixture::new();
    fixture.publish("nightly", "latest", &[]);
    fixture
        .engine
        .install(vec!["nightly".into()], InstallOptions::default())
        .expect("must install");

    let installed = fixture
        .engine
        .resolver()
        .load_prefer_installed("nightly", caskpack_resolver::ResolveOptions::quiet())
        .expect("must load installed");
    fixture.downloader.fail("nightly");

    let err = fixture
        .engine
        .upgrade_cask(&installed, &installed)
        .expect_err("fetch failure must fail");
    assert!(format!("{err:#}").contains("simulated download failure"), "{err:#}");
    assert_eq!(fixture.staged_versions("nightly"), vec!["latest"]);
    assert_eq!(fixture.app_contents("Nightly.app"), "nightly latest");
    assert!(fixture
        .caskroom()
        .installed_caskfile("nightly")
        .expect("must read")
        .is_some());

    fixture.cleanup();
}

#[test]
fn batch_upgrade_isolates_failures_and_reports_them_together() {
    let fixture = Fixture::new();
    for token in ["widget", "gadget", "gizmo"] {
        fixture.publish(token, "1.0", &[]);
    }
    fixture
        .engine
        .install(
            vec!["widget".into(), "gadget".into(), "gizmo".into()],
            InstallOptions::default(),
        )
        .expect("must install");
    fixture.publish("widget", "2.0", &["binary \"missing-tool\""]);
    fixture.publish("gadget", "2.0", &[]);
    fixture.publish("gizmo", "2.0", &["binary \"missing-tool\""]);

    let err = fixture
        .engine
        .upgrade(&[], UpgradeOptions::default())
        .expect_err("two failures must be reported");
    let Some(CaskError::MultipleErrors { errors }) = err.downcast_ref::<CaskError>() else {
        panic!("expected MultipleErrors, got {err:#}");
    };
    let messages = errors
        .iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            "failed to upgrade cask 'gizmo'",
            "failed to upgrade cask 'widget'"
        ]
    );

    assert_eq!(fixture.app_contents("Gadget.app"), "gadget 2.0");
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert_eq!(fixture.app_contents("Gizmo.app"), "gizmo 1.0");

    fixture.cleanup();
}

#[test]
fn batch_upgrade_fetch_failure_happens_before_any_upgrade() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture.publish("gadget", "1.0", &[]);
    fixture
        .engine
        .install(
            vec!["widget".into(), "gadget".into()],
            InstallOptions::default(),
        )
        .expect("must install");
    fixture.publish("widget", "2.0", &[]);
    fixture.publish("gadget", "2.0", &[]);
    fixture.downloader.fail("widget");

    let err = fixture
        .engine
        .upgrade(&[], UpgradeOptions::default())
        .expect_err("fetch failure must abort the batch");
    assert!(format!("{err:#}").contains("failed to fetch cask 'widget'"), "{err:#}");
    assert_eq!(fixture.app_contents("Gadget.app"), "gadget 1.0");
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");
    assert!(fixture.transaction_statuses().is_empty());

    fixture.cleanup();
}

#[test]
fn upgrade_refuses_to_run_over_an_interrupted_transaction() {
    let fixture = Fixture::new();
    fixture.publish("widget", "1.0", &[]);
    fixture
        .engine
        .install(vec!["widget".into()], InstallOptions::default())
        .expect("must install");
    fixture.publish("widget", "2.0", &[]);
    set_active_transaction(&fixture.layout, "upgrade-widget-1-000000001")
        .expect("must set marker");

    let err = fixture
        .engine
        .upgrade(&[], UpgradeOptions::default())
        .expect_err("interrupted transaction must block upgrades");
    assert!(err.to_string().contains("txid=upgrade-widget-1-000000001"), "{err}");
    assert_eq!(fixture.app_contents("Widget.app"), "widget 1.0");

    let report = fixture
        .engine
        .upgrade(
            &[],
            UpgradeOptions {
                dry_run: true,
                ..UpgradeOptions::default()
            },
        )
        .expect("dry run must still plan");
    assert_eq!(report.planned.len(), 1);

    fixture.cleanup();
}

struct Fixture {
    layout: CaskLayout,
    downloader: Arc<FakeDownloader>,
    engine: LifecycleEngine,
}

impl Fixture {
    fn new() -> Self {
        Self::with_allowlist(&[])
    }

    fn with_allowlist(allowlist: &[&str]) -> Self {
        let layout = test_layout();
        layout.ensure_base_dirs().expect("must create dirs");
        let downloader = Arc::new(FakeDownloader::new(layout.prefix().join("fixtures")));
        let context = InstallContext::new(
            layout.clone(),
            downloader.clone(),
            Arc::new(NoopExecutor),
        );
        let catalog = TapCatalog::new(
            layout.taps_dir(),
            layout.api_dir(),
            TapName::parse(DEFAULT_TAP).expect("default tap must parse"),
        );
        let resolver = Resolver::new(catalog, Caskroom::new(layout.clone()));
        let engine = LifecycleEngine::new(resolver, context)
            .with_download_concurrency(2)
            .with_greedy_allowlist(allowlist.iter().copied());
        Self {
            layout,
            downloader,
            engine,
        }
    }

    /// Writes (or overwrites) the default tap's definition of `token`.
    fn publish(&self, token: &str, version: &str, extra: &[&str]) {
        self.publish_in(DEFAULT_TAP, token, version, extra);
    }

    fn publish_in(&self, tap: &str, token: &str, version: &str, extra: &[&str]) {
        let app = format!("{}.app", capitalize(token));
        let mut source = format!(
            "cask \"{token}\" do\n  version \"{version}\"\n  url \"https://example.test/{version}/{app}\"\n  app \"{app}\"\n"
        );
        for line in extra {
            source.push_str("  ");
            source.push_str(line);
            source.push('\n');
        }
        source.push_str("end\n");

        let path = self
            .layout
            .taps_dir()
            .join(tap)
            .join("Casks")
            .join(format!("{token}.cask"));
        fs::create_dir_all(path.parent().expect("must have parent")).expect("must create dirs");
        fs::write(path, source).expect("must write definition");
    }

    /// A fixture with `widget` 1.0 installed from the default tap.
    fn installed_widget() -> Self {
        let fixture = Self::new();
        fixture.publish("widget", "1.0", &[]);
        fixture
            .engine
            .install(vec!["widget".into()], InstallOptions::default())
            .expect("must install");
        fixture
    }

    /// The installed `widget` and its current definition.
    fn widget_upgrade_pair(&self) -> (PackageDefinition, PackageDefinition) {
        let installed = self
            .engine
            .resolver()
            .load_prefer_installed("widget", caskpack_resolver::ResolveOptions::quiet())
            .expect("must load installed");
        let current = self
            .engine
            .resolver()
            .resolve("widget", caskpack_resolver::ResolveOptions::quiet())
            .expect("must resolve current");
        (installed, current)
    }

    fn assert_old_widget_restored(&self) {
        assert_eq!(self.app_contents("Widget.app"), "widget 1.0");
        assert_eq!(self.staged_versions("widget"), vec!["1.0"]);
        assert_eq!(
            self.caskroom()
                .installed_version("widget")
                .expect("must read")
                .as_deref(),
            Some("1.0")
        );
        assert_eq!(self.transaction_statuses(), vec![TransactionStatus::RolledBack]);
        assert!(read_active_transaction(&self.layout)
            .expect("must read marker")
            .is_none());
    }

    fn assert_rerun_upgrades_widget(&self) {
        let report = self
            .engine
            .upgrade(&["widget".to_string()], UpgradeOptions::default())
            .expect("rerun must upgrade");
        assert_eq!(report.upgraded, vec!["widget"]);
        assert_eq!(self.app_contents("Widget.app"), "widget 2.0");
        assert_eq!(self.staged_versions("widget"), vec!["2.0"]);
    }

    fn last_journal_step(&self) -> Option<String> {
        let txid = self.transaction_ids().into_iter().next()?;
        read_transaction_journal(&self.layout, &txid)
            .expect("must read journal")
            .pop()
            .map(|entry| entry.step)
    }

    fn caskroom(&self) -> &Caskroom {
        self.engine.caskroom()
    }

    fn app_contents(&self, app: &str) -> String {
        fs::read_to_string(self.layout.app_dir().join(app)).expect("app must be installed")
    }

    fn staged_versions(&self, token: &str) -> Vec<String> {
        self.caskroom()
            .staged_versions(token)
            .expect("must list staged versions")
    }

    fn transaction_ids(&self) -> Vec<String> {
        let mut ids = fs::read_dir(self.layout.transactions_dir())
            .expect("must read transactions")
            .map(|entry| entry.expect("must read entry").path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn transaction_statuses(&self) -> Vec<TransactionStatus> {
        self.transaction_ids()
            .iter()
            .map(|txid| {
                read_transaction_metadata(&self.layout, txid)
                    .expect("must read metadata")
                    .expect("metadata must exist")
                    .status
            })
            .collect()
    }

    fn cleanup(self) {
        let _ = fs::remove_dir_all(self.layout.prefix());
    }
}

fn definition_with(token: &str, version: &str, auto_updates: bool) -> PackageDefinition {
    let mut builder = DefinitionBuilder::new(token).expect("must build");
    builder.version(version).expect("must set version");
    builder.auto_updates(auto_updates);
    builder.build().expect("must build definition")
}

fn definition_requiring(token: &str, requirements: &[&str]) -> PackageDefinition {
    let mut builder = DefinitionBuilder::new(token).expect("must build");
    builder.version("1.0").expect("must set version");
    for requirement in requirements {
        builder
            .depends_on_cask(requirement)
            .expect("must add requirement");
    }
    builder.build().expect("must build definition")
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Writes `<token> <version>` under the URL's file name.
struct FakeDownloader {
    root: PathBuf,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeDownloader {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    fn fail(&self, token: &str) {
        self.failing
            .lock()
            .expect("lock")
            .insert(token.to_string());
    }
}

impl Downloader for FakeDownloader {
    fn fetch(&self, definition: &PackageDefinition) -> Result<PathBuf> {
        if self.failing.lock().expect("lock").contains(&definition.token) {
            return Err(anyhow!("simulated download failure"));
        }
        let url = definition.url.as_deref().expect("fixture must have url");
        let name = url.rsplit('/').next().expect("url must have a file name");
        let dir = self
            .root
            .join(format!("{}-{}", definition.token, definition.version));
        fs::create_dir_all(&dir).expect("must create fixture dir");
        let path = dir.join(name);
        fs::write(
            &path,
            format!("{} {}", definition.token, definition.version),
        )
        .expect("must write fixture");
        Ok(path)
    }
}

/// Reports success for every command without running it.
struct NoopExecutor;

impl SystemExecutor for NoopExecutor {
    fn run(&self, _command: &SystemCommand) -> Result<CommandOutput> {
        Ok(CommandOutput {
            success: true,
            ..CommandOutput::default()
        })
    }
}

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "caskpack-lifecycle-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> CaskLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    CaskLayout::new(build_test_layout_path(nanos))
}
