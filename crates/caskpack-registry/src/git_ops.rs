use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

pub(crate) fn base_git_command() -> Command {
    let mut command = Command::new("git");
    command
        .arg("-c")
        .arg("core.autocrlf=false")
        .arg("-c")
        .arg("core.eol=lf");
    command
}

pub(crate) fn run_git_clone(remote: &str, destination: &Path, tap_name: &str) -> Result<()> {
    let output = base_git_command()
        .arg("clone")
        .arg("--depth=1")
        .arg("--")
        .arg(remote)
        .arg(destination)
        .output()
        .with_context(|| format!("tap-failed: tap '{tap_name}' failed launching git clone"))?;
    if !output.status.success() {
        anyhow::bail!(
            "tap-failed: tap '{}' git clone failed: {}",
            tap_name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub(crate) fn git_head_revision(repo_root: &Path, tap_name: &str) -> Result<Option<String>> {
    if !repo_root.join(".git").exists() {
        return Ok(None);
    }

    let output = base_git_command()
        .arg("rev-parse")
        .arg("--short=12")
        .arg("HEAD")
        .current_dir(repo_root)
        .output()
        .with_context(|| format!("tap '{tap_name}' failed launching git rev-parse"))?;
    if !output.status.success() {
        anyhow::bail!(
            "tap '{}' git rev-parse failed: {}",
            tap_name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let revision = String::from_utf8(output.stdout)
        .context("git rev-parse produced non-UTF-8 output")?
        .trim()
        .to_string();
    if revision.is_empty() || !revision.chars().all(|ch| ch.is_ascii_hexdigit()) {
        anyhow::bail!("tap '{tap_name}' git rev-parse returned invalid revision: '{revision}'");
    }
    Ok(Some(revision))
}
