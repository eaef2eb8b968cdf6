use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use caskpack_core::ArchiveType;

use crate::system::run_command;

/// Unpacks `archive` into `destination`, which must already exist.
pub fn extract_artifact(archive: &Path, destination: &Path, archive_type: ArchiveType) -> Result<()> {
    match archive_type {
        ArchiveType::Zip => extract_zip(archive, destination),
        kind if kind.is_tarball() => extract_tar(archive, destination),
        ArchiveType::Dmg => extract_dmg(archive, destination),
        _ => copy_single_file(archive, destination),
    }
}

fn extract_tar(archive_path: &Path, dst: &Path) -> Result<()> {
    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract tar archive",
    )
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    if cfg!(target_os = "macos") {
        let mut ditto = Command::new("ditto");
        ditto.arg("-x").arg("-k").arg(archive_path).arg(dst);
        if run_command(&mut ditto, "failed to extract zip archive with ditto").is_ok() {
            return Ok(());
        }
    }

    let mut unzip_command = Command::new("unzip");
    unzip_command.arg("-q").arg(archive_path).arg("-d").arg(dst);
    if run_command(&mut unzip_command, "failed to extract zip archive with unzip").is_ok() {
        return Ok(());
    }

    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract zip archive with tar fallback",
    )
}

/// Flat packages and raw downloads are staged as-is under their file name.
fn copy_single_file(source: &Path, dst: &Path) -> Result<()> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("artifact path has no file name: {}", source.display()))?;
    let name = name.to_string_lossy();
    // Cached downloads are named `<token>--<version>--<file>`.
    let name = name.rsplit("--").next().unwrap_or(name.as_ref());
    let target = dst.join(name);
    fs::copy(source, &target).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

fn extract_dmg(artifact_path: &Path, raw_dir: &Path) -> Result<()> {
    if !cfg!(target_os = "macos") {
        return Err(anyhow!("DMG artifacts are supported only on macOS hosts"));
    }

    let mount_point = raw_dir.join(".caskpack-dmg-mount");
    fs::create_dir_all(&mount_point)
        .with_context(|| format!("failed to create {}", mount_point.display()))?;

    let result = stage_dmg_payload_with_hooks(
        artifact_path,
        raw_dir,
        &mount_point,
        run_command,
        copy_dmg_payload,
    );

    let _ = fs::remove_dir_all(&mount_point);
    result
}

pub(crate) fn build_dmg_attach_command(artifact_path: &Path, mount_point: &Path) -> Command {
    let mut command = Command::new("hdiutil");
    command
        .arg("attach")
        .arg(artifact_path)
        .arg("-readonly")
        .arg("-nobrowse")
        .arg("-mountpoint")
        .arg(mount_point);
    command
}

pub(crate) fn build_dmg_detach_command(mount_point: &Path) -> Command {
    let mut command = Command::new("hdiutil");
    command.arg("detach").arg(mount_point);
    command
}

/// Attach, copy, and always detach; both failures are reported together.
pub(crate) fn stage_dmg_payload_with_hooks<RunCommand, CopyPayload>(
    artifact_path: &Path,
    raw_dir: &Path,
    mount_point: &Path,
    mut run: RunCommand,
    mut copy_payload: CopyPayload,
) -> Result<()>
where
    RunCommand: FnMut(&mut Command, &str) -> Result<()>,
    CopyPayload: FnMut(&Path, &Path) -> Result<()>,
{
    let mut attach_command = build_dmg_attach_command(artifact_path, mount_point);
    run(&mut attach_command, "failed to attach DMG artifact")?;

    let copy_result = copy_payload(mount_point, raw_dir);

    let mut detach_command = build_dmg_detach_command(mount_point);
    let detach_result = run(&mut detach_command, "failed to detach DMG mount");

    match (copy_result, detach_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(copy_err), Ok(())) => Err(copy_err),
        (Ok(()), Err(detach_err)) => Err(detach_err),
        (Err(copy_err), Err(detach_err)) => Err(anyhow!(
            "failed to copy mounted DMG payload: {copy_err}; additionally failed to detach mount {}: {detach_err}",
            mount_point.display()
        )),
    }
}

pub(crate) fn copy_dmg_payload(mount_point: &Path, raw_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(mount_point)
        .with_context(|| format!("failed to read DMG mount {}", mount_point.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        // The conventional drag-to-install link back to /Applications.
        if name == "Applications" && entry.file_type()?.is_symlink() {
            continue;
        }
        copy_tree(&entry.path(), &raw_dir.join(&name))?;
    }
    Ok(())
}

/// Moves `src` to `dst`, copying across filesystems when rename fails.
pub(crate) fn move_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            remove_tree(src)
        }
    }
}

pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(());
    }

    if metadata.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
        for entry in
            fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))?
        {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        return Ok(());
    }

    fs::copy(src, dst).with_context(|| {
        format!("failed to copy {} to {}", src.display(), dst.display())
    })?;
    Ok(())
}

/// Removes a file, symlink or directory tree; missing paths are fine.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("failed to remove {}", path.display()))
}
