//! Swapping a verified staging tree into the live installation.
//!
//! The live tree is first renamed to a sibling backup, then the staging tree
//! is renamed into its place. When that rename is impossible (staging on
//! another volume) the staging tree is copied to a sibling directory that is
//! renamed into place instead. Any failure after the backup was taken puts
//! the backup back; if even that fails the installation is reported as
//! irrecoverable and the backup is left where it is.

use crate::error::{Result, UpdaterError};
use crate::tree::{copy_tree, make_removable};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Result of a successful swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Location of the live installation.
    pub install_path: PathBuf,
    /// Previous installation, when kept on request or when it could not be removed.
    pub backup_path: Option<PathBuf>,
}

/// Filesystem operations used by the swap.
pub(crate) trait SwapFs: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_tree(&self, path: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StdFs;

impl SwapFs for StdFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        copy_tree(from, to)
    }

    fn remove_tree(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                // Read-only directories inside the tree.
                make_removable(path)?;
                fs::remove_dir_all(path)
            }
            other => other,
        }
    }
}

/// Replace `install_path` with the tree at `staging`.
pub fn apply_staging(staging: &Path, install_path: &Path, keep_backup: bool) -> Result<ApplyOutcome> {
    swap_with(&StdFs, staging, install_path, keep_backup)
}

pub(crate) fn swap_with(
    fs_ops: &dyn SwapFs,
    staging: &Path,
    install_path: &Path,
    keep_backup: bool,
) -> Result<ApplyOutcome> {
    if !install_path.is_absolute() {
        return Err(UpdaterError::NonAbsolutePath(install_path.to_path_buf()));
    }
    if !staging.is_dir() {
        return Err(UpdaterError::NotFound(format!(
            "staging directory {}",
            staging.display()
        )));
    }
    let parent = install_path.parent().ok_or_else(|| {
        UpdaterError::validation("install path must have a parent directory")
    })?;
    fs::create_dir_all(parent).map_err(|err| UpdaterError::io(parent, err))?;

    let backup = if install_path.exists() {
        let backup = sibling(install_path, "backup");
        fs_ops.rename(install_path, &backup).map_err(|err| UpdaterError::ApplyFailed {
            install_path: install_path.to_path_buf(),
            source: Box::new(UpdaterError::io(install_path, err)),
        })?;
        tracing::debug!(backup = %backup.display(), "moved live installation aside");
        Some(backup)
    } else {
        None
    };

    if let Err(err) = move_into_place(fs_ops, staging, install_path) {
        tracing::warn!(error = %err, install = %install_path.display(), "swap failed, restoring");
        return Err(restore(fs_ops, install_path, backup.as_deref(), err));
    }

    let backup_path = match backup {
        Some(backup) if keep_backup => Some(backup),
        Some(backup) => match fs_ops.remove_tree(&backup) {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(
                    backup = %backup.display(),
                    error = %err,
                    "failed to remove previous installation"
                );
                Some(backup)
            }
        },
        None => None,
    };

    tracing::info!(install = %install_path.display(), "update applied");
    Ok(ApplyOutcome {
        install_path: install_path.to_path_buf(),
        backup_path,
    })
}

fn move_into_place(fs_ops: &dyn SwapFs, staging: &Path, install_path: &Path) -> Result<()> {
    let rename_err = match fs_ops.rename(staging, install_path) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    tracing::debug!(error = %rename_err, "rename from staging failed, copying instead");

    let incoming = sibling(install_path, "incoming");
    let copied = fs_ops.copy_tree(staging, &incoming).and_then(|()| {
        fs_ops
            .rename(&incoming, install_path)
            .map_err(|err| UpdaterError::io(install_path, err))
    });
    if let Err(err) = copied {
        let _ = fs_ops.remove_tree(&incoming);
        return Err(err);
    }
    if let Err(err) = fs_ops.remove_tree(staging) {
        tracing::warn!(staging = %staging.display(), error = %err, "failed to remove staging copy");
    }
    Ok(())
}

fn restore(
    fs_ops: &dyn SwapFs,
    install_path: &Path,
    backup: Option<&Path>,
    cause: UpdaterError,
) -> UpdaterError {
    let restored = fs_ops
        .remove_tree(install_path)
        .and_then(|()| match backup {
            Some(backup) => fs_ops.rename(backup, install_path),
            None => Ok(()),
        });

    match restored {
        Ok(()) => UpdaterError::ApplyFailed {
            install_path: install_path.to_path_buf(),
            source: Box::new(cause),
        },
        Err(err) => {
            tracing::error!(
                install = %install_path.display(),
                error = %err,
                "failed to restore previous installation"
            );
            UpdaterError::IrrecoverableState {
                install_path: install_path.to_path_buf(),
                backup_path: backup.map(Path::to_path_buf).unwrap_or_default(),
                source: Box::new(cause),
            }
        }
    }
}

/// An unused hidden sibling of `path`, e.g. `.app.backup-0`.
fn sibling(path: &Path, label: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "install".to_string());
    let mut counter = 0usize;
    loop {
        let candidate = path.with_file_name(format!(".{name}.{label}-{counter}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
