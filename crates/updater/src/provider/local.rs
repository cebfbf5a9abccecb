use super::{create_dir, write_atomically, FileInfo, Provider, Visit};
use crate::error::{Result, UpdaterError};
use crate::tree::{join_relative, list_tree, normalize_relative};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tokio::task;

/// Name of the optional file holding the version of a directory source.
pub const VERSION_FILE: &str = "VERSION";

/// Provider backed by an existing directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirProvider {
    root: PathBuf,
    version: Option<String>,
    open: bool,
    walked: bool,
}

impl LocalDirProvider {
    /// Provider over the directory at `root`. Nothing is read until `open`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            version: None,
            open: false,
            walked: false,
        }
    }

    /// Report `version` instead of reading the `VERSION` file.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Directory served by this provider.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(UpdaterError::NotOpen)
        }
    }
}

#[async_trait]
impl Provider for LocalDirProvider {
    async fn open(&mut self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|err| {
            UpdaterError::Unavailable {
                source_name: self.root.display().to_string(),
                reason: err.to_string(),
            }
        })?;
        if !metadata.is_dir() {
            return Err(UpdaterError::Unavailable {
                source_name: self.root.display().to_string(),
                reason: "not a directory".into(),
            });
        }
        self.open = true;
        self.walked = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn latest_version(&mut self) -> Result<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        let path = self.root.join(VERSION_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => Ok(contents.trim().to_string()),
            Ok(_) => Err(UpdaterError::NotFound(format!("{} is empty", path.display()))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(UpdaterError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(UpdaterError::Unavailable {
                source_name: path.display().to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn walk(&mut self, visit: &mut Visit<'_>) -> Result<()> {
        self.ensure_open()?;
        if self.walked {
            return Err(UpdaterError::WalkExhausted);
        }
        self.walked = true;

        let root = self.root.clone();
        let entries = task::spawn_blocking(move || list_tree(&root, None))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;

        for entry in entries {
            let info = if entry.is_dir {
                FileInfo::dir(entry.relative, entry.mode)
            } else {
                FileInfo::file(entry.relative, entry.mode)
            };
            visit(&info)?;
        }
        Ok(())
    }

    async fn retrieve(&mut self, src: &str, dest: &Path) -> Result<()> {
        self.ensure_open()?;
        let relative = normalize_relative(Path::new(src))
            .map_err(UpdaterError::validation)?
            .ok_or_else(|| UpdaterError::NotFound(src.to_string()))?;
        let source = join_relative(&self.root, &relative);
        let dest = dest.to_path_buf();

        task::spawn_blocking(move || copy_entry(&source, &relative, &dest))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
    }
}

fn copy_entry(source: &Path, relative: &str, dest: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(source) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UpdaterError::NotFound(relative.to_string()))
        }
        Err(err) => return Err(UpdaterError::io(source, err)),
    };

    if metadata.is_dir() {
        return create_dir(dest, mode_of(&metadata));
    }
    if !metadata.is_file() {
        return Err(UpdaterError::UnsupportedEntry {
            path: relative.to_string(),
        });
    }

    let mut file = File::open(source).map_err(|err| UpdaterError::io(source, err))?;
    write_atomically(dest, mode_of(&metadata), &mut file)?;
    tracing::debug!(src = %relative, dest = %dest.display(), "copied file");
    Ok(())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        super::DEFAULT_DIR_MODE
    } else {
        super::DEFAULT_FILE_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn source_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib/empty")).unwrap();
        fs::write(root.join("bin/app"), b"binary").unwrap();
        fs::write(root.join("lib/libx.so"), b"library").unwrap();
        fs::write(root.join(VERSION_FILE), b"1.2.0\n").unwrap();
    }

    async fn collect(provider: &mut LocalDirProvider) -> Result<Vec<FileInfo>> {
        let mut seen = Vec::new();
        provider
            .walk(&mut |info: &FileInfo| -> Result<()> {
                seen.push(info.clone());
                Ok(())
            })
            .await?;
        Ok(seen)
    }

    #[tokio::test]
    async fn every_walked_entry_can_be_retrieved() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        source_tree(src.path());

        let mut provider = LocalDirProvider::new(src.path());
        provider.open().await.unwrap();
        let entries = collect(&mut provider).await.unwrap();
        assert_eq!(entries.len(), 6);

        for info in &entries {
            provider
                .retrieve(&info.path, &join_relative(dst.path(), &info.path))
                .await
                .unwrap();
        }
        provider.close().await.unwrap();

        assert_eq!(fs::read(dst.path().join("bin/app")).unwrap(), b"binary");
        assert!(dst.path().join("lib/empty").is_dir());
    }

    #[tokio::test]
    async fn version_comes_from_file_or_override() {
        let src = tempdir().unwrap();
        source_tree(src.path());

        let mut provider = LocalDirProvider::new(src.path());
        assert_eq!(provider.latest_version().await.unwrap(), "1.2.0");

        let mut pinned = LocalDirProvider::new(src.path()).with_version("9.9.9");
        assert_eq!(pinned.latest_version().await.unwrap(), "9.9.9");

        fs::remove_file(src.path().join(VERSION_FILE)).unwrap();
        assert!(matches!(
            provider.latest_version().await,
            Err(UpdaterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let src = tempdir().unwrap();
        source_tree(src.path());
        let mut provider = LocalDirProvider::new(src.path());

        assert!(matches!(collect(&mut provider).await, Err(UpdaterError::NotOpen)));

        provider.open().await.unwrap();
        collect(&mut provider).await.unwrap();
        assert!(matches!(
            collect(&mut provider).await,
            Err(UpdaterError::WalkExhausted)
        ));

        provider.close().await.unwrap();
        provider.close().await.unwrap();
        provider.open().await.unwrap();
        assert_eq!(collect(&mut provider).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn visitor_error_stops_the_walk() {
        let src = tempdir().unwrap();
        source_tree(src.path());
        let mut provider = LocalDirProvider::new(src.path());
        provider.open().await.unwrap();

        let mut visited = 0;
        let err = provider
            .walk(&mut |_: &FileInfo| -> Result<()> {
                visited += 1;
                Err(UpdaterError::validation("stop"))
            })
            .await
            .unwrap_err();
        assert_eq!(visited, 1);
        assert_eq!(err.to_string(), "stop");
    }

    #[tokio::test]
    async fn missing_sources_are_reported() {
        let dir = tempdir().unwrap();
        let mut provider = LocalDirProvider::new(dir.path().join("absent"));
        assert!(matches!(
            provider.open().await,
            Err(UpdaterError::Unavailable { .. })
        ));
        provider.close().await.unwrap();

        let mut provider = LocalDirProvider::new(dir.path());
        provider.open().await.unwrap();
        assert!(matches!(
            provider.retrieve("nope", &dir.path().join("out")).await,
            Err(UpdaterError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permission_bits_are_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        source_tree(src.path());
        fs::set_permissions(src.path().join("bin/app"), fs::Permissions::from_mode(0o751)).unwrap();

        let mut provider = LocalDirProvider::new(src.path());
        provider.open().await.unwrap();
        provider
            .retrieve("bin/app", &dst.path().join("bin/app"))
            .await
            .unwrap();

        let mode = fs::metadata(dst.path().join("bin/app")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o751);
    }
}
