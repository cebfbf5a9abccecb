//! Update sources.
//!
//! A [`Provider`] presents a source (a directory, a gzip'd tarball, a remote
//! release catalog) as one pass over its entries plus a way to materialize a
//! single entry on disk.

use crate::error::{Result, UpdaterError};
use crate::tree::set_dir_mode;
use async_trait::async_trait;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

mod archive;
mod catalog;
mod local;

pub use crate::tree::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
pub use archive::ArchiveProvider;
pub use catalog::{Release, ReleaseAsset, ReleaseCatalogProvider, ReleaseCatalogProviderBuilder};
pub use local::{LocalDirProvider, VERSION_FILE};

/// An entry discovered while walking a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// `/`-separated path relative to the source root.
    pub path: String,
    /// POSIX permission bits; [`DEFAULT_FILE_MODE`] / [`DEFAULT_DIR_MODE`] when unknown.
    pub mode: u32,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl FileInfo {
    /// A regular file at `path` with permission bits `mode`.
    pub fn file(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            is_dir: false,
        }
    }

    /// A directory at `path` with permission bits `mode`.
    pub fn dir(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            is_dir: true,
        }
    }
}

/// Callback invoked for each entry during [`Provider::walk`].
pub type Visit<'a> = dyn FnMut(&FileInfo) -> Result<()> + Send + 'a;

/// Abstraction over a source of update content.
///
/// `walk` and `retrieve` are only valid between `open` and `close`. A walk is a
/// single pass; walking again requires closing and re-opening the provider.
#[async_trait]
pub trait Provider: Send {
    /// Acquire the backing resource.
    async fn open(&mut self) -> Result<()>;

    /// Release the backing resource. Safe to call repeatedly and after a failed `open`.
    async fn close(&mut self) -> Result<()>;

    /// Newest version published by this source.
    async fn latest_version(&mut self) -> Result<String>;

    /// Visit every entry once. The first error returned by `visit` stops the
    /// walk and is returned unchanged.
    async fn walk(&mut self, visit: &mut Visit<'_>) -> Result<()>;

    /// Materialize the entry at `src` to `dest`, creating parent directories.
    async fn retrieve(&mut self, src: &str, dest: &Path) -> Result<()>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Box<P> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn latest_version(&mut self) -> Result<String> {
        (**self).latest_version().await
    }

    async fn walk(&mut self, visit: &mut Visit<'_>) -> Result<()> {
        (**self).walk(visit).await
    }

    async fn retrieve(&mut self, src: &str, dest: &Path) -> Result<()> {
        (**self).retrieve(src, dest).await
    }
}

/// Write `reader` to `dest` through a temporary sibling file that is fsynced,
/// given `mode` and renamed into place, so `dest` is never observed half written.
pub(crate) fn write_atomically(dest: &Path, mode: u32, reader: &mut dyn Read) -> Result<()> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| UpdaterError::io(parent, err))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|err| UpdaterError::io(parent, err))?;
    io::copy(reader, &mut temp)
        .and_then(|_| temp.flush())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| UpdaterError::io(dest, err))?;
    set_mode(temp.as_file(), mode).map_err(|err| UpdaterError::io(dest, err))?;

    temp.persist(dest)
        .map_err(|err| UpdaterError::io(dest, err.error))?;
    Ok(())
}

/// Create `dest` as a directory with `mode`.
pub(crate) fn create_dir(dest: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(dest).map_err(|err| UpdaterError::io(dest, err))?;
    set_dir_mode(dest, mode)
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    let mut perms = file.metadata()?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    file.set_permissions(perms)
}

/// Parse a version out of a release file name such as `tool-1.4.2.tar.gz`.
pub(crate) fn version_from_file_name(name: &str) -> Option<String> {
    let stem = name
        .trim_end_matches(".tar.gz")
        .trim_end_matches(".tgz");
    stem.match_indices('-').find_map(|(index, _)| {
        let candidate = stem[index + 1..].trim_start_matches(['v', 'V']);
        let starts_numeric = candidate.chars().next().is_some_and(|c| c.is_ascii_digit());
        starts_numeric.then(|| candidate.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_destination_and_sets_mode() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("nested/dir/app");

        write_atomically(&dest, 0o755, &mut &b"first"[..]).unwrap();
        write_atomically(&dest, 0o700, &mut &b"second"[..]).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"second");
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn versions_are_derived_from_release_names() {
        assert_eq!(
            version_from_file_name("tool-1.4.2.tar.gz").as_deref(),
            Some("1.4.2")
        );
        assert_eq!(
            version_from_file_name("my-tool-v2.0.0-rc.1.tgz").as_deref(),
            Some("2.0.0-rc.1")
        );
        assert_eq!(version_from_file_name("tool.tar.gz"), None);
    }
}
