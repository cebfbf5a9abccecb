//! Directory-tree helpers shared by the signature store, the local provider
//! and the swap.

use crate::error::{Result, UpdaterError};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Permission bits used for files when the source cannot report them.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Permission bits used for directories when the source cannot report them.
pub const DEFAULT_DIR_MODE: u32 = 0o755;
/// Owner bits every directory carries while a tree is being written into it.
pub(crate) const OWNER_WRITABLE: u32 = 0o700;

/// One entry of a directory tree, relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeEntry {
    pub relative: String,
    pub absolute: PathBuf,
    pub is_dir: bool,
    pub mode: u32,
}

/// List `root` recursively in file-name order.
///
/// Symbolic links and special files are rejected. `exclude` is a root-level
/// relative path (the signature manifest) that is skipped.
pub(crate) fn list_tree(root: &Path, exclude: Option<&str>) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            match err.into_io_error() {
                Some(source) => UpdaterError::io(path, source),
                None => UpdaterError::validation(format!("filesystem loop at {path:?}")),
            }
        })?;
        let relative = relative_path(root, entry.path())?;
        if exclude == Some(relative.as_str()) {
            continue;
        }

        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            return Err(UpdaterError::UnsupportedEntry { path: relative });
        }
        let metadata = entry
            .metadata()
            .map_err(|err| UpdaterError::io(entry.path(), err.into()))?;

        entries.push(TreeEntry {
            relative,
            absolute: entry.path().to_path_buf(),
            is_dir: file_type.is_dir(),
            mode: mode_of(&metadata, file_type.is_dir()),
        });
    }

    Ok(entries)
}

/// `/`-separated path of `path` relative to `root`.
///
/// Names that are not valid UTF-8 are refused as [`UpdaterError::UnsupportedEntry`]:
/// they cannot be keyed in the manifest without losing information.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let stripped = path.strip_prefix(root).map_err(|_| {
        UpdaterError::validation(format!("{path:?} is not inside {root:?}"))
    })?;
    let parts = stripped
        .components()
        .map(|component| {
            component.as_os_str().to_str().map(str::to_owned).ok_or_else(|| {
                UpdaterError::UnsupportedEntry {
                    path: stripped.to_string_lossy().into_owned(),
                }
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Normalize a relative path coming from an untrusted source.
///
/// Leading `./` components are dropped; absolute paths and `..` are refused.
/// Returns `None` for the root itself.
pub(crate) fn normalize_relative(raw: &Path) -> std::result::Result<Option<String>, String> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part.to_owned()),
                None => return Err(format!("path {raw:?} is not valid UTF-8")),
            },
            Component::CurDir => {}
            Component::ParentDir => return Err(format!("path {raw:?} escapes the root")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("path {raw:?} is absolute"))
            }
        }
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// Resolve a relative `/`-separated path under `root`.
pub(crate) fn join_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Copy a whole tree, preserving permission bits.
///
/// Directories stay owner-writable until every file is in place, then get
/// their source modes back.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|err| UpdaterError::io(to, err))?;
    let root_mode = fs::metadata(from)
        .map(|metadata| mode_of(&metadata, true))
        .map_err(|err| UpdaterError::io(from, err))?;
    set_dir_mode(to, root_mode | OWNER_WRITABLE)?;

    let mut dirs = vec![(to.to_path_buf(), root_mode)];
    for entry in list_tree(from, None)? {
        let target = join_relative(to, &entry.relative);
        if entry.is_dir {
            fs::create_dir_all(&target).map_err(|err| UpdaterError::io(&target, err))?;
            set_dir_mode(&target, entry.mode | OWNER_WRITABLE)?;
            dirs.push((target, entry.mode));
        } else {
            fs::copy(&entry.absolute, &target).map_err(|err| UpdaterError::io(&target, err))?;
        }
    }
    apply_dir_modes(dirs)
}

/// Give directories their final modes, deepest first, so a parent that
/// loses its search bit never hides a child that is still pending.
pub(crate) fn apply_dir_modes(mut dirs: Vec<(PathBuf, u32)>) -> Result<()> {
    dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in dirs {
        set_dir_mode(&path, mode)?;
    }
    Ok(())
}

/// Set the permission bits of the directory at `path`.
pub(crate) fn set_dir_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|err| UpdaterError::io(path, err))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Permission bits of the directory at `path`, or [`DEFAULT_DIR_MODE`] when
/// it does not exist yet.
pub(crate) fn dir_mode(path: &Path) -> Result<u32> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(mode_of(&metadata, true)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DEFAULT_DIR_MODE),
        Err(err) => Err(UpdaterError::io(path, err)),
    }
}

/// Add the owner bits back to every directory under `root` so the tree can
/// be removed without elevated privileges.
pub(crate) fn make_removable(root: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                let mode = entry.metadata()?.permissions().mode() & 0o7777;
                if mode & OWNER_WRITABLE != OWNER_WRITABLE {
                    let writable = fs::Permissions::from_mode(mode | OWNER_WRITABLE);
                    fs::set_permissions(entry.path(), writable)?;
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = root;
    Ok(())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(metadata: &fs::Metadata, is_dir: bool) -> u32 {
    if is_dir {
        DEFAULT_DIR_MODE
    } else if metadata.permissions().readonly() {
        0o444
    } else {
        DEFAULT_FILE_MODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn listing_is_sorted_and_skips_excluded_manifest() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("b/nested/z.txt"), b"z").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("signatures.json"), b"{}").unwrap();

        let listed: Vec<_> = list_tree(dir.path(), Some("signatures.json"))
            .unwrap()
            .into_iter()
            .map(|entry| (entry.relative, entry.is_dir))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("a.txt".to_string(), false),
                ("b".to_string(), true),
                ("b/nested".to_string(), true),
                ("b/nested/z.txt".to_string(), false),
            ]
        );
    }

    #[test]
    fn normalization_rejects_escapes() {
        assert_eq!(
            normalize_relative(Path::new("./pkg/bin/app")).unwrap(),
            Some("pkg/bin/app".to_string())
        );
        assert_eq!(normalize_relative(Path::new("./")).unwrap(), None);
        assert!(normalize_relative(Path::new("../etc/passwd")).is_err());
        assert!(normalize_relative(Path::new("/etc/passwd")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("link")).unwrap();

        let err = list_tree(dir.path(), None).unwrap_err();
        assert!(matches!(err, UpdaterError::UnsupportedEntry { ref path } if path == "link"));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directories_are_copied_with_their_contents() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("share")).unwrap();
        fs::write(src.path().join("share/data"), b"payload").unwrap();
        fs::set_permissions(src.path().join("share"), fs::Permissions::from_mode(0o555)).unwrap();

        copy_tree(src.path(), &dst.path().join("copy")).unwrap();
        fs::set_permissions(src.path().join("share"), fs::Permissions::from_mode(0o755)).unwrap();

        let share = dst.path().join("copy/share");
        assert_eq!(fs::read(share.join("data")).unwrap(), b"payload");
        assert_eq!(fs::metadata(&share).unwrap().permissions().mode() & 0o777, 0o555);

        make_removable(&dst.path().join("copy")).unwrap();
        assert_eq!(fs::metadata(&share).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn names_that_are_not_utf8_are_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("good"), b"x").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xffname")), b"y").unwrap();

        let err = list_tree(dir.path(), None).unwrap_err();
        assert!(matches!(err, UpdaterError::UnsupportedEntry { ref path } if path.starts_with("bad")));
        assert!(normalize_relative(Path::new(OsStr::from_bytes(b"pkg/\xff"))).is_err());
    }
}
