//! Gzip-compressed tar archives.
//!
//! Tar streams can only be read forwards, so the provider keeps two
//! independent cursors over the archive, each owned by a worker on the
//! blocking pool: one serves `walk`, the other serves `retrieve`. Files must
//! be retrieved in the order they appear in the stream; asking for a file the
//! retrieval cursor has already passed fails with
//! [`UpdaterError::OutOfOrderAccess`] instead of re-reading the archive.
//! Directories may be retrieved at any time once the cursor has reached them.
//!
//! A file path that appears more than once in the stream makes the archive
//! [`UpdaterError::Corrupt`]: tar would let the later copy win, while a
//! signed release names every file exactly once.

use super::{create_dir, version_from_file_name, write_atomically, FileInfo, Provider, Visit};
use crate::error::{Result, UpdaterError};
use crate::tree::{normalize_relative, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tar::Archive;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

type GzEntries<'a> = tar::Entries<'a, GzDecoder<File>>;
type GzEntry<'a> = tar::Entry<'a, GzDecoder<File>>;

/// Provider over a `.tar.gz` file.
#[derive(Debug)]
pub struct ArchiveProvider {
    path: PathBuf,
    version: Option<String>,
    walker: Option<TarCursor>,
    extractor: Option<TarCursor>,
    walked: bool,
}

impl ArchiveProvider {
    /// Provider over the archive at `path`. The file is only read on `open`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: None,
            walker: None,
            extractor: None,
            walked: false,
        }
    }

    /// Report `version` instead of deriving it from the file name.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, reason: impl ToString) -> UpdaterError {
        UpdaterError::Unavailable {
            source_name: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Provider for ArchiveProvider {
    async fn open(&mut self) -> Result<()> {
        self.close().await?;

        let path = self.path.clone();
        let opened = task::spawn_blocking(move || -> io::Result<Option<(File, File)>> {
            let probe = GzDecoder::new(File::open(&path)?);
            if probe.header().is_none() {
                return Ok(None);
            }
            Ok(Some((File::open(&path)?, File::open(&path)?)))
        })
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?;

        let (walk_file, extract_file) = match opened {
            Ok(Some(files)) => files,
            Ok(None) => {
                return Err(UpdaterError::Corrupt {
                    path: self.path.clone(),
                    reason: "missing or invalid gzip header".into(),
                })
            }
            Err(err) => return Err(self.unavailable(err)),
        };

        self.walker = Some(TarCursor::spawn(self.path.clone(), walk_file));
        self.extractor = Some(TarCursor::spawn(self.path.clone(), extract_file));
        self.walked = false;
        tracing::debug!(archive = %self.path.display(), "opened archive");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let cursors = [self.walker.take(), self.extractor.take()];
        for cursor in cursors.into_iter().flatten() {
            cursor.shutdown().await?;
        }
        Ok(())
    }

    async fn latest_version(&mut self) -> Result<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(version_from_file_name)
            .ok_or_else(|| {
                UpdaterError::NotFound(format!(
                    "no version in archive name {}",
                    self.path.display()
                ))
            })
    }

    async fn walk(&mut self, visit: &mut Visit<'_>) -> Result<()> {
        let walker = self.walker.as_ref().ok_or(UpdaterError::NotOpen)?;
        if self.walked {
            return Err(UpdaterError::WalkExhausted);
        }
        self.walked = true;

        while let Some(batch) = walker.next().await? {
            for info in &batch {
                visit(info)?;
            }
        }
        Ok(())
    }

    async fn retrieve(&mut self, src: &str, dest: &Path) -> Result<()> {
        let extractor = self.extractor.as_ref().ok_or(UpdaterError::NotOpen)?;
        let relative = normalize_relative(Path::new(src))
            .map_err(UpdaterError::validation)?
            .ok_or_else(|| UpdaterError::NotFound(src.to_string()))?;
        extractor.extract(relative, dest.to_path_buf()).await
    }
}

enum CursorRequest {
    Next(oneshot::Sender<Result<Option<Vec<FileInfo>>>>),
    Extract {
        path: String,
        dest: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a worker that owns one forward-only pass over the archive.
#[derive(Debug)]
struct TarCursor {
    requests: mpsc::Sender<CursorRequest>,
    worker: task::JoinHandle<()>,
}

impl TarCursor {
    fn spawn(archive_path: PathBuf, file: File) -> Self {
        let (requests, receiver) = mpsc::channel(1);
        let worker = task::spawn_blocking(move || run_cursor(archive_path, file, receiver));
        Self { requests, worker }
    }

    async fn next(&self) -> Result<Option<Vec<FileInfo>>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(CursorRequest::Next(reply))
            .await
            .map_err(|_| cursor_gone())?;
        response.await.map_err(|_| cursor_gone())?
    }

    async fn extract(&self, path: String, dest: PathBuf) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(CursorRequest::Extract { path, dest, reply })
            .await
            .map_err(|_| cursor_gone())?;
        response.await.map_err(|_| cursor_gone())?
    }

    async fn shutdown(self) -> Result<()> {
        drop(self.requests);
        self.worker
            .await
            .map_err(|err| UpdaterError::Other(format!("archive worker failed: {err}")))
    }
}

fn cursor_gone() -> UpdaterError {
    UpdaterError::Other("archive worker stopped unexpectedly".into())
}

fn run_cursor(archive_path: PathBuf, file: File, mut requests: mpsc::Receiver<CursorRequest>) {
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut state = CursorState::new(archive_path);

    let mut entries = match archive.entries() {
        Ok(entries) => entries,
        Err(err) => {
            while let Some(request) = requests.blocking_recv() {
                let failure = state.corrupt(&err);
                match request {
                    CursorRequest::Next(reply) => {
                        let _ = reply.send(Err(failure));
                    }
                    CursorRequest::Extract { reply, .. } => {
                        let _ = reply.send(Err(failure));
                    }
                }
            }
            return;
        }
    };

    let mut pending: Option<(EntryMeta, GzEntry<'_>)> = None;
    while let Some(request) = requests.blocking_recv() {
        match request {
            CursorRequest::Next(reply) => {
                let _ = reply.send(state.next_batch(&mut entries));
            }
            CursorRequest::Extract { path, dest, reply } => {
                let _ = reply.send(state.extract(&mut entries, &mut pending, &path, &dest));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
    Unsupported,
}

#[derive(Debug)]
struct EntryMeta {
    path: String,
    kind: EntryKind,
    mode: u32,
}

struct CursorState {
    archive_path: PathBuf,
    dirs: HashMap<String, u32>,
    passed: HashSet<String>,
    finished: bool,
}

impl CursorState {
    fn new(archive_path: PathBuf) -> Self {
        Self {
            archive_path,
            dirs: HashMap::new(),
            passed: HashSet::new(),
            finished: false,
        }
    }

    fn corrupt(&self, reason: impl ToString) -> UpdaterError {
        UpdaterError::Corrupt {
            path: self.archive_path.clone(),
            reason: reason.to_string(),
        }
    }

    fn duplicate(&self, path: &str) -> UpdaterError {
        self.corrupt(format!("duplicate entry {path}"))
    }

    /// Move to the next file, directory or unsupported entry.
    fn advance<'a>(&mut self, entries: &mut GzEntries<'a>) -> Result<Option<(EntryMeta, GzEntry<'a>)>> {
        while !self.finished {
            let entry = match entries.next() {
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Err(self.corrupt(err));
                }
                Some(Ok(entry)) => entry,
            };

            let entry_type = entry.header().entry_type();
            if entry_type.is_pax_global_extensions()
                || entry_type.is_pax_local_extensions()
                || entry_type.is_gnu_longname()
                || entry_type.is_gnu_longlink()
            {
                continue;
            }

            let raw_path = entry.path().map_err(|err| self.corrupt(err))?.into_owned();
            let Some(path) = normalize_relative(&raw_path).map_err(|reason| self.corrupt(reason))?
            else {
                continue;
            };

            let kind = if entry_type.is_dir() {
                EntryKind::Dir
            } else if entry_type.is_file() || entry_type.is_contiguous() {
                EntryKind::File
            } else {
                EntryKind::Unsupported
            };
            let default_mode = if kind == EntryKind::Dir {
                DEFAULT_DIR_MODE
            } else {
                DEFAULT_FILE_MODE
            };
            let mode = entry
                .header()
                .mode()
                .map(|mode| mode & 0o7777)
                .unwrap_or(default_mode);

            return Ok(Some((EntryMeta { path, kind, mode }, entry)));
        }
        Ok(None)
    }

    /// Register the ancestors of `path`, returning those not seen before.
    fn implied_dirs(&mut self, path: &str) -> Vec<FileInfo> {
        let mut synthesized = Vec::new();
        for (index, _) in path.match_indices('/') {
            let ancestor = &path[..index];
            if !self.dirs.contains_key(ancestor) {
                self.dirs.insert(ancestor.to_string(), DEFAULT_DIR_MODE);
                synthesized.push(FileInfo::dir(ancestor, DEFAULT_DIR_MODE));
            }
        }
        synthesized
    }

    fn next_batch(&mut self, entries: &mut GzEntries<'_>) -> Result<Option<Vec<FileInfo>>> {
        let Some((meta, _entry)) = self.advance(entries)? else {
            return Ok(None);
        };

        let mut batch = self.implied_dirs(&meta.path);
        match meta.kind {
            EntryKind::Dir => {
                if !self.dirs.contains_key(&meta.path) {
                    self.dirs.insert(meta.path.clone(), meta.mode);
                    batch.push(FileInfo::dir(meta.path, meta.mode));
                }
            }
            EntryKind::File => {
                if !self.passed.insert(meta.path.clone()) {
                    return Err(self.duplicate(&meta.path));
                }
                batch.push(FileInfo::file(meta.path, meta.mode));
            }
            EntryKind::Unsupported => {
                return Err(UpdaterError::UnsupportedEntry { path: meta.path });
            }
        }
        Ok(Some(batch))
    }

    fn extract<'a>(
        &mut self,
        entries: &mut GzEntries<'a>,
        pending: &mut Option<(EntryMeta, GzEntry<'a>)>,
        path: &str,
        dest: &Path,
    ) -> Result<()> {
        if let Some(&mode) = self.dirs.get(path) {
            return create_dir(dest, mode);
        }
        if self.passed.contains(path) {
            return Err(UpdaterError::OutOfOrderAccess {
                path: path.to_string(),
            });
        }

        loop {
            let (meta, mut entry) = match pending.take() {
                Some(current) => current,
                None => match self.advance(entries)? {
                    Some(next) => next,
                    None => return Err(UpdaterError::NotFound(path.to_string())),
                },
            };
            self.implied_dirs(&meta.path);

            if meta.kind == EntryKind::Dir {
                let mode = *self.dirs.entry(meta.path.clone()).or_insert(meta.mode);
                if meta.path == path {
                    return create_dir(dest, mode);
                }
                continue;
            }

            if meta.kind == EntryKind::File && self.passed.contains(&meta.path) {
                return Err(self.duplicate(&meta.path));
            }
            if meta.path == path {
                return match meta.kind {
                    EntryKind::File => {
                        write_atomically(dest, meta.mode, &mut entry)?;
                        self.passed.insert(meta.path);
                        tracing::debug!(entry = %path, dest = %dest.display(), "extracted entry");
                        Ok(())
                    }
                    _ => Err(UpdaterError::UnsupportedEntry { path: meta.path }),
                };
            }

            // The requested directory only exists implicitly, as a parent of this entry.
            if let Some(&mode) = self.dirs.get(path) {
                *pending = Some((meta, entry));
                return create_dir(dest, mode);
            }
            self.passed.insert(meta.path);
        }
    }
}
