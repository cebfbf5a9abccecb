use crate::{
    apply::{swap_with, ApplyOutcome, StdFs, SwapFs},
    config::UpdaterConfig,
    error::{Result, UpdaterError},
    manifest::read_manifest,
    provider::{create_dir, FileInfo, Provider, DEFAULT_DIR_MODE},
    signing::verify_tree,
    tree::{apply_dir_modes, dir_mode, join_relative, make_removable, OWNER_WRITABLE},
    version::is_newer,
};
use ed25519_dalek::VerifyingKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::task;
use tokio_util::sync::CancellationToken;

/// Where an update attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingVersion,
    UpToDate,
    Fetching,
    Fetched,
    Verifying,
    VerifyFailed,
    RolledBack,
    Applying,
    ApplyFailed,
    Applied,
}

/// Result of comparing the installed version with the provider's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The provider has nothing newer.
    UpToDate { latest: String },
    /// A newer version is available.
    Available { latest: String },
}

/// Result of a full update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing to do.
    UpToDate { version: String },
    /// The new version is live.
    Applied {
        previous: String,
        version: String,
        install_path: PathBuf,
        backup_path: Option<PathBuf>,
    },
}

/// A private directory holding a fetched, not yet installed tree.
///
/// Dropping it deletes whatever is still inside.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    fn create(parent: &Path, label: &str) -> Result<Self> {
        fs::create_dir_all(parent).map_err(|err| UpdaterError::io(parent, err))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!(".{label}.staging-"))
            .tempdir_in(parent)
            .map_err(|err| UpdaterError::io(parent, err))?;
        create_dir(dir.path(), DEFAULT_DIR_MODE)?;
        Ok(Self { dir })
    }

    /// Root of the staged tree.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        // Read-only directories from the release would otherwise survive cleanup.
        let _ = make_removable(self.dir.path());
    }
}

/// Drives a [`Provider`] through check, fetch, verify and swap.
pub struct Updater<P> {
    provider: P,
    verifying_key: VerifyingKey,
    config: UpdaterConfig,
    cancel: CancellationToken,
    state: UpdateState,
    transitions: Vec<UpdateState>,
    swap_fs: Arc<dyn SwapFs>,
}

impl<P> Updater<P>
where
    P: Provider,
{
    /// Create a new updater trusting content signed for `verifying_key`.
    pub fn new(provider: P, verifying_key: VerifyingKey) -> Self {
        Self::with_config(provider, verifying_key, UpdaterConfig::default())
    }

    /// Create a new updater with explicit configuration.
    pub fn with_config(provider: P, verifying_key: VerifyingKey, config: UpdaterConfig) -> Self {
        Self {
            provider,
            verifying_key,
            config,
            cancel: CancellationToken::new(),
            state: UpdateState::Idle,
            transitions: Vec::new(),
            swap_fs: Arc::new(StdFs),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_swap_fs(mut self, swap_fs: Arc<dyn SwapFs>) -> Self {
        self.swap_fs = swap_fs;
        self
    }

    /// Token that aborts the current attempt before the next stage begins.
    ///
    /// A swap that has started always runs to an outcome.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state of the attempt.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// States entered during the last attempt, in order.
    pub fn transitions(&self) -> &[UpdateState] {
        &self.transitions
    }

    /// Configuration in effect.
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// The wrapped provider.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    fn transition(&mut self, next: UpdateState) {
        tracing::debug!(from = ?self.state, to = ?next, "updater state");
        self.state = next;
        self.transitions.push(next);
    }

    fn ensure_not_cancelled(&self, stage: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!(stage, "update cancelled");
            return Err(UpdaterError::Cancelled(stage));
        }
        Ok(())
    }

    /// Ask the provider for its newest version and compare it with `current`.
    pub async fn check_version(&mut self, current: &str) -> Result<UpdateStatus> {
        self.transitions.clear();
        self.transition(UpdateState::CheckingVersion);

        let latest = self.provider.latest_version().await?;
        if is_newer(&latest, current) {
            tracing::info!(current, latest = %latest, "update available");
            Ok(UpdateStatus::Available { latest })
        } else {
            tracing::info!(current, latest = %latest, "already up to date");
            self.transition(UpdateState::UpToDate);
            Ok(UpdateStatus::UpToDate { latest })
        }
    }

    /// Copy the provider's tree into a fresh staging area.
    ///
    /// The area is created under [`UpdaterConfig::staging_root`], or the
    /// system temporary directory when unset. Its root gets [`DEFAULT_DIR_MODE`].
    pub async fn fetch_to_staging(&mut self) -> Result<StagingArea> {
        let parent = self
            .config
            .staging_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        self.fetch_into(&parent, "update", DEFAULT_DIR_MODE).await
    }

    async fn fetch_into(
        &mut self,
        parent: &Path,
        label: &str,
        root_mode: u32,
    ) -> Result<StagingArea> {
        self.ensure_not_cancelled("fetch")?;
        self.transition(UpdateState::Fetching);

        let fetched = match StagingArea::create(parent, label) {
            Ok(staging) => {
                let populated = self.populate(staging.path(), root_mode).await;
                let closed = self.provider.close().await;
                populated.and(closed).map(|()| staging)
            }
            Err(err) => Err(err),
        };

        match fetched {
            Ok(staging) => {
                tracing::info!(staging = %staging.path().display(), "update fetched");
                self.transition(UpdateState::Fetched);
                Ok(staging)
            }
            Err(err) => {
                if let Err(close_err) = self.provider.close().await {
                    tracing::warn!(error = %close_err, "failed to close provider");
                }
                tracing::warn!(error = %err, "fetch failed");
                self.transition(UpdateState::RolledBack);
                Err(UpdaterError::FetchFailed {
                    source: Box::new(err),
                })
            }
        }
    }

    /// Copy every entry into `root`. Directories stay owner-writable until
    /// the last file has landed and only then take their published modes.
    async fn populate(&mut self, root: &Path, root_mode: u32) -> Result<()> {
        self.provider.open().await?;

        let mut files = Vec::new();
        let mut dirs = vec![(root.to_path_buf(), root_mode)];
        let mut visit = |info: &FileInfo| -> Result<()> {
            let dest = join_relative(root, &info.path);
            if info.is_dir {
                create_dir(&dest, info.mode | OWNER_WRITABLE)?;
                dirs.push((dest, info.mode));
            } else {
                files.push(info.path.clone());
            }
            Ok(())
        };
        self.provider.walk(&mut visit).await?;

        for path in &files {
            tracing::debug!(path = %path, "retrieving");
            self.provider
                .retrieve(path, &join_relative(root, path))
                .await?;
        }
        apply_dir_modes(dirs)
    }

    /// Check the staged tree against its own manifest and the trusted key.
    pub async fn verify_staging(&mut self, staging: &StagingArea) -> Result<()> {
        self.ensure_not_cancelled("verification")?;
        self.transition(UpdateState::Verifying);

        let key = self.verifying_key;
        let root = staging.path().to_path_buf();
        let manifest_name = self.config.signature_file.clone();
        let verified = task::spawn_blocking(move || {
            let manifest = read_manifest(&root.join(&manifest_name))?;
            verify_tree(&key, &root, &manifest, &manifest_name)
        })
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?;

        if let Err(err) = verified {
            tracing::warn!(error = %err, "staged update failed verification");
            self.transition(UpdateState::VerifyFailed);
            return Err(UpdaterError::VerifyFailed {
                source: Box::new(err),
            });
        }
        tracing::info!("staged update verified");
        Ok(())
    }

    /// Swap a verified staging area into `install_path`.
    pub async fn apply_staging(
        &mut self,
        staging: StagingArea,
        install_path: &Path,
    ) -> Result<ApplyOutcome> {
        self.ensure_not_cancelled("swap")?;
        self.transition(UpdateState::Applying);

        let swap_fs = Arc::clone(&self.swap_fs);
        let target = install_path.to_path_buf();
        let keep_backup = self.config.keep_backup;
        let applied = task::spawn_blocking(move || {
            swap_with(swap_fs.as_ref(), staging.path(), &target, keep_backup)
        })
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?;

        match applied {
            Ok(outcome) => {
                self.transition(UpdateState::Applied);
                Ok(outcome)
            }
            Err(err @ UpdaterError::IrrecoverableState { .. }) => {
                self.transition(UpdateState::ApplyFailed);
                Err(err)
            }
            Err(err) => {
                self.transition(UpdateState::ApplyFailed);
                self.transition(UpdateState::RolledBack);
                Err(err)
            }
        }
    }

    /// Run a full cycle against the installation at `install_path`, which
    /// currently holds version `current`.
    pub async fn update(&mut self, current: &str, install_path: &Path) -> Result<UpdateOutcome> {
        self.transitions.clear();
        let result = self.run_update(current, install_path).await;
        self.transition(UpdateState::Idle);
        result
    }

    async fn run_update(&mut self, current: &str, install_path: &Path) -> Result<UpdateOutcome> {
        if !install_path.is_absolute() {
            return Err(UpdaterError::NonAbsolutePath(install_path.to_path_buf()));
        }

        let latest = match self.check_version(current).await? {
            UpdateStatus::UpToDate { .. } => {
                return Ok(UpdateOutcome::UpToDate {
                    version: current.to_string(),
                })
            }
            UpdateStatus::Available { latest } => latest,
        };

        let parent = match &self.config.staging_root {
            Some(root) => root.clone(),
            None => install_path
                .parent()
                .ok_or_else(|| UpdaterError::validation("install path must have a parent directory"))?
                .to_path_buf(),
        };
        let label = install_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "update".to_string());

        // The staged root replaces the installation root, so it inherits its mode.
        let root_mode = dir_mode(install_path)?;
        let staging = self.fetch_into(&parent, &label, root_mode).await?;
        if let Err(err) = self.verify_staging(&staging).await {
            drop(staging);
            self.transition(UpdateState::RolledBack);
            return Err(err);
        }

        let outcome = self.apply_staging(staging, install_path).await?;
        tracing::info!(previous = current, version = %latest, "update complete");
        Ok(UpdateOutcome::Applied {
            previous: current.to_string(),
            version: latest,
            install_path: outcome.install_path,
            backup_path: outcome.backup_path,
        })
    }
}
