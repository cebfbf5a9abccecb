//! Configuration for the updater.

use crate::manifest::SIGNATURE_FILE;
use std::path::PathBuf;

/// Configuration for an [`Updater`](crate::Updater).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// Name of the signature manifest at the package root
    pub signature_file: String,
    /// Directory in which staging areas are created. When unset, staging is
    /// created next to the installation so the final swap is a rename.
    pub staging_root: Option<PathBuf>,
    /// Keep the previous installation after a successful swap
    pub keep_backup: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            signature_file: SIGNATURE_FILE.to_string(),
            staging_root: None,
            keep_backup: false,
        }
    }
}

impl UpdaterConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manifest file name
    pub fn signature_file(mut self, name: impl Into<String>) -> Self {
        self.signature_file = name.into();
        self
    }

    /// Set the directory used for staging areas
    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Enable/disable keeping the backup after a successful swap
    pub fn keep_backup(mut self, keep: bool) -> Self {
        self.keep_backup = keep;
        self
    }
}
