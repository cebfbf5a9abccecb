use std::fmt;
use std::path::PathBuf;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while signing, fetching, verifying or applying an update.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// The update source could not be reached or does not exist.
    #[error("update source unavailable ({source_name}): {reason}")]
    Unavailable {
        /// Human readable name of the source (path or URL).
        source_name: String,
        /// Why the source is unavailable.
        reason: String,
    },
    /// An archive or stream is structurally invalid.
    #[error("corrupt update source {path:?}: {reason}")]
    Corrupt {
        /// The archive or stream that was being read.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// A signature manifest could not be decoded.
    #[error("malformed manifest {path:?}: {reason}")]
    Malformed {
        /// Location of the manifest.
        path: PathBuf,
        /// Why decoding failed.
        reason: String,
    },
    /// The requested item does not exist in the source.
    #[error("not found: {0}")]
    NotFound(String),
    /// A file listed in the manifest is absent from the tree.
    #[error("signed file missing from tree: {path}")]
    MissingFile { path: String },
    /// A file exists in the tree without a manifest entry.
    #[error("unsigned file present in tree: {path}")]
    ExtraFile { path: String },
    /// A file's content does not match its signature.
    #[error("signature mismatch for {path}: {reason}")]
    SignatureMismatch { path: String, reason: String },
    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    KeyInvalid(String),
    /// A symbolic link, hard link or special file was encountered.
    #[error("unsupported entry (only regular files and directories are allowed): {path}")]
    UnsupportedEntry { path: String },
    /// An archive entry was requested after the stream moved past it.
    #[error("archive entry {path} requested out of stream order")]
    OutOfOrderAccess { path: String },
    /// Walk or retrieve called on a provider that is not open.
    #[error("provider is not open")]
    NotOpen,
    /// Walk called twice without re-opening the provider.
    #[error("provider walk already consumed; re-open the provider to walk again")]
    WalkExhausted,
    /// Failed to perform an I/O operation on a known path.
    #[error("filesystem operation on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    IoUnscoped(#[from] std::io::Error),
    /// Fetching into the staging directory failed; the installation was not touched.
    #[error("fetch failed: {source}")]
    FetchFailed {
        #[source]
        source: Box<UpdaterError>,
    },
    /// The staged content failed verification; the installation was not touched.
    #[error("verification failed: {source}")]
    VerifyFailed {
        #[source]
        source: Box<UpdaterError>,
    },
    /// The swap failed and the previous installation was restored.
    #[error("applying update to {install_path:?} failed (previous installation restored): {source}")]
    ApplyFailed {
        install_path: PathBuf,
        #[source]
        source: Box<UpdaterError>,
    },
    /// The swap failed and the backup could not be restored.
    #[error(
        "installation at {install_path:?} is in an irrecoverable state, backup kept at {backup_path:?}: {source}"
    )]
    IrrecoverableState {
        install_path: PathBuf,
        backup_path: PathBuf,
        #[source]
        source: Box<UpdaterError>,
    },
    /// The update was cancelled before the installation was touched.
    #[error("update cancelled before {0}")]
    Cancelled(&'static str),
    /// Attempted to apply an update to a non-absolute installation path.
    #[error("install path must be absolute: {0}")]
    NonAbsolutePath(PathBuf),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Machine readable failure category, stable across error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The source could not be reached.
    Unavailable,
    /// The source content is structurally broken.
    Corrupt,
    /// The signature manifest could not be decoded.
    Malformed,
    /// A release, asset or entry does not exist.
    NotFound,
    /// A signed file is absent from the tree.
    MissingFile,
    /// The tree holds a file the manifest does not sign.
    ExtraFile,
    /// File content does not match its signature.
    SignatureMismatch,
    /// Key material is unusable.
    KeyInvalid,
    /// Links, special files and non UTF-8 names.
    UnsupportedEntry,
    /// An archive entry was asked for after the stream passed it.
    OutOfOrderAccess,
    /// A provider was used outside its open/walk lifecycle.
    InvalidState,
    /// A filesystem operation failed.
    IoFailure,
    /// Staging failed; the installation is untouched.
    FetchFailed,
    /// The staged tree did not verify; the installation is untouched.
    VerifyFailed,
    /// The swap failed and the previous installation is back in place.
    ApplyFailed,
    /// The swap failed and the previous installation could not be restored.
    IrrecoverableState,
    /// The attempt was cancelled before the swap began.
    Cancelled,
    /// Anything else, including invalid arguments.
    Other,
}

impl ErrorKind {
    /// Process exit code for this failure category.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Unavailable | ErrorKind::NotFound => 3,
            ErrorKind::Corrupt | ErrorKind::Malformed => 4,
            ErrorKind::MissingFile
            | ErrorKind::ExtraFile
            | ErrorKind::SignatureMismatch
            | ErrorKind::VerifyFailed => 5,
            ErrorKind::KeyInvalid => 6,
            ErrorKind::UnsupportedEntry | ErrorKind::OutOfOrderAccess => 7,
            ErrorKind::IoFailure | ErrorKind::FetchFailed => 8,
            ErrorKind::ApplyFailed => 9,
            ErrorKind::IrrecoverableState => 10,
            ErrorKind::Cancelled => 11,
            ErrorKind::InvalidState | ErrorKind::Other => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NotFound => "not-found",
            ErrorKind::MissingFile => "missing-file",
            ErrorKind::ExtraFile => "extra-file",
            ErrorKind::SignatureMismatch => "signature-mismatch",
            ErrorKind::KeyInvalid => "key-invalid",
            ErrorKind::UnsupportedEntry => "unsupported-entry",
            ErrorKind::OutOfOrderAccess => "out-of-order-access",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::FetchFailed => "fetch-failed",
            ErrorKind::VerifyFailed => "verify-failed",
            ErrorKind::ApplyFailed => "apply-failed",
            ErrorKind::IrrecoverableState => "irrecoverable-state",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdaterError::Io {
            path: path.into(),
            source,
        }
    }

    /// Failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdaterError::Unavailable { .. } => ErrorKind::Unavailable,
            UpdaterError::Corrupt { .. } => ErrorKind::Corrupt,
            UpdaterError::Malformed { .. } => ErrorKind::Malformed,
            UpdaterError::NotFound(_) => ErrorKind::NotFound,
            UpdaterError::MissingFile { .. } => ErrorKind::MissingFile,
            UpdaterError::ExtraFile { .. } => ErrorKind::ExtraFile,
            UpdaterError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
            UpdaterError::KeyInvalid(_) => ErrorKind::KeyInvalid,
            UpdaterError::UnsupportedEntry { .. } => ErrorKind::UnsupportedEntry,
            UpdaterError::OutOfOrderAccess { .. } => ErrorKind::OutOfOrderAccess,
            UpdaterError::NotOpen | UpdaterError::WalkExhausted => ErrorKind::InvalidState,
            UpdaterError::Io { .. } | UpdaterError::IoUnscoped(_) => ErrorKind::IoFailure,
            UpdaterError::FetchFailed { .. } => ErrorKind::FetchFailed,
            UpdaterError::VerifyFailed { .. } => ErrorKind::VerifyFailed,
            UpdaterError::ApplyFailed { .. } => ErrorKind::ApplyFailed,
            UpdaterError::IrrecoverableState { .. } => ErrorKind::IrrecoverableState,
            UpdaterError::Cancelled(_) => ErrorKind::Cancelled,
            UpdaterError::NonAbsolutePath(_) | UpdaterError::Other(_) => ErrorKind::Other,
        }
    }

    /// The innermost error, looking through fetch/verify/apply wrappers.
    pub fn root_cause(&self) -> &UpdaterError {
        match self {
            UpdaterError::FetchFailed { source }
            | UpdaterError::VerifyFailed { source }
            | UpdaterError::ApplyFailed { source, .. }
            | UpdaterError::IrrecoverableState { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True for failures that prove the content is not trustworthy.
    pub fn is_trust_violation(&self) -> bool {
        matches!(
            self.root_cause().kind(),
            ErrorKind::SignatureMismatch | ErrorKind::ExtraFile | ErrorKind::MissingFile
        )
    }
}
