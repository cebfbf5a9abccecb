//! Signed self-update engine.
//!
//! A release is a directory tree accompanied by `signatures.json`, a manifest
//! holding an Ed25519 signature over the SHA-256 digest of every regular file.
//! Releases are served by a [`Provider`] (a plain directory, a `.tar.gz`
//! archive or a remote release catalog). The [`Updater`] copies the release
//! into a private staging directory, verifies every file against the trusted
//! public key and only then swaps the staging tree into the installation,
//! restoring the previous installation if the swap fails part way.
//!
//! ```ignore
//! use updater::{load_verifying_key_pem, ArchiveProvider, UpdateOutcome, Updater};
//!
//! # async fn demo() -> updater::Result<()> {
//! let verifying_key = load_verifying_key_pem(include_bytes!("../release.pub.pem"))?;
//! let provider = ArchiveProvider::new("/var/cache/tool/tool-1.4.0.tar.gz");
//! let mut updater = Updater::new(provider, verifying_key);
//!
//! let install_path = std::path::Path::new("/opt/tool");
//! match updater.update(env!("CARGO_PKG_VERSION"), install_path).await? {
//!     UpdateOutcome::Applied { version, .. } => println!("updated to {version}"),
//!     UpdateOutcome::UpToDate { version } => println!("already at {version}"),
//! }
//! # Ok(())
//! # }
//! ```

mod apply;
mod config;
mod error;
mod manifest;
mod provider;
mod signing;
mod tree;
mod updater;
mod version;

pub use apply::{apply_staging, ApplyOutcome};
pub use config::UpdaterConfig;
pub use error::{ErrorKind, Result, UpdaterError};
pub use manifest::{
    read_manifest, write_manifest, FileSignature, SignatureManifest, SIGNATURE_ALGORITHM,
    SIGNATURE_FILE,
};
pub use provider::{
    ArchiveProvider, FileInfo, LocalDirProvider, Provider, Release, ReleaseAsset,
    ReleaseCatalogProvider, ReleaseCatalogProviderBuilder, Visit, DEFAULT_DIR_MODE,
    DEFAULT_FILE_MODE, VERSION_FILE,
};
pub use signing::{
    compute_folder_signatures, file_digest, load_signing_key_pem, load_verifying_key_pem,
    read_signing_key, read_verifying_key, sign_package, verify_folder, verify_package,
};
pub use updater::{StagingArea, UpdateOutcome, UpdateState, UpdateStatus, Updater};
pub use version::{is_newer, parse_version};
