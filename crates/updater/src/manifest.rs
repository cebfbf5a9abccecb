use crate::error::{Result, UpdaterError};
use crate::tree::normalize_relative;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Name of the signature manifest inside a signed package root.
pub const SIGNATURE_FILE: &str = "signatures.json";

/// Algorithm identifier: Ed25519 over the SHA-256 digest of the file content.
pub const SIGNATURE_ALGORITHM: &str = "ed25519-sha256";

/// Signature of a single regular file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSignature {
    /// Algorithm used to produce `signature`.
    pub algorithm: String,
    /// Raw signature bytes (base64 in JSON).
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub signature: Vec<u8>,
}

/// Mapping of relative file path to signature for a whole package tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureManifest {
    /// Entries keyed by `/`-separated relative path.
    pub files: BTreeMap<String, FileSignature>,
}

impl SignatureManifest {
    /// An empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the signature of `path`, replacing any earlier entry.
    pub fn insert(&mut self, path: impl Into<String>, signature: FileSignature) {
        self.files.insert(path.into(), signature);
    }

    /// Signature recorded for `path`.
    pub fn get(&self, path: &str) -> Option<&FileSignature> {
        self.files.get(path)
    }

    /// Whether `path` has a signature.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of signed files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether no file is signed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileSignature)> {
        self.files.iter().map(|(path, sig)| (path.as_str(), sig))
    }

    /// Reject entries whose path is absolute, escapes the root or is not normalized.
    fn validate_paths(&self) -> std::result::Result<(), String> {
        for path in self.files.keys() {
            match normalize_relative(Path::new(path))? {
                Some(normalized) if normalized == *path => {}
                _ => return Err(format!("entry {path:?} is not a normalized relative path")),
            }
        }
        Ok(())
    }
}

/// Serialize `manifest` to `path`, replacing any previous manifest atomically.
pub fn write_manifest(path: &Path, manifest: &SignatureManifest) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|err| UpdaterError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|err| UpdaterError::io(parent, err))?;
    temp.write_all(&bytes)
        .and_then(|_| temp.flush())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| UpdaterError::io(temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| UpdaterError::io(path, err.error))?;

    tracing::debug!(path = %path.display(), entries = manifest.len(), "wrote signature manifest");
    Ok(())
}

/// Load a manifest previously written by [`write_manifest`].
pub fn read_manifest(path: &Path) -> Result<SignatureManifest> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UpdaterError::NotFound(path.display().to_string()))
        }
        Err(err) => return Err(UpdaterError::io(path, err)),
    };

    let manifest: SignatureManifest =
        serde_json::from_slice(&bytes).map_err(|err| UpdaterError::Malformed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    manifest
        .validate_paths()
        .map_err(|reason| UpdaterError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;
    Ok(manifest)
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|err| serde::de::Error::custom(format!("malformed base64 signature: {err}")))
}
