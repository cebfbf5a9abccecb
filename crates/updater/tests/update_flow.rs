//! End-to-end update cycles against packed releases.

use ed25519_dalek::SigningKey;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};
use updater::{
    compute_folder_signatures, write_manifest, ArchiveProvider, ErrorKind, LocalDirProvider,
    Provider, UpdateOutcome, Updater, UpdaterError, SIGNATURE_FILE,
};

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[3u8; 32])
}

fn write_release(root: &Path, version: &str) {
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::create_dir_all(root.join("lib/plugins")).unwrap();
    fs::write(root.join("bin/tool"), format!("#!/bin/sh\necho {version}\n")).unwrap();
    fs::write(root.join("lib/core.so"), vec![0x7f, b'E', b'L', b'F', 2, 1]).unwrap();
    fs::write(root.join("VERSION"), version).unwrap();
}

fn sign(root: &Path) {
    let manifest = compute_folder_signatures(&signing_key(), root).unwrap();
    write_manifest(&root.join(SIGNATURE_FILE), &manifest).unwrap();
}

fn pack(root: &Path, archive: &Path) {
    let encoder = GzEncoder::new(File::create(archive).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", root).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

fn entries(parent: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(parent)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

struct Scenario {
    _work: TempDir,
    installs: TempDir,
    archive: PathBuf,
}

impl Scenario {
    /// Installed 1.0.0 and an archived 1.1.0 release; `tamper` edits the
    /// release tree after it was signed.
    fn new(tamper: impl FnOnce(&Path)) -> Self {
        let work = tempdir().unwrap();
        let installs = tempdir().unwrap();

        let release = work.path().join("release");
        write_release(&release, "1.1.0");
        sign(&release);
        tamper(&release);
        let archive = work.path().join("tool-1.1.0.tar.gz");
        pack(&release, &archive);

        let installed = installs.path().join("tool");
        write_release(&installed, "1.0.0");
        sign(&installed);

        Self {
            _work: work,
            installs,
            archive,
        }
    }

    fn install_path(&self) -> PathBuf {
        self.installs.path().join("tool")
    }

    fn updater(&self) -> Updater<ArchiveProvider> {
        Updater::new(
            ArchiveProvider::new(&self.archive),
            signing_key().verifying_key(),
        )
    }
}

#[tokio::test]
async fn signed_archive_is_applied_without_residue() {
    let scenario = Scenario::new(|_| {});
    let mut updater = scenario.updater();

    let outcome = updater
        .update("1.0.0", &scenario.install_path())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        UpdateOutcome::Applied { ref version, backup_path: None, .. } if version == "1.1.0"
    ));

    let install = scenario.install_path();
    assert_eq!(
        fs::read_to_string(install.join("bin/tool")).unwrap(),
        "#!/bin/sh\necho 1.1.0\n"
    );
    assert!(install.join("lib/plugins").is_dir());
    assert!(install.join(SIGNATURE_FILE).is_file());
    assert_eq!(entries(scenario.installs.path()), vec!["tool"]);

    let mut installed = LocalDirProvider::new(&install);
    assert_eq!(installed.latest_version().await.unwrap(), "1.1.0");
}

#[tokio::test]
async fn tampered_archive_never_touches_installation() {
    let scenario = Scenario::new(|release| {
        fs::write(release.join("bin/tool"), "#!/bin/sh\nrm -rf ~\n").unwrap();
    });
    let mut updater = scenario.updater();

    let err = updater
        .update("1.0.0", &scenario.install_path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VerifyFailed);
    assert!(err.is_trust_violation());
    assert!(err.to_string().contains("bin/tool"), "{err}");

    assert_eq!(
        fs::read_to_string(scenario.install_path().join("bin/tool")).unwrap(),
        "#!/bin/sh\necho 1.0.0\n"
    );
    assert_eq!(entries(scenario.installs.path()), vec!["tool"]);
}

#[tokio::test]
async fn smuggled_file_is_rejected() {
    let scenario = Scenario::new(|release| {
        fs::write(release.join("lib/plugins/extra.so"), b"payload").unwrap();
    });
    let mut updater = scenario.updater();

    let err = updater
        .update("1.0.0", &scenario.install_path())
        .await
        .unwrap_err();
    assert!(matches!(
        err.root_cause(),
        UpdaterError::ExtraFile { path } if path == "lib/plugins/extra.so"
    ));
    assert_eq!(entries(scenario.installs.path()), vec!["tool"]);
}

#[tokio::test]
async fn unreadable_archive_is_a_fetch_failure() {
    let scenario = Scenario::new(|_| {});
    fs::write(&scenario.archive, b"definitely not gzip").unwrap();
    let mut updater = scenario.updater();

    let err = updater
        .update("1.0.0", &scenario.install_path())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FetchFailed);
    assert_eq!(err.root_cause().kind(), ErrorKind::Corrupt);
    assert_eq!(entries(scenario.installs.path()), vec!["tool"]);
}

#[tokio::test]
async fn newer_installation_is_left_alone() {
    let scenario = Scenario::new(|_| {});
    let mut updater = scenario.updater();

    let outcome = updater
        .update("2.0.0", &scenario.install_path())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::UpToDate {
            version: "2.0.0".into()
        }
    );
}
