use super::{ArchiveProvider, Provider, Visit};
use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const DEFAULT_CATALOG_URL: &str = "https://api.github.com/";

/// A published release as described by the catalog.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Release {
    /// Version tag of the release, e.g. `v1.4.0`.
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    /// File name of the asset.
    pub name: String,
    /// Where the asset can be downloaded from.
    pub browser_download_url: String,
}

/// Builder for [`ReleaseCatalogProvider`].
#[derive(Default)]
pub struct ReleaseCatalogProviderBuilder {
    base: Option<Url>,
    client: Option<Client>,
    token: Option<String>,
    repository: Option<String>,
    asset_name: Option<String>,
}

impl ReleaseCatalogProviderBuilder {
    /// Set the catalog base URL (defaults to `https://api.github.com/`).
    pub fn base_url(mut self, url: Url) -> Self {
        self.base = Some(url);
        self
    }

    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Bearer token sent with requests to the catalog's own origin.
    ///
    /// Assets hosted on any other origin are downloaded without it.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Repository in `owner/name` form.
    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Name of the `.tar.gz` asset holding the package.
    pub fn asset_name(mut self, name: impl Into<String>) -> Self {
        self.asset_name = Some(name.into());
        self
    }

    /// Build the provider.
    pub fn build(self) -> Result<ReleaseCatalogProvider> {
        let base = match self.base {
            Some(base) => base,
            None => Url::parse(DEFAULT_CATALOG_URL)
                .map_err(|err| UpdaterError::validation(format!("invalid catalog URL: {err}")))?,
        };
        let repository = self
            .repository
            .filter(|repo| repo.split('/').filter(|part| !part.is_empty()).count() == 2)
            .ok_or_else(|| UpdaterError::validation("repository must be given as owner/name"))?;
        let asset_name = self
            .asset_name
            .ok_or_else(|| UpdaterError::validation("release asset name is required"))?;

        Ok(ReleaseCatalogProvider {
            base,
            client: self.client.unwrap_or_default(),
            token: self.token,
            repository,
            asset_name,
            resolved: None,
            download: None,
        })
    }
}

/// A release asset downloaded for the current open/close window.
struct Download {
    _dir: TempDir,
    archive: ArchiveProvider,
}

/// Provider backed by a remote release catalog (GitHub releases API shape).
///
/// `open` streams the archive asset of the release last reported by
/// [`Provider::latest_version`] to a private temporary directory and exposes
/// it through an [`ArchiveProvider`]. When no version has been asked for yet,
/// `open` resolves the latest release itself.
pub struct ReleaseCatalogProvider {
    base: Url,
    client: Client,
    token: Option<String>,
    repository: String,
    asset_name: String,
    resolved: Option<Release>,
    download: Option<Download>,
}

impl ReleaseCatalogProvider {
    /// Create a new builder.
    pub fn builder() -> ReleaseCatalogProviderBuilder {
        ReleaseCatalogProviderBuilder::default()
    }

    fn latest_release_url(&self) -> Result<Url> {
        let slug = format!("repos/{}/releases/latest", self.repository.trim_matches('/'));
        self.base
            .join(&slug)
            .map_err(|err| UpdaterError::validation(format!("invalid catalog URL: {err}")))
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let same_origin = url.origin() == self.base.origin();
        let request = self
            .client
            .get(url)
            .header(header::USER_AGENT, concat!("updater/", env!("CARGO_PKG_VERSION")));
        match &self.token {
            Some(token) if same_origin => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Query the catalog for its newest published release.
    pub async fn latest_release(&self) -> Result<Release> {
        let url = self.latest_release_url()?;
        let response = self
            .request(url.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| unavailable(&url, err))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(UpdaterError::NotFound(format!(
                "no published release for {}",
                self.repository
            ))),
            status if !status.is_success() => Err(unavailable(&url, format!("HTTP {status}"))),
            _ => {
                let body = response.bytes().await.map_err(|err| unavailable(&url, err))?;
                serde_json::from_slice(&body).map_err(|err| {
                    unavailable(&url, format!("unexpected catalog response: {err}"))
                })
            }
        }
    }

    async fn download_asset(&self, asset: &ReleaseAsset, dest: &Path) -> Result<()> {
        let url = Url::parse(&asset.browser_download_url).map_err(|err| {
            UpdaterError::validation(format!("invalid asset URL {}: {err}", asset.browser_download_url))
        })?;
        let mut response = self
            .request(url.clone())
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| unavailable(&url, err))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| UpdaterError::io(dest, err))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|err| unavailable(&url, err))? {
            file.write_all(&chunk)
                .await
                .map_err(|err| UpdaterError::io(dest, err))?;
            written += chunk.len() as u64;
        }
        file.sync_all()
            .await
            .map_err(|err| UpdaterError::io(dest, err))?;

        tracing::info!(asset = %asset.name, bytes = written, "downloaded release asset");
        Ok(())
    }

    fn archive(&mut self) -> Result<&mut ArchiveProvider> {
        self.download
            .as_mut()
            .map(|download| &mut download.archive)
            .ok_or(UpdaterError::NotOpen)
    }
}

fn unavailable(url: &Url, reason: impl ToString) -> UpdaterError {
    UpdaterError::Unavailable {
        source_name: url.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Provider for ReleaseCatalogProvider {
    async fn open(&mut self) -> Result<()> {
        self.close().await?;

        let release = match &self.resolved {
            Some(release) => release.clone(),
            None => self.latest_release().await?,
        };
        let asset = release
            .assets
            .iter()
            .find(|asset| asset.name == self.asset_name)
            .ok_or_else(|| {
                UpdaterError::NotFound(format!(
                    "asset {} in release {}",
                    self.asset_name, release.tag_name
                ))
            })?;

        let dir = TempDir::new().map_err(UpdaterError::IoUnscoped)?;
        let archive_path = dir.path().join(&asset.name);
        self.download_asset(asset, &archive_path).await?;

        tracing::debug!(tag = %release.tag_name, asset = %asset.name, "opening release");
        let mut archive = ArchiveProvider::new(archive_path).with_version(&release.tag_name);
        archive.open().await?;
        self.download = Some(Download { _dir: dir, archive });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut download) = self.download.take() {
            download.archive.close().await?;
        }
        Ok(())
    }

    async fn latest_version(&mut self) -> Result<String> {
        let release = self.latest_release().await?;
        let tag = release.tag_name.clone();
        self.resolved = Some(release);
        Ok(tag)
    }

    async fn walk(&mut self, visit: &mut Visit<'_>) -> Result<()> {
        self.archive()?.walk(visit).await
    }

    async fn retrieve(&mut self, src: &str, dest: &Path) -> Result<()> {
        self.archive()?.retrieve(src, dest).await
    }
}
