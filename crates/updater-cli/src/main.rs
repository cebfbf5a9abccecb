//! Command-line front end for the signed self-update engine.
//!
//! Signs release trees, verifies them, and checks for or applies updates from
//! a directory, a `.tar.gz` archive or a remote release catalog.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};
use updater::{
    is_newer, read_verifying_key, sign_package, verify_package, ArchiveProvider, LocalDirProvider,
    Provider, ReleaseCatalogProvider, UpdateOutcome, Updater, UpdaterConfig, UpdaterError,
};

/// Command-line arguments for the updater
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign every file of a release tree and write its signature manifest
    Sign {
        /// Root of the release tree
        #[arg(long)]
        path: PathBuf,

        /// PKCS#8 PEM private key
        #[arg(long)]
        key: PathBuf,
    },

    /// Verify a release tree against its signature manifest
    Verify {
        /// Root of the release tree
        #[arg(long)]
        path: PathBuf,

        /// SPKI PEM public key
        #[arg(long, env = "UPDATER_PUBLIC_KEY")]
        public_key: PathBuf,
    },

    /// Report whether the source offers a newer version
    Check {
        /// Currently installed version
        #[arg(long)]
        current: String,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Fetch, verify and install the newest version
    Update {
        /// Currently installed version
        #[arg(long)]
        current: String,

        /// Installation directory to replace (absolute)
        #[arg(long)]
        install: PathBuf,

        /// SPKI PEM public key
        #[arg(long, env = "UPDATER_PUBLIC_KEY")]
        public_key: PathBuf,

        /// Keep the previous installation next to the new one
        #[arg(long, default_value_t = false)]
        keep_backup: bool,

        /// Directory for staging areas (defaults to next to the installation)
        #[arg(long)]
        staging_root: Option<PathBuf>,

        #[command(flatten)]
        source: SourceArgs,
    },
}

/// Where releases come from. Exactly one of `--dir`, `--archive` or `--repo`.
#[derive(Args, Debug)]
struct SourceArgs {
    /// Release tree on the local filesystem
    #[arg(long, conflicts_with_all = ["archive", "repo"])]
    dir: Option<PathBuf>,

    /// Release packed as a .tar.gz archive
    #[arg(long, conflicts_with = "repo")]
    archive: Option<PathBuf>,

    /// Release catalog repository, as owner/name
    #[arg(long, requires = "asset")]
    repo: Option<String>,

    /// Name of the release asset holding the archive
    #[arg(long)]
    asset: Option<String>,

    /// Catalog API base URL
    #[arg(long)]
    catalog_url: Option<String>,

    /// Catalog access token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Version to report for a directory or archive source
    #[arg(long)]
    source_version: Option<String>,
}

impl SourceArgs {
    fn provider(self) -> anyhow::Result<Box<dyn Provider>> {
        if let Some(dir) = self.dir {
            let mut provider = LocalDirProvider::new(dir);
            if let Some(version) = self.source_version {
                provider = provider.with_version(version);
            }
            return Ok(Box::new(provider));
        }

        if let Some(archive) = self.archive {
            let mut provider = ArchiveProvider::new(archive);
            if let Some(version) = self.source_version {
                provider = provider.with_version(version);
            }
            return Ok(Box::new(provider));
        }

        if let Some(repo) = self.repo {
            let mut builder = ReleaseCatalogProvider::builder().repository(repo);
            if let Some(asset) = self.asset {
                builder = builder.asset_name(asset);
            }
            if let Some(token) = self.token {
                builder = builder.token(token);
            }
            if let Some(url) = self.catalog_url {
                let url = reqwest::Url::parse(&url)
                    .with_context(|| format!("invalid catalog URL {url}"))?;
                builder = builder.base_url(url);
            }
            return Ok(Box::new(builder.build()?));
        }

        bail!("no update source given; use --dir, --archive or --repo")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug,updater=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err.downcast_ref::<UpdaterError>() {
                Some(updater_err) => {
                    let kind = updater_err.kind();
                    tracing::error!(kind = %kind, "{err:#}");
                    kind.exit_code()
                }
                None => {
                    tracing::error!("{err:#}");
                    1
                }
            };
            ExitCode::from(code)
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Sign { path, key } => {
            let manifest = tokio::task::spawn_blocking(move || sign_package(&key, &path)).await??;
            println!("{}", manifest.display());
        }
        Commands::Verify { path, public_key } => {
            let key = read_verifying_key(&public_key)?;
            let manifest =
                tokio::task::spawn_blocking(move || verify_package(&key, &path)).await??;
            println!("verified {} files", manifest.len());
        }
        Commands::Check { current, source } => {
            let mut provider = source.provider()?;
            let latest = provider.latest_version().await?;
            if is_newer(&latest, &current) {
                println!("update available: {latest}");
            } else {
                println!("up to date ({latest})");
            }
        }
        Commands::Update {
            current,
            install,
            public_key,
            keep_backup,
            staging_root,
            source,
        } => {
            let key = read_verifying_key(&public_key)?;
            let install = if install.is_absolute() {
                install
            } else {
                std::env::current_dir()
                    .context("resolving the installation path")?
                    .join(install)
            };

            let mut config = UpdaterConfig::new().keep_backup(keep_backup);
            if let Some(root) = staging_root {
                config = config.staging_root(root);
            }
            let mut updater = Updater::with_config(source.provider()?, key, config);

            let token = updater.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling before the next stage");
                    token.cancel();
                }
            });

            match updater.update(&current, &install).await? {
                UpdateOutcome::UpToDate { version } => println!("up to date ({version})"),
                UpdateOutcome::Applied {
                    previous,
                    version,
                    install_path,
                    backup_path,
                } => {
                    println!("updated {previous} -> {version} at {}", install_path.display());
                    if let Some(backup) = backup_path {
                        println!("previous installation kept at {}", backup.display());
                    }
                }
            }
        }
    }
    Ok(())
}
