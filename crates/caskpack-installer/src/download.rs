use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use caskpack_core::{CaskError, PackageDefinition};
use caskpack_security::verify_sha256_file;
use tracing::{debug, info};

pub trait Downloader: Send + Sync {
    /// Downloads and verifies the definition's artifact, returning its local path.
    fn fetch(&self, definition: &PackageDefinition) -> Result<PathBuf>;
}

/// Fetches `http(s)://` URLs with a blocking client and copies `file://`
/// URLs, caching results under one directory keyed by token and version.
pub struct HttpDownloader {
    cache_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .user_agent(concat!("caskpack/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            cache_dir: cache_dir.into(),
            client,
        })
    }

    pub fn cache_path(&self, definition: &PackageDefinition) -> Result<PathBuf> {
        let url = definition
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("cask '{}' has no url", definition.token))?;
        Ok(self.cache_dir.join(format!(
            "{}--{}--{}",
            definition.token,
            definition.version,
            url_file_name(url)
        )))
    }

    fn download_to(&self, url: &str, destination: &Path) -> Result<()> {
        if let Some(local) = url.strip_prefix("file://") {
            fs::copy(local, destination)
                .with_context(|| format!("failed to copy {local} to {}", destination.display()))?;
            return Ok(());
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("download failed: {url}"))?;
        let mut file = fs::File::create(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("failed writing download to {}", destination.display()))?;
        file.flush()
            .with_context(|| format!("failed flushing {}", destination.display()))?;
        Ok(())
    }
}

impl Downloader for HttpDownloader {
    fn fetch(&self, definition: &PackageDefinition) -> Result<PathBuf> {
        let url = definition
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("cask '{}' has no url", definition.token))?;
        let cache_path = self.cache_path(definition)?;

        // `latest` artifacts change under the same URL, so they are never reused.
        if cache_path.is_file() && !definition.is_latest() {
            if verify_cached(&cache_path, definition.sha256.as_deref())? {
                debug!(path = %cache_path.display(), "using cached download");
                return Ok(cache_path);
            }
            fs::remove_file(&cache_path).with_context(|| {
                format!("failed removing stale download {}", cache_path.display())
            })?;
        }

        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("failed to create {}", self.cache_dir.display()))?;
        let mut partial = cache_path.clone().into_os_string();
        partial.push(".incomplete");
        let partial = PathBuf::from(partial);
        info!(cask = %definition.token, url, "downloading");
        let result = self.download_to(url, &partial).and_then(|()| {
            if !verify_cached(&partial, definition.sha256.as_deref())? {
                return Err(anyhow!(
                    "checksum mismatch for cask '{}' downloaded from {url}",
                    definition.token
                ));
            }
            fs::rename(&partial, &cache_path)
                .with_context(|| format!("failed to move download to {}", cache_path.display()))
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result?;
        Ok(cache_path)
    }
}

fn verify_cached(path: &Path, sha256: Option<&str>) -> Result<bool> {
    match sha256 {
        Some(expected) => verify_sha256_file(path, expected),
        None => Ok(true),
    }
}

fn url_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if name.is_empty() || name.contains("://") {
        "download".to_string()
    } else {
        name.to_string()
    }
}

/// Concurrent fetch phase ahead of the sequential install loop: `flush`
/// returns only after every queued fetch has finished.
pub struct DownloadQueue {
    downloader: Arc<dyn Downloader>,
    pool: rayon::ThreadPool,
    pending: Vec<PackageDefinition>,
}

impl DownloadQueue {
    pub fn new(downloader: Arc<dyn Downloader>, concurrency: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|index| format!("caskpack-download-{index}"))
            .build()
            .context("failed to build download thread pool")?;
        Ok(Self {
            downloader,
            pool,
            pending: Vec::new(),
        })
    }

    pub fn enqueue(&mut self, definition: PackageDefinition) {
        self.pending.push(definition);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Runs all queued fetches, failing with every fetch error once all are done.
    pub fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let errors = Mutex::new(Vec::new());
        let downloader = &self.downloader;

        self.pool.scope(|scope| {
            for definition in &pending {
                let errors = &errors;
                scope.spawn(move |_| {
                    if let Err(err) = downloader.fetch(definition) {
                        if let Ok(mut errors) = errors.lock() {
                            errors.push(err.context(format!(
                                "failed to fetch cask '{}'",
                                definition.full_token()
                            )));
                        }
                    }
                });
            }
        });

        let mut errors = errors
            .into_inner()
            .map_err(|_| anyhow!("download queue error list was poisoned"))?;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CaskError::MultipleErrors { errors }.into()),
        }
    }
}
