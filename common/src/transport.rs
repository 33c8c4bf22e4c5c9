//! Fetching partition files from wherever the producing task left them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;

use crate::store::{PairSource, PairStore};
use crate::TaskError;

/// Where a task's files live: a local directory or an HTTP file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Dir(PathBuf),
    Http(Url),
}

impl Location {
    /// Files served by a worker at `host`, i.e. `http://{host}/data/{file}`.
    pub fn http(host: &str) -> Result<Self, TaskError> {
        let url = Url::parse(&format!("http://{host}/data/"))
            .map_err(|e| TaskError::Config(format!("invalid host `{host}`: {e}")))?;
        Ok(Location::Http(url))
    }

    /// Full address of `file` at this location.
    pub fn resolve(&self, file: &str) -> Result<String, TaskError> {
        match self {
            Location::Dir(dir) => Ok(dir.join(file).display().to_string()),
            Location::Http(base) => base
                .join(file)
                .map(String::from)
                .map_err(|e| TaskError::fetch(self, e)),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Dir(dir) => write!(f, "{}", dir.display()),
            Location::Http(url) => write!(f, "{url}"),
        }
    }
}

impl FromStr for Location {
    type Err = TaskError;

    /// `http://` and `https://` URLs become [`Location::Http`] (with a
    /// trailing `/` so files resolve inside it), anything else a directory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Url::parse(s) {
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                if !url.path().ends_with('/') {
                    let path = format!("{}/", url.path());
                    url.set_path(&path);
                }
                Ok(Location::Http(url))
            }
            _ => Ok(Location::Dir(PathBuf::from(s))),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Copies `file` from `source` to the local path `dest`, returning the
    /// number of bytes written.
    async fn fetch(&self, source: &Location, file: &str, dest: &Path) -> Result<u64, TaskError>;
}

/// Copies local files with tokio and downloads remote ones with reqwest.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
    client: reqwest::Client,
}

impl DefaultTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Downloads with a preconfigured client, e.g. one with custom timeouts
    /// or proxy settings.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<u64> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = File::create(dest).await?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn fetch(&self, source: &Location, file: &str, dest: &Path) -> Result<u64, TaskError> {
        let address = source.resolve(file)?;
        debug!("fetching {address} into {}", dest.display());

        let copied = match source {
            Location::Dir(dir) => tokio::fs::copy(dir.join(file), dest)
                .await
                .map_err(anyhow::Error::from),
            Location::Http(_) => self.download(&address, dest).await,
        };

        copied.map_err(|e| TaskError::fetch(&address, e))
    }
}

/// Downloads `file` and opens it as a store.
pub async fn fetch_and_open(
    transport: &dyn Transport,
    store: &dyn PairStore,
    source: &Location,
    file: &str,
    dest: &Path,
) -> Result<Box<dyn PairSource>, TaskError> {
    transport.fetch(source, file, dest).await?;
    store.open(dest).await
}
