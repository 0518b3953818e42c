use std::{path::Path, time::Duration};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::{errors::Error, Result};

/// Result of fetching a URL to a staged path.
#[derive(Clone, Debug)]
pub struct FetchedFile {
    /// Filename inferred from the URL path ("downloaded_file" fallback).
    pub name: String,
    pub size: u64,
}

/// URL fetcher collaborator. Unreachable hosts and non-200 responses are
/// `Error::Download`.
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UrlFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedFile> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("request failed: {e}")))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(Error::Download(format!("server returned {status}")));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut size = 0u64;
        let mut resp = resp;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::Download(format!("read failed: {e}")))?
        {
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(FetchedFile {
            name: infer_filename(url),
            size,
        })
    }
}

/// Last path segment of the URL, query string and fragment stripped.
pub fn infer_filename(url: &str) -> String {
    let no_fragment = url.split('#').next().unwrap_or(url);
    let no_query = no_fragment.split('?').next().unwrap_or(no_fragment);
    let after_scheme = no_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(no_query);
    let name = match after_scheme.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    if name.is_empty() {
        "downloaded_file".to_string()
    } else {
        name.to_string()
    }
}
