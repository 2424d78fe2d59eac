use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use tokio::io::AsyncWriteExt;

/// Talks to the `/cdn` API of an edge node.
#[derive(Debug, Clone)]
pub struct CdnClient {
    client: reqwest::Client,
    base: Url,
}

impl CdnClient {
    pub fn new(base: Url) -> Result<Self> {
        if base.cannot_be_a_base() {
            bail!("`{base}` cannot be used as a base URL");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    /// Builds `<base>/cdn/<segments>`, percent-encoding every segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("cdn").extend(segments);
        }
        url
    }

    async fn get(&self, segments: &[&str]) -> Result<reqwest::Response> {
        let url = self.url(segments);
        tracing::debug!(%url, "GET");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{url} responded with {status}");
        }
        Ok(response)
    }

    async fn list(&self, segments: &[&str]) -> Result<Vec<String>> {
        let response = self.get(segments).await?;
        response.json().await.context("invalid listing")
    }

    pub async fn list_series(&self) -> Result<Vec<String>> {
        self.list(&["list-series"]).await
    }

    pub async fn list_types(&self, series: &str) -> Result<Vec<String>> {
        self.list(&["list-types", series]).await
    }

    pub async fn list_files(&self, series: &str, ty: &str) -> Result<Vec<String>> {
        self.list(&["list-files", series, ty]).await
    }

    /// Downloads a file into `output_dir`, replacing any previous download of the same name.
    ///
    /// Returns the path of the saved file.
    pub async fn download(
        &self,
        series: &str,
        ty: &str,
        filename: &str,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let Some(local_name) = Path::new(filename).file_name() else {
            bail!("refusing to save `{filename}` outside of {}", output_dir.display());
        };
        let target = output_dir.join(local_name);

        let mut response = self.get(&[series, ty, filename]).await?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        let mut file = tokio::fs::File::create(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let mut written = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        tracing::info!(path = %target.display(), written, "Download complete");
        Ok(target)
    }
}
