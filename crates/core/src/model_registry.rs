use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{resolve_relative_to, RestoreConfig};

/// Outcome of [`ensure_model`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStatus {
    Present(PathBuf),
    Downloaded { path: PathBuf, sha256: String },
    /// No file and no URL to fetch it from; jobs will fail until it appears.
    Missing(PathBuf),
}

impl ModelStatus {
    pub fn path(&self) -> &Path {
        match self {
            Self::Present(path) | Self::Missing(path) => path,
            Self::Downloaded { path, .. } => path,
        }
    }
}

/// Absolute model location for the given restore settings.
pub fn model_path(data_dir: &Path, restore: &RestoreConfig) -> PathBuf {
    resolve_relative_to(data_dir, &restore.models_dir).join(&restore.model_file)
}

/// Make sure the model file exists, downloading it when a URL is configured.
pub async fn ensure_model(path: &Path, url: Option<&str>) -> Result<ModelStatus> {
    if path.is_file() {
        info!(path = %path.display(), "Restoration model present");
        return Ok(ModelStatus::Present(path.to_path_buf()));
    }

    let Some(url) = url else {
        warn!(
            path = %path.display(),
            "Restoration model missing and no model_url configured"
        );
        return Ok(ModelStatus::Missing(path.to_path_buf()));
    };

    let sha256 = download(url, path).await?;
    Ok(ModelStatus::Downloaded {
        path: path.to_path_buf(),
        sha256,
    })
}

async fn download(url: &str, final_path: &Path) -> Result<String> {
    let dir = final_path
        .parent()
        .context("model path does not have a parent directory")?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create models directory: {}", dir.display()))?;

    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("model path does not have a file name")?;
    let tmp_path = dir.join(format!("{file_name}.part"));

    info!(url = %url, path = %final_path.display(), "Downloading model");

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(30 * 60))
        .build()
        .context("Failed to build HTTP client for model download")?;

    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to start model download from {url}"))?;

    if !response.status().is_success() {
        bail!(
            "Model download from {url} returned HTTP {}",
            response.status().as_u16()
        );
    }

    let mut tmp_file = fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    let streamed: Result<()> = async {
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed while downloading model from {url}"))?
        {
            hasher.update(&chunk);
            total += chunk.len() as u64;
            tmp_file.write_all(&chunk).await?;
        }
        tmp_file.sync_all().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(err) = streamed {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.context(format!("Failed to write {}", tmp_path.display())));
    }
    drop(tmp_file);

    if total == 0 {
        let _ = fs::remove_file(&tmp_path).await;
        bail!("Model download from {url} returned an empty body");
    }

    fs::rename(&tmp_path, final_path).await.with_context(|| {
        format!(
            "Failed to move {} to {}",
            tmp_path.display(),
            final_path.display()
        )
    })?;

    let sha256 = format!("{:x}", hasher.finalize());
    info!(
        path = %final_path.display(),
        bytes = total,
        %sha256,
        "Download complete"
    );
    Ok(sha256)
}
