//! Object-addressed blob store gateway.
//!
//! Blobs are keyed `uploads/{pluginID}/zip/{filename}` inside one bucket.
//! Uploads stream from disk and downloads stream back out; archives can be
//! multiple gigabytes and must never be buffered whole.

use reqwest::{Body, Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::ArtifactStoreSettings;
use crate::error::Error;

pub const CONTENT_TYPE_ZIP: &str = "application/zip";
pub const CONTENT_TYPE_TAR: &str = "application/x-tar";

/// Blob key for a plugin bundle.
pub fn bundle_key(plugin_id: &str, filename: &str) -> String {
    format!("uploads/{}/zip/{}", plugin_id, filename)
}

/// Content type for an archive filename; anything but zip/tar is rejected.
pub fn content_type_for(filename: &str) -> Result<&'static str, Error> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        Ok(CONTENT_TYPE_ZIP)
    } else if lower.ends_with(".tar") {
        Ok(CONTENT_TYPE_TAR)
    } else {
        Err(Error::BadRequest(format!(
            "Unsupported bundle content type for {filename}: only .zip and .tar are accepted"
        )))
    }
}

pub struct ArtifactStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl ArtifactStore {
    pub fn new(settings: &ArtifactStoreSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(ArtifactStore {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            bucket: settings.bucket.clone(),
            token: settings.token.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Stream a local file into the store under `key`.
    pub async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), Error> {
        if content_type != CONTENT_TYPE_ZIP && content_type != CONTENT_TYPE_TAR {
            return Err(Error::BadRequest(format!(
                "Unsupported bundle content type: {content_type}"
            )));
        }
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let body = Body::wrap_stream(ReaderStream::new(file));

        debug!(key, length, "uploading blob");
        let response = self
            .authorize(self.client.put(self.object_url(key)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Artifact store rejected upload of {key}: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Open a streaming download of `key`.
    pub async fn get(&self, key: &str) -> Result<reqwest::Response, Error> {
        let response = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("blob {key}"))),
            status if status.is_success() => Ok(response),
            status => Err(Error::Internal(anyhow::anyhow!(
                "Artifact store returned {status} for {key}"
            ))),
        }
    }

    /// Download `key` to a local file, streaming chunk by chunk.
    pub async fn download_to(&self, key: &str, dest: &Path) -> Result<(), Error> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut response = self.get(key).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(())
    }

    /// Delete `key`; a missing blob is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        let response = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Internal(anyhow::anyhow!(
                "Artifact store returned {} deleting {key}",
                response.status()
            )))
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, Error> {
        let response = self
            .authorize(self.client.head(self.object_url(key)))
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_key_layout() {
        assert_eq!(
            bundle_key("p1", "bundle.zip"),
            "uploads/p1/zip/bundle.zip"
        );
    }

    #[test]
    fn test_content_type_restrictions() {
        assert_eq!(content_type_for("a.zip").unwrap(), CONTENT_TYPE_ZIP);
        assert_eq!(content_type_for("a.TAR").unwrap(), CONTENT_TYPE_TAR);
        assert!(matches!(
            content_type_for("a.tgz"),
            Err(Error::BadRequest(_))
        ));
    }
}
