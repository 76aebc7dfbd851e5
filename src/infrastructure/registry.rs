//! Registry-side image inspection.
//!
//! The engine pushes tags; this client resolves what the registry actually
//! stored, using `skopeo inspect`. Signing binds to the registry-resolved
//! digest, never to a local tag.

use tokio::process::Command;

use crate::config::RegistrySettings;
use crate::error::Error;

pub struct RegistryClient {
    username: String,
    password: String,
    binary: String,
}

impl RegistryClient {
    pub fn new(settings: &RegistrySettings) -> Self {
        RegistryClient {
            username: settings.username.clone(),
            password: settings.password.clone(),
            binary: std::env::var("SKOPEO_BIN").unwrap_or_else(|_| "skopeo".to_string()),
        }
    }

    /// Resolve the manifest digest of a pushed tag. Returns the full digest
    /// reference (`repo@sha256:...`) suitable for signing.
    pub async fn resolve_digest(&self, image: &str) -> Result<String, Error> {
        let output = Command::new(&self.binary)
            .args([
                "inspect",
                &format!("--creds={}:{}", self.username, self.password),
                "--format",
                "{{.Digest}}",
                &format!("docker://{image}"),
            ])
            .output()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to execute skopeo: {e}")))?;

        if !output.status.success() {
            return Err(Error::NotFound(format!("registry image {image}")));
        }
        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if digest.is_empty() {
            return Err(Error::NotFound(format!("registry digest for {image}")));
        }
        Ok(digest_reference(image, &digest))
    }
}

/// `repo:tag` + `sha256:...` -> `repo@sha256:...`
pub fn digest_reference(image: &str, digest: &str) -> String {
    let repo = image.rsplit_once(':').map(|(repo, _)| repo).unwrap_or(image);
    format!("{repo}@{digest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_reference() {
        assert_eq!(
            digest_reference("registry/wx-widget:1.0", "sha256:abcd"),
            "registry/wx-widget@sha256:abcd"
        );
        assert_eq!(
            digest_reference("registry/wx-widget", "sha256:abcd"),
            "registry/wx-widget@sha256:abcd"
        );
    }
}
