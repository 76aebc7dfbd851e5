//! Detached signatures over image digests and artifact blobs.
//!
//! Wraps the cosign binary. When signing is globally disabled all operations
//! succeed without effect; a failed blob verification is always fatal to the
//! pipeline that requested it.

use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{RegistrySettings, SigningSettings};
use crate::error::Error;

pub struct Signer {
    settings: SigningSettings,
    registry: RegistrySettings,
    binary: String,
}

impl Signer {
    pub fn new(settings: SigningSettings, registry: RegistrySettings) -> Self {
        Signer {
            settings,
            registry,
            binary: std::env::var("COSIGN_BIN").unwrap_or_else(|_| "cosign".to_string()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(password) = &self.settings.password {
            cmd.env("COSIGN_PASSWORD", password);
        }
        cmd
    }

    /// Sign a registry-resolved digest reference with the configured key.
    pub async fn sign_image(&self, digest_ref: &str) -> Result<(), Error> {
        if !self.settings.enabled {
            debug!("signing disabled, skipping image signature");
            return Ok(());
        }
        info!(digest_ref, "signing image");
        let output = self
            .command()
            .args([
                "sign",
                &format!("--key={}", self.settings.key_path),
                &format!("--registry-username={}", self.registry.username),
                &format!("--registry-password={}", self.registry.password),
                &format!(
                    "--allow-insecure-registry={}",
                    self.settings.allow_insecure_registry
                ),
                &format!(
                    "--allow-http-registry={}",
                    self.settings.allow_http_registry
                ),
                "-y",
                digest_ref,
            ])
            .output()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to execute cosign: {e}")))?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Image signing failed for {digest_ref}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Produce a detached signature file over a local tarball.
    pub async fn sign_blob(&self, tar: &Path, signature: &Path) -> Result<(), Error> {
        if !self.settings.enabled {
            debug!("signing disabled, skipping blob signature");
            return Ok(());
        }
        let output = self
            .command()
            .args([
                "sign-blob",
                &format!("--key={}", self.settings.key_path),
                &format!("--output-signature={}", signature.display()),
                "-y",
                &tar.display().to_string(),
            ])
            .output()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to execute cosign: {e}")))?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Blob signing failed for {}: {}",
                tar.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Verify a detached signature against the trusted public key. Offline;
    /// no transparency-log lookup.
    pub async fn verify_blob(&self, tar: &Path, signature: &Path) -> Result<(), Error> {
        if !self.settings.enabled {
            debug!("signing disabled, skipping blob verification");
            return Ok(());
        }
        info!(tar = %tar.display(), "verifying blob signature");
        let output = self
            .command()
            .args([
                "verify-blob",
                &format!("--key={}", self.settings.public_key_path),
                "--offline=true",
                "--private-infrastructure=true",
                &format!("--signature={}", signature.display()),
                &tar.display().to_string(),
            ])
            .output()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to execute cosign: {e}")))?;
        if !output.status.success() {
            return Err(Error::SignatureInvalid(format!(
                "{}: {}",
                tar.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_signer() -> Signer {
        Signer::new(
            SigningSettings {
                enabled: false,
                key_path: "/nonexistent/cosign.key".into(),
                public_key_path: "/nonexistent/cosign.pub".into(),
                password: None,
                allow_insecure_registry: false,
                allow_http_registry: false,
            },
            RegistrySettings {
                url: "registry".into(),
                username: String::new(),
                password: String::new(),
                build_args: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_disabled_signer_is_a_no_op() {
        let signer = disabled_signer();
        signer.sign_image("registry/wx@sha256:abcd").await.unwrap();
        signer
            .sign_blob(Path::new("/missing.tar"), Path::new("/missing.sig"))
            .await
            .unwrap();
        signer
            .verify_blob(Path::new("/missing.tar"), Path::new("/missing.sig"))
            .await
            .unwrap();
    }
}
