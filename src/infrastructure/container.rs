//! Local container engine operations.
//!
//! All builds, loads, tags and pushes go through the engine CLI; the engine
//! serializes pulls by tag on its own, so concurrent pipelines need no extra
//! locking here.

use anyhow::Context;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::tool_log;
use crate::config::RegistrySettings;
use crate::error::Error;

/// Default build recipe rendered from a root `manifest.json` when the
/// working tree carries no recipe of its own.
const DEFAULT_RECIPE_TEMPLATE: &str = r#"FROM {frontend_base_image} AS frontend
WORKDIR /build
COPY frontend/ .
RUN npm install && npm run build

FROM {backend_base_image}
WORKDIR /code
COPY . .
COPY --from=frontend /build/dist ./static
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
CMD ["sh", "-c", "./start.sh"]
"#;

pub struct ContainerEngine {
    registry: RegistrySettings,
    binary: String,
}

impl ContainerEngine {
    pub fn new(registry: RegistrySettings) -> Self {
        ContainerEngine {
            registry,
            binary: std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
        }
    }

    pub fn registry_url(&self) -> &str {
        &self.registry.url
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        debug!(?args, "engine invocation");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))
    }

    /// Whether the working tree carries its own build recipe.
    pub fn has_recipe(workdir: &Path) -> bool {
        workdir.join("Dockerfile").exists()
    }

    /// Render the default recipe from `manifest.json` at the tree root.
    /// Absent manifest means there is nothing to build from.
    pub async fn render_default_recipe(workdir: &Path) -> Result<(), Error> {
        let manifest_path = workdir.join("manifest.json");
        if !manifest_path.exists() {
            return Err(Error::BuildRecipeMissing);
        }
        let manifest: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&manifest_path).await?)?;
        let backend = manifest
            .get("backend_base_image")
            .and_then(|v| v.as_str())
            .unwrap_or("python:3.10-slim");
        let frontend = manifest
            .get("frontend_base_image")
            .and_then(|v| v.as_str())
            .unwrap_or("node:14.16.1");
        let recipe = DEFAULT_RECIPE_TEMPLATE
            .replace("{backend_base_image}", backend)
            .replace("{frontend_base_image}", frontend);
        tokio::fs::write(workdir.join("Dockerfile"), recipe).await?;
        Ok(())
    }

    /// Build the working tree into `image`. On failure the accumulated engine
    /// log is returned so it can be stored on the version record.
    pub async fn build(&self, workdir: &Path, image: &str) -> Result<(), Error> {
        let mut args: Vec<String> = vec![
            "build".into(),
            "--network".into(),
            "host".into(),
            "-t".into(),
            image.into(),
        ];
        for (key, value) in &self.registry.build_args {
            args.push("--build-arg".into());
            args.push(format!("{key}={value}"));
        }
        args.push(workdir.display().to_string());

        info!(image, workdir = %workdir.display(), "building image");
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        if !output.status.success() {
            return Err(Error::BuildFailed {
                log: tool_log(&output),
            });
        }
        Ok(())
    }

    /// Authenticate against the configured registry, feeding the password on
    /// stdin so it never shows up in the process table.
    async fn login(&self) -> Result<(), Error> {
        if self.registry.username.is_empty() {
            return Ok(());
        }
        let mut child = Command::new(&self.binary)
            .args([
                "login",
                &self.registry.url,
                "--username",
                &self.registry.username,
                "--password-stdin",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to execute engine login")?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(self.registry.password.as_bytes())
                .await
                .context("Failed to stream registry password")?;
        }
        let output = child
            .wait_with_output()
            .await
            .context("Failed waiting for engine login")?;
        if !output.status.success() {
            return Err(Error::AuthFailed(format!(
                "Registry login failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Push `image` to the registry with registered credentials.
    pub async fn push(&self, image: &str) -> Result<(), Error> {
        self.login().await?;
        info!(image, "pushing image");
        let output = self.run(&["push", image]).await?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Image push failed for {image}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Load an image tarball into the engine, returning the loaded reference.
    pub async fn load(&self, tar: &Path) -> Result<String, Error> {
        let output = self
            .run(&["load", "-i", &tar.display().to_string()])
            .await?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Image load failed for {}: {}",
                tar.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_loaded_image(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!(
                "Engine did not report a loaded image for {}",
                tar.display()
            ))
        })
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<(), Error> {
        let output = self.run(&["tag", source, target]).await?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Image tag {source} -> {target} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    pub async fn pull(&self, image: &str) -> Result<(), Error> {
        self.login().await?;
        info!(image, "pulling image");
        let output = self.run(&["pull", image]).await?;
        if !output.status.success() {
            return Err(Error::NotFound(format!("image {image}")));
        }
        Ok(())
    }

    /// Export `image` to a tarball on disk.
    pub async fn save(&self, image: &str, dest: &Path) -> Result<(), Error> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = self
            .run(&["save", "-o", &dest.display().to_string(), image])
            .await?;
        if !output.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "Image export failed for {image}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Registry digest reference of a local image, if the engine knows one.
    pub async fn repo_digest(&self, image: &str) -> Result<Option<String>, Error> {
        let output = self
            .run(&[
                "image",
                "inspect",
                "--format",
                "{{if .RepoDigests}}{{index .RepoDigests 0}}{{end}}",
                image,
            ])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if digest.is_empty() { None } else { Some(digest) })
    }
}

/// Parse the image reference out of engine `load` output
/// (`Loaded image: repo/name:tag` or `Loaded image ID: sha256:...`).
fn parse_loaded_image(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        line.trim()
            .strip_prefix("Loaded image: ")
            .or_else(|| line.trim().strip_prefix("Loaded image ID: "))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loaded_image() {
        assert_eq!(
            parse_loaded_image("Loaded image: acme/wx:1.0\n"),
            Some("acme/wx:1.0".to_string())
        );
        assert_eq!(
            parse_loaded_image("Loaded image ID: sha256:abcd\n"),
            Some("sha256:abcd".to_string())
        );
        assert_eq!(parse_loaded_image("nothing here"), None);
    }

    #[tokio::test]
    async fn test_render_default_recipe_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = ContainerEngine::render_default_recipe(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildRecipeMissing));

        tokio::fs::write(
            dir.path().join("manifest.json"),
            r#"{"backend_base_image": "python:3.11-slim"}"#,
        )
        .await
        .unwrap();
        ContainerEngine::render_default_recipe(dir.path())
            .await
            .unwrap();
        let recipe = tokio::fs::read_to_string(dir.path().join("Dockerfile"))
            .await
            .unwrap();
        assert!(recipe.contains("FROM python:3.11-slim"));
        assert!(recipe.contains("node:14.16.1"));
    }
}
