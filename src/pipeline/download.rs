//! Artifact download preparation: pull the published image, export it, sign
//! the blob and zip the pair for the download endpoint to serve.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

use super::Deps;
use crate::domain::Version;
use crate::error::Error;
use crate::infrastructure::notifier::Notification;

/// Where the prepared bundle for a plugin name lives.
pub fn bundle_zip_path(bundle_dir: &Path, slug: &str) -> PathBuf {
    bundle_dir.join(format!("{slug}.zip"))
}

pub(super) async fn prepare_download(
    deps: &Deps,
    plugin_id: &str,
    version: Option<Version>,
    user_id: &str,
) -> Result<(), Error> {
    if !deps.settings.features.download_enabled {
        return Err(Error::BadRequest(
            "Artifact download is disabled".to_string(),
        ));
    }
    let record = match version {
        Some(version) => deps.stores.plugins.fetch(plugin_id, version)?,
        None => deps.stores.plugins.fetch_current(plugin_id)?,
    }
    .ok_or_else(|| Error::NotFound(format!("plugin {plugin_id}")))?;

    let image = record
        .image()
        .ok_or_else(|| {
            Error::BadRequest(format!(
                "Plugin {} has no published image to download",
                record.name
            ))
        })?
        .to_string();

    let slug = record.slug();
    let bundle_dir = &deps.settings.service.bundle_dir;
    let staging = bundle_dir.join(&slug);
    let zip_path = bundle_zip_path(bundle_dir, &slug);
    if staging.exists() {
        tokio::fs::remove_dir_all(&staging).await?;
    }
    if zip_path.exists() {
        tokio::fs::remove_file(&zip_path).await?;
    }
    tokio::fs::create_dir_all(&staging).await?;

    info!(plugin_id, image, "preparing artifact download");
    deps.engine.pull(&image).await?;
    let tar = staging.join("plugin.tar");
    deps.engine.save(&image, &tar).await?;
    deps.signer.sign_blob(&tar, &staging.join("signature")).await?;

    let output = Command::new("zip")
        .args(["-r", "-q"])
        .arg(&zip_path)
        .arg(&slug)
        .current_dir(bundle_dir)
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::Internal(anyhow::anyhow!(
            "Bundle zip failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    tokio::fs::remove_dir_all(&staging).await?;

    let download_url = format!(
        "/api/v1/plugins/download-docker-file?plugin_id={}&version={}",
        record.plugin_id, record.version
    );
    deps.notifier
        .publish(
            user_id,
            &record.project_id,
            &Notification::download_ready(&record.name, record.plugin_type, &download_url),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_zip_path() {
        assert_eq!(
            bundle_zip_path(Path::new("/data/bundles"), "wx"),
            PathBuf::from("/data/bundles/wx.zip")
        );
    }
}
