//! Working-tree acquisition: clone, download-and-extract, or unpack an image
//! bundle. Each pipeline owns its tree exclusively and the tree is removed on
//! every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use super::Deps;
use crate::domain::{slugify, PluginVersion, Source};
use crate::error::Error;
use crate::infrastructure::git;

/// A per-pipeline working directory. The cleanup root is deleted when the
/// guard drops, whatever path the pipeline exited through.
pub struct WorkTree {
    cleanup_root: PathBuf,
    tree: PathBuf,
}

impl WorkTree {
    pub fn tree(&self) -> &Path {
        &self.tree
    }
}

impl Drop for WorkTree {
    fn drop(&mut self) {
        if self.cleanup_root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.cleanup_root) {
                warn!(path = %self.cleanup_root.display(), error = %e, "working tree cleanup failed");
            }
        }
    }
}

fn pull_dir(work_root: &Path, record: &PluginVersion) -> PathBuf {
    work_root
        .join("pull")
        .join(record.slug())
        .join(slugify(&record.plugin_id))
}

/// Fetch the version's sources into a fresh working tree.
pub async fn acquire(deps: &Deps, record: &PluginVersion) -> Result<WorkTree, Error> {
    let dest = pull_dir(&deps.settings.service.work_root, record);
    match &record.source {
        Source::Git {
            target_ref,
            url,
            username,
            access_token,
            repository,
            branch,
        } => {
            let (clone_url, clone_user, clone_token) = match target_ref {
                Some(target_ref) => {
                    let credential = deps
                        .stores
                        .credentials
                        .fetch(target_ref)?
                        .ok_or_else(|| Error::NotFound(format!("git target {target_ref}")))?;
                    let repository = repository.clone().unwrap_or_default();
                    (
                        format!("{}{}", credential.base_url, repository),
                        credential.username,
                        credential.access_token,
                    )
                }
                None => (
                    url.clone().ok_or_else(|| {
                        Error::BadRequest(
                            "A git registration needs a git target or an inline URL".to_string(),
                        )
                    })?,
                    username.clone().unwrap_or_default(),
                    access_token.clone().unwrap_or_default(),
                ),
            };

            let fetch_timeout = Duration::from_secs(deps.settings.timeouts.fetch_secs);
            match tokio::time::timeout(
                fetch_timeout,
                git::clone_branch(&clone_url, branch, &clone_user, &clone_token, &dest),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::SourceUnavailable(format!(
                        "Clone timed out after {}s",
                        deps.settings.timeouts.fetch_secs
                    )))
                }
            }
            Ok(WorkTree {
                cleanup_root: dest.clone(),
                tree: dest,
            })
        }
        Source::ArchiveUpload { blob_key } | Source::ImageUpload { blob_key } => {
            let key = blob_key.as_deref().ok_or_else(|| {
                Error::BadRequest("No bundle has been uploaded for this version".to_string())
            })?;
            if dest.exists() {
                tokio::fs::remove_dir_all(&dest).await?;
            }
            tokio::fs::create_dir_all(&dest).await?;

            let filename = key.rsplit('/').next().unwrap_or("bundle.zip").to_string();
            let archive = dest.join(&filename);
            deps.artifacts.download_to(key, &archive).await?;
            extract_archive(&archive, &dest).await?;
            tokio::fs::remove_file(&archive).await.ok();

            Ok(WorkTree {
                cleanup_root: dest.clone(),
                tree: extracted_root(&dest, &filename),
            })
        }
    }
}

/// Expand an archive into `dest` using the platform extraction tools.
async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), Error> {
    let lower = archive.display().to_string().to_ascii_lowercase();
    let output = if lower.ends_with(".zip") {
        Command::new("unzip")
            .args(["-o", "-q"])
            .arg(archive)
            .arg("-d")
            .arg(dest)
            .output()
            .await?
    } else {
        Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .output()
            .await?
    };
    if !output.status.success() {
        return Err(Error::BadRequest(format!(
            "Failed to extract bundle {}: {}",
            archive.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// The working tree root after extraction: the archive's stem directory when
/// it produced one, the extraction directory otherwise.
fn extracted_root(dest: &Path, filename: &str) -> PathBuf {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    let candidate = dest.join(stem);
    if candidate.is_dir() {
        candidate
    } else {
        dest.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracted_root_prefers_stem_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("bundle")).unwrap();
        assert_eq!(
            extracted_root(tmp.path(), "bundle.zip"),
            tmp.path().join("bundle")
        );
        assert_eq!(extracted_root(tmp.path(), "other.zip"), tmp.path());
    }

    #[test]
    fn test_worktree_cleanup_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pull").join("wx").join("p1");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("main.py"), "print()").unwrap();
        {
            let _tree = WorkTree {
                cleanup_root: root.clone(),
                tree: root.clone(),
            };
        }
        assert!(!root.exists());
    }
}
