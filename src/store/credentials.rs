//! Stored git credentials, keyed by id.

use anyhow::{Context, Result};

use crate::domain::{GitCredential, SECRET_MASK};

pub struct CredentialStore {
    tree: sled::Tree,
}

impl CredentialStore {
    pub fn new(tree: sled::Tree) -> Self {
        CredentialStore { tree }
    }

    /// Create-or-update. A token equal to the mask keeps the stored token.
    pub fn upsert(&self, credential: &GitCredential) -> Result<GitCredential> {
        let mut doc = credential.clone();
        if doc.access_token == SECRET_MASK {
            if let Some(existing) = self.fetch(&doc.id)? {
                doc.access_token = existing.access_token;
            }
        }
        self.tree
            .insert(doc.id.as_bytes(), serde_json::to_vec(&doc)?)
            .context("Failed to write git credential")?;
        Ok(doc)
    }

    pub fn fetch(&self, id: &str) -> Result<Option<GitCredential>> {
        let Some(raw) = self
            .tree
            .get(id.as_bytes())
            .context("Failed to read git credential")?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        Ok(self
            .tree
            .remove(id.as_bytes())
            .context("Failed to delete git credential")?
            .is_some())
    }

    pub fn name_in_use(&self, name: &str, exclude_id: &str) -> Result<bool> {
        for item in self.tree.iter() {
            let (_, raw) = item.context("Failed to scan git credentials")?;
            let cred: GitCredential = serde_json::from_slice(&raw)?;
            if cred.name == name && cred.id != exclude_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn list(&self) -> Result<Vec<GitCredential>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, raw) = item.context("Failed to scan git credentials")?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        CredentialStore::new(db.open_tree("git_credentials").unwrap())
    }

    fn cred(id: &str, token: &str) -> GitCredential {
        GitCredential {
            id: id.into(),
            name: format!("target-{id}"),
            base_url: "https://github.com/acme/".into(),
            username: "bot".into(),
            access_token: token.into(),
            created_by: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_masked_token_keeps_existing() {
        let store = store();
        store.upsert(&cred("c1", "ghp_original")).unwrap();
        let saved = store.upsert(&cred("c1", SECRET_MASK)).unwrap();
        assert_eq!(saved.access_token, "ghp_original");
        assert_eq!(
            store.fetch("c1").unwrap().unwrap().access_token,
            "ghp_original"
        );
    }

    #[test]
    fn test_name_duplicate_detection() {
        let store = store();
        store.upsert(&cred("c1", "t")).unwrap();
        let mut other = cred("c2", "t");
        other.name = "target-c1".into();
        assert!(store.name_in_use(&other.name, &other.id).unwrap());
        assert!(!store.name_in_use("target-c1", "c1").unwrap());
    }
}
