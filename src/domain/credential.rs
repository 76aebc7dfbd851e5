//! Stored VCS credentials referenced by plugin versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plugin::SECRET_MASK;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: String,
    pub name: String,
    /// Base URL the plugin's repository path is appended to.
    pub base_url: String,
    pub username: String,
    pub access_token: String,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GitCredential {
    /// Read-path representation: the token is replaced by the mask.
    pub fn masked(&self) -> GitCredential {
        GitCredential {
            access_token: SECRET_MASK.to_string(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_token() {
        let cred = GitCredential {
            id: "c1".into(),
            name: "acme".into(),
            base_url: "https://github.com/acme/".into(),
            username: "bot".into(),
            access_token: "ghp_secret".into(),
            created_by: None,
            created_at: None,
            updated_at: None,
        };
        assert_eq!(cred.masked().access_token, SECRET_MASK);
        assert_eq!(cred.masked().username, "bot");
    }
}
