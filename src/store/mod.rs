//! Durable keyed metadata store.
//!
//! One sled tree per entity, JSON documents, document-level create-or-update.
//! Invariants that span documents are maintained by keying and by the
//! per-(plugin, version) serialization in the pipeline controller, not by
//! cross-document transactions.

mod credentials;
mod plugins;
mod reports;
mod widgets;

pub use credentials::CredentialStore;
pub use plugins::{disabled_actions, unmask_env, ListFilter, ListRequest, PluginStore};
pub use reports::ReportStore;
pub use widgets::{WidgetRecord, WidgetStore};

use anyhow::{Context, Result};
use std::path::Path;

pub struct Stores {
    pub plugins: PluginStore,
    pub credentials: CredentialStore,
    pub reports: ReportStore,
    pub widgets: WidgetStore,
}

impl Stores {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("Failed to open metadata store at {}", path.display()))?;
        Ok(Stores {
            plugins: PluginStore::new(db.open_tree("plugins")?),
            credentials: CredentialStore::new(db.open_tree("git_credentials")?),
            reports: ReportStore::new(db.open_tree("scan_reports")?),
            widgets: WidgetStore::new(db.open_tree("widget_plugins")?),
        })
    }
}
