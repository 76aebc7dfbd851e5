//! User-addressed event publication on key lifecycle transitions.
//!
//! Delivery is fire-and-forget: a failed POST is logged and dropped, never
//! retried, and never fails the transition that produced it.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::NotifierSettings;
use crate::domain::PluginType;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub status: String,
    pub plugin_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl Notification {
    fn message_event(message: String, status: &str, plugin_type: PluginType) -> Self {
        Notification {
            kind: "message".to_string(),
            message,
            status: status.to_string(),
            plugin_type: plugin_type.as_str().to_string(),
            plugin_id: None,
            download_url: None,
        }
    }

    pub fn deployed(name: &str, plugin_type: PluginType, plugin_id: &str) -> Self {
        let mut n = Self::message_event(
            format!("Plugin: {name} has been deployed successfully"),
            "success",
            plugin_type,
        );
        n.plugin_id = Some(plugin_id.to_string());
        n
    }

    pub fn scan_succeeded(name: &str, plugin_type: PluginType, plugin_id: &str) -> Self {
        let mut n = Self::message_event(
            format!("Plugin: {name} has been scanned successfully"),
            "success",
            plugin_type,
        );
        n.plugin_id = Some(plugin_id.to_string());
        n
    }

    pub fn failed(name: &str, plugin_type: PluginType) -> Self {
        Self::message_event(
            format!(
                "Error occurred while registering plugin: {name}. Check details in the plugins page."
            ),
            "error",
            plugin_type,
        )
    }

    pub fn uploaded(name: &str, plugin_type: PluginType) -> Self {
        Self::message_event(format!("{name} uploaded successfully"), "success", plugin_type)
    }

    pub fn download_ready(name: &str, plugin_type: PluginType, download_url: &str) -> Self {
        let mut n = Self::message_event(
            format!("{name} is ready to download from the notification pane"),
            "success",
            plugin_type,
        );
        n.kind = "plugin".to_string();
        n.download_url = Some(download_url.to_string());
        n
    }
}

pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl Notifier {
    pub fn new(settings: &NotifierSettings, client: reqwest::Client) -> Self {
        Notifier {
            client,
            endpoint: settings.endpoint.clone(),
        }
    }

    pub async fn publish(&self, user_id: &str, project_id: &str, notification: &Notification) {
        let Some(endpoint) = &self.endpoint else {
            debug!(user_id, "notification endpoint not configured, dropping event");
            return;
        };
        let payload = json!({
            "users": [user_id],
            "project_id": project_id,
            "type": notification.kind,
            "status": notification.status,
            "main_msg": notification.message,
            "properties": {
                "plugin_type": notification.plugin_type,
                "plugin_id": notification.plugin_id,
                "download_url": notification.download_url,
            },
        });
        match self.client.post(endpoint).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(user_id, "notification published");
            }
            Ok(response) => {
                warn!(user_id, status = %response.status(), "notification rejected");
            }
            Err(e) => {
                warn!(user_id, error = %e, "notification delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shapes() {
        let n = Notification::deployed("wx", PluginType::Widget, "p1");
        assert_eq!(n.status, "success");
        assert_eq!(n.plugin_id.as_deref(), Some("p1"));
        assert!(n.message.contains("deployed successfully"));

        let n = Notification::failed("wx", PluginType::Widget);
        assert_eq!(n.status, "error");
        assert!(n.download_url.is_none());

        let n = Notification::download_ready("wx", PluginType::Widget, "/api/v1/plugins/download");
        assert_eq!(n.kind, "plugin");
        assert!(n.download_url.is_some());
    }
}
