//! Webhook alert dispatch with repeat suppression.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Minimum spacing between identical alert titles.
const REPEAT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AlertDispatcher {
    client: Client,
    webhook: Option<String>,
    recent: Arc<Mutex<HashMap<String, Instant>>>,
}

impl AlertDispatcher {
    pub fn new(webhook: Option<String>) -> Self {
        Self {
            client: Client::builder().build().expect("reqwest client"),
            webhook,
            recent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn notify(&self, title: &str, message: &str) {
        warn!(%title, %message, "alert raised");
        {
            let mut recent = self.recent.lock().await;
            let now = Instant::now();
            if let Some(last) = recent.get(title) {
                if now.duration_since(*last) < REPEAT_WINDOW {
                    return;
                }
            }
            recent.insert(title.to_string(), now);
        }
        let Some(url) = self.webhook.as_ref() else {
            return;
        };
        let payload = json!({ "title": title, "message": message });
        if let Err(err) = self.client.post(url).json(&payload).send().await {
            error!(error = %err, "failed to send alert webhook");
        }
    }
}

#[async_trait]
impl gantry_supervisor::Alerter for AlertDispatcher {
    async fn notify(&self, title: &str, message: &str) {
        AlertDispatcher::notify(self, title, message).await;
    }
}
