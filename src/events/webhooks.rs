//! HTTP webhook sink. POSTs the envelope JSON to each configured URL with
//! a hard timeout. Failures are logged and dropped — the core never queues
//! webhook retries; operators layer their own retry proxy if they need one.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::Envelope;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WebhookSink {
    client: Option<reqwest::Client>,
    urls: Arc<RwLock<Vec<String>>>,
}

impl WebhookSink {
    pub fn new(urls: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .ok();
        Self {
            client,
            urls: Arc::new(RwLock::new(urls)),
        }
    }

    /// A sink that never sends. Used in tests.
    pub fn disabled() -> Self {
        Self {
            client: None,
            urls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the URL list — called when the `event_webhooks` setting
    /// changes.
    pub fn set_urls(&self, urls: Vec<String>) {
        if let Ok(mut guard) = self.urls.write() {
            *guard = urls;
        }
    }

    /// Fire-and-forget POST to every configured URL.
    pub fn fire(&self, env: &Envelope) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let urls = match self.urls.read() {
            Ok(guard) if !guard.is_empty() => guard.clone(),
            _ => return,
        };
        let env = env.clone();
        tokio::spawn(async move {
            for url in urls {
                let result = client.post(&url).json(&env).send().await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(%url, event = %env.event_type, "webhook delivered");
                    }
                    Ok(resp) => {
                        warn!(%url, status = %resp.status(), event = %env.event_type,
                              "webhook rejected — dropped");
                    }
                    Err(e) => {
                        warn!(%url, err = %e, event = %env.event_type,
                              "webhook failed — dropped");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use serde_json::json;

    #[tokio::test]
    async fn disabled_sink_is_inert() {
        let sink = WebhookSink::disabled();
        let env = Envelope::new(events::TASK_QUEUED, Some(1), "q", json!({}));
        sink.fire(&env);
    }

    #[tokio::test]
    async fn unreachable_url_never_blocks_the_caller() {
        // Port 9 (discard) refuses connections; the POST fails on a
        // detached task while fire() returns immediately.
        let sink = WebhookSink::new(vec!["http://127.0.0.1:9/hook".to_string()]);
        let env = Envelope::new(events::TASK_QUEUED, Some(1), "q", json!({}));
        let start = std::time::Instant::now();
        for _ in 0..20 {
            sink.fire(&env);
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn urls_can_be_swapped_at_runtime() {
        let sink = WebhookSink::new(vec![]);
        sink.set_urls(vec!["http://127.0.0.1:9/a".into()]);
        assert_eq!(sink.urls.read().unwrap().len(), 1);
    }
}
