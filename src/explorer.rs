use reqwest::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Network context from the public block explorer. All fields are best-effort;
/// a partial fetch keeps whatever succeeded.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NetworkStatus {
    pub fetched_at: i64,
    pub block_height: Option<u64>,
    pub difficulty_change_percent: Option<f64>,
    pub price_usd: Option<f64>,
}

/// Periodic poller for the block-explorer API. Same error posture as the
/// device poll loop: failures are transient, logged, and never fatal; the
/// last good snapshot is retained.
#[derive(Clone)]
pub struct ExplorerService {
    http: Client,
    base_url: String,
    interval: Duration,
    latest: Arc<Mutex<Option<NetworkStatus>>>,
}

impl ExplorerService {
    pub fn new(http: Client, base_url: String, interval: Duration) -> Self {
        Self {
            http,
            base_url,
            interval,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn latest(&self) -> Option<NetworkStatus> {
        self.latest.lock().unwrap().clone()
    }

    pub fn start(&self, cancel: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = service.poll_once().await {
                            tracing::warn!(error = %err, "block explorer poll failed");
                        }
                    }
                }
            }
        });
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let mut status = NetworkStatus {
            fetched_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        };
        let mut any = false;

        match self.fetch_text("/blocks/tip/height").await {
            Ok(body) => {
                status.block_height = body.trim().parse::<u64>().ok();
                any = status.block_height.is_some();
            }
            Err(err) => tracing::debug!(error = %err, "tip height fetch failed"),
        }

        match self.fetch_json("/v1/difficulty-adjustment").await {
            Ok(value) => {
                status.difficulty_change_percent = extract_f64(&value, "difficultyChange");
                any |= status.difficulty_change_percent.is_some();
            }
            Err(err) => tracing::debug!(error = %err, "difficulty fetch failed"),
        }

        match self.fetch_json("/v1/prices").await {
            Ok(value) => {
                status.price_usd = extract_f64(&value, "USD");
                any |= status.price_usd.is_some();
            }
            Err(err) => tracing::debug!(error = %err, "price fetch failed"),
        }

        if !any {
            anyhow::bail!("no explorer endpoint answered");
        }
        *self.latest.lock().unwrap() = Some(status);
        Ok(())
    }

    async fn fetch_text(&self, path: &str) -> anyhow::Result<String> {
        let body = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    async fn fetch_json(&self, path: &str) -> anyhow::Result<JsonValue> {
        let value = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

fn extract_f64(value: &JsonValue, key: &str) -> Option<f64> {
    value
        .get(key)
        .and_then(JsonValue::as_f64)
        .filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_numeric_fields_only() {
        let value = json!({"USD": 64_230.5, "EUR": "n/a"});
        assert_eq!(extract_f64(&value, "USD"), Some(64_230.5));
        assert_eq!(extract_f64(&value, "EUR"), None);
        assert_eq!(extract_f64(&value, "GBP"), None);
    }

    #[test]
    fn latest_starts_empty() {
        let service = ExplorerService::new(
            Client::new(),
            "https://mempool.space/api".to_string(),
            Duration::from_secs(60),
        );
        assert!(service.latest().is_none());
    }
}
