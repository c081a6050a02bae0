use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value as JsonValue;

/// Read client for the miner's status endpoint.
#[derive(Clone)]
pub struct DeviceClient {
    http: Client,
    base_url: String,
}

impl DeviceClient {
    pub fn new(http: Client, host: &str) -> Self {
        let trimmed = host.trim().trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        Self { http, base_url }
    }

    pub fn status_url(&self) -> String {
        format!("{}/api/system/info", self.base_url)
    }

    /// Fetches the current status snapshot. `since_ms` is the timestamp of the
    /// newest retained sample (0 when history is empty); the device may use it
    /// to omit information older than last-seen.
    pub async fn fetch_status(&self, since_ms: i64) -> Result<DeviceStatus> {
        let raw: JsonValue = self
            .http
            .get(self.status_url())
            .query(&[("since", since_ms)])
            .send()
            .await
            .context("miner status request failed")?
            .error_for_status()
            .context("miner returned an error status")?
            .json()
            .await
            .context("miner status response was not valid JSON")?;
        Ok(DeviceStatus { raw })
    }
}

/// One status snapshot from the miner. The record is opaque: only the
/// telemetry values are read structurally, everything else passes through to
/// consumers untouched.
#[derive(Clone, Debug)]
pub struct DeviceStatus {
    raw: JsonValue,
}

impl DeviceStatus {
    pub fn from_raw(raw: JsonValue) -> Self {
        Self { raw }
    }

    pub fn into_raw(self) -> JsonValue {
        self.raw
    }

    fn metric(&self, key: &str) -> Option<f64> {
        self.raw
            .get(key)
            .and_then(JsonValue::as_f64)
            .filter(|value| value.is_finite())
    }

    pub fn hashrate(&self) -> Option<f64> {
        self.metric("hashRate")
    }

    /// Device-reported averages. Absent horizons are derived locally, never
    /// fabricated here.
    pub fn hashrate_1m(&self) -> Option<f64> {
        self.metric("hashRate_1m")
    }

    pub fn hashrate_10m(&self) -> Option<f64> {
        self.metric("hashRate_10m")
    }

    pub fn hashrate_1h(&self) -> Option<f64> {
        self.metric("hashRate_1h")
    }

    pub fn hashrate_1d(&self) -> Option<f64> {
        self.metric("hashRate_1d")
    }

    pub fn asic_temp(&self) -> Option<f64> {
        self.metric("temp")
    }

    pub fn vr_temp(&self) -> Option<f64> {
        self.metric("vrTemp")
    }

    pub fn power(&self) -> Option<f64> {
        self.metric("power")
    }

    pub fn fan_percent(&self) -> Option<f64> {
        self.metric("fanspeed")
    }

    pub fn current(&self) -> Option<f64> {
        self.metric("current")
    }

    pub fn core_voltage(&self) -> Option<f64> {
        self.metric("coreVoltageActual")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_known_telemetry_fields() {
        let status = DeviceStatus::from_raw(json!({
            "hashRate": 512.3,
            "hashRate_10m": 498.0,
            "temp": 61.5,
            "vrTemp": 48.0,
            "power": 14.9,
            "fanspeed": 72,
            "current": 6.1,
            "coreVoltageActual": 1.18,
            "bestDiff": "4.29M",
            "ssid": "shed"
        }));

        assert_eq!(status.hashrate(), Some(512.3));
        assert_eq!(status.hashrate_10m(), Some(498.0));
        assert_eq!(status.hashrate_1m(), None);
        assert_eq!(status.asic_temp(), Some(61.5));
        assert_eq!(status.fan_percent(), Some(72.0));
        assert_eq!(status.core_voltage(), Some(1.18));
    }

    #[test]
    fn non_numeric_and_non_finite_fields_read_as_absent() {
        let status = DeviceStatus::from_raw(json!({
            "hashRate": "fast",
            "temp": null
        }));
        assert_eq!(status.hashrate(), None);
        assert_eq!(status.asic_temp(), None);
    }

    #[test]
    fn unknown_fields_pass_through_in_the_raw_record() {
        let status = DeviceStatus::from_raw(json!({"hashRate": 1.0, "ssid": "shed"}));
        let raw = status.into_raw();
        assert_eq!(raw.get("ssid").and_then(JsonValue::as_str), Some("shed"));
    }

    #[test]
    fn bare_hosts_get_an_http_scheme() {
        let client = DeviceClient::new(Client::new(), "10.0.0.5");
        assert_eq!(client.status_url(), "http://10.0.0.5/api/system/info");
        let client = DeviceClient::new(Client::new(), "http://10.0.0.5:8080/");
        assert_eq!(
            client.status_url(),
            "http://10.0.0.5:8080/api/system/info"
        );
    }
}
