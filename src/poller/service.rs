use crate::device::DeviceStatus;
use crate::history::{HistoryStore, Series};
use crate::rolling::{rolling_average, window_points};
use crate::samples::{Average, HashrateSample, PowerSample, TemperatureSample};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const HASHRATE_KEY: &str = "hashrate";
const TEMPERATURE_KEY: &str = "temperature";
const POWER_KEY: &str = "power";

const ONE_MINUTE_MS: u64 = 60 * 1000;
const TEN_MINUTES_MS: u64 = 10 * 60 * 1000;
const ONE_HOUR_MS: u64 = 60 * 60 * 1000;

/// Point counts for the locally derived rolling horizons at a given poll
/// cadence. The one-day figure is device-reported only.
#[derive(Clone, Copy, Debug)]
pub struct Windows {
    pub one_minute: usize,
    pub ten_minutes: usize,
    pub one_hour: usize,
}

impl Windows {
    pub fn for_interval(poll_interval: Duration) -> Self {
        let interval_ms = poll_interval.as_millis().max(1) as u64;
        Self {
            one_minute: window_points(ONE_MINUTE_MS, interval_ms),
            ten_minutes: window_points(TEN_MINUTES_MS, interval_ms),
            one_hour: window_points(ONE_HOUR_MS, interval_ms),
        }
    }
}

/// Read surface exposed to consumers: the latest raw snapshot, the latest
/// error if any, and the three bounded series.
#[derive(Clone, Debug, Serialize)]
pub struct TelemetryOverview {
    pub latest: Option<JsonValue>,
    pub error: Option<String>,
    pub hashrate: Vec<HashrateSample>,
    pub temperature: Vec<TemperatureSample>,
    pub power: Vec<PowerSample>,
}

struct ServiceState {
    hashrate: Mutex<Series<HashrateSample>>,
    temperature: Mutex<Series<TemperatureSample>>,
    power: Mutex<Series<PowerSample>>,
    latest: Mutex<Option<JsonValue>>,
    last_error: Mutex<Option<String>>,
    repoll: Notify,
}

/// Owns the three telemetry series for one miner. The poll loop is the only
/// writer; consumers read snapshots. Each series sits behind its own mutex.
#[derive(Clone)]
pub struct TelemetryService {
    state: Arc<ServiceState>,
}

impl TelemetryService {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(ServiceState {
                hashrate: Mutex::new(Series::new(max_history)),
                temperature: Mutex::new(Series::new(max_history)),
                power: Mutex::new(Series::new(max_history)),
                latest: Mutex::new(None),
                last_error: Mutex::new(None),
                repoll: Notify::new(),
            }),
        }
    }

    /// Seeds the series from durable storage. Corrupt blobs load as empty.
    pub fn from_store(store: &HistoryStore, max_history: usize) -> Self {
        let service = Self::new(max_history);
        {
            let mut series = service.state.hashrate.lock().unwrap();
            *series = Series::from_samples(store.load(HASHRATE_KEY), max_history);
        }
        {
            let mut series = service.state.temperature.lock().unwrap();
            *series = Series::from_samples(store.load(TEMPERATURE_KEY), max_history);
        }
        {
            let mut series = service.state.power.lock().unwrap();
            *series = Series::from_samples(store.load(POWER_KEY), max_history);
        }
        service
    }

    /// Timestamp of the newest retained sample, or 0 when history is empty.
    /// Passed upstream as the incremental-fetch hint.
    pub fn last_sample_time(&self) -> i64 {
        self.state
            .hashrate
            .lock()
            .unwrap()
            .last()
            .map(|sample| sample.time)
            .unwrap_or(0)
    }

    /// Appends one status snapshot to every series and clears the error state.
    pub fn apply_status(&self, status: DeviceStatus, windows: &Windows) {
        let now = Utc::now().timestamp_millis();
        let instant = status.hashrate();

        {
            let mut series = self.state.hashrate.lock().unwrap();
            let retained: Vec<Option<f64>> = series.iter().map(|s| s.hashrate).collect();
            let avg_1m = Average::merge(
                status.hashrate_1m(),
                rolling_average(&retained, windows.one_minute, instant),
            );
            let avg_10m = Average::merge(
                status.hashrate_10m(),
                rolling_average(&retained, windows.ten_minutes, instant),
            );
            let avg_1h = Average::merge(
                status.hashrate_1h(),
                rolling_average(&retained, windows.one_hour, instant),
            );
            let avg_1d = Average::merge(status.hashrate_1d(), None);
            series.append(HashrateSample {
                time: now,
                hashrate: instant,
                avg_1m: avg_1m.value(),
                avg_10m: avg_10m.value(),
                avg_1h: avg_1h.value(),
                avg_1d: avg_1d.value(),
            });
        }

        self.state
            .temperature
            .lock()
            .unwrap()
            .append(TemperatureSample {
                time: now,
                asic_temp: status.asic_temp(),
                vr_temp: status.vr_temp(),
            });

        self.state.power.lock().unwrap().append(PowerSample {
            time: now,
            power: status.power(),
            fan_percent: status.fan_percent(),
            current: status.current(),
            core_voltage: status.core_voltage(),
        });

        *self.state.latest.lock().unwrap() = Some(status.into_raw());
        *self.state.last_error.lock().unwrap() = None;
    }

    /// Surfaces a failed poll. History and the last good snapshot stay put.
    pub fn record_error(&self, message: impl Into<String>) {
        *self.state.last_error.lock().unwrap() = Some(message.into());
    }

    pub fn overview(&self) -> TelemetryOverview {
        TelemetryOverview {
            latest: self.state.latest.lock().unwrap().clone(),
            error: self.state.last_error.lock().unwrap().clone(),
            hashrate: self.state.hashrate.lock().unwrap().snapshot(),
            temperature: self.state.temperature.lock().unwrap().snapshot(),
            power: self.state.power.lock().unwrap().snapshot(),
        }
    }

    /// Asks the poll loop for an immediate out-of-band poll.
    pub fn request_poll(&self) {
        self.state.repoll.notify_one();
    }

    pub(crate) async fn repoll_requested(&self) {
        self.state.repoll.notified().await;
    }

    pub fn persist(&self, store: &HistoryStore) {
        store.save(HASHRATE_KEY, &self.state.hashrate.lock().unwrap().snapshot());
        store.save(
            TEMPERATURE_KEY,
            &self.state.temperature.lock().unwrap().snapshot(),
        );
        store.save(POWER_KEY, &self.state.power.lock().unwrap().snapshot());
    }
}
