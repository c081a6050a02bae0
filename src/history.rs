use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;

/// Bounded, append-only FIFO buffer of telemetry samples for one family.
/// `len() <= capacity` holds after every append; the oldest samples are
/// evicted first.
#[derive(Clone, Debug)]
pub struct Series<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> Series<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Seeds a series from persisted samples, keeping only the newest
    /// `capacity` entries.
    pub fn from_samples(samples: Vec<T>, capacity: usize) -> Self {
        let mut series = Self::new(capacity);
        for sample in samples {
            series.append(sample);
        }
        series
    }

    pub fn append(&mut self, sample: T) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }
}

impl<T: Clone> Series<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }
}

/// Durable storage for series blobs, one JSON array per family key.
///
/// Persistence is best-effort in both directions: a missing, unreadable, or
/// structurally invalid blob loads as an empty history, and save failures are
/// logged and swallowed. Telemetry persistence must never take down the poll
/// loop.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let path = self.blob_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding unparseable history blob");
                return Vec::new();
            }
        };

        // Structural check before the typed parse: a valid blob is an array
        // whose first element carries a numeric `time` field.
        let Some(items) = value.as_array() else {
            tracing::warn!(key, "discarding history blob: not an array");
            return Vec::new();
        };
        if items.is_empty() {
            return Vec::new();
        }
        let first_time_is_numeric = items[0]
            .get("time")
            .map(serde_json::Value::is_number)
            .unwrap_or(false);
        if !first_time_is_numeric {
            tracing::warn!(key, "discarding history blob: missing numeric time field");
            return Vec::new();
        }

        match serde_json::from_value(value) {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding history blob: shape mismatch");
                Vec::new()
            }
        }
    }

    pub fn save<T: Serialize>(&self, key: &str, samples: &[T]) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            tracing::warn!(key, error = %err, "failed to create history dir; skipping save");
            return;
        }
        let payload = match serde_json::to_vec(samples) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to serialize history; skipping save");
                return;
            }
        };
        if let Err(err) = fs::write(self.blob_path(key), payload) {
            tracing::warn!(key, error = %err, "failed to write history blob");
        }
    }
}
