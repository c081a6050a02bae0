use serde::{Deserialize, Serialize};

/// Provenance-tagged rolling average for one horizon.
///
/// A device-reported figure always wins over the local fallback computation;
/// the local figure is only used for horizons the device does not report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Average {
    DeviceReported(f64),
    LocallyDerived(f64),
    Unavailable,
}

impl Average {
    pub fn merge(device_reported: Option<f64>, locally_derived: Option<f64>) -> Self {
        match (device_reported, locally_derived) {
            (Some(value), _) if value.is_finite() => Average::DeviceReported(value),
            (_, Some(value)) if value.is_finite() => Average::LocallyDerived(value),
            _ => Average::Unavailable,
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Average::DeviceReported(value) | Average::LocallyDerived(value) => Some(value),
            Average::Unavailable => None,
        }
    }
}

/// One point-in-time hashrate reading. `time` is epoch milliseconds; value
/// fields are None when the device omitted them and no fallback applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HashrateSample {
    pub time: i64,
    #[serde(default)]
    pub hashrate: Option<f64>,
    #[serde(default)]
    pub avg_1m: Option<f64>,
    #[serde(default)]
    pub avg_10m: Option<f64>,
    #[serde(default)]
    pub avg_1h: Option<f64>,
    #[serde(default)]
    pub avg_1d: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub time: i64,
    #[serde(default)]
    pub asic_temp: Option<f64>,
    #[serde(default)]
    pub vr_temp: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PowerSample {
    pub time: i64,
    #[serde(default)]
    pub power: Option<f64>,
    #[serde(default)]
    pub fan_percent: Option<f64>,
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub core_voltage: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_reported_average_wins_over_local() {
        let merged = Average::merge(Some(512.0), Some(480.0));
        assert_eq!(merged, Average::DeviceReported(512.0));
        assert_eq!(merged.value(), Some(512.0));
    }

    #[test]
    fn local_average_used_when_device_omits() {
        assert_eq!(
            Average::merge(None, Some(480.0)),
            Average::LocallyDerived(480.0)
        );
    }

    #[test]
    fn non_finite_device_value_falls_back() {
        assert_eq!(
            Average::merge(Some(f64::NAN), Some(480.0)),
            Average::LocallyDerived(480.0)
        );
        assert_eq!(Average::merge(Some(f64::NAN), None), Average::Unavailable);
        assert_eq!(Average::merge(None, None).value(), None);
    }
}
