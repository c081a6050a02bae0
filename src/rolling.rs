/// Fallback rolling average over the most recent window of a series.
///
/// `values` holds the retained instantaneous readings, oldest first, not yet
/// including the new point. The window is the last `n - 1` retained readings
/// plus `candidate`; the result is the arithmetic mean of the defined, finite
/// values in that window, or None when the window holds no defined value.
pub fn rolling_average(values: &[Option<f64>], n: usize, candidate: Option<f64>) -> Option<f64> {
    let n = n.max(1);
    let start = values.len().saturating_sub(n - 1);

    let mut sum = 0.0;
    let mut count = 0u32;
    for value in values[start..].iter().chain(std::iter::once(&candidate)) {
        if let Some(value) = value {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }
    }

    if count == 0 {
        None
    } else {
        Some(sum / f64::from(count))
    }
}

/// Number of retained points covering `window` at one point per `interval`.
pub fn window_points(window_ms: u64, interval_ms: u64) -> usize {
    (window_ms / interval_ms.max(1)).max(1) as usize
}
