//! Summary statistics over per-direction interval lists.
//!
//! Every function returns 0 for an empty input so feature rows never carry NaN.

/// Percentile used as the burst threshold.
pub const BURST_PERCENTILE: f64 = 10.0;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (divides by n), two-pass around the mean.
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = mean(values);
    values.iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>() / values.len() as f64
}

/// Percentile with linear interpolation between the two closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Fraction of intervals strictly below the 10th percentile of the same list.
pub fn burst_ratio(iats: &[f64]) -> f64 {
    if iats.is_empty() {
        return 0.0;
    }
    let threshold = percentile(iats, BURST_PERCENTILE);
    iats.iter().filter(|&&iat| iat < threshold).count() as f64 / iats.len() as f64
}
