//! Small numeric helpers shared by the aggregators, scorer and trend detector.

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> Option<f64> {
    let avg = mean(values)?;
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Upper median of an ascending slice.
pub(crate) fn median_sorted(sorted: &[i64]) -> Option<i64> {
    sorted.get(sorted.len() / 2).copied()
}

/// Nearest-rank percentile of an ascending slice.
pub(crate) fn percentile_sorted(sorted: &[i64], p: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_percentiles() {
        let sorted = [2, 4, 6, 8, 10, 12, 14, 16];
        assert_eq!(percentile_sorted(&sorted, 25.0), Some(4));
        assert_eq!(percentile_sorted(&sorted, 75.0), Some(12));
        assert_eq!(percentile_sorted(&[5], 25.0), Some(5));
        assert_eq!(median_sorted(&sorted), Some(10));
        assert_eq!(percentile_sorted(&[], 50.0), None);
    }

    #[test]
    fn population_std_dev() {
        let sd = std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-9);
        assert_eq!(round_to(2.345_67, 2), 2.35);
        assert_eq!(mean(&[]), None);
    }
}
