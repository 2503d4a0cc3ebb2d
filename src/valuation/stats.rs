//! Small numeric helpers shared by the ranking, mapping and validation stages.

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Linear-interpolated percentile on a copy of `values` (`pct` in [0, 100]).
pub(crate) fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> Option<f64> {
    let centre = mean(values)?;
    let variance =
        values.iter().map(|v| (v - centre).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Coefficient of determination of `predicted` against `observed`.
pub(crate) fn r_squared(observed: &[f64], predicted: &[f64]) -> f64 {
    let centre = mean(observed).unwrap_or_default();
    let total: f64 = observed.iter().map(|y| (y - centre).powi(2)).sum();
    let residual: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();

    if total <= f64::EPSILON {
        return if residual <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    1.0 - residual / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values: Vec<f64> = (1..=11).map(f64::from).collect();
        assert_eq!(percentile(&values, 10.0), Some(2.0));
        assert_eq!(percentile(&values, 90.0), Some(10.0));
    }

    #[test]
    fn r_squared_of_perfect_prediction_is_one() {
        let observed = [1.0, 2.0, 3.0];
        assert!((r_squared(&observed, &observed) - 1.0).abs() < 1e-12);
        assert!(r_squared(&observed, &[2.0, 2.0, 2.0]).abs() < 1e-12);
    }
}
