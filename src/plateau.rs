/// Plateau detection over a smoothed metric series.
///
/// Higher is better. A plateau means none of the last `patience` present
/// values is more than `min_delta` below the best value seen so far. A slow
/// decline counts as well: the question is only whether the run is still
/// improving.
use crate::metrics::SmoothedSeries;

/// Intermediate values of one plateau check, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauAssessment {
    /// Number of present values.
    pub epochs: usize,
    pub best: Option<f64>,
    pub recent: Vec<f64>,
    pub plateau: bool,
}

/// Decide whether `series` has stopped improving.
pub fn assess(
    series: &SmoothedSeries,
    min_epochs: usize,
    patience: usize,
    min_delta: f64,
) -> PlateauAssessment {
    let present: Vec<f64> = series.present().collect();
    let epochs = present.len();
    let best = present.iter().copied().reduce(f64::max);
    let recent = present[epochs.saturating_sub(patience)..].to_vec();

    let plateau = match best {
        Some(best) if epochs >= min_epochs => recent.iter().all(|v| best - v <= min_delta),
        _ => false,
    };

    PlateauAssessment {
        epochs,
        best,
        recent,
        plateau,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn series(values: &[f64]) -> SmoothedSeries {
        SmoothedSeries {
            column: "fitness".to_string(),
            source: PathBuf::from("results.csv"),
            values: values.iter().map(|v| Some(*v)).collect(),
        }
    }

    fn is_plateau(s: &SmoothedSeries, min_epochs: usize, patience: usize, min_delta: f64) -> bool {
        assess(s, min_epochs, patience, min_delta).plateau
    }

    const CURVE: [f64; 6] = [0.10, 0.20, 0.30, 0.31, 0.305, 0.308];

    #[test]
    fn test_flattening_curve_is_plateau() {
        let a = assess(&series(&CURVE), 5, 3, 0.01);
        assert!(a.plateau);
        assert_eq!(a.epochs, 6);
        assert_eq!(a.best, Some(0.31));
        assert_eq!(a.recent, vec![0.31, 0.305, 0.308]);
    }

    #[test]
    fn test_insufficient_history_never_plateaus() {
        assert!(!is_plateau(&series(&CURVE), 7, 3, 0.01));
        // Perfectly flat, but still below the gate.
        assert!(!is_plateau(&series(&[0.5; 4]), 5, 2, 0.01));
    }

    #[test]
    fn test_still_improving_is_not_plateau() {
        let s = series(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert!(!is_plateau(&s, 3, 3, 0.01));
    }

    #[test]
    fn test_slight_decline_counts_as_plateau() {
        let s = series(&[0.1, 0.5, 0.499, 0.4995, 0.498]);
        assert!(is_plateau(&s, 3, 3, 0.01));
    }

    #[test]
    fn test_steep_drop_is_not_plateau() {
        // every recent value must sit within min_delta of best
        let s = series(&[0.1, 0.5, 0.4, 0.3, 0.2]);
        assert!(!is_plateau(&s, 3, 3, 0.01));
    }

    #[test]
    fn test_single_recent_outlier_breaks_plateau() {
        let s = series(&[0.5, 0.5, 0.5, 0.2, 0.5]);
        assert!(!is_plateau(&s, 3, 3, 0.01));
        assert!(is_plateau(&s, 3, 1, 0.01));
    }

    #[test]
    fn test_absent_values_are_ignored() {
        let s = SmoothedSeries {
            column: "fitness".to_string(),
            source: PathBuf::from("results.csv"),
            values: vec![Some(0.3), None, Some(0.31), None, None, Some(0.305)],
        };
        let a = assess(&s, 3, 3, 0.01);
        assert_eq!(a.epochs, 3);
        assert!(a.plateau);
        // Six rows but only three present: gated.
        assert!(!is_plateau(&s, 4, 3, 0.01));
    }

    #[test]
    fn test_patience_longer_than_history() {
        let s = series(&[0.4, 0.401, 0.402]);
        let a = assess(&s, 3, 10, 0.01);
        assert_eq!(a.recent.len(), 3);
        assert!(a.plateau);
    }

    #[test]
    fn test_empty_series_never_plateaus() {
        let a = assess(&series(&[]), 0, 3, 0.01);
        assert!(!a.plateau);
        assert_eq!(a.best, None);
        assert!(!is_plateau(&series(&[]), 0, 3, 1.0));
    }

    #[test]
    fn test_within_bound_property() {
        // Every recent value within min_delta of the running max, enough history.
        for n in 5..12 {
            let values: Vec<f64> = (0..n)
                .map(|i| if i < n - 3 { 0.1 * i as f64 } else { 1.0 - 0.001 * (i % 3) as f64 })
                .collect();
            assert!(is_plateau(&series(&values), 5, 3, 0.005), "n={n}");
        }
    }

    #[test]
    fn test_deterministic() {
        let s = series(&CURVE);
        let first = assess(&s, 5, 3, 0.01);
        for _ in 0..10 {
            assert_eq!(assess(&s, 5, 3, 0.01), first);
        }
    }
}
