use crate::config::ThresholdParams;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sheet-wide thresholds derived from the largest intensity jump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalThresholds {
    pub primary: f64,
    /// Second-best jump at least JUMP_DELTA away from the first. Computed
    /// for diagnostics; the response path does not consume it.
    pub secondary: f64,
}

/// Scans the sorted intensity list with a symmetric window and places the
/// threshold at the midpoint of the largest jump exceeding MIN_JUMP. The
/// page-type default is returned when no jump qualifies, which happens on
/// all-blank or all-marked sheets.
pub fn get_global_threshold(
    values: &[f64],
    params: &ThresholdParams,
    looseness: usize,
) -> GlobalThresholds {
    let global_default = params.page_type.default_global_threshold();

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("intensities are not NaN"));

    let ls = (looseness + 1) / 2;
    let upper = sorted.len().saturating_sub(ls);

    let mut max1 = params.min_jump;
    let mut thr1 = global_default;
    for i in ls..upper {
        let jump = sorted[i + ls] - sorted[i - ls];
        if jump > max1 {
            max1 = jump;
            thr1 = sorted[i - ls] + jump / 2.0;
        }
    }

    let mut max2 = params.min_jump;
    let mut thr2 = global_default;
    for i in ls..upper {
        let jump = sorted[i + ls] - sorted[i - ls];
        let new_thr = sorted[i - ls] + jump / 2.0;
        if jump > max2 && (thr1 - new_thr).abs() >= params.jump_delta {
            max2 = jump;
            thr2 = new_thr;
        }
    }

    GlobalThresholds {
        primary: thr1,
        secondary: thr2,
    }
}

/// Per-question threshold over a small (typically 2-10 value) intensity
/// list. Falls back to the global threshold when the local jump is not
/// confident and the question's spread is unremarkable, which guards
/// against spurious thresholds on mostly-uniform rows.
pub fn get_local_threshold(
    values: &[f64],
    global_threshold: f64,
    no_outliers: bool,
    params: &ThresholdParams,
) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("intensities are not NaN"));

    if sorted.len() < 3 {
        return match (sorted.first(), sorted.last()) {
            (Some(first), Some(last)) if last - first >= params.min_gap => mean(&sorted),
            _ => global_threshold,
        };
    }

    let mut max1 = params.min_jump;
    let mut thr1 = 255.0;
    for i in 1..sorted.len() - 1 {
        let jump = sorted[i + 1] - sorted[i - 1];
        if jump > max1 {
            max1 = jump;
            thr1 = sorted[i - 1] + jump / 2.0;
        }
    }

    let confident_jump = params.min_jump + params.confident_surplus;
    if max1 < confident_jump && no_outliers {
        return global_threshold;
    }

    thr1
}
