// =============================================================================
// Volume-Weighted Moving Average (VWMA)
// =============================================================================
//
// VWMA_t = Σ(close × volume) / Σ(volume) over the trailing `period` bars.

/// Compute the VWMA series for parallel `closes`/`volumes` slices over
/// `period`. Returns an empty `Vec` on length mismatch, zero period, or
/// insufficient data.
pub fn calculate_vwma(closes: &[f64], volumes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() != volumes.len() || closes.len() < period {
        return Vec::new();
    }
    let mut result = Vec::with_capacity(closes.len() - period + 1);
    for window_end in period..=closes.len() {
        let window = window_end - period..window_end;
        let weighted_sum: f64 = window.clone().map(|i| closes[i] * volumes[i]).sum();
        let volume_sum: f64 = window.map(|i| volumes[i]).sum();
        if volume_sum <= 0.0 {
            result.push(closes[window_end - 1]);
        } else {
            result.push(weighted_sum / volume_sum);
        }
    }
    result
}

pub fn latest_vwma(closes: &[f64], volumes: &[f64], period: usize) -> Option<f64> {
    calculate_vwma(closes, volumes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vwma_weights_higher_volume_bars_more() {
        let closes = [10.0, 20.0];
        let volumes = [1.0, 9.0];
        let vwma = latest_vwma(&closes, &volumes, 2).unwrap();
        assert!((vwma - 19.0).abs() < 1e-9);
    }

    #[test]
    fn zero_volume_window_falls_back_to_last_close() {
        let closes = [10.0, 20.0];
        let volumes = [0.0, 0.0];
        let vwma = latest_vwma(&closes, &volumes, 2).unwrap();
        assert_eq!(vwma, 20.0);
    }
}
