/// Calculate Relative Strength Index (RSI)
///
/// Averages positive and negative close-to-close deltas across the last
/// `period` values. Returns None until enough values exist; callers report
/// a neutral 50 in that case. When the average loss is zero the RSI is
/// pinned at 100.
pub fn calculate_rsi(values: &[f64], period: usize) -> Option<f64> {
    if period < 2 || values.len() < period {
        return None;
    }

    let window = &values[values.len() - period..];

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change >= 0.0 {
            gain_sum += change;
        } else {
            loss_sum += -change;
        }
    }

    let deltas = (period - 1) as f64;
    let avg_gain = gain_sum / deltas;
    let avg_loss = loss_sum / deltas;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_in_range() {
        let values = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0,
        ];
        let rsi = calculate_rsi(&values, 14).unwrap();
        assert!(rsi > 0.0 && rsi < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let values = vec![44.0, 44.5, 45.0];
        assert!(calculate_rsi(&values, 14).is_none());
    }

    #[test]
    fn test_rsi_all_gains_pins_at_100() {
        let values = vec![40.0, 41.0, 42.0, 43.0, 44.0];
        assert_eq!(calculate_rsi(&values, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses_near_zero() {
        let values = vec![44.0, 43.0, 42.0, 41.0, 40.0];
        let rsi = calculate_rsi(&values, 5).unwrap();
        assert!(rsi < 1.0);
    }
}
