use crate::indicators::calculate_sma;

/// MACD line, signal line and histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl MacdOutput {
    pub fn neutral() -> Self {
        Self {
            macd: 0.0,
            signal: 0.0,
            histogram: 0.0,
        }
    }
}

/// Calculate MACD over a rolling buffer of closes
///
/// Fast/slow lines are averages over the trailing fast/slow windows and the
/// signal line averages the trailing `signal` window. Reports all zeros
/// until the slow window is full.
pub fn calculate_macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> MacdOutput {
    if values.len() < slow {
        return MacdOutput::neutral();
    }

    let fast_avg = calculate_sma(values, fast).unwrap_or(0.0);
    let slow_avg = calculate_sma(values, slow).unwrap_or(0.0);
    let macd_line = fast_avg - slow_avg;
    let signal_line = calculate_sma(values, signal).unwrap_or(0.0);

    MacdOutput {
        macd: macd_line,
        signal: signal_line,
        histogram: macd_line - signal_line,
    }
}
