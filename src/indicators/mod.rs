// Technical indicators computed from close prices
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use macd::{calculate_macd, MacdOutput};
pub use moving_average::{calculate_ema, calculate_sma};
pub use rsi::calculate_rsi;
