//! Average True Range (ATR) indicator
//!
//! Measures volatility as the average of true ranges over a period.
//! True Range is the greatest of:
//! - Current High - Current Low
//! - Abs(Current High - Previous Close)
//! - Abs(Current Low - Previous Close)
//!
//! Uses a simple average of the most recent `period` true ranges, which is
//! what volatility-based stop distances are sized from.

use crate::models::Candle;

/// True range for each candle after the first
pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .map(|pair| {
            let high = pair[1].high;
            let low = pair[1].low;
            let prev_close = pair[0].close;

            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs())
        })
        .collect()
}

/// Calculate ATR for the given candles (oldest first)
///
/// Returns None unless at least `period + 1` candles are supplied
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let ranges = true_ranges(candles);
    let recent = &ranges[ranges.len() - period..];

    Some(recent.iter().sum::<f64>() / period as f64)
}
