// Technical indicators module
// ATR drives volatility-based stop distances

pub mod atr;

pub use atr::{calculate_atr, true_ranges};
