pub mod heikin_ashi;
pub mod rsi;

pub use heikin_ashi::HaCandle;
pub use rsi::RsiZone;
