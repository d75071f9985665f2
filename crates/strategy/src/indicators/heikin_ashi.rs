//! Heikin-Ashi candle transform.
//!
//! `ha_close = (o + h + l + c) / 4`; `ha_open` starts at `(o0 + c0) / 2` and
//! then averages the previous HA open and close. High/low take the raw
//! extreme into account so the HA candle never lies inside the raw range.

use common::{Candle, HaColor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaCandle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub color: HaColor,
}

/// Transform a time-ordered candle series. Output is empty for empty input.
pub fn compute(candles: &[Candle]) -> Vec<HaCandle> {
    let mut out: Vec<HaCandle> = Vec::with_capacity(candles.len());

    for (i, c) in candles.iter().enumerate() {
        let ha_close = (c.open + c.high + c.low + c.close) / 4.0;
        let ha_open = if i == 0 {
            (c.open + c.close) / 2.0
        } else {
            let prev = &out[i - 1];
            (prev.open + prev.close) / 2.0
        };
        let ha_high = c.high.max(ha_open).max(ha_close);
        let ha_low = c.low.min(ha_open).min(ha_close);

        out.push(HaCandle {
            open: ha_open,
            high: ha_high,
            low: ha_low,
            close: ha_close,
            color: color(ha_open, ha_close),
        });
    }

    out
}

pub fn color(ha_open: f64, ha_close: f64) -> HaColor {
    if ha_close > ha_open {
        HaColor::Green
    } else if ha_close < ha_open {
        HaColor::Red
    } else {
        HaColor::Doji
    }
}

/// HA close prices of the series, for RSI-on-HA mode.
pub fn close_series(candles: &[Candle]) -> Vec<f64> {
    compute(candles).iter().map(|c| c.close).collect()
}

/// Color of the latest candle in the series, if any.
pub fn latest_color(candles: &[Candle]) -> Option<HaColor> {
    compute(candles).last().map(|c| c.color)
}
