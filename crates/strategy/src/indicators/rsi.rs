//! RSI (Relative Strength Index), EMA form.
//!
//! Price changes are split into gains and losses and both are smoothed by
//! the plain EMA recurrence with `alpha = 1/period` (no Wilder smoothing,
//! no SMA seed): `avg[i] = alpha * x[i] + (1 - alpha) * avg[i-1]`, starting
//! from zero. `RS = avg_gain / avg_loss`, `RSI = 100 - 100 / (1 + RS)`.

/// Compute the RSI series for `closes` (oldest first).
///
/// The result has one entry per close. Entries are `None` where the value is
/// undefined: the first close (no delta yet), flat stretches with neither
/// gains nor losses, and the whole series when fewer than `period + 1`
/// closes are available.
pub fn compute(closes: &[f64], period: u32) -> Vec<Option<f64>> {
    if period == 0 || closes.len() < period as usize + 1 {
        return vec![None; closes.len()];
    }

    let alpha = 1.0 / period as f64;
    let mut avg_gain = 0.0_f64;
    let mut avg_loss = 0.0_f64;

    let mut out = Vec::with_capacity(closes.len());
    out.push(None);

    for w in closes.windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;

        out.push(rsi_from_averages(avg_gain, avg_loss));
    }

    out
}

/// Latest RSI value of the series, if defined.
pub fn latest(closes: &[f64], period: u32) -> Option<f64> {
    compute(closes, period).last().copied().flatten()
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if avg_loss == 0.0 {
        // All-gain stretch pins RSI at 100; a fully flat stretch has no value.
        return (avg_gain > 0.0).then_some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Zone of an RSI value relative to per-period thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsiZone {
    Oversold,
    Overbought,
    Neutral,
}

pub fn classify(value: f64, oversold: f64, overbought: f64) -> RsiZone {
    if value <= oversold {
        RsiZone::Oversold
    } else if value >= overbought {
        RsiZone::Overbought
    } else {
        RsiZone::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_is_all_undefined() {
        let closes = vec![100.0; 5];
        let rsi = compute(&closes, 5);
        assert_eq!(rsi.len(), 5);
        assert!(rsi.iter().all(|v| v.is_none()));
    }

    #[test]
    fn first_value_is_undefined() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let rsi = compute(&closes, 3);
        assert!(rsi[0].is_none());
        assert!(rsi[1].is_some());
    }

    #[test]
    fn all_gains_pin_at_100() {
        let closes = vec![10.0, 11.0, 12.0, 13.0, 14.0];
        let value = latest(&closes, 3).unwrap();
        assert!((value - 100.0).abs() < 1e-9, "expected 100, got {value}");
    }

    #[test]
    fn all_losses_pin_at_0() {
        let closes = vec![14.0, 13.0, 12.0, 11.0, 10.0];
        let value = latest(&closes, 3).unwrap();
        assert!(value.abs() < 1e-9, "expected 0, got {value}");
    }

    #[test]
    fn flat_series_has_no_value() {
        let closes = vec![10.0; 8];
        assert!(latest(&closes, 3).is_none());
    }

    #[test]
    fn ema_recurrence_matches_hand_computation() {
        // period 2, alpha = 0.5, closes 10 -> 12 -> 11
        // deltas: +2 (gain), -1 (loss)
        // avg_gain: 0.5*2 = 1.0, then 0.5*0 + 0.5*1.0 = 0.5
        // avg_loss: 0.0,          then 0.5*1 + 0.5*0.0 = 0.5
        // rs = 1.0 -> rsi = 50
        let closes = vec![10.0, 12.0, 11.0];
        let rsi = compute(&closes, 2);
        assert_eq!(rsi[1], Some(100.0));
        let last = rsi[2].unwrap();
        assert!((last - 50.0).abs() < 1e-9, "expected 50, got {last}");
    }

    #[test]
    fn values_stay_in_range() {
        let closes: Vec<f64> = (0..50)
            .map(|i| 100.0 + ((i * 7919) % 13) as f64 - 6.0)
            .collect();
        for v in compute(&closes, 7).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&v), "RSI out of range: {v}");
        }
    }

    #[test]
    fn classification_respects_thresholds() {
        assert_eq!(classify(8.0, 10.0, 90.0), RsiZone::Oversold);
        assert_eq!(classify(10.0, 10.0, 90.0), RsiZone::Oversold);
        assert_eq!(classify(50.0, 10.0, 90.0), RsiZone::Neutral);
        assert_eq!(classify(95.0, 10.0, 90.0), RsiZone::Overbought);
    }
}
