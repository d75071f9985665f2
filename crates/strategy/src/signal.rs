//! Two-step signal detection: an RSI threshold coincidence arms a pending
//! side, the next Heikin-Ashi close confirms or discards it.

use std::collections::VecDeque;

use chrono::Utc;
use tracing::{debug, info};

use common::config::SignalConfig;
use common::{HaColor, Side, Signal};

use crate::indicators::rsi::{classify, RsiZone};

/// What the strategy runtime reports back to the engine before it emits.
pub trait SignalGate {
    /// False when the runtime could not honor a signal for this side.
    fn can_accept_signal(&self, side: Side) -> bool;
    /// True while an exit (TP) order of the previous cycle is still live.
    fn has_pending_exit(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    /// Waiting for all RSI periods to reach an extreme together.
    Waiting,
    /// RSI condition met; waiting for the next HA close to confirm.
    Pending(Side),
    /// Signal confirmed and latched until the runtime consumes it.
    Confirmed,
}

pub struct SignalEngine {
    config: SignalConfig,
    state: SignalState,
    confirmed: Option<Signal>,
    /// Closed-candle volumes, newest last; one slot more than the lookback so
    /// the confirming candle itself can be excluded from the mean.
    volume_history: VecDeque<f64>,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            state: SignalState::Waiting,
            confirmed: None,
            volume_history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SignalState {
        self.state
    }

    /// Evaluate one candle close. `rsi` carries the latest value per
    /// configured period (whether it runs on HA or raw closes is the
    /// runtime's choice). Returns the confirmed signal, latched until
    /// [`Self::acknowledge`].
    pub fn on_closed_candle(
        &mut self,
        rsi: &[(u32, Option<f64>)],
        ha_color: HaColor,
        volume: f64,
        gate: &dyn SignalGate,
    ) -> Option<Signal> {
        self.push_volume(volume);

        // A pending exit from the previous cycle blocks everything.
        if gate.has_pending_exit() {
            debug!("Exit orders still live, signal evaluation skipped");
            return None;
        }

        match self.state {
            SignalState::Waiting => {
                // Arming is unconditional; the runtime gate applies only at
                // emission time, so a pending side can fire the moment the
                // gate opens.
                if let Some(side) = self.rsi_coincidence(rsi) {
                    info!(%side, "RSI condition met, awaiting HA confirmation");
                    self.state = SignalState::Pending(side);
                }
                None
            }
            SignalState::Pending(side) => {
                let confirmed = self.confirms(side, ha_color, volume, gate, rsi);
                match confirmed {
                    Some(signal) => {
                        info!(%side, color = %ha_color, "Signal confirmed");
                        self.state = SignalState::Confirmed;
                        self.confirmed = Some(signal.clone());
                        Some(signal)
                    }
                    None => {
                        // Fall back and re-evaluate RSI on the next close.
                        debug!(%side, color = %ha_color, "Pending signal not confirmed");
                        self.state = SignalState::Waiting;
                        None
                    }
                }
            }
            SignalState::Confirmed => self.confirmed.clone(),
        }
    }

    /// The runtime consumed the confirmed signal.
    pub fn acknowledge(&mut self) {
        self.state = SignalState::Waiting;
        self.confirmed = None;
    }

    fn push_volume(&mut self, volume: f64) {
        if !self.config.volume_validation.enabled {
            return;
        }
        let cap = self.config.volume_validation.lookback_candles + 1;
        self.volume_history.push_back(volume);
        while self.volume_history.len() > cap {
            self.volume_history.pop_front();
        }
    }

    /// The side whose extreme ALL configured periods currently agree on.
    fn rsi_coincidence(&self, rsi: &[(u32, Option<f64>)]) -> Option<Side> {
        let mut zones = Vec::with_capacity(self.config.rsi_thresholds.len());
        for threshold in &self.config.rsi_thresholds {
            let value = rsi
                .iter()
                .find(|(p, _)| *p == threshold.period)
                .and_then(|(_, v)| *v)?;
            zones.push(classify(value, threshold.oversold, threshold.overbought));
        }
        if zones.iter().all(|z| *z == RsiZone::Oversold) {
            Some(Side::Long)
        } else if zones.iter().all(|z| *z == RsiZone::Overbought) {
            Some(Side::Short)
        } else {
            None
        }
    }

    fn confirms(
        &self,
        side: Side,
        ha_color: HaColor,
        volume: f64,
        gate: &dyn SignalGate,
        rsi: &[(u32, Option<f64>)],
    ) -> Option<Signal> {
        let color_ok = matches!(
            (side, ha_color),
            (Side::Long, HaColor::Green) | (Side::Short, HaColor::Red)
        );
        if !color_ok {
            return None;
        }
        if !self.volume_ok(volume) {
            info!(%side, volume, "Signal rejected, confirming volume below mean");
            return None;
        }
        if !gate.can_accept_signal(side) {
            debug!(%side, "Confirmation dropped, runtime cannot accept");
            return None;
        }

        let snapshot = rsi
            .iter()
            .filter_map(|(p, v)| v.map(|v| (*p, v)))
            .collect();
        Some(Signal {
            side,
            rsi_snapshot: snapshot,
            ha_color,
            volume: self.config.volume_validation.enabled.then_some(volume),
            origin_timestamp: Utc::now(),
        })
    }

    /// Confirming volume must exceed the mean of the previous closed volumes.
    /// Passes while the history is still shorter than the lookback.
    fn volume_ok(&self, current: f64) -> bool {
        if !self.config.volume_validation.enabled {
            return true;
        }
        if self.volume_history.len() < self.config.volume_validation.lookback_candles {
            return true;
        }
        let previous: Vec<f64> = self
            .volume_history
            .iter()
            .take(self.volume_history.len() - 1)
            .copied()
            .collect();
        if previous.is_empty() {
            return true;
        }
        let mean = previous.iter().sum::<f64>() / previous.len() as f64;
        current > mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{RsiThreshold, VolumeValidation};

    struct OpenGate;
    impl SignalGate for OpenGate {
        fn can_accept_signal(&self, _side: Side) -> bool {
            true
        }
        fn has_pending_exit(&self) -> bool {
            false
        }
    }

    struct ClosedGate;
    impl SignalGate for ClosedGate {
        fn can_accept_signal(&self, _side: Side) -> bool {
            false
        }
        fn has_pending_exit(&self) -> bool {
            false
        }
    }

    struct ExitPendingGate;
    impl SignalGate for ExitPendingGate {
        fn can_accept_signal(&self, _side: Side) -> bool {
            true
        }
        fn has_pending_exit(&self) -> bool {
            true
        }
    }

    fn config(volume: bool) -> SignalConfig {
        SignalConfig {
            rsi_on_ha: true,
            rsi_thresholds: vec![
                RsiThreshold { period: 3, oversold: 10.0, overbought: 90.0 },
                RsiThreshold { period: 5, oversold: 20.0, overbought: 80.0 },
                RsiThreshold { period: 7, oversold: 30.0, overbought: 70.0 },
            ],
            volume_validation: VolumeValidation {
                enabled: volume,
                lookback_candles: 3,
            },
        }
    }

    fn oversold() -> Vec<(u32, Option<f64>)> {
        vec![(3, Some(8.0)), (5, Some(15.0)), (7, Some(25.0))]
    }

    fn overbought() -> Vec<(u32, Option<f64>)> {
        vec![(3, Some(95.0)), (5, Some(88.0)), (7, Some(75.0))]
    }

    fn neutral() -> Vec<(u32, Option<f64>)> {
        vec![(3, Some(50.0)), (5, Some(50.0)), (7, Some(50.0))]
    }

    #[test]
    fn oversold_arms_pending_long_without_emitting() {
        let mut engine = SignalEngine::new(config(false));
        let out = engine.on_closed_candle(&oversold(), HaColor::Red, 10.0, &OpenGate);
        assert!(out.is_none());
        assert_eq!(engine.state(), SignalState::Pending(Side::Long));
    }

    #[test]
    fn green_close_confirms_long_exactly_once() {
        let mut engine = SignalEngine::new(config(false));
        engine.on_closed_candle(&oversold(), HaColor::Red, 10.0, &OpenGate);

        let signal = engine
            .on_closed_candle(&neutral(), HaColor::Green, 10.0, &OpenGate)
            .expect("confirmed long");
        assert_eq!(signal.side, Side::Long);
        assert_eq!(engine.state(), SignalState::Confirmed);

        // Latched until acknowledged, then gone.
        assert!(engine.on_closed_candle(&neutral(), HaColor::Red, 10.0, &OpenGate).is_some());
        engine.acknowledge();
        assert_eq!(engine.state(), SignalState::Waiting);
        assert!(engine.on_closed_candle(&neutral(), HaColor::Green, 10.0, &OpenGate).is_none());
    }

    #[test]
    fn red_close_after_overbought_confirms_short() {
        let mut engine = SignalEngine::new(config(false));
        engine.on_closed_candle(&overbought(), HaColor::Green, 10.0, &OpenGate);
        let signal = engine
            .on_closed_candle(&neutral(), HaColor::Red, 10.0, &OpenGate)
            .expect("confirmed short");
        assert_eq!(signal.side, Side::Short);
    }

    #[test]
    fn wrong_color_falls_back_to_waiting() {
        let mut engine = SignalEngine::new(config(false));
        engine.on_closed_candle(&oversold(), HaColor::Red, 10.0, &OpenGate);
        let out = engine.on_closed_candle(&neutral(), HaColor::Red, 10.0, &OpenGate);
        assert!(out.is_none());
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn partial_coincidence_does_not_arm() {
        let mut engine = SignalEngine::new(config(false));
        let mixed = vec![(3, Some(8.0)), (5, Some(15.0)), (7, Some(45.0))];
        engine.on_closed_candle(&mixed, HaColor::Red, 10.0, &OpenGate);
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn missing_period_value_does_not_arm() {
        let mut engine = SignalEngine::new(config(false));
        let incomplete = vec![(3, Some(8.0)), (5, None), (7, Some(25.0))];
        engine.on_closed_candle(&incomplete, HaColor::Red, 10.0, &OpenGate);
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn gate_blocks_emission_but_not_arming() {
        // An engaged runtime does not stop the RSI condition from arming.
        let mut engine = SignalEngine::new(config(false));
        engine.on_closed_candle(&oversold(), HaColor::Red, 10.0, &ClosedGate);
        assert_eq!(engine.state(), SignalState::Pending(Side::Long));

        // Confirmation against a closed gate emits nothing.
        assert!(engine
            .on_closed_candle(&neutral(), HaColor::Green, 10.0, &ClosedGate)
            .is_none());
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn pending_exit_blocks_everything() {
        let mut engine = SignalEngine::new(config(false));
        engine.on_closed_candle(&oversold(), HaColor::Red, 10.0, &ExitPendingGate);
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn volume_below_mean_rejects_confirmation() {
        let mut engine = SignalEngine::new(config(true));
        // Build volume history: 100, 100, 100 (lookback 3).
        engine.on_closed_candle(&neutral(), HaColor::Green, 100.0, &OpenGate);
        engine.on_closed_candle(&neutral(), HaColor::Green, 100.0, &OpenGate);
        engine.on_closed_candle(&oversold(), HaColor::Red, 100.0, &OpenGate);
        assert_eq!(engine.state(), SignalState::Pending(Side::Long));

        // Confirming candle volume 50 < mean(100, 100, 100).
        let out = engine.on_closed_candle(&neutral(), HaColor::Green, 50.0, &OpenGate);
        assert!(out.is_none());
        assert_eq!(engine.state(), SignalState::Waiting);
    }

    #[test]
    fn volume_above_mean_confirms() {
        let mut engine = SignalEngine::new(config(true));
        engine.on_closed_candle(&neutral(), HaColor::Green, 100.0, &OpenGate);
        engine.on_closed_candle(&neutral(), HaColor::Green, 100.0, &OpenGate);
        engine.on_closed_candle(&oversold(), HaColor::Red, 100.0, &OpenGate);

        let signal = engine
            .on_closed_candle(&neutral(), HaColor::Green, 250.0, &OpenGate)
            .expect("volume-validated long");
        assert_eq!(signal.volume, Some(250.0));
    }
}
