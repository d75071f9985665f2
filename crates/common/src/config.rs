use serde::Deserialize;

use crate::{Error, Result};

/// All configuration, assembled once at startup and threaded through
/// construction. Credentials come from the environment; everything else from
/// the TOML file (`config/perpbot.toml` unless `PERPBOT_CONFIG` points
/// elsewhere), with defaults for every omitted key.
#[derive(Debug, Clone)]
pub struct Config {
    pub symbol: String,
    pub timeframe: String,

    // Exchange credentials
    pub api_key: String,
    pub secret_key: String,

    pub reconnection: ReconnectionConfig,
    pub signal: SignalConfig,
    pub trading: TradingConfig,
    pub hedging: HedgingConfig,
    pub cascade: CascadeConfig,
    pub tp: TpConfig,
    pub accumulator: AccumulatorConfig,
    pub all_or_nothing: AllOrNothingConfig,
    pub one_or_more: OneOrMoreConfig,
    pub strategy_type: StrategyKind,
}

impl Config {
    /// Load `.env` if present, read the TOML file, and merge the environment
    /// on top. Missing credentials are a configuration fatal.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let path = std::env::var("PERPBOT_CONFIG")
            .unwrap_or_else(|_| "config/perpbot.toml".to_string());
        let file = FileConfig::load(&path)?;

        let api_key = required_env("API_KEY")?;
        let secret_key = required_env("SECRET_KEY")?;

        let symbol = std::env::var("SYMBOL").unwrap_or(file.symbol);
        let timeframe = std::env::var("TIMEFRAME").unwrap_or(file.timeframe);

        if file.signal.rsi_thresholds.is_empty() {
            return Err(Error::Config(
                "signal.rsi_thresholds must configure at least one period".into(),
            ));
        }

        Ok(Config {
            symbol,
            timeframe,
            api_key,
            secret_key,
            reconnection: file.reconnection,
            signal: file.signal,
            trading: file.trading,
            hedging: file.hedging,
            cascade: file.cascade,
            tp: file.tp,
            accumulator: file.accumulator,
            all_or_nothing: file.all_or_nothing,
            one_or_more: file.one_or_more,
            strategy_type: file.strategy.strategy_type,
        })
    }
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| Error::Config(format!("required environment variable '{key}' is not set")))
}

/// On-disk layout of the TOML file. Every section has defaults so a minimal
/// file only needs the keys it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub symbol: String,
    pub timeframe: String,
    pub reconnection: ReconnectionConfig,
    pub signal: SignalConfig,
    pub trading: TradingConfig,
    pub hedging: HedgingConfig,
    pub cascade: CascadeConfig,
    pub tp: TpConfig,
    pub accumulator: AccumulatorConfig,
    pub all_or_nothing: AllOrNothingConfig,
    pub one_or_more: OneOrMoreConfig,
    pub strategy: StrategySection,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            symbol: "LINKUSDC".to_string(),
            timeframe: "5m".to_string(),
            reconnection: ReconnectionConfig::default(),
            signal: SignalConfig::default(),
            trading: TradingConfig::default(),
            hedging: HedgingConfig::default(),
            cascade: CascadeConfig::default(),
            tp: TpConfig::default(),
            accumulator: AccumulatorConfig::default(),
            all_or_nothing: AllOrNothingConfig::default(),
            one_or_more: OneOrMoreConfig::default(),
            strategy: StrategySection::default(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse '{path}': {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file: run entirely on defaults + environment.
                tracing::info!(path, "No config file found, using built-in defaults");
                Ok(FileConfig::default())
            }
            Err(e) => Err(Error::Config(format!("failed to read '{path}': {e}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay_secs: u64,
    /// A receive going silent this long counts as a lost connection.
    pub timeout_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfig {
            enabled: true,
            max_attempts: 100,
            delay_secs: 30,
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RsiThreshold {
    pub period: u32,
    pub oversold: f64,
    pub overbought: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolumeValidation {
    pub enabled: bool,
    pub lookback_candles: usize,
}

impl Default for VolumeValidation {
    fn default() -> Self {
        VolumeValidation {
            enabled: false,
            lookback_candles: 14,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Compute RSI on the Heikin-Ashi close series instead of raw closes.
    pub rsi_on_ha: bool,
    pub rsi_thresholds: Vec<RsiThreshold>,
    pub volume_validation: VolumeValidation,
}

impl SignalConfig {
    pub fn periods(&self) -> Vec<u32> {
        self.rsi_thresholds.iter().map(|t| t.period).collect()
    }

    pub fn threshold(&self, period: u32) -> Option<&RsiThreshold> {
        self.rsi_thresholds.iter().find(|t| t.period == period)
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            rsi_on_ha: true,
            rsi_thresholds: vec![
                RsiThreshold { period: 3, oversold: 10.0, overbought: 90.0 },
                RsiThreshold { period: 5, oversold: 20.0, overbought: 80.0 },
                RsiThreshold { period: 7, oversold: 30.0, overbought: 70.0 },
            ],
            volume_validation: VolumeValidation::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuantityMode {
    /// The exchange's minimum tradable quantity.
    Minimum,
    /// A fixed quantity from the config.
    Fixed,
    /// Risk a percentage of the balance against the protective distance.
    Percentage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub quantity_mode: QuantityMode,
    pub initial_quantity: f64,
    pub balance_percentage: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            quantity_mode: QuantityMode::Percentage,
            initial_quantity: 1.0,
            balance_percentage: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HedgingConfig {
    pub enabled: bool,
    pub lookback_candles: usize,
    pub quantity_multiplier: f64,
}

impl Default for HedgingConfig {
    fn default() -> Self {
        HedgingConfig {
            enabled: true,
            lookback_candles: 5,
            quantity_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub enabled: bool,
    pub max_orders: u32,
    /// Cadence an operator would use for a manual reconcile sweep; the
    /// runtime itself is event-driven.
    pub polling_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        CascadeConfig {
            enabled: true,
            max_orders: 10,
            polling_interval_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Take-profit ladder settings (CASCADE_MASTER only).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TpConfig {
    pub enabled: bool,
    pub base_multiplier: f64,
    /// Multiplicative step applied to a side's TP level per position count.
    pub position_increment: f64,
    /// Offset between the trigger price and the limit price.
    pub price_offset: f64,
}

impl Default for TpConfig {
    fn default() -> Self {
        TpConfig {
            enabled: true,
            base_multiplier: 1.0,
            position_increment: 0.001,
            price_offset: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccumulatorConfig {
    pub enabled: bool,
    pub tp_percent: f64,
    pub max_accumulations: u32,
    pub price_offset: f64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        AccumulatorConfig {
            enabled: true,
            tp_percent: 0.003,
            max_accumulations: 20,
            price_offset: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicRsiExit {
    pub enabled: bool,
    /// Cancel the fixed SL/TP after a successful RSI exit.
    pub cancel_fixed_orders: bool,
}

impl Default for DynamicRsiExit {
    fn default() -> Self {
        DynamicRsiExit {
            enabled: true,
            cancel_fixed_orders: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailingStop {
    pub enabled: bool,
    /// Favorable move from the reference price that arms an adjustment.
    pub price_trigger_percent: f64,
    /// Relative adjustment applied to the current stop level.
    pub sl_adjustment_percent: f64,
}

impl Default for TrailingStop {
    fn default() -> Self {
        TrailingStop {
            enabled: true,
            price_trigger_percent: 0.005,
            sl_adjustment_percent: 0.005,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllOrNothingConfig {
    pub enabled: bool,
    pub sl_lookback_candles: usize,
    pub sl_offset_percent: f64,
    pub tp_percent: f64,
    pub price_offset: f64,
    pub dynamic_rsi_exit: DynamicRsiExit,
    pub trailing_stop: TrailingStop,
}

impl Default for AllOrNothingConfig {
    fn default() -> Self {
        AllOrNothingConfig {
            enabled: true,
            sl_lookback_candles: 5,
            sl_offset_percent: 0.00001,
            tp_percent: 0.003,
            price_offset: 0.001,
            dynamic_rsi_exit: DynamicRsiExit::default(),
            trailing_stop: TrailingStop::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsymmetricTp {
    pub enabled: bool,
    /// RR of the signal TP after the hedge runs (secures the position).
    pub rr_ratio_signal_after_hedge: f64,
    /// RR of the hedge TP after the hedge runs.
    pub rr_ratio_hedge_after_hedge: f64,
}

impl Default for AsymmetricTp {
    fn default() -> Self {
        AsymmetricTp {
            enabled: true,
            rr_ratio_signal_after_hedge: 0.5,
            rr_ratio_hedge_after_hedge: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrossStops {
    pub enabled: bool,
}

impl Default for CrossStops {
    fn default() -> Self {
        CrossStops { enabled: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OneOrMoreConfig {
    pub enabled: bool,
    pub sl_lookback_candles: usize,
    pub sl_offset_percent: f64,
    pub hedge_quantity_multiplier: f64,
    /// Risk-reward ratio of the signal TP before the hedge executes.
    pub rr_ratio: f64,
    pub tp_safety_offset_percent: f64,
    pub min_distance_percent: f64,
    pub small_distance_offset_percent: f64,
    pub asymmetric_tp: AsymmetricTp,
    pub cross_stops: CrossStops,
}

impl Default for OneOrMoreConfig {
    fn default() -> Self {
        OneOrMoreConfig {
            enabled: true,
            sl_lookback_candles: 5,
            sl_offset_percent: 0.00001,
            hedge_quantity_multiplier: 2.0,
            rr_ratio: 1.0,
            tp_safety_offset_percent: 0.0002,
            min_distance_percent: 0.002,
            small_distance_offset_percent: 0.0015,
            asymmetric_tp: AsymmetricTp::default(),
            cross_stops: CrossStops::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Accumulator,
    CascadeMaster,
    AllOrNothing,
    OneOrMore,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::Accumulator => "ACCUMULATOR",
            StrategyKind::CascadeMaster => "CASCADE_MASTER",
            StrategyKind::AllOrNothing => "ALL_OR_NOTHING",
            StrategyKind::OneOrMore => "ONE_OR_MORE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySection {
    pub strategy_type: StrategyKind,
}

impl Default for StrategySection {
    fn default() -> Self {
        StrategySection {
            strategy_type: StrategyKind::OneOrMore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_fills_defaults() {
        let cfg: FileConfig = toml::from_str(
            r#"
            symbol = "BTCUSDC"

            [strategy]
            strategy_type = "ALL_OR_NOTHING"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.symbol, "BTCUSDC");
        assert_eq!(cfg.timeframe, "5m");
        assert_eq!(cfg.strategy.strategy_type, StrategyKind::AllOrNothing);
        assert_eq!(cfg.signal.periods(), vec![3, 5, 7]);
        assert_eq!(cfg.cascade.max_orders, 10);
    }

    #[test]
    fn thresholds_parse_per_period() {
        let cfg: FileConfig = toml::from_str(
            r#"
            [[signal.rsi_thresholds]]
            period = 3
            oversold = 10.0
            overbought = 90.0

            [[signal.rsi_thresholds]]
            period = 14
            oversold = 30.0
            overbought = 70.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signal.periods(), vec![3, 14]);
        let t = cfg.signal.threshold(14).unwrap();
        assert_eq!(t.oversold, 30.0);
        assert_eq!(t.overbought, 70.0);
    }

    #[test]
    fn unknown_strategy_type_is_rejected() {
        let res: std::result::Result<FileConfig, _> = toml::from_str(
            r#"
            [strategy]
            strategy_type = "MARTINGALE"
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn quantity_mode_uppercase_strings() {
        let cfg: FileConfig = toml::from_str(
            r#"
            [trading]
            quantity_mode = "FIXED"
            initial_quantity = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.trading.quantity_mode, QuantityMode::Fixed);
        assert_eq!(cfg.trading.initial_quantity, 2.0);
    }
}
