use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::{Error, Result};

/// Trading grids of one symbol, extracted from the exchange's
/// `PRICE_FILTER` and `LOT_SIZE` filters.
///
/// Every price and quantity sent to the exchange is rounded **down** onto
/// these grids and rendered as a plain decimal string at the grid's natural
/// precision. The client never rounds half-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
}

impl SymbolFilters {
    /// Build from the filter strings of `/fapi/v1/exchangeInfo`
    /// (e.g. tick `"0.10000000"`, step `"0.00100000"`).
    pub fn parse(tick_size: &str, step_size: &str, min_qty: &str) -> Result<Self> {
        let parse = |name: &str, s: &str| -> Result<Decimal> {
            let d: Decimal = s
                .parse()
                .map_err(|_| Error::Config(format!("invalid {name}: '{s}'")))?;
            if d <= Decimal::ZERO {
                return Err(Error::Config(format!("{name} must be positive, got '{s}'")));
            }
            Ok(d.normalize())
        };
        Ok(SymbolFilters {
            tick_size: parse("tickSize", tick_size)?,
            step_size: parse("stepSize", step_size)?,
            min_qty: parse("minQty", min_qty)?,
        })
    }

    /// Format a price: round down to `tick_size`, render at tick precision.
    pub fn format_price(&self, price: f64) -> Result<String> {
        format_to_grid(price, self.tick_size)
    }

    /// Format a quantity: round down to `step_size`, render at step precision.
    pub fn format_quantity(&self, quantity: f64) -> Result<String> {
        format_to_grid(quantity, self.step_size)
    }

    /// The minimum tradable quantity, already on the step grid.
    pub fn min_quantity_str(&self) -> Result<String> {
        self.format_quantity(self.min_qty_f64())
    }

    pub fn min_qty_f64(&self) -> f64 {
        self.min_qty.to_f64().unwrap_or(0.0)
    }
}

/// Round `value` down to a multiple of `grid` and render it with exactly the
/// grid's number of decimal places. Plain decimal output, no scientific
/// notation.
fn format_to_grid(value: f64, grid: Decimal) -> Result<String> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Other(format!("cannot format non-finite or negative value {value}")));
    }
    let d = Decimal::from_f64(value)
        .ok_or_else(|| Error::Other(format!("value {value} not representable as decimal")))?;
    let units = (d / grid).floor();
    let mut snapped = units * grid;
    snapped.rescale(grid.scale());
    Ok(snapped.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        // BTCUSDC-like grids
        SymbolFilters::parse("0.10000000", "0.00100000", "0.00100000").unwrap()
    }

    #[test]
    fn parse_normalizes_grids() {
        let f = filters();
        assert_eq!(f.tick_size, dec!(0.1));
        assert_eq!(f.step_size, dec!(0.001));
        assert_eq!(f.min_qty, dec!(0.001));
    }

    #[test]
    fn price_rounds_down_to_tick() {
        let f = filters();
        // 96 * (1 - 0.00001) = 95.99904 -> one tick below 96.0
        assert_eq!(f.format_price(95.99904).unwrap(), "95.9");
        // 101 * 1.003 = 101.303
        assert_eq!(f.format_price(101.303).unwrap(), "101.3");
        assert_eq!(f.format_price(101.399999).unwrap(), "101.3");
    }

    #[test]
    fn price_on_grid_is_unchanged() {
        let f = filters();
        assert_eq!(f.format_price(101.3).unwrap(), "101.3");
        assert_eq!(f.format_price(96.0).unwrap(), "96.0");
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        let f = filters();
        assert_eq!(f.format_quantity(0.0029999).unwrap(), "0.002");
        assert_eq!(f.format_quantity(0.006).unwrap(), "0.006");
        assert_eq!(f.format_quantity(1.0).unwrap(), "1.000");
    }

    #[test]
    fn formatting_is_idempotent() {
        let f = filters();
        for v in [95.99904, 101.303, 0.0125, 7.77, 12345.678] {
            let once = f.format_price(v).unwrap();
            let twice = f.format_price(once.parse().unwrap()).unwrap();
            assert_eq!(once, twice, "price formatting not idempotent for {v}");

            let once = f.format_quantity(v).unwrap();
            let twice = f.format_quantity(once.parse().unwrap()).unwrap();
            assert_eq!(once, twice, "quantity formatting not idempotent for {v}");
        }
    }

    #[test]
    fn no_scientific_notation_for_small_grids() {
        let f = SymbolFilters::parse("0.00000010", "0.00000001", "0.00000001").unwrap();
        let s = f.format_price(0.00000123).unwrap();
        assert_eq!(s, "0.0000012");
        assert!(!s.contains('e') && !s.contains('E'));
    }

    #[test]
    fn rejects_zero_grid() {
        assert!(SymbolFilters::parse("0", "0.001", "0.001").is_err());
    }

    #[test]
    fn min_quantity_is_on_grid() {
        let f = filters();
        assert_eq!(f.min_quantity_str().unwrap(), "0.001");
    }
}
