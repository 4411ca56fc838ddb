use serde::Serialize;

use crate::domain::repositories::exchange_client::ExchangeError;

/// Tolerance for values that sit exactly on a step boundary
const STEP_EPSILON: f64 = 1e-9;

/// Per-symbol trading rules published by an exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRules {
    pub symbol: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub max_qty: Option<f64>,
    pub min_notional: Option<f64>,
}

/// Quantity and prices after rounding, ready for submission
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedOrder {
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl SymbolRules {
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        floor_to_step(quantity, self.step_size)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        floor_to_step(price, self.tick_size)
    }

    /// Number of decimals implied by the step size, used for wire formatting
    pub fn quantity_precision(&self) -> usize {
        decimals(self.step_size)
    }

    pub fn price_precision(&self) -> usize {
        decimals(self.tick_size)
    }

    /// Round quantity/prices down to step and tick and check the minimums.
    ///
    /// `reference_price` is used for the notional check of market orders.
    pub fn prepare(
        &self,
        quantity: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        reference_price: Option<f64>,
        reduce_only: bool,
    ) -> Result<PreparedOrder, ExchangeError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ExchangeError::Validation(format!(
                "{}: quantity must be positive, got {}",
                self.symbol, quantity
            )));
        }

        let qty = self.round_quantity(quantity);
        if qty <= 0.0 || qty + STEP_EPSILON < self.min_qty {
            return Err(ExchangeError::Validation(format!(
                "{}: quantity {} below minimum {} (step {})",
                self.symbol, quantity, self.min_qty, self.step_size
            )));
        }
        if let Some(max) = self.max_qty {
            if qty > max + STEP_EPSILON {
                return Err(ExchangeError::Validation(format!(
                    "{}: quantity {} above maximum {}",
                    self.symbol, qty, max
                )));
            }
        }

        let price = price.map(|p| self.checked_price(p, "price")).transpose()?;
        let stop_price = stop_price
            .map(|p| self.checked_price(p, "stop price"))
            .transpose()?;

        // Reduce-only orders are exempt from the notional minimum on both venues
        if !reduce_only {
            if let (Some(min_notional), Some(px)) =
                (self.min_notional, price.or(reference_price))
            {
                let notional = qty * px;
                if notional + STEP_EPSILON < min_notional {
                    return Err(ExchangeError::Validation(format!(
                        "{}: notional {:.4} below minimum {}",
                        self.symbol, notional, min_notional
                    )));
                }
            }
        }

        Ok(PreparedOrder {
            quantity: qty,
            price,
            stop_price,
        })
    }

    fn checked_price(&self, price: f64, label: &str) -> Result<f64, ExchangeError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(ExchangeError::Validation(format!(
                "{}: {} must be positive, got {}",
                self.symbol, label, price
            )));
        }
        let rounded = self.round_price(price);
        if rounded <= 0.0 {
            return Err(ExchangeError::Validation(format!(
                "{}: {} {} below tick size {}",
                self.symbol, label, price, self.tick_size
            )));
        }
        Ok(rounded)
    }
}

/// Format a value with a fixed number of decimals, trimming trailing zeros
pub fn format_decimal(value: f64, precision: usize) -> String {
    let formatted = format!("{:.*}", precision, value);
    if formatted.contains('.') {
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        formatted
    }
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let units = (value / step + STEP_EPSILON).floor();
    let precision = decimals(step) as i32;
    let factor = 10f64.powi(precision);
    (units * step * factor).round() / factor
}

fn decimals(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let mut places = 0;
    let mut scaled = step;
    while places < 12 && (scaled - scaled.round()).abs() > STEP_EPSILON {
        scaled *= 10.0;
        places += 1;
    }
    places
}
