//! Token pricing.
//!
//! Prices are held per single token as exact decimals so that the cost written to the usage log
//! and the cost emitted as a metric are computed identically and without float drift.
//!
//! Model names reported by the upstream carry a date suffix (`claude-3-opus-20240229`). They are
//! bucketed into a *family* by keeping the first three hyphen-separated segments. Any family not
//! present in the table is priced as the configured default family, so pricing never fails.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::PricingConfig;

/// Per-token prices for one model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPrice {
    pub input: Decimal,
    pub output: Decimal,
}

impl ModelPrice {
    /// Convert prices quoted per million tokens to per-token prices.
    pub fn per_million(input: Decimal, output: Decimal) -> Self {
        let million = Decimal::from(1_000_000u32);
        Self {
            input: input / million,
            output: output / million,
        }
    }
}

/// Immutable family -> price table with a default family fallback.
#[derive(Debug, Clone)]
pub struct CostTable {
    families: HashMap<String, ModelPrice>,
    default_family: String,
}

/// Reduce a model name to its pricing family: the first three `-` separated segments.
///
/// Names with fewer segments are returned whole.
pub fn canonical_family(model: &str) -> String {
    model.split('-').take(3).collect::<Vec<_>>().join("-")
}

impl CostTable {
    /// Build a table from explicit per-token prices.
    ///
    /// `default_family` should be a key of `families`; [`crate::config::Config::validate`]
    /// guarantees this for tables built from configuration. If it is missing anyway, unknown
    /// models are priced at zero.
    pub fn new(families: HashMap<String, ModelPrice>, default_family: impl Into<String>) -> Self {
        Self {
            families,
            default_family: default_family.into(),
        }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        let families = config
            .families
            .iter()
            .map(|(family, price)| {
                (
                    family.clone(),
                    ModelPrice::per_million(price.input_per_million, price.output_per_million),
                )
            })
            .collect();
        Self::new(families, config.default_family.clone())
    }

    /// The family whose prices apply to `model`.
    pub fn family_for(&self, model: &str) -> String {
        let family = canonical_family(model);
        if self.families.contains_key(&family) {
            family
        } else {
            self.default_family.clone()
        }
    }

    /// Prices applied to `model`
    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.families
            .get(&self.family_for(model))
            .copied()
            .unwrap_or(ModelPrice {
                input: Decimal::ZERO,
                output: Decimal::ZERO,
            })
    }

    /// Cost in USD of a call to `model` with the given token counts.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
        let price = self.price_for(model);
        Decimal::from(input_tokens) * price.input + Decimal::from(output_tokens) * price.output
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}
