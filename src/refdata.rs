//! # Reference Data Lookups
//!
//! The engine never consults reference tables during transition logic, with
//! one exception: approval rule conditions may be currency-conditioned
//! (amount thresholds). Those conditions need the currency's minor-unit
//! exponent to compare amounts at the right precision. The lookup is an
//! immutable service behind a trait; the default table covers the common
//! cases and hosts can supply their own loaded from the reference store.

use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Read-only currency lookup.
pub trait CurrencyLookup: Send + Sync {
    /// Minor-unit exponent for an ISO 4217 code (2 for USD, 0 for JPY).
    fn minor_units(&self, code: &str) -> Result<u32>;
}

/// Static in-memory currency table.
pub struct StaticCurrencyTable {
    exponents: HashMap<String, u32>,
}

impl StaticCurrencyTable {
    pub fn new(entries: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            exponents: entries.into_iter().collect(),
        }
    }
}

impl Default for StaticCurrencyTable {
    fn default() -> Self {
        let common = [
            ("USD", 2u32),
            ("EUR", 2),
            ("GBP", 2),
            ("CHF", 2),
            ("JPY", 0),
            ("KRW", 0),
            ("KWD", 3),
            ("BHD", 3),
        ];
        Self::new(common.iter().map(|(c, e)| (c.to_string(), *e)))
    }
}

impl CurrencyLookup for StaticCurrencyTable {
    fn minor_units(&self, code: &str) -> Result<u32> {
        self.exponents
            .get(code)
            .copied()
            .ok_or_else(|| EngineError::DefinitionInvalid(format!("unknown currency code '{code}'")))
    }
}
