use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerError, RunnerResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyType {
    Coins,
    Gems,
    Energy,
    Tickets,
}

impl CurrencyType {
    pub const ALL: [CurrencyType; 4] = [
        CurrencyType::Coins,
        CurrencyType::Gems,
        CurrencyType::Energy,
        CurrencyType::Tickets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CurrencyType::Coins => "coins",
            CurrencyType::Gems => "gems",
            CurrencyType::Energy => "energy",
            CurrencyType::Tickets => "tickets",
        }
    }
}

impl fmt::Display for CurrencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyType {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coins" => Ok(CurrencyType::Coins),
            "gems" => Ok(CurrencyType::Gems),
            "energy" => Ok(CurrencyType::Energy),
            "tickets" => Ok(CurrencyType::Tickets),
            other => Err(invalid_input(format!("unknown currency type \"{other}\""))),
        }
    }
}

/// Per-currency amounts. Missing currencies read as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyBalances(BTreeMap<CurrencyType, i64>);

impl CurrencyBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, currency: CurrencyType, amount: i64) -> Self {
        self.set(currency, amount);
        self
    }

    pub fn get(&self, currency: CurrencyType) -> i64 {
        self.0.get(&currency).copied().unwrap_or(0)
    }

    pub fn set(&mut self, currency: CurrencyType, amount: i64) {
        self.0.insert(currency, amount);
    }

    /// Adds a signed amount, returning the new balance.
    pub fn apply(&mut self, currency: CurrencyType, delta: i64) -> i64 {
        let entry = self.0.entry(currency).or_insert(0);
        *entry = entry.saturating_add(delta);
        *entry
    }

    pub fn iter(&self) -> impl Iterator<Item = (CurrencyType, i64)> + '_ {
        self.0.iter().map(|(currency, amount)| (*currency, *amount))
    }

    pub fn validate(&self) -> RunnerResult<()> {
        match self.iter().find(|(_, amount)| *amount < 0) {
            Some((currency, amount)) => Err(invalid_input(format!(
                "{currency} balance cannot be negative ({amount})"
            ))),
            None => Ok(()),
        }
    }
}
