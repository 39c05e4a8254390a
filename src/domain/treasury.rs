use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a treasury reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceSource {
    /// Fresh read from the chain data provider
    Live,
    /// Last good live read, provider currently unavailable
    Cached,
    /// Configured fallback constant, no live read has ever succeeded
    Simulated,
}

impl BalanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceSource::Live => "live",
            BalanceSource::Cached => "cached",
            BalanceSource::Simulated => "simulated",
        }
    }

    /// True for anything other than a fresh provider read
    pub fn is_degraded(&self) -> bool {
        !matches!(self, BalanceSource::Live)
    }
}

impl fmt::Display for BalanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Observed balance of the treasury address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryState {
    pub address: String,
    /// Balance in the chain's native unit (ETH, not wei)
    pub balance: Decimal,
    pub source: BalanceSource,
    pub observed_at: DateTime<Utc>,
}

impl TreasuryState {
    pub fn live(address: impl Into<String>, balance: Decimal) -> Self {
        Self {
            address: address.into(),
            balance,
            source: BalanceSource::Live,
            observed_at: Utc::now(),
        }
    }

    pub fn simulated(address: impl Into<String>, balance: Decimal) -> Self {
        Self {
            address: address.into(),
            balance,
            source: BalanceSource::Simulated,
            observed_at: Utc::now(),
        }
    }

    /// Same reading relabeled as served from cache; `observed_at` is kept
    pub fn as_cached(&self) -> Self {
        Self {
            source: BalanceSource::Cached,
            ..self.clone()
        }
    }

    /// Balance strictly above the given reserve
    pub fn exceeds(&self, reserve: Decimal) -> bool {
        self.balance > reserve
    }
}
