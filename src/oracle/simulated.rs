//! In-process chain used for dry runs
//!
//! Serves one adjustable balance for every address and can be switched
//! offline or slowed down to exercise the oracle's degraded paths.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::ChainDataProvider;
use crate::error::ProviderError;

pub struct SimulatedChain {
    balance: RwLock<Decimal>,
    latency: RwLock<Duration>,
    reachable: AtomicBool,
    fetches: AtomicU64,
}

impl SimulatedChain {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance: RwLock::new(balance),
            latency: RwLock::new(Duration::ZERO),
            reachable: AtomicBool::new(true),
            fetches: AtomicU64::new(0),
        }
    }

    pub async fn set_balance(&self, balance: Decimal) {
        *self.balance.write().await = balance;
    }

    /// Delay applied before every answer
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of balance requests served or refused so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainDataProvider for SimulatedChain {
    async fn get_balance(
        &self,
        _address: &str,
        _timeout: Duration,
    ) -> std::result::Result<Decimal, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ProviderError::Connection("simulated outage".to_string()));
        }
        Ok(*self.balance.read().await)
    }
}
