//! Balance Oracle
//!
//! Reconciles the treasury balance against an unreliable chain data provider.
//! Every read is time-bounded and never fails: a provider problem degrades to
//! the last good live value (`Cached`) or to the configured fallback
//! (`Simulated`).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ChainDataProvider;
use crate::config::TreasuryConfig;
use crate::domain::TreasuryState;
use crate::error::ProviderError;

pub struct BalanceOracle {
    provider: Arc<dyn ChainDataProvider>,
    config: TreasuryConfig,
    /// Last good live reading per (lowercased) address
    cache: DashMap<String, TreasuryState>,
}

impl BalanceOracle {
    pub fn new(provider: Arc<dyn ChainDataProvider>, config: TreasuryConfig) -> Self {
        Self {
            provider,
            config,
            cache: DashMap::new(),
        }
    }

    /// Configured treasury address
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Balance of the configured treasury address
    pub async fn treasury(&self) -> TreasuryState {
        let address = self.config.address.clone();
        self.get_balance(&address).await
    }

    /// Balance of `address`: live if the provider answers in time, otherwise
    /// cached, otherwise the fallback constant
    pub async fn get_balance(&self, address: &str) -> TreasuryState {
        let timeout = self.config.fetch_timeout();

        match self.fetch_live(address, timeout).await {
            Ok(balance) => {
                let state = TreasuryState::live(address, balance);
                self.store_live(&state);
                debug!("Live balance for {}: {}", address, balance);
                state
            }
            Err(e) => match self.cached(address) {
                Some(cached) => {
                    warn!(
                        "Balance fetch for {} failed ({}); serving cached value {} observed at {}",
                        address, e, cached.balance, cached.observed_at
                    );
                    cached
                }
                None => {
                    warn!(
                        "Balance fetch for {} failed ({}); no cached value, using fallback {}",
                        address, e, self.config.fallback_balance
                    );
                    TreasuryState::simulated(address, self.config.fallback_balance)
                }
            },
        }
    }

    async fn fetch_live(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<rust_decimal::Decimal, ProviderError> {
        let balance = tokio::time::timeout(timeout, self.provider.get_balance(address, timeout))
            .await
            .map_err(|_| ProviderError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            })??;

        if balance.is_sign_negative() {
            return Err(ProviderError::Malformed(format!(
                "negative balance {}",
                balance
            )));
        }
        Ok(balance)
    }

    /// Last good live reading, relabeled `Cached`
    pub fn cached(&self, address: &str) -> Option<TreasuryState> {
        self.cache
            .get(&cache_key(address))
            .map(|entry| entry.value().as_cached())
    }

    // Concurrent fetches may finish out of order; keep the newest observation.
    fn store_live(&self, state: &TreasuryState) {
        self.cache
            .entry(cache_key(&state.address))
            .and_modify(|current| {
                if state.observed_at >= current.observed_at {
                    *current = state.clone();
                }
            })
            .or_insert_with(|| state.clone());
    }
}

fn cache_key(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BalanceSource;
    use crate::oracle::provider::MockChainDataProvider;
    use crate::oracle::SimulatedChain;
    use rust_decimal_macros::dec;

    const ADDRESS: &str = "0x16B3d93d02FB58f7aCe79157E74Eb275D2c3F734";

    fn config(timeout_ms: u64) -> TreasuryConfig {
        TreasuryConfig {
            fetch_timeout_ms: timeout_ms,
            ..TreasuryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_live_read_updates_cache() {
        let mut provider = MockChainDataProvider::new();
        provider
            .expect_get_balance()
            .withf(|address, _| address == ADDRESS)
            .times(1)
            .returning(|_, _| Ok(dec!(2.5)));

        let oracle = BalanceOracle::new(Arc::new(provider), config(1_000));
        let state = oracle.treasury().await;

        assert_eq!(state.source, BalanceSource::Live);
        assert_eq!(state.balance, dec!(2.5));
        let cached = oracle.cached(ADDRESS).unwrap();
        assert_eq!(cached.balance, dec!(2.5));
        assert_eq!(cached.observed_at, state.observed_at);
    }

    #[tokio::test]
    async fn test_failure_without_cache_is_simulated() {
        let mut provider = MockChainDataProvider::new();
        provider
            .expect_get_balance()
            .returning(|_, _| Err(ProviderError::Connection("refused".into())));

        let oracle = BalanceOracle::new(Arc::new(provider), config(1_000));
        let state = oracle.treasury().await;

        assert_eq!(state.source, BalanceSource::Simulated);
        assert_eq!(state.balance, dec!(0.0012));
        assert!(oracle.cached(ADDRESS).is_none());
    }

    #[tokio::test]
    async fn test_failure_after_live_read_is_cached() {
        let mut provider = MockChainDataProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_get_balance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(dec!(0.75)));
        provider
            .expect_get_balance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(ProviderError::Malformed("garbage".into())));

        let oracle = BalanceOracle::new(Arc::new(provider), config(1_000));
        let live = oracle.treasury().await;
        let degraded = oracle.treasury().await;

        assert_eq!(degraded.source, BalanceSource::Cached);
        assert_eq!(degraded.balance, dec!(0.75));
        assert_eq!(degraded.observed_at, live.observed_at);
    }

    #[tokio::test]
    async fn test_slow_provider_is_cut_off_by_timeout() {
        let chain = Arc::new(SimulatedChain::new(dec!(3)));
        let oracle = BalanceOracle::new(chain.clone(), config(50));

        assert_eq!(oracle.treasury().await.source, BalanceSource::Live);

        chain.set_latency(Duration::from_secs(30)).await;
        let started = std::time::Instant::now();
        let state = oracle.treasury().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(state.source, BalanceSource::Cached);
        assert_eq!(state.balance, dec!(3));
    }

    #[tokio::test]
    async fn test_negative_balance_is_rejected() {
        let chain = Arc::new(SimulatedChain::new(dec!(-1)));
        let oracle = BalanceOracle::new(chain, config(1_000));
        assert_eq!(oracle.treasury().await.source, BalanceSource::Simulated);
    }

    #[tokio::test]
    async fn test_cache_is_keyed_case_insensitively() {
        let chain = Arc::new(SimulatedChain::new(dec!(1)));
        let oracle = BalanceOracle::new(chain.clone(), config(1_000));
        oracle.get_balance(ADDRESS).await;

        chain.set_reachable(false);
        let state = oracle.get_balance(&ADDRESS.to_lowercase()).await;
        assert_eq!(state.source, BalanceSource::Cached);
    }

    #[tokio::test]
    async fn test_concurrent_reads_keep_newest_observation() {
        let chain = Arc::new(SimulatedChain::new(dec!(1)));
        let oracle = Arc::new(BalanceOracle::new(chain.clone(), config(1_000)));

        let reads: Vec<_> = (0..16)
            .map(|_| {
                let oracle = oracle.clone();
                tokio::spawn(async move { oracle.treasury().await })
            })
            .collect();

        let mut newest = None;
        for read in reads {
            let state = read.await.unwrap();
            assert_eq!(state.source, BalanceSource::Live);
            newest = newest.max(Some(state.observed_at));
        }

        assert_eq!(oracle.cached(ADDRESS).unwrap().observed_at, newest.unwrap());
        assert_eq!(chain.fetch_count(), 16);
    }
}
