//! Replacement-proxy selection
//!
//! Selection draws uniformly from the full configured roster, including
//! proxies that already have a running worker — duplicate in-flight proxies
//! are an accepted property of the replacement policy.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::error::{FarmError, Result};
use crate::models::ProxyEndpoint;

/// Trait for proxy selection strategies
#[async_trait]
pub trait ProxySelector: Send + Sync {
    /// Select a proxy from the configured roster
    ///
    /// Returns an error if no proxies are available
    async fn select(&self) -> Result<Arc<ProxyEndpoint>>;

    /// Replace the internal roster
    async fn refresh(&self, proxies: Vec<ProxyEndpoint>) -> Result<()>;

    /// Get the number of configured proxies
    fn available_count(&self) -> usize;

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Selects a uniformly random proxy from the roster
pub struct RandomSelector {
    proxies: RwLock<Vec<Arc<ProxyEndpoint>>>,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            proxies: RwLock::new(Vec::new()),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxySelector for RandomSelector {
    async fn select(&self) -> Result<Arc<ProxyEndpoint>> {
        let proxies = self.proxies.read();

        if proxies.is_empty() {
            return Err(FarmError::NoProxiesAvailable);
        }

        let mut rng = rand::thread_rng();
        proxies
            .choose(&mut rng)
            .cloned()
            .ok_or(FarmError::NoProxiesAvailable)
    }

    async fn refresh(&self, proxies: Vec<ProxyEndpoint>) -> Result<()> {
        let mut guard = self.proxies.write();
        *guard = proxies.into_iter().map(Arc::new).collect();
        Ok(())
    }

    fn available_count(&self) -> usize {
        self.proxies.read().len()
    }

    fn strategy_name(&self) -> &'static str {
        "random"
    }
}
