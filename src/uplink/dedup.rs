//! Frame deduplication.
//!
//! Several gateways in range of one device each forward the same frame;
//! the pipeline must process it exactly once per window. Keys embed the
//! frame identity (Join: DevEUI + DevNonce, data: DevAddr + FCnt + MIC)
//! so distinct frames never collide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Sweep interval for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// TTL map of recently seen frame keys.
#[derive(Clone, Default)]
pub struct DedupCache {
    inner: Arc<RwLock<HashMap<String, Instant>>>,
}

impl DedupCache {
    pub fn new() -> Self {
        DedupCache::default()
    }

    pub fn join_key(dev_eui: &crate::lorawan::keys::Eui64, dev_nonce: u16) -> String {
        format!("join_{dev_eui}_{dev_nonce}")
    }

    pub fn data_key(
        dev_addr: &crate::lorawan::keys::DevAddr,
        fcnt: u16,
        mic: &crate::lorawan::keys::Mic,
    ) -> String {
        format!("up_{dev_addr}_{fcnt}_{mic}")
    }

    /// Returns true when the key was not present (first sighting) and
    /// records it with the given TTL. A key seen within its TTL returns
    /// false and keeps its original expiry.
    pub async fn check_and_insert(&self, key: String, ttl: Duration) -> bool {
        let mut map = self.inner.write().await;
        let now = Instant::now();
        if let Some(expires) = map.get(&key) {
            if *expires > now {
                return false;
            }
        }
        map.insert(key, now + ttl);
        true
    }

    pub async fn sweep(&self) {
        let mut map = self.inner.write().await;
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, expires| *expires > now);
        let swept = before - map.len();
        if swept > 0 {
            debug!("swept {swept} expired dedup entries");
        }
    }

    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.sweep().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_within_window_rejected() {
        let cache = DedupCache::new();
        let ttl = Duration::from_secs(30);
        assert!(cache.check_and_insert("up_x_1_aa".into(), ttl).await);
        assert!(!cache.check_and_insert("up_x_1_aa".into(), ttl).await);
        // A different frame key is independent.
        assert!(cache.check_and_insert("up_x_2_bb".into(), ttl).await);
    }

    #[tokio::test]
    async fn test_expired_key_accepted_again() {
        let cache = DedupCache::new();
        let ttl = Duration::from_millis(20);
        assert!(cache.check_and_insert("join_e_1".into(), ttl).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.check_and_insert("join_e_1".into(), ttl).await);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_only() {
        let cache = DedupCache::new();
        cache
            .check_and_insert("old".into(), Duration::from_millis(10))
            .await;
        cache
            .check_and_insert("fresh".into(), Duration::from_secs(60))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.sweep().await;
        let map = cache.inner.read().await;
        assert!(!map.contains_key("old"));
        assert!(map.contains_key("fresh"));
    }
}
