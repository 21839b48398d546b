//! Per-gateway timestamp reliability tracking.
//!
//! Gateways expose a 32-bit microsecond counter (`tmst`) that resets on
//! reboot and drifts on cheap hardware. The scheduler must not aim a
//! downlink at a counter value the concentrator will never reach, so each
//! accepted uplink feeds this tracker and the scheduler asks it whether
//! timed transmission is trustworthy before using tmst arithmetic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Observations required before a counter is trusted.
const WARMUP_OBSERVATIONS: u32 = 3;
/// Maximum tolerated |tmst delta − wall-clock delta| per observation.
const MAX_DRIFT_US: i64 = 500_000;
/// A backward counter step larger than this means the gateway rebooted.
const BACKWARD_RESET_US: i64 = -10_000_000;
/// Entries idle longer than this are evicted.
const ENTRY_MAX_AGE: Duration = Duration::from_secs(600);
/// Eviction sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct TimestampInfo {
    last_uplink: u64,
    last_uplink_time: Instant,
    warmup_count: u32,
    is_reliable: bool,
    reset_count: u32,
    timestamp_drift: i64,
}

/// Shared tracker map, one entry per gateway.
#[derive(Clone, Default)]
pub struct TimestampTracker {
    inner: Arc<RwLock<HashMap<String, TimestampInfo>>>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        TimestampTracker::default()
    }

    /// Record an observation and report whether the gateway's counter is
    /// currently reliable. `is_join_accept` marks uplinks that will be
    /// answered with a Join-Accept, where a timed attempt is always made.
    pub async fn update_and_check(
        &self,
        gateway_id: &str,
        tmst: u64,
        is_join_accept: bool,
    ) -> bool {
        self.update_at(gateway_id, tmst, is_join_accept, Instant::now())
            .await
    }

    async fn update_at(
        &self,
        gateway_id: &str,
        tmst: u64,
        is_join_accept: bool,
        now: Instant,
    ) -> bool {
        let mut map = self.inner.write().await;

        if is_join_accept {
            let entry = map.entry(gateway_id.to_string()).or_insert(TimestampInfo {
                last_uplink: tmst,
                last_uplink_time: now,
                warmup_count: WARMUP_OBSERVATIONS,
                is_reliable: true,
                reset_count: 0,
                timestamp_drift: 0,
            });
            entry.last_uplink = tmst;
            entry.last_uplink_time = now;
            entry.is_reliable = true;
            return true;
        }

        let entry = match map.get_mut(gateway_id) {
            Some(entry) => entry,
            None => {
                map.insert(
                    gateway_id.to_string(),
                    TimestampInfo {
                        last_uplink: tmst,
                        last_uplink_time: now,
                        warmup_count: 1,
                        is_reliable: false,
                        reset_count: 0,
                        timestamp_drift: 0,
                    },
                );
                debug!("gateway {gateway_id}: first tmst observation, warming up");
                return false;
            }
        };

        // Wrapping 32-bit difference, interpreted as signed: a forward
        // step across the wrap stays positive, a genuine backward step
        // goes negative.
        let tmst_delta = (tmst as u32).wrapping_sub(entry.last_uplink as u32) as i32 as i64;
        let wall_delta = now.duration_since(entry.last_uplink_time).as_micros() as i64;
        let drift = tmst_delta - wall_delta;

        entry.last_uplink = tmst;
        entry.last_uplink_time = now;
        entry.timestamp_drift = drift;

        if tmst_delta < BACKWARD_RESET_US {
            entry.is_reliable = false;
            entry.warmup_count = 1;
            entry.reset_count += 1;
            info!(
                "gateway {gateway_id}: counter stepped back {} ms (reset #{}), restarting warmup",
                -tmst_delta / 1000,
                entry.reset_count
            );
            return false;
        }

        if drift.abs() > MAX_DRIFT_US {
            if entry.is_reliable {
                warn!(
                    "gateway {gateway_id}: tmst drift {} ms exceeds limit, marking unreliable",
                    drift / 1000
                );
            }
            entry.is_reliable = false;
            entry.warmup_count = 1;
            return false;
        }

        entry.warmup_count += 1;
        if !entry.is_reliable && entry.warmup_count >= WARMUP_OBSERVATIONS {
            info!("gateway {gateway_id}: tmst counter marked reliable");
            entry.is_reliable = true;
        }
        entry.is_reliable
    }

    /// Whether the gateway's counter is currently trusted for timed TX.
    pub async fn is_reliable(&self, gateway_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(gateway_id)
            .map(|e| e.is_reliable)
            .unwrap_or(false)
    }

    /// Drop entries that have not seen an uplink recently.
    pub async fn evict_idle(&self) {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, e| e.last_uplink_time.elapsed() < ENTRY_MAX_AGE);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!("evicted {evicted} idle timestamp tracker entries");
        }
    }

    /// Background eviction loop; exits when `shutdown` flips.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tracker.evict_idle().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: &str = "0102030405060708";

    fn base() -> Instant {
        Instant::now()
    }

    #[tokio::test]
    async fn test_join_accept_is_always_reliable() {
        let tracker = TimestampTracker::new();
        assert!(tracker.update_and_check(GW, 1_000, true).await);
        assert!(tracker.is_reliable(GW).await);
    }

    #[tokio::test]
    async fn test_warmup_requires_three_consistent_observations() {
        let tracker = TimestampTracker::new();
        let t0 = base();

        // Counter and wall clock advance in lockstep, 1 s per step.
        assert!(!tracker.update_at(GW, 1_000_000, false, t0).await);
        assert!(
            !tracker
                .update_at(GW, 2_000_000, false, t0 + Duration::from_secs(1))
                .await
        );
        assert!(
            tracker
                .update_at(GW, 3_000_000, false, t0 + Duration::from_secs(2))
                .await
        );
        assert!(tracker.is_reliable(GW).await);
    }

    #[tokio::test]
    async fn test_drift_marks_unreliable() {
        let tracker = TimestampTracker::new();
        let t0 = base();
        tracker.update_at(GW, 1_000_000, false, t0).await;
        tracker
            .update_at(GW, 2_000_000, false, t0 + Duration::from_secs(1))
            .await;
        tracker
            .update_at(GW, 3_000_000, false, t0 + Duration::from_secs(2))
            .await;
        assert!(tracker.is_reliable(GW).await);

        // Counter advances 1 s but 2 s of wall clock pass: 1 s drift.
        assert!(
            !tracker
                .update_at(GW, 4_000_000, false, t0 + Duration::from_secs(4))
                .await
        );
        assert!(!tracker.is_reliable(GW).await);
    }

    #[tokio::test]
    async fn test_backward_step_resets_warmup() {
        let tracker = TimestampTracker::new();
        let t0 = base();
        tracker.update_at(GW, 100_000_000, false, t0).await;
        tracker
            .update_at(GW, 101_000_000, false, t0 + Duration::from_secs(1))
            .await;
        tracker
            .update_at(GW, 102_000_000, false, t0 + Duration::from_secs(2))
            .await;
        assert!(tracker.is_reliable(GW).await);

        // Gateway rebooted: counter restarts near zero.
        assert!(
            !tracker
                .update_at(GW, 500_000, false, t0 + Duration::from_secs(3))
                .await
        );
        assert!(!tracker.is_reliable(GW).await);

        // Warmup starts over and reliability returns after three
        // consistent deltas.
        tracker
            .update_at(GW, 1_500_000, false, t0 + Duration::from_secs(4))
            .await;
        assert!(
            tracker
                .update_at(GW, 2_500_000, false, t0 + Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn test_wrap_around_is_a_forward_step() {
        let tracker = TimestampTracker::new();
        let t0 = base();
        let near_wrap = u32::MAX as u64 - 500_000;
        tracker.update_at(GW, near_wrap, false, t0).await;
        tracker
            .update_at(GW, near_wrap + 1_000_000 / 2, false, t0 + Duration::from_millis(500))
            .await;
        // Crosses the 2^32 boundary: still a clean forward step.
        let wrapped = (near_wrap + 1_500_000) % (1 << 32);
        assert!(
            tracker
                .update_at(GW, wrapped, false, t0 + Duration::from_millis(1500))
                .await
        );
    }

    #[tokio::test]
    async fn test_eviction() {
        let tracker = TimestampTracker::new();
        tracker.update_and_check(GW, 1_000, false).await;
        tracker.evict_idle().await;
        // Fresh entry survives.
        assert_eq!(tracker.inner.read().await.len(), 1);
    }
}
