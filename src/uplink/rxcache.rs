//! Per-device reception cache.
//!
//! The scheduler needs the RF parameters and gateway of a device's last
//! uplink to aim RX1 at it. Entries outlive the receive windows by a wide
//! margin (5 min TTL) so Class-A queue flushes triggered by the next
//! uplink still find them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::gateway::protocol::Rxpk;
use crate::lorawan::keys::Eui64;

const ENTRY_TTL: Duration = Duration::from_secs(300);

/// Last reception for one device.
#[derive(Debug, Clone)]
pub struct DeviceRxInfo {
    pub gateway_id: String,
    pub rxpk: Rxpk,
    /// Opaque uplink context from the bridge.
    pub context: Option<String>,
    pub received_at: Instant,
}

#[derive(Clone, Default)]
pub struct DeviceRxCache {
    inner: Arc<RwLock<HashMap<Eui64, DeviceRxInfo>>>,
}

impl DeviceRxCache {
    pub fn new() -> Self {
        DeviceRxCache::default()
    }

    pub async fn insert(
        &self,
        dev_eui: Eui64,
        gateway_id: String,
        rxpk: Rxpk,
        context: Option<String>,
    ) {
        self.inner.write().await.insert(
            dev_eui,
            DeviceRxInfo {
                gateway_id,
                rxpk,
                context,
                received_at: Instant::now(),
            },
        );
    }

    /// Merge a duplicate reception from another gateway: the entry with
    /// the best SNR wins, so RX1 is aimed at the gateway most likely to
    /// reach the device.
    pub async fn merge_duplicate(
        &self,
        dev_eui: Eui64,
        gateway_id: String,
        rxpk: Rxpk,
        context: Option<String>,
    ) {
        let mut map = self.inner.write().await;
        match map.get(&dev_eui) {
            Some(existing)
                if existing.rxpk.lsnr.unwrap_or(f64::MIN)
                    >= rxpk.lsnr.unwrap_or(f64::MIN) => {}
            _ => {
                map.insert(
                    dev_eui,
                    DeviceRxInfo {
                        gateway_id,
                        rxpk,
                        context,
                        received_at: Instant::now(),
                    },
                );
            }
        }
    }

    pub async fn get(&self, dev_eui: Eui64) -> Option<DeviceRxInfo> {
        let map = self.inner.read().await;
        let entry = map.get(&dev_eui)?;
        if entry.received_at.elapsed() > ENTRY_TTL {
            return None;
        }
        Some(entry.clone())
    }
}
