//! In-memory repository.
//!
//! Backs the binary when no relational store is wired in, and every test.
//! One lock over the whole state keeps the FIFO and index bookkeeping
//! trivially consistent; contention is not a concern at test scale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    Device, DeviceKeys, DeviceSession, EventLogEntry, GatewayRecord, PendingDownlink, Store,
    UplinkFrameRecord,
};
use crate::error::NsError;
use crate::lorawan::keys::{DevAddr, Eui64};

#[derive(Default)]
struct Inner {
    device_keys: HashMap<Eui64, DeviceKeys>,
    devices: HashMap<Eui64, Device>,
    sessions: HashMap<Eui64, DeviceSession>,
    /// Secondary index: DevAddr → sessions holding it.
    sessions_by_addr: HashMap<DevAddr, Vec<Eui64>>,
    pending: Vec<PendingDownlink>,
    next_pending_id: u64,
    uplink_frames: Vec<UplinkFrameRecord>,
    events: Vec<EventLogEntry>,
    gateways: HashMap<String, GatewayRecord>,
    device_gateways: HashMap<Eui64, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStore::default())
    }

    /// Test accessor: archived uplink frames.
    pub async fn uplink_frames(&self) -> Vec<UplinkFrameRecord> {
        self.inner.read().await.uplink_frames.clone()
    }

    /// Test accessor: audit log.
    pub async fn events(&self) -> Vec<EventLogEntry> {
        self.inner.read().await.events.clone()
    }

    /// Test accessor: registered gateways.
    pub async fn gateways(&self) -> Vec<GatewayRecord> {
        self.inner.read().await.gateways.values().cloned().collect()
    }

    pub async fn device_create(&self, device: Device) {
        self.inner.write().await.devices.insert(device.dev_eui, device);
    }
}

fn unindex_addr(inner: &mut Inner, dev_eui: Eui64) {
    if let Some(old) = inner.sessions.get(&dev_eui) {
        if let Some(euis) = inner.sessions_by_addr.get_mut(&old.dev_addr) {
            euis.retain(|e| *e != dev_eui);
            if euis.is_empty() {
                inner.sessions_by_addr.remove(&old.dev_addr);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn device_keys_get(&self, dev_eui: Eui64) -> Result<Option<DeviceKeys>, NsError> {
        Ok(self.inner.read().await.device_keys.get(&dev_eui).cloned())
    }

    async fn device_keys_set(&self, keys: DeviceKeys) -> Result<(), NsError> {
        self.inner.write().await.device_keys.insert(keys.dev_eui, keys);
        Ok(())
    }

    async fn device_keys_delete(&self, dev_eui: Eui64) -> Result<(), NsError> {
        self.inner.write().await.device_keys.remove(&dev_eui);
        Ok(())
    }

    async fn device_get(&self, dev_eui: Eui64) -> Result<Option<Device>, NsError> {
        Ok(self.inner.read().await.devices.get(&dev_eui).cloned())
    }

    async fn device_update(&self, device: Device) -> Result<(), NsError> {
        self.inner.write().await.devices.insert(device.dev_eui, device);
        Ok(())
    }

    async fn device_session_get(&self, dev_eui: Eui64) -> Result<Option<DeviceSession>, NsError> {
        Ok(self.inner.read().await.sessions.get(&dev_eui).cloned())
    }

    async fn device_session_save(&self, session: DeviceSession) -> Result<(), NsError> {
        let mut inner = self.inner.write().await;
        unindex_addr(&mut inner, session.dev_eui);
        inner
            .sessions_by_addr
            .entry(session.dev_addr)
            .or_default()
            .push(session.dev_eui);
        inner.sessions.insert(session.dev_eui, session);
        Ok(())
    }

    async fn device_session_delete(&self, dev_eui: Eui64) -> Result<(), NsError> {
        let mut inner = self.inner.write().await;
        unindex_addr(&mut inner, dev_eui);
        inner.sessions.remove(&dev_eui);
        Ok(())
    }

    async fn device_sessions_by_dev_addr(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Vec<DeviceSession>, NsError> {
        let inner = self.inner.read().await;
        let euis = inner.sessions_by_addr.get(&dev_addr);
        Ok(euis
            .map(|euis| {
                euis.iter()
                    .filter_map(|eui| inner.sessions.get(eui).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pending_downlink_create(&self, mut item: PendingDownlink) -> Result<u64, NsError> {
        let mut inner = self.inner.write().await;
        inner.next_pending_id += 1;
        item.id = inner.next_pending_id;
        let id = item.id;
        inner.pending.push(item);
        Ok(id)
    }

    async fn pending_downlink_next(
        &self,
        dev_eui: Eui64,
    ) -> Result<Option<PendingDownlink>, NsError> {
        // Insertion order doubles as FIFO order.
        Ok(self
            .inner
            .read()
            .await
            .pending
            .iter()
            .find(|p| p.dev_eui == dev_eui)
            .cloned())
    }

    async fn pending_downlink_update(&self, item: PendingDownlink) -> Result<(), NsError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.pending.iter_mut().find(|p| p.id == item.id) {
            *existing = item;
        }
        Ok(())
    }

    async fn pending_downlink_delete(&self, id: u64) -> Result<(), NsError> {
        self.inner.write().await.pending.retain(|p| p.id != id);
        Ok(())
    }

    async fn uplink_frame_insert(&self, frame: UplinkFrameRecord) -> Result<(), NsError> {
        self.inner.write().await.uplink_frames.push(frame);
        Ok(())
    }

    async fn event_log_insert(&self, entry: EventLogEntry) -> Result<(), NsError> {
        self.inner.write().await.events.push(entry);
        Ok(())
    }

    async fn gateway_ensure(&self, gateway_id: &str) -> Result<(), NsError> {
        let mut inner = self.inner.write().await;
        let now = chrono::Utc::now();
        inner
            .gateways
            .entry(gateway_id.to_string())
            .and_modify(|g| g.last_seen = now)
            .or_insert_with(|| GatewayRecord {
                gateway_id: gateway_id.to_string(),
                first_seen: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn device_gateway_set(&self, dev_eui: Eui64, gateway_id: &str) -> Result<(), NsError> {
        self.inner
            .write()
            .await
            .device_gateways
            .insert(dev_eui, gateway_id.to_string());
        Ok(())
    }

    async fn last_gateway_for_device(&self, dev_eui: Eui64) -> Result<Option<String>, NsError> {
        Ok(self.inner.read().await.device_gateways.get(&dev_eui).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::Aes128Key;

    fn session(dev_eui: &str, dev_addr: &str) -> DeviceSession {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        DeviceSession {
            dev_eui: dev_eui.parse().unwrap(),
            dev_addr: dev_addr.parse().unwrap(),
            join_eui: "0000000000000000".parse().unwrap(),
            app_s_key: key,
            f_nwk_s_int_key: key,
            s_nwk_s_int_key: key,
            nwk_s_enc_key: key,
            f_cnt_up: 0,
            n_f_cnt_down: 0,
            a_f_cnt_down: 0,
            conf_f_cnt: 0,
            rx1_delay: 5,
            rx1_dr_offset: 0,
            rx2_dr: 0,
            rx2_freq: 505_300_000,
            dr: 5,
            tx_power: 0,
            adr: true,
            enabled_channels: (0..8).collect(),
            adr_history: vec![],
        }
    }

    #[tokio::test]
    async fn test_session_dev_addr_index() {
        let store = MemoryStore::new();
        let addr: DevAddr = "01020304".parse().unwrap();

        // Two devices holding the same DevAddr.
        store
            .device_session_save(session("0000000000000001", "01020304"))
            .await
            .unwrap();
        store
            .device_session_save(session("0000000000000002", "01020304"))
            .await
            .unwrap();
        assert_eq!(store.device_sessions_by_dev_addr(addr).await.unwrap().len(), 2);

        // Re-join moves device 1 to a new address.
        store
            .device_session_save(session("0000000000000001", "0a0b0c0d"))
            .await
            .unwrap();
        let remaining = store.device_sessions_by_dev_addr(addr).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].dev_eui.to_string(), "0000000000000002");

        store
            .device_session_delete("0000000000000002".parse().unwrap())
            .await
            .unwrap();
        assert!(store.device_sessions_by_dev_addr(addr).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_downlink_fifo() {
        let store = MemoryStore::new();
        let dev_eui: Eui64 = "0102030405060708".parse().unwrap();
        let base = PendingDownlink {
            id: 0,
            dev_eui,
            application_id: "app".into(),
            f_port: 10,
            data: vec![1],
            confirmed: false,
            is_pending: false,
            retry_count: 0,
            reference: "a".into(),
        };

        let first = store.pending_downlink_create(base.clone()).await.unwrap();
        let mut second_item = base.clone();
        second_item.data = vec![2];
        store.pending_downlink_create(second_item).await.unwrap();

        let next = store.pending_downlink_next(dev_eui).await.unwrap().unwrap();
        assert_eq!(next.id, first);
        assert_eq!(next.data, vec![1]);

        store.pending_downlink_delete(first).await.unwrap();
        let next = store.pending_downlink_next(dev_eui).await.unwrap().unwrap();
        assert_eq!(next.data, vec![2]);
    }

    #[tokio::test]
    async fn test_gateway_auto_register() {
        let store = MemoryStore::new();
        store.gateway_ensure("aabbccddeeff0011").await.unwrap();
        store.gateway_ensure("aabbccddeeff0011").await.unwrap();
        assert_eq!(store.gateways().await.len(), 1);
    }

    #[test]
    fn test_adr_history_ring_is_bounded() {
        let mut s = session("0000000000000001", "01020304");
        for i in 0..25 {
            s.push_adr_history(
                super::super::AdrHistoryEntry {
                    f_cnt: i,
                    max_snr: 5.0,
                    tx_power: 0,
                    gateway_count: 1,
                },
                20,
            );
        }
        assert_eq!(s.adr_history.len(), 20);
        assert_eq!(s.adr_history.first().unwrap().f_cnt, 5);
        assert_eq!(s.adr_history.last().unwrap().f_cnt, 24);
    }
}
