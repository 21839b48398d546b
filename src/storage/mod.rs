//! Persistence models and the repository seam.
//!
//! The core treats the store as an opaque repository: everything it needs
//! is on the `Store` trait. `MemoryStore` backs the binary in standalone
//! mode and every test; a relational adapter implements the same trait
//! out of tree.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NsError;
use crate::lorawan::keys::{Aes128Key, DevAddr, Eui64};
use crate::messages::RxInfo;

pub use memory::MemoryStore;

/// Administrative device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub dev_eui: Eui64,
    pub join_eui: Eui64,
    pub dev_addr: Option<DevAddr>,
    pub application_id: String,
    pub device_profile_id: String,
    pub f_cnt_up: u32,
    pub n_f_cnt_down: u32,
    pub a_f_cnt_down: u32,
    pub is_disabled: bool,
    /// Last reported battery level (255 = unknown, 0 = external power).
    pub battery: Option<u8>,
    /// Last reported demodulation margin, dB.
    pub margin: Option<i8>,
}

/// OTAA root keys, one row per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub dev_eui: Eui64,
    pub app_key: Aes128Key,
    pub nwk_key: Aes128Key,
}

/// One ADR measurement, kept in a bounded ring on the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdrHistoryEntry {
    pub f_cnt: u32,
    pub max_snr: f64,
    pub tx_power: u8,
    pub gateway_count: usize,
}

/// Post-activation device state. At most one session exists per DevEUI;
/// the DevAddr index may collide across devices until the MIC check
/// disambiguates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub dev_eui: Eui64,
    pub dev_addr: DevAddr,
    pub join_eui: Eui64,
    pub app_s_key: Aes128Key,
    pub f_nwk_s_int_key: Aes128Key,
    pub s_nwk_s_int_key: Aes128Key,
    pub nwk_s_enc_key: Aes128Key,
    pub f_cnt_up: u32,
    pub n_f_cnt_down: u32,
    pub a_f_cnt_down: u32,
    pub conf_f_cnt: u32,
    /// RX1 delay in seconds.
    pub rx1_delay: u8,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_freq: u32,
    /// Current uplink data rate.
    pub dr: u8,
    /// Current TX-power index (higher index = lower power).
    pub tx_power: u8,
    pub adr: bool,
    pub enabled_channels: Vec<usize>,
    pub adr_history: Vec<AdrHistoryEntry>,
}

impl DeviceSession {
    /// Append an ADR measurement, dropping the oldest past `cap`.
    pub fn push_adr_history(&mut self, entry: AdrHistoryEntry, cap: usize) {
        self.adr_history.push(entry);
        if self.adr_history.len() > cap {
            let excess = self.adr_history.len() - cap;
            self.adr_history.drain(..excess);
        }
    }
}

/// A queued application downlink, FIFO per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDownlink {
    pub id: u64,
    pub dev_eui: Eui64,
    pub application_id: String,
    pub f_port: u8,
    pub data: Vec<u8>,
    pub confirmed: bool,
    /// True once the payload has been handed to a gateway and awaits
    /// a TX acknowledgement.
    pub is_pending: bool,
    pub retry_count: u32,
    pub reference: String,
}

/// Archived uplink frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkFrameRecord {
    pub dev_eui: Eui64,
    pub phy_payload: Vec<u8>,
    pub f_cnt: u32,
    pub f_port: Option<u8>,
    pub dr: u8,
    pub adr: bool,
    /// Decrypted application payload.
    pub data: Vec<u8>,
    pub rx_info: Vec<RxInfo>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Join,
    Uplink,
    DownlinkQueued,
    DownlinkAck,
    Error,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub kind: EventKind,
    pub dev_eui: Option<Eui64>,
    pub gateway_id: Option<String>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn now(kind: EventKind, dev_eui: Option<Eui64>, detail: impl Into<String>) -> Self {
        EventLogEntry {
            kind,
            dev_eui,
            gateway_id: None,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Registered gateway row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// The repository interface consumed by the core.
#[async_trait]
pub trait Store: Send + Sync {
    async fn device_keys_get(&self, dev_eui: Eui64) -> Result<Option<DeviceKeys>, NsError>;
    async fn device_keys_set(&self, keys: DeviceKeys) -> Result<(), NsError>;
    async fn device_keys_delete(&self, dev_eui: Eui64) -> Result<(), NsError>;

    async fn device_get(&self, dev_eui: Eui64) -> Result<Option<Device>, NsError>;
    async fn device_update(&self, device: Device) -> Result<(), NsError>;

    async fn device_session_get(&self, dev_eui: Eui64) -> Result<Option<DeviceSession>, NsError>;
    async fn device_session_save(&self, session: DeviceSession) -> Result<(), NsError>;
    async fn device_session_delete(&self, dev_eui: Eui64) -> Result<(), NsError>;
    /// All sessions currently holding a DevAddr. Multiple devices can
    /// share one until a Join collision is resolved by the MIC check.
    async fn device_sessions_by_dev_addr(
        &self,
        dev_addr: DevAddr,
    ) -> Result<Vec<DeviceSession>, NsError>;

    /// Enqueue a downlink; returns its assigned id.
    async fn pending_downlink_create(&self, item: PendingDownlink) -> Result<u64, NsError>;
    /// Oldest queued downlink for the device, if any.
    async fn pending_downlink_next(
        &self,
        dev_eui: Eui64,
    ) -> Result<Option<PendingDownlink>, NsError>;
    async fn pending_downlink_update(&self, item: PendingDownlink) -> Result<(), NsError>;
    async fn pending_downlink_delete(&self, id: u64) -> Result<(), NsError>;

    async fn uplink_frame_insert(&self, frame: UplinkFrameRecord) -> Result<(), NsError>;
    async fn event_log_insert(&self, entry: EventLogEntry) -> Result<(), NsError>;

    /// Auto-register a gateway on first contact and refresh its
    /// last-seen timestamp.
    async fn gateway_ensure(&self, gateway_id: &str) -> Result<(), NsError>;

    async fn device_gateway_set(&self, dev_eui: Eui64, gateway_id: &str) -> Result<(), NsError>;
    /// The gateway that last received an uplink from the device.
    async fn last_gateway_for_device(&self, dev_eui: Eui64) -> Result<Option<String>, NsError>;
}
