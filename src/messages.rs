//! Bus message payloads and subject helpers.
//!
//! Every subject in the system carries one of these JSON shapes. Binary
//! payload fields are base64 strings so the messages stay printable on
//! any broker.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::NsError;
use crate::gateway::protocol::{Rxpk, Stat, Txpk, TxpkAck};
use crate::lorawan::keys::{DevAddr, Eui64};

pub fn gateway_rx_subject(gateway_id: &str) -> String {
    format!("gateway.{gateway_id}.rx")
}

pub fn gateway_stat_subject(gateway_id: &str) -> String {
    format!("gateway.{gateway_id}.stat")
}

pub fn gateway_tx_subject(gateway_id: &str) -> String {
    format!("gateway.{gateway_id}.tx")
}

pub fn gateway_txack_subject(gateway_id: &str) -> String {
    format!("gateway.{gateway_id}.txack")
}

pub fn device_tx_subject(dev_eui: Eui64) -> String {
    format!("ns.device.{dev_eui}.tx")
}

pub fn application_rx_subject(application_id: &str, dev_eui: Eui64) -> String {
    format!("application.{application_id}.device.{dev_eui}.rx")
}

pub fn application_join_subject(application_id: &str, dev_eui: Eui64) -> String {
    format!("application.{application_id}.device.{dev_eui}.join")
}

pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(input: &str) -> Result<Vec<u8>, NsError> {
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| NsError::MalformedFrame(format!("base64 decode error: {e}")))
}

/// The opaque uplink context carried alongside an rxpk so a later
/// downlink can address the same gateway timestamp domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkContext {
    pub gateway_id: String,
    pub tmst: f64,
}

impl UplinkContext {
    pub fn encode(&self) -> String {
        base64_encode(serde_json::to_string(self).expect("context is serializable").as_bytes())
    }

    pub fn decode(encoded: &str) -> Result<Self, NsError> {
        let raw = base64_decode(encoded)?;
        serde_json::from_slice(&raw)
            .map_err(|e| NsError::MalformedFrame(format!("invalid uplink context: {e}")))
    }
}

/// `gateway.<id>.rx`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRxMessage {
    #[serde(rename = "gatewayID")]
    pub gateway_id: String,
    pub rxpk: Rxpk,
    /// Base64 JSON `UplinkContext`.
    pub context: String,
    /// Wall-clock reception time, Unix seconds.
    pub timestamp: i64,
}

/// `gateway.<id>.stat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatMessage {
    #[serde(rename = "gatewayID")]
    pub gateway_id: String,
    pub stat: Stat,
    pub timestamp: i64,
}

/// How a downlink transmission is timed at the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxTiming {
    /// Transmit at the tmst carried in the txpk.
    Timed,
    /// Transmit as soon as the packet reaches the concentrator.
    Immediate,
}

/// `gateway.<id>.tx`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTxMessage {
    #[serde(rename = "gatewayID")]
    pub gateway_id: String,
    pub txpk: Txpk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TxTiming>,
}

/// `gateway.<id>.txack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayTxAckMessage {
    #[serde(rename = "gatewayID")]
    pub gateway_id: String,
    pub token: u16,
    pub ack: TxpkAck,
}

/// `ns.device.<devEUI>.tx` — an application downlink request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTxRequest {
    #[serde(rename = "devEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "fPort")]
    pub f_port: u8,
    /// Base64 application payload.
    pub data: String,
    pub confirmed: bool,
    #[serde(default)]
    pub id: Option<String>,
}

/// Per-gateway reception metadata attached to application uplink events
/// and the frame archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxInfo {
    #[serde(rename = "gatewayID")]
    pub gateway_id: String,
    pub rssi: f64,
    #[serde(rename = "loRaSNR")]
    pub lora_snr: Option<f64>,
    /// Frequency in Hz.
    pub frequency: u32,
    pub tmst: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// `application.<appID>.device.<devEUI>.rx`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRxEvent {
    #[serde(rename = "applicationID")]
    pub application_id: String,
    #[serde(rename = "devEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "devAddr")]
    pub dev_addr: DevAddr,
    #[serde(rename = "fCnt")]
    pub f_cnt: u32,
    #[serde(rename = "fPort")]
    pub f_port: u8,
    /// Base64 decrypted application payload.
    pub data: String,
    #[serde(rename = "rxInfo")]
    pub rx_info: Vec<RxInfo>,
    pub adr: bool,
}

/// `application.<appID>.device.<devEUI>.join`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationJoinEvent {
    #[serde(rename = "applicationID")]
    pub application_id: String,
    #[serde(rename = "devEUI")]
    pub dev_eui: Eui64,
    #[serde(rename = "devAddr")]
    pub dev_addr: DevAddr,
}
