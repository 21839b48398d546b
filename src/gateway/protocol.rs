//! Semtech UDP Packet Forwarder protocol codec.
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Datagram = Version(1) | Token(2, big-endian) | Identifier(1) |
//! [GatewayMAC(8)] | [JSON]. The token is opaque to us except that a
//! PULL_RESP must carry the bytes captured from the gateway's last
//! PULL_DATA, so the builders below take raw token bytes.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::NsError;

/// Protocol version (always 0x02).
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Packet types (identifier byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = NsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(NsError::MalformedFrame(format!(
                "unknown packet type: 0x{value:02x}"
            ))),
        }
    }
}

/// Gateway identifier (EUI-64, 8 bytes).
pub type GatewayMac = [u8; 8];

/// A datagram the server can receive from a gateway.
#[derive(Debug)]
pub enum GwmpPacket {
    PushData {
        token: [u8; 2],
        gateway_mac: GatewayMac,
        json_payload: String,
    },
    PullData {
        token: [u8; 2],
        gateway_mac: GatewayMac,
    },
    TxAck {
        token: [u8; 2],
        gateway_mac: GatewayMac,
        json_payload: Option<String>,
    },
}

/// The concentrator counter arrives as a JSON number that some forwarders
/// emit as a float; read either encoding as u64.
mod tmst_num {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(*v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let f = f64::deserialize(d)?;
        Ok(f as u64)
    }
}

/// Received packet metadata + payload (one entry of a PUSH_DATA `rxpk`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of reception, ISO 8601.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Concentrator counter at reception, microseconds (32-bit, wraps).
    #[serde(with = "tmst_num")]
    pub tmst: u64,
    /// GPS time, milliseconds since the GPS epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Concentrator IF channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chan: Option<u8>,
    /// RF chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u8>,
    /// Frequency in MHz.
    pub freq: f64,
    /// CRC status: 1 OK, -1 fail, 0 absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<i8>,
    /// Modulation, LORA or FSK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    /// Datarate identifier, e.g. "SF7BW125".
    pub datr: String,
    /// Coding rate, e.g. "4/5".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// RSSI in dBm.
    pub rssi: f64,
    /// LoRa signal-to-noise ratio, dB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    /// Payload size in bytes.
    pub size: u16,
    /// Base64 PHY payload.
    pub data: String,
}

/// Downlink TX request (the `txpk` of a PULL_RESP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    /// Concentrator counter value to transmit at, microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u64>,
    pub freq: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powe: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ant: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brd: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    pub datr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// Inverted polarity (true for LoRaWAN downlinks).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    pub size: u16,
    /// Base64 PHY payload.
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

/// Gateway status report (the `stat` of a PUSH_DATA).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alti: Option<f64>,
    /// Radio packets received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxnb: Option<u32>,
    /// Radio packets received with a valid CRC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxok: Option<u32>,
    /// Radio packets forwarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxfw: Option<u32>,
    /// Upstream datagram acknowledgement ratio, percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ackr: Option<f64>,
    /// Downlink datagrams received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwnb: Option<u32>,
    /// Packets emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txnb: Option<u32>,
}

/// PUSH_DATA JSON wrapper.
#[derive(Debug, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<Stat>,
}

/// PULL_RESP JSON wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

/// TX_ACK JSON wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAckPayload {
    pub txpk_ack: Option<TxpkAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxpkAck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GwmpPacket {
    /// Parse a raw UDP datagram into one of the gateway-originated packet
    /// types.
    pub fn parse(data: &[u8]) -> Result<Self, NsError> {
        if data.len() < 4 {
            return Err(NsError::MalformedFrame(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(NsError::MalformedFrame(format!(
                "unsupported protocol version: 0x{version:02x}"
            )));
        }

        let mut token = [0u8; 2];
        buf.copy_to_slice(&mut token);
        let packet_type = PacketType::try_from(buf.get_u8())?;

        fn take_mac(buf: &mut &[u8], packet_type: PacketType) -> Result<GatewayMac, NsError> {
            if buf.remaining() < 8 {
                return Err(NsError::MalformedFrame(format!(
                    "{packet_type:?} too short for gateway MAC"
                )));
            }
            let mut mac = [0u8; 8];
            buf.copy_to_slice(&mut mac);
            Ok(mac)
        }

        match packet_type {
            PacketType::PushData => {
                let gateway_mac = take_mac(&mut buf, packet_type)?;
                let json_payload = String::from_utf8(buf.to_vec()).map_err(|e| {
                    NsError::MalformedFrame(format!("invalid UTF-8 in JSON payload: {e}"))
                })?;
                Ok(GwmpPacket::PushData {
                    token,
                    gateway_mac,
                    json_payload,
                })
            }
            PacketType::PullData => {
                let gateway_mac = take_mac(&mut buf, packet_type)?;
                Ok(GwmpPacket::PullData { token, gateway_mac })
            }
            PacketType::TxAck => {
                let gateway_mac = take_mac(&mut buf, packet_type)?;
                let json_payload = if buf.has_remaining() {
                    Some(String::from_utf8(buf.to_vec()).map_err(|e| {
                        NsError::MalformedFrame(format!("invalid UTF-8 in TX_ACK: {e}"))
                    })?)
                } else {
                    None
                };
                Ok(GwmpPacket::TxAck {
                    token,
                    gateway_mac,
                    json_payload,
                })
            }
            other => Err(NsError::MalformedFrame(format!(
                "unexpected {other:?} from gateway"
            ))),
        }
    }

    /// Build a PUSH_ACK response.
    pub fn push_ack(token: [u8; 2]) -> Vec<u8> {
        Self::ack(token, PacketType::PushAck)
    }

    /// Build a PULL_ACK response.
    pub fn pull_ack(token: [u8; 2]) -> Vec<u8> {
        Self::ack(token, PacketType::PullAck)
    }

    fn ack(token: [u8; 2], packet_type: PacketType) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(&token);
        buf.put_u8(packet_type as u8);
        buf.to_vec()
    }

    /// Build a PULL_RESP. The token bytes must be the ones captured from
    /// the gateway's last PULL_DATA.
    pub fn pull_resp(token: [u8; 2], txpk_json: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + txpk_json.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_slice(&token);
        buf.put_u8(PacketType::PullResp as u8);
        buf.put_slice(txpk_json.as_bytes());
        buf.to_vec()
    }
}
