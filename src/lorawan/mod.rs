//! LoRaWAN 1.0.x PHY payload codec.
//!
//! PHYPayload = MHDR(1) | MACPayload(N) | MIC(4). The message type in the
//! MHDR selects the MACPayload shape, so the decoded form is a sum type.
//! Parse and encode are exact inverses for every well-formed frame.
//!
//! All multi-byte LoRaWAN fields are little-endian; the codec owns that
//! discipline so call sites never byte-swap by hand.

pub mod keys;
pub mod maccommands;
pub mod security;

use std::fmt;

use crate::error::NsError;
use keys::{DevAddr, Eui64, Mic};

/// 3-bit message type from the MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Proprietary,
}

impl MType {
    pub fn value(&self) -> u8 {
        match self {
            MType::JoinRequest => 0,
            MType::JoinAccept => 1,
            MType::UnconfirmedDataUp => 2,
            MType::UnconfirmedDataDown => 3,
            MType::ConfirmedDataUp => 4,
            MType::ConfirmedDataDown => 5,
            MType::Proprietary => 7,
        }
    }

    /// Whether frames of this type travel device-to-network.
    pub fn is_uplink(&self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

impl TryFrom<u8> for MType {
    type Error = NsError;

    fn try_from(mhdr: u8) -> Result<Self, Self::Error> {
        match (mhdr >> 5) & 0x07 {
            0 => Ok(MType::JoinRequest),
            1 => Ok(MType::JoinAccept),
            2 => Ok(MType::UnconfirmedDataUp),
            3 => Ok(MType::UnconfirmedDataDown),
            4 => Ok(MType::ConfirmedDataUp),
            5 => Ok(MType::ConfirmedDataDown),
            7 => Ok(MType::Proprietary),
            v => Err(NsError::MalformedFrame(format!("reserved MType {v}"))),
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MType::JoinRequest => "JoinRequest",
            MType::JoinAccept => "JoinAccept",
            MType::UnconfirmedDataUp => "UnconfirmedDataUp",
            MType::UnconfirmedDataDown => "UnconfirmedDataDown",
            MType::ConfirmedDataUp => "ConfirmedDataUp",
            MType::ConfirmedDataDown => "ConfirmedDataDown",
            MType::Proprietary => "Proprietary",
        };
        write!(f, "{s}")
    }
}

/// MAC header: MType in the high 3 bits, major version in the low 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr {
    pub mtype: MType,
    pub major: u8,
}

impl Mhdr {
    pub fn new(mtype: MType) -> Self {
        Mhdr { mtype, major: 0 }
    }

    pub fn encode(&self) -> u8 {
        (self.mtype.value() << 5) | (self.major & 0x03)
    }

    pub fn parse(byte: u8) -> Result<Self, NsError> {
        Ok(Mhdr {
            mtype: MType::try_from(byte)?,
            major: byte & 0x03,
        })
    }
}

/// Frame control byte. Bit 6 is ADRACKReq on uplink and RFU on downlink;
/// bit 4 is ClassB on uplink and FPending on downlink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
    pub f_pending: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    pub fn parse(byte: u8, uplink: bool) -> Self {
        FCtrl {
            adr: byte & 0x80 != 0,
            adr_ack_req: uplink && byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            class_b: uplink && byte & 0x10 != 0,
            f_pending: !uplink && byte & 0x10 != 0,
            f_opts_len: byte & 0x0F,
        }
    }

    pub fn encode(&self, uplink: bool) -> u8 {
        let mut b = self.f_opts_len & 0x0F;
        if self.adr {
            b |= 0x80;
        }
        if uplink && self.adr_ack_req {
            b |= 0x40;
        }
        if self.ack {
            b |= 0x20;
        }
        if (uplink && self.class_b) || (!uplink && self.f_pending) {
            b |= 0x10;
        }
        b
    }
}

/// Frame header: DevAddr(4 LE) | FCtrl(1) | FCnt(2 LE) | FOpts(0..15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fhdr {
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
}

/// MACPayload = FHDR | [FPort(1) | FRMPayload].
///
/// FPort and FRMPayload are present iff bytes remain after FOpts. FPort 0
/// means the FRMPayload holds encrypted MAC commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload {
    pub fhdr: Fhdr,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
}

impl MacPayload {
    /// Serialized MACPayload bytes (no MHDR, no MIC).
    pub fn encode(&self, uplink: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.fhdr.f_opts.len() + 1 + self.frm_payload.len());
        out.extend_from_slice(&self.fhdr.dev_addr.to_le_bytes());
        out.push(self.fhdr.fctrl.encode(uplink));
        out.extend_from_slice(&self.fhdr.fcnt.to_le_bytes());
        out.extend_from_slice(&self.fhdr.f_opts);
        if let Some(port) = self.f_port {
            out.push(port);
            out.extend_from_slice(&self.frm_payload);
        }
        out
    }
}

/// Join Request payload: JoinEUI(8 LE) | DevEUI(8 LE) | DevNonce(2 LE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequestPayload {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: u16,
}

impl JoinRequestPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        out.extend_from_slice(&self.join_eui.to_le_bytes());
        out.extend_from_slice(&self.dev_eui.to_le_bytes());
        out.extend_from_slice(&self.dev_nonce.to_le_bytes());
        out
    }
}

/// 1-byte downlink settings: RX1DROffset in bits 4..6, RX2 data rate in
/// bits 0..3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlSettings {
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
}

impl DlSettings {
    pub fn encode(&self) -> u8 {
        ((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_data_rate & 0x0F)
    }

    pub fn parse(byte: u8) -> Self {
        DlSettings {
            rx1_dr_offset: (byte >> 4) & 0x07,
            rx2_data_rate: byte & 0x0F,
        }
    }
}

/// Join Accept plaintext: JoinNonce(3 LE) | NetID(3 LE) | DevAddr(4 LE) |
/// DLSettings(1) | RxDelay(1) | [CFList(16)].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAcceptPayload {
    /// 24-bit join-server nonce.
    pub join_nonce: u32,
    /// 3-byte network identifier, display order.
    pub net_id: [u8; 3],
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAcceptPayload {
    /// Plaintext bytes (no MHDR, no MIC).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + 16);
        out.extend_from_slice(&self.join_nonce.to_le_bytes()[..3]);
        out.push(self.net_id[2]);
        out.push(self.net_id[1]);
        out.push(self.net_id[0]);
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(self.dl_settings.encode());
        out.push(self.rx_delay);
        if let Some(cf) = &self.cf_list {
            out.extend_from_slice(cf);
        }
        out
    }

    /// Decode a decrypted Join Accept plaintext (no MHDR, no MIC).
    pub fn parse(data: &[u8]) -> Result<Self, NsError> {
        if data.len() != 12 && data.len() != 28 {
            return Err(NsError::MalformedFrame(format!(
                "JoinAccept plaintext must be 12 or 28 bytes, got {}",
                data.len()
            )));
        }
        let join_nonce = u32::from_le_bytes([data[0], data[1], data[2], 0]);
        let net_id = [data[5], data[4], data[3]];
        let dev_addr = DevAddr::from_le_bytes([data[6], data[7], data[8], data[9]]);
        let cf_list = if data.len() == 28 {
            let mut cf = [0u8; 16];
            cf.copy_from_slice(&data[12..28]);
            Some(cf)
        } else {
            None
        };
        Ok(JoinAcceptPayload {
            join_nonce,
            net_id,
            dev_addr,
            dl_settings: DlSettings::parse(data[10]),
            rx_delay: data[11],
            cf_list,
        })
    }
}

/// Decoded PHY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyPayload {
    JoinRequest {
        mhdr: Mhdr,
        payload: JoinRequestPayload,
        mic: Mic,
    },
    /// A received Join Accept stays opaque until decrypted with the AppKey.
    JoinAccept {
        mhdr: Mhdr,
        encrypted: Vec<u8>,
    },
    Data {
        mhdr: Mhdr,
        payload: MacPayload,
        mic: Mic,
    },
    Proprietary {
        mhdr: Mhdr,
        payload: Vec<u8>,
    },
}

impl PhyPayload {
    /// Parse a raw PHY payload (the base64-decoded rxpk data).
    pub fn parse(data: &[u8]) -> Result<Self, NsError> {
        if data.is_empty() {
            return Err(NsError::MalformedFrame("empty PHY payload".into()));
        }
        let mhdr = Mhdr::parse(data[0])?;
        match mhdr.mtype {
            MType::JoinRequest => Self::parse_join_request(mhdr, data),
            MType::JoinAccept => Ok(PhyPayload::JoinAccept {
                mhdr,
                encrypted: data[1..].to_vec(),
            }),
            MType::Proprietary => Ok(PhyPayload::Proprietary {
                mhdr,
                payload: data[1..].to_vec(),
            }),
            _ => Self::parse_data(mhdr, data),
        }
    }

    fn parse_join_request(mhdr: Mhdr, data: &[u8]) -> Result<Self, NsError> {
        // MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4)
        if data.len() != 23 {
            return Err(NsError::MalformedFrame(format!(
                "JoinRequest must be 23 bytes, got {}",
                data.len()
            )));
        }
        let join_eui = Eui64::from_le_bytes(data[1..9].try_into().unwrap());
        let dev_eui = Eui64::from_le_bytes(data[9..17].try_into().unwrap());
        let dev_nonce = u16::from_le_bytes([data[17], data[18]]);
        let mic = Mic(data[19..23].try_into().unwrap());
        Ok(PhyPayload::JoinRequest {
            mhdr,
            payload: JoinRequestPayload {
                join_eui,
                dev_eui,
                dev_nonce,
            },
            mic,
        })
    }

    fn parse_data(mhdr: Mhdr, data: &[u8]) -> Result<Self, NsError> {
        // MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4)
        if data.len() < 12 {
            return Err(NsError::MalformedFrame(format!(
                "data frame too short: {} bytes",
                data.len()
            )));
        }
        let uplink = mhdr.mtype.is_uplink();
        let dev_addr = DevAddr::from_le_bytes(data[1..5].try_into().unwrap());
        let fctrl = FCtrl::parse(data[5], uplink);
        let fcnt = u16::from_le_bytes([data[6], data[7]]);

        let mic_start = data.len() - 4;
        let f_opts_end = 8 + fctrl.f_opts_len as usize;
        if f_opts_end > mic_start {
            return Err(NsError::MalformedFrame(format!(
                "FOptsLen {} exceeds available data",
                fctrl.f_opts_len
            )));
        }
        let f_opts = data[8..f_opts_end].to_vec();

        let (f_port, frm_payload) = if f_opts_end < mic_start {
            (Some(data[f_opts_end]), data[f_opts_end + 1..mic_start].to_vec())
        } else {
            (None, Vec::new())
        };

        let mic = Mic(data[mic_start..].try_into().unwrap());
        Ok(PhyPayload::Data {
            mhdr,
            payload: MacPayload {
                fhdr: Fhdr {
                    dev_addr,
                    fctrl,
                    fcnt,
                    f_opts,
                },
                f_port,
                frm_payload,
            },
            mic,
        })
    }

    /// Serialize back to on-air bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PhyPayload::JoinRequest { mhdr, payload, mic } => {
                let mut out = Vec::with_capacity(23);
                out.push(mhdr.encode());
                out.extend_from_slice(&payload.encode());
                out.extend_from_slice(mic.as_bytes());
                out
            }
            PhyPayload::JoinAccept { mhdr, encrypted } => {
                let mut out = Vec::with_capacity(1 + encrypted.len());
                out.push(mhdr.encode());
                out.extend_from_slice(encrypted);
                out
            }
            PhyPayload::Data { mhdr, payload, mic } => {
                let uplink = mhdr.mtype.is_uplink();
                let mut out = vec![mhdr.encode()];
                out.extend_from_slice(&payload.encode(uplink));
                out.extend_from_slice(mic.as_bytes());
                out
            }
            PhyPayload::Proprietary { mhdr, payload } => {
                let mut out = vec![mhdr.encode()];
                out.extend_from_slice(payload);
                out
            }
        }
    }

    pub fn mtype(&self) -> MType {
        match self {
            PhyPayload::JoinRequest { mhdr, .. }
            | PhyPayload::JoinAccept { mhdr, .. }
            | PhyPayload::Data { mhdr, .. }
            | PhyPayload::Proprietary { mhdr, .. } => mhdr.mtype,
        }
    }
}

impl fmt::Display for PhyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhyPayload::Data { mhdr, payload, mic } => write!(
                f,
                "{} devAddr={} fCnt={} fPort={} frm={}B mic={}",
                mhdr.mtype,
                payload.fhdr.dev_addr,
                payload.fhdr.fcnt,
                payload
                    .f_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".into()),
                payload.frm_payload.len(),
                mic,
            ),
            PhyPayload::JoinRequest { payload, mic, .. } => write!(
                f,
                "JoinRequest joinEUI={} devEUI={} devNonce={} mic={}",
                payload.join_eui, payload.dev_eui, payload.dev_nonce, mic,
            ),
            PhyPayload::JoinAccept { encrypted, .. } => {
                write!(f, "JoinAccept (encrypted, {}B)", encrypted.len())
            }
            PhyPayload::Proprietary { payload, .. } => {
                write!(f, "Proprietary ({}B)", payload.len())
            }
        }
    }
}
