//! MAC command codec.
//!
//! Commands are CID-tagged with fixed payload lengths per direction.
//! Uplink carries the device's answers and LinkCheckReq; downlink carries
//! the server's requests and LinkCheckAns. Parsing stops at the first
//! unknown CID (the remaining bytes cannot be framed without its length);
//! a known CID with too few remaining bytes is a malformed command.

use crate::error::NsError;

pub const CID_LINK_CHECK: u8 = 0x02;
pub const CID_LINK_ADR: u8 = 0x03;
pub const CID_DUTY_CYCLE: u8 = 0x04;
pub const CID_RX_PARAM_SETUP: u8 = 0x05;
pub const CID_DEV_STATUS: u8 = 0x06;
pub const CID_NEW_CHANNEL: u8 = 0x07;
pub const CID_RX_TIMING_SETUP: u8 = 0x08;

/// A decoded MAC command, uplink or downlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    // Device → server.
    LinkCheckReq,
    LinkAdrAns {
        power_ack: bool,
        data_rate_ack: bool,
        channel_mask_ack: bool,
    },
    RxParamSetupAns {
        rx1_dr_offset_ack: bool,
        rx2_data_rate_ack: bool,
        channel_ack: bool,
    },
    DevStatusAns {
        battery: u8,
        margin: i8,
    },
    NewChannelAns {
        data_rate_range_ok: bool,
        channel_freq_ok: bool,
    },
    // Server → device.
    LinkCheckAns {
        margin: u8,
        gw_cnt: u8,
    },
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        ch_mask: u16,
        ch_mask_cntl: u8,
        nb_trans: u8,
    },
    RxParamSetupReq {
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        /// RX2 frequency in Hz.
        frequency: u32,
    },
    DevStatusReq,
    NewChannelReq {
        ch_index: u8,
        /// Channel frequency in Hz.
        frequency: u32,
        min_dr: u8,
        max_dr: u8,
    },
}

impl MacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => CID_LINK_CHECK,
            MacCommand::LinkAdrAns { .. } | MacCommand::LinkAdrReq { .. } => CID_LINK_ADR,
            MacCommand::RxParamSetupAns { .. } | MacCommand::RxParamSetupReq { .. } => {
                CID_RX_PARAM_SETUP
            }
            MacCommand::DevStatusAns { .. } | MacCommand::DevStatusReq => CID_DEV_STATUS,
            MacCommand::NewChannelAns { .. } | MacCommand::NewChannelReq { .. } => CID_NEW_CHANNEL,
        }
    }
}

fn need(bytes: &[u8], n: usize, cid: u8) -> Result<(), NsError> {
    if bytes.len() < n {
        Err(NsError::MalformedCommand(format!(
            "CID 0x{cid:02x} needs {n} bytes, {} remain",
            bytes.len()
        )))
    } else {
        Ok(())
    }
}

/// Parse a MAC command sequence from FOpts or a port-0 FRMPayload.
///
/// Returns the decoded commands plus the number of trailing bytes skipped
/// at an unknown CID (zero when everything parsed).
pub fn parse_mac_commands(
    bytes: &[u8],
    uplink: bool,
) -> Result<(Vec<MacCommand>, usize), NsError> {
    let mut cmds = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let cid = bytes[i];
        i += 1;
        let rest = &bytes[i..];
        let consumed = if uplink {
            match cid {
                CID_LINK_CHECK => {
                    cmds.push(MacCommand::LinkCheckReq);
                    0
                }
                CID_LINK_ADR => {
                    need(rest, 1, cid)?;
                    let s = rest[0];
                    cmds.push(MacCommand::LinkAdrAns {
                        channel_mask_ack: s & 0x01 != 0,
                        data_rate_ack: s & 0x02 != 0,
                        power_ack: s & 0x04 != 0,
                    });
                    1
                }
                CID_RX_PARAM_SETUP => {
                    need(rest, 1, cid)?;
                    let s = rest[0];
                    cmds.push(MacCommand::RxParamSetupAns {
                        channel_ack: s & 0x01 != 0,
                        rx2_data_rate_ack: s & 0x02 != 0,
                        rx1_dr_offset_ack: s & 0x04 != 0,
                    });
                    1
                }
                CID_DEV_STATUS => {
                    need(rest, 2, cid)?;
                    cmds.push(MacCommand::DevStatusAns {
                        battery: rest[0],
                        margin: sign_extend_6bit(rest[1]),
                    });
                    2
                }
                CID_NEW_CHANNEL => {
                    need(rest, 1, cid)?;
                    let s = rest[0];
                    cmds.push(MacCommand::NewChannelAns {
                        channel_freq_ok: s & 0x01 != 0,
                        data_rate_range_ok: s & 0x02 != 0,
                    });
                    1
                }
                _ => return Ok((cmds, bytes.len() - i + 1)),
            }
        } else {
            match cid {
                CID_LINK_CHECK => {
                    need(rest, 2, cid)?;
                    cmds.push(MacCommand::LinkCheckAns {
                        margin: rest[0],
                        gw_cnt: rest[1],
                    });
                    2
                }
                CID_LINK_ADR => {
                    need(rest, 4, cid)?;
                    cmds.push(MacCommand::LinkAdrReq {
                        data_rate: rest[0] >> 4,
                        tx_power: rest[0] & 0x0F,
                        ch_mask: u16::from_le_bytes([rest[1], rest[2]]),
                        ch_mask_cntl: (rest[3] >> 3) & 0x07,
                        nb_trans: rest[3] & 0x07,
                    });
                    4
                }
                CID_RX_PARAM_SETUP => {
                    need(rest, 4, cid)?;
                    cmds.push(MacCommand::RxParamSetupReq {
                        rx1_dr_offset: (rest[0] >> 4) & 0x07,
                        rx2_data_rate: rest[0] & 0x0F,
                        frequency: freq_from_24bit(&rest[1..4]),
                    });
                    4
                }
                CID_DEV_STATUS => {
                    cmds.push(MacCommand::DevStatusReq);
                    0
                }
                CID_NEW_CHANNEL => {
                    need(rest, 5, cid)?;
                    cmds.push(MacCommand::NewChannelReq {
                        ch_index: rest[0],
                        frequency: freq_from_24bit(&rest[1..4]),
                        min_dr: rest[4] & 0x0F,
                        max_dr: rest[4] >> 4,
                    });
                    5
                }
                _ => return Ok((cmds, bytes.len() - i + 1)),
            }
        };
        i += consumed;
    }
    Ok((cmds, 0))
}

/// Serialize a MAC command sequence.
pub fn encode_mac_commands(cmds: &[MacCommand]) -> Vec<u8> {
    let mut out = Vec::new();
    for cmd in cmds {
        out.push(cmd.cid());
        match cmd {
            MacCommand::LinkCheckReq | MacCommand::DevStatusReq => {}
            MacCommand::LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                let mut s = 0u8;
                if *channel_mask_ack {
                    s |= 0x01;
                }
                if *data_rate_ack {
                    s |= 0x02;
                }
                if *power_ack {
                    s |= 0x04;
                }
                out.push(s);
            }
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => {
                let mut s = 0u8;
                if *channel_ack {
                    s |= 0x01;
                }
                if *rx2_data_rate_ack {
                    s |= 0x02;
                }
                if *rx1_dr_offset_ack {
                    s |= 0x04;
                }
                out.push(s);
            }
            MacCommand::DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push((*margin as u8) & 0x3F);
            }
            MacCommand::NewChannelAns {
                data_rate_range_ok,
                channel_freq_ok,
            } => {
                let mut s = 0u8;
                if *channel_freq_ok {
                    s |= 0x01;
                }
                if *data_rate_range_ok {
                    s |= 0x02;
                }
                out.push(s);
            }
            MacCommand::LinkCheckAns { margin, gw_cnt } => {
                out.push(*margin);
                out.push(*gw_cnt);
            }
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                out.push((data_rate << 4) | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push(((ch_mask_cntl & 0x07) << 3) | (nb_trans & 0x07));
            }
            MacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                out.push(((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F));
                out.extend_from_slice(&freq_to_24bit(*frequency));
            }
            MacCommand::NewChannelReq {
                ch_index,
                frequency,
                min_dr,
                max_dr,
            } => {
                out.push(*ch_index);
                out.extend_from_slice(&freq_to_24bit(*frequency));
                out.push((max_dr << 4) | (min_dr & 0x0F));
            }
        }
    }
    out
}

/// MAC command frequencies are 3-byte little-endian in units of 100 Hz.
fn freq_from_24bit(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}

fn freq_to_24bit(freq_hz: u32) -> [u8; 3] {
    let v = freq_hz / 100;
    [v as u8, (v >> 8) as u8, (v >> 16) as u8]
}

/// The DevStatusAns margin is a 6-bit two's-complement SNR.
fn sign_extend_6bit(raw: u8) -> i8 {
    let v = raw & 0x3F;
    if v & 0x20 != 0 {
        (v | 0xC0) as i8
    } else {
        v as i8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uplink_sequence() {
        // LinkCheckReq, LinkADRAns(all acked), DevStatusAns(batt=254, margin=-10)
        let bytes = [0x02, 0x03, 0x07, 0x06, 0xFE, 0x36];
        let (cmds, skipped) = parse_mac_commands(&bytes, true).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(
            cmds,
            vec![
                MacCommand::LinkCheckReq,
                MacCommand::LinkAdrAns {
                    power_ack: true,
                    data_rate_ack: true,
                    channel_mask_ack: true,
                },
                MacCommand::DevStatusAns {
                    battery: 254,
                    margin: -10,
                },
            ]
        );
    }

    #[test]
    fn test_parse_downlink_link_adr_req() {
        let bytes = [0x03, 0x52, 0xFF, 0x00, 0x0B];
        let (cmds, _) = parse_mac_commands(&bytes, false).unwrap();
        assert_eq!(
            cmds,
            vec![MacCommand::LinkAdrReq {
                data_rate: 5,
                tx_power: 2,
                ch_mask: 0x00FF,
                ch_mask_cntl: 1,
                nb_trans: 3,
            }]
        );
    }

    #[test]
    fn test_short_payload_is_malformed() {
        // DevStatusAns needs 2 bytes, only 1 present.
        let err = parse_mac_commands(&[0x06, 0xFE], true).unwrap_err();
        assert!(matches!(err, NsError::MalformedCommand(_)));

        // Downlink NewChannelReq needs 5 bytes.
        assert!(parse_mac_commands(&[0x07, 0x01, 0x02], false).is_err());
    }

    #[test]
    fn test_unknown_cid_stops_parsing() {
        // Valid LinkCheckReq followed by a proprietary CID.
        let (cmds, skipped) = parse_mac_commands(&[0x02, 0x80, 0x01, 0x02], true).unwrap();
        assert_eq!(cmds, vec![MacCommand::LinkCheckReq]);
        assert_eq!(skipped, 3);
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let downlink = vec![
            MacCommand::LinkCheckAns {
                margin: 20,
                gw_cnt: 2,
            },
            MacCommand::LinkAdrReq {
                data_rate: 4,
                tx_power: 3,
                ch_mask: 0xFF00,
                ch_mask_cntl: 0,
                nb_trans: 1,
            },
            MacCommand::RxParamSetupReq {
                rx1_dr_offset: 1,
                rx2_data_rate: 0,
                frequency: 505_300_000,
            },
            MacCommand::DevStatusReq,
            MacCommand::NewChannelReq {
                ch_index: 7,
                frequency: 471_500_000,
                min_dr: 0,
                max_dr: 5,
            },
        ];
        let bytes = encode_mac_commands(&downlink);
        let (parsed, skipped) = parse_mac_commands(&bytes, false).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(parsed, downlink);

        let uplink = vec![
            MacCommand::LinkAdrAns {
                power_ack: false,
                data_rate_ack: true,
                channel_mask_ack: true,
            },
            MacCommand::DevStatusAns {
                battery: 128,
                margin: 15,
            },
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack: true,
                rx2_data_rate_ack: false,
                channel_ack: true,
            },
            MacCommand::NewChannelAns {
                data_rate_range_ok: true,
                channel_freq_ok: false,
            },
        ];
        let bytes = encode_mac_commands(&uplink);
        let (parsed, skipped) = parse_mac_commands(&bytes, true).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(parsed, uplink);
    }

    #[test]
    fn test_margin_sign_extension() {
        assert_eq!(sign_extend_6bit(0x00), 0);
        assert_eq!(sign_extend_6bit(0x1F), 31);
        assert_eq!(sign_extend_6bit(0x20), -32);
        assert_eq!(sign_extend_6bit(0x36), -10);
    }
}
