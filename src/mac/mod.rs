//! MAC command handling.
//!
//! Commands arriving in FOpts or a port-0 FRMPayload are dispatched per
//! CID. Handlers may produce downlink responses, which the uplink
//! pipeline folds into the next downlink frame.

pub mod adr;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::NsError;
use crate::lorawan::maccommands::MacCommand;
use crate::storage::{DeviceSession, Store};

/// Demodulation-floor SNR per data rate, dB (SF12..SF7 at 125 kHz).
const REQUIRED_SNR: [f64; 6] = [-20.0, -17.5, -15.0, -12.5, -10.0, -7.5];

/// Link margin for a LinkCheckAns: dB above the demodulation floor of
/// the uplink's data rate, clamped to the field's range.
pub fn link_margin(best_snr: f64, dr: u8) -> u8 {
    let floor = REQUIRED_SNR
        .get(dr as usize)
        .copied()
        .unwrap_or(REQUIRED_SNR[0]);
    (best_snr - floor).clamp(0.0, 254.0) as u8
}

pub struct MacHandler {
    store: Arc<dyn Store>,
}

impl MacHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        MacHandler { store }
    }

    /// Process the uplink's MAC commands and collect downlink responses.
    ///
    /// `best_snr` and `gateway_count` describe the uplink's reception and
    /// feed LinkCheckAns.
    pub async fn handle(
        &self,
        session: &mut DeviceSession,
        commands: &[MacCommand],
        best_snr: f64,
        gateway_count: usize,
    ) -> Result<Vec<MacCommand>, NsError> {
        let mut responses = Vec::new();
        for command in commands {
            match command {
                MacCommand::LinkCheckReq => {
                    let margin = link_margin(best_snr, session.dr);
                    debug!(
                        "LinkCheckReq from {}: margin={margin} gwCnt={gateway_count}",
                        session.dev_eui
                    );
                    responses.push(MacCommand::LinkCheckAns {
                        margin,
                        gw_cnt: gateway_count.min(255) as u8,
                    });
                }
                MacCommand::DevStatusAns { battery, margin } => {
                    debug!(
                        "DevStatusAns from {}: battery={battery} margin={margin}",
                        session.dev_eui
                    );
                    if let Some(mut device) = self.store.device_get(session.dev_eui).await? {
                        device.battery = Some(*battery);
                        device.margin = Some(*margin);
                        self.store.device_update(device).await?;
                    }
                }
                MacCommand::LinkAdrAns {
                    power_ack,
                    data_rate_ack,
                    channel_mask_ack,
                } => {
                    if *power_ack && *data_rate_ack && *channel_mask_ack {
                        debug!("LinkAdrAns from {}: accepted", session.dev_eui);
                    } else {
                        // Partial NACK: leave the session alone, the next
                        // ADR round will try again from history.
                        warn!(
                            "LinkAdrAns from {}: power_ack={power_ack} data_rate_ack={data_rate_ack} channel_mask_ack={channel_mask_ack}",
                            session.dev_eui
                        );
                    }
                }
                MacCommand::RxParamSetupAns {
                    rx1_dr_offset_ack,
                    rx2_data_rate_ack,
                    channel_ack,
                } => {
                    info!(
                        "RxParamSetupAns from {}: offset={rx1_dr_offset_ack} rx2dr={rx2_data_rate_ack} channel={channel_ack}",
                        session.dev_eui
                    );
                }
                MacCommand::NewChannelAns {
                    data_rate_range_ok,
                    channel_freq_ok,
                } => {
                    info!(
                        "NewChannelAns from {}: dr_ok={data_rate_range_ok} freq_ok={channel_freq_ok}",
                        session.dev_eui
                    );
                }
                other => {
                    // Downlink-only commands have no business arriving in
                    // an uplink.
                    warn!(
                        "ignoring unexpected MAC command 0x{:02x} from {}",
                        other.cid(),
                        session.dev_eui
                    );
                }
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::Aes128Key;
    use crate::storage::{Device, MemoryStore};

    fn session() -> DeviceSession {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        DeviceSession {
            dev_eui: "0102030405060708".parse().unwrap(),
            dev_addr: "01020304".parse().unwrap(),
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

    #[test]
    fn test_link_margin() {
        // SF7 floor is -7.5 dB.
        assert_eq!(link_margin(9.5, 5), 17);
        assert_eq!(link_margin(-20.0, 5), 0);
        // SF12 floor is -20 dB.
        assert_eq!(link_margin(0.0, 0), 20);
    }

    #[tokio::test]
    async fn test_link_check_produces_answer() {
        let store = MemoryStore::new();
        let handler = MacHandler::new(store);
        let mut session = session();

        let responses = handler
            .handle(&mut session, &[MacCommand::LinkCheckReq], 9.5, 2)
            .await
            .unwrap();
        assert_eq!(
            responses,
            vec![MacCommand::LinkCheckAns {
                margin: 17,
                gw_cnt: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_dev_status_updates_device() {
        let store = MemoryStore::new();
        let mut session = session();
        store
            .device_create(Device {
                dev_eui: session.dev_eui,
                join_eui: session.join_eui,
                dev_addr: Some(session.dev_addr),
                application_id: "app".into(),
                device_profile_id: "profile".into(),
                f_cnt_up: 0,
                n_f_cnt_down: 0,
                a_f_cnt_down: 0,
                is_disabled: false,
                battery: None,
                margin: None,
            })
            .await;

        let handler = MacHandler::new(store.clone());
        let responses = handler
            .handle(
                &mut session,
                &[MacCommand::DevStatusAns {
                    battery: 200,
                    margin: -4,
                }],
                5.0,
                1,
            )
            .await
            .unwrap();
        // Status answers produce no downlink.
        assert!(responses.is_empty());

        let device = store.device_get(session.dev_eui).await.unwrap().unwrap();
        assert_eq!(device.battery, Some(200));
        assert_eq!(device.margin, Some(-4));
    }

    #[tokio::test]
    async fn test_partial_link_adr_nack_changes_nothing() {
        let store = MemoryStore::new();
        let handler = MacHandler::new(store);
        let mut session = session();
        let dr_before = session.dr;

        let responses = handler
            .handle(
                &mut session,
                &[MacCommand::LinkAdrAns {
                    power_ack: true,
                    data_rate_ack: false,
                    channel_mask_ack: true,
                }],
                5.0,
                1,
            )
            .await
            .unwrap();
        assert!(responses.is_empty());
        assert_eq!(session.dr, dr_before);
    }
}
