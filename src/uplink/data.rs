//! Data uplink handling.
//!
//! The session is located by scanning every candidate sharing the frame's
//! DevAddr and checking the MIC under each candidate's network session
//! key; the frame counter is then reconciled, the payload decrypted, MAC
//! commands dispatched, and any due downlink (ACK, queued payload, MAC
//! responses, ADR) folded into a single frame for RX1.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::UplinkPipeline;
use crate::downlink::DownlinkRequest;
use crate::error::NsError;
use crate::lorawan::keys::{DevAddr, Mic};
use crate::lorawan::maccommands::{encode_mac_commands, parse_mac_commands, MacCommand};
use crate::lorawan::security::{self, FcntValidation};
use crate::lorawan::{FCtrl, Fhdr, MType, MacPayload, Mhdr};
use crate::mac::adr;
use crate::messages::{self, ApplicationRxEvent, GatewayRxMessage, RxInfo};
use crate::region::cn470::mhz_to_hz;
use crate::storage::{
    AdrHistoryEntry, DeviceSession, EventKind, EventLogEntry, UplinkFrameRecord,
};

/// Confirmed application downlinks are retried this many times before
/// being dropped.
const MAX_DOWNLINK_RETRY: u32 = 3;

pub(crate) async fn handle_data_up(
    pipeline: &UplinkPipeline,
    msg: &GatewayRxMessage,
    phy: &[u8],
    mac: MacPayload,
    mic: Mic,
    mtype: MType,
) -> Result<(), NsError> {
    let dev_addr = mac.fhdr.dev_addr;
    let (mut session, full_fcnt) =
        find_session(pipeline, dev_addr, mac.fhdr.fcnt, phy, &mic).await?;

    let validation = security::validate_fcnt_up(
        session.f_cnt_up,
        full_fcnt,
        pipeline.config.network.device_reboot_fcnt_reset,
    )?;
    let full_fcnt = match validation {
        FcntValidation::Accepted(value) => value,
        FcntValidation::RebootReset => {
            info!(
                "device {} rebooted (fCnt 0 after 1), resetting counters",
                session.dev_eui
            );
            session.n_f_cnt_down = 0;
            session.a_f_cnt_down = 0;
            0
        }
    };
    session.f_cnt_up = full_fcnt;

    let device = pipeline
        .store
        .device_get(session.dev_eui)
        .await?
        .ok_or_else(|| {
            NsError::UnknownDevice(format!("no device row for {}", session.dev_eui))
        })?;
    if device.is_disabled {
        return Err(NsError::UnknownDevice(format!(
            "device {} is disabled",
            session.dev_eui
        )));
    }

    // FPort 0 carries encrypted MAC commands under the network session
    // key; anything else is application data under the AppSKey.
    let decrypted = match mac.f_port {
        Some(0) => security::encrypt_frm_payload(
            &session.nwk_s_enc_key,
            dev_addr,
            full_fcnt,
            true,
            &mac.frm_payload,
        ),
        Some(_) => security::encrypt_frm_payload(
            &session.app_s_key,
            dev_addr,
            full_fcnt,
            true,
            &mac.frm_payload,
        ),
        None => Vec::new(),
    };

    let mut commands = Vec::new();
    if !mac.fhdr.f_opts.is_empty() {
        collect_mac_commands(&mac.fhdr.f_opts, &mut commands, &session);
    }
    if mac.f_port == Some(0) && !decrypted.is_empty() {
        collect_mac_commands(&decrypted, &mut commands, &session);
    }

    let snr = msg.rxpk.lsnr.unwrap_or(0.0);
    session.adr = mac.fhdr.fctrl.adr;
    session.push_adr_history(
        AdrHistoryEntry {
            f_cnt: full_fcnt,
            max_snr: snr,
            tx_power: session.tx_power,
            gateway_count: 1,
        },
        pipeline.config.cn470.adr.history_size,
    );

    // Reception state must be current before any downlink is scheduled.
    pipeline
        .rx_cache
        .insert(
            session.dev_eui,
            msg.gateway_id.clone(),
            msg.rxpk.clone(),
            Some(msg.context.clone()),
        )
        .await;
    pipeline
        .tracker
        .update_and_check(&msg.gateway_id, msg.rxpk.tmst, false)
        .await;
    pipeline
        .store
        .device_gateway_set(session.dev_eui, &msg.gateway_id)
        .await?;

    let rx_info = rx_info_from(msg);

    // Archival is best-effort: an unavailable store must not cost the
    // device its receive window.
    let record = UplinkFrameRecord {
        dev_eui: session.dev_eui,
        phy_payload: phy.to_vec(),
        f_cnt: full_fcnt,
        f_port: mac.f_port,
        dr: session.dr,
        adr: mac.fhdr.fctrl.adr,
        data: decrypted.clone(),
        rx_info: vec![rx_info.clone()],
        received_at: Utc::now(),
    };
    if let Err(e) = pipeline.store.uplink_frame_insert(record).await {
        error!("uplink frame archive failed: {e}");
    }

    if let Some(port) = mac.f_port {
        if port > 0 {
            let event = ApplicationRxEvent {
                application_id: device.application_id.clone(),
                dev_eui: session.dev_eui,
                dev_addr,
                f_cnt: full_fcnt,
                f_port: port,
                data: messages::base64_encode(&decrypted),
                rx_info: vec![rx_info],
                adr: mac.fhdr.fctrl.adr,
            };
            let payload = serde_json::to_vec(&event)
                .map_err(|e| NsError::Internal(format!("rx event serialization: {e}")))?;
            pipeline
                .bus
                .publish(
                    &messages::application_rx_subject(&device.application_id, session.dev_eui),
                    payload,
                )
                .await?;
        }
    }

    let responses = pipeline
        .mac_handler
        .handle(&mut session, &commands, snr, 1)
        .await?;

    settle_inflight_downlink(pipeline, &session, mac.fhdr.fctrl.ack).await?;

    match mtype {
        MType::ConfirmedDataUp => {
            respond_confirmed(pipeline, &mut session, &responses).await?;
        }
        MType::UnconfirmedDataUp => {
            respond_unconfirmed(pipeline, &mut session, responses, &mac.fhdr.fctrl).await?;
        }
        other => {
            debug!("no downlink policy for {other}");
            pipeline.store.device_session_save(session.clone()).await?;
        }
    }

    pipeline
        .store
        .event_log_insert(EventLogEntry::now(
            EventKind::Uplink,
            Some(session.dev_eui),
            format!("fCnt={full_fcnt} fPort={:?} {mtype}", mac.f_port),
        ))
        .await?;
    Ok(())
}

/// A ConfirmedDataUp is answered with a bare ACK: handler responses ride
/// along, but nothing is auto-injected.
async fn respond_confirmed(
    pipeline: &UplinkPipeline,
    session: &mut DeviceSession,
    responses: &[MacCommand],
) -> Result<(), NsError> {
    let queued = pipeline
        .store
        .pending_downlink_next(session.dev_eui)
        .await?;
    let frame = build_downlink_frame(session, true, queued.is_some(), responses, None);

    session.n_f_cnt_down += 1;
    pipeline.store.device_session_save(session.clone()).await?;
    pipeline
        .scheduler
        .schedule(DownlinkRequest {
            dev_eui: session.dev_eui,
            phy: frame,
            delay: Duration::from_secs(session.rx1_delay as u64),
            use_rx2: false,
            rx1_dr_offset: session.rx1_dr_offset,
            rx2_dr: session.rx2_dr,
            rx2_freq: session.rx2_freq,
        })
        .await
}

/// An UnconfirmedDataUp only triggers a downlink when there is something
/// to say: a queued payload, MAC responses, an ADR adjustment, or the
/// device explicitly asked via ADRACKReq.
async fn respond_unconfirmed(
    pipeline: &UplinkPipeline,
    session: &mut DeviceSession,
    mut commands: Vec<MacCommand>,
    fctrl: &FCtrl,
) -> Result<(), NsError> {
    if pipeline.config.network.adr_enabled && session.adr {
        if let Some(cmd) = adr::run_adr(session, &pipeline.config.cn470.adr, &pipeline.region) {
            commands.push(cmd);
        }
    }

    let pending = pipeline
        .store
        .pending_downlink_next(session.dev_eui)
        .await?
        .filter(|p| !p.is_pending);

    if pending.is_none() && commands.is_empty() && !fctrl.adr_ack_req {
        pipeline.store.device_session_save(session.clone()).await?;
        return Ok(());
    }

    let app = pending.as_ref().map(|p| (p.f_port, p.data.as_slice()));
    let frame = build_downlink_frame(session, false, false, &commands, app);

    session.n_f_cnt_down += 1;
    pipeline.store.device_session_save(session.clone()).await?;
    pipeline
        .scheduler
        .schedule(DownlinkRequest {
            dev_eui: session.dev_eui,
            phy: frame,
            delay: Duration::from_secs(session.rx1_delay as u64),
            use_rx2: false,
            rx1_dr_offset: session.rx1_dr_offset,
            rx2_dr: session.rx2_dr,
            rx2_freq: session.rx2_freq,
        })
        .await?;

    if let Some(item) = pending {
        if item.confirmed {
            // Await the device's ACK before letting go of the payload.
            let mut item = item;
            item.is_pending = true;
            pipeline.store.pending_downlink_update(item).await?;
        } else {
            pipeline.store.pending_downlink_delete(item.id).await?;
        }
    }
    Ok(())
}

/// Resolve the fate of a confirmed downlink sent in a previous window:
/// the device's ACK retires it, silence retries it up to the budget.
async fn settle_inflight_downlink(
    pipeline: &UplinkPipeline,
    session: &DeviceSession,
    acked: bool,
) -> Result<(), NsError> {
    let Some(inflight) = pipeline
        .store
        .pending_downlink_next(session.dev_eui)
        .await?
    else {
        return Ok(());
    };
    if !inflight.is_pending {
        return Ok(());
    }

    if acked {
        pipeline.store.pending_downlink_delete(inflight.id).await?;
        pipeline
            .store
            .event_log_insert(EventLogEntry::now(
                EventKind::DownlinkAck,
                Some(session.dev_eui),
                format!("downlink {} acknowledged", inflight.id),
            ))
            .await?;
        return Ok(());
    }

    let mut item = inflight;
    item.retry_count += 1;
    if item.retry_count > MAX_DOWNLINK_RETRY {
        warn!(
            "confirmed downlink {} for {} exhausted {MAX_DOWNLINK_RETRY} retries, dropping",
            item.id, session.dev_eui
        );
        pipeline.store.pending_downlink_delete(item.id).await?;
        pipeline
            .store
            .event_log_insert(EventLogEntry::now(
                EventKind::Error,
                Some(session.dev_eui),
                format!("downlink {} dropped after retries", item.id),
            ))
            .await?;
    } else {
        item.is_pending = false;
        pipeline.store.pending_downlink_update(item).await?;
    }
    Ok(())
}

/// Locate the session whose key verifies the frame MIC. The full frame
/// counter must be reconstructed per candidate because it feeds the MIC.
async fn find_session(
    pipeline: &UplinkPipeline,
    dev_addr: DevAddr,
    fcnt16: u16,
    phy: &[u8],
    mic: &Mic,
) -> Result<(DeviceSession, u32), NsError> {
    let candidates = pipeline.store.device_sessions_by_dev_addr(dev_addr).await?;
    if candidates.is_empty() {
        return Err(NsError::UnknownDevice(format!(
            "no session for devAddr {dev_addr}"
        )));
    }
    for session in candidates {
        let full = security::reconstruct_fcnt(session.f_cnt_up, fcnt16);
        let expected = security::calculate_data_mic(
            &phy[..phy.len() - 4],
            &session.f_nwk_s_int_key,
            dev_addr,
            full,
            true,
        );
        if expected == *mic {
            return Ok((session, full));
        }
    }
    Err(NsError::MicValidationFailed)
}

/// A duplicate reception from another gateway: fold its RF quality into
/// the device's reception cache so RX1 targets the best receiver.
pub(crate) async fn merge_duplicate_rx(
    pipeline: &UplinkPipeline,
    msg: &GatewayRxMessage,
    mac: &MacPayload,
    mic: &Mic,
    phy: &[u8],
) {
    if let Ok((session, _)) =
        find_session(pipeline, mac.fhdr.dev_addr, mac.fhdr.fcnt, phy, mic).await
    {
        pipeline
            .rx_cache
            .merge_duplicate(
                session.dev_eui,
                msg.gateway_id.clone(),
                msg.rxpk.clone(),
                Some(msg.context.clone()),
            )
            .await;
    }
}

fn collect_mac_commands(bytes: &[u8], into: &mut Vec<MacCommand>, session: &DeviceSession) {
    match parse_mac_commands(bytes, true) {
        Ok((commands, skipped)) => {
            if skipped > 0 {
                debug!(
                    "skipped {skipped} bytes of unknown MAC commands from {}",
                    session.dev_eui
                );
            }
            into.extend(commands);
        }
        Err(e) => warn!("MAC commands from {} not parsed: {e}", session.dev_eui),
    }
}

fn rx_info_from(msg: &GatewayRxMessage) -> RxInfo {
    RxInfo {
        gateway_id: msg.gateway_id.clone(),
        rssi: msg.rxpk.rssi,
        lora_snr: msg.rxpk.lsnr,
        frequency: mhz_to_hz(msg.rxpk.freq),
        tmst: msg.rxpk.tmst,
        channel: msg.rxpk.chan,
        context: Some(msg.context.clone()),
    }
}

/// Assemble an UnconfirmedDataDown PHY payload against the session's
/// current NFCntDown (the caller increments and persists afterwards).
/// MAC commands ride in FOpts when they fit and no application payload
/// competes for the FRMPayload; otherwise they move to a port-0 frame.
pub(crate) fn build_downlink_frame(
    session: &DeviceSession,
    ack: bool,
    f_pending: bool,
    mac_cmds: &[MacCommand],
    app: Option<(u8, &[u8])>,
) -> Vec<u8> {
    let encoded = encode_mac_commands(mac_cmds);
    let nfcnt = session.n_f_cnt_down;

    let (f_opts, f_port, frm_payload) = match app {
        Some((port, data)) => {
            let f_opts = if encoded.len() <= 15 {
                encoded
            } else {
                warn!(
                    "MAC commands ({}B) exceed the FOpts budget, deferring to a later frame",
                    encoded.len()
                );
                Vec::new()
            };
            let frm = security::encrypt_frm_payload(
                &session.app_s_key,
                session.dev_addr,
                nfcnt,
                false,
                data,
            );
            (f_opts, Some(port), frm)
        }
        None if encoded.len() > 15 => {
            let frm = security::encrypt_frm_payload(
                &session.nwk_s_enc_key,
                session.dev_addr,
                nfcnt,
                false,
                &encoded,
            );
            (Vec::new(), Some(0), frm)
        }
        None => (encoded, None, Vec::new()),
    };

    let payload = MacPayload {
        fhdr: Fhdr {
            dev_addr: session.dev_addr,
            fctrl: FCtrl {
                adr: session.adr,
                adr_ack_req: false,
                ack,
                class_b: false,
                f_pending,
                f_opts_len: f_opts.len() as u8,
            },
            fcnt: nfcnt as u16,
            f_opts,
        },
        f_port,
        frm_payload,
    };

    let mhdr = Mhdr::new(MType::UnconfirmedDataDown);
    let mut bytes = vec![mhdr.encode()];
    bytes.extend_from_slice(&payload.encode(false));
    let mic = security::calculate_data_mic(
        &bytes,
        &session.s_nwk_s_int_key,
        session.dev_addr,
        nfcnt,
        false,
    );
    bytes.extend_from_slice(mic.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::keys::Aes128Key;
    use crate::lorawan::PhyPayload;

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
            n_f_cnt_down: 7,
            a_f_cnt_down: 0,
            conf_f_cnt: 0,
            rx1_delay: 5,
            rx1_dr_offset: 0,
            rx2_dr: 0,
            rx2_freq: 505_300_000,
            dr: 5,
            tx_power: 0,
            adr: false,
            enabled_channels: (0..8).collect(),
            adr_history: vec![],
        }
    }

    #[test]
    fn test_ack_frame_shape() {
        let s = session();
        let frame = build_downlink_frame(&s, true, false, &[], None);

        // MHDR + DevAddr + FCtrl + FCnt + MIC, nothing else.
        assert_eq!(frame.len(), 12);
        match PhyPayload::parse(&frame).unwrap() {
            PhyPayload::Data { mhdr, payload, mic } => {
                assert_eq!(mhdr.mtype, MType::UnconfirmedDataDown);
                assert!(payload.fhdr.fctrl.ack);
                assert_eq!(payload.fhdr.fcnt, 7);
                assert!(payload.f_port.is_none());
                // MIC verifies under the serving network key with the
                // full downlink counter.
                let expected = security::calculate_data_mic(
                    &frame[..frame.len() - 4],
                    &s.s_nwk_s_int_key,
                    s.dev_addr,
                    7,
                    false,
                );
                assert_eq!(mic, expected);
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_app_payload_encrypted_with_app_s_key() {
        let s = session();
        let plain = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let frame = build_downlink_frame(&s, false, false, &[], Some((10, &plain)));

        match PhyPayload::parse(&frame).unwrap() {
            PhyPayload::Data { payload, .. } => {
                assert_eq!(payload.f_port, Some(10));
                assert_ne!(payload.frm_payload, plain);
                let decrypted = security::encrypt_frm_payload(
                    &s.app_s_key,
                    s.dev_addr,
                    s.n_f_cnt_down,
                    false,
                    &payload.frm_payload,
                );
                assert_eq!(decrypted, plain);
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_small_mac_commands_ride_in_f_opts() {
        let s = session();
        let cmds = vec![MacCommand::LinkCheckAns {
            margin: 20,
            gw_cnt: 1,
        }];
        let frame = build_downlink_frame(&s, false, false, &cmds, None);

        match PhyPayload::parse(&frame).unwrap() {
            PhyPayload::Data { payload, .. } => {
                assert_eq!(payload.fhdr.f_opts, encode_mac_commands(&cmds));
                assert!(payload.f_port.is_none());
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_mac_commands_move_to_port_zero() {
        let s = session();
        // Four LinkAdrReq = 20 bytes, over the 15-byte FOpts budget.
        let cmds: Vec<MacCommand> = (0..4)
            .map(|i| MacCommand::LinkAdrReq {
                data_rate: 5,
                tx_power: i,
                ch_mask: 0x00FF,
                ch_mask_cntl: 0,
                nb_trans: 1,
            })
            .collect();
        let frame = build_downlink_frame(&s, false, false, &cmds, None);

        match PhyPayload::parse(&frame).unwrap() {
            PhyPayload::Data { payload, .. } => {
                assert!(payload.fhdr.f_opts.is_empty());
                assert_eq!(payload.f_port, Some(0));
                // Commands decrypt under the network session encryption
                // key.
                let decrypted = security::encrypt_frm_payload(
                    &s.nwk_s_enc_key,
                    s.dev_addr,
                    s.n_f_cnt_down,
                    false,
                    &payload.frm_payload,
                );
                assert_eq!(decrypted, encode_mac_commands(&cmds));
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_f_pending_flag() {
        let s = session();
        let frame = build_downlink_frame(&s, true, true, &[], None);
        match PhyPayload::parse(&frame).unwrap() {
            PhyPayload::Data { payload, .. } => {
                assert!(payload.fhdr.fctrl.f_pending);
                assert!(!payload.fhdr.fctrl.class_b);
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }
}
