//! OTAA Join handling.
//!
//! A valid Join Request tears down any previous session, derives fresh
//! session keys and answers with an encrypted Join-Accept inside the
//! join receive windows. Some vendor firmware ships the DevEUI in
//! reverse byte order; a single reversed-EUI fallback lookup compensates,
//! and the session is then keyed by the reversed form.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use super::UplinkPipeline;
use crate::downlink::DownlinkRequest;
use crate::error::NsError;
use crate::lorawan::keys::{DevAddr, Eui64, Mic};
use crate::lorawan::security;
use crate::lorawan::{DlSettings, JoinAcceptPayload, JoinRequestPayload, MType, Mhdr};
use crate::messages::{self, ApplicationJoinEvent, GatewayRxMessage};
use crate::region::cn470::datr_to_dr;
use crate::storage::{DeviceKeys, DeviceSession, EventKind, EventLogEntry};

pub(crate) async fn handle_join(
    pipeline: &UplinkPipeline,
    msg: &GatewayRxMessage,
    phy: &[u8],
    request: JoinRequestPayload,
    mic: Mic,
) -> Result<(), NsError> {
    let (dev_eui, keys) = lookup_keys(pipeline, request.dev_eui).await?;

    // MIC covers MHDR | JoinEUI | DevEUI | DevNonce under the AppKey.
    let expected = security::calculate_join_request_mic(&phy[..phy.len() - 4], &keys.app_key);
    if expected != mic {
        return Err(NsError::MicValidationFailed);
    }

    let mut device = pipeline
        .store
        .device_get(dev_eui)
        .await?
        .ok_or_else(|| NsError::UnknownDevice(format!("no device row for {dev_eui}")))?;
    if device.is_disabled {
        return Err(NsError::UnknownDevice(format!("device {dev_eui} is disabled")));
    }

    let dev_addr = DevAddr::from_u32(rand::thread_rng().gen());
    let join_nonce: u32 = rand::thread_rng().gen_range(0..0x100_0000);

    let nwk_s_key =
        security::derive_nwk_s_key(&keys.nwk_key, join_nonce, pipeline.net_id, request.dev_nonce);
    let app_s_key =
        security::derive_app_s_key(&keys.app_key, join_nonce, pipeline.net_id, request.dev_nonce);

    // The old session (and its counters) must not survive a re-join.
    pipeline.store.device_session_delete(dev_eui).await?;

    let rx_windows = &pipeline.config.cn470.rx_windows;
    let uplink_dr = datr_to_dr(&msg.rxpk.datr)?;
    let session = DeviceSession {
        dev_eui,
        dev_addr,
        join_eui: request.join_eui,
        app_s_key,
        f_nwk_s_int_key: nwk_s_key,
        s_nwk_s_int_key: nwk_s_key,
        nwk_s_enc_key: nwk_s_key,
        f_cnt_up: 0,
        n_f_cnt_down: 0,
        a_f_cnt_down: 0,
        conf_f_cnt: 0,
        rx1_delay: rx_windows.rx1_delay,
        rx1_dr_offset: rx_windows.rx1_dr_offset,
        rx2_dr: pipeline.region.rx2_data_rate,
        rx2_freq: pipeline.region.rx2_frequency,
        dr: uplink_dr,
        tx_power: 0,
        adr: false,
        enabled_channels: pipeline.region.default_enabled_channels(),
        adr_history: Vec::new(),
    };

    device.dev_addr = Some(dev_addr);
    device.f_cnt_up = 0;
    device.n_f_cnt_down = 0;
    device.a_f_cnt_down = 0;
    pipeline.store.device_update(device.clone()).await?;
    pipeline.store.device_session_save(session).await?;

    let accept_phy = build_join_accept(pipeline, &keys, join_nonce, dev_addr)?;

    // Aim the accept at the gateway that heard the request.
    pipeline
        .rx_cache
        .insert(
            dev_eui,
            msg.gateway_id.clone(),
            msg.rxpk.clone(),
            Some(msg.context.clone()),
        )
        .await;
    pipeline
        .tracker
        .update_and_check(&msg.gateway_id, msg.rxpk.tmst, true)
        .await;
    pipeline
        .store
        .device_gateway_set(dev_eui, &msg.gateway_id)
        .await?;

    pipeline
        .scheduler
        .schedule(DownlinkRequest {
            dev_eui,
            phy: accept_phy.clone(),
            delay: Duration::from_secs(rx_windows.join_accept_delay1 as u64),
            use_rx2: false,
            rx1_dr_offset: 0,
            rx2_dr: pipeline.region.rx2_data_rate,
            rx2_freq: pipeline.region.rx2_frequency,
        })
        .await?;
    if rx_windows.join_accept_rx2 {
        pipeline
            .scheduler
            .schedule(DownlinkRequest {
                dev_eui,
                phy: accept_phy,
                delay: Duration::from_secs(rx_windows.join_accept_delay2 as u64),
                use_rx2: true,
                rx1_dr_offset: 0,
                rx2_dr: pipeline.region.rx2_data_rate,
                rx2_freq: pipeline.region.rx2_frequency,
            })
            .await?;
    }

    let event = ApplicationJoinEvent {
        application_id: device.application_id.clone(),
        dev_eui,
        dev_addr,
    };
    let payload = serde_json::to_vec(&event)
        .map_err(|e| NsError::Internal(format!("join event serialization: {e}")))?;
    pipeline
        .bus
        .publish(
            &messages::application_join_subject(&device.application_id, dev_eui),
            payload,
        )
        .await?;

    pipeline
        .store
        .event_log_insert(EventLogEntry::now(
            EventKind::Join,
            Some(dev_eui),
            format!("devNonce={} devAddr={dev_addr}", request.dev_nonce),
        ))
        .await?;

    info!(
        "device {dev_eui} joined with devAddr {dev_addr} via gateway {}",
        msg.gateway_id
    );
    Ok(())
}

/// Look up root keys by DevEUI, falling back once to the byte-reversed
/// EUI. The returned EUI is the one that matched and keys the session.
async fn lookup_keys(
    pipeline: &UplinkPipeline,
    dev_eui: Eui64,
) -> Result<(Eui64, DeviceKeys), NsError> {
    if let Some(keys) = pipeline.store.device_keys_get(dev_eui).await? {
        return Ok((dev_eui, keys));
    }
    let reversed = dev_eui.reversed();
    if let Some(keys) = pipeline.store.device_keys_get(reversed).await? {
        debug!("device keys found under byte-reversed EUI {reversed}");
        return Ok((reversed, keys));
    }
    Err(NsError::UnknownDevice(format!("no keys for DevEUI {dev_eui}")))
}

/// Build the encrypted Join-Accept PHY payload. The plaintext and its MIC
/// are encrypted in one ECB-inverse pass with the AppKey.
fn build_join_accept(
    pipeline: &UplinkPipeline,
    keys: &DeviceKeys,
    join_nonce: u32,
    dev_addr: DevAddr,
) -> Result<Vec<u8>, NsError> {
    let rx_windows = &pipeline.config.cn470.rx_windows;
    let accept = JoinAcceptPayload {
        join_nonce,
        net_id: pipeline.net_id,
        dev_addr,
        dl_settings: DlSettings {
            rx1_dr_offset: rx_windows.rx1_dr_offset,
            rx2_data_rate: pipeline.region.rx2_data_rate,
        },
        rx_delay: rx_windows.rx1_delay,
        cf_list: pipeline
            .region
            .cf_list_enabled
            .then(|| pipeline.region.cf_list()),
    };

    let mhdr = Mhdr::new(MType::JoinAccept);
    let mut plain = accept.encode();
    let mic = security::calculate_join_accept_mic(mhdr.encode(), &plain, &keys.app_key);
    plain.extend_from_slice(mic.as_bytes());

    let encrypted = security::encrypt_join_accept(&keys.app_key, &plain)?;
    let mut phy = Vec::with_capacity(1 + encrypted.len());
    phy.push(mhdr.encode());
    phy.extend_from_slice(&encrypted);
    Ok(phy)
}
