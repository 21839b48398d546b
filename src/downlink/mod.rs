//! Downlink scheduling.
//!
//! A downlink must reach the device inside a receive window measured in
//! the gateway's own 32-bit microsecond counter domain. When that counter
//! is trustworthy the PULL_RESP carries `tmst = uplink tmst + delay`;
//! when it is not (fresh boot, drift, imminent wrap) the scheduler
//! degrades to immediate transmission, which costs window accuracy but
//! never strands the frame.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::NsError;
use crate::gateway::protocol::Txpk;
use crate::gateway::tracker::TimestampTracker;
use crate::lorawan::keys::Eui64;
use crate::messages::{self, GatewayTxMessage, TxTiming};
use crate::region::cn470::{datr_to_dr, dr_to_datr, hz_to_mhz, mhz_to_hz};
use crate::region::Cn470Region;
use crate::storage::Store;
use crate::uplink::rxcache::DeviceRxCache;

/// Counter values below this mean the gateway just booted and its
/// counter cannot be trusted yet.
const FRESH_BOOT_WINDOW_US: u64 = 60_000_000;
/// Counter values above this are too close to the 32-bit wrap.
const WRAP_GUARD_US: u64 = 4_000_000_000;
/// Minimum margin past the wrap for a wrapped target to be reachable.
const WRAP_PREP_US: u64 = 50_000;
/// Minimum scheduling distance after the uplink.
const MIN_DELAY_US: u64 = 200_000;

/// Timing decision for one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingDecision {
    /// Transmit at this counter value.
    Timed(u64),
    /// Transmit as soon as possible.
    Immediate,
}

/// Decide between timed and immediate transmission for a downlink
/// `delay` after an uplink observed at `uplink_tmst`.
pub fn decide_timing(reliable: bool, uplink_tmst: u64, delay: Duration) -> TimingDecision {
    if !reliable || delay.is_zero() {
        return TimingDecision::Immediate;
    }
    if uplink_tmst < FRESH_BOOT_WINDOW_US {
        debug!("uplink tmst {uplink_tmst} inside fresh-boot window, using immediate TX");
        return TimingDecision::Immediate;
    }
    if uplink_tmst > WRAP_GUARD_US {
        debug!("uplink tmst {uplink_tmst} approaching 32-bit wrap, using immediate TX");
        return TimingDecision::Immediate;
    }
    let delay_us = (delay.as_micros() as u64).max(MIN_DELAY_US);
    let target = uplink_tmst + delay_us;
    let wrapped = target >> 32 != 0;
    let target = target & 0xFFFF_FFFF;
    if wrapped && target < WRAP_PREP_US {
        debug!("downlink tmst lands {target} us past the wrap, using immediate TX");
        return TimingDecision::Immediate;
    }
    TimingDecision::Timed(target)
}

/// A downlink to deliver to one device.
#[derive(Debug, Clone)]
pub struct DownlinkRequest {
    pub dev_eui: Eui64,
    pub phy: Vec<u8>,
    /// Window delay after the triggering uplink.
    pub delay: Duration,
    /// Use the RX2 frequency and data rate instead of deriving RX1.
    pub use_rx2: bool,
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_freq: u32,
}

pub struct DownlinkScheduler {
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    region: Arc<Cn470Region>,
    tracker: TimestampTracker,
    rx_cache: DeviceRxCache,
}

impl DownlinkScheduler {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn Store>,
        region: Arc<Cn470Region>,
        tracker: TimestampTracker,
        rx_cache: DeviceRxCache,
    ) -> Self {
        DownlinkScheduler {
            bus,
            store,
            region,
            tracker,
            rx_cache,
        }
    }

    /// Build and publish the gateway TX message for a downlink request.
    pub async fn schedule(&self, req: DownlinkRequest) -> Result<(), NsError> {
        let rx_info = self.rx_cache.get(req.dev_eui).await;

        let (gateway_id, uplink, context) = match rx_info {
            Some(info) => (info.gateway_id, Some(info.rxpk), info.context),
            None => {
                // The cache expired; fall back to the last gateway the
                // store remembers and transmit immediately on RX2.
                let gateway_id = self
                    .store
                    .last_gateway_for_device(req.dev_eui)
                    .await?
                    .ok_or_else(|| {
                        NsError::UnknownDevice(format!(
                            "no gateway known for device {}",
                            req.dev_eui
                        ))
                    })?;
                (gateway_id, None, None)
            }
        };

        let (freq_hz, dr) = match (&uplink, req.use_rx2) {
            (Some(rxpk), false) => {
                let uplink_dr = datr_to_dr(&rxpk.datr)?;
                (
                    self.region.downlink_frequency(mhz_to_hz(rxpk.freq)),
                    self.region.rx1_data_rate(uplink_dr, req.rx1_dr_offset),
                )
            }
            _ => (req.rx2_freq, req.rx2_dr),
        };

        let timing = match &uplink {
            Some(rxpk) => {
                let reliable = self.tracker.is_reliable(&gateway_id).await;
                decide_timing(reliable, rxpk.tmst, req.delay)
            }
            None => TimingDecision::Immediate,
        };
        if timing == TimingDecision::Immediate && !req.delay.is_zero() {
            warn!(
                "downlink for {} degraded to immediate TX via gateway {gateway_id}",
                req.dev_eui
            );
        }

        let txpk = Txpk {
            imme: Some(timing == TimingDecision::Immediate),
            tmst: match timing {
                TimingDecision::Timed(tmst) => Some(tmst),
                TimingDecision::Immediate => None,
            },
            freq: hz_to_mhz(freq_hz),
            rfch: Some(0),
            powe: Some(self.region.downlink_tx_power),
            ant: None,
            brd: None,
            modu: Some("LORA".to_string()),
            datr: dr_to_datr(dr)?,
            codr: Some("4/5".to_string()),
            ipol: Some(true),
            size: req.phy.len() as u16,
            data: messages::base64_encode(&req.phy),
            ncrc: None,
        };

        let msg = GatewayTxMessage {
            gateway_id: gateway_id.clone(),
            txpk,
            context,
            timing: Some(match timing {
                TimingDecision::Timed(_) => TxTiming::Timed,
                TimingDecision::Immediate => TxTiming::Immediate,
            }),
        };

        let payload = serde_json::to_vec(&msg)
            .map_err(|e| NsError::Internal(format!("tx message serialization: {e}")))?;
        self.bus
            .publish(&messages::gateway_tx_subject(&gateway_id), payload)
            .await?;
        debug!(
            "scheduled downlink for {} via gateway {gateway_id} ({:?})",
            req.dev_eui, timing
        );
        Ok(())
    }
}
