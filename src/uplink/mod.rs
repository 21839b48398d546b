//! Uplink pipeline.
//!
//! Subscribes to the bridge's `gateway.*.rx` stream, deduplicates
//! receptions, and dispatches by message type: Join Requests go through
//! OTAA activation, data uplinks through MIC scan, counter
//! reconciliation and decryption. Application downlink requests arriving
//! on `ns.device.*.tx` are queued here for the device's next receive
//! window.

pub mod data;
pub mod dedup;
pub mod join;
pub mod rxcache;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bus::Bus;
use crate::config::Config;
use crate::downlink::DownlinkScheduler;
use crate::error::NsError;
use crate::gateway::tracker::TimestampTracker;
use crate::lorawan::PhyPayload;
use crate::mac::MacHandler;
use crate::messages::{self, DeviceTxRequest, GatewayRxMessage, GatewayTxAckMessage};
use crate::region::Cn470Region;
use crate::storage::{EventKind, EventLogEntry, PendingDownlink, Store};
use dedup::DedupCache;
use rxcache::DeviceRxCache;

/// Join Requests are deduplicated over a shorter window than data
/// uplinks: the accept must go out before the device retries anyway.
const JOIN_DEDUP_TTL: Duration = Duration::from_secs(10);

pub struct UplinkPipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) region: Arc<Cn470Region>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) net_id: [u8; 3],
    pub(crate) dedup: DedupCache,
    pub(crate) rx_cache: DeviceRxCache,
    pub(crate) tracker: TimestampTracker,
    pub(crate) scheduler: DownlinkScheduler,
    pub(crate) mac_handler: MacHandler,
}

impl UplinkPipeline {
    pub fn new(
        config: Arc<Config>,
        region: Arc<Cn470Region>,
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        tracker: TimestampTracker,
        rx_cache: DeviceRxCache,
    ) -> Result<Arc<Self>, NsError> {
        let net_id = config.network.net_id_bytes()?;
        let scheduler = DownlinkScheduler::new(
            bus.clone(),
            store.clone(),
            region.clone(),
            tracker.clone(),
            rx_cache.clone(),
        );
        let mac_handler = MacHandler::new(store.clone());
        Ok(Arc::new(UplinkPipeline {
            config,
            region,
            store,
            bus,
            net_id,
            dedup: DedupCache::new(),
            rx_cache,
            tracker,
            scheduler,
            mac_handler,
        }))
    }

    /// Spawn the subscription loops and background sweepers.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.dedup.spawn_sweeper(shutdown.clone());
        self.tracker.spawn_sweeper(shutdown.clone());

        self.spawn_subscription("gateway.*.rx", shutdown.clone(), |pipeline, payload| async move {
            pipeline.handle_gateway_rx(&payload).await
        })
        .await;
        self.spawn_subscription("ns.device.*.tx", shutdown.clone(), |pipeline, payload| async move {
            pipeline.handle_device_tx(&payload).await
        })
        .await;
        self.spawn_subscription("gateway.*.txack", shutdown, |pipeline, payload| async move {
            pipeline.handle_txack(&payload).await
        })
        .await;
        info!("uplink pipeline started");
    }

    async fn spawn_subscription<F, Fut>(
        self: &Arc<Self>,
        pattern: &'static str,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) where
        F: Fn(Arc<UplinkPipeline>, Vec<u8>) -> Fut + Send + Sync + Copy + 'static,
        Fut: std::future::Future<Output = Result<(), NsError>> + Send,
    {
        let pipeline = self.clone();
        let mut rx = self.bus.subscribe(pattern).await;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            let pipeline = pipeline.clone();
                            // Handlers run in independent tasks so one
                            // slow device never queues behind another.
                            tokio::spawn(async move {
                                if let Err(e) = handler(pipeline, msg.payload).await {
                                    log_pipeline_error(pattern, &e);
                                }
                            });
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Process one reception from a gateway.
    pub async fn handle_gateway_rx(&self, payload: &[u8]) -> Result<(), NsError> {
        let msg: GatewayRxMessage = serde_json::from_slice(payload)
            .map_err(|e| NsError::MalformedFrame(format!("invalid gateway rx message: {e}")))?;
        let phy = messages::base64_decode(&msg.rxpk.data)?;
        let frame = PhyPayload::parse(&phy)?;
        debug!("uplink via {}: {frame}", msg.gateway_id);

        match frame {
            PhyPayload::JoinRequest {
                payload: request,
                mic,
                ..
            } => {
                let key = DedupCache::join_key(&request.dev_eui, request.dev_nonce);
                if !self.dedup.check_and_insert(key.clone(), JOIN_DEDUP_TTL).await {
                    return Err(NsError::DuplicateFrame(key));
                }
                join::handle_join(self, &msg, &phy, request, mic).await
            }
            PhyPayload::Data {
                mhdr,
                payload: mac,
                mic,
            } if mhdr.mtype.is_uplink() => {
                let key = DedupCache::data_key(&mac.fhdr.dev_addr, mac.fhdr.fcnt, &mic);
                if !self
                    .dedup
                    .check_and_insert(key.clone(), self.config.network.deduplication_window())
                    .await
                {
                    data::merge_duplicate_rx(self, &msg, &mac, &mic, &phy).await;
                    return Err(NsError::DuplicateFrame(key));
                }
                data::handle_data_up(self, &msg, &phy, mac, mic, mhdr.mtype).await
            }
            other => {
                debug!("ignoring {other} from gateway {}", msg.gateway_id);
                Ok(())
            }
        }
    }

    /// Queue an application downlink for the device's next window.
    pub async fn handle_device_tx(&self, payload: &[u8]) -> Result<(), NsError> {
        let req: DeviceTxRequest = serde_json::from_slice(payload)
            .map_err(|e| NsError::MalformedFrame(format!("invalid device tx request: {e}")))?;
        let data = messages::base64_decode(&req.data)?;

        let device = self
            .store
            .device_get(req.dev_eui)
            .await?
            .ok_or_else(|| NsError::UnknownDevice(format!("no device row for {}", req.dev_eui)))?;

        let id = self
            .store
            .pending_downlink_create(PendingDownlink {
                id: 0,
                dev_eui: req.dev_eui,
                application_id: device.application_id,
                f_port: req.f_port,
                data,
                confirmed: req.confirmed,
                is_pending: false,
                retry_count: 0,
                reference: req.id.unwrap_or_default(),
            })
            .await?;

        self.store
            .event_log_insert(EventLogEntry::now(
                EventKind::DownlinkQueued,
                Some(req.dev_eui),
                format!("downlink {id} queued on fPort {}", req.f_port),
            ))
            .await?;
        debug!("queued downlink {id} for {}", req.dev_eui);
        Ok(())
    }

    /// Audit gateway transmission acknowledgements.
    async fn handle_txack(&self, payload: &[u8]) -> Result<(), NsError> {
        let msg: GatewayTxAckMessage = serde_json::from_slice(payload)
            .map_err(|e| NsError::MalformedFrame(format!("invalid txack message: {e}")))?;
        let mut entry = EventLogEntry::now(
            EventKind::DownlinkAck,
            None,
            match msg.ack.error.as_deref() {
                None | Some("NONE") => format!("token {} transmitted", msg.token),
                Some(err) => format!("token {} failed: {err}", msg.token),
            },
        );
        entry.gateway_id = Some(msg.gateway_id);
        self.store.event_log_insert(entry).await
    }
}

fn log_pipeline_error(pattern: &str, e: &NsError) {
    if e.is_frame_drop() {
        debug!("{pattern}: dropped: {e}");
    } else {
        error!("{pattern}: processing failed: {e}");
    }
}
