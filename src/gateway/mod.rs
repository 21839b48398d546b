//! Semtech UDP gateway bridge.
//!
//! One UDP socket serves every gateway. Gateways typically run their
//! uplink (PUSH_DATA) and downlink (PULL_DATA keepalive) flows over
//! distinct source ports, so the bridge tracks both addresses per gateway
//! and always delivers PULL_RESP to the address learned from the last
//! PULL_DATA, echoing its token bytes.

pub mod protocol;
pub mod tracker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::error::NsError;
use crate::messages::{
    self, GatewayRxMessage, GatewayStatMessage, GatewayTxAckMessage, GatewayTxMessage,
    UplinkContext,
};
use crate::storage::Store;
use protocol::{GwmpPacket, PullRespPayload, PushDataPayload, TxAckPayload};

/// Gateways silent for this long are forgotten.
const GATEWAY_MAX_IDLE: Duration = Duration::from_secs(300);
/// Eviction sweep interval.
const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Transport state for one gateway.
#[derive(Debug, Clone)]
pub struct GatewayRuntime {
    pub push_addr: Option<SocketAddr>,
    pub pull_addr: Option<SocketAddr>,
    pub last_seen: Instant,
    pub last_pull: Option<Instant>,
    pub pull_token: [u8; 2],
}

impl GatewayRuntime {
    fn new() -> Self {
        GatewayRuntime {
            push_addr: None,
            pull_addr: None,
            last_seen: Instant::now(),
            last_pull: None,
            pull_token: [0, 0],
        }
    }
}

/// Shared map of gateway transport state, keyed by the hex gateway id.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    inner: Arc<RwLock<HashMap<String, GatewayRuntime>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        GatewayRegistry::default()
    }

    pub async fn note_push(&self, gateway_id: &str, addr: SocketAddr) {
        let mut map = self.inner.write().await;
        let entry = map
            .entry(gateway_id.to_string())
            .or_insert_with(GatewayRuntime::new);
        if entry.push_addr != Some(addr) {
            info!("gateway {gateway_id}: uplink address {addr}");
        }
        entry.push_addr = Some(addr);
        entry.last_seen = Instant::now();
    }

    pub async fn note_pull(&self, gateway_id: &str, addr: SocketAddr, token: [u8; 2]) {
        let mut map = self.inner.write().await;
        let entry = map
            .entry(gateway_id.to_string())
            .or_insert_with(GatewayRuntime::new);
        if entry.pull_addr != Some(addr) {
            info!("gateway {gateway_id}: downlink address {addr}");
        }
        entry.pull_addr = Some(addr);
        entry.pull_token = token;
        entry.last_seen = Instant::now();
        entry.last_pull = Some(Instant::now());
    }

    pub async fn touch(&self, gateway_id: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(gateway_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Downlink delivery target: the PULL_DATA source address plus the
    /// token bytes a PULL_RESP must echo.
    pub async fn pull_target(&self, gateway_id: &str) -> Option<(SocketAddr, [u8; 2])> {
        let map = self.inner.read().await;
        let entry = map.get(gateway_id)?;
        entry.pull_addr.map(|addr| (addr, entry.pull_token))
    }

    pub async fn evict_idle(&self) {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, e| e.last_seen.elapsed() < GATEWAY_MAX_IDLE);
        let evicted = before - map.len();
        if evicted > 0 {
            info!("evicted {evicted} idle gateway(s)");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

struct BridgeShared {
    socket: UdpSocket,
    registry: GatewayRegistry,
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
}

/// The running UDP bridge.
pub struct GatewayBridge {
    shared: Arc<BridgeShared>,
    local_addr: SocketAddr,
}

impl GatewayBridge {
    /// Bind the socket and spawn the receive loop, the `gateway.*.tx`
    /// subscription and the eviction sweeper.
    pub async fn start(
        bind: &str,
        bus: Arc<dyn Bus>,
        store: Arc<dyn Store>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, NsError> {
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| NsError::Internal(format!("failed to bind UDP socket {bind}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NsError::Internal(format!("local_addr: {e}")))?;
        info!("gateway bridge listening on {local_addr}");

        let shared = Arc::new(BridgeShared {
            socket,
            registry: GatewayRegistry::new(),
            bus,
            store,
        });

        let bridge = GatewayBridge {
            shared: shared.clone(),
            local_addr,
        };

        // Subscribe before spawning so no downlink published during
        // startup is missed.
        let tx_rx = shared.bus.subscribe("gateway.*.tx").await;
        bridge.spawn_recv_loop(shutdown.clone());
        bridge.spawn_tx_subscription(tx_rx, shutdown.clone());
        bridge.spawn_eviction(shutdown);

        Ok(bridge)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> GatewayRegistry {
        self.shared.registry.clone()
    }

    fn spawn_recv_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    result = shared.socket.recv_from(&mut buf) => match result {
                        Ok((len, src)) => {
                            debug!("received {len} bytes from {src}");
                            let datagram = buf[..len].to_vec();
                            let shared = shared.clone();
                            // Each datagram is handled in its own task so a
                            // slow store or bus never stalls the socket.
                            tokio::spawn(async move {
                                handle_datagram(&shared, src, &datagram).await;
                            });
                        }
                        Err(e) => error!("UDP recv error: {e}"),
                    },
                    _ = shutdown.changed() => {
                        info!("gateway bridge shutting down");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_tx_subscription(
        &self,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<crate::bus::BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_tx_message(&shared, &msg.payload).await {
                                    warn!("downlink not delivered: {e}");
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

    fn spawn_eviction(&self, mut shutdown: watch::Receiver<bool>) {
        let registry = self.shared.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.evict_idle().await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

async fn handle_datagram(shared: &BridgeShared, src: SocketAddr, datagram: &[u8]) {
    let packet = match GwmpPacket::parse(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("failed to parse datagram from {src}: {e}");
            return;
        }
    };

    match packet {
        GwmpPacket::PushData {
            token,
            gateway_mac,
            json_payload,
        } => {
            let gateway_id = hex::encode(gateway_mac);
            debug!(
                "PUSH_DATA from gateway {gateway_id} (token 0x{:02x}{:02x})",
                token[0], token[1]
            );

            // Acknowledge before any parsing so the forwarder never
            // retries on our account.
            if let Err(e) = shared.socket.send_to(&GwmpPacket::push_ack(token), src).await {
                error!("failed to send PUSH_ACK to {src}: {e}");
            }

            shared.registry.note_push(&gateway_id, src).await;
            if let Err(e) = shared.store.gateway_ensure(&gateway_id).await {
                error!("gateway auto-register failed for {gateway_id}: {e}");
            }

            let payload = match serde_json::from_str::<PushDataPayload>(&json_payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("failed to parse PUSH_DATA JSON from {gateway_id}: {e}");
                    debug!("raw JSON: {json_payload}");
                    return;
                }
            };

            let timestamp = chrono::Utc::now().timestamp();

            for rxpk in payload.rxpk.unwrap_or_default() {
                debug!(
                    "rxpk: freq={} MHz rssi={} dBm datr={} size={}B",
                    rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size
                );
                let context = UplinkContext {
                    gateway_id: gateway_id.clone(),
                    tmst: rxpk.tmst as f64,
                }
                .encode();
                let event = GatewayRxMessage {
                    gateway_id: gateway_id.clone(),
                    rxpk,
                    context,
                    timestamp,
                };
                publish_json(shared, &messages::gateway_rx_subject(&gateway_id), &event).await;
            }

            if let Some(stat) = payload.stat {
                let event = GatewayStatMessage {
                    gateway_id: gateway_id.clone(),
                    stat,
                    timestamp,
                };
                publish_json(shared, &messages::gateway_stat_subject(&gateway_id), &event).await;
            }
        }
        GwmpPacket::PullData { token, gateway_mac } => {
            let gateway_id = hex::encode(gateway_mac);
            debug!(
                "PULL_DATA from gateway {gateway_id} (token 0x{:02x}{:02x})",
                token[0], token[1]
            );
            shared.registry.note_pull(&gateway_id, src, token).await;
            if let Err(e) = shared.socket.send_to(&GwmpPacket::pull_ack(token), src).await {
                error!("failed to send PULL_ACK to {src}: {e}");
            }
        }
        GwmpPacket::TxAck {
            token,
            gateway_mac,
            json_payload,
        } => {
            let gateway_id = hex::encode(gateway_mac);
            shared.registry.touch(&gateway_id).await;

            let ack = json_payload
                .as_deref()
                .and_then(|json| serde_json::from_str::<TxAckPayload>(json).ok())
                .and_then(|payload| payload.txpk_ack)
                .unwrap_or(protocol::TxpkAck { error: None });

            match ack.error.as_deref() {
                None | Some("NONE") => {
                    debug!("TX_ACK from gateway {gateway_id}: ok");
                }
                Some(err) => {
                    warn!("TX_ACK from gateway {gateway_id}: error {err}");
                }
            }

            let event = GatewayTxAckMessage {
                gateway_id: gateway_id.clone(),
                token: u16::from_be_bytes(token),
                ack,
            };
            publish_json(shared, &messages::gateway_txack_subject(&gateway_id), &event).await;
        }
    }
}

async fn handle_tx_message(shared: &BridgeShared, payload: &[u8]) -> Result<(), NsError> {
    let msg: GatewayTxMessage = serde_json::from_slice(payload)
        .map_err(|e| NsError::MalformedFrame(format!("invalid gateway tx message: {e}")))?;

    let (pull_addr, token) = shared
        .registry
        .pull_target(&msg.gateway_id)
        .await
        .ok_or_else(|| {
            NsError::Internal(format!(
                "gateway {} has no known downlink address (no PULL_DATA yet)",
                msg.gateway_id
            ))
        })?;

    let json = serde_json::to_string(&PullRespPayload { txpk: msg.txpk })
        .map_err(|e| NsError::Internal(format!("txpk serialization: {e}")))?;
    let datagram = GwmpPacket::pull_resp(token, &json);

    shared
        .socket
        .send_to(&datagram, pull_addr)
        .await
        .map_err(|e| NsError::Internal(format!("send PULL_RESP to {pull_addr}: {e}")))?;
    info!(
        "sent PULL_RESP to gateway {} at {pull_addr} ({} bytes)",
        msg.gateway_id,
        json.len()
    );
    Ok(())
}

async fn publish_json<T: serde::Serialize>(shared: &BridgeShared, subject: &str, value: &T) {
    match serde_json::to_vec(value) {
        Ok(payload) => {
            if let Err(e) = shared.bus.publish(subject, payload).await {
                error!("publish {subject} failed: {e}");
            }
        }
        Err(e) => error!("serialize for {subject} failed: {e}"),
    }
}
