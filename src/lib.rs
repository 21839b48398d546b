//! CN470 LoRaWAN network server core.
//!
//! Accepts raw radio frames forwarded over the Semtech packet-forwarder
//! UDP protocol, validates and decrypts them against per-device
//! cryptographic sessions, schedules downlinks into the receive-window
//! time budgets of the CN470 band, and publishes decrypted application
//! payloads on a pub/sub bus.
//!
//! The management API, downstream integrations and the relational store
//! are external collaborators reached only through the [`bus::Bus`] and
//! [`storage::Store`] seams.

pub mod bus;
pub mod config;
pub mod crypto;
pub mod downlink;
pub mod error;
pub mod gateway;
pub mod lorawan;
pub mod mac;
pub mod messages;
pub mod region;
pub mod storage;
pub mod uplink;
