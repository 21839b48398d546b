//! Server configuration, loaded from a single YAML file.
//!
//! Every section has working defaults so a missing file still yields a
//! runnable development configuration; `validate` is what decides whether
//! the process may start.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NsError;
use crate::region::Cn470Mode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub cn470: Cn470Config,
    pub gateway: GatewayConfig,
    pub nats: NatsConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Regional band; only CN470 is supported by this core.
    pub band: String,
    /// 3-byte network identifier, hex.
    pub net_id: String,
    /// Data-uplink deduplication window in seconds.
    pub deduplication_window: u64,
    /// Idle device-session lifetime in seconds.
    pub device_session_ttl: u64,
    pub adr_enabled: bool,
    /// Accept fCnt 0 as a device reboot when the stored counter is 1.
    /// The heuristic is narrow and can over-accept, hence the gate.
    pub device_reboot_fcnt_reset: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            band: "CN470".to_string(),
            net_id: "000013".to_string(),
            deduplication_window: 30,
            device_session_ttl: 2_592_000,
            adr_enabled: true,
            device_reboot_fcnt_reset: true,
        }
    }
}

impl NetworkConfig {
    pub fn net_id_bytes(&self) -> Result<[u8; 3], NsError> {
        let bytes = hex::decode(&self.net_id)
            .map_err(|e| NsError::ConfigInvalid(format!("network.net_id: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| NsError::ConfigInvalid("network.net_id must be 3 bytes".into()))
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_secs(self.deduplication_window)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cn470Config {
    pub mode: Cn470Mode,
    pub hardware: HardwareConfig,
    pub standard_fdd: BandPlanConfig,
    pub custom_fdd: BandPlanConfig,
    pub tdd: BandPlanConfig,
    pub rx_windows: RxWindowsConfig,
    pub channels: ChannelsConfig,
    pub adr: AdrConfig,
    /// Downlink transmit power handed to the gateway, dBm.
    pub downlink_tx_power: i8,
}

impl Default for Cn470Config {
    fn default() -> Self {
        Cn470Config {
            mode: Cn470Mode::StandardFdd,
            hardware: HardwareConfig::default(),
            standard_fdd: BandPlanConfig {
                uplink_start_freq: 470_300_000,
                uplink_end_freq: 489_300_000,
                downlink_start_freq: 500_300_000,
                downlink_end_freq: 509_700_000,
                frequency_offset: 30_000_000,
                uplink_channel_count: 96,
            },
            custom_fdd: BandPlanConfig {
                uplink_start_freq: 470_300_000,
                uplink_end_freq: 479_900_000,
                downlink_start_freq: 480_300_000,
                downlink_end_freq: 489_900_000,
                frequency_offset: 10_000_000,
                uplink_channel_count: 48,
            },
            tdd: BandPlanConfig {
                uplink_start_freq: 470_300_000,
                uplink_end_freq: 489_300_000,
                downlink_start_freq: 470_300_000,
                downlink_end_freq: 489_300_000,
                frequency_offset: 0,
                uplink_channel_count: 96,
            },
            rx_windows: RxWindowsConfig::default(),
            channels: ChannelsConfig::default(),
            adr: AdrConfig::default(),
            downlink_tx_power: 17,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub supports_tx_500mhz: bool,
    pub supports_tx_470_490mhz: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            supports_tx_500mhz: true,
            supports_tx_470_490mhz: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BandPlanConfig {
    pub uplink_start_freq: u32,
    pub uplink_end_freq: u32,
    pub downlink_start_freq: u32,
    pub downlink_end_freq: u32,
    pub frequency_offset: u32,
    pub uplink_channel_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RxWindowsConfig {
    /// RX1 delay after a data uplink, seconds.
    pub rx1_delay: u8,
    pub rx2_delay: u8,
    pub join_accept_delay1: u8,
    pub join_accept_delay2: u8,
    /// Whether to also schedule the Join-Accept in RX2.
    pub join_accept_rx2: bool,
    pub rx2_frequency: u32,
    pub rx2_data_rate: u8,
    pub rx1_dr_offset: u8,
}

impl Default for RxWindowsConfig {
    fn default() -> Self {
        RxWindowsConfig {
            rx1_delay: 5,
            rx2_delay: 6,
            join_accept_delay1: 5,
            join_accept_delay2: 6,
            join_accept_rx2: false,
            rx2_frequency: 505_300_000,
            rx2_data_rate: 0,
            rx1_dr_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub channel_spacing: u32,
    pub default_channels: usize,
    pub max_channels_per_device: usize,
    pub enabled_sub_bands: Vec<u8>,
    /// Append a CFList to Join-Accept frames.
    pub cf_list_enabled: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        ChannelsConfig {
            channel_spacing: 200_000,
            default_channels: 8,
            max_channels_per_device: 16,
            enabled_sub_bands: vec![0],
            cf_list_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdrConfig {
    pub target_snr: f64,
    pub margin_snr: f64,
    pub history_size: usize,
    pub min_data_rate: u8,
    pub max_data_rate: u8,
    pub min_tx_power: u8,
    pub max_tx_power: u8,
}

impl Default for AdrConfig {
    fn default() -> Self {
        AdrConfig {
            target_snr: 5.0,
            margin_snr: 2.5,
            history_size: 20,
            min_data_rate: 0,
            max_data_rate: 5,
            min_tx_power: 0,
            max_tx_power: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub udp_bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            udp_bind: "0.0.0.0:1700".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub url: String,
    pub reconnect: bool,
    pub credentials: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        NatsConfig {
            url: "nats://127.0.0.1:4222".to_string(),
            reconnect: true,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            dsn: "postgres://localhost/lorans?sslmode=disable".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, NsError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NsError::ConfigInvalid(format!("failed to read config file {path:?}: {e}"))
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| NsError::ConfigInvalid(format!("failed to parse config file: {e}")))?;
        Ok(config)
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), NsError> {
        if self.network.band != "CN470" {
            return Err(NsError::ConfigInvalid(format!(
                "unsupported band {:?}, this core serves CN470 only",
                self.network.band
            )));
        }
        self.network.net_id_bytes()?;
        if self.cn470.rx_windows.rx2_data_rate > 5 {
            return Err(NsError::ConfigInvalid(
                "cn470.rx_windows.rx2_data_rate must be 0..=5".into(),
            ));
        }
        if self.cn470.rx_windows.rx1_delay == 0 {
            return Err(NsError::ConfigInvalid(
                "cn470.rx_windows.rx1_delay must be at least 1 second".into(),
            ));
        }
        let adr = &self.cn470.adr;
        if adr.min_data_rate > adr.max_data_rate || adr.max_data_rate > 5 {
            return Err(NsError::ConfigInvalid(
                "cn470.adr data-rate bounds are inconsistent".into(),
            ));
        }
        if adr.min_tx_power > adr.max_tx_power {
            return Err(NsError::ConfigInvalid(
                "cn470.adr TX-power bounds are inconsistent".into(),
            ));
        }
        if adr.history_size == 0 {
            return Err(NsError::ConfigInvalid(
                "cn470.adr.history_size must be positive".into(),
            ));
        }
        if self.gateway.udp_bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(NsError::ConfigInvalid(format!(
                "gateway.udp_bind is not a socket address: {:?}",
                self.gateway.udp_bind
            )));
        }
        if self.nats.url.is_empty() {
            return Err(NsError::ConfigInvalid("nats.url must not be empty".into()));
        }
        if self.database.dsn.is_empty() {
            return Err(NsError::ConfigInvalid("database.dsn must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.network.net_id_bytes().unwrap(), [0x00, 0x00, 0x13]);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
network:
  net_id: "aabbcc"
  adr_enabled: false
cn470:
  mode: CUSTOM_FDD
  rx_windows:
    rx2_frequency: 492500000
gateway:
  udp_bind: "127.0.0.1:1701"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.network.net_id_bytes().unwrap(), [0xAA, 0xBB, 0xCC]);
        assert!(!config.network.adr_enabled);
        assert_eq!(config.cn470.mode, Cn470Mode::CustomFdd);
        assert_eq!(config.cn470.rx_windows.rx2_frequency, 492_500_000);
        // Untouched sections keep their defaults.
        assert_eq!(config.cn470.channels.channel_spacing, 200_000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut config = Config::default();
        config.network.band = "EU868".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.net_id = "12345".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cn470.rx_windows.rx2_data_rate = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.udp_bind = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }
}
