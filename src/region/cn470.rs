//! CN470 (China 470–510 MHz) band parameters.
//!
//! Three sub-modes are deployed in the field. STANDARD_FDD pairs the
//! 470–490 uplink band with 500–510 downlinks (+30 MHz); CUSTOM_FDD keeps
//! downlinks inside 480–490 (+10 MHz) for concentrators that cannot
//! transmit above 490 MHz; TDD answers on the uplink frequency. A downlink
//! that would land outside the mode's valid range falls back to the
//! configured RX2 frequency.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Cn470Config;
use crate::error::NsError;

/// CN470 operating sub-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cn470Mode {
    StandardFdd,
    CustomFdd,
    Tdd,
}

impl std::fmt::Display for Cn470Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cn470Mode::StandardFdd => "STANDARD_FDD",
            Cn470Mode::CustomFdd => "CUSTOM_FDD",
            Cn470Mode::Tdd => "TDD",
        };
        write!(f, "{s}")
    }
}

/// LoRa data-rate parameters for one DR index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRate {
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
}

/// CN470 DR table: DR0..DR5 = SF12..SF7, all at 125 kHz.
pub const DATA_RATES: [DataRate; 6] = [
    DataRate { spreading_factor: 12, bandwidth_khz: 125 },
    DataRate { spreading_factor: 11, bandwidth_khz: 125 },
    DataRate { spreading_factor: 10, bandwidth_khz: 125 },
    DataRate { spreading_factor: 9, bandwidth_khz: 125 },
    DataRate { spreading_factor: 8, bandwidth_khz: 125 },
    DataRate { spreading_factor: 7, bandwidth_khz: 125 },
];

/// Render a DR index as the Semtech "SFxBWy" datarate string.
pub fn dr_to_datr(dr: u8) -> Result<String, NsError> {
    let params = DATA_RATES
        .get(dr as usize)
        .ok_or_else(|| NsError::MalformedFrame(format!("unknown data rate index {dr}")))?;
    Ok(format!(
        "SF{}BW{}",
        params.spreading_factor, params.bandwidth_khz
    ))
}

/// Parse a Semtech "SFxBWy" datarate string back to a DR index.
pub fn datr_to_dr(datr: &str) -> Result<u8, NsError> {
    for (i, params) in DATA_RATES.iter().enumerate() {
        if datr == format!("SF{}BW{}", params.spreading_factor, params.bandwidth_khz) {
            return Ok(i as u8);
        }
    }
    Err(NsError::MalformedFrame(format!(
        "unknown datarate string {datr:?}"
    )))
}

pub fn hz_to_mhz(hz: u32) -> f64 {
    hz as f64 / 1_000_000.0
}

pub fn mhz_to_hz(mhz: f64) -> u32 {
    (mhz * 1_000_000.0).round() as u32
}

/// Resolved CN470 band state: the effective sub-mode plus the frequency
/// plan and RX-window defaults it implies.
#[derive(Debug, Clone)]
pub struct Cn470Region {
    pub mode: Cn470Mode,
    uplink_start: u32,
    downlink_valid: (u32, u32),
    frequency_offset: u32,
    uplink_channel_count: usize,
    channel_spacing: u32,
    /// CUSTOM_FDD uplink plan start, used for CFList generation.
    cflist_start: u32,
    pub rx2_frequency: u32,
    pub rx2_data_rate: u8,
    pub rx1_dr_offset: u8,
    pub downlink_tx_power: i8,
    pub enabled_sub_bands: Vec<u8>,
    pub cf_list_enabled: bool,
}

impl Cn470Region {
    /// Resolve the configured mode against the gateway hardware, warning
    /// on downgrade, then capture the matching plan.
    pub fn from_config(cfg: &Cn470Config) -> Result<Self, NsError> {
        let mode = effective_mode(cfg)?;
        let plan = match mode {
            Cn470Mode::StandardFdd => &cfg.standard_fdd,
            Cn470Mode::CustomFdd => &cfg.custom_fdd,
            Cn470Mode::Tdd => &cfg.tdd,
        };
        Ok(Cn470Region {
            mode,
            uplink_start: plan.uplink_start_freq,
            downlink_valid: (plan.downlink_start_freq, plan.downlink_end_freq),
            frequency_offset: plan.frequency_offset,
            uplink_channel_count: plan.uplink_channel_count,
            channel_spacing: cfg.channels.channel_spacing,
            cflist_start: cfg.custom_fdd.uplink_start_freq,
            rx2_frequency: cfg.rx_windows.rx2_frequency,
            rx2_data_rate: cfg.rx_windows.rx2_data_rate,
            rx1_dr_offset: cfg.rx_windows.rx1_dr_offset,
            downlink_tx_power: cfg.downlink_tx_power,
            enabled_sub_bands: cfg.channels.enabled_sub_bands.clone(),
            cf_list_enabled: cfg.channels.cf_list_enabled,
        })
    }

    /// Channel indices implied by the enabled sub-bands, the initial
    /// channel set for a fresh session.
    pub fn default_enabled_channels(&self) -> Vec<usize> {
        self.enabled_sub_bands
            .iter()
            .flat_map(|sb| {
                let start = *sb as usize * 8;
                start..start + 8
            })
            .collect()
    }

    /// Derive the RX1 downlink frequency for an uplink frequency, falling
    /// back to RX2 when the shifted frequency leaves the valid range.
    pub fn downlink_frequency(&self, uplink_hz: u32) -> u32 {
        let candidate = uplink_hz + self.frequency_offset;
        let (lo, hi) = self.downlink_valid;
        if candidate < lo || candidate > hi {
            warn!(
                "downlink {:.1} MHz outside {} range, falling back to RX2 {:.1} MHz",
                hz_to_mhz(candidate),
                self.mode,
                hz_to_mhz(self.rx2_frequency)
            );
            self.rx2_frequency
        } else {
            candidate
        }
    }

    /// RX1 data rate from the uplink data rate and the session offset.
    pub fn rx1_data_rate(&self, uplink_dr: u8, rx1_dr_offset: u8) -> u8 {
        uplink_dr.saturating_sub(rx1_dr_offset)
    }

    /// Map an uplink frequency to its channel index, if it sits on the
    /// grid.
    pub fn uplink_channel(&self, freq_hz: u32) -> Option<usize> {
        if freq_hz < self.uplink_start {
            return None;
        }
        let delta = freq_hz - self.uplink_start;
        if delta % self.channel_spacing != 0 {
            return None;
        }
        let idx = (delta / self.channel_spacing) as usize;
        (idx < self.uplink_channel_count).then_some(idx)
    }

    /// CFList for the Join-Accept: channels 1..5 of the CUSTOM_FDD uplink
    /// plan as 3-byte little-endian frequencies in 100 Hz units, then the
    /// CFListType 0 byte (channel 0 is implicit).
    pub fn cf_list(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for ch in 1..=5u32 {
            let freq = (self.cflist_start + ch * self.channel_spacing) / 100;
            let base = ((ch - 1) * 3) as usize;
            out[base] = freq as u8;
            out[base + 1] = (freq >> 8) as u8;
            out[base + 2] = (freq >> 16) as u8;
        }
        out[15] = 0x00;
        out
    }

    /// ChMask and ChMaskCntl addressing one 8-channel sub-band. Each
    /// ChMaskCntl value covers a 16-channel block, so a sub-band is one
    /// half of the mask.
    pub fn sub_band_ch_mask(&self, sub_band: u8) -> (u16, u8) {
        let ch_mask_cntl = sub_band / 2;
        let ch_mask: u16 = if sub_band % 2 == 0 { 0x00FF } else { 0xFF00 };
        (ch_mask, ch_mask_cntl)
    }

    /// The sub-band a channel index belongs to.
    pub fn sub_band_of_channel(&self, channel: usize) -> u8 {
        (channel / 8) as u8
    }
}

/// Apply the hardware capability downgrade rules to the configured mode.
fn effective_mode(cfg: &Cn470Config) -> Result<Cn470Mode, NsError> {
    let hw = &cfg.hardware;
    let mut mode = cfg.mode;
    if mode == Cn470Mode::StandardFdd && !hw.supports_tx_500mhz {
        warn!("hardware cannot transmit at 500 MHz, downgrading STANDARD_FDD to CUSTOM_FDD");
        mode = Cn470Mode::CustomFdd;
    }
    if matches!(mode, Cn470Mode::CustomFdd | Cn470Mode::Tdd) && !hw.supports_tx_470_490mhz {
        return Err(NsError::HardwareIncompatible(format!(
            "{mode} requires 470-490 MHz transmit support"
        )));
    }
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cn470Config;

    fn region(mode: Cn470Mode) -> Cn470Region {
        let mut cfg = Cn470Config::default();
        cfg.mode = mode;
        Cn470Region::from_config(&cfg).unwrap()
    }

    #[test]
    fn test_datr_strings() {
        assert_eq!(dr_to_datr(0).unwrap(), "SF12BW125");
        assert_eq!(dr_to_datr(5).unwrap(), "SF7BW125");
        assert!(dr_to_datr(6).is_err());
        assert_eq!(datr_to_dr("SF9BW125").unwrap(), 3);
        assert!(datr_to_dr("SF7BW250").is_err());
    }

    #[test]
    fn test_custom_fdd_downlink_frequency() {
        let r = region(Cn470Mode::CustomFdd);
        // 470.3 MHz + 10 MHz = 480.3 MHz, inside range.
        assert_eq!(r.downlink_frequency(470_300_000), 480_300_000);
        // 479.9 MHz + 10 MHz = 489.9 MHz, upper edge.
        assert_eq!(r.downlink_frequency(479_900_000), 489_900_000);
        // 489.9 MHz + 10 MHz = 499.9 MHz, outside → RX2 fallback.
        assert_eq!(r.downlink_frequency(489_900_000), r.rx2_frequency);
    }

    #[test]
    fn test_standard_fdd_downlink_frequency() {
        let r = region(Cn470Mode::StandardFdd);
        assert_eq!(r.downlink_frequency(470_300_000), 500_300_000);
        assert_eq!(r.downlink_frequency(479_700_000), 509_700_000);
        assert_eq!(r.downlink_frequency(489_900_000), r.rx2_frequency);
    }

    #[test]
    fn test_tdd_downlink_frequency() {
        let r = region(Cn470Mode::Tdd);
        assert_eq!(r.downlink_frequency(470_300_000), 470_300_000);
        assert_eq!(r.downlink_frequency(486_500_000), 486_500_000);
    }

    #[test]
    fn test_hardware_downgrade() {
        let mut cfg = Cn470Config::default();
        cfg.mode = Cn470Mode::StandardFdd;
        cfg.hardware.supports_tx_500mhz = false;
        let r = Cn470Region::from_config(&cfg).unwrap();
        assert_eq!(r.mode, Cn470Mode::CustomFdd);

        cfg.hardware.supports_tx_470_490mhz = false;
        assert!(matches!(
            Cn470Region::from_config(&cfg),
            Err(NsError::HardwareIncompatible(_))
        ));
    }

    #[test]
    fn test_uplink_channel_mapping() {
        let r = region(Cn470Mode::CustomFdd);
        assert_eq!(r.uplink_channel(470_300_000), Some(0));
        assert_eq!(r.uplink_channel(470_500_000), Some(1));
        assert_eq!(r.uplink_channel(471_300_000), Some(5));
        // Off-grid frequency.
        assert_eq!(r.uplink_channel(470_350_000), None);
        // Below the plan.
        assert_eq!(r.uplink_channel(433_000_000), None);
    }

    #[test]
    fn test_cf_list_layout() {
        let r = region(Cn470Mode::CustomFdd);
        let cf = r.cf_list();
        // Channel 1 = 470.5 MHz = 4_705_000 units of 100 Hz.
        let ch1 = u32::from_le_bytes([cf[0], cf[1], cf[2], 0]) * 100;
        assert_eq!(ch1, 470_500_000);
        let ch5 = u32::from_le_bytes([cf[12], cf[13], cf[14], 0]) * 100;
        assert_eq!(ch5, 471_300_000);
        // CFListType 0.
        assert_eq!(cf[15], 0x00);
    }

    #[test]
    fn test_sub_band_mask() {
        let r = region(Cn470Mode::CustomFdd);
        assert_eq!(r.sub_band_ch_mask(0), (0x00FF, 0));
        assert_eq!(r.sub_band_ch_mask(1), (0xFF00, 0));
        assert_eq!(r.sub_band_ch_mask(2), (0x00FF, 1));
        assert_eq!(r.sub_band_of_channel(0), 0);
        assert_eq!(r.sub_band_of_channel(12), 1);
    }

    #[test]
    fn test_rx1_data_rate_offset() {
        let r = region(Cn470Mode::CustomFdd);
        assert_eq!(r.rx1_data_rate(5, 0), 5);
        assert_eq!(r.rx1_data_rate(5, 2), 3);
        assert_eq!(r.rx1_data_rate(1, 3), 0);
    }
}
