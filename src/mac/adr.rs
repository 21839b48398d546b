//! Adaptive data rate.
//!
//! The algorithm looks at the session's recent uplink history and nudges
//! the device toward the fastest data rate (and lowest TX power) its link
//! margin supports. A 3 dB hysteresis band keeps marginal links from
//! oscillating. NbTrans compensates weak gateway coverage with repeats.

use tracing::debug;

use crate::config::AdrConfig;
use crate::lorawan::maccommands::MacCommand;
use crate::region::Cn470Region;
use crate::storage::DeviceSession;

/// Margin above which the link can afford a faster data rate.
const STEP_UP_DB: f64 = 3.0;
/// Margin below which the link needs a slower data rate.
const STEP_DOWN_DB: f64 = -3.0;

/// Run the ADR decision for a session. Returns the LinkADRReq to send
/// when the device should change data rate or TX power, and applies the
/// new values to the session.
pub fn run_adr(
    session: &mut DeviceSession,
    cfg: &AdrConfig,
    region: &Cn470Region,
) -> Option<MacCommand> {
    if !session.adr || session.adr_history.is_empty() {
        return None;
    }

    let avg_snr = session
        .adr_history
        .iter()
        .map(|e| e.max_snr)
        .sum::<f64>()
        / session.adr_history.len() as f64;
    let min_gateway_count = session
        .adr_history
        .iter()
        .map(|e| e.gateway_count)
        .min()
        .unwrap_or(1);

    let margin = avg_snr - cfg.target_snr - cfg.margin_snr;

    let mut dr = session.dr;
    let mut tx_power = session.tx_power;

    if margin > STEP_UP_DB {
        dr = dr.saturating_add(1);
    } else if margin < STEP_DOWN_DB {
        dr = dr.saturating_sub(1);
    }
    dr = dr.clamp(cfg.min_data_rate, cfg.max_data_rate);

    if dr == session.dr {
        // Data rate is settled; trade remaining margin for TX power.
        // A higher power index means lower output power.
        if margin > 0.0 {
            tx_power = tx_power.saturating_add(1);
        } else if margin < 0.0 {
            tx_power = tx_power.saturating_sub(1);
        }
        tx_power = tx_power.clamp(cfg.min_tx_power, cfg.max_tx_power);
    }

    let nb_trans = match min_gateway_count {
        0 | 1 => 3,
        2 | 3 => 2,
        _ => 1,
    };

    if dr == session.dr && tx_power == session.tx_power {
        return None;
    }

    debug!(
        "ADR for {}: avgSNR={avg_snr:.1} margin={margin:.1} dr {}→{dr} txPower {}→{tx_power} nbTrans={nb_trans}",
        session.dev_eui, session.dr, session.tx_power
    );

    session.dr = dr;
    session.tx_power = tx_power;

    let sub_band = session
        .enabled_channels
        .first()
        .map(|ch| region.sub_band_of_channel(*ch))
        .unwrap_or(0);
    let (ch_mask, ch_mask_cntl) = region.sub_band_ch_mask(sub_band);

    Some(MacCommand::LinkAdrReq {
        data_rate: dr,
        tx_power,
        ch_mask,
        ch_mask_cntl,
        nb_trans,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cn470Config;
    use crate::lorawan::keys::Aes128Key;
    use crate::region::Cn470Mode;
    use crate::storage::AdrHistoryEntry;

    fn region() -> Cn470Region {
        let mut cfg = Cn470Config::default();
        cfg.mode = Cn470Mode::CustomFdd;
        Cn470Region::from_config(&cfg).unwrap()
    }

    fn session_with_history(dr: u8, tx_power: u8, snr: f64, gateways: usize) -> DeviceSession {
        let key: Aes128Key = "00112233445566778899aabbccddeeff".parse().unwrap();
        let mut session = DeviceSession {
            dev_eui: "0102030405060708".parse().unwrap(),
            dev_addr: "01020304".parse().unwrap(),
            join_eui: "0000000000000000".parse().unwrap(),
            app_s_key: key,
            f_nwk_s_int_key: key,
            s_nwk_s_int_key: key,
            nwk_s_enc_key: key,
            f_cnt_up: 10,
            n_f_cnt_down: 0,
            a_f_cnt_down: 0,
            conf_f_cnt: 0,
            rx1_delay: 5,
            rx1_dr_offset: 0,
            rx2_dr: 0,
            rx2_freq: 505_300_000,
            dr,
            tx_power,
            adr: true,
            enabled_channels: (8..16).collect(),
            adr_history: vec![],
        };
        for i in 0..10 {
            session.adr_history.push(AdrHistoryEntry {
                f_cnt: i,
                max_snr: snr,
                tx_power,
                gateway_count: gateways,
            });
        }
        session
    }

    #[test]
    fn test_strong_margin_steps_data_rate_up() {
        // avgSNR 15, target 5, margin_snr 2.5 → margin 7.5 > 3.
        let mut session = session_with_history(3, 0, 15.0, 1);
        let cmd = run_adr(&mut session, &AdrConfig::default(), &region()).unwrap();
        match cmd {
            MacCommand::LinkAdrReq {
                data_rate,
                nb_trans,
                ch_mask,
                ch_mask_cntl,
                ..
            } => {
                assert_eq!(data_rate, 4);
                // Single gateway → 3 repeats.
                assert_eq!(nb_trans, 3);
                // Channels 8..16 live in sub-band 1.
                assert_eq!(ch_mask, 0xFF00);
                assert_eq!(ch_mask_cntl, 0);
            }
            other => panic!("expected LinkAdrReq, got {other:?}"),
        }
        assert_eq!(session.dr, 4);
    }

    #[test]
    fn test_weak_margin_steps_data_rate_down() {
        // avgSNR -2 → margin -9.5 < -3.
        let mut session = session_with_history(3, 0, -2.0, 4);
        let cmd = run_adr(&mut session, &AdrConfig::default(), &region()).unwrap();
        match cmd {
            MacCommand::LinkAdrReq {
                data_rate,
                nb_trans,
                ..
            } => {
                assert_eq!(data_rate, 2);
                assert_eq!(nb_trans, 1);
            }
            other => panic!("expected LinkAdrReq, got {other:?}"),
        }
    }

    #[test]
    fn test_settled_dr_trades_margin_for_tx_power() {
        // At max DR with positive margin: power index rises instead.
        let mut session = session_with_history(5, 2, 15.0, 2);
        let cmd = run_adr(&mut session, &AdrConfig::default(), &region()).unwrap();
        match cmd {
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                nb_trans,
                ..
            } => {
                assert_eq!(data_rate, 5);
                assert_eq!(tx_power, 3);
                assert_eq!(nb_trans, 2);
            }
            other => panic!("expected LinkAdrReq, got {other:?}"),
        }
    }

    #[test]
    fn test_no_change_emits_nothing() {
        // Margin inside the hysteresis band, zero → no adjustment.
        let mut session = session_with_history(3, 0, 7.5, 4);
        assert!(run_adr(&mut session, &AdrConfig::default(), &region()).is_none());
    }

    #[test]
    fn test_adr_disabled_or_empty_history() {
        let mut session = session_with_history(3, 0, 20.0, 1);
        session.adr = false;
        assert!(run_adr(&mut session, &AdrConfig::default(), &region()).is_none());

        let mut session = session_with_history(3, 0, 20.0, 1);
        session.adr_history.clear();
        assert!(run_adr(&mut session, &AdrConfig::default(), &region()).is_none());
    }

    #[test]
    fn test_clamped_at_bounds() {
        // Already at max DR and max TX-power index: nothing to do.
        let mut session = session_with_history(5, 7, 20.0, 5);
        assert!(run_adr(&mut session, &AdrConfig::default(), &region()).is_none());
    }
}
