//! Consumer configuration resolution
//!
//! Turns a role, optional transmitter metadata and user overrides into the
//! fully resolved [`ConsumerConfig`] stored on the consumer entry. Restarts
//! reuse the stored value instead of resolving again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::ConsumerError;
use super::role::{ConsumerRole, DemodulatorKind, InputKind};

/// Transmitter metadata supplied by the satellite catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitterInfo {
    /// Catalogue identifier
    pub id: String,
    /// Downlink frequency in Hz
    pub downlink_freq: u64,
    /// Symbol rate, for digital modes
    #[serde(default)]
    pub baud: Option<u32>,
}

/// User-supplied parameters that take precedence over defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub freq: Option<u64>,
    pub bandwidth_hz: Option<u32>,
    pub audio_rate: Option<u32>,
    pub squelch_db: Option<f32>,
    pub baud: Option<u32>,
    pub params: BTreeMap<String, String>,
}

/// Everything needed to recreate a consumer identically
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerConfig {
    /// Tuned (VFO) frequency in Hz
    pub freq: u64,
    /// Channel filter bandwidth in Hz
    pub bandwidth_hz: u32,
    /// Output audio rate for demodulators
    pub audio_rate: u32,
    pub squelch_db: Option<f32>,
    pub baud: Option<u32>,
    pub transmitter: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl ConsumerConfig {
    /// Configuration of the demodulator created internally for a decoder
    pub fn internal_demodulator(&self, bandwidth_hz: u32) -> Self {
        Self {
            bandwidth_hz,
            params: BTreeMap::new(),
            ..self.clone()
        }
    }
}

/// Resolves consumer configuration
pub trait ConfigResolver: Send + Sync {
    fn resolve(
        &self,
        role: ConsumerRole,
        transmitter: Option<&TransmitterInfo>,
        overrides: &Overrides,
    ) -> Result<ConsumerConfig, ConsumerError>;
}

/// Resolver that layers overrides over transmitter data over role defaults
#[derive(Debug, Clone)]
pub struct DefaultResolver {
    /// Audio rate used when the request does not specify one
    pub audio_rate: u32,
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self { audio_rate: 44_100 }
    }
}

impl ConfigResolver for DefaultResolver {
    fn resolve(
        &self,
        role: ConsumerRole,
        transmitter: Option<&TransmitterInfo>,
        overrides: &Overrides,
    ) -> Result<ConsumerConfig, ConsumerError> {
        let freq = overrides
            .freq
            .or(transmitter.map(|t| t.downlink_freq))
            .ok_or(ConsumerError::MissingParameter("freq"))?;

        let default_bandwidth = match (role, role.capability().input) {
            (ConsumerRole::Demodulator(kind), _) => kind.default_bandwidth(),
            (_, InputKind::Audio { bandwidth_hz, .. }) => bandwidth_hz,
            // Raw-IQ decoders default to a channel wide enough for typical telemetry
            (_, InputKind::RawIq) => DemodulatorKind::Fm.default_bandwidth() * 2,
        };

        let audio_rate = overrides.audio_rate.unwrap_or(self.audio_rate);
        if audio_rate == 0 {
            return Err(ConsumerError::InvalidParameter("audio_rate must be positive".into()));
        }

        Ok(ConsumerConfig {
            freq,
            bandwidth_hz: overrides.bandwidth_hz.unwrap_or(default_bandwidth),
            audio_rate,
            squelch_db: overrides.squelch_db,
            baud: overrides.baud.or(transmitter.and_then(|t| t.baud)),
            transmitter: transmitter.map(|t| t.id.clone()),
            params: overrides.params.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::role::DecoderKind;

    fn noaa() -> TransmitterInfo {
        TransmitterInfo {
            id: "noaa-19-apt".into(),
            downlink_freq: 137_100_000,
            baud: None,
        }
    }

    #[test]
    fn test_transmitter_provides_frequency() {
        let cfg = DefaultResolver::default()
            .resolve(
                ConsumerRole::Decoder(DecoderKind::Apt),
                Some(&noaa()),
                &Overrides::default(),
            )
            .unwrap();

        assert_eq!(cfg.freq, 137_100_000);
        assert_eq!(cfg.bandwidth_hz, 34_000);
        assert_eq!(cfg.transmitter.as_deref(), Some("noaa-19-apt"));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = Overrides {
            freq: Some(137_912_500),
            bandwidth_hz: Some(40_000),
            ..Default::default()
        };
        let cfg = DefaultResolver::default()
            .resolve(ConsumerRole::Decoder(DecoderKind::Apt), Some(&noaa()), &overrides)
            .unwrap();

        assert_eq!(cfg.freq, 137_912_500);
        assert_eq!(cfg.bandwidth_hz, 40_000);
    }

    #[test]
    fn test_missing_frequency_is_rejected() {
        let err = DefaultResolver::default()
            .resolve(
                ConsumerRole::Demodulator(DemodulatorKind::Fm),
                None,
                &Overrides::default(),
            )
            .unwrap_err();

        assert_eq!(err, ConsumerError::MissingParameter("freq"));
    }

    #[test]
    fn test_internal_demodulator_config() {
        let decoder = DefaultResolver::default()
            .resolve(ConsumerRole::Decoder(DecoderKind::Sstv), Some(&noaa()), &Overrides {
                params: [("mode".to_string(), "robot36".to_string())].into(),
                ..Default::default()
            })
            .unwrap();
        let demod = decoder.internal_demodulator(12_500);

        assert_eq!(demod.freq, decoder.freq);
        assert_eq!(demod.bandwidth_hz, 12_500);
        assert!(demod.params.is_empty());
    }
}
