//! Sample sources
//!
//! A [`SampleSource`] is the radio connection owned by a capture worker. Real
//! hardware drivers live outside this crate and plug in through a
//! [`SourceFactory`]. [`SyntheticSource`] generates a test tone and is used by
//! the demo and the tests.

use std::f32::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use num_complex::Complex32;
use tokio::time::{Interval, MissedTickBehavior};

use crate::registry::DeviceId;
use crate::sample::ConfigSnapshot;

/// Error type for sample sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The device could not be opened
    Open(String),
    /// A read timed out; the next read may succeed
    Timeout,
    /// Reading failed
    Read(String),
    /// The device rejected a setting
    Unsupported(String),
}

impl SourceError {
    /// Whether the worker should keep reading after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Timeout)
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Open(msg) => write!(f, "Failed to open device: {}", msg),
            SourceError::Timeout => write!(f, "Read timed out"),
            SourceError::Read(msg) => write!(f, "Read failed: {}", msg),
            SourceError::Unsupported(msg) => write!(f, "Unsupported setting: {}", msg),
        }
    }
}

impl std::error::Error for SourceError {}

/// A stream of IQ samples from one device
///
/// `read` must be cancel safe: the worker races it against control messages
/// and drops the future when a message wins.
#[async_trait]
pub trait SampleSource: Send {
    /// Read the next block of samples; an empty block means "nothing yet"
    async fn read(&mut self) -> Result<Vec<Complex32>, SourceError>;

    /// Apply a full configuration snapshot
    fn apply(&mut self, config: &ConfigSnapshot) -> Result<(), SourceError>;
}

/// Opens sample sources for devices
pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        device: &DeviceId,
        config: &ConfigSnapshot,
    ) -> Result<Box<dyn SampleSource>, SourceError>;
}

/// Wall-clock paced tone generator
pub struct SyntheticSource {
    sample_rate: Option<u32>,
    tone_offset_hz: f32,
    amplitude: f32,
    phase: f32,
    block: Duration,
    ticker: Option<Interval>,
}

impl SyntheticSource {
    /// Tone at `tone_offset_hz` from the center, one block every `block`
    pub fn new(tone_offset_hz: f32, block: Duration) -> Self {
        Self {
            sample_rate: None,
            tone_offset_hz,
            amplitude: 0.5,
            phase: 0.0,
            block: block.max(Duration::from_millis(1)),
            ticker: None,
        }
    }

    fn samples_per_block(&self, rate: u32) -> usize {
        ((rate as f64 * self.block.as_secs_f64()).round() as usize).max(1)
    }
}

#[async_trait]
impl SampleSource for SyntheticSource {
    async fn read(&mut self) -> Result<Vec<Complex32>, SourceError> {
        let block = self.block;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(block);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        let Some(rate) = self.sample_rate else {
            return Ok(Vec::new());
        };

        let step = TAU * self.tone_offset_hz / rate as f32;
        let n = self.samples_per_block(rate);
        let mut samples = Vec::with_capacity(n);
        for _ in 0..n {
            samples.push(Complex32::from_polar(self.amplitude, self.phase));
            self.phase = (self.phase + step) % TAU;
        }
        Ok(samples)
    }

    fn apply(&mut self, config: &ConfigSnapshot) -> Result<(), SourceError> {
        if config.sample_rate == Some(0) {
            return Err(SourceError::Unsupported("sample rate 0".into()));
        }
        if let Some(gain) = config.gain {
            // Map 0..50 dB onto a usable amplitude range
            self.amplitude = (0.05 + gain.clamp(0.0, 50.0) / 100.0).min(0.95);
        }
        self.sample_rate = config.sample_rate;
        Ok(())
    }
}

/// Factory producing [`SyntheticSource`]s
#[derive(Debug, Clone)]
pub struct SyntheticFactory {
    pub tone_offset_hz: f32,
    pub block: Duration,
}

impl Default for SyntheticFactory {
    fn default() -> Self {
        Self {
            tone_offset_hz: 25_000.0,
            block: Duration::from_millis(10),
        }
    }
}

impl SourceFactory for SyntheticFactory {
    fn open(
        &self,
        device: &DeviceId,
        config: &ConfigSnapshot,
    ) -> Result<Box<dyn SampleSource>, SourceError> {
        let mut source = SyntheticSource::new(self.tone_offset_hz, self.block);
        source.apply(config)?;
        tracing::debug!(device = %device, "Synthetic source opened");
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::DeviceConfig;

    fn config(rate: u32) -> ConfigSnapshot {
        ConfigSnapshot::unset(DeviceId::new("synthetic"))
            .merged(&DeviceConfig::new().sample_rate(rate).center_freq(100_000_000))
    }

    #[tokio::test]
    async fn test_block_size_follows_rate() {
        let mut source = SyntheticSource::new(1_000.0, Duration::from_millis(10));
        source.apply(&config(48_000)).unwrap();

        let block = source.read().await.unwrap();
        assert_eq!(block.len(), 480);
        assert!((block[0].norm() - 0.5).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_unset_rate_yields_empty_blocks() {
        let mut source = SyntheticSource::new(1_000.0, Duration::from_millis(1));
        source
            .apply(&ConfigSnapshot::unset(DeviceId::new("synthetic")))
            .unwrap();
        assert!(source.read().await.unwrap().is_empty());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let factory = SyntheticFactory::default();
        let result = factory.open(&DeviceId::new("synthetic"), &config(0));
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(SourceError::Timeout.is_transient());
        assert!(!SourceError::Open("busy".into()).is_transient());
    }
}
