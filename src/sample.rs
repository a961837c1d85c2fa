//! Sample chunks and device configuration values
//!
//! Chunks are the unit of data-plane transport. They are designed to be cheap
//! to clone: sample buffers are reference counted, so fanning a chunk out to N
//! in-process subscribers never copies the samples.

use std::sync::Arc;
use std::time::SystemTime;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::registry::DeviceId;

/// Data-plane payload that a broadcaster can fan out
pub trait Chunk: Clone + Send + Sync + 'static {
    /// Produce a copy that shares no buffers with `self`
    ///
    /// Used for subscribers that sit across a process boundary. The default
    /// is a plain clone for chunk types without shared buffers.
    fn detach(&self) -> Self {
        self.clone()
    }
}

/// A timestamped batch of complex baseband samples
#[derive(Debug, Clone)]
pub struct IqChunk {
    /// Samples (zero-copy via reference counting)
    pub samples: Arc<[Complex32]>,
    /// Center frequency the samples were captured at, in Hz
    pub center_freq: u64,
    /// Sample rate the samples were captured at, in samples/sec
    pub sample_rate: u32,
    /// Capture time of the first sample
    pub timestamp: SystemTime,
}

impl IqChunk {
    /// Create a chunk stamped with the current time
    pub fn new(samples: impl Into<Arc<[Complex32]>>, center_freq: u64, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            center_freq,
            sample_rate,
            timestamp: SystemTime::now(),
        }
    }

    /// Number of samples in the chunk
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the chunk carries no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Whether the chunk was captured with the given tuning
    pub fn matches(&self, snapshot: &ConfigSnapshot) -> bool {
        snapshot.center_freq == Some(self.center_freq)
            && snapshot.sample_rate == Some(self.sample_rate)
    }
}

impl Chunk for IqChunk {
    fn detach(&self) -> Self {
        Self {
            samples: Arc::from(self.samples.to_vec()),
            ..self.clone()
        }
    }
}

/// A timestamped batch of demodulated mono audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM samples in [-1.0, 1.0]
    pub samples: Arc<[f32]>,
    /// Audio sample rate
    pub sample_rate: u32,
    /// Time of the IQ chunk this audio was demodulated from
    pub timestamp: SystemTime,
}

impl AudioChunk {
    /// Create an audio chunk
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32, timestamp: SystemTime) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp,
        }
    }
}

impl Chunk for AudioChunk {
    fn detach(&self) -> Self {
        Self {
            samples: Arc::from(self.samples.to_vec()),
            ..self.clone()
        }
    }
}

/// Partial device configuration update
///
/// `None` fields are left unchanged when merged into a [`ConfigSnapshot`].
/// The tuning fields can be returned to "unset" explicitly with
/// [`unset_sample_rate`](Self::unset_sample_rate) and
/// [`unset_center_freq`](Self::unset_center_freq).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub sample_rate: Option<u32>,
    pub center_freq: Option<u64>,
    pub gain: Option<f32>,
    pub antenna: Option<String>,
    pub fft_window: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear_sample_rate: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear_center_freq: bool,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self.clear_sample_rate = false;
        self
    }

    pub fn center_freq(mut self, hz: u64) -> Self {
        self.center_freq = Some(hz);
        self.clear_center_freq = false;
        self
    }

    /// Return the sample rate to "unset"
    pub fn unset_sample_rate(mut self) -> Self {
        self.sample_rate = None;
        self.clear_sample_rate = true;
        self
    }

    /// Return the center frequency to "unset"
    pub fn unset_center_freq(mut self) -> Self {
        self.center_freq = None;
        self.clear_center_freq = true;
        self
    }

    pub fn gain(mut self, db: f32) -> Self {
        self.gain = Some(db);
        self
    }

    pub fn antenna(mut self, antenna: impl Into<String>) -> Self {
        self.antenna = Some(antenna.into());
        self
    }

    pub fn fft_window(mut self, window: impl Into<String>) -> Self {
        self.fft_window = Some(window.into());
        self
    }
}

/// Configuration a device (or consumer) was last configured with
///
/// Used purely for change detection: comparing the stored snapshot with the
/// snapshot a request would produce decides whether queued data is stale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub device: DeviceId,
    pub sample_rate: Option<u32>,
    pub center_freq: Option<u64>,
    pub gain: Option<f32>,
    pub antenna: Option<String>,
    pub fft_window: Option<String>,
}

/// What kind of change a new configuration represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    /// Nothing differs
    Unchanged,
    /// Only parameters that do not invalidate buffered samples differ
    NonBreaking,
    /// Sample rate or center frequency differ; buffered samples are stale
    Breaking { reason: String },
}

impl ConfigSnapshot {
    /// Snapshot with nothing set yet
    pub fn unset(device: DeviceId) -> Self {
        Self {
            device,
            sample_rate: None,
            center_freq: None,
            gain: None,
            antenna: None,
            fft_window: None,
        }
    }

    /// Produce the snapshot that results from applying `update`
    pub fn merged(&self, update: &DeviceConfig) -> Self {
        Self {
            device: self.device.clone(),
            sample_rate: if update.clear_sample_rate {
                None
            } else {
                update.sample_rate.or(self.sample_rate)
            },
            center_freq: if update.clear_center_freq {
                None
            } else {
                update.center_freq.or(self.center_freq)
            },
            gain: update.gain.or(self.gain),
            antenna: update.antenna.clone().or_else(|| self.antenna.clone()),
            fft_window: update.fft_window.clone().or_else(|| self.fft_window.clone()),
        }
    }

    /// Classify the difference between `self` (current) and `next`
    pub fn compare(&self, next: &ConfigSnapshot) -> ConfigChange {
        let mut reasons = Vec::new();

        if self.sample_rate != next.sample_rate {
            reasons.push(format!(
                "sample rate changed from {} to {}",
                describe(self.sample_rate),
                describe(next.sample_rate)
            ));
        }
        if self.center_freq != next.center_freq {
            reasons.push(format!(
                "center frequency changed from {} to {}",
                describe(self.center_freq),
                describe(next.center_freq)
            ));
        }

        if !reasons.is_empty() {
            return ConfigChange::Breaking {
                reason: reasons.join(", "),
            };
        }

        if self == next {
            ConfigChange::Unchanged
        } else {
            ConfigChange::NonBreaking
        }
    }
}

fn describe<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "unset".to_string(), |v| v.to_string())
}
