//! Consumer roles and the capability table
//!
//! Roles are a closed set. What each role consumes is looked up once in a
//! static table instead of being discovered at runtime.

use serde::{Deserialize, Serialize};

/// Demodulator kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemodulatorKind {
    /// Narrow or wide FM
    Fm,
    /// Envelope AM
    Am,
    /// Upper sideband
    Usb,
    /// Lower sideband
    Lsb,
    /// CW (narrow USB)
    Cw,
}

impl DemodulatorKind {
    /// Default filter bandwidth in Hz
    pub fn default_bandwidth(self) -> u32 {
        match self {
            DemodulatorKind::Fm => 12_500,
            DemodulatorKind::Am => 10_000,
            DemodulatorKind::Usb | DemodulatorKind::Lsb => 2_800,
            DemodulatorKind::Cw => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DemodulatorKind::Fm => "fm",
            DemodulatorKind::Am => "am",
            DemodulatorKind::Usb => "usb",
            DemodulatorKind::Lsb => "lsb",
            DemodulatorKind::Cw => "cw",
        }
    }
}

/// Decoder kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Slow-scan television images
    Sstv,
    /// AFSK packet (AX.25)
    Afsk,
    /// Morse code
    Morse,
    /// NOAA APT weather images
    Apt,
    /// LoRa chirp spread spectrum
    Lora,
    /// FSK / GMSK telemetry
    Fsk,
    /// BPSK telemetry
    Bpsk,
}

impl DecoderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecoderKind::Sstv => "sstv",
            DecoderKind::Afsk => "afsk",
            DecoderKind::Morse => "morse",
            DecoderKind::Apt => "apt",
            DecoderKind::Lora => "lora",
            DecoderKind::Fsk => "fsk",
            DecoderKind::Bpsk => "bpsk",
        }
    }

    /// What this decoder consumes
    pub fn capability(self) -> Capability {
        match self {
            DecoderKind::Sstv => Capability::audio(DemodulatorKind::Fm, 12_500),
            DecoderKind::Afsk => Capability::audio(DemodulatorKind::Fm, 12_500),
            DecoderKind::Apt => Capability::audio(DemodulatorKind::Fm, 34_000),
            DecoderKind::Morse => Capability::audio(DemodulatorKind::Cw, 500),
            DecoderKind::Lora | DecoderKind::Fsk | DecoderKind::Bpsk => Capability::raw_iq(),
        }
    }
}

/// Which map of the device entry a consumer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Demodulator,
    Decoder,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Demodulator => "demod",
            RoleKind::Decoder => "decoder",
        }
    }
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete consumer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "kind", rename_all = "lowercase")]
pub enum ConsumerRole {
    Demodulator(DemodulatorKind),
    Decoder(DecoderKind),
}

impl ConsumerRole {
    pub fn kind(self) -> RoleKind {
        match self {
            ConsumerRole::Demodulator(_) => RoleKind::Demodulator,
            ConsumerRole::Decoder(_) => RoleKind::Decoder,
        }
    }

    /// What this role consumes
    ///
    /// Demodulators always consume raw IQ.
    pub fn capability(self) -> Capability {
        match self {
            ConsumerRole::Demodulator(_) => Capability::raw_iq(),
            ConsumerRole::Decoder(kind) => kind.capability(),
        }
    }

    /// Name used in logs and events
    pub fn name(self) -> &'static str {
        match self {
            ConsumerRole::Demodulator(kind) => kind.as_str(),
            ConsumerRole::Decoder(kind) => kind.as_str(),
        }
    }
}

impl std::fmt::Display for ConsumerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Input a consumer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Raw IQ straight from the device's sample broadcaster
    RawIq,
    /// Audio from an internal demodulator of the given kind
    Audio {
        demodulator: DemodulatorKind,
        bandwidth_hz: u32,
    },
}

/// Capability descriptor of a consumer role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub input: InputKind,
}

impl Capability {
    fn raw_iq() -> Self {
        Self {
            input: InputKind::RawIq,
        }
    }

    fn audio(demodulator: DemodulatorKind, bandwidth_hz: u32) -> Self {
        Self {
            input: InputKind::Audio {
                demodulator,
                bandwidth_hz,
            },
        }
    }

    pub fn needs_raw_iq(&self) -> bool {
        self.input == InputKind::RawIq
    }

    pub fn needs_internal_demod(&self) -> bool {
        matches!(self.input, InputKind::Audio { .. })
    }

    /// Demodulator kind that must be created internally, if any
    pub fn required_demodulator(&self) -> Option<DemodulatorKind> {
        match self.input {
            InputKind::Audio { demodulator, .. } => Some(demodulator),
            InputKind::RawIq => None,
        }
    }
}
