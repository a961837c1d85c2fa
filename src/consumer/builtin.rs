//! Built-in consumer bodies
//!
//! Deliberately simple signal processing: enough to turn IQ into listenable
//! audio and to exercise the lifecycle machinery. Real decoders plug in
//! through [`ConsumerFactory`](super::ConsumerFactory).

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::time::{Duration, Instant};

use num_complex::Complex32;

use crate::channel::{BoundedChannel, TrySendError};
use crate::control::Reporter;
use crate::process::ProcessContext;
use crate::sample::{AudioChunk, IqChunk};

use super::factory::ConsumerInput;
use super::resolve::ConsumerConfig;
use super::role::{DecoderKind, DemodulatorKind};

/// Beat frequency of the CW demodulator
const CW_PITCH_HZ: f64 = 700.0;

/// Stateful single-channel demodulator
#[derive(Debug)]
pub struct Demodulator {
    kind: DemodulatorKind,
    config: ConsumerConfig,
    mixer_phase: f64,
    bfo_phase: f64,
    prev: Complex32,
    dc: f32,
    out_of_band: bool,
}

impl Demodulator {
    pub fn new(kind: DemodulatorKind, config: ConsumerConfig) -> Self {
        Self {
            kind,
            config,
            mixer_phase: 0.0,
            bfo_phase: 0.0,
            prev: Complex32::new(0.0, 0.0),
            dc: 0.0,
            out_of_band: false,
        }
    }

    /// Whether the VFO fell outside the captured band on the last chunk
    pub fn out_of_band(&self) -> bool {
        self.out_of_band
    }

    /// Demodulate one chunk; `None` if the VFO is outside the captured band
    pub fn process(&mut self, chunk: &IqChunk) -> Option<AudioChunk> {
        let rate = chunk.sample_rate as f64;
        let offset = self.config.freq as f64 - chunk.center_freq as f64;
        self.out_of_band = rate <= 0.0 || offset.abs() > rate / 2.0;
        if self.out_of_band {
            return None;
        }

        let decimation = ((rate / self.config.audio_rate as f64).floor() as usize).max(1);
        let audio_rate = (rate / decimation as f64).round() as u32;
        let mixer_step = -TAU * offset / rate;

        let mut baseband = Vec::with_capacity(chunk.len() / decimation + 1);
        let mut acc = Complex32::new(0.0, 0.0);
        let mut n = 0;
        for s in chunk.samples.iter() {
            let lo = Complex32::from_polar(1.0, self.mixer_phase as f32);
            self.mixer_phase = (self.mixer_phase + mixer_step) % TAU;
            acc += s * lo;
            n += 1;
            if n == decimation {
                baseband.push(acc / decimation as f32);
                acc = Complex32::new(0.0, 0.0);
                n = 0;
            }
        }

        if let Some(squelch) = self.config.squelch_db {
            let power = baseband.iter().map(|s| s.norm_sqr()).sum::<f32>() / baseband.len().max(1) as f32;
            if 10.0 * power.max(1e-15).log10() < squelch {
                return Some(AudioChunk::new(vec![0.0; baseband.len()], audio_rate, chunk.timestamp));
            }
        }

        let audio: Vec<f32> = baseband
            .iter()
            .map(|&s| self.demodulate(s, audio_rate as f64))
            .collect();
        Some(AudioChunk::new(audio, audio_rate, chunk.timestamp))
    }

    fn demodulate(&mut self, s: Complex32, audio_rate: f64) -> f32 {
        match self.kind {
            DemodulatorKind::Fm => {
                let d = (s * self.prev.conj()).arg() / std::f32::consts::PI;
                self.prev = s;
                d
            }
            DemodulatorKind::Am => {
                let envelope = s.norm();
                self.dc += 0.001 * (envelope - self.dc);
                envelope - self.dc
            }
            DemodulatorKind::Usb | DemodulatorKind::Lsb | DemodulatorKind::Cw => {
                let (shift, sign) = match self.kind {
                    DemodulatorKind::Cw => (CW_PITCH_HZ, 1.0),
                    DemodulatorKind::Lsb => (self.config.bandwidth_hz as f64 / 2.0, -1.0),
                    _ => (self.config.bandwidth_hz as f64 / 2.0, 1.0),
                };
                let bfo = Complex32::from_polar(1.0, (sign * self.bfo_phase) as f32);
                self.bfo_phase = (self.bfo_phase + TAU * shift / audio_rate) % TAU;
                (s * bfo).re
            }
        }
    }
}

/// Demodulator process body
pub async fn run_demodulator(
    mut ctx: ProcessContext,
    kind: DemodulatorKind,
    config: ConsumerConfig,
    input: BoundedChannel<IqChunk>,
    output: BoundedChannel<AudioChunk>,
    reporter: Reporter,
) {
    let mut demod = Demodulator::new(kind, config);
    let mut produced = 0u64;
    let mut dropped = 0u64;
    let mut was_out_of_band = false;

    reporter.status("running");

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.stopped() => break,
            chunk = input.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let audio = demod.process(&chunk);
        if demod.out_of_band() != was_out_of_band {
            was_out_of_band = demod.out_of_band();
            reporter.status(if was_out_of_band { "out_of_band" } else { "running" });
        }

        if let Some(audio) = audio {
            match output.try_send(audio) {
                Ok(()) => produced += 1,
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }

    tracing::debug!(process = %ctx.id(), demodulator = kind.as_str(), produced = produced, dropped = dropped, "Demodulator exited");
}

/// Tunables of the built-in decoder body
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    /// Interval between stats reports
    pub stats_interval: Duration,
    /// Consecutive reads from a saturated input before requesting a restart
    pub backlog_limit: u32,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(1),
            backlog_limit: 64,
        }
    }
}

/// Decoder process body
///
/// Measures its input and reports it. If the input queue stays saturated it
/// asks to be replaced with `input_backlog_exceeded`, once per process.
pub async fn run_decoder(
    mut ctx: ProcessContext,
    kind: DecoderKind,
    input: ConsumerInput,
    settings: DecoderSettings,
    reporter: Reporter,
) {
    let mut samples = 0u64;
    let mut energy = 0f64;
    let mut chunks = 0u64;
    let mut saturated = 0u32;
    let mut restart_requested = false;
    let mut last_report = Instant::now();

    reporter.status("decoding");

    loop {
        let block = tokio::select! {
            biased;
            _ = ctx.stopped() => break,
            block = recv_block(&input) => match block {
                Some(block) => block,
                None => break,
            },
        };

        chunks += 1;
        samples += block.0 as u64;
        energy += block.1;

        if input.len() + 1 >= input.capacity() {
            saturated += 1;
        } else {
            saturated = 0;
        }
        if saturated >= settings.backlog_limit && !restart_requested {
            tracing::warn!(process = %ctx.id(), decoder = kind.as_str(), backlog = input.len(), "Decoder input saturated");
            restart_requested = reporter.request_restart("input_backlog_exceeded");
        }

        if last_report.elapsed() >= settings.stats_interval {
            let rms = if samples > 0 { (energy / samples as f64).sqrt() } else { 0.0 };
            let metrics = BTreeMap::from([
                ("chunks".to_string(), chunks as f64),
                ("samples".to_string(), samples as f64),
                ("rms".to_string(), rms),
                ("backlog".to_string(), input.len() as f64),
            ]);
            if !reporter.stats(metrics) {
                break;
            }
            last_report = Instant::now();
        }

        // One chunk per scheduler turn
        tokio::task::yield_now().await;
    }

    tracing::debug!(process = %ctx.id(), decoder = kind.as_str(), chunks = chunks, "Decoder exited");
}

/// Receive one chunk, returning (sample count, summed power)
async fn recv_block(input: &ConsumerInput) -> Option<(usize, f64)> {
    match input {
        ConsumerInput::Iq(ch) => ch.recv().await.map(|chunk| {
            let energy = chunk.samples.iter().map(|s| s.norm_sqr() as f64).sum();
            (chunk.len(), energy)
        }),
        ConsumerInput::Audio(ch) => ch.recv().await.map(|chunk| {
            let energy = chunk.samples.iter().map(|s| (s * s) as f64).sum();
            (chunk.samples.len(), energy)
        }),
    }
}
