//! Spectrum processor
//!
//! Consumes the worker's spectrum-bound channel and publishes averaged power
//! frames. Full FFT rendering belongs to the display layer; this process only
//! tracks mean and peak power per averaging window.

use tokio::sync::mpsc;

use crate::channel::BoundedChannel;
use crate::control::{PlaneEvent, PlaneSender, SpectrumFrame};
use crate::process::ProcessContext;
use crate::registry::DeviceId;
use crate::sample::IqChunk;

/// Floor for power values, avoids `-inf` on silence
const POWER_FLOOR_DB: f32 = -150.0;

/// Control message for a spectrum processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumCommand {
    /// Discard the partial averaging window
    Reset,
}

/// Everything a spectrum processor needs
pub struct SpectrumSetup {
    pub device: DeviceId,
    pub input: BoundedChannel<IqChunk>,
    pub commands: mpsc::UnboundedReceiver<SpectrumCommand>,
    pub average: usize,
    pub plane: PlaneSender,
}

#[derive(Debug, Default)]
struct Window {
    chunks: usize,
    samples: usize,
    energy: f64,
    peak: f32,
    tuning: Option<(u64, u32)>,
}

impl Window {
    fn add(&mut self, chunk: &IqChunk) {
        let tuning = (chunk.center_freq, chunk.sample_rate);
        if self.tuning.is_some_and(|t| t != tuning) {
            *self = Window::default();
        }
        self.tuning = Some(tuning);

        for s in chunk.samples.iter() {
            let p = s.norm_sqr();
            self.energy += p as f64;
            self.peak = self.peak.max(p);
        }
        self.samples += chunk.len();
        self.chunks += 1;
    }

    fn frame(&self, device: &DeviceId) -> Option<SpectrumFrame> {
        let (center_freq, sample_rate) = self.tuning?;
        if self.samples == 0 {
            return None;
        }
        let mean = (self.energy / self.samples as f64) as f32;
        Some(SpectrumFrame {
            device: device.clone(),
            center_freq,
            sample_rate,
            power_db: to_db(mean),
            peak_db: to_db(self.peak),
        })
    }
}

fn to_db(power: f32) -> f32 {
    if power > 0.0 {
        (10.0 * power.log10()).max(POWER_FLOOR_DB)
    } else {
        POWER_FLOOR_DB
    }
}

/// Spectrum processor body
pub async fn run_spectrum(mut ctx: ProcessContext, setup: SpectrumSetup) {
    let SpectrumSetup {
        device,
        input,
        mut commands,
        average,
        plane,
    } = setup;
    let average = average.max(1);
    let mut window = Window::default();
    let mut frames = 0u64;

    tracing::debug!(device = %device, average = average, "Spectrum processor started");

    loop {
        tokio::select! {
            biased;
            _ = ctx.stopped() => break,
            command = commands.recv() => match command {
                Some(SpectrumCommand::Reset) => {
                    let stale = input.drain();
                    window = Window::default();
                    tracing::debug!(device = %device, stale = stale, "Spectrum averaging reset");
                }
                None => break,
            },
            chunk = input.recv() => {
                let Some(chunk) = chunk else { break };
                window.add(&chunk);
                if window.chunks >= average {
                    if let Some(frame) = window.frame(&device) {
                        frames += 1;
                        if plane.send(PlaneEvent::Spectrum(frame)).is_err() {
                            break;
                        }
                    }
                    window = Window::default();
                }
            }
        }
    }

    tracing::debug!(device = %device, frames = frames, "Spectrum processor stopped");
}
