//! Synthetic SDR hub example
//!
//! Run with: cargo run --example synthetic_hub [SECONDS]
//!
//! Starts one synthetic device with two client sessions, attaches an FM
//! demodulator, an SSTV decoder (which brings up its own internal FM
//! demodulator) and a LoRa decoder, retunes the device halfway through and
//! prints every hub event as a JSON line. Spectrum frames are summarized to
//! keep the output readable.

use std::sync::Arc;
use std::time::Duration;

use sdr_hub::{
    BuiltinFactory, ConsumerRole, ControlPlane, DecoderKind, DefaultResolver, DemodulatorKind, DeviceConfig, DeviceId,
    HubConfig, HubEvent, Overrides, SessionId, SlotKey, StartRequest, SyntheticFactory, Vfo,
};

fn tuned(role: ConsumerRole, freq: u64) -> StartRequest {
    StartRequest::new(role).overrides(Overrides {
        freq: Some(freq),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let seconds: u64 = std::env::args().nth(1).map(|s| s.parse()).transpose()?.unwrap_or(5);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sdr_hub=info".parse()?)
                .add_directive("synthetic_hub=info".parse()?),
        )
        .init();

    let hub = ControlPlane::spawn(
        HubConfig::default(),
        Arc::new(SyntheticFactory::default()),
        Arc::new(BuiltinFactory::new()),
        Arc::new(DefaultResolver::default()),
    );

    let mut events = hub.subscribe_events();
    let printer = tokio::spawn(async move {
        let mut spectrum_frames = 0u64;
        while let Ok(event) = events.recv().await {
            match &event {
                HubEvent::Spectrum(_) => {
                    spectrum_frames += 1;
                    if spectrum_frames % 50 == 0 {
                        println!("{{\"event\":\"spectrum-summary\",\"frames\":{}}}", spectrum_frames);
                    }
                }
                _ => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Cannot serialize event"),
                },
            }
        }
    });

    let device = DeviceId::new("synthetic-0");
    let center = 145_800_000;
    let config = DeviceConfig::new().sample_rate(240_000).center_freq(center).gain(30.0);

    hub.start_device(device.clone(), config.clone(), SessionId::new("tab-1")).await?;
    hub.start_device(device.clone(), config, SessionId::new("tab-2")).await?;

    let tone = center + 25_000;
    hub.start_consumer(
        SlotKey::new(device.clone(), SessionId::new("tab-1"), Vfo(1)),
        tuned(ConsumerRole::Demodulator(DemodulatorKind::Fm), tone),
    )
    .await?;
    hub.start_consumer(
        SlotKey::new(device.clone(), SessionId::new("tab-1"), Vfo(2)),
        tuned(ConsumerRole::Decoder(DecoderKind::Sstv), tone),
    )
    .await?;
    hub.start_consumer(
        SlotKey::new(device.clone(), SessionId::new("tab-2"), Vfo(1)),
        tuned(ConsumerRole::Decoder(DecoderKind::Lora), tone),
    )
    .await?;

    tokio::time::sleep(Duration::from_secs(seconds) / 2).await;
    hub.configure_device(device.clone(), DeviceConfig::new().center_freq(center + 10_000)).await?;

    tokio::time::sleep(Duration::from_secs(seconds) / 2).await;
    let stats = hub.device_stats(device.clone()).await?;
    println!("{}", serde_json::to_string(&stats)?);

    hub.stop_device(device.clone(), SessionId::new("tab-2")).await?;
    hub.stop_device(device, SessionId::new("tab-1")).await?;
    hub.shutdown().await?;

    printer.abort();
    Ok(())
}
