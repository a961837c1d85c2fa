//! IQ recorder
//!
//! Writes every chunk delivered to its broadcaster subscription to a file as
//! interleaved little-endian `f32` I/Q pairs.

use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::channel::BoundedChannel;
use crate::control::{MessageBody, PlaneEvent, PlaneSender};
use crate::process::ProcessContext;
use crate::registry::{DeviceId, SessionId};
use crate::sample::IqChunk;

/// Everything a recorder process needs
pub struct RecorderSetup {
    pub device: DeviceId,
    pub session: SessionId,
    pub path: PathBuf,
    pub input: BoundedChannel<IqChunk>,
    pub plane: PlaneSender,
}

/// Serialize a chunk as interleaved little-endian `f32` I/Q
pub fn encode_chunk(chunk: &IqChunk, buf: &mut BytesMut) {
    buf.reserve(chunk.len() * 8);
    for s in chunk.samples.iter() {
        buf.put_f32_le(s.re);
        buf.put_f32_le(s.im);
    }
}

/// Recorder process body
pub async fn run_recorder(mut ctx: ProcessContext, setup: RecorderSetup) {
    let RecorderSetup {
        device,
        session,
        path,
        input,
        plane,
    } = setup;

    let report = |body: MessageBody| {
        let _ = plane.send(PlaneEvent::Recorder {
            device: device.clone(),
            session: session.clone(),
            body,
        });
    };

    let file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(device = %device, session = %session, path = %path.display(), error = %e, "Recorder could not open file");
            report(MessageBody::Error {
                message: format!("cannot create {}: {}", path.display(), e),
            });
            return;
        }
    };

    tracing::info!(device = %device, session = %session, path = %path.display(), "Recording started");
    report(MessageBody::Status {
        status: "recording".into(),
    });

    let mut writer = BufWriter::new(file);
    let mut buf = BytesMut::new();
    let mut written = 0u64;
    let mut tuning = None;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.stopped() => break,
            chunk = input.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let current = (chunk.center_freq, chunk.sample_rate);
        if tuning != Some(current) {
            tracing::debug!(session = %session, center_freq = current.0, sample_rate = current.1, "Recorder tuning changed");
            tuning = Some(current);
        }

        encode_chunk(&chunk, &mut buf);
        if let Err(e) = writer.write_all(&buf).await {
            report(MessageBody::Error {
                message: format!("write failed: {}", e),
            });
            return;
        }
        written += buf.len() as u64;
        buf.clear();
    }

    if let Err(e) = writer.flush().await {
        tracing::warn!(session = %session, error = %e, "Recorder flush failed");
    }

    tracing::info!(device = %device, session = %session, bytes = written, "Recording stopped");
    report(MessageBody::Status {
        status: format!("stopped ({} bytes)", written),
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use num_complex::Complex32;
    use tokio::sync::mpsc;

    use super::*;
    use crate::process::{ProcessHandle, TaskProcess};

    #[test]
    fn test_encode_is_interleaved_le() {
        let chunk = IqChunk::new(
            vec![Complex32::new(1.0, -1.0), Complex32::new(0.5, 0.25)],
            1,
            1,
        );
        let mut buf = BytesMut::new();
        encode_chunk(&chunk, &mut buf);

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&buf[4..8], &(-1.0f32).to_le_bytes());
        assert_eq!(&buf[12..16], &0.25f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_recorder_writes_file() {
        let path = std::env::temp_dir().join(format!("sdr-hub-rec-{}.iq", std::process::id()));
        let input = BoundedChannel::new(8);
        let (plane, mut events) = mpsc::unbounded_channel();

        let setup = RecorderSetup {
            device: DeviceId::new("rtl-0"),
            session: SessionId::new("s1"),
            path: path.clone(),
            input: input.clone(),
            plane,
        };
        let process = TaskProcess::spawn("recorder", move |ctx| run_recorder(ctx, setup));

        input
            .try_send(IqChunk::new(vec![Complex32::new(0.1, 0.2); 10], 1, 1))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        process.request_stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!process.is_alive());

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data.len(), 80);
        let _ = tokio::fs::remove_file(&path).await;

        let mut statuses = Vec::new();
        while let Ok(PlaneEvent::Recorder { body: MessageBody::Status { status }, .. }) = events.try_recv() {
            statuses.push(status);
        }
        assert_eq!(statuses.first().map(String::as_str), Some("recording"));
        assert!(statuses.last().unwrap().contains("80 bytes"));
    }

    #[tokio::test]
    async fn test_unwritable_path_reports_error() {
        let (plane, mut events) = mpsc::unbounded_channel();
        let setup = RecorderSetup {
            device: DeviceId::new("rtl-0"),
            session: SessionId::new("s1"),
            path: PathBuf::from("/nonexistent-dir/sdr-hub/out.iq"),
            input: BoundedChannel::new(1),
            plane,
        };
        let process = TaskProcess::spawn("recorder", move |ctx| run_recorder(ctx, setup));

        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Some(PlaneEvent::Recorder { body: MessageBody::Error { message }, .. }) => {
                assert!(message.contains("cannot create"))
            }
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!process.is_alive());
    }
}
