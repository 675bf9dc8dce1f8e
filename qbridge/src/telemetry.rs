//! Telemetry mailbox and stream listener.
//!
//! The controller pushes `Telemetry` frames over a long-lived TCP
//! connection; the listener writes each one into a single-slot
//! last-value-wins mailbox that the cycle loop reads. The mailbox is a
//! `tokio::sync::watch` channel, so a reader can never observe a
//! partially written snapshot.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;

use crate::codec::JsonFrameCodec;
use crate::protocol::Telemetry;

/// A snapshot plus the instant the bridge received it, for staleness
/// checks against the cycle period.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub telemetry: Telemetry,
    pub received_at: Instant,
}

impl TelemetrySample {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            telemetry,
            received_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Writer side of the mailbox. Cloneable so both the stream listener
/// and the startup status seed can publish.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: std::sync::Arc<watch::Sender<Option<TelemetrySample>>>,
}

impl TelemetrySink {
    pub fn publish(&self, telemetry: Telemetry) {
        let _ = self.tx.send(Some(TelemetrySample::new(telemetry)));
    }
}

/// Reader side of the mailbox.
#[derive(Debug, Clone)]
pub struct TelemetryChannel {
    rx: watch::Receiver<Option<TelemetrySample>>,
}

impl TelemetryChannel {
    /// Most recent snapshot, if any has arrived yet.
    pub fn latest(&self) -> Option<TelemetrySample> {
        self.rx.borrow().clone()
    }
}

pub fn channel() -> (TelemetrySink, TelemetryChannel) {
    let (tx, rx) = watch::channel(None);
    (
        TelemetrySink {
            tx: std::sync::Arc::new(tx),
        },
        TelemetryChannel { rx },
    )
}

/// Reconnect backoff bounds for the stream listener.
const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// Consume the controller's telemetry push stream until shutdown.
///
/// Connection loss is recoverable: the listener reconnects with capped
/// exponential backoff and keeps the last published snapshot in place.
/// The cycle loop's staleness rule handles the gap.
pub async fn run_stream_listener(
    addr: String,
    sink: TelemetrySink,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BASE;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stream = tokio::select! {
            _ = shutdown_rx.changed() => break,
            connected = TcpStream::connect(&addr) => connected,
        };

        match stream {
            Ok(stream) => {
                tracing::info!(target: "qbridge::telemetry", %addr, "telemetry stream connected");
                backoff = RECONNECT_BASE;
                read_frames(stream, &sink, &mut shutdown_rx).await;
                if *shutdown_rx.borrow() {
                    break;
                }
                tracing::warn!(target: "qbridge::telemetry", %addr, "telemetry stream closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(
                    target: "qbridge::telemetry",
                    %addr,
                    error = %e,
                    backoff_ms = backoff.as_millis(),
                    "telemetry stream connect failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
    tracing::debug!(target: "qbridge::telemetry", "telemetry listener exiting");
}

async fn read_frames(
    stream: TcpStream,
    sink: &TelemetrySink,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut reader = FramedRead::new(stream, JsonFrameCodec::<Telemetry>::new());
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = reader.next() => match frame {
                Some(Ok(telemetry)) => {
                    tracing::trace!(
                        target: "qbridge::telemetry",
                        qber_pct = telemetry.qber_pct,
                        "snapshot received"
                    );
                    sink.publish(telemetry);
                }
                Some(Err(e)) => {
                    tracing::warn!(target: "qbridge::telemetry", error = %e, "telemetry frame error");
                    break;
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedWrite;

    fn sample(qber_pct: f64) -> Telemetry {
        Telemetry {
            t_unix_ms: 0,
            qber_pct,
            sifted_rate_cps: 0.0,
            secure_rate_bps: 0.0,
            jitter_ps: 0.0,
            atm_loss_db_per_km: 0.0,
            dark_cps: 0.0,
            det_eff: 0.0,
            temperature_c: 0.0,
            site: "test".to_string(),
            active_domain: Default::default(),
            scintillation_idx: 0.0,
        }
    }

    #[test]
    fn mailbox_is_last_value_wins() {
        let (sink, channel) = channel();
        assert!(channel.latest().is_none());

        sink.publish(sample(1.0));
        sink.publish(sample(2.0));
        let latest = channel.latest().unwrap();
        assert_eq!(latest.telemetry.qber_pct, 2.0);
    }

    #[test]
    fn sample_age_grows() {
        let s = TelemetrySample::new(sample(1.0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.age() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn listener_publishes_streamed_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (sink, channel) = channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_stream_listener(addr, sink, shutdown_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let mut writer = FramedWrite::new(stream, JsonFrameCodec::<Telemetry>::new());
        writer.send(sample(1.5)).await.unwrap();
        writer.send(sample(2.5)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(s) = channel.latest()
                    && s.telemetry.qber_pct == 2.5
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not publish the streamed snapshots");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener did not exit on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn listener_survives_a_dropped_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (sink, channel) = channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_stream_listener(addr, sink, shutdown_rx));

        // First connection: one frame, then drop.
        let (stream, _) = listener.accept().await.unwrap();
        let mut writer = FramedWrite::new(stream, JsonFrameCodec::<Telemetry>::new());
        writer.send(sample(1.0)).await.unwrap();
        drop(writer);

        // Listener reconnects; second connection delivers another frame.
        let (stream, _) = listener.accept().await.unwrap();
        let mut writer = FramedWrite::new(stream, JsonFrameCodec::<Telemetry>::new());
        writer.send(sample(9.0)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(s) = channel.latest()
                    && s.telemetry.qber_pct == 9.0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not recover after a dropped connection");

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
