//! Reader and writer pump tasks
//!
//! Each peer runs one reader task and one writer task around its state
//! machine, coupled only through bounded queues, so both directions of
//! the stream always make progress and lockstep deadlocks cannot form.
//! The writer owns the compressor and its adaptive controller; the reader
//! owns the decompressor and the idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::{mpsc, oneshot};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::compress::controller::CompressionController;
use crate::compress::{compress_payload, decompress_payload, is_compressible};
use crate::error::{Result, SyncError};
use crate::protocol::frame::{read_frame, write_frame, Frame, FrameTag};
use crate::protocol::transport::{TransportReader, TransportWriter};
use crate::protocol::wire::encode_compression_hint;

/// Per-direction wire counters, shared with the pump tasks.
#[derive(Debug, Default)]
pub struct WireCounters {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub wire_bytes_sent: AtomicU64,
}

/// What the reader task delivers to the state machine.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// Clean EOF between frames.
    Eof,
    /// Reader died: timeout, protocol violation, or transport failure.
    Fatal(SyncError),
}

/// Messages accepted by the writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Flush,
}

/// Spawn the reader pump. Frames arrive on the returned queue in wire
/// order; the queue ends after an `Eof` or `Fatal` event.
pub fn spawn_reader<R: TransportReader>(
    mut reader: R,
    depth: usize,
    compressed: bool,
    idle_timeout: Duration,
    counters: Arc<WireCounters>,
) -> mpsc::Receiver<Inbound> {
    let (mut tx, rx) = mpsc::channel(depth);
    compio::runtime::spawn(async move {
        loop {
            let event = match compio::time::timeout(idle_timeout, read_frame(&mut reader)).await {
                Err(_) => Inbound::Fatal(SyncError::Timeout(idle_timeout.as_secs())),
                Ok(Err(e)) => Inbound::Fatal(e),
                Ok(Ok(None)) => Inbound::Eof,
                Ok(Ok(Some(mut frame))) => {
                    counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    if compressed && is_compressible(frame.tag) {
                        match decompress_payload(&frame.payload) {
                            Ok(payload) => {
                                frame.payload = payload;
                                Inbound::Frame(frame)
                            }
                            Err(e) => Inbound::Fatal(e),
                        }
                    } else {
                        Inbound::Frame(frame)
                    }
                }
            };
            let terminal = !matches!(event, Inbound::Frame(_));
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
    })
    .detach();
    rx
}

/// Spawn the writer pump. Returns the outbound queue and a completion
/// channel carrying the writer's final result; closing the queue flushes
/// and shuts the writer down.
pub fn spawn_writer<W: TransportWriter>(
    mut writer: W,
    depth: usize,
    compress_enabled: bool,
    counters: Arc<WireCounters>,
) -> (mpsc::Sender<Outbound>, oneshot::Receiver<Result<()>>) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(depth);
    let (done_tx, done_rx) = oneshot::channel();
    compio::runtime::spawn(async move {
        let mut controller = CompressionController::new();
        let result = async {
            loop {
                // Opportunistic flush: when the queue runs dry, push
                // buffered bytes to the peer before parking.
                let msg = match rx.try_next() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => {
                        writer.flush().await.map_err(SyncError::Io)?;
                        match rx.next().await {
                            Some(msg) => msg,
                            None => break,
                        }
                    }
                };
                match msg {
                    Outbound::Flush => writer.flush().await.map_err(SyncError::Io)?,
                    Outbound::Frame(mut frame) => {
                        let raw_len = frame.payload.len() as u64;
                        let mut compress_time = Duration::ZERO;
                        let compressed = compress_enabled && is_compressible(frame.tag);
                        if compressed {
                            let t0 = Instant::now();
                            frame.payload =
                                compress_payload(&frame.payload, controller.level())?;
                            compress_time = t0.elapsed();
                        }
                        let wire_len = frame.payload.len() as u64 + 5;
                        let t0 = Instant::now();
                        write_frame(&mut writer, &frame).await?;
                        let write_wait = t0.elapsed();
                        counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                        counters.wire_bytes_sent.fetch_add(wire_len, Ordering::Relaxed);

                        if compress_enabled {
                            if let Some(level) = controller.record_frame(
                                raw_len,
                                frame.payload.len() as u64,
                                compress_time,
                                write_wait,
                            ) {
                                debug!("announcing compression level {level}");
                                let hint = Frame::new(
                                    FrameTag::CompressionHint,
                                    encode_compression_hint(level as u8),
                                );
                                write_frame(&mut writer, &hint).await?;
                                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                                counters.wire_bytes_sent.fetch_add(6, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
            writer.flush().await.map_err(SyncError::Io)?;
            Ok(())
        }
        .await;
        let _ = done_tx.send(result);
    })
    .detach();
    (tx, done_rx)
}

/// Push one frame to the writer task.
pub async fn send_frame(
    tx: &mut mpsc::Sender<Outbound>,
    tag: FrameTag,
    payload: Vec<u8>,
) -> Result<()> {
    tx.send(Outbound::Frame(Frame::new(tag, payload)))
        .await
        .map_err(|_| SyncError::Cancelled("writer task is gone".to_string()))
}

/// Ask the writer task to flush buffered bytes.
pub async fn send_flush(tx: &mut mpsc::Sender<Outbound>) -> Result<()> {
    tx.send(Outbound::Flush)
        .await
        .map_err(|_| SyncError::Cancelled("writer task is gone".to_string()))
}
