//! Sending peer
//!
//! Drives the outbound side of a session: HELLO exchange, manifest
//! streaming, and one instruction stream per file the receiver asked for.
//! Instruction streams are pipelined at most one un-acked file deep: file
//! N may start while N-1 is still being written out remotely, but N+1
//! waits for N's FILE_ACK. Files whose reconstruction failed the
//! whole-file hash check are resent in full after the regular streams.

use std::collections::VecDeque;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::pump::{
    send_flush, send_frame, spawn_reader, spawn_writer, Inbound, Outbound, WireCounters,
};
use super::{read_hello, write_hello, SessionConfig};
use crate::engine::block::block_size_for;
use crate::engine::delta::{DeltaMatcher, Instruction};
use crate::engine::signature::{BlockSignature, SignatureIndex};
use crate::error::{Result, SyncError};
use crate::progress::ProgressTracker;
use crate::protocol::frame::FrameTag;
use crate::protocol::transport::{TransportReader, TransportWriter};
use crate::protocol::wire::{self, AckStatus, VerdictAction};
use crate::stats::{FileOutcome, TransferStats};
use crate::walk::{build_exclude_set, build_manifest, FileEntry, FileKind};

/// One receiver decision: a verdict plus, for delta files, the signature
/// list that followed it.
struct Decision {
    action: VerdictAction,
    sigs: Vec<BlockSignature>,
}

/// Reassembles the receiver's verdict/signature stream into per-file
/// decisions, enforcing the protocol's ordering as it goes.
#[derive(Default)]
struct DecisionBuffer {
    ready: VecDeque<(u32, Decision)>,
    open: Option<(u32, Decision)>,
    next_index: u32,
}

impl DecisionBuffer {
    fn ingest_verdict(&mut self, index: u32, action: VerdictAction) -> Result<()> {
        if self.open.is_some() {
            return Err(SyncError::Protocol(
                "VERDICT while signatures still open".to_string(),
            ));
        }
        if index != self.next_index {
            return Err(SyncError::Protocol(format!(
                "verdict for file {index}, expected {}",
                self.next_index
            )));
        }
        self.next_index += 1;
        let decision = Decision {
            action,
            sigs: Vec::new(),
        };
        if action == VerdictAction::Delta {
            self.open = Some((index, decision));
        } else {
            self.ready.push_back((index, decision));
        }
        Ok(())
    }

    fn ingest_sig(&mut self, sig: BlockSignature) -> Result<()> {
        match self.open.as_mut() {
            Some((_, decision)) => {
                decision.sigs.push(sig);
                Ok(())
            }
            None => Err(SyncError::Protocol(
                "SIG_BLOCK outside a delta verdict".to_string(),
            )),
        }
    }

    fn ingest_sig_end(&mut self) -> Result<()> {
        match self.open.take() {
            Some(entry) => {
                self.ready.push_back(entry);
                Ok(())
            }
            None => Err(SyncError::Protocol(
                "SIG_END outside a delta verdict".to_string(),
            )),
        }
    }

    fn pop_for(&mut self, index: u32) -> Option<Decision> {
        match self.ready.front() {
            Some((front, _)) if *front == index => self.ready.pop_front().map(|(_, d)| d),
            _ => None,
        }
    }
}

struct SenderDriver {
    config: SessionConfig,
    source: PathBuf,
    manifest: Vec<FileEntry>,
    inbound: mpsc::Receiver<Inbound>,
    out_tx: mpsc::Sender<Outbound>,
    stats: TransferStats,
    decisions: DecisionBuffer,
    /// Files whose FILE_END went out but whose ack has not come back.
    unacked: VecDeque<u32>,
    /// Files the receiver asked to have resent in full.
    retries: VecDeque<u32>,
    peer_stats: Option<TransferStats>,
    progress: Option<ProgressTracker>,
    file_started: Option<Instant>,
    counters: Arc<WireCounters>,
}

/// Run the sending peer over the given transport halves.
pub async fn run_sender<R: TransportReader, W: TransportWriter>(
    config: &SessionConfig,
    source: &Path,
    mut reader: R,
    mut writer: W,
) -> Result<TransferStats> {
    let start = Instant::now();
    let features = config.features();

    write_hello(&mut writer, features).await?;
    let hello = match read_hello(&mut reader).await {
        Ok(hello) => hello,
        Err(e) => {
            let payload = wire::encode_error(e.wire_code(), &e.to_string()).unwrap_or_default();
            let _ = crate::protocol::frame::write_frame(
                &mut writer,
                &crate::protocol::frame::Frame::new(FrameTag::Error, payload),
            )
            .await;
            let _ = writer.flush().await;
            return Err(e);
        }
    };
    if hello.features != features {
        return Err(SyncError::Protocol(format!(
            "peer feature word {:#06x} does not match ours {features:#06x}",
            hello.features
        )));
    }

    let excludes = build_exclude_set(&config.excludes)?;
    let (manifest, unreadable) =
        build_manifest(source, &excludes, config.recursive, config.checksum)?;
    info!("manifest: {} entries", manifest.len());

    let counters = Arc::new(WireCounters::default());
    let inbound = spawn_reader(
        reader,
        config.queue_depth,
        config.compress,
        config.idle_timeout,
        counters.clone(),
    );
    let (out_tx, writer_done) = spawn_writer(
        writer,
        config.queue_depth,
        config.compress,
        counters.clone(),
    );

    let progress = config.progress.then(|| {
        let total: u64 = manifest
            .iter()
            .filter(|e| e.kind == FileKind::Regular)
            .map(|e| e.size)
            .sum();
        ProgressTracker::new(total)
    });

    let mut driver = SenderDriver {
        config: config.clone(),
        source: source.to_path_buf(),
        manifest,
        inbound,
        out_tx,
        stats: TransferStats {
            files_skipped: unreadable,
            ..TransferStats::default()
        },
        decisions: DecisionBuffer::default(),
        unacked: VecDeque::new(),
        retries: VecDeque::new(),
        peer_stats: None,
        progress,
        file_started: None,
        counters: counters.clone(),
    };

    let run_result = driver.run().await;
    if let Err(e) = &run_result {
        let payload = wire::encode_error(e.wire_code(), &e.to_string()).unwrap_or_default();
        let _ = send_frame(&mut driver.out_tx, FrameTag::Error, payload).await;
        let _ = send_flush(&mut driver.out_tx).await;
    }
    driver.out_tx.close_channel();
    let writer_result = writer_done
        .await
        .unwrap_or_else(|_| Err(SyncError::Cancelled("writer task vanished".to_string())));

    run_result?;
    writer_result?;

    if let Some(progress) = &driver.progress {
        progress.finish();
    }

    driver.fold_wire_counters();
    let mut stats = driver.stats;
    stats.duration = start.elapsed();
    if let Some(peer) = driver.peer_stats {
        stats.merge_peer(&peer);
    }
    Ok(stats)
}

impl SenderDriver {
    /// Snapshot the pump tasks' counters into the stats record.
    fn fold_wire_counters(&mut self) {
        use std::sync::atomic::Ordering;
        self.stats.wire_bytes_sent = self.counters.wire_bytes_sent.load(Ordering::Relaxed);
        self.stats.frames_sent = self.counters.frames_sent.load(Ordering::Relaxed);
        self.stats.frames_received = self.counters.frames_received.load(Ordering::Relaxed);
    }

    async fn run(&mut self) -> Result<()> {
        // Manifest phase.
        for entry in &self.manifest {
            let payload = wire::encode_manifest_entry(entry)?;
            send_frame(&mut self.out_tx, FrameTag::ManifestEntry, payload).await?;
        }
        send_frame(&mut self.out_tx, FrameTag::ManifestEnd, Vec::new()).await?;
        send_flush(&mut self.out_tx).await?;

        // Per-file phase, driven by the receiver's verdicts in manifest
        // order.
        for index in 0..self.manifest.len() as u32 {
            let decision = self.wait_decision(index).await?;
            let entry = self.manifest[index as usize].clone();
            match decision.action {
                VerdictAction::Skip => {
                    self.stats.files_skipped += 1;
                }
                VerdictAction::Full | VerdictAction::Delta => {
                    if entry.kind != FileKind::Regular {
                        // Directories and symlinks are materialized on the
                        // receiver from the manifest alone.
                        self.stats.files_skipped += 1;
                        continue;
                    }
                    if self.config.dry_run {
                        debug!("dry run: would transfer {}", entry.path);
                        self.stats.files_transferred += 1;
                        continue;
                    }
                    self.wait_unacked_at_most(1).await?;
                    self.stream_file(index, &entry, decision.sigs).await?;
                }
            }
        }

        // Drain acks; resend any hash-mismatched files in full, after all
        // regular streams.
        loop {
            if self.unacked.is_empty() {
                if let Some(retry_index) = self.retries.pop_front() {
                    let entry = self.manifest[retry_index as usize].clone();
                    info!("resending {} in full after hash mismatch", entry.path);
                    self.stream_file(retry_index, &entry, Vec::new()).await?;
                    continue;
                }
                break;
            }
            self.pump_one(false).await?;
        }

        // Stats exchange, then shut down.
        self.fold_wire_counters();
        send_frame(
            &mut self.out_tx,
            FrameTag::Stats,
            wire::encode_stats(&self.stats),
        )
        .await?;
        send_flush(&mut self.out_tx).await?;
        while self.peer_stats.is_none() {
            if self.pump_one(true).await? {
                break;
            }
        }
        Ok(())
    }

    /// Stream one file's instructions and FILE_END. `sigs` is empty for a
    /// full transfer.
    async fn stream_file(
        &mut self,
        index: u32,
        entry: &FileEntry,
        sigs: Vec<BlockSignature>,
    ) -> Result<()> {
        self.file_started = Some(Instant::now());
        let path = self.source.join(&entry.path);
        let block_size = block_size_for(entry.size);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("cannot open {}: {e}", entry.path);
                return self.abort_file(index).await;
            }
        };

        let sig_index = SignatureIndex::build(&sigs, block_size);
        let mut matcher = DeltaMatcher::new(BufReader::new(file), entry.size, sig_index);
        loop {
            match matcher.next_instruction() {
                Ok(Some(Instruction::Copy { block_index, len })) => {
                    send_frame(
                        &mut self.out_tx,
                        FrameTag::InstrCopy,
                        wire::encode_instr_copy(block_index, len),
                    )
                    .await?;
                }
                Ok(Some(Instruction::Literal(bytes))) => {
                    send_frame(&mut self.out_tx, FrameTag::InstrLiteral, bytes).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("read of {} failed mid-stream: {e}", entry.path);
                    let (_, summary) = matcher.finish();
                    self.stats.source_bytes_read += summary.bytes_read;
                    return self.abort_file(index).await;
                }
            }
        }

        let (digest, summary) = matcher.finish();
        self.stats.source_bytes_read += summary.bytes_read;
        self.stats.literal_bytes += summary.literal_bytes;
        self.stats.copy_bytes_elided += summary.copy_bytes;
        send_frame(
            &mut self.out_tx,
            FrameTag::FileEnd,
            wire::encode_file_end(index, digest, false),
        )
        .await?;
        send_flush(&mut self.out_tx).await?;
        self.unacked.push_back(index);
        debug!(
            "streamed {}: {} literal, {} copied",
            entry.path, summary.literal_bytes, summary.copy_bytes
        );
        Ok(())
    }

    /// Terminate a stream the source file fell out from under.
    async fn abort_file(&mut self, index: u32) -> Result<()> {
        send_frame(
            &mut self.out_tx,
            FrameTag::FileEnd,
            wire::encode_file_end(index, 0, true),
        )
        .await?;
        send_flush(&mut self.out_tx).await?;
        self.unacked.push_back(index);
        Ok(())
    }

    /// Block until the receiver's decision for `index` is available.
    async fn wait_decision(&mut self, index: u32) -> Result<Decision> {
        loop {
            if let Some(decision) = self.decisions.pop_for(index) {
                return Ok(decision);
            }
            self.pump_one(false).await?;
        }
    }

    /// Pipelining bound: wait until at most `limit` streams are un-acked.
    async fn wait_unacked_at_most(&mut self, limit: usize) -> Result<()> {
        while self.unacked.len() > limit {
            self.pump_one(false).await?;
        }
        Ok(())
    }

    /// Process one inbound event. Returns true on EOF; EOF is only legal
    /// when `eof_ok` (the tail of the stats exchange).
    async fn pump_one(&mut self, eof_ok: bool) -> Result<bool> {
        let event = self
            .inbound
            .next()
            .await
            .ok_or_else(|| SyncError::Cancelled("reader task is gone".to_string()))?;
        match event {
            Inbound::Fatal(e) => Err(e),
            Inbound::Eof => {
                if eof_ok {
                    Ok(true)
                } else {
                    Err(SyncError::Protocol(
                        "peer closed the stream mid-session".to_string(),
                    ))
                }
            }
            Inbound::Frame(frame) => {
                self.dispatch(frame)?;
                Ok(false)
            }
        }
    }

    fn dispatch(&mut self, frame: crate::protocol::frame::Frame) -> Result<()> {
        match frame.tag {
            FrameTag::Verdict => {
                let (index, action) = wire::decode_verdict(&frame.payload)?;
                self.decisions.ingest_verdict(index, action)
            }
            FrameTag::SigBlock => {
                let sig = wire::decode_sig_block(&frame.payload)?;
                self.decisions.ingest_sig(sig)
            }
            FrameTag::SigEnd => self.decisions.ingest_sig_end(),
            FrameTag::FileAck => {
                let (index, status) = wire::decode_file_ack(&frame.payload)?;
                self.handle_ack(index, status)
            }
            FrameTag::Stats => {
                self.peer_stats = Some(wire::decode_stats(&frame.payload)?);
                Ok(())
            }
            FrameTag::CompressionHint => {
                let level = wire::decode_compression_hint(&frame.payload)?;
                debug!("peer compresses its direction at level {level}");
                Ok(())
            }
            FrameTag::Error => {
                let (code, message) = wire::decode_error(&frame.payload)?;
                Err(SyncError::from_wire(code, message))
            }
            other => Err(SyncError::Protocol(format!(
                "unexpected {other:?} frame on sender side"
            ))),
        }
    }

    fn handle_ack(&mut self, index: u32, status: AckStatus) -> Result<()> {
        let expected = self.unacked.pop_front().ok_or_else(|| {
            SyncError::Protocol(format!("FILE_ACK for {index} with nothing in flight"))
        })?;
        if expected != index {
            return Err(SyncError::Protocol(format!(
                "FILE_ACK for {index}, expected {expected}"
            )));
        }
        let entry = &self.manifest[index as usize];
        let wall = self
            .file_started
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        match status {
            AckStatus::Ok => {
                self.stats.files_transferred += 1;
                if let Some(progress) = &mut self.progress {
                    progress.update(entry.size);
                }
                self.stats.per_file.push(FileOutcome {
                    path: entry.path.clone(),
                    bytes: entry.size,
                    wall,
                    error: None,
                });
            }
            AckStatus::RetryFull => {
                warn!("receiver reports hash mismatch on {}, will resend", entry.path);
                self.retries.push_back(index);
            }
            AckStatus::Failed => {
                self.stats.files_failed += 1;
                self.stats.per_file.push(FileOutcome {
                    path: entry.path.clone(),
                    bytes: entry.size,
                    wall,
                    error: Some("transfer failed".to_string()),
                });
            }
        }
        Ok(())
    }
}
