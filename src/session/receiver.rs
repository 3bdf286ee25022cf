//! Receiving peer
//!
//! Splits into two cooperating tasks so the session never deadlocks on a
//! full pipe: the *generator* walks the destination, classifies each
//! manifest entry, and streams verdicts and signatures back to the
//! sender; the *applier* (this module's main loop) consumes instruction
//! streams in order, reconstructs files, and acknowledges each one.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use super::pump::{
    send_flush, send_frame, spawn_reader, spawn_writer, Inbound, Outbound, WireCounters,
};
use super::{read_hello, write_hello, SessionConfig};
use crate::engine::block::block_size_for;
use crate::engine::reconstruct::{sweep_stale_temp_files, Reconstructor};
use crate::engine::signature::{compute_signatures, BlockSignature};
use crate::error::{Result, SyncError};
use crate::protocol::frame::{write_frame, Frame, FrameTag};
use crate::protocol::transport::{TransportReader, TransportWriter};
use crate::protocol::wire::{self, AckStatus, VerdictAction};
use crate::stats::TransferStats;
use crate::walk::{classify, ClassifyOptions, FileEntry, FileKind};

/// Work the generator hands to the applier.
enum GenEvent {
    /// Expect one instruction stream for this manifest index.
    Apply {
        index: u32,
        sigs: Vec<BlockSignature>,
    },
    /// Generator finished; counts of entries it resolved locally.
    Done { skipped: u64 },
}

/// How one instruction stream ended.
enum ApplyOutcome {
    Applied,
    /// Whole-file hash did not match.
    Mismatch,
    /// Sender gave up on the file mid-stream.
    SenderAborted,
    /// Local I/O prevented reconstruction.
    Failed,
}

/// Run the receiving peer over the given transport halves.
pub async fn run_receiver<R: TransportReader, W: TransportWriter>(
    config: &SessionConfig,
    dest: &Path,
    mut reader: R,
    mut writer: W,
) -> Result<TransferStats> {
    let start = Instant::now();

    let hello = match read_hello(&mut reader).await {
        Ok(hello) => hello,
        Err(e) => {
            let payload = wire::encode_error(e.wire_code(), &e.to_string()).unwrap_or_default();
            let _ = write_frame(&mut writer, &Frame::new(FrameTag::Error, payload)).await;
            let _ = writer.flush().await;
            return Err(e);
        }
    };
    let mut config = config.clone();
    config.apply_features(hello.features);
    write_hello(&mut writer, hello.features).await?;

    if !config.dry_run {
        fs::create_dir_all(dest)?;
        sweep_stale_temp_files(dest);
    }

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

    let mut driver = ReceiverDriver {
        config,
        dest: dest.to_path_buf(),
        inbound,
        out_tx,
        stats: TransferStats::default(),
        peer_stats: None,
        nonce_counter: u64::from(std::process::id()) << 32,
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

    driver.fold_wire_counters();
    let mut stats = driver.stats;
    stats.duration = start.elapsed();
    Ok(stats)
}

struct ReceiverDriver {
    config: SessionConfig,
    dest: PathBuf,
    inbound: mpsc::Receiver<Inbound>,
    out_tx: mpsc::Sender<Outbound>,
    stats: TransferStats,
    peer_stats: Option<TransferStats>,
    nonce_counter: u64,
    counters: Arc<WireCounters>,
}

impl ReceiverDriver {
    /// Snapshot the pump tasks' counters into the stats record.
    fn fold_wire_counters(&mut self) {
        use std::sync::atomic::Ordering;
        self.stats.wire_bytes_sent = self.counters.wire_bytes_sent.load(Ordering::Relaxed);
        self.stats.frames_sent = self.counters.frames_sent.load(Ordering::Relaxed);
        self.stats.frames_received = self.counters.frames_received.load(Ordering::Relaxed);
    }

    async fn run(&mut self) -> Result<()> {
        let manifest = Arc::new(self.read_manifest().await?);
        info!("received manifest: {} entries", manifest.len());

        // The generator classifies and streams verdicts/signatures; the
        // applier below consumes instruction streams. They meet through a
        // bounded task queue so signature lists alive at once stay few.
        let (task_tx, mut task_rx) = mpsc::channel::<GenEvent>(8);
        spawn_generator(
            manifest.clone(),
            self.dest.clone(),
            self.config.clone(),
            self.out_tx.clone(),
            task_tx,
        );

        // Regular streams, in verdict order.
        let mut retry_queue: VecDeque<u32> = VecDeque::new();
        while let Some(event) = task_rx.next().await {
            match event {
                GenEvent::Done { skipped } => {
                    self.stats.files_skipped += skipped;
                }
                GenEvent::Apply { index, sigs } => {
                    let entry = &manifest[index as usize];
                    match self.apply_stream(index, entry, sigs).await? {
                        ApplyOutcome::Applied => {
                            self.stats.files_transferred += 1;
                            self.ack(index, AckStatus::Ok).await?;
                        }
                        ApplyOutcome::Mismatch => {
                            warn!("hash mismatch reconstructing {}, requesting full resend", entry.path);
                            retry_queue.push_back(index);
                            self.ack(index, AckStatus::RetryFull).await?;
                        }
                        ApplyOutcome::SenderAborted | ApplyOutcome::Failed => {
                            self.stats.files_failed += 1;
                            self.ack(index, AckStatus::Failed).await?;
                        }
                    }
                }
            }
        }

        // Full resends for hash-mismatched files, in ack order.
        while let Some(index) = retry_queue.pop_front() {
            let entry = &manifest[index as usize];
            match self.apply_stream(index, entry, Vec::new()).await? {
                ApplyOutcome::Applied => {
                    self.stats.files_transferred += 1;
                    self.ack(index, AckStatus::Ok).await?;
                }
                outcome => {
                    if matches!(outcome, ApplyOutcome::Mismatch) {
                        warn!("{} failed verification twice, giving up", entry.path);
                    }
                    self.stats.files_failed += 1;
                    self.ack(index, AckStatus::Failed).await?;
                }
            }
        }

        if self.config.delete && !self.config.dry_run {
            self.delete_extraneous(&manifest)?;
        }

        // Stats exchange: the sender reports first, we answer.
        while self.peer_stats.is_none() {
            match self.next_event().await? {
                Inbound::Frame(frame) => match frame.tag {
                    FrameTag::Stats => {
                        self.peer_stats = Some(wire::decode_stats(&frame.payload)?);
                    }
                    FrameTag::CompressionHint => {}
                    FrameTag::Error => {
                        let (code, message) = wire::decode_error(&frame.payload)?;
                        return Err(SyncError::from_wire(code, message));
                    }
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "expected STATS, got {other:?}"
                        )))
                    }
                },
                Inbound::Eof => break,
                Inbound::Fatal(e) => return Err(e),
            }
        }
        self.fold_wire_counters();
        send_frame(
            &mut self.out_tx,
            FrameTag::Stats,
            wire::encode_stats(&self.stats),
        )
        .await?;
        send_flush(&mut self.out_tx).await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Inbound> {
        self.inbound
            .next()
            .await
            .ok_or_else(|| SyncError::Cancelled("reader task is gone".to_string()))
    }

    async fn ack(&mut self, index: u32, status: AckStatus) -> Result<()> {
        send_frame(
            &mut self.out_tx,
            FrameTag::FileAck,
            wire::encode_file_ack(index, status),
        )
        .await?;
        send_flush(&mut self.out_tx).await
    }

    /// Collect manifest entries until MANIFEST_END.
    async fn read_manifest(&mut self) -> Result<Vec<FileEntry>> {
        let mut manifest = Vec::new();
        loop {
            match self.next_event().await? {
                Inbound::Frame(frame) => match frame.tag {
                    FrameTag::ManifestEntry => {
                        manifest.push(wire::decode_manifest_entry(
                            &frame.payload,
                            self.config.checksum,
                        )?);
                    }
                    FrameTag::ManifestEnd => return Ok(manifest),
                    FrameTag::CompressionHint => {}
                    FrameTag::Error => {
                        let (code, message) = wire::decode_error(&frame.payload)?;
                        return Err(SyncError::from_wire(code, message));
                    }
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "unexpected {other:?} during manifest"
                        )))
                    }
                },
                Inbound::Eof => {
                    return Err(SyncError::Protocol(
                        "EOF before MANIFEST_END".to_string(),
                    ))
                }
                Inbound::Fatal(e) => return Err(e),
            }
        }
    }

    /// Consume one instruction stream and reconstruct the file.
    ///
    /// Local I/O failures switch to discard mode: the stream is still
    /// drained to FILE_END so the protocol stays in sync.
    async fn apply_stream(
        &mut self,
        index: u32,
        entry: &FileEntry,
        sigs: Vec<BlockSignature>,
    ) -> Result<ApplyOutcome> {
        self.nonce_counter += 1;
        let target = self.dest.join(&entry.path);
        let mut recon = match Reconstructor::begin(&target, sigs, self.nonce_counter) {
            Ok(recon) => Some(recon),
            Err(e) => {
                warn!("cannot start reconstruction of {}: {e}", entry.path);
                None
            }
        };
        let mut scratch = Vec::new();

        loop {
            match self.next_event().await? {
                Inbound::Frame(frame) => match frame.tag {
                    FrameTag::InstrCopy => {
                        let (block_index, len) = wire::decode_instr_copy(&frame.payload)?;
                        if let Some(r) = recon.as_mut() {
                            if let Err(e) = r.apply_copy(block_index, len, &mut scratch) {
                                match e {
                                    SyncError::Protocol(_) => {
                                        if let Some(r) = recon.take() {
                                            r.abort();
                                        }
                                        return Err(e);
                                    }
                                    other => {
                                        warn!("write of {} failed: {other}", entry.path);
                                        if let Some(r) = recon.take() {
                                            r.abort();
                                        }
                                    }
                                }
                            }
                        }
                    }
                    FrameTag::InstrLiteral => {
                        if let Some(r) = recon.as_mut() {
                            if let Err(e) = r.apply_literal(&frame.payload) {
                                warn!("write of {} failed: {e}", entry.path);
                                if let Some(r) = recon.take() {
                                    r.abort();
                                }
                            }
                        }
                    }
                    FrameTag::FileEnd => {
                        let (end_index, digest, aborted) =
                            wire::decode_file_end(&frame.payload)?;
                        if end_index != index {
                            if let Some(r) = recon.take() {
                                r.abort();
                            }
                            return Err(SyncError::Protocol(format!(
                                "FILE_END for {end_index} while applying {index}"
                            )));
                        }
                        if aborted {
                            if let Some(r) = recon.take() {
                                r.abort();
                            }
                            return Ok(ApplyOutcome::SenderAborted);
                        }
                        let Some(r) = recon.take() else {
                            return Ok(ApplyOutcome::Failed);
                        };
                        return match r.finish(digest, entry) {
                            Ok(()) => {
                                debug!("reconstructed {}", entry.path);
                                Ok(ApplyOutcome::Applied)
                            }
                            Err(SyncError::HashMismatch(_)) => Ok(ApplyOutcome::Mismatch),
                            Err(e) => {
                                warn!("commit of {} failed: {e}", entry.path);
                                Ok(ApplyOutcome::Failed)
                            }
                        };
                    }
                    FrameTag::CompressionHint => {}
                    FrameTag::Error => {
                        if let Some(r) = recon.take() {
                            r.abort();
                        }
                        let (code, message) = wire::decode_error(&frame.payload)?;
                        return Err(SyncError::from_wire(code, message));
                    }
                    other => {
                        if let Some(r) = recon.take() {
                            r.abort();
                        }
                        return Err(SyncError::Protocol(format!(
                            "unexpected {other:?} inside an instruction stream"
                        )));
                    }
                },
                Inbound::Eof => {
                    if let Some(r) = recon.take() {
                        r.abort();
                    }
                    return Err(SyncError::Protocol(
                        "EOF inside an instruction stream".to_string(),
                    ));
                }
                Inbound::Fatal(e) => {
                    if let Some(r) = recon.take() {
                        r.abort();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Remove destination paths that are not in the manifest.
    fn delete_extraneous(&mut self, manifest: &[FileEntry]) -> Result<()> {
        let keep: HashSet<&str> = manifest.iter().map(|e| e.path.as_str()).collect();
        let mut removed = 0u64;
        for item in walkdir::WalkDir::new(&self.dest)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .flatten()
        {
            let Ok(rel) = item.path().strip_prefix(&self.dest) else {
                continue;
            };
            let rel_path = rel.to_string_lossy().replace('\\', "/");
            if keep.contains(rel_path.as_str()) {
                continue;
            }
            let result = if item.file_type().is_dir() {
                fs::remove_dir(item.path())
            } else {
                fs::remove_file(item.path())
            };
            match result {
                Ok(()) => {
                    debug!("deleted extraneous {rel_path}");
                    removed += 1;
                }
                Err(e) => warn!("could not delete {rel_path}: {e}"),
            }
        }
        if removed > 0 {
            info!("deleted {removed} extraneous path(s)");
        }
        Ok(())
    }
}

/// Spawn the generator task: verdicts and signatures out, apply work in.
fn spawn_generator(
    manifest: Arc<Vec<FileEntry>>,
    dest: PathBuf,
    config: SessionConfig,
    mut out_tx: mpsc::Sender<Outbound>,
    mut task_tx: mpsc::Sender<GenEvent>,
) {
    compio::runtime::spawn(async move {
        let opts = ClassifyOptions {
            checksum_mode: config.checksum,
            update_only: config.update,
        };
        let mut skipped = 0u64;

        for (index, entry) in manifest.iter().enumerate() {
            let index = index as u32;
            let action = match entry.kind {
                FileKind::Directory => {
                    if !config.dry_run {
                        materialize_directory(&dest, entry);
                    }
                    skipped += 1;
                    VerdictAction::Skip
                }
                FileKind::Symlink => {
                    if !config.dry_run {
                        materialize_symlink(&dest, entry);
                    }
                    skipped += 1;
                    VerdictAction::Skip
                }
                FileKind::Regular => {
                    let action = classify(entry, &dest, opts);
                    if action == VerdictAction::Skip {
                        skipped += 1;
                    }
                    action
                }
            };

            if send_frame(&mut out_tx, FrameTag::Verdict, wire::encode_verdict(index, action))
                .await
                .is_err()
            {
                return;
            }

            if entry.kind != FileKind::Regular || action == VerdictAction::Skip {
                continue;
            }

            let sigs = if action == VerdictAction::Delta && !config.dry_run {
                let block_size = block_size_for(entry.size);
                match signatures_for(&dest.join(&entry.path), block_size) {
                    Ok(sigs) => sigs,
                    Err(e) => {
                        // Basis unreadable after all: fall back to a full
                        // stream by advertising zero blocks.
                        warn!("cannot read basis for {}: {e}", entry.path);
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };

            if action == VerdictAction::Delta {
                for sig in &sigs {
                    if send_frame(&mut out_tx, FrameTag::SigBlock, wire::encode_sig_block(sig))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if send_frame(&mut out_tx, FrameTag::SigEnd, Vec::new())
                    .await
                    .is_err()
                {
                    return;
                }
            }

            if !config.dry_run
                && task_tx
                    .send(GenEvent::Apply { index, sigs })
                    .await
                    .is_err()
            {
                return;
            }
        }

        let _ = send_flush(&mut out_tx).await;
        let _ = task_tx.send(GenEvent::Done { skipped }).await;
    })
    .detach();
}

fn signatures_for(path: &Path, block_size: u64) -> Result<Vec<BlockSignature>> {
    let file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = std::io::BufReader::new(file);
    compute_signatures(&mut reader, len, block_size)
}

fn materialize_directory(dest: &Path, entry: &FileEntry) {
    let path = dest.join(&entry.path);
    if let Err(e) = fs::create_dir_all(&path) {
        warn!("cannot create directory {}: {e}", entry.path);
        return;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode & 0o7777));
    }
}

#[cfg(unix)]
fn materialize_symlink(dest: &Path, entry: &FileEntry) {
    let Some(target) = entry.symlink_target.as_deref() else {
        warn!("symlink {} has no target in manifest", entry.path);
        return;
    };
    let path = dest.join(&entry.path);
    if let Ok(existing) = fs::read_link(&path) {
        if existing.to_string_lossy() == target {
            return;
        }
    }
    if path.exists() || fs::symlink_metadata(&path).is_ok() {
        let _ = fs::remove_file(&path);
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Err(e) = std::os::unix::fs::symlink(target, &path) {
        warn!("cannot create symlink {}: {e}", entry.path);
    }
}

#[cfg(not(unix))]
fn materialize_symlink(_dest: &Path, entry: &FileEntry) {
    warn!("skipping symlink {} on this platform", entry.path);
}
