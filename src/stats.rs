//! Transfer statistics
//!
//! Purely observational counters kept by the session and exchanged in
//! STATS frames at session end. Per-file outcomes stay local; the wire
//! carries only the aggregate counters.

use std::time::Duration;

use tracing::info;

/// Aggregate counters for one session.
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    /// Bytes read from source files.
    pub source_bytes_read: u64,
    /// Literal bytes handed to the wire (pre-compression).
    pub literal_bytes: u64,
    /// Bytes covered by COPY instructions instead of being sent.
    pub copy_bytes_elided: u64,
    /// Bytes actually written to the transport.
    pub wire_bytes_sent: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub files_skipped: u64,
    pub files_transferred: u64,
    pub files_failed: u64,
    /// Per-file records; local only, not serialized.
    pub per_file: Vec<FileOutcome>,
    /// Session wall time; local only.
    pub duration: Duration,
}

/// What happened to one file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub path: String,
    pub bytes: u64,
    pub wall: Duration,
    pub error: Option<String>,
}

impl TransferStats {
    /// Fold the peer's counters into a session-wide view. Receiver-side
    /// counters (files written, skips) are authoritative from the peer in
    /// push mode; wire counters are per-direction and add up.
    pub fn merge_peer(&mut self, peer: &TransferStats) {
        self.wire_bytes_sent += peer.wire_bytes_sent;
        self.frames_sent += peer.frames_sent;
        self.frames_received += peer.frames_received;
        self.files_skipped = self.files_skipped.max(peer.files_skipped);
        self.files_transferred = self.files_transferred.max(peer.files_transferred);
        self.files_failed = self.files_failed.max(peer.files_failed);
    }

    /// Log the end-of-session summary.
    pub fn log_summary(&self) {
        info!(
            "transferred {} file(s), skipped {}, failed {}",
            self.files_transferred, self.files_skipped, self.files_failed
        );
        info!(
            "read {} bytes, sent {} literal bytes, elided {} via copies, {} bytes on wire",
            self.source_bytes_read, self.literal_bytes, self.copy_bytes_elided, self.wire_bytes_sent
        );
        info!(
            "{} frames out, {} frames in, {:.3}s",
            self.frames_sent,
            self.frames_received,
            self.duration.as_secs_f64()
        );
        for outcome in &self.per_file {
            if let Some(err) = &outcome.error {
                info!("failed: {}: {}", outcome.path, err);
            }
        }
    }
}
