//! Session orchestration
//!
//! A session is one run of the sync protocol between a sending peer and a
//! receiving peer. The sender walks its tree, streams the manifest, and
//! answers the receiver's verdicts with instruction streams; the receiver
//! classifies, serves signatures, reconstructs, and acknowledges. Local
//! mode wires both peers together in-process over an OS pipe pair.

pub mod pump;
pub mod receiver;
pub mod sender;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::channel::oneshot;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::protocol::frame::{read_frame, write_frame, Frame, FrameTag};
use crate::protocol::pipe::PipeTransport;
use crate::protocol::transport::{TransportReader, TransportWriter};
use crate::protocol::wire::{self, feature, Hello};
use crate::protocol::PROTOCOL_VERSION;
use crate::stats::TransferStats;

/// Default depth of the inbound/outbound frame queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default idle timeout: no frame in either direction for this long kills
/// the session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// The configuration record a session runs under; the CLI layer maps its
/// flags onto this.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub recursive: bool,
    pub compress: bool,
    pub checksum: bool,
    pub update: bool,
    pub delete: bool,
    pub dry_run: bool,
    pub progress: bool,
    pub excludes: Vec<String>,
    pub queue_depth: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recursive: false,
            compress: false,
            checksum: false,
            update: false,
            delete: false,
            dry_run: false,
            progress: false,
            excludes: Vec::new(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Feature word for the HELLO frame.
    #[must_use]
    pub fn features(&self) -> u32 {
        let mut bits = 0;
        if self.compress {
            bits |= feature::COMPRESSION;
        }
        if self.checksum {
            bits |= feature::CHECKSUM_MODE;
        }
        if self.delete {
            bits |= feature::DELETE_EXTRANEOUS;
        }
        if self.dry_run {
            bits |= feature::DRY_RUN;
        }
        if self.update {
            bits |= feature::UPDATE_ONLY;
        }
        bits
    }

    /// Adopt the initiator's negotiated feature word (server side).
    pub fn apply_features(&mut self, features: u32) {
        self.compress = features & feature::COMPRESSION != 0;
        self.checksum = features & feature::CHECKSUM_MODE != 0;
        self.delete = features & feature::DELETE_EXTRANEOUS != 0;
        self.dry_run = features & feature::DRY_RUN != 0;
        self.update = features & feature::UPDATE_ONLY != 0;
    }
}

/// Write our HELLO straight to the transport (before the pumps start).
pub(crate) async fn write_hello<W: TransportWriter>(writer: &mut W, features: u32) -> Result<()> {
    let hello = Hello {
        version: PROTOCOL_VERSION,
        features,
    };
    let frame = Frame::new(FrameTag::Hello, wire::encode_hello(&hello));
    write_frame(writer, &frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and validate the peer's HELLO.
pub(crate) async fn read_hello<R: TransportReader>(reader: &mut R) -> Result<Hello> {
    let frame = read_frame(reader)
        .await?
        .ok_or_else(|| SyncError::Protocol("EOF before HELLO".to_string()))?;
    if frame.tag != FrameTag::Hello {
        return Err(SyncError::Protocol(format!(
            "expected HELLO, got {:?}",
            frame.tag
        )));
    }
    let hello = wire::decode_hello(&frame.payload)?;
    if hello.version != PROTOCOL_VERSION {
        return Err(SyncError::VersionMismatch {
            peer: hello.version,
            ours: PROTOCOL_VERSION,
        });
    }
    debug!(
        "peer HELLO: version {}, features {:#06x}",
        hello.version, hello.features
    );
    Ok(hello)
}

/// Run a local sync: both peers in-process, joined by OS pipes.
pub async fn sync_local(
    config: SessionConfig,
    source: PathBuf,
    dest: PathBuf,
) -> Result<TransferStats> {
    let (near, far) = PipeTransport::pair()?;
    let (near_read, near_write) = near.into_split();
    let (far_read, far_write) = far.into_split();

    let receiver_config = config.clone();
    let (result_tx, result_rx) = oneshot::channel();
    compio::runtime::spawn(async move {
        let result =
            receiver::run_receiver(&receiver_config, &dest, far_read, far_write).await;
        let _ = result_tx.send(result);
    })
    .detach();

    let sender_result = sender::run_sender(&config, &source, near_read, near_write).await;
    let receiver_result = result_rx
        .await
        .map_err(|_| SyncError::Cancelled("receiver task vanished".to_string()))?;

    let mut stats = sender_result?;
    let peer = receiver_result?;
    stats.files_transferred = stats.files_transferred.max(peer.files_transferred);
    stats.files_failed = stats.files_failed.max(peer.files_failed);
    Ok(stats)
}

/// Run the receiving peer over stdin/stdout (server mode).
pub async fn run_server(config: SessionConfig, dest: &Path) -> Result<TransferStats> {
    let transport = PipeTransport::from_stdio()?;
    let (reader, writer) = transport.into_split();
    receiver::run_receiver(&config, dest, reader, writer).await
}

/// Run a push to a remote host: spawn the remote receiver over the remote
/// shell and drive the sender over its stdio.
pub async fn sync_remote(
    config: SessionConfig,
    source: PathBuf,
    remote_shell: &str,
    user: Option<&str>,
    host: &str,
    dest: &Path,
) -> Result<TransferStats> {
    let peer = crate::protocol::ssh::spawn_remote_receiver(remote_shell, user, host, dest)?;
    let stats = sender::run_sender(&config, &source, peer.reader, peer.writer).await?;
    drop(peer.child);
    Ok(stats)
}
