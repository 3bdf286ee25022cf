//! Remote peer bootstrap
//!
//! Spawns `psync --server DEST` on the remote host through the configured
//! remote shell (ssh by default) and exposes the child's stdio as a
//! session transport. Authentication, agent forwarding, and stream
//! encryption all belong to the remote shell; this module only launches
//! it and wires the byte streams.

use std::io;
use std::path::Path;
use std::process::Stdio;

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite};
use compio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use super::transport::{TransportReader, TransportWriter};
use crate::error::{Result, SyncError};

/// A spawned remote receiver, split for the reader and writer tasks.
pub struct RemotePeer {
    pub reader: RemoteReader,
    pub writer: RemoteWriter,
    /// Held so the child is reaped when the session ends.
    pub child: Child,
}

pub struct RemoteReader {
    stdout: ChildStdout,
}

pub struct RemoteWriter {
    stdin: ChildStdin,
}

/// Spawn the remote receiver over `remote_shell`.
///
/// The remote command mirrors the local server invocation: the peer runs
/// the same state machine we do, driven over its stdin/stdout.
pub fn spawn_remote_receiver(
    remote_shell: &str,
    user: Option<&str>,
    host: &str,
    dest: &Path,
) -> Result<RemotePeer> {
    let target = match user {
        Some(user) => format!("{user}@{host}"),
        None => host.to_string(),
    };
    debug!("spawning remote receiver on {target} via {remote_shell}");

    let mut cmd = Command::new(remote_shell);
    cmd.arg(&target)
        .arg("--")
        .arg("psync")
        .arg("--server")
        .arg(dest.to_string_lossy().as_ref());
    cmd.stdin(Stdio::piped())
        .map_err(|_| SyncError::Config("failed to configure remote stdin".to_string()))?;
    cmd.stdout(Stdio::piped())
        .map_err(|_| SyncError::Config("failed to configure remote stdout".to_string()))?;
    cmd.stderr(Stdio::inherit())
        .map_err(|_| SyncError::Config("failed to configure remote stderr".to_string()))?;

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SyncError::Config("remote process has no stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SyncError::Config("remote process has no stdout".to_string()))?;

    Ok(RemotePeer {
        reader: RemoteReader { stdout },
        writer: RemoteWriter { stdin },
        child,
    })
}

impl TransportReader for RemoteReader {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        let BufResult(res, buf) = self.stdout.read(buf).await;
        (res, buf)
    }
}

impl TransportWriter for RemoteWriter {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        let BufResult(res, buf) = self.stdin.write(buf).await;
        (res, buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        AsyncWrite::flush(&mut self.stdin).await
    }
}
