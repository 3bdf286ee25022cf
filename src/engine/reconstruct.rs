//! File reconstruction
//!
//! Applies an instruction stream on top of the preserved basis file. All
//! writes go to a temp file beside the target; the atomic rename after the
//! whole-file hash verifies is the single visible commit point, so a crash
//! at any earlier moment leaves the previous version intact.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use crate::engine::signature::BlockSignature;
use crate::engine::strong::FileDigest;
use crate::error::{Result, SyncError};
use crate::walk::FileEntry;

/// Prefix for in-flight temp files under the destination tree.
pub const TMP_PREFIX: &str = ".psync-tmp-";

/// In-progress reconstruction of one regular file.
pub struct Reconstructor {
    target: PathBuf,
    tmp_path: PathBuf,
    tmp: File,
    /// Basis file handle; present only when COPY instructions can occur.
    basis: Option<File>,
    signatures: Vec<BlockSignature>,
    digest: FileDigest,
    bytes_written: u64,
}

impl Reconstructor {
    /// Open a temp file for `target` and keep the basis open for copies.
    ///
    /// `signatures` must be the same list sent to the sender for this
    /// file; COPY instructions address blocks through it.
    pub fn begin(target: &Path, signatures: Vec<BlockSignature>, nonce: u64) -> Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = target.with_file_name(format!("{TMP_PREFIX}{nonce:016x}-{file_name}"));
        let tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        let basis = if signatures.is_empty() {
            None
        } else {
            Some(File::open(target)?)
        };
        Ok(Self {
            target: target.to_path_buf(),
            tmp_path,
            tmp,
            basis,
            signatures,
            digest: FileDigest::new(),
            bytes_written: 0,
        })
    }

    /// Append `len` bytes of basis block `block_index`.
    pub fn apply_copy(&mut self, block_index: u32, len: u32, buf: &mut Vec<u8>) -> Result<()> {
        let sig = self
            .signatures
            .get(block_index as usize)
            .copied()
            .ok_or_else(|| {
                SyncError::Protocol(format!("COPY references unknown block {block_index}"))
            })?;
        if len != sig.len {
            return Err(SyncError::Protocol(format!(
                "COPY length {len} does not match block {block_index} length {}",
                sig.len
            )));
        }
        let basis = self.basis.as_mut().ok_or_else(|| {
            SyncError::Protocol("COPY instruction but no basis file".to_string())
        })?;
        buf.resize(len as usize, 0);
        basis.seek(SeekFrom::Start(sig.offset))?;
        basis.read_exact(buf)?;
        self.tmp.write_all(buf)?;
        self.digest.update(buf);
        self.bytes_written += u64::from(len);
        Ok(())
    }

    /// Append literal bytes.
    pub fn apply_literal(&mut self, data: &[u8]) -> Result<()> {
        self.tmp.write_all(data)?;
        self.digest.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Bytes written to the temp file so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Verify the whole-file hash and commit.
    ///
    /// On a digest match the temp file replaces the target atomically and
    /// mtime/mode are applied from the manifest entry. On a mismatch the
    /// temp file is removed and `HashMismatch` is returned so the session
    /// can fall back to a full resend.
    pub fn finish(mut self, expected: u128, entry: &FileEntry) -> Result<()> {
        let actual = self.digest.finish();
        if actual != expected {
            drop(self.tmp);
            let _ = fs::remove_file(&self.tmp_path);
            return Err(SyncError::HashMismatch(entry.path.clone()));
        }
        self.tmp.flush()?;
        drop(self.tmp);
        drop(self.basis.take());
        fs::rename(&self.tmp_path, &self.target)?;
        apply_entry_metadata(&self.target, entry);
        debug!(
            "committed {} ({} bytes)",
            self.target.display(),
            self.bytes_written
        );
        Ok(())
    }

    /// Abandon the reconstruction and remove the temp file.
    pub fn abort(self) {
        drop(self.tmp);
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// Apply mode bits and nanosecond mtime from a manifest entry.
///
/// Failures are downgraded to warnings: a file whose content landed but
/// whose mtime could not be set is still a successful transfer.
pub fn apply_entry_metadata(path: &Path, entry: &FileEntry) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(entry.mode & 0o7777);
        if let Err(e) = fs::set_permissions(path, permissions) {
            warn!("failed to set permissions on {}: {}", path.display(), e);
        }
    }
    let secs = entry.mtime_ns.div_euclid(1_000_000_000);
    let nanos = entry.mtime_ns.rem_euclid(1_000_000_000) as u32;
    let mtime = FileTime::from_unix_time(secs, nanos);
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        warn!("failed to set mtime on {}: {}", path.display(), e);
    }
}

/// Remove stale temp files left by an interrupted earlier run.
pub fn sweep_stale_temp_files(root: &Path) {
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_string_lossy()
                .starts_with(TMP_PREFIX)
        {
            debug!("removing stale temp file {}", entry.path().display());
            let _ = fs::remove_file(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::signature::compute_signatures;
    use crate::engine::strong::block_digest;
    use crate::walk::{FileEntry, FileKind};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn entry_for(path: &str, data: &[u8]) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            kind: FileKind::Regular,
            size: data.len() as u64,
            mtime_ns: 1_700_000_000_123_456_789,
            mode: 0o644,
            symlink_target: None,
            whole_file_hash: None,
        }
    }

    #[test]
    fn literal_only_reconstruction_commits() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("fresh.bin");
        let data = b"hello reconstruction".to_vec();

        let mut r = Reconstructor::begin(&target, Vec::new(), 1).unwrap();
        r.apply_literal(&data).unwrap();
        r.finish(block_digest(&data), &entry_for("fresh.bin", &data))
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), data);
        assert!(fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(TMP_PREFIX)));
    }

    #[test]
    fn copies_pull_from_preserved_basis() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("delta.bin");
        let basis: Vec<u8> = (0u32..10_000).map(|i| (i % 256) as u8).collect();
        fs::write(&target, &basis).unwrap();
        let sigs =
            compute_signatures(&mut Cursor::new(&basis), basis.len() as u64, 4096).unwrap();

        // New content: block 1, then a literal, then block 0.
        let mut expected = basis[4096..8192].to_vec();
        expected.extend_from_slice(b"wedge");
        expected.extend_from_slice(&basis[0..4096]);

        let mut scratch = Vec::new();
        let mut r = Reconstructor::begin(&target, sigs, 2).unwrap();
        r.apply_copy(1, 4096, &mut scratch).unwrap();
        r.apply_literal(b"wedge").unwrap();
        r.apply_copy(0, 4096, &mut scratch).unwrap();
        r.finish(block_digest(&expected), &entry_for("delta.bin", &expected))
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), expected);
    }

    #[test]
    fn hash_mismatch_keeps_original_and_removes_temp() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("kept.bin");
        fs::write(&target, b"original").unwrap();

        let mut r = Reconstructor::begin(&target, Vec::new(), 3).unwrap();
        r.apply_literal(b"corrupted").unwrap();
        let err = r
            .finish(0xDEAD_BEEF, &entry_for("kept.bin", b"corrupted"))
            .unwrap_err();
        assert!(matches!(err, SyncError::HashMismatch(_)));

        assert_eq!(fs::read(&target).unwrap(), b"original");
        assert!(fs::read_dir(dir.path())
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with(TMP_PREFIX)));
    }

    #[test]
    fn bad_copy_reference_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("x.bin");
        let mut scratch = Vec::new();
        let mut r = Reconstructor::begin(&target, Vec::new(), 4).unwrap();
        let err = r.apply_copy(0, 16, &mut scratch).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
        r.abort();
    }

    #[test]
    fn metadata_applied_on_commit() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("meta.bin");
        let data = b"with metadata".to_vec();
        let entry = entry_for("meta.bin", &data);

        let mut r = Reconstructor::begin(&target, Vec::new(), 5).unwrap();
        r.apply_literal(&data).unwrap();
        r.finish(block_digest(&data), &entry).unwrap();

        let meta = fs::metadata(&target).unwrap();
        let mtime = FileTime::from_last_modification_time(&meta);
        assert_eq!(mtime.unix_seconds(), 1_700_000_000);
        assert_eq!(mtime.nanoseconds(), 123_456_789);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
        }
    }

    #[test]
    fn sweep_removes_only_temp_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join(format!("{TMP_PREFIX}00ff-gone.bin"));
        let real = dir.path().join("real.bin");
        fs::write(&stale, b"junk").unwrap();
        fs::write(&real, b"keep").unwrap();

        sweep_stale_temp_files(dir.path());
        assert!(!stale.exists());
        assert!(real.exists());
    }
}
