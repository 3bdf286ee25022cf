//! Tree walking and change detection
//!
//! The sender enumerates its source tree into an ordered manifest; the
//! receiver classifies each manifest entry against its own tree into
//! skip / send-full / delta verdicts. Paths are relative,
//! forward-slash-separated, and ordered so a directory always precedes
//! its descendants (walkdir's sorted depth-first order, i.e. lexicographic
//! on path components).

use std::fs;
use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::engine::block::block_size_for;
use crate::engine::strong::FileDigest;
use crate::error::{Result, SyncError};
use crate::protocol::wire::VerdictAction;

/// Kind of filesystem object in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

impl FileKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Regular),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            other => Err(SyncError::Protocol(format!("unknown file kind {other}"))),
        }
    }
}

/// One logical filesystem object in the sync set. Immutable for the
/// lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path, forward-slash separated.
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    /// Nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Low 12 bits of the mode.
    pub mode: u32,
    pub symlink_target: Option<String>,
    /// Whole-file strong hash; present only in checksum mode.
    pub whole_file_hash: Option<u128>,
}

/// Compile exclude patterns (`*`, `?`, `**`, literal prefixes).
pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // `*` and `?` stop at slashes; only `**` crosses directories.
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| SyncError::Config(format!("bad exclude pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Config(format!("failed to compile excludes: {e}")))
}

fn mtime_ns_of(meta: &fs::Metadata) -> i64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mtime()
            .saturating_mul(1_000_000_000)
            .saturating_add(meta.mtime_nsec())
    }
    #[cfg(not(unix))]
    {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i64)
    }
}

fn mode_of(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        0o644
    }
}

fn entry_for(rel_path: String, meta: &fs::Metadata, abs: &Path) -> Result<FileEntry> {
    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Directory
    } else {
        FileKind::Regular
    };
    let symlink_target = if kind == FileKind::Symlink {
        Some(fs::read_link(abs)?.to_string_lossy().into_owned())
    } else {
        None
    };
    Ok(FileEntry {
        path: rel_path,
        kind,
        size: if kind == FileKind::Regular { meta.len() } else { 0 },
        mtime_ns: mtime_ns_of(meta),
        mode: mode_of(meta),
        symlink_target,
        whole_file_hash: None,
    })
}

/// Hash a whole file in streaming chunks (checksum mode).
pub fn hash_file(path: &Path) -> Result<u128> {
    use std::io::Read;
    let mut file = fs::File::open(path)?;
    let mut digest = FileDigest::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish())
}

/// Enumerate the source tree into a manifest.
///
/// Symlinks are recorded, never followed. Entries that cannot be read are
/// logged, counted in `unreadable`, and skipped rather than failing the
/// walk. A single-file source yields a one-entry manifest.
pub fn build_manifest(
    root: &Path,
    excludes: &GlobSet,
    recursive: bool,
    checksum_mode: bool,
) -> Result<(Vec<FileEntry>, u64)> {
    let mut entries = Vec::new();
    let mut unreadable = 0u64;

    let root_meta = fs::symlink_metadata(root)?;
    if root_meta.is_file() {
        let name = root
            .file_name()
            .ok_or_else(|| SyncError::Config(format!("source {} has no name", root.display())))?
            .to_string_lossy()
            .into_owned();
        let mut entry = entry_for(name, &root_meta, root)?;
        if checksum_mode {
            entry.whole_file_hash = Some(hash_file(root)?);
        }
        return Ok((vec![entry], 0));
    }

    let depth = if recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(depth)
        .follow_links(false)
        .sort_by_file_name();

    for item in walker {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                unreadable += 1;
                continue;
            }
        };
        let rel = item
            .path()
            .strip_prefix(root)
            .map_err(|_| SyncError::Config("walk escaped source root".to_string()))?;
        let rel_path = rel.to_string_lossy().replace('\\', "/");
        if excludes.is_match(&rel_path) {
            debug!("excluded {rel_path}");
            continue;
        }
        let meta = match fs::symlink_metadata(item.path()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("skipping {rel_path}: {e}");
                unreadable += 1;
                continue;
            }
        };
        let mut entry = match entry_for(rel_path, &meta, item.path()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping entry: {e}");
                unreadable += 1;
                continue;
            }
        };
        if checksum_mode && entry.kind == FileKind::Regular {
            match hash_file(item.path()) {
                Ok(hash) => entry.whole_file_hash = Some(hash),
                Err(e) => {
                    warn!("skipping {}: {e}", entry.path);
                    unreadable += 1;
                    continue;
                }
            }
        }
        entries.push(entry);
    }

    Ok((entries, unreadable))
}

/// Receiver-side classification options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyOptions {
    /// Compare whole-file hashes instead of size+mtime.
    pub checksum_mode: bool,
    /// Skip when the destination is newer than the source.
    pub update_only: bool,
}

/// Classify one regular-file manifest entry against the destination tree.
pub fn classify(entry: &FileEntry, dest_root: &Path, opts: ClassifyOptions) -> VerdictAction {
    debug_assert_eq!(entry.kind, FileKind::Regular);
    let dest = dest_root.join(&entry.path);
    let Ok(meta) = fs::symlink_metadata(&dest) else {
        return VerdictAction::Full;
    };
    if !meta.is_file() {
        return VerdictAction::Full;
    }

    if opts.update_only && mtime_ns_of(&meta) > entry.mtime_ns {
        return VerdictAction::Skip;
    }

    let unchanged = if opts.checksum_mode {
        match (entry.whole_file_hash, hash_file(&dest)) {
            (Some(expected), Ok(actual)) => expected == actual,
            _ => false,
        }
    } else {
        meta.len() == entry.size && mtime_ns_of(&meta) == entry.mtime_ns
    };
    if unchanged {
        return VerdictAction::Skip;
    }

    // A basis smaller than one block has nothing the matcher could
    // reference.
    let block_size = block_size_for(entry.size);
    if entry.size == 0 || block_size == 0 || meta.len() < block_size {
        return VerdictAction::Full;
    }
    VerdictAction::Delta
}
