//! psync: delta-transfer directory synchronizer
//!
//! Makes a destination tree byte-identical to a source tree while moving
//! as few bytes as possible: unchanged files are skipped outright, and
//! changed files are patched from the receiver's existing blocks using a
//! rolling-hash delta, with adaptive streaming compression layered over a
//! framed wire protocol.
//!
//! ## Architecture
//!
//! - [`engine`] — the data plane: block sizing, rolling and strong
//!   hashes, signatures, the delta matcher, and the file reconstructor
//! - [`protocol`] — framed wire format over pluggable byte-stream
//!   transports (pipes, a remote shell's stdio)
//! - [`session`] — the sender/receiver state machines with their reader
//!   and writer pump tasks
//! - [`compress`] — per-frame zstd with an adaptive level controller
//! - [`walk`] — source enumeration, excludes, and change classification
//!
//! ## Usage example
//!
//! ```rust,ignore
//! use psync::session::{sync_local, SessionConfig};
//!
//! #[compio::main]
//! async fn main() -> psync::Result<()> {
//!     let config = SessionConfig {
//!         recursive: true,
//!         compress: true,
//!         ..SessionConfig::default()
//!     };
//!     let stats = sync_local(config, "data".into(), "backup".into()).await?;
//!     println!("{} file(s) transferred", stats.files_transferred);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod compress;
pub mod engine;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod walk;

// Re-export commonly used types
pub use error::{Result, SyncError};
pub use session::{sync_local, SessionConfig};
pub use stats::TransferStats;
