//! Wire protocol
//!
//! A framed, bidirectional protocol over any pair of reliable byte
//! streams. Each direction carries strictly ordered frames; per-file
//! phases never interleave. The frame grammar lives in [`frame`], typed
//! payload codecs in [`wire`], and the byte-stream abstraction with its
//! pipe and remote-shell implementations in [`transport`], [`pipe`], and
//! [`ssh`].

pub mod frame;
pub mod pipe;
pub mod ssh;
pub mod transport;
pub mod wire;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;
