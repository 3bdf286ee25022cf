//! Delta-transfer engine
//!
//! The data plane of the synchronizer: deterministic block sizing, the
//! rolling weak checksum, the 128-bit strong hash, block signatures and
//! their match index, the streaming delta matcher, and the temp-file
//! reconstructor. Everything in here is synchronous and allocation-light;
//! the session layer owns all suspension points.

pub mod block;
pub mod delta;
pub mod reconstruct;
pub mod rolling;
pub mod signature;
pub mod strong;
