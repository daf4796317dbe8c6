// Socket-level concerns owned by the session: byte accounting for rate
// sampling, and runtime tuning of TCP_NODELAY / SO_SNDBUF.

pub mod kbps;
pub mod tuner;

pub use kbps::{IoStat, RateSampler};
pub use tuner::{MwBufferChange, SocketTuner};
