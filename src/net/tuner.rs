use std::io;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::SockRef;

/// Delivery-rate assumption when sizing the send buffer from the
/// merged-write window.
pub const MW_SNDBUF_KBPS: usize = 5_000;

/// Outcome of a send-buffer resize, for logging.
#[derive(Debug, Clone, Copy)]
pub struct MwBufferChange {
    pub prev: usize,
    pub requested: usize,
    pub now: usize,
}

/// Runtime TCP tuning for one connection's socket.
///
/// Holds only a borrowed-fd handle, so it can sit beside the protocol
/// session that owns the stream, and be driven from reload callbacks as
/// well as the delivery loop.
pub struct SocketTuner {
    io: Arc<dyn AsFd + Send + Sync>,
    nodelay: AtomicBool,
}

impl SocketTuner {
    pub fn new(io: Arc<dyn AsFd + Send + Sync>) -> Self {
        Self {
            io,
            nodelay: AtomicBool::new(false),
        }
    }

    fn with_sock<T>(&self, f: impl FnOnce(&SockRef<'_>) -> T) -> T {
        let fd = self.io.as_fd();
        let sock = SockRef::from(&fd);
        f(&sock)
    }

    /// Apply TCP_NODELAY when the desired value differs from the last
    /// applied one. Returns the previous OS value when a change happened.
    pub fn apply_tcp_nodelay(&self, enabled: bool) -> io::Result<Option<bool>> {
        if self.nodelay.load(Ordering::SeqCst) == enabled {
            return Ok(None);
        }
        let prev = self.with_sock(|s| {
            let prev = s.nodelay()?;
            s.set_nodelay(enabled)?;
            Ok::<_, io::Error>(prev)
        })?;
        self.nodelay.store(enabled, Ordering::SeqCst);
        Ok(Some(prev))
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.nodelay.load(Ordering::SeqCst)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.with_sock(|s| s.send_buffer_size())
    }

    /// Size SO_SNDBUF for a merged-write window of `mw_sleep_ms`:
    /// `window * rate / 8`, halved because the kernel doubles what it is
    /// given. A configured `fixed` size replaces the computed one.
    pub fn set_send_buffer_for_window(
        &self,
        mw_sleep_ms: i32,
        fixed: Option<usize>,
    ) -> io::Result<MwBufferChange> {
        let requested = match fixed {
            Some(size) => size / 2,
            None => mw_sleep_ms.max(0) as usize * MW_SNDBUF_KBPS / 8 / 2,
        };
        self.with_sock(|s| {
            let prev = s.send_buffer_size()?;
            s.set_send_buffer_size(requested)?;
            let now = s.send_buffer_size()?;
            Ok(MwBufferChange {
                prev,
                requested,
                now,
            })
        })
    }
}
