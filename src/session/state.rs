use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::source::Consumer;

/// Default merged-write window when the vhost does not configure one.
pub const MW_SLEEP_DEFAULT_MS: i32 = 350;
/// Messages to collect before a non-realtime flush.
pub const MW_MIN_MSGS: usize = 8;

/// Driver state that other tasks may touch: reload callbacks store into
/// the atomics, `dispose()` can arrive from any task, and the sidecar
/// receive task observes the cancellation token. The loops read these at
/// loop-top, never mid-batch.
pub struct SessionState {
    disposed: AtomicBool,
    expired: AtomicBool,
    mw_sleep_ms: AtomicI32,
    mw_enabled: AtomicBool,
    realtime: AtomicBool,
    send_min_interval_bits: AtomicU64,
    publish_1stpkt_timeout_ms: AtomicI32,
    publish_normal_timeout_ms: AtomicI32,
    /// Canonical vhost once known; reload events filter against it.
    vhost: Mutex<String>,
    /// Revocable handle to the playing consumer so dispose can unblock a
    /// waiter. Registered at play-loop entry, revoked at exit.
    wakable: Mutex<Option<Weak<dyn Consumer>>>,
    cancel: CancellationToken,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            disposed: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            mw_sleep_ms: AtomicI32::new(MW_SLEEP_DEFAULT_MS),
            mw_enabled: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            send_min_interval_bits: AtomicU64::new(0f64.to_bits()),
            publish_1stpkt_timeout_ms: AtomicI32::new(20_000),
            publish_normal_timeout_ms: AtomicI32::new(5_000),
            vhost: Mutex::new(String::new()),
            wakable: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Idempotent teardown signal: no new waits, wake any parked player,
    /// cancel sidecar tasks. Never touches the file descriptor.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake();
        self.cancel.cancel();
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Soft disconnect (vhost removed/disabled): loops exit at their next
    /// top-of-loop check.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub fn mw_sleep_ms(&self) -> i32 {
        self.mw_sleep_ms.load(Ordering::SeqCst)
    }

    pub fn set_mw_sleep_ms(&self, ms: i32) {
        self.mw_sleep_ms.store(ms, Ordering::SeqCst);
    }

    pub fn mw_enabled(&self) -> bool {
        self.mw_enabled.load(Ordering::SeqCst)
    }

    pub fn set_mw_enabled(&self, enabled: bool) {
        self.mw_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn realtime(&self) -> bool {
        self.realtime.load(Ordering::SeqCst)
    }

    pub fn set_realtime(&self, enabled: bool) {
        self.realtime.store(enabled, Ordering::SeqCst);
    }

    pub fn send_min_interval(&self) -> f64 {
        f64::from_bits(self.send_min_interval_bits.load(Ordering::SeqCst))
    }

    pub fn set_send_min_interval(&self, ms: f64) {
        self.send_min_interval_bits
            .store(ms.to_bits(), Ordering::SeqCst);
    }

    pub fn publish_1stpkt_timeout_ms(&self) -> i32 {
        self.publish_1stpkt_timeout_ms.load(Ordering::SeqCst)
    }

    pub fn set_publish_1stpkt_timeout_ms(&self, ms: i32) {
        self.publish_1stpkt_timeout_ms.store(ms, Ordering::SeqCst);
    }

    pub fn publish_normal_timeout_ms(&self) -> i32 {
        self.publish_normal_timeout_ms.load(Ordering::SeqCst)
    }

    pub fn set_publish_normal_timeout_ms(&self, ms: i32) {
        self.publish_normal_timeout_ms.store(ms, Ordering::SeqCst);
    }

    pub fn vhost(&self) -> String {
        self.vhost.lock().clone()
    }

    pub fn set_vhost(&self, vhost: &str) {
        *self.vhost.lock() = vhost.to_string();
    }

    pub fn set_wakable(&self, consumer: &Arc<dyn Consumer>) {
        *self.wakable.lock() = Some(Arc::downgrade(consumer));
    }

    pub fn clear_wakable(&self) {
        *self.wakable.lock() = None;
    }

    pub fn wake(&self) {
        let wakable = self.wakable.lock().clone();
        if let Some(consumer) = wakable.and_then(|w| w.upgrade()) {
            consumer.wakeup();
        }
    }

    /// Child token for a sidecar task; cancelled by `dispose()`.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingConsumer {
        wakeups: AtomicUsize,
    }

    #[async_trait]
    impl Consumer for CountingConsumer {
        async fn wait(&self, _min_msgs: usize, _timeout: Duration) {}
        fn dump_packets(
            &self,
            _out: &mut Vec<crate::protocol::SharedMessage>,
            _max_count: usize,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        fn on_play_client_pause(&self, _is_pause: bool) -> crate::error::Result<()> {
            Ok(())
        }
        fn wakeup(&self) {
            self.wakeups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispose_is_idempotent_and_wakes_once() {
        let state = SessionState::new();
        let counting = Arc::new(CountingConsumer {
            wakeups: AtomicUsize::new(0),
        });
        let consumer: Arc<dyn Consumer> = counting.clone();
        state.set_wakable(&consumer);

        let token = state.child_token();
        state.dispose();
        state.dispose();

        assert!(state.is_disposed());
        assert!(token.is_cancelled());
        assert_eq!(counting.wakeups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wakable_does_not_keep_the_consumer_alive() {
        let state = SessionState::new();
        {
            let consumer: Arc<dyn Consumer> = Arc::new(CountingConsumer {
                wakeups: AtomicUsize::new(0),
            });
            state.set_wakable(&consumer);
        }
        // Consumer dropped: wake must be a no-op, not a panic.
        state.wake();
    }

    #[test]
    fn send_min_interval_roundtrips_through_bits() {
        let state = SessionState::new();
        assert_eq!(state.send_min_interval(), 0.0);
        state.set_send_min_interval(12.5);
        assert_eq!(state.send_min_interval(), 12.5);
    }
}
