use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

/// Running byte counters of one socket. The protocol session increments
/// them on every read/write; samplers and the statistics sink only read.
#[derive(Debug, Default)]
pub struct IoStat {
    send: AtomicU64,
    recv: AtomicU64,
}

impl IoStat {
    pub fn add_send_bytes(&self, n: u64) {
        self.send.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_recv_bytes(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::SeqCst);
    }

    pub fn send_bytes(&self) -> u64 {
        self.send.load(Ordering::SeqCst)
    }

    pub fn recv_bytes(&self) -> u64 {
        self.recv.load(Ordering::SeqCst)
    }
}

/// One moving window: recomputes its rate every `interval`, holding the
/// last computed value in between.
#[derive(Debug)]
struct RateWindow {
    interval: Duration,
    last_at: Instant,
    last_bytes: u64,
    kbps: u32,
}

impl RateWindow {
    fn new_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_at: now,
            last_bytes: 0,
            kbps: 0,
        }
    }

    fn update(&mut self, now: Instant, total_bytes: u64) {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < self.interval {
            return;
        }
        let delta = total_bytes.saturating_sub(self.last_bytes);
        let ms = (elapsed.as_millis() as u64).max(1);
        self.kbps = (delta * 8 / ms) as u32;
        self.last_at = now;
        self.last_bytes = total_bytes;
    }

    fn reset(&mut self, now: Instant) {
        self.last_at = now;
        self.last_bytes = 0;
        self.kbps = 0;
    }
}

/// Moving-window rate sampler over a socket's byte counters: 1s, 30s and
/// 5m views for both directions, plus deltas for the statistics sink.
pub struct RateSampler {
    io: Arc<IoStat>,
    send_1s: RateWindow,
    send_30s: RateWindow,
    send_5m: RateWindow,
    recv_1s: RateWindow,
    recv_30s: RateWindow,
    recv_5m: RateWindow,
    delta_send_base: u64,
    delta_recv_base: u64,
}

impl RateSampler {
    pub fn new(io: Arc<IoStat>) -> Self {
        let now = Instant::now();
        Self {
            io,
            send_1s: RateWindow::new_at(Duration::from_secs(1), now),
            send_30s: RateWindow::new_at(Duration::from_secs(30), now),
            send_5m: RateWindow::new_at(Duration::from_secs(300), now),
            recv_1s: RateWindow::new_at(Duration::from_secs(1), now),
            recv_30s: RateWindow::new_at(Duration::from_secs(30), now),
            recv_5m: RateWindow::new_at(Duration::from_secs(300), now),
            delta_send_base: 0,
            delta_recv_base: 0,
        }
    }

    pub fn sample(&mut self) {
        self.sample_at(Instant::now());
    }

    fn sample_at(&mut self, now: Instant) {
        let send = self.io.send_bytes();
        let recv = self.io.recv_bytes();
        self.send_1s.update(now, send);
        self.send_30s.update(now, send);
        self.send_5m.update(now, send);
        self.recv_1s.update(now, recv);
        self.recv_30s.update(now, recv);
        self.recv_5m.update(now, recv);
    }

    pub fn get_send_kbps(&self) -> u32 {
        self.send_1s.kbps
    }

    pub fn get_send_kbps_30s(&self) -> u32 {
        self.send_30s.kbps
    }

    pub fn get_send_kbps_5m(&self) -> u32 {
        self.send_5m.kbps
    }

    pub fn get_recv_kbps(&self) -> u32 {
        self.recv_1s.kbps
    }

    pub fn get_recv_kbps_30s(&self) -> u32 {
        self.recv_30s.kbps
    }

    pub fn get_recv_kbps_5m(&self) -> u32 {
        self.recv_5m.kbps
    }

    pub fn get_send_bytes(&self) -> u64 {
        self.io.send_bytes()
    }

    pub fn get_recv_bytes(&self) -> u64 {
        self.io.recv_bytes()
    }

    /// Bytes sent since the last `resample()`.
    pub fn get_send_bytes_delta(&self) -> u64 {
        self.io.send_bytes().saturating_sub(self.delta_send_base)
    }

    pub fn get_recv_bytes_delta(&self) -> u64 {
        self.io.recv_bytes().saturating_sub(self.delta_recv_base)
    }

    /// Commit the current totals as the new delta baseline.
    pub fn resample(&mut self) {
        self.delta_send_base = self.io.send_bytes();
        self.delta_recv_base = self.io.recv_bytes();
    }

    /// Forget all windows and baselines.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.send_1s.reset(now);
        self.send_30s.reset(now);
        self.send_5m.reset(now);
        self.recv_1s.reset(now);
        self.recv_30s.reset(now);
        self.recv_5m.reset(now);
        self.delta_send_base = 0;
        self.delta_recv_base = 0;
    }

    /// Sample and emit one traffic report. `label` is only a log prefix.
    pub fn kbps_sample(&mut self, label: &str, age: Duration) {
        self.sample();
        info!(
            "{} time={}ms okbps={},{},{} ikbps={},{},{}",
            label,
            age.as_millis(),
            self.get_send_kbps(),
            self.get_send_kbps_30s(),
            self.get_send_kbps_5m(),
            self.get_recv_kbps(),
            self.get_recv_kbps_30s(),
            self.get_recv_kbps_5m(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_holds_rate_between_refreshes() {
        let start = Instant::now();
        let mut w = RateWindow::new_at(Duration::from_secs(1), start);

        // 1s later, 125_000 bytes seen: 1000 kbps.
        w.update(start + Duration::from_secs(1), 125_000);
        assert_eq!(w.kbps, 1000);

        // Half a window later nothing recomputes.
        w.update(start + Duration::from_millis(1500), 500_000);
        assert_eq!(w.kbps, 1000);

        // Next full window picks up the remaining delta.
        w.update(start + Duration::from_secs(2), 250_000);
        assert_eq!(w.kbps, 1000);
    }

    #[test]
    fn deltas_track_resample_baseline() {
        let io = Arc::new(IoStat::default());
        let mut sampler = RateSampler::new(io.clone());

        io.add_send_bytes(1000);
        io.add_recv_bytes(400);
        assert_eq!(sampler.get_send_bytes_delta(), 1000);
        assert_eq!(sampler.get_recv_bytes_delta(), 400);

        sampler.resample();
        assert_eq!(sampler.get_send_bytes_delta(), 0);

        io.add_send_bytes(50);
        assert_eq!(sampler.get_send_bytes_delta(), 50);
        assert_eq!(sampler.get_send_bytes(), 1050);
    }

    #[test]
    fn cleanup_zeroes_everything() {
        let io = Arc::new(IoStat::default());
        io.add_send_bytes(125_000);
        let mut sampler = RateSampler::new(io.clone());
        sampler.sample_at(Instant::now() + Duration::from_secs(2));
        assert!(sampler.get_send_kbps() > 0);

        sampler.cleanup();
        assert_eq!(sampler.get_send_kbps(), 0);
        assert_eq!(sampler.get_send_kbps_30s(), 0);
    }
}
