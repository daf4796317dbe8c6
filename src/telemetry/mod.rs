// Observability and policy seams, plus the identity this server presents
// when it dials an upstream origin.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ProtocolSession, Request, SessionType};

/// Cluster event bus (client accepted / client closed).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn on_client(&self, session_id: u64, ip: &str) -> Result<()>;
    async fn on_close(&self, session_id: u64);
}

/// Server-wide statistics registry.
pub trait Statistic: Send + Sync {
    fn on_client(&self, session_id: u64, req: &Request, session_type: SessionType)
        -> Result<()>;
    fn on_disconnect(&self, session_id: u64);
    fn kbps_add_delta(&self, session_id: u64, send_delta: u64, recv_delta: u64);
}

/// IP/stream-level access policy, consulted once the client is identified.
pub trait SecurityPolicy: Send + Sync {
    fn check(&self, session_type: SessionType, ip: &str, req: &Request) -> Result<()>;
}

/// Bandwidth-test engine; when a vhost is a bandwidth-check vhost the
/// whole service is delegated here.
#[async_trait]
pub trait BandwidthTester: Send + Sync {
    async fn bandwidth_check(
        &self,
        protocol: &dyn ProtocolSession,
        req: &Request,
        local_ip: &str,
    ) -> Result<()>;
}

/// Identity advertised to upstream origins so they can tell a relaying
/// server from a player.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub signature: String,
    pub server: String,
    pub version: String,
    pub server_ip: String,
    pub pid: u32,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            signature: "weir".to_string(),
            server: format!("weir/{}", env!("CARGO_PKG_VERSION")),
            version: env!("CARGO_PKG_VERSION").to_string(),
            server_ip: String::new(),
            pid: std::process::id(),
        }
    }
}

/// Throttle for periodic traffic reports in the delivery loops: fires at
/// most once per interval, tracks session age for the report line.
pub struct ReportTicker {
    started: Instant,
    last: Instant,
    interval: Duration,
}

/// How often the play/publish loops report traffic.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(10);

impl ReportTicker {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            interval,
        }
    }

    pub fn should_report(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}
