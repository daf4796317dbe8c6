// Server and per-vhost configuration, plus the reload fan-out.
//
// The store keeps the active snapshot; `apply()` swaps it in and diffs
// old vs new per vhost, broadcasting typed reload events. Sessions hold a
// broadcast receiver and mutate only their own atomic state in response:
// reload is a message, never a shared mutable map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Conventional catch-all vhost name from the RTMP world.
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub vhosts: HashMap<String, VhostConfig>,
    /// Which NIC the process reports as its own address; consumed at
    /// bootstrap when building the server identity.
    pub stats_network: usize,
    /// Fixed socket send buffer; when set it replaces the merged-write
    /// computed size.
    pub so_sndbuf_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VhostConfig {
    pub enabled: bool,
    /// Alternative names resolving to this vhost.
    pub aliases: Vec<String>,
    pub chunk_size: u32,
    pub gop_cache: bool,
    pub tcp_nodelay: bool,
    pub realtime_enabled: bool,
    pub mw_sleep_ms: i32,
    /// Minimal delivery interval in milliseconds; 0 disables pacing.
    pub send_min_interval: f64,
    /// Forward connect-args (incl. relay identity) to upstream servers.
    pub debug_upnode: bool,
    pub bw_check_enabled: bool,
    pub is_edge: bool,
    pub edge_token_traverse: bool,
    /// Origin servers as `host[:port]`.
    pub edge_origin: Vec<String>,
    pub publish_1stpkt_timeout: i32,
    pub publish_normal_timeout: i32,
    pub mr_enabled: bool,
    pub mr_sleep_ms: i32,
    pub refer: ReferConfig,
    pub http_hooks: HttpHooksConfig,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            aliases: Vec::new(),
            chunk_size: 60_000,
            gop_cache: true,
            tcp_nodelay: false,
            realtime_enabled: false,
            mw_sleep_ms: 350,
            send_min_interval: 0.0,
            debug_upnode: true,
            bw_check_enabled: false,
            is_edge: false,
            edge_token_traverse: false,
            edge_origin: Vec::new(),
            publish_1stpkt_timeout: 20_000,
            publish_normal_timeout: 5_000,
            mr_enabled: false,
            mr_sleep_ms: 350,
            refer: ReferConfig::default(),
            http_hooks: HttpHooksConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReferConfig {
    pub enabled: bool,
    /// Hostname suffixes allowed for any request.
    pub all: Vec<String>,
    pub play: Vec<String>,
    pub publish: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpHooksConfig {
    pub enabled: bool,
    pub on_connect: Vec<String>,
    pub on_close: Vec<String>,
    pub on_publish: Vec<String>,
    pub on_unpublish: Vec<String>,
    pub on_play: Vec<String>,
    pub on_stop: Vec<String>,
}

/// Typed reload signals, one per vhost scope that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// Vhost deleted or disabled; connected sessions should expire.
    VhostRemoved(String),
    /// Play-scope settings changed (`send_min_interval`).
    Play(String),
    TcpNodelay(String),
    Realtime(String),
    /// Publish timeouts changed.
    Publish(String),
}

impl ReloadEvent {
    pub fn vhost(&self) -> &str {
        match self {
            Self::VhostRemoved(v)
            | Self::Play(v)
            | Self::TcpNodelay(v)
            | Self::Realtime(v)
            | Self::Publish(v) => v,
        }
    }
}

pub struct ConfigStore {
    active: RwLock<Arc<ServerConfig>>,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl ConfigStore {
    pub fn new(config: ServerConfig) -> Self {
        let (reload_tx, _) = broadcast::channel(64);
        Self {
            active: RwLock::new(Arc::new(config)),
            reload_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.active.read().clone()
    }

    /// Register for reload events. Dropping the receiver unregisters.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    /// Resolve a connect-time vhost name to its canonical configured name:
    /// exact match first, then alias, then (optionally) the default vhost.
    pub fn resolve_vhost(&self, name: &str, try_default: bool) -> Option<String> {
        let snap = self.snapshot();
        if snap.vhosts.contains_key(name) {
            return Some(name.to_string());
        }
        for (canonical, vhost) in &snap.vhosts {
            if vhost.aliases.iter().any(|a| a == name) {
                return Some(canonical.clone());
            }
        }
        if try_default && snap.vhosts.contains_key(DEFAULT_VHOST) {
            return Some(DEFAULT_VHOST.to_string());
        }
        None
    }

    /// Vhost section by canonical name; defaults when unconfigured.
    pub fn vhost(&self, name: &str) -> VhostConfig {
        self.snapshot().vhosts.get(name).cloned().unwrap_or_default()
    }

    pub fn vhost_exists(&self, name: &str) -> bool {
        self.snapshot().vhosts.contains_key(name)
    }

    pub fn vhost_enabled(&self, name: &str) -> bool {
        self.snapshot()
            .vhosts
            .get(name)
            .map(|v| v.enabled)
            .unwrap_or(false)
    }

    pub fn so_sndbuf_size(&self) -> Option<usize> {
        self.snapshot().so_sndbuf_size
    }

    /// Swap in a new snapshot and broadcast what changed per vhost.
    pub fn apply(&self, next: ServerConfig) {
        let prev = {
            let mut guard = self.active.write();
            std::mem::replace(&mut *guard, Arc::new(next))
        };
        let snap = self.snapshot();

        for (name, old) in &prev.vhosts {
            match snap.vhosts.get(name) {
                None => {
                    self.emit(ReloadEvent::VhostRemoved(name.clone()));
                }
                Some(new) => {
                    if old.enabled && !new.enabled {
                        self.emit(ReloadEvent::VhostRemoved(name.clone()));
                        continue;
                    }
                    if old.send_min_interval != new.send_min_interval {
                        self.emit(ReloadEvent::Play(name.clone()));
                    }
                    if old.tcp_nodelay != new.tcp_nodelay {
                        self.emit(ReloadEvent::TcpNodelay(name.clone()));
                    }
                    if old.realtime_enabled != new.realtime_enabled {
                        self.emit(ReloadEvent::Realtime(name.clone()));
                    }
                    if old.publish_1stpkt_timeout != new.publish_1stpkt_timeout
                        || old.publish_normal_timeout != new.publish_normal_timeout
                    {
                        self.emit(ReloadEvent::Publish(name.clone()));
                    }
                }
            }
        }
    }

    fn emit(&self, event: ReloadEvent) {
        // No receivers is fine: nobody is connected to that vhost.
        let _ = self.reload_tx.send(event);
    }
}
