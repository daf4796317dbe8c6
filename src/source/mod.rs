// Seams to the shared live-stream layer.
//
// A Source is the per-(vhost, app, stream) aggregator: GOP cache,
// consumer fan-out, metadata store, edge forwarding. It outlives any one
// connection; the session only holds a shared handle obtained from the
// hub. Implementations are expected to be thread-safe; the session never
// holds a lock of its own across a suspension point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::protocol::{Request, SharedMessage};

/// Registry of live Sources, keyed by the request's stream url.
#[async_trait]
pub trait StreamHub: Send + Sync {
    async fn fetch_or_create(&self, req: &Request) -> Result<Arc<dyn Source>>;
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Identity of the currently active publish episode, for log
    /// correlation across consumers.
    fn source_id(&self) -> u64;

    /// Toggle GOP caching for new players.
    fn set_cache(&self, enabled: bool);

    /// Whether a new publisher may take this source right now.
    fn can_publish(&self, is_edge: bool) -> bool;

    async fn on_publish(&self) -> Result<()>;
    async fn on_unpublish(&self);

    async fn on_edge_start_publish(&self) -> Result<()>;
    async fn on_edge_proxy_unpublish(&self);
    /// Edge mode: forward a publisher message to the origin untouched.
    async fn on_edge_proxy_publish(&self, msg: SharedMessage) -> Result<()>;

    async fn on_audio(&self, msg: SharedMessage) -> Result<()>;
    async fn on_video(&self, msg: SharedMessage) -> Result<()>;
    async fn on_aggregate(&self, msg: SharedMessage) -> Result<()>;
    async fn on_meta_data(&self, msg: SharedMessage, metadata: &Value) -> Result<()>;

    async fn create_consumer(&self, req: &Request) -> Result<Arc<dyn Consumer>>;
}

/// Per-player queue and waiter attached to a Source.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Park until at least `min_msgs` are queued or `timeout` elapses.
    /// `wakeup()` (from dispose or the receive task) also unparks.
    async fn wait(&self, min_msgs: usize, timeout: Duration);

    /// Move up to `max_count` queued messages into `out`;
    /// `max_count == 0` means no limit.
    fn dump_packets(&self, out: &mut Vec<SharedMessage>, max_count: usize) -> Result<()>;

    fn on_play_client_pause(&self, is_pause: bool) -> Result<()>;

    /// Unpark a waiter immediately.
    fn wakeup(&self);
}
