// Protocol-facing model and trait seams.
//
// The RTMP codec (handshake, chunking, AMF decode) lives in its own crate;
// the session driver talks to it exclusively through `ProtocolSession`
// (server role) and `ClientProtocol` (client role, used by the edge
// upstream client). Both are object-safe so tests can drive the driver
// with scripted mocks.

mod message;
mod packet;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;

use crate::error::Result;

pub use message::{MessageHeader, MessageKind, SharedMessage};
pub use packet::Packet;

/// Handshake and in-service protocol deadline.
pub const RTMP_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for an encoder to republish after an unpublish control.
pub const REPUBLISH_TIMEOUT: Duration = Duration::from_secs(180);
/// Wait while a player keeps the connection open but paused/closed.
pub const PAUSED_TIMEOUT: Duration = Duration::from_secs(1800);
/// Per-origin TCP deadline for edge token traversal.
pub const EDGE_TOKEN_TRAVERSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Linger before surfacing a busy-stream rejection, so rejected encoders
/// do not hot-reconnect.
pub const STREAM_BUSY_SLEEP: Duration = Duration::from_secs(3);

pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const WINDOW_ACK_SIZE: u32 = 2_500_000;
pub const PEER_BANDWIDTH: u32 = 2_500_000;
/// Peer-bandwidth limit type: 2 = dynamic.
pub const PEER_BANDWIDTH_DYNAMIC: u8 = 2;

/// What the client asked to be, decided once by `identify_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Play,
    PublishFmle,
    PublishFlash,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Play => "play",
            Self::PublishFmle => "fmle-publish",
            Self::PublishFlash => "flash-publish",
        };
        f.write_str(s)
    }
}

impl SessionType {
    pub fn is_publish(self) -> bool {
        matches!(self, Self::PublishFmle | Self::PublishFlash)
    }
}

/// Result of `identify_client`: the server-allocated stream id plus the
/// client's declared intent.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub stream_id: u32,
    pub session_type: SessionType,
    pub stream_name: String,
    /// Requested play duration in seconds, 0 = unbounded.
    pub duration_secs: f64,
}

/// The parsed intent of one connection, filled by `connect_app` and
/// finalized after identify. Only the session driver mutates it.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub tc_url: String,
    pub schema: String,
    pub host: String,
    /// Rewritten to the canonical name after alias resolution.
    pub vhost: String,
    pub port: u16,
    pub app: String,
    /// Stream name, known only after identify.
    pub stream: String,
    pub param: String,
    pub page_url: String,
    pub swf_url: String,
    /// Requested play duration in seconds, 0 = unbounded.
    pub duration_secs: f64,
    pub ip: String,
    /// Extra connect-args (string or number values), e.g. relay identity
    /// fields from an upstream edge.
    pub args: Option<BTreeMap<String, Value>>,
}

impl Request {
    /// `vhost/app/stream`, the form every log line uses.
    pub fn stream_url(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    /// Trim whitespace and control characters the encoder may have left
    /// in the names.
    pub fn strip(&mut self) {
        fn clean(s: &mut String) {
            let trimmed: String = s
                .chars()
                .filter(|c| !c.is_control())
                .collect::<String>()
                .trim()
                .to_string();
            *s = trimmed;
        }
        clean(&mut self.vhost);
        clean(&mut self.app);
        clean(&mut self.stream);
        clean(&mut self.param);
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.as_ref()?.get(key)?.as_str()
    }

    pub fn arg_number(&self, key: &str) -> Option<f64> {
        self.args.as_ref()?.get(key)?.as_f64()
    }

    pub fn set_arg_str(&mut self, key: &str, value: &str) {
        self.args
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), Value::from(value));
    }

    pub fn set_arg_number(&mut self, key: &str, value: f64) {
        self.args
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), Value::from(value));
    }
}

/// Server-role protocol session bound to one accepted socket.
///
/// Methods take `&self`: implementations partition the transport into a
/// read half and a write half internally, because during play/publish a
/// sidecar task reads while the driver writes.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    async fn handshake(&self) -> Result<()>;
    async fn connect_app(&self, req: &mut Request) -> Result<()>;
    async fn identify_client(&self) -> Result<StreamIdentity>;

    async fn set_window_ack_size(&self, ack_size: u32) -> Result<()>;
    async fn set_peer_bandwidth(&self, bandwidth: u32, limit_type: u8) -> Result<()>;
    async fn set_chunk_size(&self, chunk_size: u32) -> Result<()>;
    async fn response_connect_app(&self, req: &Request, local_ip: &str) -> Result<()>;
    async fn on_bw_done(&self) -> Result<()>;

    async fn start_play(&self, stream_id: u32) -> Result<()>;
    async fn start_fmle_publish(&self, stream_id: u32) -> Result<()>;
    async fn start_flash_publish(&self, stream_id: u32) -> Result<()>;
    async fn fmle_unpublish(&self, stream_id: u32, transaction_id: f64) -> Result<()>;
    async fn on_play_client_pause(&self, stream_id: u32, is_pause: bool) -> Result<()>;

    /// Send a batch; ownership of the messages transfers to the codec.
    async fn send_and_free_messages(&self, msgs: Vec<SharedMessage>, stream_id: u32)
        -> Result<()>;
    async fn send_and_free_packet(&self, packet: Packet, stream_id: u32) -> Result<()>;

    async fn recv_message(&self) -> Result<SharedMessage>;
    fn decode_message(&self, msg: &SharedMessage) -> Result<Packet>;

    fn set_recv_timeout(&self, timeout: Duration);
    fn set_send_timeout(&self, timeout: Duration);
}

/// Client-role protocol session, used for edge token traversal and
/// upstream fan-out.
#[async_trait]
pub trait ClientProtocol: Send + Sync {
    async fn handshake(&self) -> Result<()>;
    /// `connect` to vhost/app; when `debug_upnode` is set the request args
    /// (including relay identity) are forwarded so the origin can
    /// recognize who is calling.
    async fn connect_app(
        &self,
        app: &str,
        tc_url: &str,
        req: &Request,
        debug_upnode: bool,
    ) -> Result<()>;
    async fn create_stream(&self) -> Result<u32>;
    async fn publish(&self, stream: &str, stream_id: u32) -> Result<()>;
    async fn play(&self, stream: &str, stream_id: u32) -> Result<()>;

    async fn recv_message(&self) -> Result<SharedMessage>;
    fn decode_message(&self, msg: &SharedMessage) -> Result<Packet>;
    async fn send_and_free_message(&self, msg: SharedMessage, stream_id: u32) -> Result<()>;
    async fn send_and_free_messages(&self, msgs: Vec<SharedMessage>, stream_id: u32)
        -> Result<()>;

    fn set_recv_timeout(&self, timeout: Duration);
    fn set_send_timeout(&self, timeout: Duration);
}

/// Builds a client-role protocol session over a freshly connected
/// transport. Injected so the upstream client stays codec-agnostic.
pub trait ClientProtocolFactory: Send + Sync {
    fn create(&self, transport: TcpStream) -> Box<dyn ClientProtocol>;
}
