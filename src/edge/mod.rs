// Edge-side outbound RTMP: the upstream client used for token traversal
// and fan-out, plus rtmp url plumbing.
//
// Reconnect is never automatic; the owner decides when a closed client
// gets dialed again.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{trace, warn};

use crate::config::{ConfigStore, DEFAULT_VHOST};
use crate::error::{Result, SessionError};
use crate::protocol::{
    ClientProtocol, ClientProtocolFactory, MessageKind, Packet, Request, SharedMessage,
    DEFAULT_RTMP_PORT, EDGE_TOKEN_TRAVERSE_TIMEOUT, RTMP_TIMEOUT,
};
use crate::telemetry::ServerIdentity;

/// TCP connect with a hard deadline.
pub async fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(SessionError::Io(e)),
        Err(_) => Err(SessionError::SocketTimeout),
    }
}

/// `host[:port]`, defaulting the port.
pub fn parse_hostport(hostport: &str, default_port: u16) -> (String, u16) {
    match hostport.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (hostport.to_string(), default_port),
        },
        None => (hostport.to_string(), default_port),
    }
}

fn split_param(segment: &str) -> (&str, &str) {
    match segment.split_once('?') {
        Some((name, param)) => (name, param),
        None => (segment, ""),
    }
}

fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Split an rtmp url into a connect request: schema, host/port, app,
/// stream, and the vhost either from a `vhost`/`domain` query param or
/// the host itself.
pub fn parse_rtmp_url(url: &str) -> Result<Request> {
    let (schema, rest) = match url.split_once("://") {
        Some((schema, rest)) => (schema, rest),
        None => ("rtmp", url),
    };
    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| SessionError::BadTcUrl(url.to_string()))?;
    if authority.is_empty() || path.is_empty() {
        return Err(SessionError::BadTcUrl(url.to_string()));
    }

    let (host, port) = parse_hostport(authority, DEFAULT_RTMP_PORT);
    let (app_part, stream_part) = match path.rsplit_once('/') {
        Some((app, stream)) => (app, stream),
        None => (path, ""),
    };
    let (app, param) = split_param(app_part);
    let (stream, _) = split_param(stream_part);

    let vhost = query_value(param, "vhost")
        .or_else(|| query_value(param, "domain"))
        .unwrap_or(&host)
        .to_string();

    let tc_url = if param.is_empty() {
        format!("{schema}://{authority}/{app}")
    } else {
        format!("{schema}://{authority}/{app}?{param}")
    };

    Ok(Request {
        tc_url,
        schema: schema.to_string(),
        host,
        vhost,
        port,
        app: app.to_string(),
        stream: stream.to_string(),
        param: param.to_string(),
        ..Default::default()
    })
}

/// `rtmp://vhost:port/app`, falling back to the host when the vhost is
/// the catch-all.
pub fn generate_tc_url(host: &str, vhost: &str, app: &str, port: u16) -> String {
    let name = if vhost.is_empty() || vhost == DEFAULT_VHOST {
        host
    } else {
        vhost
    };
    format!("rtmp://{name}:{port}/{app}")
}

/// Outbound RTMP session: TCP transport plus a client-role protocol
/// session, dialed per attempt and closed on success or failure.
pub struct UpstreamRtmpClient {
    factory: Arc<dyn ClientProtocolFactory>,
    identity: Arc<ServerIdentity>,
    config: Arc<ConfigStore>,
    session_id: u64,
    req: Option<Request>,
    protocol: Option<Box<dyn ClientProtocol>>,
    stream_id: u32,
}

impl UpstreamRtmpClient {
    pub fn new(
        factory: Arc<dyn ClientProtocolFactory>,
        identity: Arc<ServerIdentity>,
        config: Arc<ConfigStore>,
        session_id: u64,
    ) -> Self {
        Self {
            factory,
            identity,
            config,
            session_id,
            req: None,
            protocol: None,
            stream_id: 0,
        }
    }

    pub fn connected(&self) -> bool {
        self.protocol.is_some()
    }

    pub fn sid(&self) -> u32 {
        self.stream_id
    }

    /// Dial, handshake, connect and create a stream. A connected client
    /// ignores further calls.
    pub async fn connect(
        &mut self,
        url: &str,
        connect_timeout: Duration,
        stream_timeout: Duration,
    ) -> Result<()> {
        if self.connected() {
            return Ok(());
        }

        let mut req = parse_rtmp_url(url)?;

        let transport = tcp_connect(&req.host, req.port, connect_timeout).await?;
        let protocol = self.factory.create(transport);
        protocol.set_recv_timeout(stream_timeout);
        protocol.set_send_timeout(stream_timeout);

        protocol.handshake().await.map_err(|e| {
            warn!("upstream handshake failed: {e}");
            e
        })?;

        self.apply_identity(&mut req);
        // The tcUrl sent upstream names the vhost, not the raw host.
        req.tc_url = generate_tc_url(&req.host, &req.vhost, &req.app, req.port);

        let debug_upnode = self.config.vhost(&req.vhost).debug_upnode;
        let (app, tc_url) = (req.app.clone(), req.tc_url.clone());
        protocol
            .connect_app(&app, &tc_url, &req, debug_upnode)
            .await
            .map_err(|e| {
                warn!(%tc_url, "upstream connect failed: {e}");
                e
            })?;

        self.stream_id = protocol.create_stream().await?;
        self.protocol = Some(protocol);
        self.req = Some(req);
        Ok(())
    }

    /// One token-traversal attempt against `host:port`: prove the origin
    /// accepts the player's connect parameters before the edge serves it.
    pub async fn token_traverse(&mut self, req: &Request, host: &str, port: u16) -> Result<()> {
        let transport = tcp_connect(host, port, EDGE_TOKEN_TRAVERSE_TIMEOUT).await?;
        let protocol = self.factory.create(transport);
        protocol.set_recv_timeout(RTMP_TIMEOUT);
        protocol.set_send_timeout(RTMP_TIMEOUT);

        protocol.handshake().await?;

        let mut upstream_req = req.clone();
        self.apply_identity(&mut upstream_req);
        // Traversal always forwards the args: they carry the token.
        protocol
            .connect_app(&req.app, &req.tc_url, &upstream_req, true)
            .await?;

        self.protocol = Some(protocol);
        Ok(())
    }

    /// Mark this connection as an edge relay so the origin can tell it
    /// apart from a player.
    fn apply_identity(&self, req: &mut Request) {
        let identity = &self.identity;
        req.set_arg_str("srs_sig", &identity.signature);
        req.set_arg_str("srs_server", &identity.server);
        req.set_arg_str("srs_version", &identity.version);
        req.set_arg_str("srs_server_ip", &identity.server_ip);
        req.set_arg_number("srs_pid", identity.pid as f64);
        req.set_arg_number("srs_id", self.session_id as f64);
    }

    fn active(&self) -> Result<&dyn ClientProtocol> {
        self.protocol
            .as_deref()
            .ok_or_else(|| SessionError::Connect("upstream client not connected".to_string()))
    }

    pub async fn publish(&self, stream: &str) -> Result<()> {
        self.active()?.publish(stream, self.stream_id).await
    }

    pub async fn play(&self, stream: &str) -> Result<()> {
        self.active()?.play(stream, self.stream_id).await
    }

    /// Stream name parsed out of the connect url, for the common case of
    /// publishing/playing exactly what was dialed.
    pub fn stream_name(&self) -> Option<&str> {
        self.req.as_ref().map(|r| r.stream.as_str())
    }

    pub async fn recv_message(&self) -> Result<SharedMessage> {
        self.active()?.recv_message().await
    }

    pub fn decode_message(&self, msg: &SharedMessage) -> Result<Packet> {
        self.active()?.decode_message(msg)
    }

    pub async fn send_and_free_message(&self, msg: SharedMessage) -> Result<()> {
        let stream_id = self.stream_id;
        self.active()?.send_and_free_message(msg, stream_id).await
    }

    pub async fn send_and_free_messages(&self, msgs: Vec<SharedMessage>) -> Result<()> {
        let stream_id = self.stream_id;
        self.active()?.send_and_free_messages(msgs, stream_id).await
    }

    /// Wrap a raw payload into a message bound to the upstream stream.
    pub fn rtmp_create_msg(
        &self,
        kind: MessageKind,
        timestamp: i64,
        payload: bytes::Bytes,
    ) -> SharedMessage {
        SharedMessage::new(kind, timestamp, self.stream_id, payload)
    }

    /// Release protocol, transport and request.
    pub fn close(&mut self) {
        self.protocol = None;
        self.req = None;
        self.stream_id = 0;
    }
}

/// Walk the configured origins; the first one that accepts the connect
/// parameters wins. Every failure falls through to the next origin, and
/// the last error surfaces when all refuse.
pub(crate) async fn token_traverse_auth(
    req: &Request,
    config: &Arc<ConfigStore>,
    factory: &Arc<dyn ClientProtocolFactory>,
    identity: &Arc<ServerIdentity>,
    session_id: u64,
) -> Result<()> {
    let origins = config.vhost(&req.vhost).edge_origin;
    if origins.is_empty() {
        return Err(SessionError::TokenTraverseFailed(format!(
            "no origin configured for vhost {}",
            req.vhost
        )));
    }

    let mut last_err = String::new();
    for hostport in &origins {
        let (host, port) = parse_hostport(hostport, DEFAULT_RTMP_PORT);

        let mut client =
            UpstreamRtmpClient::new(factory.clone(), identity.clone(), config.clone(), session_id);
        let attempt = client.token_traverse(req, &host, port).await;
        client.close();

        match attempt {
            Ok(()) => {
                trace!(tc_url = %req.tc_url, origin = %hostport, "edge token auth ok");
                return Ok(());
            }
            Err(e) => {
                warn!(origin = %hostport, "edge token traverse failed: {e}");
                last_err = e.to_string();
            }
        }
    }

    Err(SessionError::TokenTraverseFailed(last_err))
}
