// The per-connection session driver.
//
// One accepted socket, one driver task. The driver walks the RTMP state
// machine (handshake -> connect -> identify), then hands the connection
// to the play or publish loop; control results (republish, close) come
// back as explicit enum variants and the service loop extends timeouts
// and re-enters instead of failing.

mod play;
mod publish;
mod recv;
mod reload;
mod state;

pub use recv::{PlayReceiveTask, PublishReceiveTask};
pub use reload::ReloadSubscriber;
pub use state::{SessionState, MW_MIN_MSGS, MW_SLEEP_DEFAULT_MS};

use std::sync::Arc;

use tracing::{error, info, trace, warn};

use crate::config::ConfigStore;
use crate::edge;
use crate::error::{Result, SessionError};
use crate::hooks::HttpHooks;
use crate::net::{IoStat, RateSampler, SocketTuner};
use crate::protocol::{
    ClientProtocolFactory, ProtocolSession, Request, SessionType, PEER_BANDWIDTH,
    PEER_BANDWIDTH_DYNAMIC, REPUBLISH_TIMEOUT, PAUSED_TIMEOUT, RTMP_TIMEOUT, WINDOW_ACK_SIZE,
};
use crate::refer;
use crate::source::StreamHub;
use crate::telemetry::{BandwidthTester, EventBus, SecurityPolicy, ServerIdentity, Statistic};

/// Everything the driver talks to outside this crate, injected so tests
/// can substitute any of it.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<ConfigStore>,
    pub hub: Arc<dyn StreamHub>,
    pub hooks: Arc<dyn HttpHooks>,
    pub security: Arc<dyn SecurityPolicy>,
    pub bandwidth: Arc<dyn BandwidthTester>,
    pub statistic: Arc<dyn Statistic>,
    pub events: Arc<dyn EventBus>,
    pub client_factory: Arc<dyn ClientProtocolFactory>,
    pub identity: Arc<ServerIdentity>,
}

/// Cheap handle for signalling a running session from another task.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<SessionState>,
}

impl SessionHandle {
    /// Idempotent teardown: wakes any parked waiter and cancels sidecar
    /// tasks. Safe from any task; never closes the file descriptor.
    pub fn dispose(&self) {
        self.state.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    /// Current publish timeouts `(first_pkt_ms, normal_ms)`, for
    /// inspection and stats surfaces.
    pub fn publish_timeouts_ms(&self) -> (i32, i32) {
        (
            self.state.publish_1stpkt_timeout_ms(),
            self.state.publish_normal_timeout_ms(),
        )
    }
}

pub struct SessionDriver {
    session_id: u64,
    /// Peer address, recorded into the request after connect.
    ip: String,
    /// Address the client connected to; reported in connect responses.
    local_ip: String,
    protocol: Arc<dyn ProtocolSession>,
    tuner: Arc<SocketTuner>,
    io: Arc<IoStat>,
    kbps: RateSampler,
    deps: SessionDeps,
    state: Arc<SessionState>,
    request: Request,
    stream_id: u32,
    _reload: ReloadSubscriber,
}

impl SessionDriver {
    pub fn new(
        session_id: u64,
        ip: String,
        local_ip: String,
        protocol: Arc<dyn ProtocolSession>,
        tuner: Arc<SocketTuner>,
        io: Arc<IoStat>,
        deps: SessionDeps,
    ) -> Self {
        let state = Arc::new(SessionState::new());
        let reload = ReloadSubscriber::spawn(deps.config.clone(), state.clone(), tuner.clone());
        Self {
            session_id,
            ip,
            local_ip,
            protocol,
            tuner,
            kbps: RateSampler::new(io.clone()),
            io,
            deps,
            state,
            request: Request::default(),
            stream_id: 0,
            _reload: reload,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.clone(),
        }
    }

    pub fn dispose(&self) {
        self.state.dispose();
    }

    /// Drive the connection to completion. `Ok(())` only when the peer
    /// went away gracefully; every other exit keeps its reason.
    pub async fn run(&mut self) -> Result<()> {
        info!(ip = %self.ip, session_id = self.session_id, "rtmp client accepted");

        if let Err(e) = self.deps.events.on_client(self.session_id, &self.ip).await {
            error!("event bus rejected client: {e}");
            self.disconnect().await;
            return Err(e);
        }

        let ret = self.do_cycle().await;
        self.disconnect().await;

        match ret {
            Err(e) if e.is_graceful_close() => Ok(()),
            other => other,
        }
    }

    async fn do_cycle(&mut self) -> Result<()> {
        self.protocol.set_recv_timeout(RTMP_TIMEOUT);
        self.protocol.set_send_timeout(RTMP_TIMEOUT);

        self.protocol.handshake().await.map_err(|e| {
            if !e.is_graceful_close() {
                error!("rtmp handshake failed: {e}");
            }
            e
        })?;

        let mut request = std::mem::take(&mut self.request);
        let connected = self.protocol.connect_app(&mut request).await;
        self.request = request;
        connected.map_err(|e| {
            error!("rtmp connect vhost/app failed: {e}");
            e
        })?;
        self.request.ip = self.ip.clone();

        // First resolution only canonicalizes the name; enablement is
        // checked below so a disabled vhost still reports as disabled.
        if let Some(canonical) = self
            .deps
            .config
            .resolve_vhost(&self.request.vhost, true)
        {
            self.request.vhost = canonical;
        }

        if self.request.schema.is_empty()
            || self.request.vhost.is_empty()
            || self.request.app.is_empty()
            || self.request.port == 0
        {
            let detail = format!(
                "tcUrl={} schema={} vhost={} port={} app={}",
                self.request.tc_url,
                self.request.schema,
                self.request.vhost,
                self.request.port,
                self.request.app
            );
            error!("tcUrl discovery failed: {detail}");
            return Err(SessionError::BadTcUrl(detail));
        }

        self.check_vhost().await?;
        self.state.set_vhost(&self.request.vhost);

        info!(
            tc_url = %self.request.tc_url,
            page_url = %self.request.page_url,
            vhost = %self.request.vhost,
            app = %self.request.app,
            "connect app"
        );
        self.log_upnode_identity();

        self.service_cycle().await
    }

    /// A peer carrying relay identity args is another server, not a
    /// player; surface that in the logs.
    fn log_upnode_identity(&self) {
        let Some(pid) = self.request.arg_number("srs_pid") else {
            return;
        };
        info!(
            upnode_ip = self.request.arg_str("srs_server_ip").unwrap_or(""),
            upnode_version = self.request.arg_str("srs_version").unwrap_or(""),
            upnode_pid = pid,
            upnode_id = self.request.arg_number("srs_id").unwrap_or(0.0),
            "edge server connected"
        );
    }

    async fn check_vhost(&mut self) -> Result<()> {
        let Some(canonical) = self
            .deps
            .config
            .resolve_vhost(&self.request.vhost, true)
        else {
            error!(vhost = %self.request.vhost, "vhost not found");
            return Err(SessionError::VhostNotFound(self.request.vhost.clone()));
        };

        if !self.deps.config.vhost_enabled(&canonical) {
            error!(vhost = %canonical, "vhost disabled");
            return Err(SessionError::VhostDisabled(canonical));
        }

        if canonical != self.request.vhost {
            trace!(from = %self.request.vhost, to = %canonical, "vhost change");
            self.request.vhost = canonical;
        }

        let conf = self.deps.config.vhost(&self.request.vhost);
        if conf.refer.enabled {
            refer::check(&self.request.page_url, &conf.refer.all)?;
        }

        self.http_hooks_on_connect().await
    }

    async fn service_cycle(&mut self) -> Result<()> {
        self.protocol.set_window_ack_size(WINDOW_ACK_SIZE).await?;
        self.protocol
            .set_peer_bandwidth(PEER_BANDWIDTH, PEER_BANDWIDTH_DYNAMIC)
            .await?;

        let conf = self.deps.config.vhost(&self.request.vhost);

        // A bandwidth-check vhost never enters stream service.
        if conf.bw_check_enabled {
            return self
                .deps
                .bandwidth
                .bandwidth_check(&*self.protocol, &self.request, &self.local_ip)
                .await;
        }

        if conf.is_edge && conf.edge_token_traverse {
            if let Err(e) = edge::token_traverse_auth(
                &self.request,
                &self.deps.config,
                &self.deps.client_factory,
                &self.deps.identity,
                self.session_id,
            )
            .await
            {
                warn!("token auth failed: {e}");
                return Err(e);
            }
        }

        // Raise the chunk size before any response larger than 128 bytes.
        self.protocol.set_chunk_size(conf.chunk_size).await?;
        self.protocol
            .response_connect_app(&self.request, &self.local_ip)
            .await?;
        self.protocol.on_bw_done().await?;

        while !self.state.is_disposed() {
            let err = match self.stream_service_cycle().await {
                // Success means the caller asked to stop; keep serving.
                Ok(()) => continue,
                Err(e) => e,
            };

            if !err.is_system_control() {
                if !err.is_quiet_close() {
                    error!("stream service cycle failed: {err}");
                }
                return Err(err);
            }

            match err {
                SessionError::Republish => {
                    self.protocol.set_send_timeout(REPUBLISH_TIMEOUT);
                    self.protocol.set_recv_timeout(REPUBLISH_TIMEOUT);
                    trace!("control message(unpublish) accepted, retry stream service");
                }
                SessionError::RtmpClose => {
                    self.protocol.set_recv_timeout(PAUSED_TIMEOUT);
                    self.protocol.set_send_timeout(PAUSED_TIMEOUT);
                    trace!("control message(close) accepted, retry stream service");
                }
                other => {
                    error!("control message rejected: {other}");
                    return Err(other);
                }
            }
        }

        Ok(())
    }

    /// One publish or play episode; republish re-enters through the
    /// service loop above.
    async fn stream_service_cycle(&mut self) -> Result<()> {
        let identity = self.protocol.identify_client().await.map_err(|e| {
            if !e.is_graceful_close() {
                error!("identify client failed: {e}");
            }
            e
        })?;

        self.stream_id = identity.stream_id;
        self.request.stream = identity.stream_name;
        self.request.duration_secs = identity.duration_secs;
        self.request.strip();
        info!(
            session_type = %identity.session_type,
            stream = %self.request.stream,
            duration = self.request.duration_secs,
            "client identified"
        );

        self.deps
            .security
            .check(identity.session_type, &self.ip, &self.request)?;

        // Identified: back to service deadlines.
        self.protocol.set_recv_timeout(RTMP_TIMEOUT);
        self.protocol.set_send_timeout(RTMP_TIMEOUT);

        let source = self.deps.hub.fetch_or_create(&self.request).await?;

        self.deps
            .statistic
            .on_client(self.session_id, &self.request, identity.session_type)?;

        let conf = self.deps.config.vhost(&self.request.vhost);
        info!(
            url = %self.request.stream_url(),
            ip = %self.ip,
            cache = conf.gop_cache,
            is_edge = conf.is_edge,
            source_id = source.source_id(),
            "source ready"
        );
        source.set_cache(conf.gop_cache);

        match identity.session_type {
            SessionType::Play => {
                self.protocol.start_play(self.stream_id).await?;
                self.http_hooks_on_play().await?;
                let ret = self.playing(&source).await;
                self.http_hooks_on_stop().await;
                ret
            }
            SessionType::PublishFmle => {
                self.protocol.start_fmle_publish(self.stream_id).await?;
                self.publishing(&source, true).await
            }
            SessionType::PublishFlash => {
                self.protocol.start_flash_publish(self.stream_id).await?;
                self.publishing(&source, false).await
            }
        }
    }

    /// Teardown notifications; never shadows the primary error.
    async fn disconnect(&mut self) {
        self.http_hooks_on_close().await;
        self.deps.events.on_close(self.session_id).await;

        self.kbps.sample();
        self.deps.statistic.kbps_add_delta(
            self.session_id,
            self.kbps.get_send_bytes_delta(),
            self.kbps.get_recv_bytes_delta(),
        );
        self.kbps.resample();
        self.deps.statistic.on_disconnect(self.session_id);
    }

    pub(crate) fn set_sock_options(&self) {
        let nodelay = self.deps.config.vhost(&self.request.vhost).tcp_nodelay;
        match self.tuner.apply_tcp_nodelay(nodelay) {
            Ok(Some(prev)) => trace!("set TCP_NODELAY {prev}=>{nodelay}"),
            Ok(None) => {}
            Err(e) => warn!("set TCP_NODELAY={nodelay} failed: {e}"),
        }
    }

    /// Change the merged-write window: resize the socket send buffer to
    /// hold one window's worth of stream, then record the new window.
    pub(crate) fn change_mw_sleep(&self, sleep_ms: i32) {
        if !self.state.mw_enabled() {
            return;
        }
        let fixed = self.deps.config.so_sndbuf_size();
        match self.tuner.set_send_buffer_for_window(sleep_ms, fixed) {
            Ok(change) => trace!(
                "mw changed sleep {}=>{}ms, sbuf {}=>{} (requested {})",
                self.state.mw_sleep_ms(),
                sleep_ms,
                change.prev,
                change.now,
                change.requested
            ),
            Err(e) => warn!("set SO_SNDBUF for mw={sleep_ms}ms failed: {e}"),
        }
        self.state.set_mw_sleep_ms(sleep_ms);
    }

    // The url lists are cloned out of the snapshot before the first
    // await: a hook can yield and a reload can swap the config meanwhile.

    async fn http_hooks_on_connect(&self) -> Result<()> {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return Ok(());
        }
        for url in &hooks.on_connect {
            self.deps
                .hooks
                .on_connect(url, self.session_id, &self.request)
                .await
                .map_err(|e| {
                    error!(%url, "on_connect hook denied: {e}");
                    e
                })?;
        }
        Ok(())
    }

    async fn http_hooks_on_close(&self) {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return;
        }
        for url in &hooks.on_close {
            self.deps
                .hooks
                .on_close(
                    url,
                    self.session_id,
                    &self.request,
                    self.io.send_bytes(),
                    self.io.recv_bytes(),
                )
                .await;
        }
    }

    pub(crate) async fn http_hooks_on_publish(&self) -> Result<()> {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return Ok(());
        }
        for url in &hooks.on_publish {
            self.deps
                .hooks
                .on_publish(url, self.session_id, &self.request)
                .await
                .map_err(|e| {
                    error!(%url, "on_publish hook denied: {e}");
                    e
                })?;
        }
        Ok(())
    }

    pub(crate) async fn http_hooks_on_unpublish(&self) {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return;
        }
        for url in &hooks.on_unpublish {
            self.deps
                .hooks
                .on_unpublish(url, self.session_id, &self.request)
                .await;
        }
    }

    async fn http_hooks_on_play(&self) -> Result<()> {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return Ok(());
        }
        for url in &hooks.on_play {
            self.deps
                .hooks
                .on_play(url, self.session_id, &self.request)
                .await
                .map_err(|e| {
                    error!(%url, "on_play hook denied: {e}");
                    e
                })?;
        }
        Ok(())
    }

    async fn http_hooks_on_stop(&self) {
        let hooks = self.deps.config.vhost(&self.request.vhost).http_hooks;
        if !hooks.enabled {
            return;
        }
        for url in &hooks.on_stop {
            self.deps
                .hooks
                .on_stop(url, self.session_id, &self.request)
                .await;
        }
    }
}
