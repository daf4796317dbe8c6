// End-to-end session scenarios against scripted collaborators: mock
// protocol, hub/source/consumer, hooks and policy seams. Real sockets
// are used only where a live fd matters (socket tuning, token traversal).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use weir_rtmp::config::{ConfigStore, HttpHooksConfig, ServerConfig, VhostConfig};
use weir_rtmp::error::{Result, SessionError};
use weir_rtmp::hooks::HttpHooks;
use weir_rtmp::net::{IoStat, SocketTuner};
use weir_rtmp::protocol::{
    ClientProtocol, ClientProtocolFactory, MessageKind, Packet, ProtocolSession, Request,
    SessionType, SharedMessage, StreamIdentity,
};
use weir_rtmp::session::{SessionDeps, SessionDriver};
use weir_rtmp::source::{Consumer, Source, StreamHub};
use weir_rtmp::telemetry::{
    BandwidthTester, EventBus, SecurityPolicy, ServerIdentity, Statistic,
};

// ---------------------------------------------------------------------------
// scripted protocol

#[derive(Clone)]
enum IdentifyStep {
    Identity(StreamIdentity),
    GracefulClose,
}

enum RecvStep {
    Msg(SharedMessage),
    Err(SessionError),
}

#[derive(Default)]
struct MockProtocol {
    /// Connect-time request fields pushed into the driver.
    connect_vhost: String,
    connect_app: String,
    connect_page_url: String,
    handshake_error: Mutex<Option<SessionError>>,
    identify_steps: Mutex<VecDeque<IdentifyStep>>,
    recv_steps: Mutex<VecDeque<RecvStep>>,
    calls: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<(String, Duration)>>,
    sent_batches: Mutex<Vec<Vec<SharedMessage>>>,
    sent_packets: Mutex<Vec<Packet>>,
    fmle_unpublish_txns: Mutex<Vec<f64>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl MockProtocol {
    fn new(vhost: &str) -> Self {
        Self {
            connect_vhost: vhost.to_string(),
            connect_app: "live".to_string(),
            connect_page_url: String::new(),
            ..Default::default()
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    fn called(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    fn push_identify(&self, step: IdentifyStep) {
        self.identify_steps.lock().push_back(step);
    }

    fn push_recv(&self, step: RecvStep) {
        self.recv_steps.lock().push_back(step);
    }

    fn timeout_count(&self, which: &str, value: Duration) -> usize {
        self.timeouts
            .lock()
            .iter()
            .filter(|(name, d)| name == which && *d == value)
            .count()
    }
}

fn command_msg(text: &str) -> SharedMessage {
    SharedMessage::new(
        MessageKind::Amf0Command,
        0,
        1,
        Bytes::copy_from_slice(text.as_bytes()),
    )
}

fn data_msg(text: &str) -> SharedMessage {
    SharedMessage::new(
        MessageKind::Amf0Data,
        0,
        1,
        Bytes::copy_from_slice(text.as_bytes()),
    )
}

fn media_msg(kind: MessageKind, timestamp: i64) -> SharedMessage {
    SharedMessage::new(kind, timestamp, 1, Bytes::from_static(b"\x17\x00"))
}

/// The mock codec reads the packet shape straight out of the payload.
fn decode_mock(msg: &SharedMessage) -> Result<Packet> {
    let text = String::from_utf8_lossy(&msg.payload);
    let mut parts = text.split(':');
    let packet = match parts.next().unwrap_or("") {
        "close" => Packet::CloseStream,
        "call" => Packet::Call {
            transaction_id: parts.next().unwrap_or("0").parse().unwrap_or(0.0),
            command_name: "call".to_string(),
        },
        "pause" => Packet::Pause {
            is_pause: parts.next() == Some("true"),
            time_ms: parts.next().unwrap_or("0").parse().unwrap_or(0.0),
        },
        "fmlestart" => Packet::FmleStart {
            transaction_id: parts.next().unwrap_or("0").parse().unwrap_or(0.0),
            stream_name: parts.next().unwrap_or("").to_string(),
        },
        "metadata" => Packet::OnMetaData {
            metadata: Value::Null,
        },
        other => Packet::Other {
            command_name: other.to_string(),
        },
    };
    Ok(packet)
}

#[async_trait]
impl ProtocolSession for MockProtocol {
    async fn handshake(&self) -> Result<()> {
        self.record("handshake");
        match self.handshake_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn connect_app(&self, req: &mut Request) -> Result<()> {
        self.record("connect_app");
        req.tc_url = format!("rtmp://127.0.0.1:1935/{}", self.connect_app);
        req.schema = "rtmp".to_string();
        req.host = "127.0.0.1".to_string();
        req.vhost = self.connect_vhost.clone();
        req.port = 1935;
        req.app = self.connect_app.clone();
        req.page_url = self.connect_page_url.clone();
        Ok(())
    }

    async fn identify_client(&self) -> Result<StreamIdentity> {
        self.record("identify_client");
        match self.identify_steps.lock().pop_front() {
            Some(IdentifyStep::Identity(identity)) => Ok(identity),
            Some(IdentifyStep::GracefulClose) | None => Err(SessionError::GracefulClose),
        }
    }

    async fn set_window_ack_size(&self, _ack_size: u32) -> Result<()> {
        self.record("set_window_ack_size");
        Ok(())
    }

    async fn set_peer_bandwidth(&self, _bandwidth: u32, _limit_type: u8) -> Result<()> {
        self.record("set_peer_bandwidth");
        Ok(())
    }

    async fn set_chunk_size(&self, _chunk_size: u32) -> Result<()> {
        self.record("set_chunk_size");
        Ok(())
    }

    async fn response_connect_app(&self, _req: &Request, _local_ip: &str) -> Result<()> {
        self.record("response_connect_app");
        Ok(())
    }

    async fn on_bw_done(&self) -> Result<()> {
        self.record("on_bw_done");
        Ok(())
    }

    async fn start_play(&self, _stream_id: u32) -> Result<()> {
        self.record("start_play");
        Ok(())
    }

    async fn start_fmle_publish(&self, _stream_id: u32) -> Result<()> {
        self.record("start_fmle_publish");
        Ok(())
    }

    async fn start_flash_publish(&self, _stream_id: u32) -> Result<()> {
        self.record("start_flash_publish");
        Ok(())
    }

    async fn fmle_unpublish(&self, _stream_id: u32, transaction_id: f64) -> Result<()> {
        self.record("fmle_unpublish");
        self.fmle_unpublish_txns.lock().push(transaction_id);
        Ok(())
    }

    async fn on_play_client_pause(&self, _stream_id: u32, is_pause: bool) -> Result<()> {
        self.record("on_play_client_pause");
        self.order
            .lock()
            .push(format!("protocol.pause:{is_pause}"));
        Ok(())
    }

    async fn send_and_free_messages(
        &self,
        msgs: Vec<SharedMessage>,
        _stream_id: u32,
    ) -> Result<()> {
        self.sent_batches.lock().push(msgs);
        Ok(())
    }

    async fn send_and_free_packet(&self, packet: Packet, _stream_id: u32) -> Result<()> {
        self.sent_packets.lock().push(packet);
        Ok(())
    }

    async fn recv_message(&self) -> Result<SharedMessage> {
        let step = self.recv_steps.lock().pop_front();
        match step {
            Some(RecvStep::Msg(msg)) => Ok(msg),
            Some(RecvStep::Err(e)) => Err(e),
            // Nothing more scripted: block until the task is cancelled.
            None => std::future::pending().await,
        }
    }

    fn decode_message(&self, msg: &SharedMessage) -> Result<Packet> {
        decode_mock(msg)
    }

    fn set_recv_timeout(&self, timeout: Duration) {
        self.timeouts.lock().push(("recv".to_string(), timeout));
    }

    fn set_send_timeout(&self, timeout: Duration) {
        self.timeouts.lock().push(("send".to_string(), timeout));
    }
}

// ---------------------------------------------------------------------------
// scripted source / consumer

struct MockConsumer {
    queue: Mutex<VecDeque<SharedMessage>>,
    notify: Notify,
    pause_calls: Mutex<Vec<bool>>,
    order: Arc<Mutex<Vec<String>>>,
}

impl MockConsumer {
    fn new(order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            pause_calls: Mutex::new(Vec::new()),
            order,
        })
    }

    fn push_msgs(&self, msgs: impl IntoIterator<Item = SharedMessage>) {
        let mut queue = self.queue.lock();
        for msg in msgs {
            queue.push_back(msg);
        }
        drop(queue);
        self.notify.notify_one();
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    async fn wait(&self, min_msgs: usize, timeout: Duration) {
        let threshold = min_msgs.max(1);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queue.lock().len() >= threshold {
                return;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return;
            }
        }
    }

    fn dump_packets(&self, out: &mut Vec<SharedMessage>, max_count: usize) -> Result<()> {
        let mut queue = self.queue.lock();
        while let Some(msg) = queue.pop_front() {
            out.push(msg);
            if max_count > 0 && out.len() >= max_count {
                break;
            }
        }
        Ok(())
    }

    fn on_play_client_pause(&self, is_pause: bool) -> Result<()> {
        self.pause_calls.lock().push(is_pause);
        self.order
            .lock()
            .push(format!("consumer.pause:{is_pause}"));
        Ok(())
    }

    fn wakeup(&self) {
        self.notify.notify_one();
    }
}

struct MockSource {
    consumer: Arc<MockConsumer>,
    can_publish: AtomicBool,
    publish_calls: AtomicUsize,
    unpublish_calls: AtomicUsize,
    edge_unpublish_calls: AtomicUsize,
    audio: AtomicUsize,
    video: AtomicUsize,
    metadata: AtomicUsize,
    cache: Mutex<Option<bool>>,
}

impl MockSource {
    fn new(consumer: Arc<MockConsumer>) -> Arc<Self> {
        Arc::new(Self {
            consumer,
            can_publish: AtomicBool::new(true),
            publish_calls: AtomicUsize::new(0),
            unpublish_calls: AtomicUsize::new(0),
            edge_unpublish_calls: AtomicUsize::new(0),
            audio: AtomicUsize::new(0),
            video: AtomicUsize::new(0),
            metadata: AtomicUsize::new(0),
            cache: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Source for MockSource {
    fn source_id(&self) -> u64 {
        7
    }

    fn set_cache(&self, enabled: bool) {
        *self.cache.lock() = Some(enabled);
    }

    fn can_publish(&self, _is_edge: bool) -> bool {
        self.can_publish.load(Ordering::SeqCst)
    }

    async fn on_publish(&self) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_unpublish(&self) {
        self.unpublish_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_edge_start_publish(&self) -> Result<()> {
        Ok(())
    }

    async fn on_edge_proxy_unpublish(&self) {
        self.edge_unpublish_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_edge_proxy_publish(&self, _msg: SharedMessage) -> Result<()> {
        Ok(())
    }

    async fn on_audio(&self, _msg: SharedMessage) -> Result<()> {
        self.audio.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_video(&self, _msg: SharedMessage) -> Result<()> {
        self.video.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_aggregate(&self, _msg: SharedMessage) -> Result<()> {
        Ok(())
    }

    async fn on_meta_data(&self, _msg: SharedMessage, _metadata: &Value) -> Result<()> {
        self.metadata.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_consumer(&self, _req: &Request) -> Result<Arc<dyn Consumer>> {
        Ok(self.consumer.clone())
    }
}

struct MockHub {
    source: Arc<MockSource>,
}

#[async_trait]
impl StreamHub for MockHub {
    async fn fetch_or_create(&self, _req: &Request) -> Result<Arc<dyn Source>> {
        Ok(self.source.clone())
    }
}

// ---------------------------------------------------------------------------
// policy / telemetry mocks

#[derive(Default)]
struct MockHooks {
    fired: Mutex<Vec<String>>,
}

impl MockHooks {
    fn fired(&self, action: &str) -> usize {
        self.fired
            .lock()
            .iter()
            .filter(|a| a.as_str() == action)
            .count()
    }
}

#[async_trait]
impl HttpHooks for MockHooks {
    async fn on_connect(&self, _url: &str, _session_id: u64, _req: &Request) -> Result<()> {
        self.fired.lock().push("on_connect".to_string());
        Ok(())
    }

    async fn on_close(
        &self,
        _url: &str,
        _session_id: u64,
        _req: &Request,
        _send_bytes: u64,
        _recv_bytes: u64,
    ) {
        self.fired.lock().push("on_close".to_string());
    }

    async fn on_publish(&self, _url: &str, _session_id: u64, _req: &Request) -> Result<()> {
        self.fired.lock().push("on_publish".to_string());
        Ok(())
    }

    async fn on_unpublish(&self, _url: &str, _session_id: u64, _req: &Request) {
        self.fired.lock().push("on_unpublish".to_string());
    }

    async fn on_play(&self, _url: &str, _session_id: u64, _req: &Request) -> Result<()> {
        self.fired.lock().push("on_play".to_string());
        Ok(())
    }

    async fn on_stop(&self, _url: &str, _session_id: u64, _req: &Request) {
        self.fired.lock().push("on_stop".to_string());
    }
}

#[derive(Default)]
struct MockEvents {
    clients: AtomicUsize,
    closes: AtomicUsize,
}

#[async_trait]
impl EventBus for MockEvents {
    async fn on_client(&self, _session_id: u64, _ip: &str) -> Result<()> {
        self.clients.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_close(&self, _session_id: u64) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockStatistic {
    clients: AtomicUsize,
    disconnects: AtomicUsize,
}

impl Statistic for MockStatistic {
    fn on_client(
        &self,
        _session_id: u64,
        _req: &Request,
        _session_type: SessionType,
    ) -> Result<()> {
        self.clients.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_disconnect(&self, _session_id: u64) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn kbps_add_delta(&self, _session_id: u64, _send_delta: u64, _recv_delta: u64) {}
}

struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn check(&self, _session_type: SessionType, _ip: &str, _req: &Request) -> Result<()> {
        Ok(())
    }
}

struct NoBandwidth;

#[async_trait]
impl BandwidthTester for NoBandwidth {
    async fn bandwidth_check(
        &self,
        _protocol: &dyn ProtocolSession,
        _req: &Request,
        _local_ip: &str,
    ) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// upstream client mocks (token traversal)

#[derive(Default)]
struct MockClientProtocol {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ClientProtocol for MockClientProtocol {
    async fn handshake(&self) -> Result<()> {
        self.calls.lock().push("handshake".to_string());
        Ok(())
    }

    async fn connect_app(
        &self,
        app: &str,
        _tc_url: &str,
        req: &Request,
        debug_upnode: bool,
    ) -> Result<()> {
        let has_identity = req.arg_number("srs_pid").is_some();
        self.calls
            .lock()
            .push(format!("connect_app:{app}:{debug_upnode}:{has_identity}"));
        Ok(())
    }

    async fn create_stream(&self) -> Result<u32> {
        self.calls.lock().push("create_stream".to_string());
        Ok(1)
    }

    async fn publish(&self, _stream: &str, _stream_id: u32) -> Result<()> {
        Ok(())
    }

    async fn play(&self, _stream: &str, _stream_id: u32) -> Result<()> {
        Ok(())
    }

    async fn recv_message(&self) -> Result<SharedMessage> {
        std::future::pending().await
    }

    fn decode_message(&self, msg: &SharedMessage) -> Result<Packet> {
        decode_mock(msg)
    }

    async fn send_and_free_message(&self, _msg: SharedMessage, _stream_id: u32) -> Result<()> {
        Ok(())
    }

    async fn send_and_free_messages(
        &self,
        _msgs: Vec<SharedMessage>,
        _stream_id: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn set_recv_timeout(&self, _timeout: Duration) {}

    fn set_send_timeout(&self, _timeout: Duration) {}
}

struct MockClientFactory {
    created: AtomicUsize,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockClientFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

impl ClientProtocolFactory for MockClientFactory {
    fn create(&self, _transport: tokio::net::TcpStream) -> Box<dyn ClientProtocol> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockClientProtocol {
            calls: self.calls.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// harness

struct Harness {
    driver: SessionDriver,
    config: Arc<ConfigStore>,
    protocol: Arc<MockProtocol>,
    source: Arc<MockSource>,
    consumer: Arc<MockConsumer>,
    hooks: Arc<MockHooks>,
    events: Arc<MockEvents>,
    statistic: Arc<MockStatistic>,
    factory: Arc<MockClientFactory>,
    order: Arc<Mutex<Vec<String>>>,
    // Keeps the tuning fd alive for the whole session.
    _sockets: (std::net::TcpStream, std::net::TcpStream),
}

fn tuning_sockets() -> (Arc<SocketTuner>, (std::net::TcpStream, std::net::TcpStream)) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    let tuner = Arc::new(SocketTuner::new(Arc::new(
        client.try_clone().expect("clone tuning socket"),
    )));
    (tuner, (client, server))
}

fn harness_with(vhost_name: &str, vhost: VhostConfig, protocol: MockProtocol) -> Harness {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut protocol = protocol;
    protocol.order = order.clone();
    let protocol = Arc::new(protocol);

    let consumer = MockConsumer::new(order.clone());
    let source = MockSource::new(consumer.clone());
    let hooks = Arc::new(MockHooks::default());
    let events = Arc::new(MockEvents::default());
    let statistic = Arc::new(MockStatistic::default());
    let factory = MockClientFactory::new();

    let mut config = ServerConfig::default();
    config.vhosts.insert(vhost_name.to_string(), vhost);
    let config = Arc::new(ConfigStore::new(config));

    let deps = SessionDeps {
        config: config.clone(),
        hub: Arc::new(MockHub {
            source: source.clone(),
        }),
        hooks: hooks.clone(),
        security: Arc::new(AllowAll),
        bandwidth: Arc::new(NoBandwidth),
        statistic: statistic.clone(),
        events: events.clone(),
        client_factory: factory.clone(),
        identity: Arc::new(ServerIdentity::default()),
    };

    let (tuner, sockets) = tuning_sockets();
    let driver = SessionDriver::new(
        100,
        "192.0.2.10".to_string(),
        "127.0.0.1".to_string(),
        protocol.clone(),
        tuner,
        Arc::new(IoStat::default()),
        deps,
    );

    Harness {
        driver,
        config,
        protocol,
        source,
        consumer,
        hooks,
        events,
        statistic,
        factory,
        order,
        _sockets: sockets,
    }
}

fn hooked_vhost() -> VhostConfig {
    VhostConfig {
        http_hooks: HttpHooksConfig {
            enabled: true,
            on_connect: vec!["http://127.0.0.1:1985/api/v1/connect".to_string()],
            on_close: vec!["http://127.0.0.1:1985/api/v1/close".to_string()],
            on_publish: vec!["http://127.0.0.1:1985/api/v1/publish".to_string()],
            on_unpublish: vec!["http://127.0.0.1:1985/api/v1/unpublish".to_string()],
            on_play: vec!["http://127.0.0.1:1985/api/v1/play".to_string()],
            on_stop: vec!["http://127.0.0.1:1985/api/v1/stop".to_string()],
        },
        ..Default::default()
    }
}

fn play_identity(stream: &str, duration_secs: f64) -> IdentifyStep {
    IdentifyStep::Identity(StreamIdentity {
        stream_id: 1,
        session_type: SessionType::Play,
        stream_name: stream.to_string(),
        duration_secs,
    })
}

fn fmle_identity(stream: &str) -> IdentifyStep {
    IdentifyStep::Identity(StreamIdentity {
        stream_id: 1,
        session_type: SessionType::PublishFmle,
        stream_name: stream.to_string(),
        duration_secs: 0.0,
    })
}

// ---------------------------------------------------------------------------
// scenarios

#[tokio::test]
async fn s1_handshake_failure_fires_no_webhook() {
    let protocol = MockProtocol::new("live");
    *protocol.handshake_error.lock() =
        Some(SessionError::Handshake("invalid c0c1".to_string()));

    let mut h = harness_with("live", hooked_vhost(), protocol);
    let ret = h.driver.run().await;

    assert!(matches!(ret, Err(SessionError::Handshake(_))));
    assert!(h.hooks.fired.lock().is_empty());
    assert_eq!(h.events.closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.statistic.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn s2_duration_bounded_play_stops_midway() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 2.0));

    let vhost = VhostConfig {
        // One message per delivery iteration.
        send_min_interval: 1.0,
        http_hooks: hooked_vhost().http_hooks,
        ..Default::default()
    };
    let mut h = harness_with("live", vhost, protocol);

    // 100 messages, 40ms apart.
    h.consumer
        .push_msgs((0..100).map(|i| media_msg(MessageKind::Video, i * 40)));

    let ret = h.driver.run().await;
    assert!(matches!(ret, Err(SessionError::DurationExceeded)));

    let batches = h.protocol.sent_batches.lock();
    // Pacing caps every batch at one message; the duration check fires
    // right after the 2000ms mark crosses.
    assert!(batches.iter().all(|b| b.len() <= 1));
    assert_eq!(batches.len(), 51);

    assert_eq!(h.hooks.fired("on_play"), 1);
    assert_eq!(h.hooks.fired("on_stop"), 1);
}

#[tokio::test]
async fn duration_accumulates_exactly_last_minus_first() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.9));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    // Single batch: ts 0..=900 step 100 -> elapsed exactly 900ms.
    h.consumer
        .push_msgs((0..10).map(|i| media_msg(MessageKind::Video, i * 100)));

    let ret = h.driver.run().await;
    assert!(matches!(ret, Err(SessionError::DurationExceeded)));

    let batches = h.protocol.sent_batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 10);
}

#[tokio::test(start_paused = true)]
async fn s3_publish_busy_never_releases() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(fmle_identity("x"));

    let mut h = harness_with("live", hooked_vhost(), protocol);
    h.source.can_publish.store(false, Ordering::SeqCst);

    let ret = h.driver.run().await;
    assert!(matches!(ret, Err(SessionError::StreamBusy)));

    assert_eq!(h.source.publish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.source.unpublish_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.source.edge_unpublish_calls.load(Ordering::SeqCst), 0);
    // The busy rejection still reports publish start/stop to the hooks.
    assert_eq!(h.hooks.fired("on_publish"), 1);
    assert_eq!(h.hooks.fired("on_unpublish"), 1);
}

#[tokio::test]
async fn s4_fmle_republish_extends_timeouts_and_reenters() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(fmle_identity("x"));
    protocol.push_recv(RecvStep::Msg(command_msg("fmlestart:5:x")));
    protocol.push_identify(IdentifyStep::GracefulClose);

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let ret = h.driver.run().await;
    // Second identify observes the peer closing: a clean exit.
    assert!(ret.is_ok());

    assert_eq!(h.protocol.fmle_unpublish_txns.lock().as_slice(), &[5.0]);
    assert_eq!(h.protocol.called("identify_client"), 2);
    assert_eq!(
        h.protocol
            .timeout_count("send", Duration::from_secs(180)),
        1
    );
    assert_eq!(
        h.protocol
            .timeout_count("recv", Duration::from_secs(180)),
        1
    );

    // Acquired once, released exactly once.
    assert_eq!(h.source.publish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.unpublish_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rtmp_close_from_player_extends_to_paused_timeouts() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));
    protocol.push_recv(RecvStep::Msg(command_msg("close")));
    protocol.push_identify(IdentifyStep::GracefulClose);

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let ret = h.driver.run().await;
    assert!(ret.is_ok());

    assert_eq!(
        h.protocol
            .timeout_count("recv", Duration::from_secs(1800)),
        1
    );
    assert_eq!(
        h.protocol
            .timeout_count("send", Duration::from_secs(1800)),
        1
    );
}

#[tokio::test]
async fn s5_pause_reaches_protocol_then_consumer() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));
    protocol.push_recv(RecvStep::Msg(command_msg("pause:true:1000")));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let handle = h.driver.handle();

    let consumer = h.consumer.clone();
    let order = h.order.clone();
    let watcher = tokio::spawn(async move {
        for _ in 0..200 {
            if !consumer.pause_calls.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.dispose();
        order
    });

    let ret = h.driver.run().await;
    assert!(ret.is_ok());

    let order = watcher.await.unwrap();
    let order = order.lock();
    assert_eq!(
        order.as_slice(),
        &["protocol.pause:true".to_string(), "consumer.pause:true".to_string()]
    );
    assert_eq!(h.consumer.pause_calls.lock().as_slice(), &[true]);
    assert_eq!(h.protocol.called("on_play_client_pause"), 1);
}

#[tokio::test]
async fn s6_edge_traversal_falls_back_to_second_origin() {
    // Origin a: a port nothing listens on. Origin b: a live listener.
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    let alive = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let alive_addr = alive.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            if alive.accept().await.is_err() {
                break;
            }
        }
    });

    let protocol = MockProtocol::new("live");
    protocol.push_identify(IdentifyStep::GracefulClose);

    let vhost = VhostConfig {
        is_edge: true,
        edge_token_traverse: true,
        edge_origin: vec![dead_addr.to_string(), alive_addr.to_string()],
        ..Default::default()
    };
    let mut h = harness_with("live", vhost, protocol);

    let ret = h.driver.run().await;
    assert!(ret.is_ok());

    // Only the live origin got a protocol session, and the traversal
    // carried the relay identity with args forced on.
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    let calls = h.factory.calls.lock();
    assert_eq!(
        calls.as_slice(),
        &[
            "handshake".to_string(),
            "connect_app:live:true:true".to_string()
        ]
    );
    drop(calls);

    // Traversal done, normal service continued.
    assert_eq!(h.protocol.called("response_connect_app"), 1);
    assert_eq!(h.protocol.called("on_bw_done"), 1);
}

#[tokio::test]
async fn all_origins_refusing_fails_the_session() {
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let protocol = MockProtocol::new("live");
    let vhost = VhostConfig {
        is_edge: true,
        edge_token_traverse: true,
        edge_origin: vec![dead_addr.to_string()],
        ..Default::default()
    };
    let mut h = harness_with("live", vhost, protocol);

    let ret = h.driver.run().await;
    assert!(matches!(ret, Err(SessionError::TokenTraverseFailed(_))));
    // Service never started.
    assert_eq!(h.protocol.called("response_connect_app"), 0);
}

// ---------------------------------------------------------------------------
// invariants

#[tokio::test]
async fn dispose_unblocks_a_parked_play_loop() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let handle = h.driver.handle();

    let disposer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.dispose();
    });

    let started = std::time::Instant::now();
    let ret = h.driver.run().await;
    disposer.await.unwrap();

    assert!(ret.is_ok());
    // Must come back within roughly one merged-write window of the
    // dispose, not a protocol timeout.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn vhost_removed_reload_expires_the_play_session() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let config = h.config.clone();

    let reloader = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        config.apply(ServerConfig::default());
    });

    let ret = h.driver.run().await;
    reloader.await.unwrap();

    assert!(matches!(ret, Err(SessionError::UserDisconnect)));
}

#[tokio::test(start_paused = true)]
async fn publish_timeouts_initialize_from_first_packet_key() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(fmle_identity("x"));
    protocol.push_recv(RecvStep::Msg(media_msg(MessageKind::Video, 0)));
    protocol.push_recv(RecvStep::Msg(media_msg(MessageKind::Audio, 10)));
    protocol.push_recv(RecvStep::Msg(data_msg("metadata")));

    let vhost = VhostConfig {
        publish_1stpkt_timeout: 1234,
        publish_normal_timeout: 999,
        ..Default::default()
    };
    let mut h = harness_with("live", vhost, protocol);
    let handle = h.driver.handle();

    let ret = h.driver.run().await;
    // Packets arrive, then nothing within the window.
    assert!(matches!(ret, Err(SessionError::SocketTimeout)));

    // Both timeouts start from the first-packet key; only a reload of the
    // publish section reads the normal key.
    assert_eq!(handle.publish_timeouts_ms(), (1234, 1234));
    assert_eq!(h.source.video.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.audio.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.metadata.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.publish_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.unpublish_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn play_receive_error_terminates_the_session() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));
    protocol.push_recv(RecvStep::Err(SessionError::Recv("torn chunk".to_string())));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let ret = h.driver.run().await;

    assert!(matches!(ret, Err(SessionError::Recv(_))));
    // Teardown still ran in full.
    assert_eq!(h.statistic.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.events.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn flash_publisher_command_means_republish() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(IdentifyStep::Identity(StreamIdentity {
        stream_id: 1,
        session_type: SessionType::PublishFlash,
        stream_name: "x".to_string(),
        duration_secs: 0.0,
    }));
    protocol.push_recv(RecvStep::Msg(command_msg("call:9")));
    protocol.push_identify(IdentifyStep::GracefulClose);

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let ret = h.driver.run().await;
    assert!(ret.is_ok());

    // Any command republishes a flash session; no fmle unpublish response.
    assert_eq!(h.protocol.called("start_flash_publish"), 1);
    assert_eq!(h.protocol.called("fmle_unpublish"), 0);
    assert_eq!(h.protocol.called("identify_client"), 2);
}

#[tokio::test]
async fn play_call_gets_a_null_response() {
    let protocol = MockProtocol::new("live");
    protocol.push_identify(play_identity("x", 0.0));
    protocol.push_recv(RecvStep::Msg(command_msg("call:3")));
    protocol.push_recv(RecvStep::Msg(command_msg("call:0")));

    let mut h = harness_with("live", VhostConfig::default(), protocol);
    let handle = h.driver.handle();
    let protocol_probe = h.protocol.clone();
    tokio::spawn(async move {
        for _ in 0..200 {
            if !protocol_probe.sent_packets.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.dispose();
    });

    let ret = h.driver.run().await;
    assert!(ret.is_ok());

    let packets = h.protocol.sent_packets.lock();
    // Only the transaction-id 3 call is answered, with AMF nulls.
    assert_eq!(packets.len(), 1);
    match &packets[0] {
        Packet::CallResponse {
            transaction_id,
            command_object,
            response,
        } => {
            assert_eq!(*transaction_id, 3.0);
            assert!(command_object.is_none());
            assert!(response.is_none());
        }
        other => panic!("unexpected packet {other:?}"),
    }
}
