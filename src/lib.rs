// weir-rtmp: the per-connection RTMP session driver of the weir
// live-streaming server.
//
// After the acceptor hands over a socket, a `SessionDriver` executes the
// full RTMP state machine (handshake -> connect -> identify -> play or
// publish), multiplexes the long-running stream against a shared live
// Source, and enforces latency, backpressure and edge/origin policy.
//
// The protocol codec, the Source/hub, statistics, webhooks, security and
// bandwidth-test engines live elsewhere in the server and are consumed
// through the traits defined in `protocol`, `source`, `hooks` and
// `telemetry`.

pub mod config;
pub mod edge;
pub mod error;
pub mod hooks;
pub mod net;
pub mod protocol;
pub mod refer;
pub mod session;
pub mod source;
pub mod telemetry;

pub use config::{ConfigStore, ReloadEvent, ServerConfig, VhostConfig};
pub use error::{Result, SessionError};
pub use protocol::{Request, SessionType};
pub use session::{SessionDeps, SessionDriver, SessionHandle};
