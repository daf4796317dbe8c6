use std::io;

use thiserror::Error;

/// Everything a session can terminate (or recover) with.
///
/// The system-control variants are not failures: the outer service loop
/// matches on them to extend timeouts and re-enter stream service, the
/// way a paused player or a republishing encoder expects.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rtmp handshake failed: {0}")]
    Handshake(String),
    #[error("rtmp connect failed: {0}")]
    Connect(String),
    #[error("identify client failed: {0}")]
    Identify(String),
    #[error("decode message failed: {0}")]
    Decode(String),
    #[error("send to peer failed: {0}")]
    Send(String),
    #[error("recv from peer failed: {0}")]
    Recv(String),
    #[error("socket io: {0}")]
    Io(#[from] io::Error),

    #[error("vhost {0} not found")]
    VhostNotFound(String),
    #[error("vhost {0} disabled")]
    VhostDisabled(String),
    #[error("tcUrl discovery incomplete: {0}")]
    BadTcUrl(String),

    #[error("referer denied for page url {0:?}")]
    RefererDenied(String),
    #[error("security policy denied {0}")]
    SecurityDenied(String),
    #[error("http hook {action} denied by {url}")]
    HookDenied { action: &'static str, url: String },
    #[error("bandwidth check denied")]
    BandwidthDenied,
    #[error("edge token traverse failed: {0}")]
    TokenTraverseFailed(String),

    #[error("control: republish")]
    Republish,
    #[error("control: rtmp close stream")]
    RtmpClose,
    #[error("control: invalid client type")]
    ClientInvalid,

    #[error("stream is busy publishing")]
    StreamBusy,

    #[error("socket timeout")]
    SocketTimeout,
    #[error("client gracefully closed")]
    GracefulClose,

    #[error("user disconnect")]
    UserDisconnect,
    #[error("play duration exceeded")]
    DurationExceeded,
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Control-flow signals the service loop absorbs instead of failing on.
    pub fn is_system_control(&self) -> bool {
        matches!(
            self,
            Self::Republish | Self::RtmpClose | Self::ClientInvalid
        )
    }

    /// A peer that went away without protocol violation. Never logged at
    /// error level.
    pub fn is_graceful_close(&self) -> bool {
        match self {
            Self::GracefulClose => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// True for exits that end a session without being anyone's fault:
    /// graceful close and idle-socket timeout.
    pub fn is_quiet_close(&self) -> bool {
        matches!(self, Self::SocketTimeout) || self.is_graceful_close()
    }
}
