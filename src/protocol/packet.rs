use serde_json::Value;

/// Command/data packets the session driver reacts to, decoded on demand
/// from a [`SharedMessage`](super::SharedMessage) by the codec.
///
/// The codec decodes many more packet shapes; everything the driver does
/// not dispatch on arrives as `Other` and is ignored.
#[derive(Debug, Clone)]
pub enum Packet {
    /// `closeStream`; jwplayer and friends send this as a soft pause.
    CloseStream,
    /// A generic RPC `call`. Zero transaction id means fire-and-forget.
    Call {
        transaction_id: f64,
        command_name: String,
    },
    /// Response to a `Call`; `None` fields encode AMF null.
    CallResponse {
        transaction_id: f64,
        command_object: Option<Value>,
        response: Option<Value>,
    },
    /// `pause` toggles from a playing client.
    Pause { is_pause: bool, time_ms: f64 },
    /// FMLE publish/unpublish control; mid-stream it means unpublish.
    FmleStart {
        transaction_id: f64,
        stream_name: String,
    },
    /// `@setDataFrame onMetaData` payload from a publisher.
    OnMetaData { metadata: Value },
    Other { command_name: String },
}
