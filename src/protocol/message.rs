use bytes::Bytes;

/// RTMP message classification as the chunk layer reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Audio,
    Video,
    Aggregate,
    Amf0Data,
    Amf3Data,
    Amf0Command,
    Amf3Command,
    Other,
}

impl MessageKind {
    pub fn is_audio(self) -> bool {
        self == Self::Audio
    }

    pub fn is_video(self) -> bool {
        self == Self::Video
    }

    pub fn is_aggregate(self) -> bool {
        self == Self::Aggregate
    }

    pub fn is_command(self) -> bool {
        matches!(self, Self::Amf0Command | Self::Amf3Command)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Self::Amf0Data | Self::Amf3Data)
    }
}

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub kind: MessageKind,
    /// Presentation timestamp in milliseconds.
    pub timestamp: i64,
    pub stream_id: u32,
}

/// One decoded-enough RTMP message. The payload stays opaque `Bytes` so a
/// fan-out to N consumers is N refcount bumps, never N copies.
#[derive(Debug, Clone)]
pub struct SharedMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl SharedMessage {
    pub fn new(kind: MessageKind, timestamp: i64, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: MessageHeader {
                kind,
                timestamp,
                stream_id,
            },
            payload,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
