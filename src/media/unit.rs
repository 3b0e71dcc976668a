//! Core value types exchanged by the pipeline.

use bytes::Bytes;
use std::time::Duration;

/// Presentation/decode time for media units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since stream start
    pub micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    /// Create a timestamp from a duration since stream start
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Convert to duration; negative timestamps clamp to zero
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    pub fn as_millis(&self) -> i64 {
        self.micros / 1_000
    }

    /// Add a duration to this timestamp
    pub fn add(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros + duration.as_micros() as i64,
        }
    }

    /// Subtract a duration from this timestamp
    pub fn sub(&self, duration: Duration) -> Self {
        Self {
            micros: self.micros - duration.as_micros() as i64,
        }
    }

    /// Absolute difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }

    /// Signed difference in microseconds (`self - other`)
    pub fn signed_diff(&self, other: Timestamp) -> i64 {
        self.micros - other.micros
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.micros)
    }
}

/// Kind of elementary stream a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "Video"),
            StreamKind::Audio => write!(f, "Audio"),
        }
    }
}

/// Whether a unit carries decoded or encoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Decoded picture (packed planes) or PCM samples
    Frame,
    /// Encoded bitstream packet
    Packet,
}

/// One frame or packet of media flowing through the pipeline.
///
/// The payload is reference counted: cloning a unit clones the `Bytes`
/// handle, not the buffer. The buffer is released once the last holder
/// drops its clone, so a unit can sit in several output buffers at once
/// without copying.
#[derive(Clone)]
pub struct MediaUnit {
    /// Kind of media (video or audio)
    pub kind: StreamKind,

    /// Frame or packet payload
    pub payload: PayloadKind,

    /// Decoded or encoded media data
    pub data: Bytes,

    /// Presentation timestamp
    pub pts: Timestamp,

    /// Decode timestamp; differs from PTS only for reordered video packets
    pub dts: Timestamp,

    /// Monotonic per-stream sequence number assigned by the producer
    pub sequence: u64,

    /// Whether this is a keyframe (video) or a safe restart point
    pub is_keyframe: bool,

    /// Playback duration of this unit, when the producer knows it
    pub duration: Option<Duration>,

    /// Frame width (decoded video only)
    pub width: Option<u32>,

    /// Frame height (decoded video only)
    pub height: Option<u32>,

    /// Sample rate (audio only)
    pub sample_rate: Option<u32>,

    /// Number of channels (audio only)
    pub channels: Option<u16>,
}

impl MediaUnit {
    /// Decoded video frame with packed plane data
    pub fn video_frame(data: Bytes, pts: Timestamp, width: u32, height: u32) -> Self {
        Self {
            kind: StreamKind::Video,
            payload: PayloadKind::Frame,
            data,
            pts,
            dts: pts,
            sequence: 0,
            is_keyframe: true,
            duration: None,
            width: Some(width),
            height: Some(height),
            sample_rate: None,
            channels: None,
        }
    }

    /// Decoded PCM audio
    pub fn audio_frame(data: Bytes, pts: Timestamp, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: StreamKind::Audio,
            payload: PayloadKind::Frame,
            data,
            pts,
            dts: pts,
            sequence: 0,
            is_keyframe: false,
            duration: None,
            width: None,
            height: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
        }
    }

    /// Encoded packet of either kind
    pub fn packet(kind: StreamKind, data: Bytes, pts: Timestamp, dts: Timestamp) -> Self {
        Self {
            kind,
            payload: PayloadKind::Packet,
            data,
            pts,
            dts,
            sequence: 0,
            is_keyframe: false,
            duration: None,
            width: None,
            height: None,
            sample_rate: None,
            channels: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn is_frame(&self) -> bool {
        self.payload == PayloadKind::Frame
    }

    pub fn is_packet(&self) -> bool {
        self.payload == PayloadKind::Packet
    }

    /// Size of the payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("MediaUnit");
        debug
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("sequence", &self.sequence)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size());

        if let Some(width) = self.width {
            debug.field("width", &width);
        }
        if let Some(height) = self.height {
            debug.field("height", &height);
        }
        if let Some(sample_rate) = self.sample_rate {
            debug.field("sample_rate", &sample_rate);
        }
        if let Some(channels) = self.channels {
            debug.field("channels", &channels);
        }

        debug.finish()
    }
}
