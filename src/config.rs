//! Configuration surface for sources, outputs and synchronization.
//!
//! All tunables the original treated as ad hoc constants live here with
//! their historical defaults, so hosts can adjust them per deployment.

use crate::media::descriptor::CodecOverride;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Format-option keys consumed by the segmenting destination.
pub const OPT_SEGMENT_TIME: &str = "segment_time";
pub const OPT_RESET_TIMESTAMPS: &str = "reset_timestamps";
pub const OPT_STRFTIME: &str = "strftime";

/// Transport preference for stream inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    #[default]
    Auto,
    /// Stream-oriented (TCP)
    Tcp,
    /// Datagram-oriented (UDP)
    Udp,
}

/// Reconnect/backoff policy shared by readers and writer transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Number of reconnect attempts after a failure; -1 retries forever
    pub reconnect_count: i32,
    /// Pause between attempts, milliseconds
    pub reconnect_wait_ms: u64,
    /// Cap on one connection attempt, milliseconds
    pub connection_wait_ms: u64,
    /// Read/IO timeout once connected, milliseconds
    pub timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect_count: -1,
            reconnect_wait_ms: 5_000,
            connection_wait_ms: 20_000,
            timeout_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Historical defaults for writer destinations: shorter windows, a
    /// stalled output should fail over faster than an input.
    pub fn writer_default() -> Self {
        Self {
            reconnect_count: -1,
            reconnect_wait_ms: 5_000,
            connection_wait_ms: 10_000,
            timeout_ms: 3_000,
        }
    }

    pub fn unlimited(&self) -> bool {
        self.reconnect_count < 0
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn connection_wait(&self) -> Duration {
        Duration::from_millis(self.connection_wait_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-source configuration accepted at `add_source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Input URI: a file path or `tcp://host:port`
    pub url: String,
    pub transport: TransportHint,
    pub reconnect: ReconnectPolicy,
    /// Deliver decoded frames to attached outputs (enables decode)
    pub notify_frames: bool,
    /// Deliver demuxed packets to attached outputs
    pub notify_packets: bool,
    /// Target frame rate for paced sources; 0 keeps the native rate
    pub target_fps: f32,
    /// Units retained per stream cache
    pub cache_capacity: usize,
    /// Stall report window while a seek is outstanding, milliseconds
    pub stall_timeout_ms: u64,
    /// Decode errors tolerated before the source gives up
    pub error_threshold: u32,
    pub sync: SyncTuning,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            transport: TransportHint::Auto,
            reconnect: ReconnectPolicy::default(),
            notify_frames: true,
            notify_packets: true,
            target_fps: 0.0,
            cache_capacity: 10,
            stall_timeout_ms: 10_000,
            error_threshold: 15,
            sync: SyncTuning::default(),
        }
    }
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Audio/video drift correction thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Drift tolerated before the controller intervenes, milliseconds
    pub max_drift_ms: u64,
    /// Streams further apart than this are resynced by cache flush
    /// instead of unit-by-unit correction, milliseconds
    pub hard_resync_ms: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_drift_ms: 100,
            hard_resync_ms: 2_000,
        }
    }
}

impl SyncTuning {
    pub fn max_drift(&self) -> Duration {
        Duration::from_millis(self.max_drift_ms)
    }

    pub fn max_drift_micros(&self) -> i64 {
        (self.max_drift_ms * 1_000) as i64
    }

    pub fn hard_resync_micros(&self) -> i64 {
        (self.hard_resync_ms * 1_000) as i64
    }
}

/// Burned-in label for video outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayOptions {
    /// Label text; `%T` expands to the wall-clock time at render
    pub text: String,
    pub x: u32,
    pub y: u32,
    /// Approximate glyph height in pixels
    pub font_size: u32,
    /// Background box opacity, 0.0..=1.0
    pub opacity: f32,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            text: String::new(),
            x: 16,
            y: 16,
            font_size: 14,
            opacity: 0.6,
        }
    }
}

/// Per-output configuration accepted at `add_output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Destination URI: a file path or `tcp://host:port`
    pub url: String,
    /// Container short name when it cannot be guessed from the URL
    pub format: Option<String>,
    pub video: CodecOverride,
    pub audio: CodecOverride,
    pub overlay: Option<OverlayOptions>,
    /// Unit failures tolerated before the writer errors out
    pub error_threshold: u32,
    pub reconnect: ReconnectPolicy,
    /// Capacity of each input ring feeding the writer worker
    pub buffer_capacity: usize,
    /// Suppress the output-state callback on stop
    pub silent_stop: bool,
    /// Bitstream filters applied to video packets before muxing, in
    /// declaration order
    pub bsf: Vec<BsfSpec>,
    /// Format-option dictionary; segment keys are consumed by the
    /// destination, the rest is logged and ignored
    pub options: BTreeMap<String, String>,
}

/// One bitstream filter with its option dictionary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BsfSpec {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl BsfSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            format: None,
            video: CodecOverride::default(),
            audio: CodecOverride::default(),
            overlay: None,
            error_threshold: 15,
            reconnect: ReconnectPolicy::writer_default(),
            buffer_capacity: 10,
            silent_stop: false,
            bsf: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl OutputConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Enable segmented recording: the destination rolls every
    /// `segment_time`, restarting timestamps and expanding `%`-patterns
    /// in the path against the wall clock.
    pub fn with_segment_time(mut self, segment_time: Duration) -> Self {
        self.options.insert(
            OPT_SEGMENT_TIME.to_string(),
            segment_time.as_secs().to_string(),
        );
        self.options
            .insert(OPT_RESET_TIMESTAMPS.to_string(), "1".to_string());
        self.options
            .insert(OPT_STRFTIME.to_string(), "1".to_string());
        self
    }

    pub fn segment_time(&self) -> Option<Duration> {
        self.options
            .get(OPT_SEGMENT_TIME)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Session description loaded by the CLI host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sources: Vec<SourceConfig>,
    pub outputs: Vec<SessionOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutput {
    #[serde(flatten)]
    pub config: OutputConfig,
    /// Index into `sources` this output attaches to
    #[serde(default)]
    pub source_index: usize,
}
