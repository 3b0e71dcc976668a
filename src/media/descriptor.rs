//! Static per-stream codec/format parameters.

use crate::media::unit::StreamKind;
use ac_ffmpeg::codec::CodecParameters;
use serde::{Deserialize, Serialize};

/// Hardware acceleration vendor for the encode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[default]
    None,
    Nvidia,
    QuickSync,
    Amf,
}

/// Codec/format record for one elementary stream.
///
/// A descriptor is immutable once a pipeline stage has opened against it;
/// format changes require tearing the stage down and reopening. Unknown
/// fields stay `None` and can be filled in from another descriptor with
/// [`StreamDescriptor::fill_missing_from`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub codec: Option<String>,
    pub disabled: bool,
    pub bitrate: Option<u64>,

    // video
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<String>,
    pub frame_rate: Option<f64>,

    // audio
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub sample_format: Option<String>,

    /// Stream time base as (numerator, denominator)
    pub time_base: (u32, u32),
    pub hwaccel: HwAccel,
}

impl StreamDescriptor {
    pub fn video(codec: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: StreamKind::Video,
            codec: Some(codec.into()),
            disabled: false,
            bitrate: None,
            width: Some(width),
            height: Some(height),
            pixel_format: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            sample_format: None,
            time_base: (1, 1_000_000),
            hwaccel: HwAccel::None,
        }
    }

    pub fn audio(codec: impl Into<String>, sample_rate: u32, channels: u32) -> Self {
        Self {
            kind: StreamKind::Audio,
            codec: Some(codec.into()),
            disabled: false,
            bitrate: None,
            width: None,
            height: None,
            pixel_format: None,
            frame_rate: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            sample_format: None,
            time_base: (1, 1_000_000),
            hwaccel: HwAccel::None,
        }
    }

    pub fn empty(kind: StreamKind) -> Self {
        Self {
            kind,
            codec: None,
            disabled: false,
            bitrate: None,
            width: None,
            height: None,
            pixel_format: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            sample_format: None,
            time_base: (1, 1_000_000),
            hwaccel: HwAccel::None,
        }
    }

    /// Extract the describable subset of demuxed codec parameters.
    ///
    /// Pixel/sample format names are not recoverable through the wrapper
    /// and stay `None`; stages that need concrete formats read them from
    /// the codec parameters kept alongside this descriptor.
    pub fn from_codec_parameters(params: &CodecParameters, time_base: (u32, u32)) -> Option<Self> {
        if params.is_video_codec() {
            let video = params.clone().into_video_codec_parameters()?;
            let mut desc = Self::empty(StreamKind::Video);
            desc.codec = params.decoder_name().map(|n| n.to_string());
            desc.width = Some(video.width() as u32);
            desc.height = Some(video.height() as u32);
            desc.time_base = time_base;
            Some(desc)
        } else if params.is_audio_codec() {
            let audio = params.clone().into_audio_codec_parameters()?;
            let mut desc = Self::empty(StreamKind::Audio);
            desc.codec = params.decoder_name().map(|n| n.to_string());
            desc.sample_rate = Some(audio.sample_rate());
            desc.channels = Some(audio.channel_layout().channels());
            desc.time_base = time_base;
            Some(desc)
        } else {
            None
        }
    }

    /// Fill every unset field from `source`, leaving set fields alone.
    ///
    /// This is how an output finalizes its codec parameters: caller-fixed
    /// fields win, everything else is taken from the source stream.
    pub fn fill_missing_from(&mut self, source: &StreamDescriptor) {
        if self.codec.is_none() {
            self.codec = source.codec.clone();
        }
        if self.bitrate.is_none() {
            self.bitrate = source.bitrate;
        }
        if self.width.is_none() {
            self.width = source.width;
        }
        if self.height.is_none() {
            self.height = source.height;
        }
        if self.pixel_format.is_none() {
            self.pixel_format = source.pixel_format.clone();
        }
        if self.frame_rate.is_none() {
            self.frame_rate = source.frame_rate;
        }
        if self.sample_rate.is_none() {
            self.sample_rate = source.sample_rate;
        }
        if self.channels.is_none() {
            self.channels = source.channels;
        }
        if self.sample_format.is_none() {
            self.sample_format = source.sample_format.clone();
        }
        if self.time_base == (1, 1_000_000) && source.time_base != (1, 1_000_000) {
            self.time_base = source.time_base;
        }
    }

    /// Whether feeding this target from `source` requires a re-encode
    /// instead of packet pass-through.
    pub fn needs_transcode(&self, source: &StreamDescriptor) -> bool {
        if let (Some(a), Some(b)) = (&self.codec, &source.codec)
            && a != b
        {
            return true;
        }
        if self.bitrate.is_some() && self.bitrate != source.bitrate {
            return true;
        }
        match self.kind {
            StreamKind::Video => {
                (self.width.is_some() && self.width != source.width)
                    || (self.height.is_some() && self.height != source.height)
            }
            StreamKind::Audio => {
                (self.sample_rate.is_some() && self.sample_rate != source.sample_rate)
                    || (self.channels.is_some() && self.channels != source.channels)
            }
        }
    }
}

/// Caller-supplied overrides applied on top of the source descriptor
/// when an output prepares its streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecOverride {
    pub codec: Option<String>,
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub pixel_format: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub sample_format: Option<String>,
    pub hwaccel: HwAccel,
}

impl CodecOverride {
    pub fn is_empty(&self) -> bool {
        self.codec.is_none()
            && self.bitrate.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.pixel_format.is_none()
            && self.sample_rate.is_none()
            && self.channels.is_none()
            && self.sample_format.is_none()
            && self.hwaccel == HwAccel::None
    }

    /// Build the target descriptor for one output stream: overrides win,
    /// missing fields come from the source.
    pub fn resolve(&self, source: &StreamDescriptor) -> StreamDescriptor {
        let mut target = StreamDescriptor::empty(source.kind);
        target.codec = self.codec.clone();
        target.bitrate = self.bitrate;
        target.width = self.width;
        target.height = self.height;
        target.pixel_format = self.pixel_format.clone();
        target.sample_rate = self.sample_rate;
        target.channels = self.channels;
        target.sample_format = self.sample_format.clone();
        target.hwaccel = self.hwaccel;
        target.fill_missing_from(source);
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_missing_keeps_set_fields() {
        let source = StreamDescriptor::video("h264", 1920, 1080);
        let mut target = StreamDescriptor::empty(StreamKind::Video);
        target.width = Some(1280);

        target.fill_missing_from(&source);
        assert_eq!(target.codec.as_deref(), Some("h264"));
        assert_eq!(target.width, Some(1280));
        assert_eq!(target.height, Some(1080));
    }

    #[test]
    fn transcode_needed_only_on_differences() {
        let source = StreamDescriptor::video("h264", 1280, 720);

        let same = CodecOverride::default().resolve(&source);
        assert!(!same.needs_transcode(&source));

        let resized = CodecOverride {
            width: Some(640),
            height: Some(360),
            ..Default::default()
        }
        .resolve(&source);
        assert!(resized.needs_transcode(&source));

        let recodec = CodecOverride {
            codec: Some("hevc".into()),
            ..Default::default()
        }
        .resolve(&source);
        assert!(recodec.needs_transcode(&source));
    }

    #[test]
    fn audio_resolve_merges_rate() {
        let source = StreamDescriptor::audio("aac", 48_000, 2);
        let target = CodecOverride {
            sample_rate: Some(44_100),
            ..Default::default()
        }
        .resolve(&source);
        assert_eq!(target.sample_rate, Some(44_100));
        assert_eq!(target.channels, Some(2));
        assert!(target.needs_transcode(&source));
    }
}
