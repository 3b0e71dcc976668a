//! Per-stream encoders turning frame units back into packets.
//!
//! The video path picks its codec through a fallback chain, hardware
//! first when the target asks for it, so a missing driver degrades to
//! software instead of failing the output. Audio always runs through a
//! resampler so interleaved s16 input fits whatever sample format the
//! encoder accepts.

use crate::error::{RelayError, Result};
use crate::media::clock;
use crate::media::descriptor::{HwAccel, StreamDescriptor};
use crate::media::picture;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{VideoEncoder, VideoFrameMut};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use bytes::Bytes;

/// H.264 fallback chain. Closed GOP and no B-frames so segment cuts
/// always land on clean keyframes.
const H264_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[("preset", "p4"), ("tune", "ll"), ("g", "120"), ("bf", "0")],
    ),
    (
        "h264_qsv",
        &[("preset", "veryfast"), ("g", "120"), ("bf", "0")],
    ),
    (
        "h264_amf",
        &[("usage", "lowlatency"), ("quality", "speed"), ("g", "120")],
    ),
    (
        "libx264",
        &[
            ("preset", "veryfast"),
            ("tune", "zerolatency"),
            ("keyint", "120"),
            ("bframes", "0"),
        ],
    ),
];

/// HEVC fallback chain, same shape as H.264.
const HEVC_CHAIN: &[(&str, &[(&str, &str)])] = &[
    ("hevc_nvenc", &[("preset", "p4"), ("g", "120"), ("bf", "0")]),
    ("hevc_qsv", &[("preset", "veryfast"), ("g", "120")]),
    ("hevc_amf", &[("usage", "lowlatency"), ("quality", "speed")]),
    ("libx265", &[("preset", "veryfast"), ("bframes", "0")]),
];

/// Sample formats offered to an audio encoder, preferred first.
const AUDIO_SAMPLE_FORMATS: &[&str] = &["s16", "fltp", "flt", "s32"];

/// Codec-to-encoder names where they differ.
const AUDIO_ENCODERS: &[(&str, &str)] = &[
    ("opus", "libopus"),
    ("mp3", "libmp3lame"),
    ("vorbis", "libvorbis"),
];

fn even(value: u32) -> u32 {
    if value.is_multiple_of(2) { value } else { value + 1 }
}

/// Encoder names to try for a video codec, honoring the hardware
/// preference. Unknown codecs map straight to an encoder of the same
/// name with no fallback.
fn video_candidates(
    codec: &str,
    hwaccel: HwAccel,
) -> Vec<(&'static str, &'static [(&'static str, &'static str)])> {
    let chain = match codec {
        "h264" => H264_CHAIN,
        "hevc" | "h265" => HEVC_CHAIN,
        _ => return Vec::new(),
    };
    let software = chain[chain.len() - 1];
    let hardware = match hwaccel {
        HwAccel::None => None,
        HwAccel::Nvidia => Some(chain[0]),
        HwAccel::QuickSync => Some(chain[1]),
        HwAccel::Amf => Some(chain[2]),
    };
    match hardware {
        Some(hw) => vec![hw, software],
        None => vec![software],
    }
}

fn audio_encoder_name(codec: &str) -> &str {
    AUDIO_ENCODERS
        .iter()
        .find(|(name, _)| *name == codec)
        .map(|(_, encoder)| *encoder)
        .unwrap_or(codec)
}

pub enum StreamEncoder {
    Video(VideoStreamEncoder),
    Audio(AudioStreamEncoder),
}

// Encoders are owned by a single writer thread.
unsafe impl Send for StreamEncoder {}

impl StreamEncoder {
    /// Build the encoder for one resolved target descriptor.
    pub fn for_target(target: &StreamDescriptor) -> Result<Self> {
        match target.kind {
            StreamKind::Video => Ok(Self::Video(VideoStreamEncoder::new(target)?)),
            StreamKind::Audio => Ok(Self::Audio(AudioStreamEncoder::new(target)?)),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Video(_) => StreamKind::Video,
            Self::Audio(_) => StreamKind::Audio,
        }
    }

    /// Encode one frame unit into zero or more packet units.
    pub fn encode(&mut self, unit: &MediaUnit) -> Result<Vec<MediaUnit>> {
        match self {
            Self::Video(e) => e.encode(unit),
            Self::Audio(e) => e.encode(unit),
        }
    }

    /// Drain the delayed tail. Called once when the output stops.
    pub fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        match self {
            Self::Video(e) => e.flush(),
            Self::Audio(e) => e.flush(),
        }
    }

    /// Parameters describing the encoded stream, for muxer setup.
    pub fn codec_parameters(&self) -> CodecParameters {
        match self {
            Self::Video(e) => e.encoder.codec_parameters().into(),
            Self::Audio(e) => e.encoder.codec_parameters().into(),
        }
    }

    /// Whether a frame unit still fits this encoder's static setup.
    /// A mismatch means the caller must rebuild the encoder.
    pub fn matches(&self, unit: &MediaUnit) -> bool {
        match self {
            Self::Video(e) => {
                unit.width.map(even) == Some(e.width) && unit.height.map(even) == Some(e.height)
            }
            Self::Audio(e) => match e.connected {
                Some((rate, channels)) => {
                    unit.sample_rate == Some(rate) && unit.channels == Some(channels)
                }
                // Nothing connected yet, anything fits.
                None => true,
            },
        }
    }
}

pub struct VideoStreamEncoder {
    encoder: VideoEncoder,
    codec_name: String,
    width: u32,
    height: u32,
    last_pts: Timestamp,
}

impl VideoStreamEncoder {
    fn new(target: &StreamDescriptor) -> Result<Self> {
        let width = even(
            target
                .width
                .filter(|w| *w > 0)
                .ok_or_else(|| RelayError::Codec("video target has no width".into()))?,
        );
        let height = even(
            target
                .height
                .filter(|h| *h > 0)
                .ok_or_else(|| RelayError::Codec("video target has no height".into()))?,
        );
        let codec = target.codec.as_deref().unwrap_or("h264");

        let mut candidates = video_candidates(codec, target.hwaccel);
        if candidates.is_empty() {
            // Codec outside the known chains: the encoder carries the
            // codec's own name (mpeg4, mjpeg, ...).
            return Self::try_build(codec, &[], target, width, height);
        }
        let last = candidates.len() - 1;
        for (position, (name, options)) in candidates.drain(..).enumerate() {
            match Self::try_build(name, options, target, width, height) {
                Ok(encoder) => return Ok(encoder),
                Err(err) if position < last => {
                    log::debug!("encoder {name} unavailable, falling back: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("candidate loop returns on its last entry")
    }

    fn try_build(
        name: &str,
        options: &[(&str, &str)],
        target: &StreamDescriptor,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut builder = VideoEncoder::builder(name)
            .map_err(|err| RelayError::Codec(format!("encoder {name}: {err}")))?
            .pixel_format(get_pixel_format("yuv420p"))
            .width(width as usize)
            .height(height as usize)
            .time_base(clock::micros_time_base());
        for (key, value) in options {
            builder = builder.set_option(key, value);
        }
        if let Some(bitrate) = target.bitrate {
            builder = builder.set_option("b", bitrate.to_string());
        }
        let encoder = builder
            .build()
            .map_err(|err| RelayError::Codec(format!("encoder {name}: {err}")))?;
        log::info!("video encoder {name} open at {width}x{height}");
        Ok(Self {
            encoder,
            codec_name: name.to_string(),
            width,
            height,
            last_pts: Timestamp::ZERO,
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn encode(&mut self, unit: &MediaUnit) -> Result<Vec<MediaUnit>> {
        let (Some(width), Some(height)) = (unit.width, unit.height) else {
            return Err(RelayError::Codec("video frame without geometry".into()));
        };

        let mut frame = VideoFrameMut::black(
            get_pixel_format("yuv420p"),
            self.width as usize,
            self.height as usize,
        )
        .with_time_base(clock::micros_time_base())
        .with_pts(clock::from_unit_time(unit.pts, clock::micros_time_base()));
        picture::fill_from_packed(&mut frame, unit.data.as_ref(), width as usize, height as usize);

        self.encoder
            .push(frame.freeze())
            .map_err(|err| RelayError::Codec(format!("video encode: {err}")))?;
        self.drain()
    }

    fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        self.encoder
            .flush()
            .map_err(|err| RelayError::Codec(format!("video encode flush: {err}")))?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<MediaUnit>> {
        let mut out = Vec::new();
        while let Some(packet) = self
            .encoder
            .take()
            .map_err(|err| RelayError::Codec(format!("video encode take: {err}")))?
        {
            let pts = clock::to_unit_time(packet.pts(), self.last_pts);
            let dts = clock::to_unit_time(packet.dts(), pts);
            self.last_pts = pts;
            out.push(
                MediaUnit::packet(
                    StreamKind::Video,
                    Bytes::copy_from_slice(packet.data()),
                    pts,
                    dts,
                )
                .with_keyframe(packet.is_key()),
            );
        }
        Ok(out)
    }
}

pub struct AudioStreamEncoder {
    encoder: AudioEncoder,
    /// Feeds the encoder its preferred format; rebuilt when the input
    /// layout changes
    resampler: Option<AudioResampler>,
    connected: Option<(u32, u16)>,
    sample_rate: u32,
    channels: u32,
    sample_format: &'static str,
    samples_per_frame: Option<usize>,
    /// Output pts run on a sample counter anchored at the first unit,
    /// so encoder delay cannot skew the muxed timeline
    base_micros: Option<i64>,
    samples_emitted: u64,
}

impl AudioStreamEncoder {
    fn new(target: &StreamDescriptor) -> Result<Self> {
        let sample_rate = target
            .sample_rate
            .filter(|r| *r > 0)
            .ok_or_else(|| RelayError::Codec("audio target has no sample rate".into()))?;
        let channels = target
            .channels
            .filter(|c| *c > 0)
            .ok_or_else(|| RelayError::Codec("audio target has no channel count".into()))?;
        let codec = target.codec.as_deref().unwrap_or("aac");
        let name = audio_encoder_name(codec);

        let mut built = None;
        for format in AUDIO_SAMPLE_FORMATS {
            let layout = ChannelLayout::from_channels(channels)
                .ok_or_else(|| RelayError::Codec(format!("unsupported channel count {channels}")))?;
            let mut builder = AudioEncoder::builder(name)
                .map_err(|err| RelayError::Codec(format!("encoder {name}: {err}")))?
                .sample_rate(sample_rate)
                .channel_layout(layout)
                .sample_format(get_sample_format(format));
            if let Some(bitrate) = target.bitrate {
                builder = builder.set_option("b", bitrate.to_string());
            }
            match builder.build() {
                Ok(encoder) => {
                    built = Some((encoder, *format));
                    break;
                }
                Err(err) => {
                    log::debug!("encoder {name} rejected sample format {format}: {err}");
                }
            }
        }
        let (encoder, sample_format) = built.ok_or_else(|| {
            RelayError::Codec(format!("encoder {name} accepts none of the known formats"))
        })?;
        let samples_per_frame = encoder.samples_per_frame();
        log::info!("audio encoder {name} open at {sample_rate}Hz/{channels}ch ({sample_format})");

        Ok(Self {
            encoder,
            resampler: None,
            connected: None,
            sample_rate,
            channels,
            sample_format,
            samples_per_frame,
            base_micros: None,
            samples_emitted: 0,
        })
    }

    /// (Re)build the resampler bridging the unit layout to the encoder.
    fn connect(&mut self, rate: u32, channels: u16) -> Result<()> {
        let layout = |count: u32| {
            ChannelLayout::from_channels(count)
                .ok_or_else(|| RelayError::Codec(format!("unsupported channel count {count}")))
        };
        let resampler = AudioResampler::builder()
            .source_channel_layout(layout(channels as u32)?)
            .source_sample_format(get_sample_format("s16"))
            .source_sample_rate(rate)
            .target_channel_layout(layout(self.channels)?)
            .target_sample_format(get_sample_format(self.sample_format))
            .target_sample_rate(self.sample_rate)
            .target_frame_samples(self.samples_per_frame)
            .build()?;
        self.resampler = Some(resampler);
        self.connected = Some((rate, channels));
        Ok(())
    }

    fn encode(&mut self, unit: &MediaUnit) -> Result<Vec<MediaUnit>> {
        let rate = unit
            .sample_rate
            .ok_or_else(|| RelayError::Codec("audio frame without sample rate".into()))?;
        let channels = unit
            .channels
            .ok_or_else(|| RelayError::Codec("audio frame without channel count".into()))?;
        if self.connected != Some((rate, channels)) {
            self.connect(rate, channels)?;
        }

        let sample_size = channels as usize * 2;
        let samples = unit.data.len() / sample_size;
        if samples == 0 {
            return Ok(Vec::new());
        }
        if self.base_micros.is_none() {
            self.base_micros = Some(unit.pts.micros);
        }

        let layout = ChannelLayout::from_channels(channels as u32)
            .ok_or_else(|| RelayError::Codec(format!("unsupported channel count {channels}")))?;
        let mut frame =
            AudioFrameMut::silence(&layout, get_sample_format("s16"), rate, samples);
        let length = samples * sample_size;
        frame.planes_mut()[0].data_mut()[..length].copy_from_slice(&unit.data[..length]);

        let resampler = self.resampler.as_mut().unwrap();
        resampler
            .push(frame.freeze())
            .map_err(|err| RelayError::Codec(format!("audio resample: {err}")))?;

        let mut out = Vec::new();
        while let Some(converted) = resampler
            .take()
            .map_err(|err| RelayError::Codec(format!("audio resample: {err}")))?
        {
            let emitted = converted.samples();
            self.encoder
                .push(converted)
                .map_err(|err| RelayError::Codec(format!("audio encode: {err}")))?;
            self.drain(emitted, &mut out)?;
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        self.encoder
            .flush()
            .map_err(|err| RelayError::Codec(format!("audio encode flush: {err}")))?;
        let mut out = Vec::new();
        self.drain(0, &mut out)?;
        Ok(out)
    }

    fn drain(&mut self, pushed_samples: usize, out: &mut Vec<MediaUnit>) -> Result<()> {
        while let Some(packet) = self
            .encoder
            .take()
            .map_err(|err| RelayError::Codec(format!("audio encode take: {err}")))?
        {
            let advance = self.samples_per_frame.unwrap_or(pushed_samples) as u64;
            let micros = self.base_micros.unwrap_or(0)
                + (self.samples_emitted as i64 * 1_000_000) / self.sample_rate as i64;
            self.samples_emitted += advance;
            let pts = Timestamp::from_micros(micros);
            out.push(
                MediaUnit::packet(
                    StreamKind::Audio,
                    Bytes::copy_from_slice(packet.data()),
                    pts,
                    pts,
                )
                .with_keyframe(packet.is_key()),
            );
        }
        Ok(())
    }
}
