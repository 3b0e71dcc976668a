//! Per-stream decoders turning demuxed packets into frame units.
//!
//! Video pictures come out as packed YUV420p (stride padding stripped),
//! audio as the decoder's raw plane bytes with layout metadata on the
//! unit. All timestamps are mapped to pipeline micros by running the
//! decoders on a microsecond time base.

use crate::error::{RelayError, Result};
use crate::media::clock;
use crate::media::picture;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::input::StreamContext;
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioDecoder, AudioFrame, AudioResampler, ChannelLayout};
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame};
use ac_ffmpeg::codec::{CodecParameters, Decoder};
use ac_ffmpeg::packet::PacketMut;
use bytes::Bytes;
use std::time::Duration;

pub enum StreamDecoder {
    Video(VideoStreamDecoder),
    Audio(AudioStreamDecoder),
}

// Decoders are owned by a single reader thread.
unsafe impl Send for StreamDecoder {}

impl StreamDecoder {
    /// Build the decoder matching one demuxed stream.
    pub fn for_stream(context: &StreamContext) -> Result<Self> {
        match context.descriptor.kind {
            StreamKind::Video => Ok(Self::Video(VideoStreamDecoder::new(&context.params)?)),
            StreamKind::Audio => Ok(Self::Audio(AudioStreamDecoder::new(&context.params)?)),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Video(_) => StreamKind::Video,
            Self::Audio(_) => StreamKind::Audio,
        }
    }

    /// Decode one packet unit into zero or more frame units.
    pub fn decode(&mut self, packet: &MediaUnit) -> Result<Vec<MediaUnit>> {
        match self {
            Self::Video(d) => d.decode(packet),
            Self::Audio(d) => d.decode(packet),
        }
    }

    /// Flush internal state and drain the remaining frames. Used at end
    /// of input and around seeks/reconnects.
    pub fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        match self {
            Self::Video(d) => d.flush(),
            Self::Audio(d) => d.flush(),
        }
    }
}

pub struct VideoStreamDecoder {
    decoder: VideoDecoder,
    /// Reusable packed-YUV buffer to avoid per-frame allocation
    packed: Vec<u8>,
}

impl VideoStreamDecoder {
    fn new(params: &CodecParameters) -> Result<Self> {
        let video_params = params
            .clone()
            .into_video_codec_parameters()
            .ok_or_else(|| RelayError::Codec("stream has no video parameters".into()))?;
        let decoder = VideoDecoder::from_codec_parameters(&video_params)?
            .time_base(clock::micros_time_base())
            .build()?;
        Ok(Self {
            decoder,
            packed: Vec::new(),
        })
    }

    fn decode(&mut self, packet: &MediaUnit) -> Result<Vec<MediaUnit>> {
        let raw = PacketMut::from(packet.data.as_ref())
            .with_pts(clock::from_unit_time(packet.pts, clock::micros_time_base()))
            .with_dts(clock::from_unit_time(packet.dts, clock::micros_time_base()))
            .freeze();

        if let Err(err) = self.decoder.try_push(raw) {
            if !err.is_again() {
                return Err(RelayError::Codec(format!("video decode: {err}")));
            }
            // Decoder is full: drain, then retry once.
            let mut frames = self.drain()?;
            let retry = PacketMut::from(packet.data.as_ref())
                .with_pts(clock::from_unit_time(packet.pts, clock::micros_time_base()))
                .freeze();
            if let Err(err) = self.decoder.try_push(retry) {
                log::warn!("video decode retry failed: {err}");
            }
            frames.extend(self.drain()?);
            return Ok(frames);
        }
        self.drain()
    }

    fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        self.decoder
            .flush()
            .map_err(|err| RelayError::Codec(format!("video flush: {err}")))?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<MediaUnit>> {
        let mut out = Vec::new();
        while let Some(frame) = self
            .decoder
            .take()
            .map_err(|err| RelayError::Codec(format!("video take: {err}")))?
        {
            if let Some(unit) = self.pack_frame(&frame) {
                out.push(unit);
            }
        }
        Ok(out)
    }

    /// Strip stride padding and pack Y+U+V contiguously.
    fn pack_frame(&mut self, frame: &VideoFrame) -> Option<MediaUnit> {
        if !picture::pack_into(&mut self.packed, frame) {
            log::warn!("decoded picture is not three-plane, dropping");
            return None;
        }
        let pts = clock::to_unit_time(frame.pts(), Timestamp::ZERO);
        Some(MediaUnit::video_frame(
            Bytes::from(self.packed.clone()),
            pts,
            frame.width() as u32,
            frame.height() as u32,
        ))
    }
}

pub struct AudioStreamDecoder {
    decoder: AudioDecoder,
    /// Normalizes decoder output to interleaved s16 so every consumer
    /// sees plain PCM regardless of codec
    resampler: AudioResampler,
    sample_rate: u32,
    channels: u16,
}

impl AudioStreamDecoder {
    fn new(params: &CodecParameters) -> Result<Self> {
        let audio_params = params
            .clone()
            .into_audio_codec_parameters()
            .ok_or_else(|| RelayError::Codec("stream has no audio parameters".into()))?;
        let decoder = AudioDecoder::from_codec_parameters(&audio_params)?
            .time_base(clock::micros_time_base())
            .build()?;

        let sample_rate = audio_params.sample_rate();
        let channels = audio_params.channel_layout().channels() as u16;
        let layout = |count: u16| {
            ChannelLayout::from_channels(count as u32)
                .ok_or_else(|| RelayError::Codec(format!("unsupported channel count {count}")))
        };
        let resampler = AudioResampler::builder()
            .source_channel_layout(layout(channels)?)
            .source_sample_format(audio_params.sample_format())
            .source_sample_rate(sample_rate)
            .target_channel_layout(layout(channels)?)
            .target_sample_format(get_sample_format("s16"))
            .target_sample_rate(sample_rate)
            .build()?;

        Ok(Self {
            decoder,
            resampler,
            sample_rate,
            channels,
        })
    }

    fn decode(&mut self, packet: &MediaUnit) -> Result<Vec<MediaUnit>> {
        let raw = PacketMut::from(packet.data.as_ref())
            .with_pts(clock::from_unit_time(packet.pts, clock::micros_time_base()))
            .freeze();

        if let Err(err) = self.decoder.try_push(raw) {
            if !err.is_again() {
                return Err(RelayError::Codec(format!("audio decode: {err}")));
            }
            let mut frames = self.drain()?;
            let retry = PacketMut::from(packet.data.as_ref())
                .with_pts(clock::from_unit_time(packet.pts, clock::micros_time_base()))
                .freeze();
            if let Err(err) = self.decoder.try_push(retry) {
                log::warn!("audio decode retry failed: {err}");
            }
            frames.extend(self.drain()?);
            return Ok(frames);
        }
        self.drain()
    }

    fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        self.decoder
            .flush()
            .map_err(|err| RelayError::Codec(format!("audio flush: {err}")))?;
        self.drain()
    }

    fn drain(&mut self) -> Result<Vec<MediaUnit>> {
        let mut out = Vec::new();
        while let Some(frame) = self
            .decoder
            .take()
            .map_err(|err| RelayError::Codec(format!("audio take: {err}")))?
        {
            self.resampler
                .push(frame)
                .map_err(|err| RelayError::Codec(format!("audio resample: {err}")))?;
            while let Some(pcm) = self
                .resampler
                .take()
                .map_err(|err| RelayError::Codec(format!("audio resample: {err}")))?
            {
                out.push(self.frame_to_unit(&pcm));
            }
        }
        Ok(out)
    }

    /// Interleaved s16 lands in a single plane.
    fn frame_to_unit(&self, frame: &AudioFrame) -> MediaUnit {
        let samples = frame.samples();
        let data = Bytes::copy_from_slice(frame.planes()[0].data());
        let pts = clock::to_unit_time(frame.pts(), Timestamp::ZERO);

        let mut unit = MediaUnit::audio_frame(data, pts, self.sample_rate, self.channels);
        if self.sample_rate > 0 {
            unit = unit.with_duration(Duration::from_micros(
                (samples as u64 * 1_000_000) / self.sample_rate as u64,
            ));
        }
        unit
    }
}
