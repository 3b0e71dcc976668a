//! Demux boundary: opens an input URI and yields timestamped packets.
//!
//! File paths are opened through seekable IO; `tcp://host:port` inputs
//! ride a connected socket with the configured connect cap and read
//! timeout, so a dead peer surfaces as a transport error instead of a
//! hung reader thread. Everything protocol-level beyond that is the
//! media library's business.

use crate::config::{SourceConfig, TransportHint};
use crate::error::{RelayError, Result};
use crate::media::clock;
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::time::TimeBase;
use bytes::Bytes;
use std::fs::File;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Static context of one demuxed elementary stream.
pub struct StreamContext {
    pub index: usize,
    pub descriptor: StreamDescriptor,
    pub params: CodecParameters,
    pub time_base: TimeBase,
}

/// Codec parameters detached from their demuxer so outputs can carry
/// them across threads (pass-through muxing needs the source extradata).
#[derive(Clone)]
pub struct StreamParams {
    params: CodecParameters,
}

// Parameters are immutable refcounted codec state.
unsafe impl Send for StreamParams {}
unsafe impl Sync for StreamParams {}

impl StreamParams {
    pub fn new(params: CodecParameters) -> Self {
        Self { params }
    }

    pub fn get(&self) -> &CodecParameters {
        &self.params
    }
}

enum DemuxerKind {
    Seekable(DemuxerWithStreamInfo<File>),
    Stream(DemuxerWithStreamInfo<TcpStream>),
}

/// One opened input: demuxer plus per-stream context.
pub struct MediaInput {
    demuxer: DemuxerKind,
    streams: Vec<StreamContext>,
}

// The demuxer is moved into the reader thread and never shared.
unsafe impl Send for MediaInput {}

impl MediaInput {
    /// Open the input described by `config`, bounded by its connection
    /// and read timeouts.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let url = config.url.as_str();
        let demuxer = if let Some(address) = url.strip_prefix("tcp://") {
            Self::open_tcp(address, config)?
        } else if url.starts_with("udp://") || config.transport == TransportHint::Udp {
            // Datagram inputs need protocol handling the IO layer does
            // not provide; keep the failure explicit.
            return Err(RelayError::Transport(format!(
                "datagram transport not supported for {url}"
            )));
        } else {
            Self::open_file(url)?
        };

        let mut input = Self {
            demuxer,
            streams: Vec::new(),
        };
        input.collect_streams();

        if input.streams.is_empty() {
            return Err(RelayError::Transport(format!("no usable streams in {url}")));
        }
        Ok(input)
    }

    fn open_file(path: &str) -> Result<DemuxerKind> {
        let file = File::open(path)
            .map_err(|err| RelayError::Transport(format!("unable to open {path}: {err}")))?;
        let io = IO::from_seekable_read_stream(file);
        let demuxer = Demuxer::builder()
            .build(io)?
            .find_stream_info(None)
            .map_err(|(_, err)| RelayError::Media(err))?;
        Ok(DemuxerKind::Seekable(demuxer))
    }

    fn open_tcp(address: &str, config: &SourceConfig) -> Result<DemuxerKind> {
        let addr = address
            .to_socket_addrs()
            .map_err(|err| RelayError::Transport(format!("cannot resolve {address}: {err}")))?
            .next()
            .ok_or_else(|| RelayError::Transport(format!("no address for {address}")))?;

        let stream = TcpStream::connect_timeout(&addr, config.reconnect.connection_wait())
            .map_err(|err| RelayError::Transport(format!("connect {address}: {err}")))?;
        stream
            .set_read_timeout(Some(config.reconnect.timeout()))
            .map_err(RelayError::Io)?;

        let io = IO::from_read_stream(stream);
        let demuxer = Demuxer::builder()
            .build(io)?
            .find_stream_info(None)
            .map_err(|(_, err)| RelayError::Media(err))?;
        Ok(DemuxerKind::Stream(demuxer))
    }

    fn collect_streams(&mut self) {
        let streams = match &self.demuxer {
            DemuxerKind::Seekable(d) => d.streams(),
            DemuxerKind::Stream(d) => d.streams(),
        };

        for (index, stream) in streams.iter().enumerate() {
            let params = stream.codec_parameters();
            let time_base = stream.time_base();
            let Some(descriptor) = StreamDescriptor::from_codec_parameters(&params, (1, 1_000_000))
            else {
                log::debug!("stream {index}: neither audio nor video, ignoring");
                continue;
            };
            self.streams.push(StreamContext {
                index,
                descriptor,
                params,
                time_base,
            });
        }
    }

    pub fn streams(&self) -> &[StreamContext] {
        &self.streams
    }

    pub fn stream_by_kind(&self, kind: StreamKind) -> Option<&StreamContext> {
        self.streams.iter().find(|s| s.descriptor.kind == kind)
    }

    /// Whether this input is a live transport (reconnectable) rather
    /// than a finite seekable file.
    pub fn is_live(&self) -> bool {
        matches!(self.demuxer, DemuxerKind::Stream(_))
    }

    /// Read the next packet as a media unit tagged with its stream slot.
    ///
    /// Returns `Ok(None)` at end of input. Timestamps are rescaled to
    /// pipeline micros using the packet's own time base.
    pub fn read(&mut self) -> Result<Option<(usize, MediaUnit)>> {
        loop {
            let packet = match &mut self.demuxer {
                DemuxerKind::Seekable(d) => d.take()?,
                DemuxerKind::Stream(d) => d.take()?,
            };
            let Some(packet) = packet else {
                return Ok(None);
            };

            let Some(context) = self
                .streams
                .iter()
                .find(|s| s.index == packet.stream_index())
            else {
                continue;
            };

            let pts = clock::to_unit_time(packet.pts(), Timestamp::ZERO);
            let dts = clock::to_unit_time(packet.dts(), pts);
            let unit = MediaUnit::packet(
                context.descriptor.kind,
                Bytes::copy_from_slice(packet.data()),
                pts,
                dts,
            )
            .with_keyframe(packet.is_key());

            return Ok(Some((context.index, unit)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_inputs_are_rejected_as_transport_error() {
        let config = SourceConfig::new("udp://127.0.0.1:9999");
        match MediaInput::open(&config) {
            Err(RelayError::Transport(_)) => {}
            Err(other) => panic!("expected transport error, got {other}"),
            Ok(_) => panic!("expected transport error, got an open input"),
        }
    }

    #[test]
    fn missing_file_is_a_transport_error() {
        let config = SourceConfig::new("/nonexistent/relaycast-test.ts");
        match MediaInput::open(&config) {
            Err(RelayError::Transport(_)) => {}
            Err(other) => panic!("expected transport error, got {other}"),
            Ok(_) => panic!("expected transport error, got an open input"),
        }
    }
}
