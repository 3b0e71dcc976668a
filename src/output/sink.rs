//! Destination side of a writer: muxed container or raw byte stream,
//! with optional time-based segmentation for file targets.
//!
//! The sink decides its backend at open time. When every registered
//! stream carries codec parameters and the container format can be
//! resolved, packets go through a real muxer; otherwise payload bytes
//! are written as-is, which is what synthetic pushed streams and
//! elementary-stream captures want. Stream destinations never segment.

use crate::config::{ReconnectPolicy, OPT_RESET_TIMESTAMPS, OPT_SEGMENT_TIME, OPT_STRFTIME};
use crate::error::{RelayError, Result};
use crate::media::clock;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::input::StreamParams;
use crate::utils::stop::StopSignal;
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::PacketMut;
use chrono::format::{Item, StrftimeItems};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// One stream registered with the sink.
pub struct SinkStream {
    pub kind: StreamKind,
    pub params: Option<StreamParams>,
}

enum Backend {
    MuxedFile(Muxer<File>),
    MuxedStream(Muxer<TcpStream>),
    RawFile(File),
    RawStream(TcpStream),
}

// The muxer is owned by a single writer thread.
unsafe impl Send for Backend {}

pub struct MuxSink {
    url: String,
    format: Option<String>,
    reconnect: ReconnectPolicy,
    segment_time: Option<Duration>,
    reset_timestamps: bool,
    strftime: bool,
    is_stream: bool,
    streams: Vec<SinkStream>,
    backend: Option<Backend>,
    segment_index: u32,
    segments_written: u32,
    /// Anchor for the roll decision, first pts of the open segment
    segment_start: Option<Timestamp>,
    /// Subtracted from outgoing timestamps under reset_timestamps
    base_micros: i64,
    audio_only: bool,
}

impl MuxSink {
    pub fn new(
        url: &str,
        format: Option<&str>,
        options: &BTreeMap<String, String>,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let is_stream = url.starts_with("tcp://");
        let mut segment_time = options
            .get(OPT_SEGMENT_TIME)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if is_stream && segment_time.is_some() {
            log::warn!("segmenting requested for stream destination {url}, ignored");
            segment_time = None;
        }
        let flag = |key: &str| options.get(key).is_some_and(|v| v == "1" || v == "true");

        for key in options.keys() {
            if !matches!(
                key.as_str(),
                OPT_SEGMENT_TIME | OPT_RESET_TIMESTAMPS | OPT_STRFTIME
            ) {
                log::debug!("format option {key} not consumed by {url}");
            }
        }

        Self {
            url: url.to_string(),
            format: format.map(|f| f.to_string()),
            reconnect,
            segment_time,
            reset_timestamps: flag(OPT_RESET_TIMESTAMPS),
            strftime: flag(OPT_STRFTIME),
            is_stream,
            streams: Vec::new(),
            backend: None,
            segment_index: 0,
            segments_written: 0,
            segment_start: None,
            base_micros: 0,
            audio_only: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn segments_written(&self) -> u32 {
        self.segments_written
    }

    /// Open the destination for the given stream set. Transport errors
    /// on stream destinations are retried per the reconnect policy.
    pub fn open(&mut self, streams: Vec<SinkStream>, stop: &StopSignal) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        self.audio_only = !streams.iter().any(|s| s.kind == StreamKind::Video);
        self.streams = streams;
        let backend = self.open_backend(stop)?;
        self.backend = Some(backend);
        self.segments_written += 1;
        log::info!("output destination {} open", self.current_path());
        Ok(())
    }

    fn current_path(&self) -> String {
        segment_path(
            &self.url,
            self.segment_index,
            self.segment_time.is_some(),
            self.strftime,
        )
    }

    fn open_backend(&self, stop: &StopSignal) -> Result<Backend> {
        if self.is_stream {
            let address = self.url.trim_start_matches("tcp://");
            let stream = self.connect_with_retry(address, stop)?;
            return Ok(match self.output_format() {
                Some(format) => Backend::MuxedStream(
                    self.build_muxer(IO::from_write_stream(stream), format)?,
                ),
                None => Backend::RawStream(stream),
            });
        }

        let path = self.current_path();
        let file = File::create(&path)
            .map_err(|err| RelayError::Transport(format!("unable to create {path}: {err}")))?;
        Ok(match self.output_format() {
            Some(format) => {
                Backend::MuxedFile(self.build_muxer(IO::from_seekable_write_stream(file), format)?)
            }
            None => Backend::RawFile(file),
        })
    }

    /// Container format for the muxed path; `None` selects the raw
    /// backend. Muxing requires parameters for every stream.
    fn output_format(&self) -> Option<OutputFormat> {
        if !self.streams.iter().all(|s| s.params.is_some()) {
            return None;
        }
        match self.format.as_deref() {
            Some(name) => {
                let format = OutputFormat::find_by_name(name);
                if format.is_none() {
                    log::warn!("unknown container format {name}, writing raw");
                }
                format
            }
            None => OutputFormat::guess_from_file_name(&self.url),
        }
    }

    fn build_muxer<T>(&self, io: IO<T>, format: OutputFormat) -> Result<Muxer<T>> {
        let mut builder = Muxer::builder();
        for stream in &self.streams {
            let params = stream.params.as_ref().unwrap();
            builder.add_stream(params.get())?;
        }
        Ok(builder.build(io, format)?)
    }

    fn connect_with_retry(&self, address: &str, stop: &StopSignal) -> Result<TcpStream> {
        let policy = &self.reconnect;
        let mut attempts: u32 = 0;
        loop {
            match self.connect_once(address) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !policy.unlimited() && attempts >= policy.reconnect_count as u32 {
                        return Err(RelayError::Exhausted { attempts });
                    }
                    attempts += 1;
                    log::warn!(
                        "output connect to {address} failed (attempt {attempts}): {err}"
                    );
                    if stop.wait_timeout(policy.reconnect_wait()) {
                        return Err(RelayError::Closed);
                    }
                }
            }
        }
    }

    fn connect_once(&self, address: &str) -> Result<TcpStream> {
        let mut last = None;
        let addresses = address
            .to_socket_addrs()
            .map_err(|err| RelayError::Transport(format!("resolve {address}: {err}")))?;
        for candidate in addresses {
            match TcpStream::connect_timeout(&candidate, self.reconnect.connection_wait()) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.reconnect.timeout()))?;
                    return Ok(stream);
                }
                Err(err) => last = Some(err),
            }
        }
        Err(RelayError::Transport(format!(
            "unable to connect to {address}: {}",
            last.map(|e| e.to_string()).unwrap_or_else(|| "no addresses".into())
        )))
    }

    /// Write one packet unit to stream `index`, rolling the segment
    /// first when it is due.
    pub fn push(&mut self, index: usize, unit: &MediaUnit) -> Result<()> {
        if self.backend.is_none() {
            return Err(RelayError::Precondition("sink is not open".into()));
        }
        if self.roll_due(unit) {
            self.roll(unit)?;
        }
        if self.segment_start.is_none() {
            self.segment_start = Some(unit.pts);
            if self.reset_timestamps && self.base_micros == 0 && self.segment_index == 0 {
                self.base_micros = unit.pts.micros;
            }
        }

        let pts = Timestamp::from_micros(unit.pts.micros - self.base_micros);
        let dts = Timestamp::from_micros(unit.dts.micros - self.base_micros);
        match self.backend.as_mut().unwrap() {
            Backend::MuxedFile(muxer) => push_muxed(muxer, index, unit, pts, dts),
            Backend::MuxedStream(muxer) => push_muxed(muxer, index, unit, pts, dts),
            Backend::RawFile(file) => write_raw(file, unit),
            Backend::RawStream(stream) => write_raw(stream, unit),
        }
    }

    /// A segment rolls once its duration is reached, but only on a cut
    /// point: a video keyframe, or any unit when there is no video.
    fn roll_due(&self, unit: &MediaUnit) -> bool {
        let Some(window) = self.segment_time else {
            return false;
        };
        let Some(start) = self.segment_start else {
            return false;
        };
        if unit.pts.signed_diff(start) < window.as_micros() as i64 {
            return false;
        }
        match unit.kind {
            StreamKind::Video => unit.is_keyframe,
            StreamKind::Audio => self.audio_only,
        }
    }

    fn roll(&mut self, unit: &MediaUnit) -> Result<()> {
        self.close_backend();
        self.segment_index += 1;
        self.segment_start = Some(unit.pts);
        if self.reset_timestamps {
            self.base_micros = unit.pts.micros;
        }
        // Local file reopen, never a transport wait.
        let backend = self.open_backend(&StopSignal::default())?;
        self.backend = Some(backend);
        self.segments_written += 1;
        log::info!("segment {} open at {}", self.segment_index, unit.pts);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        match self.backend.as_mut() {
            Some(Backend::MuxedFile(muxer)) => muxer.flush().map_err(RelayError::from),
            Some(Backend::MuxedStream(muxer)) => muxer.flush().map_err(RelayError::from),
            Some(Backend::RawFile(file)) => file.flush().map_err(RelayError::from),
            Some(Backend::RawStream(stream)) => stream.flush().map_err(RelayError::from),
            None => Ok(()),
        }
    }

    fn close_backend(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("flush on close failed: {err}");
        }
        self.backend = None;
    }

    /// Flush and release the destination. The sink cannot be reopened.
    pub fn close(&mut self) {
        if self.backend.is_some() {
            self.close_backend();
            log::info!(
                "output {} closed after {} segment(s)",
                self.url,
                self.segments_written
            );
        }
    }
}

impl Drop for MuxSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn push_muxed<T>(
    muxer: &mut Muxer<T>,
    index: usize,
    unit: &MediaUnit,
    pts: Timestamp,
    dts: Timestamp,
) -> Result<()> {
    let packet = PacketMut::from(unit.data.as_ref())
        .with_pts(clock::from_unit_time(pts, clock::micros_time_base()))
        .with_dts(clock::from_unit_time(dts, clock::micros_time_base()))
        .with_stream_index(index)
        .freeze();
    muxer.push(packet)?;
    Ok(())
}

fn write_raw<W: Write>(writer: &mut W, unit: &MediaUnit) -> Result<()> {
    writer.write_all(unit.data.as_ref())?;
    Ok(())
}

/// Path of one segment. Under strftime, `%`-patterns in the URL expand
/// against the wall clock; otherwise segments get a zero-padded index
/// suffix ahead of the extension. Unsegmented outputs keep the URL.
fn segment_path(url: &str, index: u32, segmented: bool, strftime: bool) -> String {
    if !segmented {
        return url.to_string();
    }
    if strftime && url.contains('%') {
        let valid = !StrftimeItems::new(url).any(|item| matches!(item, Item::Error));
        if valid {
            return chrono::Local::now().format(url).to_string();
        }
        log::warn!("invalid strftime pattern in {url}, using index suffix");
    }
    match url.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
            format!("{stem}-{index:03}.{ext}")
        }
        _ => format!("{url}-{index:03}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn video_packet(pts_ms: i64, key: bool, data: &[u8]) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Video,
            Bytes::copy_from_slice(data),
            Timestamp::from_millis(pts_ms),
            Timestamp::from_millis(pts_ms),
        )
        .with_keyframe(key)
    }

    fn segmenting_options(secs: u64) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        options.insert(OPT_SEGMENT_TIME.to_string(), secs.to_string());
        options.insert(OPT_RESET_TIMESTAMPS.to_string(), "1".to_string());
        options
    }

    #[test]
    fn index_suffix_lands_before_the_extension() {
        assert_eq!(segment_path("out.ts", 2, true, false), "out-002.ts");
        assert_eq!(segment_path("clip", 0, true, false), "clip-000");
        assert_eq!(segment_path("out.ts", 5, false, false), "out.ts");
        assert_eq!(
            segment_path("a.dir/clip", 1, true, false),
            "a.dir/clip-001"
        );
    }

    #[test]
    fn strftime_patterns_expand_against_the_clock() {
        let path = segment_path("rec-%Y.raw", 0, true, true);
        assert!(path.starts_with("rec-2"));
        assert!(!path.contains('%'));
    }

    #[test]
    fn raw_sink_concatenates_payloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.raw");
        let mut sink = MuxSink::new(
            path.to_str().unwrap(),
            None,
            &BTreeMap::new(),
            ReconnectPolicy::writer_default(),
        );
        sink.open(
            vec![SinkStream {
                kind: StreamKind::Video,
                params: None,
            }],
            &StopSignal::default(),
        )
        .unwrap();

        sink.push(0, &video_packet(0, true, &[1, 2])).unwrap();
        sink.push(0, &video_packet(40, false, &[3])).unwrap();
        sink.close();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert_eq!(sink.segments_written(), 1);
    }

    #[test]
    fn segments_roll_on_keyframes_past_the_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg.raw");
        let mut sink = MuxSink::new(
            path.to_str().unwrap(),
            None,
            &segmenting_options(10),
            ReconnectPolicy::writer_default(),
        );
        sink.open(
            vec![SinkStream {
                kind: StreamKind::Video,
                params: None,
            }],
            &StopSignal::default(),
        )
        .unwrap();

        // 25 seconds of video, one keyframe every 5s.
        for second in 0..25i64 {
            let key = second % 5 == 0;
            sink.push(0, &video_packet(second * 1_000, key, &[second as u8]))
                .unwrap();
        }
        sink.close();

        assert_eq!(sink.segments_written(), 3);
        let first = std::fs::read(dir.path().join("seg-000.raw")).unwrap();
        let second = std::fs::read(dir.path().join("seg-001.raw")).unwrap();
        let third = std::fs::read(dir.path().join("seg-002.raw")).unwrap();
        // Rolls happen at the 10s and 20s keyframes.
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_eq!(third.len(), 5);
    }

    #[test]
    fn roll_waits_for_a_keyframe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wait.raw");
        let mut sink = MuxSink::new(
            path.to_str().unwrap(),
            None,
            &segmenting_options(10),
            ReconnectPolicy::writer_default(),
        );
        sink.open(
            vec![SinkStream {
                kind: StreamKind::Video,
                params: None,
            }],
            &StopSignal::default(),
        )
        .unwrap();

        // Keyframes only at 0s and 13s: the roll slips to 13s.
        for second in 0..16i64 {
            let key = second == 0 || second == 13;
            sink.push(0, &video_packet(second * 1_000, key, &[0]))
                .unwrap();
        }
        sink.close();

        assert_eq!(
            std::fs::read(dir.path().join("wait-000.raw")).unwrap().len(),
            13
        );
        assert_eq!(
            std::fs::read(dir.path().join("wait-001.raw")).unwrap().len(),
            3
        );
    }

    #[test]
    fn audio_only_segments_cut_on_any_unit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tone.raw");
        let mut sink = MuxSink::new(
            path.to_str().unwrap(),
            None,
            &segmenting_options(1),
            ReconnectPolicy::writer_default(),
        );
        sink.open(
            vec![SinkStream {
                kind: StreamKind::Audio,
                params: None,
            }],
            &StopSignal::default(),
        )
        .unwrap();

        for pts in (0..2_500i64).step_by(500) {
            let unit = MediaUnit::packet(
                StreamKind::Audio,
                Bytes::from_static(&[7]),
                Timestamp::from_millis(pts),
                Timestamp::from_millis(pts),
            );
            sink.push(0, &unit).unwrap();
        }
        sink.close();
        assert_eq!(sink.segments_written(), 3);
    }

    #[test]
    fn push_before_open_is_a_precondition_error() {
        let mut sink = MuxSink::new(
            "nowhere.raw",
            None,
            &BTreeMap::new(),
            ReconnectPolicy::writer_default(),
        );
        let err = sink.push(0, &video_packet(0, true, &[0])).unwrap_err();
        assert!(matches!(err, RelayError::Precondition(_)));
    }
}
