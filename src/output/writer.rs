//! Recording/streaming writer: one worker thread consuming buffered
//! units from a source, encoding or passing through per stream, and
//! driving a container destination.
//!
//! Each stream lane decides its mode at bind time when it can. Demuxed
//! sources with matching codecs pass packets straight through; codec
//! overrides and overlays force a re-encode; synthetic sources leave
//! the decision to the first unit that arrives. The destination opens
//! once every lane knows its codec parameters, packets produced before
//! that wait in a bounded staging queue.

use crate::config::{OutputConfig, OPT_RESET_TIMESTAMPS, OPT_SEGMENT_TIME};
use crate::error::{RelayError, Result};
use crate::events::{EventSink, Handle, RelayEvent};
use crate::filter::stage::{FilterStage, OverlayStage, ResampleStage, ScaleStage};
use crate::filter::FilterPipeline;
use crate::media::descriptor::StreamDescriptor;
use crate::media::ring::PushResult;
use crate::media::unit::{MediaUnit, PayloadKind, StreamKind};
use crate::output::buffer::InputBuffer;
use crate::output::bsf::BitstreamChain;
use crate::output::encode::StreamEncoder;
use crate::output::sink::{MuxSink, SinkStream};
use crate::output::{OutputState, OutputStateCell, SourceStream};
use crate::source::input::StreamParams;
use crate::utils::stop::StopSignal;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll interval while paused.
const WAIT_POLL: Duration = Duration::from_millis(20);
/// Poll interval when every ring is empty.
const IDLE_POLL: Duration = Duration::from_millis(5);
/// Packets held back while the destination is not open yet.
const STAGING_LIMIT: usize = 100;

pub struct WriterOutput {
    shared: Arc<WriterShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dependent: Mutex<Option<Arc<WriterOutput>>>,
    is_dependent: bool,
}

struct WriterShared {
    handle: Handle,
    config: OutputConfig,
    /// Live format-option dictionary; snapshot taken when play opens
    /// the destination
    options: Mutex<BTreeMap<String, String>>,
    state: OutputStateCell,
    buffer: InputBuffer,
    stop: StopSignal,
    events: Arc<dyn EventSink>,
}

impl WriterOutput {
    pub fn new(handle: Handle, config: OutputConfig, events: Arc<dyn EventSink>) -> Self {
        Self::build(handle, config, events, false)
    }

    /// A dependent writer is driven by its primary instead of the
    /// source fan-out and mirrors the primary's format options.
    pub fn new_dependent(handle: Handle, config: OutputConfig, events: Arc<dyn EventSink>) -> Self {
        Self::build(handle, config, events, true)
    }

    fn build(
        handle: Handle,
        config: OutputConfig,
        events: Arc<dyn EventSink>,
        is_dependent: bool,
    ) -> Self {
        let capacity = config.buffer_capacity;
        let silent = config.silent_stop;
        let options = config.options.clone();
        Self {
            shared: Arc::new(WriterShared {
                handle,
                config,
                options: Mutex::new(options),
                state: OutputStateCell::new(handle, Arc::clone(&events), silent),
                buffer: InputBuffer::new(capacity),
                stop: StopSignal::default(),
                events,
            }),
            worker: Mutex::new(None),
            dependent: Mutex::new(None),
            is_dependent,
        }
    }

    pub fn handle(&self) -> Handle {
        self.shared.handle
    }

    pub fn state(&self) -> OutputState {
        self.shared.state.get()
    }

    pub fn is_dependent(&self) -> bool {
        self.is_dependent
    }

    /// Attach a dependent writer. It inherits the current format
    /// options and every later option change.
    pub fn attach_dependent(&self, dependent: Arc<WriterOutput>) {
        for (key, value) in self.format_options() {
            dependent.set_format_option(&key, &value);
        }
        *self.dependent.lock().unwrap() = Some(dependent);
    }

    pub fn dependent_handle(&self) -> Option<Handle> {
        self.dependent.lock().unwrap().as_ref().map(|d| d.handle())
    }

    /// Set one format option, pairing `segment_time` with timestamp
    /// resets and mirroring the change into the dependent writer.
    pub fn set_format_option(&self, key: &str, value: &str) {
        {
            let mut options = self.shared.options.lock().unwrap();
            options.insert(key.to_string(), value.to_string());
            if key == OPT_SEGMENT_TIME && !options.contains_key(OPT_RESET_TIMESTAMPS) {
                options.insert(OPT_RESET_TIMESTAMPS.to_string(), "1".to_string());
            }
        }
        if self.state() != OutputState::None {
            log::debug!(
                "output {}: option {key} takes effect on the next play",
                self.shared.handle
            );
        }
        if let Some(dependent) = self.dependent.lock().unwrap().as_ref() {
            dependent.set_format_option(key, value);
        }
    }

    pub fn format_options(&self) -> BTreeMap<String, String> {
        self.shared.options.lock().unwrap().clone()
    }

    /// Bind to the source streams and start the worker. Calling play on
    /// a running writer is a no-op; a stopped writer cannot restart.
    pub fn play(&self, video: Option<SourceStream>, audio: Option<SourceStream>) -> Result<()> {
        match self.state() {
            OutputState::None => {}
            OutputState::Working | OutputState::Wait => return Ok(()),
            _ => return Err(RelayError::Precondition("output already stopped".into())),
        }
        if video.is_none() && audio.is_none() {
            return Err(RelayError::Precondition(
                "output needs at least one stream".into(),
            ));
        }

        let (lanes, stages) = build_lanes(&self.shared.config, video.as_ref(), audio.as_ref());
        let pipeline = if stages.is_empty() {
            None
        } else {
            Some(FilterPipeline::new(
                format!("out-{}", self.shared.handle),
                stages,
            )?)
        };
        let sink = {
            let options = self.shared.options.lock().unwrap();
            MuxSink::new(
                &self.shared.config.url,
                self.shared.config.format.as_deref(),
                &options,
                self.shared.config.reconnect.clone(),
            )
        };

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            lanes,
            pipeline,
            sink,
            staging: VecDeque::new(),
            sink_dead: false,
        };
        let thread = std::thread::Builder::new()
            .name(format!("writer-{}", self.shared.handle))
            .spawn(move || worker.run())?;
        *self.worker.lock().unwrap() = Some(thread);
        self.shared.state.set(OutputState::Working);

        if let Some(dependent) = self.dependent.lock().unwrap().as_ref()
            && let Err(err) = dependent.play(video, audio)
        {
            log::error!(
                "dependent output {} failed to start: {err}",
                dependent.handle()
            );
        }
        Ok(())
    }

    /// Hold writing; buffers keep filling and overflow drops oldest.
    pub fn pause(&self) {
        if self.shared.state.set(OutputState::Wait) {
            log::info!("output {} paused", self.shared.handle);
        }
        if let Some(dependent) = self.dependent.lock().unwrap().as_ref() {
            dependent.pause();
        }
    }

    pub fn resume(&self) {
        if self.shared.state.set(OutputState::Working) {
            log::info!("output {} resumed", self.shared.handle);
        }
        if let Some(dependent) = self.dependent.lock().unwrap().as_ref() {
            dependent.resume();
        }
    }

    /// Stop, flush the tail and join the worker. Idempotent; a writer
    /// that never played goes straight to `Closed`.
    pub fn stop(&self) {
        self.shared.state.set(OutputState::Stop);
        self.shared.stop.cancel();
        self.shared.buffer.close();
        if let Some(thread) = self.worker.lock().unwrap().take()
            && thread.join().is_err()
        {
            log::error!("output {}: worker panicked", self.shared.handle);
        }
        self.shared.state.set(OutputState::Closed);
        if let Some(dependent) = self.dependent.lock().unwrap().take() {
            dependent.stop();
        }
    }

    pub fn frame_update(&self, unit: &MediaUnit) {
        self.push_unit(unit);
    }

    pub fn packet_update(&self, unit: &MediaUnit) {
        self.push_unit(unit);
    }

    fn push_unit(&self, unit: &MediaUnit) {
        if !self.shared.state.get().admits_units() {
            return;
        }
        if let PushResult::Evicted = self.shared.buffer.push(unit.clone()) {
            log::trace!("output {}: buffer full, dropped oldest", self.shared.handle);
        }
        if let Some(dependent) = self.dependent.lock().unwrap().as_ref() {
            dependent.push_unit(unit);
        }
    }
}

impl Drop for WriterOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How a lane turns units into muxable packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaneMode {
    /// Synthetic source, first unit decides
    Pending,
    /// Source packets go to the destination unchanged
    Passthrough,
    /// Frames run through the encoder
    Encode,
}

struct Lane {
    kind: StreamKind,
    stream_index: usize,
    target: StreamDescriptor,
    params: Option<StreamParams>,
    mode: LaneMode,
    encoder: Option<StreamEncoder>,
    chain: Option<BitstreamChain>,
    /// Pass-through video holds units back until the first keyframe
    saw_keyframe: bool,
    errors: u32,
    pending: Option<MediaUnit>,
}

impl Lane {
    fn new(
        kind: StreamKind,
        stream_index: usize,
        target: StreamDescriptor,
        params: Option<StreamParams>,
        mode: LaneMode,
    ) -> Self {
        Self {
            kind,
            stream_index,
            target,
            params,
            mode,
            encoder: None,
            chain: None,
            saw_keyframe: false,
            errors: 0,
            pending: None,
        }
    }

    /// Whether the lane can contribute its stream to the destination.
    fn ready(&self) -> bool {
        match self.mode {
            LaneMode::Pending => false,
            LaneMode::Passthrough => true,
            LaneMode::Encode => self.encoder.is_some(),
        }
    }

    fn sink_params(&self) -> Option<StreamParams> {
        match self.mode {
            LaneMode::Passthrough => self.params.clone(),
            LaneMode::Encode => self
                .encoder
                .as_ref()
                .map(|e| StreamParams::new(e.codec_parameters())),
            LaneMode::Pending => None,
        }
    }
}

/// Resolve targets and modes for the declared stream set, collecting
/// the filter stages the video/audio paths need.
fn build_lanes(
    config: &OutputConfig,
    video: Option<&SourceStream>,
    audio: Option<&SourceStream>,
) -> (Vec<Lane>, Vec<Box<dyn FilterStage>>) {
    let mut lanes = Vec::new();
    let mut stages: Vec<Box<dyn FilterStage>> = Vec::new();

    if let Some(stream) = video {
        let target = config.video.resolve(&stream.descriptor);
        let mode = if stream.params.is_none() {
            if config.video.is_empty() && config.overlay.is_none() {
                LaneMode::Pending
            } else {
                LaneMode::Encode
            }
        } else if target.needs_transcode(&stream.descriptor) || config.overlay.is_some() {
            LaneMode::Encode
        } else {
            LaneMode::Passthrough
        };
        if mode == LaneMode::Encode {
            if let (Some(width), Some(height)) = (target.width, target.height)
                && (stream.descriptor.width != Some(width)
                    || stream.descriptor.height != Some(height))
            {
                stages.push(Box::new(ScaleStage::new(width, height)));
            }
            if let Some(overlay) = &config.overlay {
                stages.push(Box::new(OverlayStage::new(overlay.clone())));
            }
        }
        lanes.push(Lane::new(
            StreamKind::Video,
            0,
            target,
            stream.params.clone(),
            mode,
        ));
    }

    if let Some(stream) = audio {
        let target = config.audio.resolve(&stream.descriptor);
        let mode = if stream.params.is_none() {
            if config.audio.is_empty() {
                LaneMode::Pending
            } else {
                LaneMode::Encode
            }
        } else if target.needs_transcode(&stream.descriptor) {
            LaneMode::Encode
        } else {
            LaneMode::Passthrough
        };
        if mode == LaneMode::Encode
            && let (Some(rate), Some(channels)) = (target.sample_rate, target.channels)
            && (stream.descriptor.sample_rate != Some(rate)
                || stream.descriptor.channels != Some(channels))
        {
            stages.push(Box::new(ResampleStage::new(rate, channels as u16)));
        }
        let stream_index = lanes.len();
        lanes.push(Lane::new(
            StreamKind::Audio,
            stream_index,
            target,
            stream.params.clone(),
            mode,
        ));
    }

    (lanes, stages)
}

struct Worker {
    shared: Arc<WriterShared>,
    lanes: Vec<Lane>,
    pipeline: Option<FilterPipeline>,
    sink: MuxSink,
    /// Packets emitted before the destination opened
    staging: VecDeque<(usize, MediaUnit)>,
    /// Set when opening the destination failed for good; the open
    /// already ran its own reconnect schedule
    sink_dead: bool,
}

impl Worker {
    fn run(mut self) {
        log::info!("output {}: writer running", self.shared.handle);
        let mut failed = false;

        'main: while !self.shared.stop.cancelled() {
            if self.shared.state.get() == OutputState::Wait {
                self.shared.stop.wait_timeout(WAIT_POLL);
                continue;
            }

            let mut progressed = false;
            while let Some((lane_index, unit)) = self.next_unit() {
                progressed = true;
                if let Err(err) = self.process_unit(lane_index, unit) {
                    if self.note_error(lane_index, err) {
                        failed = true;
                        break 'main;
                    }
                }
            }

            let filtered = match &self.pipeline {
                Some(pipeline) => pipeline.drain(),
                None => Vec::new(),
            };
            for unit in filtered {
                progressed = true;
                let kind = unit.kind;
                if let Err(err) = self.process_filtered(unit) {
                    if let Some(lane_index) = self.lane_index(kind)
                        && self.note_error(lane_index, err)
                    {
                        failed = true;
                        break 'main;
                    }
                }
            }

            if !progressed && self.shared.stop.wait_timeout(IDLE_POLL) {
                break;
            }
        }

        self.teardown(failed);
        log::info!("output {}: writer done", self.shared.handle);
    }

    fn lane_index(&self, kind: StreamKind) -> Option<usize> {
        self.lanes.iter().position(|lane| lane.kind == kind)
    }

    /// Pull the oldest buffered unit across lanes, by pts.
    fn next_unit(&mut self) -> Option<(usize, MediaUnit)> {
        for lane in &mut self.lanes {
            if lane.pending.is_some() {
                continue;
            }
            lane.pending = match lane.mode {
                LaneMode::Encode => self.shared.buffer.try_pop(lane.kind, PayloadKind::Frame),
                LaneMode::Passthrough => {
                    self.shared.buffer.try_pop(lane.kind, PayloadKind::Packet)
                }
                LaneMode::Pending => self
                    .shared
                    .buffer
                    .try_pop(lane.kind, PayloadKind::Packet)
                    .or_else(|| self.shared.buffer.try_pop(lane.kind, PayloadKind::Frame)),
            };
        }
        let mut best: Option<usize> = None;
        for (index, lane) in self.lanes.iter().enumerate() {
            let Some(unit) = &lane.pending else { continue };
            match best {
                None => best = Some(index),
                Some(current) if unit.pts < self.lanes[current].pending.as_ref().unwrap().pts => {
                    best = Some(index)
                }
                _ => {}
            }
        }
        best.map(|index| (index, self.lanes[index].pending.take().unwrap()))
    }

    fn process_unit(&mut self, lane_index: usize, unit: MediaUnit) -> Result<()> {
        let mode = self.lanes[lane_index].mode;
        match (unit.payload, mode) {
            (PayloadKind::Frame, LaneMode::Pending) => {
                self.lanes[lane_index].mode = LaneMode::Encode;
                log::debug!(
                    "output {}: {} lane encodes frames",
                    self.shared.handle,
                    unit.kind
                );
                self.process_frame(lane_index, unit)
            }
            (PayloadKind::Frame, LaneMode::Encode) => self.process_frame(lane_index, unit),
            (PayloadKind::Packet, LaneMode::Pending) => {
                self.lanes[lane_index].mode = LaneMode::Passthrough;
                log::debug!(
                    "output {}: {} lane passes packets through",
                    self.shared.handle,
                    unit.kind
                );
                self.process_packet(lane_index, unit)
            }
            (PayloadKind::Packet, LaneMode::Passthrough) => self.process_packet(lane_index, unit),
            // The other stream flavor of a decided lane is not consumed.
            _ => Ok(()),
        }
    }

    fn process_frame(&mut self, lane_index: usize, unit: MediaUnit) -> Result<()> {
        if let Some(pipeline) = &self.pipeline {
            if let PushResult::Evicted = pipeline.push(unit) {
                log::trace!("output {}: filter backlog, dropped oldest", self.shared.handle);
            }
            return Ok(());
        }
        self.encode_and_emit(lane_index, unit)
    }

    /// Pipeline output lands back on its lane's encoder.
    fn process_filtered(&mut self, unit: MediaUnit) -> Result<()> {
        let Some(lane_index) = self.lane_index(unit.kind) else {
            return Ok(());
        };
        if self.lanes[lane_index].mode != LaneMode::Encode {
            return Ok(());
        }
        self.encode_and_emit(lane_index, unit)
    }

    fn encode_and_emit(&mut self, lane_index: usize, unit: MediaUnit) -> Result<()> {
        let stale = matches!(&self.lanes[lane_index].encoder, Some(encoder) if !encoder.matches(&unit));
        if stale {
            log::info!(
                "output {}: {} format changed, reopening encoder",
                self.shared.handle,
                self.lanes[lane_index].kind
            );
            let tail = self.lanes[lane_index]
                .encoder
                .take()
                .unwrap()
                .flush()
                .unwrap_or_else(|err| {
                    log::debug!("encoder tail flush: {err}");
                    Vec::new()
                });
            self.emit_packets(lane_index, tail)?;
        }
        if self.lanes[lane_index].encoder.is_none() {
            let mut target = self.lanes[lane_index].target.clone();
            fill_target_from_unit(&mut target, &unit);
            self.lanes[lane_index].encoder = Some(StreamEncoder::for_target(&target)?);
        }
        let packets = self.lanes[lane_index].encoder.as_mut().unwrap().encode(&unit)?;
        self.emit_packets(lane_index, packets)
    }

    fn process_packet(&mut self, lane_index: usize, unit: MediaUnit) -> Result<()> {
        {
            let lane = &mut self.lanes[lane_index];
            if lane.kind == StreamKind::Video && !lane.saw_keyframe {
                if !unit.is_keyframe {
                    return Ok(());
                }
                lane.saw_keyframe = true;
            }
        }
        self.emit_packets(lane_index, vec![unit])
    }

    fn emit_packets(&mut self, lane_index: usize, packets: Vec<MediaUnit>) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        if self.lanes[lane_index].chain.is_none() {
            let lane = &self.lanes[lane_index];
            let specs = match lane.kind {
                StreamKind::Video => self.shared.config.bsf.clone(),
                StreamKind::Audio => Vec::new(),
            };
            let params = lane.sink_params();
            let chain =
                BitstreamChain::build(&specs, params.as_ref().map(|p| p.get()), lane.kind)?;
            self.lanes[lane_index].chain = Some(chain);
        }

        let stream_index = self.lanes[lane_index].stream_index;
        let mut ready = Vec::new();
        {
            let chain = self.lanes[lane_index].chain.as_mut().unwrap();
            for packet in &packets {
                ready.extend(chain.push(packet)?);
            }
        }
        for unit in ready {
            self.queue_to_sink(stream_index, unit)?;
        }
        Ok(())
    }

    fn queue_to_sink(&mut self, stream_index: usize, unit: MediaUnit) -> Result<()> {
        if !self.sink.is_open() {
            if self.sink_dead {
                return Err(RelayError::Precondition("destination unavailable".into()));
            }
            if self.lanes.iter().all(Lane::ready) {
                let streams = self
                    .lanes
                    .iter()
                    .map(|lane| SinkStream {
                        kind: lane.kind,
                        params: lane.sink_params(),
                    })
                    .collect();
                if let Err(err) = self.sink.open(streams, &self.shared.stop) {
                    self.sink_dead = true;
                    return Err(err);
                }
                while let Some((index, staged)) = self.staging.pop_front() {
                    self.sink.push(index, &staged)?;
                }
            } else {
                self.staging.push_back((stream_index, unit));
                if self.staging.len() > STAGING_LIMIT {
                    self.staging.pop_front();
                }
                return Ok(());
            }
        }
        self.sink.push(stream_index, &unit)
    }

    /// Count one lane failure; past the threshold the writer errors out.
    fn note_error(&mut self, lane_index: usize, err: RelayError) -> bool {
        if self.sink_dead {
            self.shared.events.notify(RelayEvent::Error {
                kind: err.kind(),
                text: format!("output {}: {err}", self.shared.handle),
            });
            self.shared.state.set(OutputState::Error);
            return true;
        }
        let lane = &mut self.lanes[lane_index];
        lane.errors += 1;
        log::warn!(
            "output {}: {} unit dropped ({}/{}): {err}",
            self.shared.handle,
            lane.kind,
            lane.errors,
            self.shared.config.error_threshold
        );
        if lane.errors <= self.shared.config.error_threshold {
            return false;
        }
        self.shared.events.notify(RelayEvent::Error {
            kind: err.kind(),
            text: format!("output {}: {err}", self.shared.handle),
        });
        self.shared.state.set(OutputState::Error);
        true
    }

    fn teardown(&mut self, failed: bool) {
        if !failed {
            // Drain what the rings still hold.
            while let Some((lane_index, unit)) = self.next_unit() {
                if let Err(err) = self.process_unit(lane_index, unit) {
                    log::debug!("output {}: drain: {err}", self.shared.handle);
                    break;
                }
            }
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
            for unit in pipeline.drain() {
                if let Err(err) = self.process_filtered(unit) {
                    log::debug!("output {}: filter drain: {err}", self.shared.handle);
                }
            }
        }
        for lane_index in 0..self.lanes.len() {
            if let Some(mut encoder) = self.lanes[lane_index].encoder.take() {
                match encoder.flush() {
                    Ok(packets) => {
                        if let Err(err) = self.emit_packets(lane_index, packets) {
                            log::debug!("output {}: encoder tail: {err}", self.shared.handle);
                        }
                    }
                    Err(err) => log::debug!("output {}: encoder flush: {err}", self.shared.handle),
                }
            }
        }
        for lane_index in 0..self.lanes.len() {
            let tail = match self.lanes[lane_index].chain.as_mut() {
                Some(chain) => chain.flush().unwrap_or_else(|err| {
                    log::debug!("output {}: bsf flush: {err}", self.shared.handle);
                    Vec::new()
                }),
                None => Vec::new(),
            };
            let stream_index = self.lanes[lane_index].stream_index;
            for unit in tail {
                if let Err(err) = self.queue_to_sink(stream_index, unit) {
                    log::debug!("output {}: bsf tail: {err}", self.shared.handle);
                    break;
                }
            }
        }
        if !self.staging.is_empty() {
            log::warn!(
                "output {}: destination never opened, {} unit(s) not written",
                self.shared.handle,
                self.staging.len()
            );
        }
        if let Err(err) = self.sink.flush() {
            log::warn!("output {}: final flush: {err}", self.shared.handle);
        }
        self.sink.close();
    }
}

/// Finalize a lazily-built target from the first unit of the lane.
fn fill_target_from_unit(target: &mut StreamDescriptor, unit: &MediaUnit) {
    if target.width.is_none() {
        target.width = unit.width;
    }
    if target.height.is_none() {
        target.height = unit.height;
    }
    if target.sample_rate.is_none() {
        target.sample_rate = unit.sample_rate;
    }
    if target.channels.is_none() {
        target.channels = unit.channels.map(u32::from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OPT_STRFTIME;
    use crate::events::RecordingEventSink;
    use crate::media::unit::Timestamp;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn raw_packet(pts_ms: i64, key: bool, data: &[u8]) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Video,
            Bytes::copy_from_slice(data),
            Timestamp::from_millis(pts_ms),
            Timestamp::from_millis(pts_ms),
        )
        .with_keyframe(key)
    }

    fn pending_video_stream() -> SourceStream {
        SourceStream::new(StreamDescriptor::empty(StreamKind::Video))
    }

    #[test]
    fn stop_before_play_goes_straight_to_closed() {
        let events = Arc::new(RecordingEventSink::new());
        let writer = WriterOutput::new(300, OutputConfig::new("unused.raw"), events.clone());

        writer.stop();
        writer.stop();

        assert_eq!(writer.state(), OutputState::Closed);
        assert_eq!(events.output_states(300), vec![OutputState::Closed]);
    }

    #[test]
    fn play_requires_at_least_one_stream() {
        let writer = WriterOutput::new(
            301,
            OutputConfig::new("unused.raw"),
            Arc::new(RecordingEventSink::new()),
        );
        assert!(matches!(
            writer.play(None, None),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn raw_passthrough_reaches_the_destination_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap.raw");
        let events = Arc::new(RecordingEventSink::new());
        let writer = WriterOutput::new(
            302,
            OutputConfig::new(path.to_str().unwrap()),
            events.clone(),
        );

        writer.play(Some(pending_video_stream()), None).unwrap();
        for i in 0..10u8 {
            writer.packet_update(&raw_packet(i as i64 * 40, true, &[i]));
        }
        writer.stop();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            (0..10u8).collect::<Vec<u8>>()
        );
        assert_eq!(
            events.output_states(302),
            vec![OutputState::Working, OutputState::Stop, OutputState::Closed]
        );
    }

    #[test]
    fn second_play_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.raw");
        let events = Arc::new(RecordingEventSink::new());
        let writer = WriterOutput::new(
            303,
            OutputConfig::new(path.to_str().unwrap()),
            events.clone(),
        );

        writer.play(Some(pending_video_stream()), None).unwrap();
        writer.play(Some(pending_video_stream()), None).unwrap();
        writer.stop();

        let working = events
            .output_states(303)
            .into_iter()
            .filter(|s| *s == OutputState::Working)
            .count();
        assert_eq!(working, 1);
    }

    #[test]
    fn units_before_the_first_keyframe_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.raw");
        let writer = WriterOutput::new(
            304,
            OutputConfig::new(path.to_str().unwrap()),
            Arc::new(RecordingEventSink::new()),
        );

        writer.play(Some(pending_video_stream()), None).unwrap();
        writer.packet_update(&raw_packet(0, false, &[1]));
        writer.packet_update(&raw_packet(40, false, &[2]));
        writer.packet_update(&raw_packet(80, true, &[3]));
        writer.packet_update(&raw_packet(120, false, &[4]));
        writer.stop();

        assert_eq!(std::fs::read(&path).unwrap(), vec![3, 4]);
    }

    #[test]
    fn pause_holds_and_resume_recovers_every_unit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pause.raw");
        let events = Arc::new(RecordingEventSink::new());
        let writer = WriterOutput::new(
            305,
            OutputConfig::new(path.to_str().unwrap()),
            events.clone(),
        );

        writer.play(Some(pending_video_stream()), None).unwrap();
        writer.packet_update(&raw_packet(0, true, &[0]));
        writer.pause();
        assert_eq!(writer.state(), OutputState::Wait);
        for i in 1..8u8 {
            writer.packet_update(&raw_packet(i as i64 * 40, true, &[i]));
        }
        writer.resume();
        writer.stop();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            (0..8u8).collect::<Vec<u8>>()
        );
        assert_eq!(
            events.output_states(305),
            vec![
                OutputState::Working,
                OutputState::Wait,
                OutputState::Working,
                OutputState::Stop,
                OutputState::Closed
            ]
        );
    }

    #[test]
    fn dependent_mirrors_segment_options() {
        let events = Arc::new(RecordingEventSink::new());
        let primary = WriterOutput::new(306, OutputConfig::new("a.mkv"), events.clone());
        let dependent = Arc::new(WriterOutput::new_dependent(
            307,
            OutputConfig::new("b.mkv"),
            events,
        ));
        primary.attach_dependent(Arc::clone(&dependent));

        primary.set_format_option(OPT_SEGMENT_TIME, "10");

        for writer in [&primary, dependent.as_ref()] {
            let options = writer.format_options();
            assert_eq!(options.get(OPT_SEGMENT_TIME).map(String::as_str), Some("10"));
            assert_eq!(
                options.get(OPT_RESET_TIMESTAMPS).map(String::as_str),
                Some("1")
            );
        }
        assert!(dependent.is_dependent());
        assert_eq!(primary.dependent_handle(), Some(307));
    }

    #[test]
    fn segmented_raw_recording_rolls_by_pts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.raw");
        let mut config = OutputConfig::new(path.to_str().unwrap());
        config.options.insert(OPT_SEGMENT_TIME.into(), "10".into());
        config.options.insert(OPT_RESET_TIMESTAMPS.into(), "1".into());
        config.options.insert(OPT_STRFTIME.into(), "0".into());
        let writer = WriterOutput::new(308, config, Arc::new(RecordingEventSink::new()));

        writer.play(Some(pending_video_stream()), None).unwrap();
        // 25 seconds, a keyframe every 5: segments cut at 10s and 20s.
        for second in 0..25i64 {
            let key = second % 5 == 0;
            writer.packet_update(&raw_packet(second * 1_000, key, &[second as u8]));
            // Keep the producer ahead of ring capacity.
            if second % 8 == 7 {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        writer.stop();

        let first = std::fs::read(dir.path().join("rec-000.raw")).unwrap();
        let second = std::fs::read(dir.path().join("rec-001.raw")).unwrap();
        let third = std::fs::read(dir.path().join("rec-002.raw")).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert_eq!(third.len(), 5);
    }
}
