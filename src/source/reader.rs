//! Demux/decode worker for one network or file input.
//!
//! The reader owns the input connection and one thread. It pulls
//! container packets, optionally decodes them, stamps every unit onto a
//! continuous timeline and feeds the per-stream caches. Connection loss
//! is absorbed by the reconnect policy so downstream consumers only see
//! a monotonic stream of units.

use crate::config::SourceConfig;
use crate::error::{RelayError, Result};
use crate::events::{EventSink, Handle, RelayEvent};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::cache::StreamCache;
use crate::source::controller::{self, SyncAction};
use crate::source::decode::StreamDecoder;
use crate::source::input::{MediaInput, StreamParams};
use crate::source::{SourceState, StateCell, UnitDispatch};
use crate::utils::stop::StopSignal;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Gap inserted between the last pts of a dropped connection and the
/// first pts after reconnect, keeping the timeline strictly monotonic.
const REBASE_GAP_MICROS: i64 = 10_000;

pub struct SourceReader {
    shared: Arc<ReaderShared>,
    /// Input opened by `prepare`, consumed by `start`
    pending: Mutex<Option<MediaInput>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ReaderShared {
    handle: Handle,
    config: SourceConfig,
    video_cache: Arc<StreamCache>,
    audio_cache: Arc<StreamCache>,
    state: StateCell,
    descriptors: Mutex<Vec<StreamDescriptor>>,
    params: Mutex<Vec<(StreamKind, StreamParams)>>,
    seek_request: Mutex<Option<Timestamp>>,
    stop: StopSignal,
    dispatch: Arc<dyn UnitDispatch>,
    events: Arc<dyn EventSink>,
}

impl ReaderShared {
    fn take_seek_request(&self) -> Option<Timestamp> {
        self.seek_request.lock().unwrap().take()
    }

    fn emit_error(&self, err: &RelayError) {
        self.events.notify(RelayEvent::Error {
            kind: err.kind(),
            text: err.to_string(),
        });
    }
}

impl SourceReader {
    pub fn new(
        handle: Handle,
        config: SourceConfig,
        dispatch: Arc<dyn UnitDispatch>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let capacity = config.cache_capacity;
        let stall = config.stall_timeout();
        Self {
            shared: Arc::new(ReaderShared {
                handle,
                config,
                video_cache: Arc::new(StreamCache::new(StreamKind::Video, capacity, stall)),
                audio_cache: Arc::new(StreamCache::new(StreamKind::Audio, capacity, stall)),
                state: StateCell::new(handle, Arc::clone(&events)),
                descriptors: Mutex::new(Vec::new()),
                params: Mutex::new(Vec::new()),
                seek_request: Mutex::new(None),
                stop: StopSignal::default(),
                dispatch,
                events,
            }),
            pending: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.shared.handle
    }

    pub fn state(&self) -> SourceState {
        self.shared.state.get()
    }

    pub fn video_cache(&self) -> &Arc<StreamCache> {
        &self.shared.video_cache
    }

    pub fn audio_cache(&self) -> &Arc<StreamCache> {
        &self.shared.audio_cache
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.shared.descriptors.lock().unwrap().clone()
    }

    pub fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        self.shared
            .descriptors
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.kind == kind)
            .cloned()
    }

    /// Demuxed codec parameters for one stream, available after
    /// `prepare`. Outputs use them to mux packets without re-encoding.
    pub fn codec_params(&self, kind: StreamKind) -> Option<StreamParams> {
        self.shared
            .params
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
    }

    /// Queue a seek; the worker picks it up at its next loop turn.
    /// Cache gating must already be armed by the caller.
    pub fn request_seek(&self, target: Timestamp) {
        *self.shared.seek_request.lock().unwrap() = Some(target);
    }

    /// Open the input, enumerate streams and build the caches' view of
    /// the source. Connect failures are retried per the reconnect
    /// policy before giving up.
    pub fn prepare(&self) -> Result<()> {
        match self.state() {
            SourceState::Prepared | SourceState::Working => return Ok(()),
            SourceState::Disabled => return Err(RelayError::Closed),
            _ => {}
        }
        self.shared.state.set(SourceState::Preparing);

        let input = match connect_with_retry(&self.shared, true) {
            Ok(input) => input,
            // Cancelled by a concurrent disable: let teardown own the state.
            Err(RelayError::Closed) => return Err(RelayError::Closed),
            Err(err) => {
                self.shared.emit_error(&err);
                self.shared.state.set(SourceState::Error);
                return Err(err);
            }
        };

        adopt_streams(&self.shared, &input);
        *self.pending.lock().unwrap() = Some(input);
        self.shared.state.set(SourceState::Prepared);
        Ok(())
    }

    /// Spawn the read loop. Requires a successful `prepare`.
    pub fn start(&self) -> Result<()> {
        if self.state() == SourceState::Working {
            return Ok(());
        }
        let input = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RelayError::Precondition("source is not prepared".into()))?;

        self.shared.state.set(SourceState::Working);
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name(format!("source-{}", self.shared.handle))
            .spawn(move || run_loop(shared, input))?;
        *self.worker.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// Stop reading and join the worker. Idempotent; safe to call while
    /// a reconnect attempt is in flight.
    pub fn disable(&self) {
        self.shared.stop.cancel();
        if let Some(thread) = self.worker.lock().unwrap().take() {
            if let Err(err) = thread.join() {
                log::error!("source {}: worker panicked: {:?}", self.shared.handle, err);
            }
        }
        self.shared.video_cache.clear();
        self.shared.audio_cache.clear();
        self.shared.state.set(SourceState::Disabled);
    }
}

/// Record stream descriptors and codec parameters, pick the sync master.
fn adopt_streams(shared: &ReaderShared, input: &MediaInput) {
    let descriptors: Vec<StreamDescriptor> = input
        .streams()
        .iter()
        .map(|ctx| ctx.descriptor.clone())
        .collect();
    let params: Vec<(StreamKind, StreamParams)> = input
        .streams()
        .iter()
        .map(|ctx| (ctx.descriptor.kind, StreamParams::new(ctx.params.clone())))
        .collect();
    let has_video = descriptors.iter().any(|d| d.kind == StreamKind::Video);
    shared.video_cache.set_main(has_video);
    shared.audio_cache.set_main(!has_video);
    *shared.descriptors.lock().unwrap() = descriptors;
    *shared.params.lock().unwrap() = params;
}

/// Connect with backoff. The initial attempt is optional so mid-stream
/// reconnects wait before retrying while `prepare` tries at once. Only
/// retries are reported as reconnect outcomes.
fn connect_with_retry(shared: &ReaderShared, initial_attempt: bool) -> Result<MediaInput> {
    if initial_attempt {
        match MediaInput::open(&shared.config) {
            Ok(input) => return Ok(input),
            Err(err) => {
                log::warn!("source {}: connect failed: {}", shared.handle, err);
            }
        }
    }

    let policy = &shared.config.reconnect;
    let mut attempts: u32 = 0;
    loop {
        if shared.stop.cancelled() {
            return Err(RelayError::Closed);
        }
        if !policy.unlimited() && attempts >= policy.reconnect_count as u32 {
            return Err(RelayError::Exhausted { attempts });
        }
        attempts += 1;
        if shared.stop.wait_timeout(policy.reconnect_wait()) {
            return Err(RelayError::Closed);
        }
        match MediaInput::open(&shared.config) {
            Ok(input) => {
                log::info!(
                    "source {}: reconnected after {} attempt(s)",
                    shared.handle,
                    attempts
                );
                shared.events.notify(RelayEvent::Reconnect {
                    source: shared.handle,
                    succeeded: true,
                });
                return Ok(input);
            }
            Err(err) => {
                log::warn!(
                    "source {}: reconnect attempt {} failed: {}",
                    shared.handle,
                    attempts,
                    err
                );
                shared.events.notify(RelayEvent::Reconnect {
                    source: shared.handle,
                    succeeded: false,
                });
            }
        }
    }
}

/// Per-stream decode lane. Sequence counters survive reconnects so the
/// downstream ordering contract holds across sessions.
struct StreamLane {
    index: Option<usize>,
    decoder: Option<StreamDecoder>,
    packet_seq: u64,
    frame_seq: u64,
}

impl StreamLane {
    fn empty() -> Self {
        Self {
            index: None,
            decoder: None,
            packet_seq: 0,
            frame_seq: 0,
        }
    }

    /// Rebind to the (re)opened input, keeping the counters.
    fn bind(&mut self, shared: &ReaderShared, input: &MediaInput, kind: StreamKind) {
        let ctx = input.stream_by_kind(kind);
        self.index = ctx.map(|c| c.index);
        self.decoder = None;
        if !shared.config.notify_frames {
            return;
        }
        if let Some(ctx) = ctx {
            match StreamDecoder::for_stream(ctx) {
                Ok(decoder) => self.decoder = Some(decoder),
                Err(err) => {
                    log::error!("source {}: no {} decoder: {}", shared.handle, kind, err);
                    shared.emit_error(&err);
                }
            }
        }
    }
}

struct ReadSession {
    video: StreamLane,
    audio: StreamLane,
    /// Offset added to every raw timestamp of the current connection
    offset_micros: i64,
    /// Highest mapped pts seen, the rebase anchor for the next session
    max_pts_micros: i64,
    /// Recompute the offset from the next unit (set after reconnect)
    rebase: bool,
    started: Instant,
    decode_errors: u32,
    stall_reported: bool,
}

impl ReadSession {
    fn new(shared: &ReaderShared, input: &MediaInput) -> Self {
        let mut session = Self {
            video: StreamLane::empty(),
            audio: StreamLane::empty(),
            offset_micros: 0,
            max_pts_micros: 0,
            rebase: false,
            started: Instant::now(),
            decode_errors: 0,
            stall_reported: false,
        };
        session.video.bind(shared, input, StreamKind::Video);
        session.audio.bind(shared, input, StreamKind::Audio);
        session
    }

    fn rebind(&mut self, shared: &ReaderShared, input: &MediaInput) {
        self.video.bind(shared, input, StreamKind::Video);
        self.audio.bind(shared, input, StreamKind::Audio);
        self.rebase = true;
    }
}

fn run_loop(shared: Arc<ReaderShared>, mut input: MediaInput) {
    let mut session = ReadSession::new(&shared, &input);
    log::info!("source {}: read loop running", shared.handle);

    while !shared.stop.cancelled() {
        if let Some(target) = shared.take_seek_request() {
            if let Err(err) = apply_seek(&shared, &mut session, &mut input, target) {
                shared.emit_error(&err);
                shared.state.set(SourceState::Error);
                break;
            }
        }

        check_stalls(&shared, &mut session);

        match input.read() {
            Ok(Some((index, unit))) => {
                let unit = remap_pts(&mut session, unit);
                route_unit(&shared, &mut session, index, unit);
                drain_due(&shared);
                pace(&shared, &session);
                if session.decode_errors > shared.config.error_threshold {
                    let err = RelayError::Codec(format!(
                        "{} decode errors, stopping source",
                        session.decode_errors
                    ));
                    shared.emit_error(&err);
                    shared.state.set(SourceState::Error);
                    break;
                }
            }
            Ok(None) => {
                flush_lanes(&shared, &mut session);
                drain_due(&shared);
                if input.is_live() {
                    match resume_connection(&shared, &mut session, &mut input) {
                        true => continue,
                        false => break,
                    }
                }
                shared.state.set(SourceState::End);
                break;
            }
            Err(err) => {
                log::warn!("source {}: read failed: {}", shared.handle, err);
                if input.is_live() {
                    shared.emit_error(&err);
                    match resume_connection(&shared, &mut session, &mut input) {
                        true => continue,
                        false => break,
                    }
                } else {
                    shared.emit_error(&err);
                    shared.state.set(SourceState::Error);
                    break;
                }
            }
        }
    }
    log::info!("source {}: read loop done", shared.handle);
}

/// Map raw container timestamps onto the continuous source timeline.
fn remap_pts(session: &mut ReadSession, mut unit: MediaUnit) -> MediaUnit {
    if session.rebase {
        session.offset_micros = session.max_pts_micros + REBASE_GAP_MICROS - unit.pts.micros;
        session.rebase = false;
    }
    unit.pts = Timestamp::from_micros(unit.pts.micros + session.offset_micros);
    unit.dts = Timestamp::from_micros(unit.dts.micros + session.offset_micros);
    if unit.pts.micros > session.max_pts_micros {
        session.max_pts_micros = unit.pts.micros;
    }
    unit
}

fn route_unit(shared: &ReaderShared, session: &mut ReadSession, index: usize, unit: MediaUnit) {
    let config = &shared.config;
    let (lane, cache) = if session.video.index == Some(index) {
        (&mut session.video, &shared.video_cache)
    } else if session.audio.index == Some(index) {
        (&mut session.audio, &shared.audio_cache)
    } else {
        return;
    };

    let packet = unit.with_sequence(lane.packet_seq);
    lane.packet_seq += 1;

    if config.notify_packets && config.notify_frames {
        // Packets ride alongside the decoded flow, uncached.
        shared.dispatch.packet_update(shared.handle, &packet);
    }

    if config.notify_frames {
        let Some(decoder) = lane.decoder.as_mut() else {
            return;
        };
        match decoder.decode(&packet) {
            Ok(frames) => {
                for frame in frames {
                    let frame = frame.with_sequence(lane.frame_seq);
                    lane.frame_seq += 1;
                    cache.add_unit(frame);
                }
            }
            Err(err) => {
                session.decode_errors += 1;
                log::warn!(
                    "source {}: dropped unit after decode error: {}",
                    shared.handle,
                    err
                );
            }
        }
    } else if config.notify_packets {
        cache.add_unit(packet);
    }
}

/// Deliver everything that is due, audio gated by the sync policy.
fn drain_due(shared: &ReaderShared) {
    if shared.video_cache.is_main() {
        while let Some(unit) = shared.video_cache.pop_next() {
            dispatch_unit(shared, &unit);
        }
        loop {
            match controller::next_audio_action(
                &shared.video_cache,
                &shared.audio_cache,
                &shared.config.sync,
            ) {
                SyncAction::Deliver(unit) => dispatch_unit(shared, &unit),
                SyncAction::Skipped(pts) => {
                    log::debug!("source {}: skipped audio at {}", shared.handle, pts);
                }
                SyncAction::Hold | SyncAction::Empty => break,
            }
        }
    } else {
        // Audio-only source: the audio cache is the master clock.
        while let Some(unit) = shared.audio_cache.pop_next() {
            dispatch_unit(shared, &unit);
        }
    }
}

fn dispatch_unit(shared: &ReaderShared, unit: &MediaUnit) {
    if unit.is_frame() {
        shared.dispatch.frame_update(shared.handle, unit);
    } else {
        shared.dispatch.packet_update(shared.handle, unit);
    }
}

/// Keep file playback near the configured rate instead of draining the
/// container at disk speed. Live inputs pace themselves.
fn pace(shared: &ReaderShared, session: &ReadSession) {
    let fps = shared.config.target_fps;
    if fps <= 0.0 || session.video.frame_seq == 0 {
        return;
    }
    let target = Duration::from_secs_f64(session.video.frame_seq as f64 / fps);
    let elapsed = session.started.elapsed();
    if target > elapsed {
        shared.stop.wait_timeout(target - elapsed);
    }
}

fn check_stalls(shared: &ReaderShared, session: &mut ReadSession) {
    if session.stall_reported {
        return;
    }
    let stalled = shared
        .video_cache
        .check_stall()
        .or_else(|| shared.audio_cache.check_stall());
    if let Some(err) = stalled {
        log::warn!("source {}: {}", shared.handle, err);
        shared.emit_error(&err);
        session.stall_reported = true;
    }
}

/// Flush decoder tails into the caches (end of input or before a jump).
fn flush_lanes(shared: &ReaderShared, session: &mut ReadSession) {
    for (lane, cache) in [
        (&mut session.video, &shared.video_cache),
        (&mut session.audio, &shared.audio_cache),
    ] {
        let Some(decoder) = lane.decoder.as_mut() else {
            continue;
        };
        match decoder.flush() {
            Ok(frames) => {
                for frame in frames {
                    let frame = frame.with_sequence(lane.frame_seq);
                    lane.frame_seq += 1;
                    cache.add_unit(frame);
                }
            }
            Err(err) => log::debug!("source {}: flush: {}", shared.handle, err),
        }
    }
}

/// Reopen after a dropped connection. Returns false when the loop must
/// exit (cancelled or retries exhausted).
fn resume_connection(
    shared: &ReaderShared,
    session: &mut ReadSession,
    input: &mut MediaInput,
) -> bool {
    match connect_with_retry(shared, false) {
        Ok(new_input) => {
            adopt_streams(shared, &new_input);
            session.rebind(shared, &new_input);
            *input = new_input;
            true
        }
        Err(RelayError::Closed) => false,
        Err(err) => {
            shared.emit_error(&err);
            shared.state.set(SourceState::Error);
            false
        }
    }
}

/// Discard decoder state and, for files, restart the demuxer so the
/// target position can be reached. The caches stay gated until a unit
/// at or past the target arrives.
fn apply_seek(
    shared: &ReaderShared,
    session: &mut ReadSession,
    input: &mut MediaInput,
    target: Timestamp,
) -> Result<()> {
    log::debug!("source {}: seek to {}", shared.handle, target);
    for lane in [&mut session.video, &mut session.audio] {
        if let Some(decoder) = lane.decoder.as_mut() {
            // Flush output is pre-jump material, drop it.
            let _ = decoder.flush()?;
        }
    }
    if !input.is_live() {
        *input = MediaInput::open(&shared.config)?;
        session.video.bind(shared, input, StreamKind::Video);
        session.audio.bind(shared, input, StreamKind::Audio);
    }
    session.stall_reported = false;
    Ok(())
}
