//! Still-picture source: decodes one image and re-emits it as a video
//! stream at a fixed rate with synthesized timestamps.

use crate::config::SourceConfig;
use crate::error::{RelayError, Result};
use crate::events::{EventSink, Handle};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::cache::StreamCache;
use crate::source::decode::StreamDecoder;
use crate::source::input::MediaInput;
use crate::source::{SourceState, StateCell, UnitDispatch};
use crate::utils::stop::StopSignal;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Emission rate when the caller does not ask for one.
const DEFAULT_STILL_FPS: f32 = 25.0;

pub struct StillSource {
    shared: Arc<StillShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct StillShared {
    handle: Handle,
    config: SourceConfig,
    cache: Arc<StreamCache>,
    state: StateCell,
    stop: StopSignal,
    dispatch: Arc<dyn UnitDispatch>,
    events: Arc<dyn EventSink>,
    frame: Mutex<Option<MediaUnit>>,
    descriptor: Mutex<Option<StreamDescriptor>>,
}

impl StillSource {
    pub fn new(
        handle: Handle,
        config: SourceConfig,
        dispatch: Arc<dyn UnitDispatch>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let cache = Arc::new(StreamCache::new(
            StreamKind::Video,
            config.cache_capacity,
            config.stall_timeout(),
        ));
        cache.set_main(true);
        Self {
            shared: Arc::new(StillShared {
                handle,
                config,
                cache,
                state: StateCell::new(handle, Arc::clone(&events)),
                stop: StopSignal::default(),
                dispatch,
                events,
                frame: Mutex::new(None),
                descriptor: Mutex::new(None),
            }),
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
        &self.shared.cache
    }

    pub fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        if kind != StreamKind::Video {
            return None;
        }
        self.shared.descriptor.lock().unwrap().clone()
    }

    /// Decode the picture once. The decoded frame is the template every
    /// emitted unit clones its payload from.
    pub fn prepare(&self) -> Result<()> {
        match self.state() {
            SourceState::Prepared | SourceState::Working => return Ok(()),
            SourceState::Disabled => return Err(RelayError::Closed),
            _ => {}
        }
        self.shared.state.set(SourceState::Preparing);

        match decode_first_frame(&self.shared.config) {
            Ok((frame, descriptor)) => {
                *self.shared.descriptor.lock().unwrap() = Some(descriptor);
                *self.shared.frame.lock().unwrap() = Some(frame);
                self.shared.state.set(SourceState::Prepared);
                Ok(())
            }
            Err(err) => {
                self.shared.events.notify(crate::events::RelayEvent::Error {
                    kind: err.kind(),
                    text: err.to_string(),
                });
                self.shared.state.set(SourceState::Error);
                Err(err)
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.state() == SourceState::Working {
            return Ok(());
        }
        let template = self
            .shared
            .frame
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::Precondition("still source is not prepared".into()))?;

        self.shared.state.set(SourceState::Working);
        let shared = Arc::clone(&self.shared);
        let thread = std::thread::Builder::new()
            .name(format!("still-{}", self.shared.handle))
            .spawn(move || emit_loop(shared, template))?;
        *self.worker.lock().unwrap() = Some(thread);
        Ok(())
    }

    pub fn pause(&self) {
        self.shared.cache.pause();
    }

    pub fn resume(&self) {
        self.shared.cache.resume();
    }

    pub fn disable(&self) {
        self.shared.stop.cancel();
        if let Some(thread) = self.worker.lock().unwrap().take() {
            if let Err(err) = thread.join() {
                log::error!("still {}: worker panicked: {:?}", self.shared.handle, err);
            }
        }
        self.shared.cache.clear();
        self.shared.state.set(SourceState::Disabled);
    }
}

/// Open the image container and decode until one full picture appears.
fn decode_first_frame(config: &SourceConfig) -> Result<(MediaUnit, StreamDescriptor)> {
    let mut input = MediaInput::open(config)?;
    let (video_index, mut decoder, mut descriptor) = {
        let ctx = input
            .stream_by_kind(StreamKind::Video)
            .ok_or_else(|| RelayError::Codec(format!("no picture stream in {}", config.url)))?;
        (
            ctx.index,
            StreamDecoder::for_stream(ctx)?,
            ctx.descriptor.clone(),
        )
    };

    let mut first: Option<MediaUnit> = None;
    while first.is_none() {
        match input.read()? {
            Some((index, unit)) if index == video_index => {
                first = decoder.decode(&unit)?.into_iter().next();
            }
            Some(_) => continue,
            None => {
                first = decoder.flush()?.into_iter().next();
                break;
            }
        }
    }

    let frame = first
        .ok_or_else(|| RelayError::Codec(format!("could not decode a picture from {}", config.url)))?;
    descriptor.width = frame.width;
    descriptor.height = frame.height;
    Ok((frame, descriptor))
}

fn emit_loop(shared: Arc<StillShared>, template: MediaUnit) {
    let fps = if shared.config.target_fps > 0.0 {
        shared.config.target_fps
    } else {
        DEFAULT_STILL_FPS
    };
    let started = Instant::now();
    let mut sequence: u64 = 0;
    log::info!("still {}: emitting at {:.1} fps", shared.handle, fps);

    while !shared.stop.cancelled() {
        let pts = Timestamp::from_duration(Duration::from_secs_f64(sequence as f64 / fps as f64));
        let mut unit = template.clone().with_sequence(sequence);
        unit.pts = pts;
        unit.dts = pts;
        sequence += 1;

        shared.cache.add_unit(unit);
        while let Some(due) = shared.cache.pop_next() {
            shared.dispatch.frame_update(shared.handle, &due);
        }

        let next = Duration::from_secs_f64(sequence as f64 / fps as f64);
        let elapsed = started.elapsed();
        if next > elapsed && shared.stop.wait_timeout(next - elapsed) {
            break;
        }
    }
    log::info!("still {}: emit loop done", shared.handle);
}
