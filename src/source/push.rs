//! Host-pushed source: the embedding application produces units on its
//! own threads (browser view, capture hook, test driver) and this type
//! gives them the same cache gating and fan-out as demuxed inputs.

use crate::config::SourceConfig;
use crate::error::{RelayError, Result};
use crate::events::{EventSink, Handle};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::cache::StreamCache;
use crate::source::{SourceState, StateCell, UnitDispatch};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct PushSource {
    handle: Handle,
    video_cache: Arc<StreamCache>,
    audio_cache: Arc<StreamCache>,
    state: StateCell,
    dispatch: Arc<dyn UnitDispatch>,
    muted: AtomicBool,
    video_seq: AtomicU64,
    audio_seq: AtomicU64,
    video_descriptor: Mutex<Option<StreamDescriptor>>,
    audio_descriptor: Mutex<Option<StreamDescriptor>>,
}

impl PushSource {
    pub fn new(
        handle: Handle,
        config: SourceConfig,
        dispatch: Arc<dyn UnitDispatch>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let video_cache = Arc::new(StreamCache::new(
            StreamKind::Video,
            config.cache_capacity,
            config.stall_timeout(),
        ));
        video_cache.set_main(true);
        let audio_cache = Arc::new(StreamCache::new(
            StreamKind::Audio,
            config.cache_capacity,
            config.stall_timeout(),
        ));
        Self {
            handle,
            video_cache,
            audio_cache,
            state: StateCell::new(handle, events),
            dispatch,
            muted: AtomicBool::new(false),
            video_seq: AtomicU64::new(0),
            audio_seq: AtomicU64::new(0),
            video_descriptor: Mutex::new(None),
            audio_descriptor: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> SourceState {
        self.state.get()
    }

    pub fn video_cache(&self) -> &Arc<StreamCache> {
        &self.video_cache
    }

    pub fn audio_cache(&self) -> &Arc<StreamCache> {
        &self.audio_cache
    }

    pub fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        match kind {
            StreamKind::Video => self.video_descriptor.lock().unwrap().clone(),
            StreamKind::Audio => self.audio_descriptor.lock().unwrap().clone(),
        }
    }

    /// Nothing to open; the handshake exists so pushed sources follow
    /// the same lifecycle as demuxed ones.
    pub fn prepare(&self) -> Result<()> {
        match self.state.get() {
            SourceState::Prepared | SourceState::Working => return Ok(()),
            SourceState::Disabled => return Err(RelayError::Closed),
            _ => {}
        }
        self.state.set(SourceState::Preparing);
        self.state.set(SourceState::Prepared);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        if self.state.get() == SourceState::Working {
            return Ok(());
        }
        if self.state.get() != SourceState::Prepared {
            return Err(RelayError::Precondition("push source is not prepared".into()));
        }
        self.state.set(SourceState::Working);
        Ok(())
    }

    /// Accept one unit on the caller's thread: stamp a sequence number,
    /// run it through the cache gate and fan out whatever became due.
    pub fn push_unit(&self, unit: MediaUnit) -> Result<()> {
        if self.state.get() != SourceState::Working {
            return Err(RelayError::Precondition(format!(
                "push source {} is not working",
                self.handle
            )));
        }

        let (cache, seq) = match unit.kind {
            StreamKind::Video => (&self.video_cache, &self.video_seq),
            StreamKind::Audio => (&self.audio_cache, &self.audio_seq),
        };
        let unit = unit.with_sequence(seq.fetch_add(1, Ordering::Relaxed));
        self.note_descriptor(&unit);
        cache.add_unit(unit);

        for cache in [&self.video_cache, &self.audio_cache] {
            while let Some(due) = cache.pop_next() {
                if due.is_frame() {
                    self.dispatch.frame_update(self.handle, &due);
                } else {
                    self.dispatch.packet_update(self.handle, &due);
                }
            }
        }
        Ok(())
    }

    /// Signal normal end of the pushed stream.
    pub fn finish(&self) {
        self.state.set(SourceState::End);
    }

    /// Declare a stream before any unit is pushed, so outputs can bind
    /// against its shape up front.
    pub fn declare_stream(&self, descriptor: StreamDescriptor) {
        let slot = match descriptor.kind {
            StreamKind::Video => &self.video_descriptor,
            StreamKind::Audio => &self.audio_descriptor,
        };
        *slot.lock().unwrap() = Some(descriptor);
    }

    pub fn pause(&self) {
        self.video_cache.pause();
        self.audio_cache.pause();
    }

    pub fn resume(&self) {
        self.video_cache.resume();
        self.audio_cache.resume();
    }

    /// Gate delivery until pushed units reach `target`.
    pub fn seek(&self, target: Timestamp) {
        self.video_cache.begin_seek(target);
        self.audio_cache.begin_seek(target);
    }

    pub fn set_mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.video_cache.clear();
        self.audio_cache.clear();
        self.state.set(SourceState::Disabled);
    }

    /// Track stream parameters from the units themselves; pushed
    /// sources have no container to enumerate.
    fn note_descriptor(&self, unit: &MediaUnit) {
        match unit.kind {
            StreamKind::Video => {
                let mut slot = self.video_descriptor.lock().unwrap();
                let descriptor =
                    slot.get_or_insert_with(|| StreamDescriptor::empty(StreamKind::Video));
                if unit.width.is_some() {
                    descriptor.width = unit.width;
                }
                if unit.height.is_some() {
                    descriptor.height = unit.height;
                }
            }
            StreamKind::Audio => {
                let mut slot = self.audio_descriptor.lock().unwrap();
                let descriptor =
                    slot.get_or_insert_with(|| StreamDescriptor::empty(StreamKind::Audio));
                if unit.sample_rate.is_some() {
                    descriptor.sample_rate = unit.sample_rate;
                }
                if unit.channels.is_some() {
                    descriptor.channels = unit.channels;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use bytes::Bytes;

    struct CountingDispatch {
        frames: Mutex<Vec<i64>>,
        packets: Mutex<Vec<i64>>,
    }

    impl CountingDispatch {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                packets: Mutex::new(Vec::new()),
            }
        }
    }

    impl UnitDispatch for CountingDispatch {
        fn frame_update(&self, _source: Handle, unit: &MediaUnit) {
            self.frames.lock().unwrap().push(unit.pts.as_millis());
        }
        fn packet_update(&self, _source: Handle, unit: &MediaUnit) {
            self.packets.lock().unwrap().push(unit.pts.as_millis());
        }
    }

    fn source(dispatch: Arc<CountingDispatch>) -> PushSource {
        PushSource::new(
            42,
            SourceConfig::default(),
            dispatch,
            Arc::new(RecordingEventSink::new()),
        )
    }

    fn frame(pts_ms: i64) -> MediaUnit {
        MediaUnit::video_frame(Bytes::from_static(b"f"), Timestamp::from_millis(pts_ms), 4, 4)
    }

    #[test]
    fn push_requires_working_state() {
        let dispatch = Arc::new(CountingDispatch::new());
        let src = source(dispatch);
        assert!(matches!(
            src.push_unit(frame(0)),
            Err(RelayError::Precondition(_))
        ));
    }

    #[test]
    fn pushed_frames_are_dispatched_in_order() {
        let dispatch = Arc::new(CountingDispatch::new());
        let src = source(Arc::clone(&dispatch));
        src.prepare().unwrap();
        src.start().unwrap();

        for pts in [0, 40, 80] {
            src.push_unit(frame(pts)).unwrap();
        }
        assert_eq!(*dispatch.frames.lock().unwrap(), vec![0, 40, 80]);
    }

    #[test]
    fn pause_holds_units_until_resume() {
        let dispatch = Arc::new(CountingDispatch::new());
        let src = source(Arc::clone(&dispatch));
        src.prepare().unwrap();
        src.start().unwrap();

        src.pause();
        src.push_unit(frame(0)).unwrap();
        src.push_unit(frame(40)).unwrap();
        assert!(dispatch.frames.lock().unwrap().is_empty());

        src.resume();
        src.push_unit(frame(80)).unwrap();
        assert_eq!(*dispatch.frames.lock().unwrap(), vec![0, 40, 80]);
    }

    #[test]
    fn seek_gates_delivery_until_target() {
        let dispatch = Arc::new(CountingDispatch::new());
        let src = source(Arc::clone(&dispatch));
        src.prepare().unwrap();
        src.start().unwrap();

        src.seek(Timestamp::from_millis(1_000));
        src.push_unit(frame(900)).unwrap();
        assert!(dispatch.frames.lock().unwrap().is_empty());
        src.push_unit(frame(1_000)).unwrap();
        src.push_unit(frame(1_040)).unwrap();
        assert_eq!(*dispatch.frames.lock().unwrap(), vec![1_000, 1_040]);
    }

    #[test]
    fn finish_then_push_is_rejected() {
        let dispatch = Arc::new(CountingDispatch::new());
        let src = source(Arc::clone(&dispatch));
        src.prepare().unwrap();
        src.start().unwrap();
        src.push_unit(frame(0)).unwrap();
        src.finish();
        assert_eq!(src.state(), SourceState::End);
        assert!(src.push_unit(frame(40)).is_err());
    }

    #[test]
    fn disable_is_idempotent() {
        let events = Arc::new(RecordingEventSink::new());
        let src = PushSource::new(
            43,
            SourceConfig::default(),
            Arc::new(CountingDispatch::new()),
            events.clone(),
        );
        src.disable();
        src.disable();
        let disabled = events
            .source_states(43)
            .into_iter()
            .filter(|s| *s == SourceState::Disabled)
            .count();
        assert_eq!(disabled, 1);
    }
}
