//! Registry and fan-out hub tying sources to outputs.
//!
//! One manager owns every source and output in the process. Sources
//! deliver units to the manager's dispatcher from their worker threads;
//! the dispatcher fans each unit out to the outputs attached to that
//! source. Frame and packet deliveries hold separate gates so a slow
//! packet consumer never stalls decoded pictures, and a stopping output
//! drops units at its own door instead of blocking siblings.
//!
//! Handles are process-unique and never reused; sources and outputs
//! share one number space starting at 100.

use crate::audio::{AudioSink, NullAudioSink};
use crate::config::{OutputConfig, SourceConfig};
use crate::error::{RelayError, Result};
use crate::events::{EventHub, EventSink, Handle, RelayEvent};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::output::raw::UnitCallback;
use crate::output::{
    Output, OutputState, PreviewFrame, PreviewSink, RawCallbackSink, SourceStream, WriterOutput,
};
use crate::source::{
    PushSource, Source, SourceController, SourceReader, SourceState, StillSource, UnitDispatch,
};
use crate::{logging, media::unit::PayloadKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// First handle ever allocated.
const FIRST_HANDLE: Handle = 100;

struct SourceEntry {
    source: Source,
    fanout: Arc<FanOut>,
}

struct OutputEntry {
    source: Handle,
    output: Arc<Output>,
}

/// Per-source delivery table. Membership changes are rare; deliveries
/// iterate a snapshot so registration never waits on a slow output.
#[derive(Default)]
struct FanOut {
    outputs: Mutex<Vec<Arc<Output>>>,
    frame_gate: Mutex<()>,
    packet_gate: Mutex<()>,
}

impl FanOut {
    fn snapshot(&self) -> Vec<Arc<Output>> {
        self.outputs.lock().unwrap().clone()
    }

    fn attach(&self, output: Arc<Output>) {
        self.outputs.lock().unwrap().push(output);
    }

    fn detach(&self, handle: Handle) {
        self.outputs.lock().unwrap().retain(|o| o.handle() != handle);
    }
}

/// The half of the manager that source threads talk to. Split out so
/// sources can hold it without keeping the whole registry alive.
struct Dispatcher {
    fanouts: RwLock<HashMap<Handle, Arc<FanOut>>>,
    audio: Mutex<Arc<dyn AudioSink>>,
    /// Source whose decoded audio feeds the audio sink; 0 when unset
    audio_source: AtomicU32,
    audio_muted: AtomicBool,
}

impl Dispatcher {
    fn fanout(&self, source: Handle) -> Option<Arc<FanOut>> {
        self.fanouts.read().unwrap().get(&source).cloned()
    }

    fn audio_sink(&self) -> Arc<dyn AudioSink> {
        Arc::clone(&*self.audio.lock().unwrap())
    }
}

impl UnitDispatch for Dispatcher {
    fn frame_update(&self, source: Handle, unit: &MediaUnit) {
        if unit.kind == StreamKind::Audio
            && unit.payload == PayloadKind::Frame
            && self.audio_source.load(Ordering::Relaxed) == source
            && !self.audio_muted.load(Ordering::Relaxed)
        {
            self.audio_sink().submit(unit);
        }
        let Some(fanout) = self.fanout(source) else {
            return;
        };
        let _gate = fanout.frame_gate.lock().unwrap();
        for output in fanout.snapshot() {
            if !output.is_dependent() {
                output.frame_update(unit);
            }
        }
    }

    fn packet_update(&self, source: Handle, unit: &MediaUnit) {
        let Some(fanout) = self.fanout(source) else {
            return;
        };
        let _gate = fanout.packet_gate.lock().unwrap();
        for output in fanout.snapshot() {
            if !output.is_dependent() {
                output.packet_update(unit);
            }
        }
    }
}

pub struct StreamManager {
    registry: Mutex<HashMap<Handle, SourceEntry>>,
    outputs: Mutex<HashMap<Handle, OutputEntry>>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventHub>,
    /// Single preview slot, movable between sources
    preview: Mutex<Option<Arc<PreviewSink>>>,
    next_handle: AtomicU32,
}

impl StreamManager {
    pub fn new() -> Self {
        logging::init_default();
        Self {
            registry: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(Dispatcher {
                fanouts: RwLock::new(HashMap::new()),
                audio: Mutex::new(Arc::new(NullAudioSink)),
                audio_source: AtomicU32::new(0),
                audio_muted: AtomicBool::new(false),
            }),
            events: Arc::new(EventHub::new()),
            preview: Mutex::new(None),
            next_handle: AtomicU32::new(FIRST_HANDLE),
        }
    }

    /// Route all events to `sink`, replacing whatever was installed.
    /// Takes effect for components created earlier too.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.set(sink);
    }

    pub fn set_audio_sink(&self, sink: Arc<dyn AudioSink>) {
        *self.dispatcher.audio.lock().unwrap() = sink;
    }

    fn alloc(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn events_sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events) as Arc<dyn EventSink>
    }

    fn dispatch(&self) -> Arc<dyn UnitDispatch> {
        Arc::clone(&self.dispatcher) as Arc<dyn UnitDispatch>
    }

    // ---- sources ------------------------------------------------------

    /// Open a demuxed file/network source. Blocks for the initial
    /// connect; retries are left to `start`.
    pub fn add_source(&self, config: SourceConfig) -> Result<Handle> {
        let handle = self.alloc();
        let source = Source::Stream(SourceController::new(SourceReader::new(
            handle,
            config,
            self.dispatch(),
            self.events_sink(),
        )));
        self.register_source(handle, source)
    }

    /// Create a source fed by [`StreamManager::push_unit`]. Streams are
    /// declared up front so outputs can bind before data flows.
    pub fn add_push_source(
        &self,
        config: SourceConfig,
        streams: &[StreamDescriptor],
    ) -> Result<Handle> {
        let handle = self.alloc();
        let source = PushSource::new(handle, config, self.dispatch(), self.events_sink());
        for descriptor in streams {
            source.declare_stream(descriptor.clone());
        }
        self.register_source(handle, Source::Push(source))
    }

    /// Create a source that repeats one decoded picture at a fixed rate.
    pub fn add_still_source(&self, config: SourceConfig) -> Result<Handle> {
        let handle = self.alloc();
        let source = Source::Still(StillSource::new(
            handle,
            config,
            self.dispatch(),
            self.events_sink(),
        ));
        self.register_source(handle, source)
    }

    fn register_source(&self, handle: Handle, source: Source) -> Result<Handle> {
        source.prepare()?;
        let fanout = Arc::new(FanOut::default());
        self.dispatcher
            .fanouts
            .write()
            .unwrap()
            .insert(handle, Arc::clone(&fanout));
        self.registry
            .lock()
            .unwrap()
            .insert(handle, SourceEntry { source, fanout });
        log::info!("source {handle} registered");
        Ok(handle)
    }

    pub fn start(&self, source: Handle) -> Result<()> {
        self.with_source(source, |s| s.start())?
    }

    pub fn pause(&self, source: Handle) -> Result<()> {
        self.with_source(source, |s| s.pause())
    }

    pub fn resume(&self, source: Handle) -> Result<()> {
        self.with_source(source, |s| s.resume())
    }

    /// Jump delivery to `target`. Pending audio playback is dropped so
    /// the sink does not finish the old position first.
    pub fn seek(&self, source: Handle, target: Timestamp) -> Result<()> {
        self.with_source(source, |s| s.seek(target))?;
        if self.dispatcher.audio_source.load(Ordering::Relaxed) == source {
            self.dispatcher.audio_sink().drop_pending();
        }
        Ok(())
    }

    /// Mute or unmute audible playback. Outputs keep receiving audio.
    pub fn set_mute(&self, source: Handle, muted: bool) -> Result<()> {
        self.with_source(source, |s| s.set_mute(muted))?;
        if self.dispatcher.audio_source.load(Ordering::Relaxed) == source {
            self.dispatcher.audio_muted.store(muted, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn source_state(&self, source: Handle) -> Result<SourceState> {
        self.with_source(source, |s| s.state())
    }

    pub fn push_unit(&self, source: Handle, unit: MediaUnit) -> Result<()> {
        self.with_source(source, |s| s.push_unit(unit))?
    }

    /// Mark a pushed feed complete.
    pub fn finish_push(&self, source: Handle) -> Result<()> {
        self.with_source(source, |s| s.finish())
    }

    /// Tear one source down: its outputs are stopped and removed, the
    /// reader joined. Blocks until everything is gone.
    pub fn delete_source(&self, source: Handle) -> Result<()> {
        let entry = self
            .registry
            .lock()
            .unwrap()
            .remove(&source)
            .ok_or(RelayError::InvalidHandle(source))?;
        self.dispatcher.fanouts.write().unwrap().remove(&source);

        let removed: Vec<Arc<Output>> = {
            let mut outputs = self.outputs.lock().unwrap();
            let handles: Vec<Handle> = outputs
                .iter()
                .filter(|(_, e)| e.source == source)
                .map(|(h, _)| *h)
                .collect();
            handles
                .into_iter()
                .filter_map(|h| outputs.remove(&h))
                .map(|e| e.output)
                .collect()
        };
        for output in &removed {
            output.stop();
        }
        entry.source.disable();

        {
            let mut preview = self.preview.lock().unwrap();
            if let Some(sink) = preview.as_ref()
                && removed.iter().any(|o| o.handle() == sink.handle())
            {
                preview.take();
            }
        }
        if self.dispatcher.audio_source.load(Ordering::Relaxed) == source {
            self.dispatcher.audio_source.store(0, Ordering::Relaxed);
        }
        log::info!("source {source} deleted");
        Ok(())
    }

    fn with_source<T>(
        &self,
        source: Handle,
        f: impl FnOnce(&Source) -> T,
    ) -> Result<T> {
        let registry = self.registry.lock().unwrap();
        let entry = registry
            .get(&source)
            .ok_or(RelayError::InvalidHandle(source))?;
        Ok(f(&entry.source))
    }

    // ---- outputs ------------------------------------------------------

    /// Register a recording/streaming writer on `source`. The writer
    /// stays idle until [`StreamManager::play_output`].
    pub fn add_output(&self, source: Handle, config: OutputConfig) -> Result<Handle> {
        let fanout = self
            .dispatcher
            .fanout(source)
            .ok_or(RelayError::InvalidHandle(source))?;
        let handle = self.alloc();
        let writer = Arc::new(WriterOutput::new(handle, config, self.events_sink()));
        self.register_output(source, handle, Output::Writer(writer), &fanout);
        Ok(handle)
    }

    /// Register a writer driven by `primary` instead of the fan-out.
    /// It mirrors the primary's format options and lifecycle.
    pub fn add_dependent_output(&self, primary: Handle, config: OutputConfig) -> Result<Handle> {
        let (source, primary_writer) = {
            let outputs = self.outputs.lock().unwrap();
            let entry = outputs
                .get(&primary)
                .ok_or(RelayError::InvalidHandle(primary))?;
            let Output::Writer(writer) = entry.output.as_ref() else {
                return Err(RelayError::Precondition(
                    "dependent outputs require a writer primary".into(),
                ));
            };
            if writer.is_dependent() {
                return Err(RelayError::Precondition(
                    "dependent writers cannot chain".into(),
                ));
            }
            (entry.source, Arc::clone(writer))
        };
        let fanout = self
            .dispatcher
            .fanout(source)
            .ok_or(RelayError::InvalidHandle(source))?;
        let handle = self.alloc();
        let dependent = Arc::new(WriterOutput::new_dependent(
            handle,
            config,
            self.events_sink(),
        ));
        primary_writer.attach_dependent(Arc::clone(&dependent));
        self.register_output(source, handle, Output::Writer(dependent), &fanout);
        Ok(handle)
    }

    /// Register the preview on `source`. There is exactly one preview
    /// slot; it can be moved with [`StreamManager::set_preview_source`].
    pub fn add_preview(&self, source: Handle) -> Result<Handle> {
        if self.preview.lock().unwrap().is_some() {
            return Err(RelayError::Precondition(
                "preview slot already in use".into(),
            ));
        }
        let fanout = self
            .dispatcher
            .fanout(source)
            .ok_or(RelayError::InvalidHandle(source))?;
        let handle = self.alloc();
        let sink = Arc::new(PreviewSink::new(handle, self.events_sink()));
        *self.preview.lock().unwrap() = Some(Arc::clone(&sink));
        self.dispatcher.audio_source.store(source, Ordering::Relaxed);
        let muted = self.with_source(source, |s| s.is_muted()).unwrap_or(false);
        self.dispatcher.audio_muted.store(muted, Ordering::Relaxed);
        self.register_output(source, handle, Output::Preview(sink), &fanout);
        Ok(handle)
    }

    /// Register a callback tap receiving every unit `source` delivers.
    pub fn add_raw_output(&self, source: Handle, callback: UnitCallback) -> Result<Handle> {
        let fanout = self
            .dispatcher
            .fanout(source)
            .ok_or(RelayError::InvalidHandle(source))?;
        let handle = self.alloc();
        let sink = RawCallbackSink::new(handle, self.events_sink(), callback);
        self.register_output(source, handle, Output::Raw(sink), &fanout);
        Ok(handle)
    }

    fn register_output(&self, source: Handle, handle: Handle, output: Output, fanout: &FanOut) {
        let output = Arc::new(output);
        fanout.attach(Arc::clone(&output));
        self.outputs
            .lock()
            .unwrap()
            .insert(handle, OutputEntry { source, output });
        log::info!("output {handle} registered on source {source}");
    }

    /// Bind an output to its source's streams and start consuming.
    pub fn play_output(&self, output: Handle) -> Result<()> {
        let (source, out) = self.output_entry(output)?;
        let (video, audio) = {
            let registry = self.registry.lock().unwrap();
            let entry = registry
                .get(&source)
                .ok_or(RelayError::InvalidHandle(source))?;
            (
                bind_stream(&entry.source, StreamKind::Video),
                bind_stream(&entry.source, StreamKind::Audio),
            )
        };
        out.play(video, audio)
    }

    /// Stop one output. It stays registered so its state remains
    /// queryable; `delete_source` removes it for good.
    pub fn stop_output(&self, output: Handle) -> Result<()> {
        let (_, out) = self.output_entry(output)?;
        out.stop();
        Ok(())
    }

    pub fn pause_output(&self, output: Handle) -> Result<()> {
        let (_, out) = self.output_entry(output)?;
        out.pause();
        Ok(())
    }

    pub fn resume_output(&self, output: Handle) -> Result<()> {
        let (_, out) = self.output_entry(output)?;
        out.resume();
        Ok(())
    }

    pub fn output_state(&self, output: Handle) -> Result<OutputState> {
        let (_, out) = self.output_entry(output)?;
        Ok(out.state())
    }

    /// Set a container format option on a writer. Mirrored into its
    /// dependent; applied when the destination (re)opens.
    pub fn set_output_option(&self, output: Handle, key: &str, value: &str) -> Result<()> {
        let (_, out) = self.output_entry(output)?;
        match out.as_ref() {
            Output::Writer(writer) => {
                writer.set_format_option(key, value);
                Ok(())
            }
            _ => Err(RelayError::Precondition(
                "format options apply to writers only".into(),
            )),
        }
    }

    /// Current format-option dictionary of a writer.
    pub fn output_format_options(
        &self,
        output: Handle,
    ) -> Result<std::collections::BTreeMap<String, String>> {
        let (_, out) = self.output_entry(output)?;
        match out.as_ref() {
            Output::Writer(writer) => Ok(writer.format_options()),
            _ => Err(RelayError::Precondition(
                "format options apply to writers only".into(),
            )),
        }
    }

    fn output_entry(&self, output: Handle) -> Result<(Handle, Arc<Output>)> {
        let outputs = self.outputs.lock().unwrap();
        let entry = outputs
            .get(&output)
            .ok_or(RelayError::InvalidHandle(output))?;
        Ok((entry.source, Arc::clone(&entry.output)))
    }

    // ---- preview ------------------------------------------------------

    /// Move the preview (and audible audio) to another source.
    pub fn set_preview_source(&self, source: Handle) -> Result<()> {
        let sink = self
            .preview
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| RelayError::Precondition("no preview registered".into()))?;
        let target = self
            .dispatcher
            .fanout(source)
            .ok_or(RelayError::InvalidHandle(source))?;

        let fanouts: Vec<Arc<FanOut>> = self
            .dispatcher
            .fanouts
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for fanout in fanouts {
            fanout.detach(sink.handle());
        }

        let out = {
            let mut outputs = self.outputs.lock().unwrap();
            let entry = outputs
                .get_mut(&sink.handle())
                .ok_or(RelayError::InvalidHandle(sink.handle()))?;
            entry.source = source;
            Arc::clone(&entry.output)
        };
        target.attach(out);

        let descriptor = self.with_source(source, |s| s.descriptor(StreamKind::Video))?;
        sink.rebind(descriptor);
        self.dispatcher.audio_source.store(source, Ordering::Relaxed);
        let muted = self.with_source(source, |s| s.is_muted()).unwrap_or(false);
        self.dispatcher.audio_muted.store(muted, Ordering::Relaxed);
        log::info!("preview moved to source {source}");
        Ok(())
    }

    /// The next preview picture, if a new one arrived since last call.
    pub fn display_due(&self) -> Option<PreviewFrame> {
        let sink = self.preview.lock().unwrap().clone()?;
        sink.display_due()
    }

    // ---- teardown -----------------------------------------------------

    /// Stop every output, disable every source and clear the registry.
    /// Blocks until all worker threads have joined.
    pub fn force_stop(&self) {
        log::info!("force stop");
        let outputs: Vec<Arc<Output>> = {
            let mut map = self.outputs.lock().unwrap();
            map.drain().map(|(_, e)| e.output).collect()
        };
        for output in &outputs {
            output.stop();
        }
        let sources: Vec<SourceEntry> = {
            let mut map = self.registry.lock().unwrap();
            map.drain().map(|(_, e)| e).collect()
        };
        self.dispatcher.fanouts.write().unwrap().clear();
        for entry in &sources {
            entry.source.disable();
        }
        self.preview.lock().unwrap().take();
        self.dispatcher.audio_source.store(0, Ordering::Relaxed);
        self.dispatcher.audio_sink().stop();
        self.events.notify(RelayEvent::ForceStop);
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.force_stop();
    }
}

fn bind_stream(source: &Source, kind: StreamKind) -> Option<SourceStream> {
    source.descriptor(kind).map(|descriptor| SourceStream {
        params: source.codec_params(kind),
        descriptor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::media::picture;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn video_stream() -> StreamDescriptor {
        StreamDescriptor::empty(StreamKind::Video)
    }

    fn audio_stream() -> StreamDescriptor {
        StreamDescriptor::empty(StreamKind::Audio)
    }

    fn video_packet(pts_ms: i64, payload: &[u8]) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Video,
            Bytes::copy_from_slice(payload),
            Timestamp::from_millis(pts_ms),
            Timestamp::from_millis(pts_ms),
        )
        .with_keyframe(true)
    }

    fn video_frame(pts_ms: i64, width: u32, height: u32) -> MediaUnit {
        let data = vec![0u8; picture::packed_size(width as usize, height as usize)];
        MediaUnit::video_frame(Bytes::from(data), Timestamp::from_millis(pts_ms), width, height)
    }

    fn audio_frame(pts_ms: i64) -> MediaUnit {
        MediaUnit::audio_frame(
            Bytes::from_static(&[0; 192]),
            Timestamp::from_millis(pts_ms),
            48_000,
            2,
        )
    }

    struct CountingAudioSink {
        submitted: AtomicUsize,
    }

    impl CountingAudioSink {
        fn new() -> Self {
            Self {
                submitted: AtomicUsize::new(0),
            }
        }

        fn count(&self) -> usize {
            self.submitted.load(Ordering::Relaxed)
        }
    }

    impl AudioSink for CountingAudioSink {
        fn submit(&self, _unit: &MediaUnit) {
            self.submitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn handles_start_at_one_hundred_and_never_repeat() {
        let manager = StreamManager::new();
        let first = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        let second = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 101);
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let manager = StreamManager::new();
        assert!(matches!(
            manager.start(999),
            Err(RelayError::InvalidHandle(999))
        ));
        assert!(matches!(
            manager.play_output(999),
            Err(RelayError::InvalidHandle(999))
        ));
        assert!(matches!(
            manager.push_unit(999, video_packet(0, &[0])),
            Err(RelayError::InvalidHandle(999))
        ));
    }

    #[test]
    fn pushed_units_fan_out_and_a_stopped_output_stays_isolated() {
        let manager = StreamManager::new();
        let source = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        manager.start(source).unwrap();

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let capture_a = Arc::clone(&seen_a);
        let capture_b = Arc::clone(&seen_b);
        let out_a = manager
            .add_raw_output(
                source,
                Box::new(move |unit| capture_a.lock().unwrap().push(unit.sequence)),
            )
            .unwrap();
        let out_b = manager
            .add_raw_output(
                source,
                Box::new(move |unit| capture_b.lock().unwrap().push(unit.sequence)),
            )
            .unwrap();
        manager.play_output(out_a).unwrap();
        manager.play_output(out_b).unwrap();

        for i in 0..5 {
            manager
                .push_unit(source, video_packet(i * 40, &[i as u8]))
                .unwrap();
        }
        manager.stop_output(out_a).unwrap();
        for i in 5..8 {
            manager
                .push_unit(source, video_packet(i * 40, &[i as u8]))
                .unwrap();
        }

        assert_eq!(*seen_a.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*seen_b.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(manager.output_state(out_a).unwrap(), OutputState::Closed);
        assert_eq!(manager.output_state(out_b).unwrap(), OutputState::Working);
    }

    #[test]
    fn preview_slot_is_exclusive_and_movable() {
        let manager = StreamManager::new();
        let first = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        let second = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        manager.start(first).unwrap();
        manager.start(second).unwrap();

        let preview = manager.add_preview(first).unwrap();
        assert!(matches!(
            manager.add_preview(second),
            Err(RelayError::Precondition(_))
        ));
        manager.play_output(preview).unwrap();

        manager.push_unit(first, video_frame(0, 32, 32)).unwrap();
        assert!(manager.display_due().is_some());
        assert!(manager.display_due().is_none());

        manager.set_preview_source(second).unwrap();
        manager.push_unit(first, video_frame(40, 32, 32)).unwrap();
        assert!(manager.display_due().is_none());
        manager.push_unit(second, video_frame(40, 32, 32)).unwrap();
        assert!(manager.display_due().is_some());
    }

    #[test]
    fn mute_gates_audible_audio_but_not_outputs() {
        let manager = StreamManager::new();
        let audio = Arc::new(CountingAudioSink::new());
        manager.set_audio_sink(audio.clone());

        let source = manager
            .add_push_source(SourceConfig::default(), &[audio_stream()])
            .unwrap();
        manager.start(source).unwrap();
        let _preview = manager.add_preview(source).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let out = manager
            .add_raw_output(
                source,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
        manager.play_output(out).unwrap();

        manager.push_unit(source, audio_frame(0)).unwrap();
        assert_eq!(audio.count(), 1);

        manager.set_mute(source, true).unwrap();
        manager.push_unit(source, audio_frame(20)).unwrap();
        assert_eq!(audio.count(), 1);

        manager.set_mute(source, false).unwrap();
        manager.push_unit(source, audio_frame(40)).unwrap();
        assert_eq!(audio.count(), 2);

        // The raw output saw every unit regardless of mute.
        assert_eq!(delivered.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn delete_source_stops_and_removes_attached_outputs() {
        let manager = StreamManager::new();
        let events = Arc::new(RecordingEventSink::new());
        manager.set_event_sink(events.clone());

        let source = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        manager.start(source).unwrap();
        let out = manager
            .add_raw_output(source, Box::new(|_| {}))
            .unwrap();
        manager.play_output(out).unwrap();

        manager.delete_source(source).unwrap();

        assert!(matches!(
            manager.source_state(source),
            Err(RelayError::InvalidHandle(_))
        ));
        assert!(matches!(
            manager.output_state(out),
            Err(RelayError::InvalidHandle(_))
        ));
        assert_eq!(
            events.output_states(out),
            vec![OutputState::Working, OutputState::Stop, OutputState::Closed]
        );
    }

    #[test]
    fn dependent_outputs_require_a_primary_writer() {
        let manager = StreamManager::new();
        let source = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();

        let raw = manager.add_raw_output(source, Box::new(|_| {})).unwrap();
        assert!(matches!(
            manager.add_dependent_output(raw, OutputConfig::new("d.mkv")),
            Err(RelayError::Precondition(_))
        ));

        let primary = manager
            .add_output(source, OutputConfig::new("p.mkv"))
            .unwrap();
        let dependent = manager
            .add_dependent_output(primary, OutputConfig::new("d.mkv"))
            .unwrap();
        assert!(matches!(
            manager.add_dependent_output(dependent, OutputConfig::new("e.mkv")),
            Err(RelayError::Precondition(_))
        ));
        assert_eq!(
            manager.output_state(dependent).unwrap(),
            OutputState::None
        );
    }

    #[test]
    fn force_stop_disables_everything_and_notifies() {
        let manager = StreamManager::new();
        let events = Arc::new(RecordingEventSink::new());
        manager.set_event_sink(events.clone());

        let source = manager
            .add_push_source(SourceConfig::default(), &[video_stream()])
            .unwrap();
        manager.start(source).unwrap();
        let out = manager.add_raw_output(source, Box::new(|_| {})).unwrap();
        manager.play_output(out).unwrap();

        manager.force_stop();

        assert!(matches!(
            manager.source_state(source),
            Err(RelayError::InvalidHandle(_))
        ));
        let recorded = events.events();
        assert!(recorded.iter().any(|e| matches!(e, RelayEvent::ForceStop)));
        assert!(events
            .source_states(source)
            .ends_with(&[SourceState::Disabled]));
    }
}
