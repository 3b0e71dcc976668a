//! Audio/video coordination for one source.
//!
//! One cache is the sync master (video unless the source is audio
//! only). The non-main stream is measured against the master's clock
//! and corrected by skipping or holding single units, never both in
//! the same decision, so correction cannot oscillate.

use crate::config::SyncTuning;
use crate::error::Result;
use crate::events::Handle;
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::source::cache::StreamCache;
use crate::source::input::StreamParams;
use crate::source::reader::SourceReader;
use crate::source::SourceState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of one sync decision on the non-main cache.
pub enum SyncAction {
    /// Unit is in tolerance, deliver it
    Deliver(MediaUnit),
    /// Unit lagged too far behind and was dropped
    Skipped(Timestamp),
    /// Unit runs ahead of the master clock, retry later
    Hold,
    /// Nothing available (empty, gated or paused)
    Empty,
}

/// Decide what to do with the next audio unit relative to the master
/// cache. At most one unit is skipped per call; holding never drops.
pub fn next_audio_action(
    main: &StreamCache,
    audio: &StreamCache,
    tuning: &SyncTuning,
) -> SyncAction {
    if audio.is_paused() {
        return SyncAction::Hold;
    }
    let Some(pts) = audio.peek_pts() else {
        return SyncAction::Empty;
    };
    let Some(anchor) = main.last_popped_pts().or_else(|| main.peek_pts()) else {
        // No master reference yet, deliver freely.
        return match audio.pop_next() {
            Some(unit) => SyncAction::Deliver(unit),
            None => SyncAction::Empty,
        };
    };

    let drift = pts.signed_diff(anchor);

    if drift < -tuning.hard_resync_micros() {
        // Way behind: flush the backlog in one step, keeping anything
        // already inside the tolerance window.
        let floor = Timestamp::from_micros(anchor.micros - tuning.max_drift_micros());
        let dropped = audio.drop_older_than(floor);
        log::warn!(
            "audio {}ms behind master, resynced by dropping {} unit(s)",
            -drift / 1_000,
            dropped
        );
        return match audio.pop_next() {
            Some(unit) => SyncAction::Deliver(unit),
            None => SyncAction::Empty,
        };
    }
    if drift < -tuning.max_drift_micros() {
        return match audio.skip_one() {
            Some(pts) => SyncAction::Skipped(pts),
            None => SyncAction::Empty,
        };
    }
    if drift > tuning.max_drift_micros() {
        return SyncAction::Hold;
    }
    match audio.pop_next() {
        Some(unit) => SyncAction::Deliver(unit),
        None => SyncAction::Empty,
    }
}

/// Owns a reader and drives pause/resume/seek across both of its
/// caches atomically, so neither stream can observe the other halfway
/// through a control change.
pub struct SourceController {
    reader: SourceReader,
    control: Mutex<()>,
    muted: AtomicBool,
}

impl SourceController {
    pub fn new(reader: SourceReader) -> Self {
        Self {
            reader,
            control: Mutex::new(()),
            muted: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> Handle {
        self.reader.handle()
    }

    pub fn state(&self) -> SourceState {
        self.reader.state()
    }

    pub fn prepare(&self) -> Result<()> {
        self.reader.prepare()
    }

    pub fn start(&self) -> Result<()> {
        self.reader.start()
    }

    pub fn disable(&self) {
        self.reader.disable();
    }

    pub fn pause(&self) {
        let _guard = self.control.lock().unwrap();
        self.reader.video_cache().pause();
        self.reader.audio_cache().pause();
    }

    pub fn resume(&self) {
        let _guard = self.control.lock().unwrap();
        self.reader.video_cache().resume();
        self.reader.audio_cache().resume();
    }

    /// Arm both caches and hand the jump to the reader. Delivery stays
    /// gated until units at or past `target` arrive on each stream.
    pub fn seek(&self, target: Timestamp) {
        let _guard = self.control.lock().unwrap();
        self.reader.video_cache().begin_seek(target);
        self.reader.audio_cache().begin_seek(target);
        self.reader.request_seek(target);
    }

    pub fn set_mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn video_cache(&self) -> &Arc<StreamCache> {
        self.reader.video_cache()
    }

    pub fn audio_cache(&self) -> &Arc<StreamCache> {
        self.reader.audio_cache()
    }

    pub fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        self.reader.descriptor(kind)
    }

    pub fn descriptors(&self) -> Vec<StreamDescriptor> {
        self.reader.descriptors()
    }

    pub fn codec_params(&self, kind: StreamKind) -> Option<StreamParams> {
        self.reader.codec_params(kind)
    }
}
