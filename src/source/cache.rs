//! Sliding window of in-flight units for one elementary stream.
//!
//! The cache is written by exactly one reader thread and drained by the
//! controller/dispatch path under its own lock. It answers "what is due
//! now", measures buffering depth for the sync policy and runs the seek
//! state machine that gates delivery after a jump.

use crate::error::RelayError;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Seek progress for one stream.
///
/// Delivery stays gated until `Complete`: the decoder is still flushing
/// stale pictures and consumers must not advance playback time on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPhase {
    /// Seek requested; nothing received since the flush
    AwaitingFirstUnit,
    /// Units arriving but still before the target
    FlushingDecoder,
    /// A unit at or past the target arrived
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct SeekState {
    phase: SeekPhase,
    target: Timestamp,
}

struct CacheInner {
    units: VecDeque<MediaUnit>,
    paused: bool,
    seek: Option<SeekState>,
    last_arrival: Instant,
    last_popped: Option<Timestamp>,
}

pub struct StreamCache {
    kind: StreamKind,
    capacity: usize,
    stall_timeout: Duration,
    /// Synchronization master flag for the owning source
    main: AtomicBool,
    evicted: AtomicU64,
    inner: Mutex<CacheInner>,
}

impl StreamCache {
    pub fn new(kind: StreamKind, capacity: usize, stall_timeout: Duration) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            stall_timeout,
            main: AtomicBool::new(false),
            evicted: AtomicU64::new(0),
            inner: Mutex::new(CacheInner {
                units: VecDeque::new(),
                paused: false,
                seek: None,
                last_arrival: Instant::now(),
                last_popped: None,
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn set_main(&self, main: bool) {
        self.main.store(main, Ordering::Relaxed);
    }

    pub fn is_main(&self) -> bool {
        self.main.load(Ordering::Relaxed)
    }

    /// Append one unit, evicting the oldest when full.
    ///
    /// Returns `false` when the unit was consumed by the seek machinery
    /// instead of being admitted to the window.
    pub fn add_unit(&self, unit: MediaUnit) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last_arrival = Instant::now();

        if let Some(seek) = &mut inner.seek {
            match seek.phase {
                SeekPhase::AwaitingFirstUnit => {
                    // First unit after the decoder flush.
                    seek.phase = if unit.pts >= seek.target {
                        SeekPhase::Complete
                    } else {
                        SeekPhase::FlushingDecoder
                    };
                }
                SeekPhase::FlushingDecoder => {
                    if unit.pts >= seek.target {
                        seek.phase = SeekPhase::Complete;
                    }
                }
                SeekPhase::Complete => {}
            }
            if seek.phase != SeekPhase::Complete {
                // Still flushing: stale picture, drop it.
                return false;
            }
            if unit.pts < seek.target {
                // Reordered leftover from before the jump.
                return false;
            }
        }

        if inner.units.len() >= self.capacity {
            inner.units.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.units.push_back(unit);
        true
    }

    /// Next unit in decode order, or `None` while empty, paused or a
    /// seek has not completed.
    pub fn pop_next(&self) -> Option<MediaUnit> {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused {
            return None;
        }
        if matches!(inner.seek, Some(s) if s.phase != SeekPhase::Complete) {
            return None;
        }
        let unit = inner.units.pop_front()?;
        inner.last_popped = Some(unit.pts);
        Some(unit)
    }

    /// Presentation time of the next unit to be consumed.
    pub fn peek_pts(&self) -> Option<Timestamp> {
        let inner = self.inner.lock().unwrap();
        if matches!(inner.seek, Some(s) if s.phase != SeekPhase::Complete) {
            return None;
        }
        inner.units.front().map(|u| u.pts)
    }

    /// Span between the newest and the next-to-be-consumed unit.
    ///
    /// Small values mean the consumer keeps up; values near the ring
    /// capacity in frame times mean runaway buffering.
    pub fn frame_diff(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        match (inner.units.front(), inner.units.back()) {
            (Some(first), Some(last)) => last.pts.diff(first.pts),
            _ => Duration::ZERO,
        }
    }

    /// Discard units older than `pts`; used after seek and reconnect.
    pub fn drop_older_than(&self, pts: Timestamp) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0;
        while matches!(inner.units.front(), Some(u) if u.pts < pts) {
            inner.units.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Drop the next unit without delivering it (drift correction).
    pub fn skip_one(&self) -> Option<Timestamp> {
        let mut inner = self.inner.lock().unwrap();
        let unit = inner.units.pop_front()?;
        inner.last_popped = Some(unit.pts);
        Some(unit.pts)
    }

    /// Arm the seek machine: clears the window and gates delivery until
    /// a unit at or past `target` arrives.
    pub fn begin_seek(&self, target: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        inner.units.clear();
        inner.seek = Some(SeekState {
            phase: SeekPhase::AwaitingFirstUnit,
            target,
        });
        inner.last_arrival = Instant::now();
    }

    pub fn seek_phase(&self) -> Option<SeekPhase> {
        self.inner.lock().unwrap().seek.map(|s| s.phase)
    }

    pub fn seek_complete(&self) -> bool {
        !matches!(
            self.inner.lock().unwrap().seek,
            Some(s) if s.phase != SeekPhase::Complete
        )
    }

    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Stall check: a non-complete seek with no arrivals inside the
    /// configured window is reported upward as an error.
    pub fn check_stall(&self) -> Option<RelayError> {
        let inner = self.inner.lock().unwrap();
        match inner.seek {
            Some(s) if s.phase != SeekPhase::Complete => {
                if inner.last_arrival.elapsed() > self.stall_timeout {
                    Some(RelayError::Stalled(format!(
                        "{} stream: no unit within {:?} after seek to {}",
                        self.kind, self.stall_timeout, s.target
                    )))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.units.clear();
        inner.seek = None;
    }

    pub fn last_popped_pts(&self) -> Option<Timestamp> {
        self.inner.lock().unwrap().last_popped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn unit(pts_ms: i64) -> MediaUnit {
        MediaUnit::video_frame(Bytes::from_static(b"x"), Timestamp::from_millis(pts_ms), 2, 2)
    }

    fn cache(capacity: usize) -> StreamCache {
        StreamCache::new(StreamKind::Video, capacity, Duration::from_millis(50))
    }

    #[test]
    fn preserves_decode_order() {
        let cache = cache(8);
        for pts in [0, 40, 80, 120] {
            assert!(cache.add_unit(unit(pts)));
        }
        let mut popped = Vec::new();
        while let Some(u) = cache.pop_next() {
            popped.push(u.pts.as_millis());
        }
        assert_eq!(popped, vec![0, 40, 80, 120]);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = cache(3);
        for pts in [0, 40, 80, 120, 160] {
            cache.add_unit(unit(pts));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evicted(), 2);
        assert_eq!(cache.pop_next().unwrap().pts.as_millis(), 80);
    }

    #[test]
    fn seek_gates_until_target() {
        let cache = cache(8);
        cache.add_unit(unit(0));
        cache.begin_seek(Timestamp::from_millis(500));
        assert_eq!(cache.seek_phase(), Some(SeekPhase::AwaitingFirstUnit));
        assert!(cache.pop_next().is_none());

        // Decoder flush output, still before the target.
        assert!(!cache.add_unit(unit(420)));
        assert_eq!(cache.seek_phase(), Some(SeekPhase::FlushingDecoder));
        assert!(cache.pop_next().is_none());
        assert!(!cache.add_unit(unit(460)));

        // First unit at/past the target completes the seek.
        assert!(cache.add_unit(unit(500)));
        assert_eq!(cache.seek_phase(), Some(SeekPhase::Complete));
        assert_eq!(cache.pop_next().unwrap().pts.as_millis(), 500);
    }

    #[test]
    fn no_unit_below_target_after_complete() {
        let cache = cache(8);
        cache.begin_seek(Timestamp::from_millis(200));
        cache.add_unit(unit(240));
        // Reordered leftover below the target must never become due.
        assert!(!cache.add_unit(unit(120)));
        cache.add_unit(unit(280));

        let mut seen = Vec::new();
        while let Some(u) = cache.pop_next() {
            seen.push(u.pts.as_millis());
        }
        assert_eq!(seen, vec![240, 280]);
    }

    #[test]
    fn first_unit_at_target_completes_immediately() {
        let cache = cache(8);
        cache.begin_seek(Timestamp::from_millis(100));
        assert!(cache.add_unit(unit(100)));
        assert_eq!(cache.seek_phase(), Some(SeekPhase::Complete));
    }

    #[test]
    fn frame_diff_spans_window() {
        let cache = cache(8);
        cache.add_unit(unit(100));
        cache.add_unit(unit(140));
        cache.add_unit(unit(180));
        assert_eq!(cache.frame_diff(), Duration::from_millis(80));
        cache.pop_next();
        assert_eq!(cache.frame_diff(), Duration::from_millis(40));
    }

    #[test]
    fn drop_older_than_removes_stale_front() {
        let cache = cache(8);
        for pts in [0, 40, 80, 120] {
            cache.add_unit(unit(pts));
        }
        assert_eq!(cache.drop_older_than(Timestamp::from_millis(80)), 2);
        assert_eq!(cache.peek_pts().unwrap().as_millis(), 80);
    }

    #[test]
    fn pause_gates_delivery() {
        let cache = cache(8);
        cache.add_unit(unit(0));
        cache.pause();
        assert!(cache.pop_next().is_none());
        cache.resume();
        assert!(cache.pop_next().is_some());
    }

    #[test]
    fn stall_reported_after_timeout() {
        let cache = cache(8);
        cache.begin_seek(Timestamp::from_millis(100));
        assert!(cache.check_stall().is_none());
        std::thread::sleep(Duration::from_millis(70));
        let err = cache.check_stall().expect("stall expected");
        assert!(matches!(err, RelayError::Stalled(_)));
    }
}
