//! Audio playback seam.
//!
//! The relay never talks to a sound device itself. Hosts that want the
//! preview to be audible implement [`AudioSink`] and register it on the
//! manager; decoded interleaved s16 units from the preview-bound source
//! are forwarded there, already paced and mute-gated. Everything is a
//! default no-op so a sink only implements what its backend needs.

use crate::media::unit::MediaUnit;

pub trait AudioSink: Send + Sync {
    /// One decoded audio unit: interleaved s16 samples, rate and
    /// channel count on the unit itself. Called from source threads,
    /// must not block.
    fn submit(&self, unit: &MediaUnit);

    fn pause(&self) {}

    fn resume(&self) {}

    /// Discard anything queued but not yet audible, used after seeks.
    fn drop_pending(&self) {}

    fn stop(&self) {}

    fn set_volume(&self, volume: f32) {
        let _ = volume;
    }
}

/// Default sink: discards all audio.
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn submit(&self, _unit: &MediaUnit) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::unit::Timestamp;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        submitted: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn submit(&self, _unit: &MediaUnit) {
            self.submitted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_methods_are_noops() {
        let sink = CountingSink {
            submitted: AtomicUsize::new(0),
        };
        let unit = MediaUnit::audio_frame(Bytes::from_static(&[0; 4]), Timestamp::ZERO, 48_000, 2);

        sink.submit(&unit);
        sink.pause();
        sink.resume();
        sink.drop_pending();
        sink.set_volume(0.5);
        sink.stop();

        assert_eq!(sink.submitted.load(Ordering::Relaxed), 1);
    }
}
