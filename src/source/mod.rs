//! Media sources: demuxed network/file streams, still images and
//! host-pushed units, all behind one lifecycle contract.

pub mod cache;
pub mod controller;
pub mod decode;
pub mod input;
pub mod push;
pub mod reader;
pub mod still;

pub use cache::{SeekPhase, StreamCache};
pub use controller::SourceController;
pub use push::PushSource;
pub use reader::SourceReader;
pub use still::StillSource;

use crate::events::{EventSink, Handle, RelayEvent};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    /// Created, nothing opened yet
    Empty,
    /// Connect/open in progress (includes reconnect backoff)
    Preparing,
    /// Streams enumerated, caches ready, not yet reading
    Prepared,
    /// Read loop delivering units
    Working,
    /// Unrecoverable failure, worker has stopped
    Error,
    /// Input ran out normally
    End,
    /// Torn down, threads joined
    Disabled,
}

impl SourceState {
    /// Legal state-machine edges. `Disabled` is reachable from anywhere
    /// so teardown always wins; `Error` from every live state.
    pub fn can_transition_to(self, next: SourceState) -> bool {
        use SourceState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (_, Disabled) => true,
            (Empty, Preparing) => true,
            (Preparing, Prepared) | (Preparing, Error) => true,
            (Prepared, Working) => true,
            (Working, Error) | (Working, End) => true,
            // A failed or finished source may be prepared again.
            (Error, Preparing) | (End, Preparing) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SourceState::Disabled)
    }

    pub fn is_running(self) -> bool {
        matches!(self, SourceState::Working)
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceState::Empty => "empty",
            SourceState::Preparing => "preparing",
            SourceState::Prepared => "prepared",
            SourceState::Working => "working",
            SourceState::Error => "error",
            SourceState::End => "end",
            SourceState::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle cell: validates transitions and reports each one
/// through the event sink. One per source, shared with its worker.
pub(crate) struct StateCell {
    handle: Handle,
    state: Mutex<SourceState>,
    events: Arc<dyn EventSink>,
}

impl StateCell {
    pub(crate) fn new(handle: Handle, events: Arc<dyn EventSink>) -> Self {
        Self {
            handle,
            state: Mutex::new(SourceState::Empty),
            events,
        }
    }

    pub(crate) fn get(&self) -> SourceState {
        *self.state.lock().unwrap()
    }

    /// Apply a transition if the state machine allows it. Returns
    /// whether the transition happened (and was reported).
    pub(crate) fn set(&self, next: SourceState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == next || !state.can_transition_to(next) {
                return false;
            }
            log::debug!("source {}: {} -> {}", self.handle, *state, next);
            *state = next;
        }
        self.events.notify(RelayEvent::SourceState {
            source: self.handle,
            state: next,
        });
        true
    }
}

/// Fan-out entry points a source calls for every admitted unit.
///
/// Implemented by the manager; invoked from the source's worker thread
/// (or the caller's thread for pushed units).
pub trait UnitDispatch: Send + Sync {
    fn frame_update(&self, source: Handle, unit: &MediaUnit);
    fn packet_update(&self, source: Handle, unit: &MediaUnit);
}

/// Dispatch that drops everything. Used by tests and detached sources.
pub struct NullDispatch;

impl UnitDispatch for NullDispatch {
    fn frame_update(&self, _source: Handle, _unit: &MediaUnit) {}
    fn packet_update(&self, _source: Handle, _unit: &MediaUnit) {}
}

/// Closed set of source variants behind the uniform lifecycle contract.
pub enum Source {
    Stream(SourceController),
    Still(StillSource),
    Push(PushSource),
}

impl Source {
    pub fn handle(&self) -> Handle {
        match self {
            Source::Stream(s) => s.handle(),
            Source::Still(s) => s.handle(),
            Source::Push(s) => s.handle(),
        }
    }

    pub fn state(&self) -> SourceState {
        match self {
            Source::Stream(s) => s.state(),
            Source::Still(s) => s.state(),
            Source::Push(s) => s.state(),
        }
    }

    pub fn prepare(&self) -> crate::error::Result<()> {
        match self {
            Source::Stream(s) => s.prepare(),
            Source::Still(s) => s.prepare(),
            Source::Push(s) => s.prepare(),
        }
    }

    pub fn start(&self) -> crate::error::Result<()> {
        match self {
            Source::Stream(s) => s.start(),
            Source::Still(s) => s.start(),
            Source::Push(s) => s.start(),
        }
    }

    /// Stop and join worker threads. Safe to call more than once.
    pub fn disable(&self) {
        match self {
            Source::Stream(s) => s.disable(),
            Source::Still(s) => s.disable(),
            Source::Push(s) => s.disable(),
        }
    }

    pub fn pause(&self) {
        match self {
            Source::Stream(s) => s.pause(),
            Source::Still(s) => s.pause(),
            Source::Push(s) => s.pause(),
        }
    }

    pub fn resume(&self) {
        match self {
            Source::Stream(s) => s.resume(),
            Source::Still(s) => s.resume(),
            Source::Push(s) => s.resume(),
        }
    }

    pub fn seek(&self, target: Timestamp) {
        match self {
            Source::Stream(s) => s.seek(target),
            Source::Still(_) => {}
            Source::Push(s) => s.seek(target),
        }
    }

    pub fn set_mute(&self, muted: bool) {
        match self {
            Source::Stream(s) => s.set_mute(muted),
            Source::Still(_) => {}
            Source::Push(s) => s.set_mute(muted),
        }
    }

    pub fn is_muted(&self) -> bool {
        match self {
            Source::Stream(s) => s.is_muted(),
            Source::Still(_) => false,
            Source::Push(s) => s.is_muted(),
        }
    }

    pub fn video_cache(&self) -> &std::sync::Arc<StreamCache> {
        match self {
            Source::Stream(s) => s.video_cache(),
            Source::Still(s) => s.video_cache(),
            Source::Push(s) => s.video_cache(),
        }
    }

    pub fn audio_cache(&self) -> Option<&std::sync::Arc<StreamCache>> {
        match self {
            Source::Stream(s) => Some(s.audio_cache()),
            Source::Still(_) => None,
            Source::Push(s) => Some(s.audio_cache()),
        }
    }

    pub fn descriptor(&self, kind: StreamKind) -> Option<StreamDescriptor> {
        match self {
            Source::Stream(s) => s.descriptor(kind),
            Source::Still(s) => s.descriptor(kind),
            Source::Push(s) => s.descriptor(kind),
        }
    }

    /// Demuxed codec parameters, when the source has them. Still and
    /// pushed sources synthesize units and carry none.
    pub fn codec_params(&self, kind: StreamKind) -> Option<input::StreamParams> {
        match self {
            Source::Stream(s) => s.codec_params(kind),
            Source::Still(_) | Source::Push(_) => None,
        }
    }

    /// Feed one unit into a push source. Other variants produce their
    /// own units and reject the call.
    pub fn push_unit(&self, unit: MediaUnit) -> crate::error::Result<()> {
        match self {
            Source::Push(s) => s.push_unit(unit),
            Source::Stream(_) | Source::Still(_) => Err(crate::error::RelayError::Precondition(
                "source does not accept pushed units".into(),
            )),
        }
    }

    /// Mark a push source's feed complete.
    pub fn finish(&self) {
        if let Source::Push(s) = self {
            s.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use SourceState::*;
        assert!(Empty.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Working));
        assert!(Working.can_transition_to(End));
        assert!(Working.can_transition_to(Error));
        assert!(Error.can_transition_to(Preparing));
    }

    #[test]
    fn disabled_is_always_reachable_and_final() {
        use SourceState::*;
        for state in [Empty, Preparing, Prepared, Working, Error, End] {
            assert!(state.can_transition_to(Disabled));
        }
        for state in [Empty, Preparing, Prepared, Working, Error, End, Disabled] {
            assert!(!Disabled.can_transition_to(state));
        }
    }

    #[test]
    fn no_shortcut_into_working() {
        use SourceState::*;
        assert!(!Empty.can_transition_to(Working));
        assert!(!Preparing.can_transition_to(Working));
        assert!(!End.can_transition_to(Working));
    }
}
