//! Output side of the relay: recording/streaming writers, the preview
//! slot and raw callback taps, all behind one lifecycle contract.
//!
//! Every output advances through the same state machine. `Working` and
//! `Wait` are the only states that admit units; everything else drops
//! them at the door so a stopping output can never block a source.

pub mod buffer;
pub mod bsf;
pub mod encode;
pub mod preview;
pub mod raw;
pub mod sink;
pub mod writer;

pub use preview::{PreviewFrame, PreviewSink};
pub use raw::RawCallbackSink;
pub use writer::WriterOutput;

use crate::events::{EventSink, Handle, RelayEvent};
use crate::media::descriptor::StreamDescriptor;
use crate::media::unit::MediaUnit;
use crate::source::input::StreamParams;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Lifecycle of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputState {
    /// Created, destination not opened yet
    None,
    /// Consuming units and writing
    Working,
    /// Paused; buffers fill and overflow drops oldest
    Wait,
    /// Stop requested, draining and flushing
    Stop,
    /// Destination closed, worker joined
    Closed,
    /// Failed past the error threshold
    Error,
}

impl OutputState {
    /// Legal state-machine edges. `Error` is reachable from every live
    /// state; `Closed` is final.
    pub fn can_transition_to(self, next: OutputState) -> bool {
        use OutputState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Closed, _) => false,
            (_, Error) => true,
            (None, Working) | (None, Closed) => true,
            (Working, Wait) | (Working, Stop) => true,
            (Wait, Working) | (Wait, Stop) => true,
            (Stop, Closed) => true,
            (Error, Stop) | (Error, Closed) => true,
            _ => false,
        }
    }

    /// Whether the output accepts units in this state.
    pub fn admits_units(self) -> bool {
        matches!(self, OutputState::Working | OutputState::Wait)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutputState::Closed)
    }
}

impl std::fmt::Display for OutputState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutputState::None => "none",
            OutputState::Working => "working",
            OutputState::Wait => "wait",
            OutputState::Stop => "stop",
            OutputState::Closed => "closed",
            OutputState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle cell for outputs: validates transitions and reports
/// each one through the event sink unless the output was configured to
/// stop silently.
pub(crate) struct OutputStateCell {
    handle: Handle,
    state: Mutex<OutputState>,
    events: Arc<dyn EventSink>,
    silent_stop: bool,
}

impl OutputStateCell {
    pub(crate) fn new(handle: Handle, events: Arc<dyn EventSink>, silent_stop: bool) -> Self {
        Self {
            handle,
            state: Mutex::new(OutputState::None),
            events,
            silent_stop,
        }
    }

    pub(crate) fn get(&self) -> OutputState {
        *self.state.lock().unwrap()
    }

    /// Apply a transition if the state machine allows it. Returns
    /// whether the transition happened.
    pub(crate) fn set(&self, next: OutputState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !state.can_transition_to(next) {
                return false;
            }
            log::debug!("output {}: {} -> {}", self.handle, *state, next);
            *state = next;
        }
        let muted = self.silent_stop
            && matches!(next, OutputState::Stop | OutputState::Closed);
        if !muted {
            self.events.notify(RelayEvent::OutputState {
                output: self.handle,
                state: next,
            });
        }
        true
    }
}

/// What an output needs to bind against one source stream: the shape of
/// the units it will receive plus, for demuxed sources, the codec
/// parameters that make pass-through muxing possible.
#[derive(Clone)]
pub struct SourceStream {
    pub descriptor: StreamDescriptor,
    pub params: Option<StreamParams>,
}

impl SourceStream {
    pub fn new(descriptor: StreamDescriptor) -> Self {
        Self {
            descriptor,
            params: None,
        }
    }

    pub fn with_params(mut self, params: Option<StreamParams>) -> Self {
        self.params = params;
        self
    }
}

/// Closed set of output variants behind the uniform contract. Writers
/// are shared so a primary can hold its dependent.
pub enum Output {
    Writer(Arc<WriterOutput>),
    Preview(Arc<PreviewSink>),
    Raw(RawCallbackSink),
}

impl Output {
    pub fn handle(&self) -> Handle {
        match self {
            Output::Writer(o) => o.handle(),
            Output::Preview(o) => o.handle(),
            Output::Raw(o) => o.handle(),
        }
    }

    pub fn state(&self) -> OutputState {
        match self {
            Output::Writer(o) => o.state(),
            Output::Preview(o) => o.state(),
            Output::Raw(o) => o.state(),
        }
    }

    /// Bind to the source streams and start consuming.
    pub fn play(
        &self,
        video: Option<SourceStream>,
        audio: Option<SourceStream>,
    ) -> crate::error::Result<()> {
        match self {
            Output::Writer(o) => o.play(video, audio),
            Output::Preview(o) => o.play(video.map(|s| s.descriptor)),
            Output::Raw(o) => o.play(),
        }
    }

    /// Stop, flush and join worker threads. Safe to call more than once.
    pub fn stop(&self) {
        match self {
            Output::Writer(o) => o.stop(),
            Output::Preview(o) => o.stop(),
            Output::Raw(o) => o.stop(),
        }
    }

    pub fn pause(&self) {
        match self {
            Output::Writer(o) => o.pause(),
            Output::Preview(_) | Output::Raw(_) => {}
        }
    }

    pub fn resume(&self) {
        match self {
            Output::Writer(o) => o.resume(),
            Output::Preview(_) | Output::Raw(_) => {}
        }
    }

    pub fn frame_update(&self, unit: &MediaUnit) {
        match self {
            Output::Writer(o) => o.frame_update(unit),
            Output::Preview(o) => o.frame_update(unit),
            Output::Raw(o) => o.frame_update(unit),
        }
    }

    pub fn packet_update(&self, unit: &MediaUnit) {
        match self {
            Output::Writer(o) => o.packet_update(unit),
            Output::Preview(_) => {}
            Output::Raw(o) => o.packet_update(unit),
        }
    }

    /// Whether this entry is driven by a primary writer instead of the
    /// source fan-out.
    pub fn is_dependent(&self) -> bool {
        match self {
            Output::Writer(o) => o.is_dependent(),
            Output::Preview(_) | Output::Raw(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullEventSink, RecordingEventSink};

    #[test]
    fn lifecycle_edges() {
        use OutputState::*;
        assert!(None.can_transition_to(Working));
        assert!(Working.can_transition_to(Wait));
        assert!(Wait.can_transition_to(Working));
        assert!(Working.can_transition_to(Stop));
        assert!(Stop.can_transition_to(Closed));
        assert!(Error.can_transition_to(Stop));
        assert!(Error.can_transition_to(Closed));
    }

    #[test]
    fn closed_is_final() {
        use OutputState::*;
        for state in [None, Working, Wait, Stop, Error] {
            assert!(!Closed.can_transition_to(state));
        }
        assert!(!Closed.can_transition_to(Error));
    }

    #[test]
    fn no_shortcut_around_stop() {
        use OutputState::*;
        assert!(!Working.can_transition_to(Closed));
        assert!(!Wait.can_transition_to(Closed));
        assert!(!None.can_transition_to(Stop));
    }

    #[test]
    fn only_working_and_wait_admit_units() {
        use OutputState::*;
        assert!(Working.admits_units());
        assert!(Wait.admits_units());
        for state in [None, Stop, Closed, Error] {
            assert!(!state.admits_units());
        }
    }

    #[test]
    fn cell_reports_each_transition_once() {
        let events = Arc::new(RecordingEventSink::new());
        let cell = OutputStateCell::new(200, events.clone(), false);

        assert!(cell.set(OutputState::Working));
        assert!(!cell.set(OutputState::Working));
        assert!(cell.set(OutputState::Stop));
        assert!(cell.set(OutputState::Closed));

        assert_eq!(
            events.output_states(200),
            vec![OutputState::Working, OutputState::Stop, OutputState::Closed]
        );
    }

    #[test]
    fn silent_stop_mutes_only_teardown_events() {
        let events = Arc::new(RecordingEventSink::new());
        let cell = OutputStateCell::new(201, events.clone(), true);

        cell.set(OutputState::Working);
        cell.set(OutputState::Stop);
        cell.set(OutputState::Closed);

        assert_eq!(events.output_states(201), vec![OutputState::Working]);
        assert_eq!(cell.get(), OutputState::Closed);
    }

    #[test]
    fn invalid_transition_keeps_state_and_stays_quiet() {
        let cell = OutputStateCell::new(202, Arc::new(NullEventSink), false);
        assert!(!cell.set(OutputState::Stop));
        assert_eq!(cell.get(), OutputState::None);
    }
}
