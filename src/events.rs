//! Observer API for cross-thread notifications.
//!
//! Every callback the original exposed as a raw function pointer is an
//! event here, delivered through a registered [`EventSink`]. Events are
//! invoked from worker threads (reader, writer and manager teardown
//! paths); sinks must be `Send + Sync` and the host is responsible for
//! any thread-affinity marshaling.

use crate::error::ErrorKind;
use crate::output::OutputState;
use crate::source::SourceState;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Registry handle for a source or an output.
pub type Handle = u32;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// One reconnect attempt finished
    Reconnect { source: Handle, succeeded: bool },
    SourceState { source: Handle, state: SourceState },
    OutputState { output: Handle, state: OutputState },
    /// The manager tore everything down
    ForceStop,
    Message { text: String },
    Error { kind: ErrorKind, text: String },
}

pub trait EventSink: Send + Sync {
    fn notify(&self, event: RelayEvent);
}

/// Default sink: drops everything.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&self, _event: RelayEvent) {}
}

/// Swappable forwarding sink.
///
/// Sources and outputs capture their event sink at construction, so the
/// manager hands everyone a hub and lets the host swap the real sink in
/// and out at any time.
pub struct EventHub {
    inner: Mutex<std::sync::Arc<dyn EventSink>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(std::sync::Arc::new(NullEventSink)),
        }
    }

    pub fn set(&self, sink: std::sync::Arc<dyn EventSink>) {
        *self.inner.lock().unwrap() = sink;
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventHub {
    fn notify(&self, event: RelayEvent) {
        // Deliver outside the lock; sinks may call back into the hub.
        let sink = std::sync::Arc::clone(&*self.inner.lock().unwrap());
        sink.notify(event);
    }
}

/// Accumulating sink for tests and polling hosts.
///
/// Keeps every event in arrival order and supports blocking waits on a
/// predicate, so callers can assert on sequences produced by worker
/// threads without sleeping blind.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RelayEvent>>,
    cond: Condvar,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Count of reconnect events recorded for `source`.
    pub fn reconnect_attempts(&self, source: Handle) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RelayEvent::Reconnect { source: s, .. } if *s == source))
            .count()
    }

    /// State transition sequence recorded for one output.
    pub fn output_states(&self, output: Handle) -> Vec<OutputState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RelayEvent::OutputState { output: o, state } if *o == output => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// State transition sequence recorded for one source.
    pub fn source_states(&self, source: Handle) -> Vec<SourceState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RelayEvent::SourceState { source: s, state } if *s == source => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Block until the recorded events satisfy `pred` or `timeout`
    /// elapses. Returns whether the predicate held.
    pub fn wait_until<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&[RelayEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if pred(&events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(events, deadline - now).unwrap();
            events = guard;
        }
    }
}

impl EventSink for RecordingEventSink {
    fn notify(&self, event: RelayEvent) {
        let mut events = self.events.lock().unwrap();
        events.push(event);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_until_sees_event_from_other_thread() {
        let sink = Arc::new(RecordingEventSink::new());
        let writer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sink.notify(RelayEvent::Message {
                    text: "hello".into(),
                });
            })
        };

        let seen = sink.wait_until(Duration::from_secs(2), |events| {
            events
                .iter()
                .any(|e| matches!(e, RelayEvent::Message { text } if text == "hello"))
        });
        writer.join().unwrap();
        assert!(seen);
    }

    #[test]
    fn wait_until_times_out() {
        let sink = RecordingEventSink::new();
        assert!(!sink.wait_until(Duration::from_millis(20), |events| !events.is_empty()));
    }

    #[test]
    fn hub_forwards_to_the_sink_installed_last() {
        let hub = EventHub::new();
        hub.notify(RelayEvent::Message { text: "lost".into() });

        let recorder = Arc::new(RecordingEventSink::new());
        hub.set(recorder.clone());
        hub.notify(RelayEvent::Message { text: "kept".into() });

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RelayEvent::Message { text } if text == "kept"));
    }
}
