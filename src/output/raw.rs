//! Callback output: hands decoded frames and demuxed packets to
//! embedding code without any buffering or transformation. The
//! callback runs on the fan-out thread, so it has to return quickly.

use crate::error::{RelayError, Result};
use crate::events::{EventSink, Handle};
use crate::media::unit::MediaUnit;
use crate::output::{OutputState, OutputStateCell};
use std::sync::Arc;

pub type UnitCallback = Box<dyn Fn(&MediaUnit) + Send + Sync>;

pub struct RawCallbackSink {
    handle: Handle,
    state: OutputStateCell,
    callback: UnitCallback,
}

impl RawCallbackSink {
    pub fn new(handle: Handle, events: Arc<dyn EventSink>, callback: UnitCallback) -> Self {
        Self {
            handle,
            state: OutputStateCell::new(handle, events, false),
            callback,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> OutputState {
        self.state.get()
    }

    pub fn play(&self) -> Result<()> {
        match self.state.get() {
            OutputState::None => {}
            OutputState::Working | OutputState::Wait => return Ok(()),
            _ => {
                return Err(RelayError::Precondition(
                    "raw output already stopped".into(),
                ))
            }
        }
        self.state.set(OutputState::Working);
        Ok(())
    }

    pub fn stop(&self) {
        self.state.set(OutputState::Stop);
        self.state.set(OutputState::Closed);
    }

    pub fn frame_update(&self, unit: &MediaUnit) {
        self.forward(unit);
    }

    pub fn packet_update(&self, unit: &MediaUnit) {
        self.forward(unit);
    }

    fn forward(&self, unit: &MediaUnit) {
        if self.state.get().admits_units() {
            (self.callback)(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::media::unit::{StreamKind, Timestamp};
    use bytes::Bytes;
    use std::sync::Mutex;

    fn unit(pts_ms: i64) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Video,
            Bytes::from_static(b"x"),
            Timestamp::from_millis(pts_ms),
            Timestamp::from_millis(pts_ms),
        )
    }

    #[test]
    fn callbacks_fire_only_while_playing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let sink = RawCallbackSink::new(
            500,
            Arc::new(RecordingEventSink::new()),
            Box::new(move |unit| captured.lock().unwrap().push(unit.pts)),
        );

        sink.packet_update(&unit(0));
        sink.play().unwrap();
        sink.packet_update(&unit(40));
        sink.frame_update(&unit(80));
        sink.stop();
        sink.packet_update(&unit(120));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Timestamp::from_millis(40), Timestamp::from_millis(80)]
        );
    }

    #[test]
    fn stop_without_play_closes_silently() {
        let events = Arc::new(RecordingEventSink::new());
        let sink = RawCallbackSink::new(501, events.clone(), Box::new(|_| {}));
        sink.stop();
        assert_eq!(sink.state(), OutputState::Closed);
        assert_eq!(events.output_states(501), vec![OutputState::Closed]);
    }
}
