//! On-screen preview output.
//!
//! The preview keeps exactly one decoded picture: the newest frame the
//! fan-out delivered. A render loop polls [`PreviewSink::display_due`]
//! at its own pace; frames that were replaced before the loop came
//! around are simply never shown. Nothing here blocks the source
//! threads.

use crate::events::{EventSink, Handle};
use crate::media::descriptor::StreamDescriptor;
use crate::media::picture;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use crate::output::{OutputState, OutputStateCell};
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// One displayable picture, packed planes sliced without copying.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
    pub width: u32,
    pub height: u32,
    pub pts: Timestamp,
}

pub struct PreviewSink {
    handle: Handle,
    state: OutputStateCell,
    /// Newest frame wins; display takes it
    latest: Mutex<Option<MediaUnit>>,
    descriptor: Mutex<Option<StreamDescriptor>>,
}

impl PreviewSink {
    pub fn new(handle: Handle, events: Arc<dyn EventSink>) -> Self {
        Self {
            handle,
            state: OutputStateCell::new(handle, events, false),
            latest: Mutex::new(None),
            descriptor: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> OutputState {
        self.state.get()
    }

    /// The descriptor of the stream currently bound, if any.
    pub fn descriptor(&self) -> Option<StreamDescriptor> {
        self.descriptor.lock().unwrap().clone()
    }

    pub fn play(&self, descriptor: Option<StreamDescriptor>) -> crate::error::Result<()> {
        match self.state.get() {
            OutputState::None => {}
            OutputState::Working | OutputState::Wait => return Ok(()),
            _ => {
                return Err(crate::error::RelayError::Precondition(
                    "preview already stopped".into(),
                ))
            }
        }
        *self.descriptor.lock().unwrap() = descriptor;
        self.state.set(OutputState::Working);
        log::info!("preview {} bound", self.handle);
        Ok(())
    }

    /// Switch the bound stream without touching the lifecycle; the
    /// pending picture from the old source is dropped.
    pub fn rebind(&self, descriptor: Option<StreamDescriptor>) {
        *self.descriptor.lock().unwrap() = descriptor;
        self.latest.lock().unwrap().take();
    }

    /// Idempotent; a preview that never played goes straight to Closed.
    pub fn stop(&self) {
        self.state.set(OutputState::Stop);
        self.latest.lock().unwrap().take();
        self.state.set(OutputState::Closed);
    }

    /// Replace the pending picture with a newer one.
    pub fn frame_update(&self, unit: &MediaUnit) {
        if !self.state.get().admits_units() {
            return;
        }
        if unit.kind != StreamKind::Video || !unit.is_frame() {
            return;
        }
        *self.latest.lock().unwrap() = Some(unit.clone());
    }

    /// The next picture to draw, or None when nothing new arrived
    /// since the last call.
    pub fn display_due(&self) -> Option<PreviewFrame> {
        let unit = self.latest.lock().unwrap().take()?;
        let (Some(width), Some(height)) = (unit.width, unit.height) else {
            return None;
        };
        let y_size = (width * height) as usize;
        let c_size = ((width / 2) * (height / 2)) as usize;
        if unit.data.len() < picture::packed_size(width as usize, height as usize) {
            log::trace!("preview {}: truncated picture dropped", self.handle);
            return None;
        }
        Some(PreviewFrame {
            y: unit.data.slice(0..y_size),
            u: unit.data.slice(y_size..y_size + c_size),
            v: unit.data.slice(y_size + c_size..y_size + 2 * c_size),
            width,
            height,
            pts: unit.pts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;

    fn frame(pts_ms: i64, width: u32, height: u32) -> MediaUnit {
        let data = vec![7u8; picture::packed_size(width as usize, height as usize)];
        MediaUnit::video_frame(
            Bytes::from(data),
            Timestamp::from_millis(pts_ms),
            width,
            height,
        )
    }

    #[test]
    fn a_frame_is_displayed_exactly_once() {
        let preview = PreviewSink::new(400, Arc::new(RecordingEventSink::new()));
        preview.play(None).unwrap();

        preview.frame_update(&frame(0, 64, 48));
        let shown = preview.display_due().unwrap();
        assert_eq!(shown.width, 64);
        assert_eq!(shown.y.len(), 64 * 48);
        assert_eq!(shown.u.len(), 32 * 24);
        assert_eq!(shown.v.len(), 32 * 24);
        assert!(preview.display_due().is_none());

        preview.frame_update(&frame(40, 64, 48));
        assert_eq!(
            preview.display_due().unwrap().pts,
            Timestamp::from_millis(40)
        );
    }

    #[test]
    fn newest_frame_replaces_older_ones() {
        let preview = PreviewSink::new(401, Arc::new(RecordingEventSink::new()));
        preview.play(None).unwrap();

        for pts in [0, 40, 80] {
            preview.frame_update(&frame(pts, 32, 32));
        }
        assert_eq!(
            preview.display_due().unwrap().pts,
            Timestamp::from_millis(80)
        );
        assert!(preview.display_due().is_none());
    }

    #[test]
    fn stopped_preview_drops_everything() {
        let events = Arc::new(RecordingEventSink::new());
        let preview = PreviewSink::new(402, events.clone());
        preview.play(Some(StreamDescriptor::empty(StreamKind::Video)))
            .unwrap();
        preview.frame_update(&frame(0, 32, 32));
        preview.stop();

        assert!(preview.display_due().is_none());
        preview.frame_update(&frame(40, 32, 32));
        assert!(preview.display_due().is_none());
        assert_eq!(
            events.output_states(402),
            vec![OutputState::Working, OutputState::Stop, OutputState::Closed]
        );
    }

    #[test]
    fn truncated_pictures_are_not_displayed() {
        let preview = PreviewSink::new(403, Arc::new(RecordingEventSink::new()));
        preview.play(None).unwrap();

        let short = MediaUnit::video_frame(Bytes::from_static(&[0u8; 16]), Timestamp::ZERO, 64, 48);
        preview.frame_update(&short);
        assert!(preview.display_due().is_none());
    }
}
