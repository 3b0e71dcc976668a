//! Per-output staging buffer between the fan-out and the writer worker.
//!
//! Four independent rings, one per stream kind and payload kind, so a
//! slow video encode cannot starve audio delivery and frames never
//! contend with pass-through packets. Every ring drops its oldest unit
//! on overflow; the writer worker is the only consumer.

use crate::media::ring::{PushResult, RingBuffer};
use crate::media::unit::{MediaUnit, PayloadKind, StreamKind};
use std::time::Duration;

pub struct InputBuffer {
    video_frames: RingBuffer<MediaUnit>,
    audio_frames: RingBuffer<MediaUnit>,
    video_packets: RingBuffer<MediaUnit>,
    audio_packets: RingBuffer<MediaUnit>,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            video_frames: RingBuffer::new(capacity),
            audio_frames: RingBuffer::new(capacity),
            video_packets: RingBuffer::new(capacity),
            audio_packets: RingBuffer::new(capacity),
        }
    }

    fn lane(&self, kind: StreamKind, payload: PayloadKind) -> &RingBuffer<MediaUnit> {
        match (kind, payload) {
            (StreamKind::Video, PayloadKind::Frame) => &self.video_frames,
            (StreamKind::Audio, PayloadKind::Frame) => &self.audio_frames,
            (StreamKind::Video, PayloadKind::Packet) => &self.video_packets,
            (StreamKind::Audio, PayloadKind::Packet) => &self.audio_packets,
        }
    }

    /// Route a unit into its lane without blocking the producer.
    pub fn push(&self, unit: MediaUnit) -> PushResult {
        self.lane(unit.kind, unit.payload)
            .push(unit, Duration::ZERO)
    }

    pub fn try_pop(&self, kind: StreamKind, payload: PayloadKind) -> Option<MediaUnit> {
        self.lane(kind, payload).try_pop()
    }

    pub fn len(&self, kind: StreamKind, payload: PayloadKind) -> usize {
        self.lane(kind, payload).len()
    }

    pub fn is_empty(&self) -> bool {
        self.video_frames.is_empty()
            && self.audio_frames.is_empty()
            && self.video_packets.is_empty()
            && self.audio_packets.is_empty()
    }

    /// Units evicted by overflow across all lanes.
    pub fn dropped(&self) -> u64 {
        self.video_frames.dropped()
            + self.audio_frames.dropped()
            + self.video_packets.dropped()
            + self.audio_packets.dropped()
    }

    pub fn clear(&self) {
        self.video_frames.clear();
        self.audio_frames.clear();
        self.video_packets.clear();
        self.audio_packets.clear();
    }

    /// Close every lane; pending pushes fail and poppers see the drain.
    pub fn close(&self) {
        self.video_frames.close();
        self.audio_frames.close();
        self.video_packets.close();
        self.audio_packets.close();
    }

    pub fn is_closed(&self) -> bool {
        self.video_frames.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::unit::Timestamp;
    use bytes::Bytes;

    fn frame(pts: i64) -> MediaUnit {
        MediaUnit::video_frame(Bytes::from_static(&[0u8; 6]), Timestamp::from_millis(pts), 2, 2)
    }

    fn packet(pts: i64) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Audio,
            Bytes::from_static(&[1u8, 2]),
            Timestamp::from_millis(pts),
            Timestamp::from_millis(pts),
        )
    }

    #[test]
    fn units_land_in_their_own_lane() {
        let buffer = InputBuffer::new(4);
        buffer.push(frame(0));
        buffer.push(packet(0));

        assert_eq!(buffer.len(StreamKind::Video, PayloadKind::Frame), 1);
        assert_eq!(buffer.len(StreamKind::Audio, PayloadKind::Packet), 1);
        assert_eq!(buffer.len(StreamKind::Audio, PayloadKind::Frame), 0);
        assert!(buffer
            .try_pop(StreamKind::Video, PayloadKind::Packet)
            .is_none());
    }

    #[test]
    fn overflow_drops_oldest_per_lane() {
        let buffer = InputBuffer::new(2);
        for pts in 0..5 {
            buffer.push(frame(pts));
        }
        // Audio lane untouched by the video flood.
        buffer.push(packet(100));

        let first = buffer
            .try_pop(StreamKind::Video, PayloadKind::Frame)
            .unwrap();
        assert_eq!(first.pts.as_millis(), 3);
        assert_eq!(buffer.dropped(), 3);
        assert_eq!(buffer.len(StreamKind::Audio, PayloadKind::Packet), 1);
    }

    #[test]
    fn close_rejects_further_pushes() {
        let buffer = InputBuffer::new(2);
        buffer.push(frame(0));
        buffer.close();
        assert!(matches!(buffer.push(frame(1)), PushResult::Closed));
        // Already buffered units still drain.
        assert!(buffer
            .try_pop(StreamKind::Video, PayloadKind::Frame)
            .is_some());
    }
}
