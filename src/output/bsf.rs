//! Ordered bitstream-filter chain applied to packets before muxing.
//!
//! Filters run in declaration order; each packet a filter emits is fed
//! to the next one, so a chain of `h264_mp4toannexb` and `dump_extra`
//! behaves like the equivalent command-line `-bsf` list. An empty chain
//! passes packets through untouched.

use crate::config::BsfSpec;
use crate::error::{RelayError, Result};
use crate::media::clock;
use crate::media::unit::{MediaUnit, StreamKind, Timestamp};
use ac_ffmpeg::codec::bsf::BitstreamFilter;
use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::packet::{Packet, PacketMut};
use bytes::Bytes;

struct ChainFilter {
    name: String,
    filter: BitstreamFilter,
}

pub struct BitstreamChain {
    filters: Vec<ChainFilter>,
    kind: StreamKind,
}

// The chain is owned by a single writer thread.
unsafe impl Send for BitstreamChain {}

impl BitstreamChain {
    /// Build the chain. Input codec parameters are handed to every
    /// filter; parameter-rewriting filters in the middle of a chain are
    /// rare enough that forwarding per-filter output parameters is not
    /// worth the bookkeeping.
    pub fn build(
        specs: &[BsfSpec],
        params: Option<&CodecParameters>,
        kind: StreamKind,
    ) -> Result<Self> {
        let mut filters = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut builder = BitstreamFilter::builder(&spec.name)
                .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", spec.name)))?;
            if let Some(params) = params {
                builder = builder.input_codec_parameters(params);
            }
            for (key, value) in &spec.options {
                builder = builder.set_option(key, value);
            }
            let filter = builder
                .build()
                .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", spec.name)))?;
            log::debug!("bitstream filter {} open", spec.name);
            filters.push(ChainFilter {
                name: spec.name.clone(),
                filter,
            });
        }
        Ok(Self { filters, kind })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run one packet unit through the whole chain.
    pub fn push(&mut self, unit: &MediaUnit) -> Result<Vec<MediaUnit>> {
        if self.filters.is_empty() {
            return Ok(vec![unit.clone()]);
        }
        let mut stage: Vec<Packet> = vec![to_packet(unit)];
        for entry in &mut self.filters {
            let mut next = Vec::new();
            for packet in stage {
                entry
                    .filter
                    .push(packet)
                    .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", entry.name)))?;
                while let Some(out) = entry
                    .filter
                    .take()
                    .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", entry.name)))?
                {
                    next.push(out);
                }
            }
            stage = next;
        }
        Ok(stage
            .into_iter()
            .map(|packet| from_packet(&packet, self.kind, unit))
            .collect())
    }

    /// Flush every filter front to back, cascading the tails.
    pub fn flush(&mut self) -> Result<Vec<MediaUnit>> {
        let mut pending: Vec<Packet> = Vec::new();
        for position in 0..self.filters.len() {
            let carried = std::mem::take(&mut pending);
            for packet in carried {
                let entry = &mut self.filters[position];
                entry
                    .filter
                    .push(packet)
                    .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", entry.name)))?;
            }
            let entry = &mut self.filters[position];
            entry
                .filter
                .flush()
                .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", entry.name)))?;
            while let Some(out) = entry
                .filter
                .take()
                .map_err(|err| RelayError::Codec(format!("bsf {}: {err}", entry.name)))?
            {
                pending.push(out);
            }
        }
        let kind = self.kind;
        Ok(pending
            .iter()
            .map(|packet| {
                let pts = clock::to_unit_time(packet.pts(), Timestamp::ZERO);
                let dts = clock::to_unit_time(packet.dts(), pts);
                MediaUnit::packet(kind, Bytes::copy_from_slice(packet.data()), pts, dts)
            })
            .collect())
    }
}

fn to_packet(unit: &MediaUnit) -> Packet {
    PacketMut::from(unit.data.as_ref())
        .with_pts(clock::from_unit_time(unit.pts, clock::micros_time_base()))
        .with_dts(clock::from_unit_time(unit.dts, clock::micros_time_base()))
        .freeze()
}

/// Filters preserve packet identity closely enough that the source
/// unit's keyframe flag and sequence carry over.
fn from_packet(packet: &Packet, kind: StreamKind, origin: &MediaUnit) -> MediaUnit {
    let pts = clock::to_unit_time(packet.pts(), origin.pts);
    let dts = clock::to_unit_time(packet.dts(), origin.dts);
    MediaUnit::packet(kind, Bytes::copy_from_slice(packet.data()), pts, dts)
        .with_keyframe(origin.is_keyframe)
        .with_sequence(origin.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_unit(pts: i64, data: &[u8]) -> MediaUnit {
        MediaUnit::packet(
            StreamKind::Video,
            Bytes::copy_from_slice(data),
            Timestamp::from_millis(pts),
            Timestamp::from_millis(pts),
        )
        .with_keyframe(true)
    }

    #[test]
    fn empty_chain_is_a_passthrough() {
        let mut chain = BitstreamChain::build(&[], None, StreamKind::Video).unwrap();
        let unit = packet_unit(40, &[1, 2, 3]);
        let out = chain.push(&unit).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.as_ref(), &[1, 2, 3]);
        assert!(out[0].is_keyframe);
        assert!(chain.flush().unwrap().is_empty());
    }

    #[test]
    fn null_filter_preserves_payload_and_timing() {
        // The null bsf ships with every FFmpeg build.
        let specs = vec![BsfSpec::new("null")];
        let mut chain = BitstreamChain::build(&specs, None, StreamKind::Video).unwrap();
        assert!(!chain.is_empty());

        let unit = packet_unit(80, &[9, 8, 7, 6]);
        let out = chain.push(&unit).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.as_ref(), &[9, 8, 7, 6]);
        assert_eq!(out[0].pts.as_millis(), 80);
        assert!(out[0].is_keyframe);
    }

    #[test]
    fn chained_null_filters_stay_in_order() {
        let specs = vec![BsfSpec::new("null"), BsfSpec::new("null")];
        let mut chain = BitstreamChain::build(&specs, None, StreamKind::Video).unwrap();

        let mut seen = Vec::new();
        for pts in [0i64, 40, 80] {
            for unit in chain.push(&packet_unit(pts, &[pts as u8])).unwrap() {
                seen.push(unit.pts.as_millis());
            }
        }
        assert_eq!(seen, vec![0, 40, 80]);
    }

    #[test]
    fn unknown_filter_name_is_a_codec_error() {
        let specs = vec![BsfSpec::new("no_such_filter")];
        let err = BitstreamChain::build(&specs, None, StreamKind::Video).unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
    }
}
