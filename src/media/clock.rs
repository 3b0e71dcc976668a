//! Conversions between pipeline time (microseconds) and codec time bases.
//!
//! Units travel through the pipeline with microsecond timestamps; stream
//! and codec time bases exist only at the media library boundary, and
//! every crossing goes through these helpers.

use crate::media::unit::Timestamp as UnitTime;
use ac_ffmpeg::time::{TimeBase, Timestamp};

pub fn micros_time_base() -> TimeBase {
    TimeBase::new(1, 1_000_000)
}

/// Library timestamp to pipeline micros; `None` for null timestamps.
pub fn to_micros(ts: Timestamp) -> Option<i64> {
    if ts.is_null() {
        return None;
    }
    Some(ts.with_time_base(micros_time_base()).timestamp())
}

/// Library timestamp to a unit timestamp, falling back to `previous`
/// when the library reports no time at all.
pub fn to_unit_time(ts: Timestamp, previous: UnitTime) -> UnitTime {
    match to_micros(ts) {
        Some(micros) => UnitTime::from_micros(micros),
        None => previous,
    }
}

/// Pipeline micros rescaled into `time_base` ticks.
pub fn from_unit_time(time: UnitTime, time_base: TimeBase) -> Timestamp {
    Timestamp::new(time.micros, micros_time_base()).with_time_base(time_base)
}
