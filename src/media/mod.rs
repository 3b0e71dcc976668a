//! Media value types and the cross-thread handoff primitive.

pub mod clock;
pub mod descriptor;
pub mod picture;
pub mod ring;
pub mod unit;

pub use descriptor::{CodecOverride, HwAccel, StreamDescriptor};
pub use ring::{PushResult, RingBuffer};
pub use unit::{MediaUnit, PayloadKind, StreamKind, Timestamp};
