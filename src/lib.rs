//! Multi-source, multi-output live media relay and recorder.
//!
//! A [`StreamManager`] owns a set of media sources (demuxed files and
//! network streams, still images, host-pushed units) and fans their
//! decoded frames and demuxed packets out to any number of outputs:
//! container writers for recording and restreaming, a pollable preview
//! slot and raw callback taps. Sources and outputs run on their own
//! OS threads and meet only in bounded drop-oldest buffers, so one
//! slow consumer never stalls the rest.
//!
//! ```no_run
//! use relaycast::{StreamManager, SourceConfig, OutputConfig};
//!
//! let manager = StreamManager::new();
//! let source = manager.add_source(SourceConfig::new("match.ts"))?;
//! let output = manager.add_output(source, OutputConfig::new("copy.mkv"))?;
//! manager.start(source)?;
//! manager.play_output(output)?;
//! # Ok::<(), relaycast::RelayError>(())
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod manager;
pub mod media;
pub mod output;
pub mod source;
pub mod utils;

pub use audio::{AudioSink, NullAudioSink};
pub use config::{OutputConfig, SessionConfig, SourceConfig};
pub use error::{ErrorKind, RelayError, Result};
pub use events::{EventSink, Handle, RecordingEventSink, RelayEvent};
pub use manager::StreamManager;
pub use media::unit::{MediaUnit, PayloadKind, StreamKind, Timestamp};
pub use output::{OutputState, PreviewFrame};
pub use source::SourceState;
