//! Process-wide logging service.
//!
//! One explicit init instead of scattered global singletons: the first
//! call installs a `tracing-subscriber` fmt collector (which also picks
//! up `log` records), later calls are no-ops. Hosts that install their
//! own subscriber before building a manager keep it.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::LevelFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Initialize logging at the given level. Idempotent.
pub fn init(level: log::LevelFilter) {
    INIT.get_or_init(|| {
        let max = match level {
            log::LevelFilter::Off => LevelFilter::OFF,
            log::LevelFilter::Error => LevelFilter::ERROR,
            log::LevelFilter::Warn => LevelFilter::WARN,
            log::LevelFilter::Info => LevelFilter::INFO,
            log::LevelFilter::Debug => LevelFilter::DEBUG,
            log::LevelFilter::Trace => LevelFilter::TRACE,
        };
        // try_init: a subscriber installed by the host wins silently.
        let _ = tracing_subscriber::fmt().with_max_level(max).try_init();
    });
}

/// Initialize at Info, the default for embedding hosts.
pub fn init_default() {
    init(log::LevelFilter::Info);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init_default();
        init(log::LevelFilter::Debug);
        init_default();
        log::info!("logging initialized");
    }
}
