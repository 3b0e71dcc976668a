use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use relaycast::config::SessionOutput;
use relaycast::{
    logging, EventSink, OutputConfig, RecordingEventSink, RelayEvent, SessionConfig, SourceConfig,
    SourceState, StreamManager,
};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    let matches = Command::new("relaycast")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("URL")
                .help("Input file or tcp:// stream to relay."),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("URL")
                .action(ArgAction::Append)
                .help("Destination file or tcp:// stream; repeatable."),
        )
        .arg(
            Arg::new("segment-time")
                .long("segment-time")
                .value_name("SECONDS")
                .help("Split file destinations into segments of this length."),
        )
        .arg(
            Arg::new("session")
                .short('s')
                .long("session")
                .value_name("FILE")
                .help("JSON session description; replaces --input/--output."),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Stop after this long instead of waiting for the input to end."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity; repeat for trace output."),
        )
        .get_matches();

    logging::init(match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });

    let session = match build_session(&matches) {
        Ok(session) => session,
        Err(err) => {
            log::error!("{err:#}");
            process::exit(2);
        }
    };
    let duration = matches
        .get_one::<String>("duration")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    if let Err(err) = run(session, duration) {
        log::error!("{err:#}");
        process::exit(1);
    }
}

fn build_session(matches: &clap::ArgMatches) -> anyhow::Result<SessionConfig> {
    if let Some(path) = matches.get_one::<String>("session") {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading session {path}"))?;
        return serde_json::from_str(&text).with_context(|| format!("parsing session {path}"));
    }

    let Some(input) = matches.get_one::<String>("input") else {
        bail!("either --input or --session is required");
    };
    let segment_time = matches
        .get_one::<String>("segment-time")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let mut session = SessionConfig::default();
    session.sources.push(SourceConfig::new(input));
    for url in matches.get_many::<String>("output").into_iter().flatten() {
        let mut config = OutputConfig::new(url);
        if let Some(window) = segment_time {
            config = config.with_segment_time(window);
        }
        session.outputs.push(SessionOutput {
            config,
            source_index: 0,
        });
    }
    if session.outputs.is_empty() {
        bail!("at least one --output is required");
    }
    Ok(session)
}

fn run(session: SessionConfig, duration: Option<Duration>) -> anyhow::Result<()> {
    anyhow::ensure!(!session.sources.is_empty(), "session has no sources");

    let manager = StreamManager::new();
    let events = Arc::new(RecordingEventSink::new());
    manager.set_event_sink(Arc::clone(&events) as Arc<dyn EventSink>);

    let mut sources = Vec::new();
    for config in &session.sources {
        let url = config.url.clone();
        let handle = manager
            .add_source(config.clone())
            .with_context(|| format!("opening {url}"))?;
        sources.push(handle);
    }
    for output in &session.outputs {
        let source = *sources.get(output.source_index).with_context(|| {
            format!(
                "output {} references source {} which does not exist",
                output.config.url, output.source_index
            )
        })?;
        let handle = manager.add_output(source, output.config.clone())?;
        manager.play_output(handle)?;
    }
    for &source in &sources {
        manager.start(source)?;
    }

    // gracefully close when receiving SIGINT, SIGTERM, or SIGHUP
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("setting Ctrl-C handler")?;

    let started = Instant::now();
    loop {
        if interrupted.load(Ordering::Relaxed) {
            log::info!("interrupted, shutting down");
            break;
        }
        if let Some(limit) = duration
            && started.elapsed() >= limit
        {
            log::info!("duration reached, shutting down");
            break;
        }
        let states: Vec<SourceState> = sources
            .iter()
            .filter_map(|&s| manager.source_state(s).ok())
            .collect();
        if !states.is_empty()
            && states.iter().all(|s| {
                matches!(
                    s,
                    SourceState::End | SourceState::Error | SourceState::Disabled
                )
            })
        {
            log::info!("all sources finished");
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    manager.force_stop();

    let failed = events
        .events()
        .iter()
        .any(|e| matches!(e, RelayEvent::Error { .. }));
    if failed {
        bail!("relay finished with errors; see the log");
    }
    Ok(())
}
