//! Per-output transform pipeline.
//!
//! Each output that declares transforms gets one [`FilterPipeline`]: a
//! worker thread pulling units from a bounded input ring, running them
//! through an ordered stage chain and parking the results for the
//! output worker to collect. The input ring keeps producer latency
//! bounded; when the chain is slower than the source, the oldest
//! pending unit is dropped, never the newest.

pub mod stage;

pub use stage::{FilterStage, OverlayStage, ResampleStage, ScaleStage};

use crate::error::Result;
use crate::media::ring::{PushResult, RingBuffer};
use crate::media::unit::MediaUnit;
use crate::utils::stop::StopSignal;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Units held in the input ring before drop-oldest kicks in.
pub const FILTER_RING_CAPACITY: usize = 5;

/// Bounded wait for input capacity before evicting.
const PUSH_WAIT: Duration = Duration::from_millis(20);

struct OutputSlot {
    units: Mutex<VecDeque<MediaUnit>>,
    available: Condvar,
}

struct Lane {
    stage: Box<dyn FilterStage>,
    connected: bool,
}

pub struct FilterPipeline {
    label: String,
    input: Arc<RingBuffer<MediaUnit>>,
    slot: Arc<OutputSlot>,
    stop: StopSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FilterPipeline {
    /// Spawn the worker. Stages stay unopened until the first unit
    /// arrives; a source's real geometry is unknown before that.
    pub fn new(label: impl Into<String>, stages: Vec<Box<dyn FilterStage>>) -> Result<Self> {
        let label = label.into();
        let input = Arc::new(RingBuffer::new(FILTER_RING_CAPACITY));
        let slot = Arc::new(OutputSlot {
            units: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let stop = StopSignal::new();

        let worker = {
            let input = Arc::clone(&input);
            let slot = Arc::clone(&slot);
            let stop = stop.clone();
            let lanes = stages
                .into_iter()
                .map(|stage| Lane {
                    stage,
                    connected: false,
                })
                .collect();
            thread::Builder::new()
                .name(format!("filter-{label}"))
                .spawn(move || run_loop(&input, &slot, &stop, lanes))?
        };

        Ok(Self {
            label,
            input,
            slot,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a unit for the chain. Waits briefly for capacity, then
    /// evicts the oldest pending unit.
    pub fn push(&self, unit: MediaUnit) -> PushResult {
        let outcome = self.input.push(unit, PUSH_WAIT);
        if outcome == PushResult::Evicted {
            log::trace!("filter {}: input ring full, dropped oldest", self.label);
        }
        outcome
    }

    /// Block until a filtered unit is ready or `timeout` elapses.
    ///
    /// Returns `None` on timeout or once the pipeline is stopped and
    /// drained.
    pub fn wait(&self, timeout: Duration) -> Option<MediaUnit> {
        let deadline = Instant::now() + timeout;
        let mut units = self.slot.units.lock().unwrap();
        loop {
            if let Some(unit) = units.pop_front() {
                return Some(unit);
            }
            if self.stop.cancelled() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .slot
                .available
                .wait_timeout(units, deadline - now)
                .unwrap();
            units = guard;
        }
    }

    /// Take everything currently ready, without blocking.
    pub fn drain(&self) -> Vec<MediaUnit> {
        let mut units = self.slot.units.lock().unwrap();
        units.drain(..).collect()
    }

    /// Filtered units waiting for collection.
    pub fn pending(&self) -> usize {
        self.slot.units.lock().unwrap().len()
    }

    /// Stop the worker and discard queued input. Further pushes are
    /// rejected by the closed ring. Safe to call any number of times;
    /// only the first joins the worker.
    pub fn stop(&self) {
        self.stop.cancel();
        self.input.close();
        {
            // Wake wait()ers that already passed the cancelled check.
            let _units = self.slot.units.lock().unwrap();
            self.slot.available.notify_all();
        }
        if let Some(worker) = self.worker.lock().unwrap().take()
            && worker.join().is_err()
        {
            log::error!("filter {}: worker panicked", self.label);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.cancelled()
    }
}

impl Drop for FilterPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    input: &RingBuffer<MediaUnit>,
    slot: &OutputSlot,
    stop: &StopSignal,
    mut lanes: Vec<Lane>,
) {
    while let Some(unit) = input.pop() {
        if stop.cancelled() {
            break;
        }
        let mut units = vec![unit];
        for lane in &mut lanes {
            if !lane.connected {
                match lane.stage.connect(&units[0]) {
                    Ok(()) => lane.connected = true,
                    // Wrong-kind first unit; retry on the next one.
                    Err(err) => log::debug!("filter stage {} deferred: {err}", lane.stage.name()),
                }
            }
            let mut next = Vec::new();
            for unit in units {
                match lane.stage.process(unit) {
                    Ok(mut produced) => next.append(&mut produced),
                    Err(err) => log::warn!("filter stage {} failed: {err}", lane.stage.name()),
                }
            }
            units = next;
            if units.is_empty() {
                break;
            }
        }
        if units.is_empty() {
            continue;
        }
        let mut ready = slot.units.lock().unwrap();
        ready.extend(units);
        slot.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::media::unit::Timestamp;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit(pts_ms: i64) -> MediaUnit {
        MediaUnit::video_frame(
            Bytes::from_static(&[0u8; 6]),
            Timestamp::from_millis(pts_ms),
            2,
            2,
        )
    }

    struct ProbeStage {
        connects: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
    }

    impl FilterStage for ProbeStage {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn connect(&mut self, _unit: &MediaUnit) -> crate::error::Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn process(&mut self, unit: MediaUnit) -> crate::error::Result<Vec<MediaUnit>> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(vec![unit])
        }
    }

    struct TagStage(u8);

    impl FilterStage for TagStage {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn connect(&mut self, _unit: &MediaUnit) -> crate::error::Result<()> {
            Ok(())
        }

        fn process(&mut self, mut unit: MediaUnit) -> crate::error::Result<Vec<MediaUnit>> {
            let mut data = unit.data.to_vec();
            data.push(self.0);
            unit.data = Bytes::from(data);
            Ok(vec![unit])
        }
    }

    struct SlowStage;

    impl FilterStage for SlowStage {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn connect(&mut self, _unit: &MediaUnit) -> crate::error::Result<()> {
            Ok(())
        }

        fn process(&mut self, unit: MediaUnit) -> crate::error::Result<Vec<MediaUnit>> {
            thread::sleep(Duration::from_millis(30));
            Ok(vec![unit])
        }
    }

    struct FailingStage;

    impl FilterStage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn connect(&mut self, _unit: &MediaUnit) -> crate::error::Result<()> {
            Ok(())
        }

        fn process(&mut self, _unit: MediaUnit) -> crate::error::Result<Vec<MediaUnit>> {
            Err(RelayError::Codec("boom".into()))
        }
    }

    #[test]
    fn units_flow_in_order_through_an_empty_chain() {
        let pipeline = FilterPipeline::new("t", Vec::new()).unwrap();
        for pts in [0, 40, 80] {
            pipeline.push(unit(pts));
        }
        for expected in [0, 40, 80] {
            let got = pipeline.wait(Duration::from_secs(2)).unwrap();
            assert_eq!(got.pts.as_millis(), expected);
        }
        pipeline.stop();
    }

    #[test]
    fn stages_run_in_declaration_order() {
        let pipeline = FilterPipeline::new(
            "t",
            vec![
                Box::new(TagStage(1)) as Box<dyn FilterStage>,
                Box::new(TagStage(2)),
            ],
        )
        .unwrap();
        pipeline.push(unit(0));
        let got = pipeline.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(&got.data[got.data.len() - 2..], &[1, 2]);
        pipeline.stop();
    }

    #[test]
    fn stages_connect_lazily_and_once() {
        let connects = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));
        let pipeline = FilterPipeline::new(
            "t",
            vec![Box::new(ProbeStage {
                connects: Arc::clone(&connects),
                processed: Arc::clone(&processed),
            }) as Box<dyn FilterStage>],
        )
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        pipeline.push(unit(0));
        pipeline.push(unit(40));
        assert!(pipeline.wait(Duration::from_secs(2)).is_some());
        assert!(pipeline.wait(Duration::from_secs(2)).is_some());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(processed.load(Ordering::SeqCst), 2);
        pipeline.stop();
    }

    #[test]
    fn slow_chain_drops_oldest_pending_unit() {
        let pipeline =
            FilterPipeline::new("t", vec![Box::new(SlowStage) as Box<dyn FilterStage>]).unwrap();
        for pts in 0..20 {
            pipeline.push(unit(pts * 40));
        }

        let mut got = Vec::new();
        while let Some(unit) = pipeline.wait(Duration::from_millis(300)) {
            got.push(unit.pts.as_millis());
        }
        assert!(got.len() < 20, "nothing was dropped: {got:?}");
        assert!(got.windows(2).all(|w| w[0] < w[1]), "out of order: {got:?}");
        // The newest unit always survives eviction.
        assert_eq!(*got.last().unwrap(), 19 * 40);
        pipeline.stop();
    }

    #[test]
    fn failing_stage_swallows_the_unit_but_keeps_running() {
        let pipeline =
            FilterPipeline::new("t", vec![Box::new(FailingStage) as Box<dyn FilterStage>]).unwrap();
        pipeline.push(unit(0));
        assert!(pipeline.wait(Duration::from_millis(100)).is_none());
        assert!(!pipeline.is_stopped());
        pipeline.stop();
    }

    #[test]
    fn wait_blocks_until_a_unit_arrives() {
        let pipeline = Arc::new(FilterPipeline::new("t", Vec::new()).unwrap());
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                pipeline.push(unit(120));
            })
        };
        let got = pipeline.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(got.pts.as_millis(), 120);
        producer.join().unwrap();
        pipeline.stop();
    }

    #[test]
    fn stop_is_idempotent_and_rejects_new_input() {
        let pipeline = FilterPipeline::new("t", Vec::new()).unwrap();
        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.push(unit(0)), PushResult::Closed);
        assert!(pipeline.wait(Duration::from_millis(20)).is_none());
    }
}
