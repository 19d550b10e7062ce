//! Event collector
//!
//! One reader task per recording: it waits on the event source, decodes every
//! record and forwards it to the processor through a bounded queue. The queue
//! never blocks the reader; when it is full the newest event is dropped and
//! counted.
//!
//! Stopping is cooperative. The handle flips a watch flag, the reader quiesces
//! the probes, drains what is still buffered until the drain deadline and
//! reports a [`DrainSummary`].

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use kdebug_common::DebugEvent;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::EventDecoder;
use super::source::{EventSource, ProbeBackend};
use crate::breakpoints::ProbeTarget;
use crate::config::CaptureConfig;
use crate::domain::CaptureError;

/// Event accounting of one finished recording
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    /// Events handed to the processor queue
    pub frames_delivered: u64,
    pub events_fired: u64,
    pub events_filtered: u64,
    /// `ring_drops + queue_drops + late_drops`
    pub events_dropped: u64,
    pub ring_drops: u64,
    pub queue_drops: u64,
    /// Records still buffered when the drain deadline passed
    pub late_drops: u64,
    pub decode_errors: u64,
    pub duration: Duration,
    /// Set when the reader ended on its own instead of being stopped
    pub stop_reason: Option<String>,
}

impl DrainSummary {
    /// Every admitted event is accounted for exactly once
    pub fn is_balanced(&self) -> bool {
        self.events_fired == self.frames_delivered + self.events_dropped + self.decode_errors
    }
}

/// Enforces at most one live reader per collector
#[derive(Debug, Clone, Default)]
pub struct Collector {
    live: Arc<AtomicBool>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Install probes for `targets` and spawn the reader task
    ///
    /// Must be called from within a Tokio runtime. Returns the handle used to
    /// stop the reader and the receiving end of the event queue.
    ///
    /// # Errors
    /// - `CaptureError::InvalidConfig` if `config` fails validation
    /// - `CaptureError::AlreadyRunning` if a reader from this collector is live
    /// - Whatever the backend reports when installation fails
    pub fn start<B: ProbeBackend>(
        &self,
        backend: &mut B,
        targets: &[ProbeTarget],
        config: &CaptureConfig,
    ) -> Result<(CollectorHandle, Receiver<DebugEvent>), CaptureError> {
        config.validate()?;
        if self.live.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(CaptureError::AlreadyRunning);
        }
        let guard = LiveGuard(Arc::clone(&self.live));

        let source = backend.install(targets, config)?;
        info!("✓ Collector started for {} functions", targets.len());

        let (tx, rx) = bounded(config.queue_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let reader = Reader {
            source,
            tx,
            decoder: EventDecoder::default(),
            stats: ReaderStats::default(),
            _live: guard,
        };
        let task = tokio::spawn(reader.run(cancel_rx, config.clone(), Instant::now()));

        Ok((CollectorHandle { cancel: cancel_tx, task: Some(task), summary: None }, rx))
    }
}

/// Clears the live flag when the reader finishes, however it finishes
struct LiveGuard(Arc<AtomicBool>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner's side of a running reader
pub struct CollectorHandle {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<DrainSummary>>,
    summary: Option<DrainSummary>,
}

impl CollectorHandle {
    /// Cancel the reader and wait for its drain to finish
    ///
    /// Idempotent: later calls return the first summary.
    pub async fn stop(&mut self) -> DrainSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        self.cancel.send_replace(true);
        let summary = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!("Reader task failed: {e}");
                DrainSummary {
                    stop_reason: Some(format!("reader task failed: {e}")),
                    ..DrainSummary::default()
                }
            }),
            None => DrainSummary::default(),
        };
        self.summary = Some(summary.clone());
        summary
    }

    /// True once the reader has returned, whether stopped or failed
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

#[derive(Debug, Default)]
struct ReaderStats {
    delivered: u64,
    queue_drops: u64,
    late_drops: u64,
}

struct Reader<S> {
    source: S,
    tx: Sender<DebugEvent>,
    decoder: EventDecoder,
    stats: ReaderStats,
    _live: LiveGuard,
}

impl<S: EventSource> Reader<S> {
    async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
        config: CaptureConfig,
        started: Instant,
    ) -> DrainSummary {
        let mut stop_reason = None;

        loop {
            if *cancel.borrow_and_update() {
                break;
            }
            tokio::select! {
                ready = self.source.wait_readable(config.poll_timeout) => {
                    if let Err(e) = ready {
                        error!("Ring buffer wait failed: {e}");
                        stop_reason = Some(format!("ring wait failed: {e}"));
                        break;
                    }
                }
                changed = cancel.changed() => {
                    // Handle dropped without stop: treat as cancellation
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if let Err(e) =
                forward(self.source.drain(), &mut self.decoder, &self.tx, &mut self.stats)
            {
                warn!("Reader stopping: {e}");
                stop_reason = Some("processor channel closed".to_string());
                break;
            }
        }

        self.finish(&config, started, stop_reason)
    }

    fn finish(
        mut self,
        config: &CaptureConfig,
        started: Instant,
        stop_reason: Option<String>,
    ) -> DrainSummary {
        let quiesced = match self.source.quiesce() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to quiesce probes: {e}");
                false
            }
        };

        let deadline = Instant::now() + config.drain_timeout;
        if stop_reason.is_none() {
            while Instant::now() < deadline {
                let mut records = self.source.drain().peekable();
                if records.peek().is_none() {
                    break;
                }
                if forward(records, &mut self.decoder, &self.tx, &mut self.stats).is_err() {
                    break;
                }
            }
        }
        // Each drain is capped; empty the source unless the probes still fire
        let mut late = 0u64;
        loop {
            let batch = self.source.drain().count() as u64;
            late += batch;
            if batch == 0 || !quiesced {
                break;
            }
        }
        if late > 0 {
            debug!("{late} records arrived after the drain deadline");
        }
        self.stats.late_drops += late;

        let counters = self.source.counters();
        let summary = DrainSummary {
            frames_delivered: self.stats.delivered,
            events_fired: counters.fired,
            events_filtered: counters.filtered,
            events_dropped: counters.dropped + self.stats.queue_drops + self.stats.late_drops,
            ring_drops: counters.dropped,
            queue_drops: self.stats.queue_drops,
            late_drops: self.stats.late_drops,
            decode_errors: self.decoder.decode_errors,
            duration: started.elapsed(),
            stop_reason,
        };
        info!(
            "✓ Collector stopped: {} delivered, {} dropped",
            summary.frames_delivered, summary.events_dropped
        );
        summary
    }
}

/// Decode and enqueue records until the iterator ends
///
/// A full queue drops the event. A disconnected queue stops forwarding; the
/// records not yet consumed stay in the source.
fn forward(
    records: impl Iterator<Item = Vec<u8>>,
    decoder: &mut EventDecoder,
    tx: &Sender<DebugEvent>,
    stats: &mut ReaderStats,
) -> Result<(), CaptureError> {
    for record in records {
        let Some(event) = decoder.decode(&record) else {
            continue;
        };
        match tx.try_send(event) {
            Ok(()) => stats.delivered += 1,
            Err(TrySendError::Full(_)) => stats.queue_drops += 1,
            Err(TrySendError::Disconnected(_)) => {
                stats.queue_drops += 1;
                return Err(CaptureError::ChannelClosed);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::ProbeCounters;
    use crate::capture::synthetic::{SyntheticBackend, SyntheticEvent};
    use crate::domain::BreakpointId;

    fn targets() -> Vec<ProbeTarget> {
        vec![ProbeTarget { function: "foo".to_string(), breakpoint_id: BreakpointId(1) }]
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_live() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let config = CaptureConfig::default();

        let (mut handle, _rx) = collector.start(&mut backend, &targets(), &config).unwrap();
        let second = collector.start(&mut backend, &targets(), &config);
        assert!(matches!(second, Err(CaptureError::AlreadyRunning)), "one reader at a time");

        handle.stop().await;
        assert!(!collector.is_live());
        assert!(collector.start(&mut backend, &targets(), &config).is_ok(), "restart after stop");
    }

    #[tokio::test]
    async fn test_failed_install_releases_collector() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let result = collector.start(&mut backend, &[], &CaptureConfig::default());
        assert!(matches!(result, Err(CaptureError::NoTargets)));
        assert!(!collector.is_live(), "no reader after failed install");
    }

    #[tokio::test]
    async fn test_ring_overflow_is_accounted() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let config = CaptureConfig { ring_size: 2048, ..CaptureConfig::default() };
        let (mut handle, rx) = collector.start(&mut backend, &targets(), &config).unwrap();

        let probe = backend.probe();
        for ts in 0..10 {
            let _ = probe.fire(&SyntheticEvent::new("foo").timestamp_ns(ts).build());
        }

        let summary = handle.stop().await;
        assert_eq!(summary.frames_delivered, 4, "2048-byte ring holds 4 events");
        assert_eq!(summary.ring_drops, 6);
        assert_eq!(summary.events_dropped, 10 - summary.frames_delivered);
        assert!(summary.is_balanced(), "accounting: {summary:?}");
        assert_eq!(rx.try_iter().count(), 4);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let config = CaptureConfig { queue_capacity: 2, ..CaptureConfig::default() };
        let (mut handle, rx) = collector.start(&mut backend, &targets(), &config).unwrap();

        let probe = backend.probe();
        for ts in 1..=5 {
            probe.fire(&SyntheticEvent::new("foo").timestamp_ns(ts).build()).unwrap();
        }

        let summary = handle.stop().await;
        assert_eq!(summary.frames_delivered, 2);
        assert_eq!(summary.queue_drops, 3);
        assert!(summary.is_balanced());
        let kept: Vec<u64> = rx.try_iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(kept, vec![1, 2], "oldest events survive");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let (mut handle, _rx) =
            collector.start(&mut backend, &targets(), &CaptureConfig::default()).unwrap();
        backend.probe().fire(&SyntheticEvent::new("foo").build()).unwrap();

        let first = handle.stop().await;
        let second = handle.stop().await;
        assert_eq!(first, second);
        assert_eq!(first.frames_delivered, 1);
        assert!(!backend.probe().is_installed(), "probes removed on stop");
    }

    /// Source that hands out at most `batch` records per drain
    struct CappedSource {
        records: std::collections::VecDeque<Vec<u8>>,
        batch: usize,
        fired: u64,
    }

    impl EventSource for CappedSource {
        fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
            let n = self.batch.min(self.records.len());
            self.records.drain(..n)
        }

        async fn wait_readable(&mut self, timeout: Duration) -> std::io::Result<()> {
            tokio::time::sleep(timeout).await;
            Ok(())
        }

        fn quiesce(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn counters(&mut self) -> ProbeCounters {
            ProbeCounters { fired: self.fired, ..ProbeCounters::default() }
        }
    }

    #[tokio::test]
    async fn test_late_drops_cover_more_than_one_drain() {
        let record = crate::capture::event::encode_event(&SyntheticEvent::new("foo").build());
        let source = CappedSource { records: vec![record; 10].into(), batch: 3, fired: 10 };
        let (tx, _rx) = bounded(100);
        let reader = Reader {
            source,
            tx,
            decoder: EventDecoder::default(),
            stats: ReaderStats::default(),
            _live: LiveGuard(Arc::new(AtomicBool::new(true))),
        };
        let (cancel_tx, cancel_rx) = watch::channel(true);
        let config = CaptureConfig { drain_timeout: Duration::ZERO, ..CaptureConfig::default() };

        let summary = reader.run(cancel_rx, config, Instant::now()).await;
        drop(cancel_tx);
        assert_eq!(summary.frames_delivered + summary.late_drops, 10);
        assert!(summary.is_balanced(), "accounting: {summary:?}");
    }

    #[tokio::test]
    async fn test_closed_queue_ends_reader() {
        let collector = Collector::new();
        let mut backend = SyntheticBackend::new();
        let (mut handle, rx) =
            collector.start(&mut backend, &targets(), &CaptureConfig::default()).unwrap();
        drop(rx);
        backend.probe().fire(&SyntheticEvent::new("foo").build()).unwrap();

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_finished(), "reader exits when the processor goes away");

        let summary = handle.stop().await;
        assert_eq!(summary.stop_reason.as_deref(), Some("processor channel closed"));
        assert!(summary.is_balanced());
    }
}
