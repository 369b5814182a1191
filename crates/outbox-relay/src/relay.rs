//! Main relay loop orchestration.

use crate::change_source::ChangeSource;
use crate::config::{RelayConfig, SourceKind};
use crate::dispatcher::{CycleReport, Dispatcher};
use crate::error::{RelayError, RelayResult};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Last time the dispatch loop proved it is alive.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last_beat_ms: Arc<AtomicI64>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// A heartbeat that has never beaten.
    pub fn new() -> Self {
        Self {
            last_beat_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    /// Time since the last beat, `None` before the first one.
    pub fn age(&self) -> Option<Duration> {
        let last = self.last_beat_ms.load(Ordering::SeqCst);
        if last == 0 {
            return None;
        }
        let elapsed = Utc::now().timestamp_millis().saturating_sub(last).max(0);
        Some(Duration::from_millis(elapsed as u64))
    }

    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age().is_some_and(|age| age <= window)
    }
}

/// Sender half of the cooperative shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Stop pulling new records. In-flight deliveries finish.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Totals over the lifetime of one `run`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub totals: CycleReport,
}

impl RunSummary {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        let t = &mut self.totals;
        t.received += report.received;
        t.acked += report.acked;
        t.already_published += report.already_published;
        t.retried += report.retried;
        t.rejected_poison += report.rejected_poison;
        t.rejected_permanent += report.rejected_permanent;
        t.skipped += report.skipped;
        t.deferred += report.deferred;
    }
}

/// Loop pacing.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl From<&RelayConfig> for LoopSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
        }
    }
}

/// The relay: one dispatch loop over one change source.
pub struct Relay {
    source: ChangeSource,
    dispatcher: Dispatcher,
    heartbeat: Heartbeat,
    shutdown: watch::Receiver<bool>,
    settings: LoopSettings,
}

impl Relay {
    pub fn new(
        source: ChangeSource,
        dispatcher: Dispatcher,
        heartbeat: Heartbeat,
        shutdown: watch::Receiver<bool>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            dispatcher,
            heartbeat,
            shutdown,
            settings,
        }
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Run until shutdown is triggered.
    ///
    /// Errors inside a cycle are logged and retried after a pause; they
    /// never end the loop.
    pub async fn run(&mut self) -> RunSummary {
        info!(source = self.source.kind().as_str(), "Starting relay loop");

        let mut summary = RunSummary::default();

        while !*self.shutdown.borrow() {
            self.heartbeat.beat();

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    summary.add(&report);
                    self.pause_after(&report)
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    error!(error = %e, "Relay cycle failed");
                    self.recover(&e).await
                }
            };

            if pause.is_zero() {
                continue;
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(
            cycles = summary.cycles,
            failed_cycles = summary.failed_cycles,
            acked = summary.totals.acked,
            retried = summary.totals.retried,
            rejected = summary.totals.rejected_poison + summary.totals.rejected_permanent,
            "Relay loop stopped"
        );

        summary
    }

    /// Pull one batch, dispatch it and commit what is final.
    pub async fn run_cycle(&mut self) -> RelayResult<CycleReport> {
        let records = self.source.next_batch().await?;
        if records.is_empty() {
            debug!("No change records available");
            return Ok(CycleReport::default());
        }

        let batch = self.dispatcher.dispatch_batch(records).await;
        self.source.remember_rejected(&batch.rejected_ids);
        self.source.commit(&batch.commit).await?;

        let report = batch.report;
        info!(
            received = report.received,
            acked = report.acked,
            already_published = report.already_published,
            retried = report.retried,
            rejected_poison = report.rejected_poison,
            rejected_permanent = report.rejected_permanent,
            skipped = report.skipped,
            deferred = report.deferred,
            "Relay cycle complete"
        );

        Ok(report)
    }

    fn pause_after(&self, report: &CycleReport) -> Duration {
        match self.source.kind() {
            // A full batch that published rows means there is likely more.
            SourceKind::Polling
                if report.received >= self.settings.batch_size
                    && report.made_progress()
                    && !report.has_leftovers() =>
            {
                Duration::ZERO
            }
            SourceKind::Polling => self.settings.poll_interval,
            // The stream read blocks by itself; only back off from retries.
            SourceKind::Streaming if report.has_leftovers() => self.settings.poll_interval,
            SourceKind::Streaming => Duration::ZERO,
        }
    }

    async fn recover(&mut self, e: &RelayError) -> Duration {
        if e.is_stream_error() {
            warn!("Change stream error, attempting to reconnect...");
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(reconnect_err) = self.source.recover().await {
                error!(error = %reconnect_err, "Failed to reconnect change stream");
                return Duration::from_secs(5);
            }
            return Duration::ZERO;
        }

        // Database and other transient errors: wait for the next cycle.
        self.settings.poll_interval.max(Duration::from_millis(500))
    }
}
