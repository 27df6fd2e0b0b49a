//! Background driver for the sync scheduler.
//!
//! A clock task emits tick events into a channel; a worker task consumes
//! them, runs one scheduler tick per event and reports each completion
//! back. Tests skip the clock and inject ticks with [`SyncDriver::inject_tick`].
//!
//! The tick channel holds a single event, so ticks that arrive while the
//! worker is busy are coalesced rather than queued.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::scheduler::{SyncScheduler, TickReport};
use crate::types::StoreError;

const COMPLETION_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    Tick(DateTime<Utc>),
    Shutdown,
}

pub type TickResult = Result<TickReport, StoreError>;

pub struct SyncDriver {
    scheduler: Arc<Mutex<SyncScheduler>>,
    ticks: mpsc::Sender<DriverEvent>,
    cancel: watch::Sender<bool>,
    completions: mpsc::Receiver<TickResult>,
    worker: JoinHandle<()>,
    clock: Option<JoinHandle<()>>,
}

impl SyncDriver {
    /// Start the worker, plus a clock when `period` is given. The first
    /// clock tick fires immediately.
    pub fn start(scheduler: Arc<Mutex<SyncScheduler>>, period: Option<Duration>) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_BUFFER);

        let worker = tokio::spawn(run_worker(
            Arc::clone(&scheduler),
            tick_rx,
            cancel_rx.clone(),
            done_tx,
        ));
        let clock = period.map(|p| tokio::spawn(run_clock(p, tick_tx.clone(), cancel_rx)));

        info!(period_secs = period.map(|p| p.as_secs()), "Sync driver started");
        Self {
            scheduler,
            ticks: tick_tx,
            cancel: cancel_tx,
            completions: done_rx,
            worker,
            clock,
        }
    }

    /// Queue a synthetic tick. Waits while a previous tick is queued.
    /// Returns false once the worker has stopped.
    pub async fn inject_tick(&self, now: DateTime<Utc>) -> bool {
        self.ticks.send(DriverEvent::Tick(now)).await.is_ok()
    }

    /// Next finished tick, or `None` once the worker has stopped.
    pub async fn next_completion(&mut self) -> Option<TickResult> {
        self.completions.recv().await
    }

    /// Cancel any running tick, stop both tasks and requeue anything left
    /// in flight.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.ticks.try_send(DriverEvent::Shutdown);
        drop(self.ticks);

        if let Some(clock) = self.clock {
            if let Err(e) = clock.await {
                warn!(error = %e, "Clock task ended abnormally");
            }
        }
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Sync worker ended abnormally");
        }

        let recovered = self.scheduler.lock().await.recover_in_flight(Utc::now());
        info!(recovered, "Sync driver stopped");
    }
}

async fn run_clock(
    period: Duration,
    ticks: mpsc::Sender<DriverEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match ticks.try_send(DriverEvent::Tick(Utc::now())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => debug!("Tick coalesced, previous tick still queued"),
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_worker(
    scheduler: Arc<Mutex<SyncScheduler>>,
    mut ticks: mpsc::Receiver<DriverEvent>,
    cancel: watch::Receiver<bool>,
    completions: mpsc::Sender<TickResult>,
) {
    while let Some(event) = ticks.recv().await {
        let now = match event {
            DriverEvent::Tick(now) => now,
            DriverEvent::Shutdown => break,
        };
        if *cancel.borrow() {
            break;
        }

        // Held for the whole tick. Reads go through the published task snapshot.
        let result = {
            let mut sched = scheduler.lock().await;
            sched.tick_cancellable(now, cancel.clone()).await
        };

        match &result {
            Ok(report) => {
                if let Some(err) = report.auth_failure() {
                    error!(error = %err, "Sync halted for affected tasks: authentication failed");
                }
            }
            Err(e) => error!(error = %e, "Tick aborted by store failure"),
        }

        match completions.try_send(result) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => debug!("Tick completion dropped, nobody reading"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
