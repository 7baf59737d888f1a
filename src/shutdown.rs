use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::ControlService;
use crate::sync::CorpusSynchronizer;
use crate::worker::process::WorkerHandle;

/// Single-fire shutdown signal, raised by a termination signal or by the
/// exit monitor once every worker is gone.
pub struct ShutdownTrigger {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Raise the trigger. Returns true only for the first caller.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Completes once the trigger has fired, however long ago; wait_for
    /// inspects the current value first, so late subscribers don't miss it.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Route SIGTERM and SIGINT into the trigger. The handler task only fires
/// the trigger; all suspend-capable shutdown logic runs in the coordinator.
/// A second signal is logged and otherwise ignored.
pub fn install_signal_handlers(trigger: Arc<ShutdownTrigger>) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            if trigger.fire() {
                info!(signal = name, "received termination signal");
            } else {
                debug!(signal = name, "shutdown already in progress");
            }
        }
    });
    Ok(())
}

/// The background activities the coordinator owns and may cancel: the
/// periodic corpus sync and the control service. Cancellation scope is this
/// explicit registry, nothing else.
pub struct BackgroundTasks {
    sync: JoinHandle<()>,
    control: JoinHandle<()>,
    control_stop: Arc<Notify>,
}

impl BackgroundTasks {
    pub fn start(sync: CorpusSynchronizer, interval: Duration, control: ControlService) -> Self {
        let sync_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                sync.run().await;
            }
        });
        let control_stop = Arc::new(Notify::new());
        let stop = control_stop.clone();
        let control_task = tokio::spawn(async move { control.serve(stop).await });
        Self {
            sync: sync_task,
            control: control_task,
            control_stop,
        }
    }

    /// Stop the control service first (no new connections), then cancel the
    /// periodic sync. Cancellation is expected here and never surfaces as an
    /// error; only a panicked task is worth a warning.
    pub async fn cancel(self) {
        let Self {
            sync,
            control,
            control_stop,
        } = self;
        control_stop.notify_one();
        sync.abort();
        for (name, handle) in [("sync", sync), ("control", control)] {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => debug!(task = name, "task cancelled"),
                Err(err) => warn!(task = name, %err, "task failed during shutdown"),
            }
        }
    }
}

/// Shutdown progresses through these phases exactly once, strictly in
/// order; a completed step re-invoked is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Armed,
    Triggered,
    WorkersKilled,
    TasksCancelled,
    FinalSyncDone,
    Complete,
}

pub struct ShutdownCoordinator {
    phase: ShutdownPhase,
    trigger: Arc<ShutdownTrigger>,
}

impl ShutdownCoordinator {
    pub fn new(trigger: Arc<ShutdownTrigger>) -> Self {
        Self {
            phase: ShutdownPhase::Armed,
            trigger,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.phase
    }

    pub fn workers_killed(&self) -> bool {
        self.phase >= ShutdownPhase::WorkersKilled
    }

    fn advance(&mut self, next: ShutdownPhase) {
        debug_assert!(next >= self.phase);
        if next > self.phase {
            debug!(?next, "shutdown phase");
            self.phase = next;
        }
    }

    /// Terminate every process group still running; a no-op for workers
    /// whose exit was already observed, and for the whole call once done.
    pub fn kill_workers(&mut self, workers: &[WorkerHandle]) {
        if self.workers_killed() {
            return;
        }
        debug_assert!(self.trigger.is_fired());
        self.advance(ShutdownPhase::Triggered);
        for worker in workers {
            worker.terminate();
        }
        self.advance(ShutdownPhase::WorkersKilled);
    }

    /// Cancel the coordinator-owned background tasks, absorbing their
    /// cancellation errors.
    pub async fn cancel_tasks(&mut self, tasks: BackgroundTasks) {
        if self.phase >= ShutdownPhase::TasksCancelled {
            return;
        }
        tasks.cancel().await;
        self.advance(ShutdownPhase::TasksCancelled);
    }

    /// The one load-bearing sync: runs after every worker exit is confirmed
    /// and the periodic task is cancelled, so it cannot race another pass
    /// and reflects each worker's terminal output.
    pub async fn final_sync(&mut self, sync: &CorpusSynchronizer) {
        if self.phase >= ShutdownPhase::FinalSyncDone {
            return;
        }
        sync.run().await;
        self.advance(ShutdownPhase::FinalSyncDone);
    }

    pub fn complete(&mut self) {
        self.advance(ShutdownPhase::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_tasks() -> BackgroundTasks {
        BackgroundTasks {
            sync: tokio::spawn(std::future::pending()),
            control: tokio::spawn(async {}),
            control_stop: Arc::new(Notify::new()),
        }
    }

    #[test]
    fn trigger_fires_exactly_once() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_fired());
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(trigger.is_fired());
    }

    #[tokio::test]
    async fn wait_completes_for_late_subscribers() {
        let trigger = ShutdownTrigger::new();
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), trigger.wait())
            .await
            .expect("wait did not complete");
    }

    #[tokio::test]
    async fn wait_completes_for_early_subscribers() {
        let trigger = Arc::new(ShutdownTrigger::new());
        let waiter = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.wait().await }
        });
        tokio::task::yield_now().await;
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait did not complete")
            .expect("waiter panicked");
    }

    #[tokio::test]
    async fn cancellation_is_absorbed() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownTrigger::new()));
        coordinator.advance(ShutdownPhase::WorkersKilled);
        coordinator.cancel_tasks(idle_tasks()).await;
        assert_eq!(coordinator.phase(), ShutdownPhase::TasksCancelled);
    }

    #[tokio::test]
    async fn phases_never_run_twice() {
        let trigger = Arc::new(ShutdownTrigger::new());
        trigger.fire();
        let mut coordinator = ShutdownCoordinator::new(trigger);

        coordinator.kill_workers(&[]);
        assert_eq!(coordinator.phase(), ShutdownPhase::WorkersKilled);
        // Second signal path: already killed, nothing to do.
        coordinator.kill_workers(&[]);
        assert_eq!(coordinator.phase(), ShutdownPhase::WorkersKilled);

        coordinator.cancel_tasks(idle_tasks()).await;
        coordinator.cancel_tasks(idle_tasks()).await;
        assert_eq!(coordinator.phase(), ShutdownPhase::TasksCancelled);

        let dir = tempfile::tempdir().expect("tempdir");
        let sync = CorpusSynchronizer::new(
            dir.path().join("out"),
            dir.path().join("res"),
            "master_h1".to_string(),
        );
        coordinator.final_sync(&sync).await;
        coordinator.final_sync(&sync).await;
        assert_eq!(coordinator.phase(), ShutdownPhase::FinalSyncDone);

        coordinator.complete();
        assert_eq!(coordinator.phase(), ShutdownPhase::Complete);
    }
}
