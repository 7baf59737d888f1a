use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{BrokerEnv, FuzzConfig};
use crate::control::ControlService;
use crate::shutdown::{
    BackgroundTasks, ShutdownCoordinator, ShutdownTrigger, install_signal_handlers,
};
use crate::sync::CorpusSynchronizer;
use crate::worker::process::{ExitOutcome, WorkerHandle, WorkerSpec};

/// Broker lifecycle; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// The one pool of this process: worker handles in spawn order (master
/// first), the target parallelism, and the aggregated return code.
pub struct PoolState {
    pub workers: Vec<WorkerHandle>,
    pub parallelism: usize,
    pub rc: i32,
    phase: LifecyclePhase,
}

impl PoolState {
    fn new(parallelism: usize) -> Self {
        Self {
            workers: Vec::new(),
            parallelism,
            rc: 0,
            phase: LifecyclePhase::Starting,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Same-phase transitions are no-ops; a step backwards is a logic error.
    pub fn advance(&mut self, next: LifecyclePhase) {
        debug_assert!(next >= self.phase);
        if next > self.phase {
            self.phase = next;
        }
    }

    /// First positive exit code in spawn order poisons the overall result;
    /// signal-terminated workers never do.
    pub fn aggregate_rc(&mut self) {
        self.rc = first_crash_code(self.workers.iter().map(|worker| worker.outcome)).unwrap_or(0);
    }
}

pub fn first_crash_code(outcomes: impl Iterator<Item = ExitOutcome>) -> Option<i32> {
    outcomes.filter_map(ExitOutcome::crash_code).next()
}

/// Owns the worker pool for one campaign: spawns it, watches it, and drives
/// the shutdown sequence to a final process exit code.
pub struct PoolSupervisor {
    env: BrokerEnv,
    config: FuzzConfig,
    state: PoolState,
}

impl PoolSupervisor {
    pub fn new(env: BrokerEnv, config: FuzzConfig) -> Self {
        let state = PoolState::new(env.cpus);
        Self { env, config, state }
    }

    /// One master first, then slaves in increasing index order. Sequential
    /// so name assignment stays deterministic.
    fn build_specs(&self) -> Vec<WorkerSpec> {
        let worker_env = self.config.worker_env();
        let mut specs = Vec::with_capacity(self.state.parallelism);
        specs.push(WorkerSpec::master(
            &self.env.id,
            &self.env.guid,
            worker_env.clone(),
            self.env.fuzz_dir.clone(),
        ));
        for index in 1..self.state.parallelism {
            let suffix = format!("{}{}", self.env.id, index);
            specs.push(WorkerSpec::slave(
                &suffix,
                worker_env.clone(),
                self.env.fuzz_dir.clone(),
            ));
        }
        specs
    }

    /// Spawn the pool. A failed spawn aborts startup; siblings already
    /// running are left to the outer supervision that reaps this process.
    pub fn start(&mut self) -> Result<()> {
        for spec in self.build_specs() {
            let handle = WorkerHandle::spawn(&spec)?;
            info!(worker = %handle.name, "spawned fuzzer");
            self.state.workers.push(handle);
        }
        self.state.advance(LifecyclePhase::Running);
        Ok(())
    }

    /// Drive the full lifecycle and return the final process exit code.
    pub async fn run(mut self) -> Result<i32> {
        self.start()?;

        let trigger = Arc::new(ShutdownTrigger::new());
        install_signal_handlers(trigger.clone())?;

        let sync = CorpusSynchronizer::new(
            self.env.local_out(),
            self.env.result_dir.clone(),
            self.env.master_name(),
        );
        let control = ControlService::new(&self.env, &self.config);
        let tasks = BackgroundTasks::start(
            sync.clone(),
            Duration::from_secs(self.env.sync_interval),
            control,
        );
        let mut coordinator = ShutdownCoordinator::new(trigger.clone());

        self.monitor_exits(&trigger, &mut coordinator).await;
        info!("fuzzers exited");

        // Natural-exit path: all workers left on their own. A no-op when a
        // signal already fired the trigger.
        trigger.fire();
        self.state.advance(LifecyclePhase::ShuttingDown);
        coordinator.kill_workers(&self.state.workers);
        coordinator.cancel_tasks(tasks).await;
        coordinator.final_sync(&sync).await;

        self.state.aggregate_rc();
        self.state.advance(LifecyclePhase::Stopped);
        coordinator.complete();
        Ok(self.state.rc)
    }

    /// Wait until every worker has exited, recording each completed wait as
    /// it lands (first-completion semantics). A fired shutdown trigger
    /// terminates the remaining process groups, which makes this loop
    /// converge quickly.
    async fn monitor_exits(
        &mut self,
        trigger: &Arc<ShutdownTrigger>,
        coordinator: &mut ShutdownCoordinator,
    ) {
        let mut exits: JoinSet<(usize, std::io::Result<ExitStatus>)> = JoinSet::new();
        for (index, handle) in self.state.workers.iter_mut().enumerate() {
            if let Some(mut child) = handle.take_child() {
                exits.spawn(async move { (index, child.wait().await) });
            }
        }

        while !exits.is_empty() {
            tokio::select! {
                _ = trigger.wait(), if !coordinator.workers_killed() => {
                    self.state.advance(LifecyclePhase::ShuttingDown);
                    coordinator.kill_workers(&self.state.workers);
                }
                joined = exits.join_next() => match joined {
                    Some(Ok((index, Ok(status)))) => {
                        let outcome = ExitOutcome::from_status(status);
                        info!(worker = %self.state.workers[index].name, ?outcome, "fuzzer exited");
                        self.state.workers[index].record_exit(outcome);
                    }
                    Some(Ok((index, Err(err)))) => {
                        warn!(worker = %self.state.workers[index].name, %err, "failed to observe fuzzer exit");
                        self.state.workers[index].record_exit(ExitOutcome::Unknown);
                    }
                    Some(Err(err)) => warn!(%err, "exit monitor task failed"),
                    None => break,
                },
            }
        }
    }
}
