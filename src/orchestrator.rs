//! # Load Test Orchestration
//!
//! Drives every worker through the same lifecycle:
//!
//! ```text
//! init -> start -> { sleep delay, pause, stat, report, unpause } x iterations -> stop_proc
//! ```
//!
//! Each phase fans the command out to all workers concurrently and waits for
//! every acknowledgment before the next phase begins. `pause` is the
//! measurement barrier: `stat` is only sent once every worker has stopped
//! counting, so the merged sample is a consistent cross-worker snapshot.
//!
//! Whatever happens, `run` kills every worker before it returns.

use crate::aggregate::{barrier_skew, merge, SkewTracker, StatSample, WindowDelta};
use crate::cli::LoadTestConfig;
use crate::collector::{total_memory, MemoryUsage, ServerStats, StatsCollector};
use crate::error::{LoadTestError, SpawnError};
use crate::handle::{WorkerCommand, WorkerHandle};
use crate::report::{FinalReport, IterationReport, ReportLog, RunReport};
use crate::rpc::{WorkerControl, WorkerStats};
use anyhow::Result;
use futures_util::future::{join_all, try_join_all};
use std::time::Instant;
use tracing::{debug, info};

pub struct Orchestrator<W: WorkerControl> {
    workers: Vec<W>,
    config: LoadTestConfig,
    collector: Box<dyn StatsCollector>,
    report: ReportLog,
}

impl Orchestrator<WorkerHandle> {
    /// Spawn `config.instances` worker processes concurrently.
    ///
    /// If any worker fails to come up, the ones that did are killed and the
    /// first failure is returned.
    pub async fn spawn(
        command: &WorkerCommand,
        config: LoadTestConfig,
        collector: Box<dyn StatsCollector>,
        report: ReportLog,
    ) -> Result<Self, LoadTestError> {
        info!("Spawning {} worker instance(s)", config.instances);
        let results = join_all(
            (0..config.instances).map(|_| WorkerHandle::spawn(command, config.startup_timeout)),
        )
        .await;

        let mut workers = Vec::with_capacity(results.len());
        let mut failure: Option<(usize, SpawnError)> = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(handle) => {
                    debug!("Worker {} listening on {}", index, handle.endpoint());
                    workers.push(handle);
                }
                Err(source) => {
                    if failure.is_none() {
                        failure = Some((index, source));
                    }
                }
            }
        }

        if let Some((worker, source)) = failure {
            for handle in workers.iter_mut() {
                handle.kill();
            }
            return Err(LoadTestError::Spawn { worker, source });
        }

        Ok(Self::with_workers(workers, config, collector, report))
    }
}

impl<W: WorkerControl> Orchestrator<W> {
    /// Drive an already constructed set of workers.
    pub fn with_workers(
        workers: Vec<W>,
        config: LoadTestConfig,
        collector: Box<dyn StatsCollector>,
        report: ReportLog,
    ) -> Self {
        Self {
            workers,
            config,
            collector,
            report,
        }
    }

    pub fn workers(&self) -> &[W] {
        &self.workers
    }

    /// Run the whole test and return its structured summary.
    ///
    /// Every worker is killed before this returns, on success and on error.
    pub async fn run(&mut self) -> Result<RunReport> {
        let result = self.drive().await;
        self.kill_all();
        result
    }

    fn kill_all(&mut self) {
        for worker in self.workers.iter_mut() {
            worker.kill();
        }
        debug!("Terminated {} worker(s)", self.workers.len());
    }

    async fn drive(&mut self) -> Result<RunReport> {
        let mut summary = RunReport::new(self.config.clone());
        summary.worker_pids = self.workers.iter().filter_map(|w| w.pid()).collect();

        let pids = self.monitored_pids(&summary.worker_pids);
        let initial_memory = self.memory_snapshot(&pids)?;
        self.report.log_memory("Initial memory usage:", &initial_memory)?;

        let settings = self.config.init_settings();
        try_join_all(self.workers.iter_mut().enumerate().map(|(index, worker)| {
            let settings = settings.clone();
            async move { worker.init(settings).await.map_err(|e| e.for_worker(index)) }
        }))
        .await?;
        info!("All {} worker(s) initialized", self.workers.len());

        try_join_all(self.workers.iter_mut().enumerate().map(|(index, worker)| async move {
            worker.start().await.map_err(|e| e.for_worker(index))
        }))
        .await?;
        let started = Instant::now();
        self.report.info("Monitoring stats")?;

        let mut skew = SkewTracker::new()?;
        let mut previous = StatSample::ZERO;
        for index in 0..self.config.iterations {
            let window_start = Instant::now();
            tokio::time::sleep(self.config.delay).await;

            let acks = try_join_all(self.workers.iter_mut().enumerate().map(
                |(worker_index, worker)| async move {
                    worker
                        .pause()
                        .await
                        .map_err(|e| e.for_worker(worker_index))?;
                    Ok::<_, LoadTestError>(Instant::now())
                },
            ))
            .await?;
            let pause_skew = barrier_skew(&acks);
            skew.record(pause_skew)?;

            let stats = self.stat_all().await?;
            let per_worker: Vec<StatSample> = stats.iter().map(|s| s.sample).collect();
            let totals = merge(&per_worker);
            let elapsed = window_start.elapsed();
            let connections_alive = self.check_connections(&stats)?;

            let entry = IterationReport {
                index,
                elapsed,
                totals,
                window: WindowDelta::between(&previous, &totals, elapsed),
                per_worker,
                pause_skew_ns: pause_skew.as_nanos() as u64,
                connections_alive,
                server: self.server_stats()?,
                memory: self.memory_snapshot(&pids)?,
            };
            self.report.log_iteration(&entry)?;
            previous = totals;
            summary.iterations.push(entry);

            try_join_all(self.workers.iter_mut().enumerate().map(|(worker_index, worker)| async move {
                worker.unpause().await.map_err(|e| e.for_worker(worker_index))
            }))
            .await?;
        }

        let per_worker = try_join_all(self.workers.iter_mut().enumerate().map(|(index, worker)| async move {
            worker.stop_proc().await.map_err(|e| e.for_worker(index))
        }))
        .await?;
        let totals = merge(&per_worker);
        let elapsed = started.elapsed();
        info!("All worker(s) stopped after {:.1}s", elapsed.as_secs_f64());

        let final_memory = self.memory_snapshot(&pids)?;
        let final_report = FinalReport {
            totals,
            per_worker,
            elapsed,
            server: self.server_stats()?,
            skew: skew.summary(),
            memory_start_total: total_memory(&initial_memory),
            memory_end_total: total_memory(&final_memory),
        };
        self.report.log_final(&final_report)?;

        summary.initial_memory = initial_memory;
        summary.final_report = Some(final_report);
        Ok(summary)
    }

    async fn stat_all(&mut self) -> Result<Vec<WorkerStats>, LoadTestError> {
        try_join_all(self.workers.iter_mut().enumerate().map(|(index, worker)| async move {
            worker.stat_with_health().await.map_err(|e| e.for_worker(index))
        }))
        .await
    }

    /// Total live connections. Workers whose connections dropped are
    /// reported as warnings; the run goes on with reduced load.
    fn check_connections(&mut self, stats: &[WorkerStats]) -> Result<u64> {
        let expected = self.config.connections as u64;
        let mut alive = 0u64;
        for (index, worker) in stats.iter().enumerate() {
            let worker_alive = u64::from(worker.connections_alive);
            alive += worker_alive;
            if worker_alive < expected {
                self.report.warn(format!(
                    "Worker {}: only {} of {} connections alive",
                    index, worker_alive, expected
                ))?;
            }
        }
        Ok(alive)
    }

    /// Watched processes followed by the worker processes, without duplicates.
    fn monitored_pids(&self, worker_pids: &[u32]) -> Vec<u32> {
        let mut pids = self.config.watch_pids.clone();
        for pid in worker_pids {
            if !pids.contains(pid) {
                pids.push(*pid);
            }
        }
        pids
    }

    /// Memory of `pids`. Unreadable processes are logged as warnings and
    /// left out.
    fn memory_snapshot(&mut self, pids: &[u32]) -> Result<MemoryUsage> {
        let (usage, errors) = self.collector.memory_usage(pids);
        for error in errors {
            self.report.warn(format!("Memory usage unavailable: {}", error))?;
        }
        Ok(usage)
    }

    fn server_stats(&mut self) -> Result<Option<ServerStats>> {
        match self.collector.server_reported_stats(&self.config.ws_server) {
            Ok(stats) => Ok(Some(stats)),
            Err(error) => {
                debug!("{}", error);
                Ok(None)
            }
        }
    }
}
