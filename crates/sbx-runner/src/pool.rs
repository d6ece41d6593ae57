//! Fixed fan-in worker pool for one cohort of commands.
//!
//! The producer pushes every command into a bounded channel sized to the
//! cohort; workers drain it until it is closed and empty. `run_cohort` returns
//! only after every worker has exited.

use crossbeam::channel;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{CommandReport, ExecutionItem};
use crate::config::{EngineConfig, OperationCounter};

#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) index: usize,
    pub(crate) item: ExecutionItem,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerPool {
    max_workers: Option<usize>,
    command_timeout: Option<Duration>,
    echo_output: bool,
    counter: OperationCounter,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            command_timeout: config.command_timeout,
            echo_output: config.echo_output(),
            counter: config.counter.clone(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers.filter(|n| *n > 0);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn with_counter(mut self, counter: OperationCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter(&self) -> &OperationCounter {
        &self.counter
    }

    /// One worker per command, capped by `max_workers` when set.
    pub fn worker_count(&self, cohort_len: usize) -> usize {
        match self.max_workers {
            Some(limit) => cohort_len.min(limit),
            None => cohort_len,
        }
    }

    /// Runs `items` concurrently and blocks until all of them have finished.
    /// Reports come back in completion order; `index` is the position in
    /// `items`.
    pub fn run_cohort(&self, items: Vec<ExecutionItem>) -> Vec<CommandReport> {
        let dispatches = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Dispatch { index, item })
            .collect();
        self.run_dispatches(dispatches)
    }

    pub(crate) fn run_dispatches(&self, cohort: Vec<Dispatch>) -> Vec<CommandReport> {
        if cohort.is_empty() {
            return Vec::new();
        }
        let level = cohort[0].item.level;
        let workers = self.worker_count(cohort.len());
        let (task_tx, task_rx) = channel::bounded::<Dispatch>(cohort.len());
        let (report_tx, report_rx) = channel::unbounded::<CommandReport>();
        debug!(
            level,
            commands = cohort.len(),
            workers,
            capacity = cohort.len(),
            "starting cohort"
        );

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let task_rx = task_rx.clone();
                let report_tx = report_tx.clone();
                scope.spawn(move || {
                    let mut handled = 0usize;
                    for dispatch in task_rx.iter() {
                        let report = self.execute(worker_id, dispatch);
                        handled += 1;
                        if report_tx.send(report).is_err() {
                            break;
                        }
                    }
                    debug!(worker_id, level, handled, "worker exiting");
                });
            }
            drop(task_rx);
            drop(report_tx);
            for dispatch in cohort {
                if task_tx.send(dispatch).is_err() {
                    warn!(level, "all workers exited before the cohort was queued");
                    break;
                }
            }
            drop(task_tx);
        });

        let reports: Vec<CommandReport> = report_rx.iter().collect();
        debug!(level, finished = reports.len(), "cohort complete");
        reports
    }

    fn execute(&self, worker_id: usize, dispatch: Dispatch) -> CommandReport {
        let Dispatch { index, item } = dispatch;
        let operation_id = self.counter.next_id();
        let identity = item.command.identity();
        debug!(
            worker_id,
            operation_id,
            level = item.level,
            command = %item.command.command_line(),
            "worker picked command"
        );

        let execution = item.command.execute(self.command_timeout);
        let report = CommandReport {
            index,
            operation_id,
            level: item.level,
            identity,
            outcome: execution.outcome,
            output: execution.output,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
        };

        if report.is_success() {
            if self.echo_output {
                info!(operation_id, level = report.level, identity = %report.identity, "command finished");
            }
        } else {
            warn!(
                operation_id,
                level = report.level,
                identity = %report.identity,
                outcome = %report.outcome,
                "command failed"
            );
        }
        if self.echo_output && !report.output.is_empty() {
            eprint!("{}", prefixed_output(&report));
        }
        if let Some(log) = &item.log {
            if let Err(e) = log.record(&report) {
                warn!(operation_id, path = %log.path().display(), err = %e, "failed to append operation log");
            }
        }
        if let Some(tracer) = item.command.observer() {
            if panic::catch_unwind(AssertUnwindSafe(|| tracer(&report))).is_err() {
                warn!(operation_id, identity = %report.identity, "command tracer panicked");
            }
        }
        report
    }
}

fn prefixed_output(report: &CommandReport) -> String {
    let mut text = String::new();
    for line in report.output.lines() {
        text.push_str(&format!("[{}] {}\n", report.identity, line));
    }
    text
}
