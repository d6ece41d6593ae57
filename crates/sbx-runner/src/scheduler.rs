//! Level-barrier scheduler.
//!
//! Items are grouped by level. Levels run in ascending order, each one as a
//! single cohort on the worker pool, and level N+1 starts only after every
//! command of level N has finished. Empty levels have no observable effect.

use serde::Serialize;
use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::command::{CommandReport, ExecutionItem};
use crate::config::EngineConfig;
use crate::pool::{Dispatch, WorkerPool};

/// What to do with the remaining levels once a level reports failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep going; every level runs regardless of earlier failures.
    #[default]
    Continue,
    /// Finish the failing level, then skip every later level.
    StopAfterFailedLevel,
}

#[derive(Debug, Clone, Default)]
pub struct PriorityScheduler {
    pool: WorkerPool,
    policy: FailurePolicy,
}

impl PriorityScheduler {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            policy: FailurePolicy::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(WorkerPool::from_config(config))
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn run(&self, batch: Vec<ExecutionItem>) -> BatchReport {
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return report;
        }

        let mut levels: BTreeMap<u32, Vec<Dispatch>> = BTreeMap::new();
        for (index, item) in batch.into_iter().enumerate() {
            levels
                .entry(item.level)
                .or_default()
                .push(Dispatch { index, item });
        }
        debug!(
            levels = levels.len(),
            max_level = levels.keys().next_back().copied().unwrap_or(0),
            "scheduling batch"
        );

        let mut remaining = levels.into_iter();
        while let Some((level, cohort)) = remaining.next() {
            let reports = self.pool.run_dispatches(cohort);
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            report.levels_run.push(level);
            report.reports.extend(reports);
            if failed > 0 {
                warn!(level, failed, "level finished with failures");
                if self.policy == FailurePolicy::StopAfterFailedLevel {
                    for (skipped_level, cohort) in remaining.by_ref() {
                        debug!(level = skipped_level, commands = cohort.len(), "skipping level");
                        report.skipped.extend(cohort.into_iter().map(|d| d.index));
                    }
                    break;
                }
            }
        }
        report
    }
}

/// Outcome of one batch. `reports` is in completion order, level by level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub reports: Vec<CommandReport>,
    pub levels_run: Vec<u32>,
    /// Batch indices that never ran because an earlier level failed.
    pub skipped: Vec<usize>,
}

impl BatchReport {
    pub fn failures(&self) -> Vec<&CommandReport> {
        self.reports.iter().filter(|r| !r.is_success()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.reports.iter().all(|r| r.is_success())
    }

    pub fn for_level(&self, level: u32) -> Vec<&CommandReport> {
        self.reports.iter().filter(|r| r.level == level).collect()
    }

    pub fn find(&self, index: usize) -> Option<&CommandReport> {
        self.reports.iter().find(|r| r.index == index)
    }
}
