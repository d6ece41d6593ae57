//! Concurrent operation engine for local sandbox instances: a level-barrier
//! scheduler over a worker pool, plus a lock-protected catalog of every
//! sandbox on disk.

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod ops;
pub mod pool;
pub mod scheduler;

pub use catalog::{Catalog, CatalogEntry, CatalogStore, SandboxKind, TIMESTAMP_FORMAT};
pub use command::{
    CommandOutcome, CommandReport, Execution, ExecutionItem, OperationLog, RunnableCommand, Tracer,
};
pub use config::{EngineConfig, LockStrategy, OperationCounter};
pub use error::{CatalogError, LockError};
pub use lock::{CatalogLock, LockManager};
pub use ops::{load_plan, DeleteOutcome, Engine, GlobalOutcome, Plan, PlanOutcome, PlanStep, Registration, ALL_SANDBOXES};
pub use pool::WorkerPool;
pub use scheduler::{BatchReport, FailurePolicy, PriorityScheduler};
