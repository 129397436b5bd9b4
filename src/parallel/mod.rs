//! Parallel task execution within one feature.

pub mod scheduler;

pub use scheduler::{
    next_ready, ParallelExecutionState, SchedulerUpdate, TaskExecutor, TaskScheduler,
    TaskSchedulerConfig,
};
