// Scheduler module for lock-guarded periodic tasks

pub mod engine;
pub mod tasks;

pub use engine::{PeriodicTask, Scheduler, SchedulerEngine, TaskAction, TaskRun};
pub use tasks::EnqueueTask;
