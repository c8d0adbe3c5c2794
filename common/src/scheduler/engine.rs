// Scheduler engine running periodic tasks under a cluster-wide lock

use crate::lock::{with_lock, DistributedLock, OnLockFailure};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

/// Work done on every tick of a periodic task
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskAction: Send + Sync {
    /// Returns the number of items produced
    async fn run(&self) -> Result<usize>;
}

/// A task that runs every `interval` on at most one scheduler instance
pub struct PeriodicTask {
    pub name: String,
    pub interval: Duration,
    pub initial_delay: Duration,
    /// How long the run lock is held at most
    pub lock_ttl: Duration,
    /// How long a tick waits for the run lock before skipping
    pub lock_wait: Duration,
    pub action: Arc<dyn TaskAction>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, interval: Duration, action: Arc<dyn TaskAction>) -> Self {
        Self {
            name: name.into(),
            interval,
            initial_delay: Duration::ZERO,
            lock_ttl: interval,
            lock_wait: Duration::ZERO,
            action,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Lock key, `lock:job:{name}` once the lock prefix is applied
    pub fn lock_key(&self) -> String {
        format!("job:{}", self.name)
    }
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRun {
    Completed(usize),
    /// Another instance holds the task lock
    Skipped,
}

/// Scheduler trait for periodic task operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run every registered task until `stop` is called
    async fn start(&self) -> Result<()>;

    /// Stop the scheduler gracefully
    async fn stop(&self) -> Result<()>;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    lock: Arc<dyn DistributedLock>,
    tasks: Vec<PeriodicTask>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerEngine {
    pub fn new(lock: Arc<dyn DistributedLock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            lock,
            tasks: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn with_task(mut self, task: PeriodicTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(&self) -> &[PeriodicTask] {
        &self.tasks
    }

    /// Run one tick of `task` if this instance wins its lock
    #[instrument(skip(self, task), fields(task = %task.name))]
    pub async fn run_task(&self, task: &PeriodicTask) -> Result<TaskRun> {
        let outcome = with_lock(
            self.lock.as_ref(),
            &task.lock_key(),
            task.lock_ttl,
            task.lock_wait,
            OnLockFailure::Skip,
            || task.action.run(),
        )
        .await?;

        match outcome {
            None => {
                debug!("Task lock held by another instance, skipping");
                Ok(TaskRun::Skipped)
            }
            Some(result) => {
                let produced = result?;
                info!(produced, "Task run completed");
                Ok(TaskRun::Completed(produced))
            }
        }
    }

    async fn task_loop(&self, task: &PeriodicTask, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            task = %task.name,
            interval_seconds = task.interval.as_secs(),
            initial_delay_seconds = task.initial_delay.as_secs(),
            "Scheduling periodic task"
        );

        let mut ticker = interval_at(Instant::now() + task.initial_delay, task.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_task(task).await {
                        error!(task = %task.name, error = %e, "Periodic task failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(task = %task.name, "Periodic task stopped");
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<()> {
        info!(tasks = self.tasks.len(), "Starting scheduler engine");

        let loops = self
            .tasks
            .iter()
            .map(|task| self.task_loop(task, self.shutdown_tx.subscribe()));
        futures::future::join_all(loops).await;

        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<()> {
        info!("Stopping scheduler engine");
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::StoreLock;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lock() -> Arc<dyn DistributedLock> {
        Arc::new(StoreLock::new(Arc::new(MemoryStore::new())))
    }

    struct CountingAction {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TaskAction for CountingAction {
        async fn run(&self) -> Result<usize> {
            Ok(self.runs.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn test_run_task_completes() {
        let mut action = MockTaskAction::new();
        action.expect_run().times(1).returning(|| Ok(3));

        let engine = SchedulerEngine::new(lock());
        let task = PeriodicTask::new("rebuild-cache", Duration::from_secs(60), Arc::new(action));

        assert_eq!(engine.run_task(&task).await.unwrap(), TaskRun::Completed(3));
    }

    #[tokio::test]
    async fn test_run_task_skips_when_locked_elsewhere() {
        let lock = lock();
        lock.acquire("job:external:prewarm", Duration::from_secs(20))
            .await
            .unwrap();

        let mut action = MockTaskAction::new();
        action.expect_run().times(0);

        let engine = SchedulerEngine::new(Arc::clone(&lock));
        let task = PeriodicTask::new("external:prewarm", Duration::from_secs(120), Arc::new(action));

        assert_eq!(engine.run_task(&task).await.unwrap(), TaskRun::Skipped);
    }

    #[tokio::test]
    async fn test_run_task_releases_lock_after_failure() {
        let mut action = MockTaskAction::new();
        action
            .expect_run()
            .times(2)
            .returning(|| Err(anyhow::anyhow!("external service down")));

        let engine = SchedulerEngine::new(lock());
        let task = PeriodicTask::new("flaky", Duration::from_secs(60), Arc::new(action));

        assert!(engine.run_task(&task).await.is_err());
        // Lock was released, so the next tick runs again
        assert!(engine.run_task(&task).await.is_err());
    }

    #[test]
    fn test_lock_key() {
        let task = PeriodicTask::new(
            "external:prewarm",
            Duration::from_secs(120),
            Arc::new(MockTaskAction::new()),
        );
        assert_eq!(task.lock_key(), "job:external:prewarm");
        assert_eq!(task.lock_ttl, Duration::from_secs(120));
        assert_eq!(task.lock_wait, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_task_waits_for_lock_release() {
        let lock = lock();
        let held = lock
            .acquire("job:external:prewarm", Duration::from_secs(20))
            .await
            .unwrap();
        {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                lock.release("job:external:prewarm", &held.token).await.unwrap();
            });
        }

        let mut action = MockTaskAction::new();
        action.expect_run().times(1).returning(|| Ok(2));

        let engine = SchedulerEngine::new(Arc::clone(&lock));
        let task = PeriodicTask::new("external:prewarm", Duration::from_secs(120), Arc::new(action))
            .with_lock_wait(Duration::from_secs(2));

        assert_eq!(engine.run_task(&task).await.unwrap(), TaskRun::Completed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_task_skips_after_lock_wait_elapses() {
        let lock = lock();
        lock.acquire("job:external:prewarm", Duration::from_secs(20))
            .await
            .unwrap();

        let mut action = MockTaskAction::new();
        action.expect_run().times(0);

        let engine = SchedulerEngine::new(Arc::clone(&lock));
        let task = PeriodicTask::new("external:prewarm", Duration::from_secs(120), Arc::new(action))
            .with_lock_wait(Duration::from_secs(2));

        assert_eq!(engine.run_task(&task).await.unwrap(), TaskRun::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_on_schedule_until_stopped() {
        let action = Arc::new(CountingAction {
            runs: AtomicUsize::new(0),
        });
        let task = PeriodicTask::new("tick", Duration::from_secs(120), action.clone())
            .with_initial_delay(Duration::from_secs(15))
            .with_lock_ttl(Duration::from_secs(20));
        let engine = Arc::new(SchedulerEngine::new(lock()).with_task(task));

        let running = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start().await })
        };

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(action.runs.load(Ordering::SeqCst), 2);

        engine.stop().await.unwrap();
        running.await.unwrap().unwrap();
    }
}
