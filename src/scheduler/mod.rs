//! Background execution: periodic tasks and one-off jobs.
//!
//! The scheduler owns a multi-thread tokio runtime. Periodic tasks implement
//! [`BackgroundTask`] and run on a timer until shutdown is broadcast. Flushes
//! and compactions are submitted as blocking jobs; each submission returns a
//! [`JobHandle`] carrying the job's result.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::Error;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Result of a submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    name: &'static str,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks the calling thread until the job finishes.
    ///
    /// Must not be called from inside an async context; use [`join`](Self::join) there.
    pub fn wait(self) -> Result<T> {
        let name = self.name;
        self.rx.blocking_recv().map_err(|_| dropped(name))?
    }

    pub async fn join(self) -> Result<T> {
        let name = self.name;
        self.rx.await.map_err(|_| dropped(name))?
    }
}

fn dropped(name: &str) -> Error {
    Error::Aborted(format!("{name} job was dropped before completing"))
}

/// Runs `job` on the blocking pool of `handle`.
pub fn submit_on<T, F>(handle: &Handle, name: &'static str, job: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    handle.spawn_blocking(move || {
        let result = job();
        if let Err(e) = &result {
            tracing::debug!(job = name, error = %e, "Job failed");
        }
        // The submitter may have stopped listening.
        let _ = tx.send(result);
    });
    JobHandle { name, rx }
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    /// Starts a runtime with `threads` workers and as many blocking threads.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .max_blocking_threads(threads)
            .thread_name("cinderdb-bg")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self::build(Some(runtime), handle))
    }

    /// Schedules onto a runtime owned by someone else.
    pub fn with_handle(handle: Handle) -> Self {
        Self::build(None, handle)
    }

    fn build(runtime: Option<Runtime>, handle: Handle) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            runtime,
            handle,
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock()?.push(handle);
        Ok(self)
    }

    /// Submit a one-off blocking job.
    pub fn submit<T, F>(&self, name: &'static str, job: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        submit_on(&self.handle, name, job)
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn signal_shutdown(&self) -> Result<Vec<JoinHandle<()>>> {
        self.shutdown_tx.send(()).ok();
        Ok(self.tasks.lock()?.drain(..).collect())
    }

    /// Graceful shutdown from async code - wait for periodic tasks. Jobs
    /// still running on an owned runtime are left to finish in the background.
    pub async fn shutdown(mut self) -> Result<()> {
        for task in self.signal_shutdown()? {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        Ok(())
    }

    /// Graceful shutdown from synchronous code: stops periodic tasks, then
    /// waits up to `timeout` for running jobs.
    pub fn shutdown_blocking(mut self, timeout: Duration) -> Result<()> {
        let tasks = self.signal_shutdown()?;
        match self.runtime.take() {
            Some(runtime) => {
                runtime.block_on(async {
                    for task in tasks {
                        let _ = task.await;
                    }
                });
                runtime.shutdown_timeout(timeout);
            }
            None => {
                for task in tasks {
                    task.abort();
                }
            }
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_tx.send(()).ok();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
