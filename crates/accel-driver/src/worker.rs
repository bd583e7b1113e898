//! Asynchronous execution worker
//!
//! DSP operators flagged for async execution are not run on the caller's
//! thread. Their execute requests are queued to one background thread that
//! runs them strictly in order.
//!
//! ```text
//!   Stopped ──register()──▶ Running ──last unregister()──▶ Stopping ──join──▶ Stopped
//! ```
//!
//! Shutdown is itself a queued job, so every execute pushed before it runs
//! before the thread exits.

use crate::error::{AccelError, Result};
use crate::link::DeviceLink;
use crate::memory::IonBuffer;
use crate::session::ExecutionBuffers;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued execution
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    /// Op id of the session to run
    pub model_id: u64,

    /// Request buffers
    pub buffers: ExecutionBuffers,

    /// Execute message backing `buffers.exec_info`, held until the job ran
    pub exec_message: Option<Arc<IonBuffer>>,
}

/// Work item for the worker thread
#[derive(Debug)]
pub enum AsyncJob {
    /// Run one request
    Execute(ExecuteJob),
    /// Stop the thread once everything before it has run
    Destruct,
}

/// Runs queued executions
pub trait JobRunner: Send + Sync + std::fmt::Debug {
    /// Run `job` to completion
    ///
    /// # Errors
    ///
    /// Whatever the execution reports; the worker logs it.
    fn run(&self, job: &ExecuteJob) -> Result<()>;
}

impl JobRunner for DeviceLink {
    fn run(&self, job: &ExecuteJob) -> Result<()> {
        self.execute(job.model_id, &job.buffers)
    }
}

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No thread
    Stopped,
    /// Thread waiting for or running jobs
    Running,
    /// Destruct queued, waiting for the thread to drain
    Stopping,
}

#[derive(Debug, Default)]
struct Queue {
    jobs: VecDeque<AsyncJob>,
}

#[derive(Debug)]
struct Control {
    state: WorkerState,
    models: usize,
    handle: Option<JoinHandle<()>>,
}

/// Background thread for asynchronous executions
#[derive(Debug)]
pub struct AsyncExecutionWorker {
    runner: Arc<dyn JobRunner>,
    queue: Arc<(Mutex<Queue>, Condvar)>,
    control: Mutex<Control>,
}

impl AsyncExecutionWorker {
    /// Stopped worker running jobs through `runner`
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            queue: Arc::new((Mutex::new(Queue::default()), Condvar::new())),
            control: Mutex::new(Control {
                state: WorkerState::Stopped,
                models: 0,
                handle: None,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> WorkerState {
        lock(&self.control).state
    }

    /// Registered async models
    pub fn model_count(&self) -> usize {
        lock(&self.control).models
    }

    /// Count one more async model, starting the thread for the first
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn register(&self) -> Result<()> {
        let mut control = lock(&self.control);
        if control.models == 0 {
            let queue = Arc::clone(&self.queue);
            let runner = Arc::clone(&self.runner);
            let handle = std::thread::Builder::new()
                .name("accel-async".into())
                .spawn(move || run_loop(&queue, runner.as_ref()))?;
            control.handle = Some(handle);
            control.state = WorkerState::Running;
            info!("Async execution worker started");
        }
        control.models += 1;
        debug!("async model count {}", control.models);
        Ok(())
    }

    /// Count one async model less, draining and stopping the thread at zero
    pub fn unregister(&self) {
        let mut control = lock(&self.control);
        if control.models == 0 {
            warn!("async model count is already zero");
            return;
        }
        control.models -= 1;
        debug!("async model count {}", control.models);
        if control.models == 0 {
            self.stop(&mut control);
        }
    }

    /// Queue a job
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidState`] when the worker is not running.
    pub fn push(&self, job: ExecuteJob) -> Result<()> {
        let control = lock(&self.control);
        if control.state != WorkerState::Running {
            return Err(AccelError::invalid_state(format!(
                "async worker is {:?}",
                control.state
            )));
        }
        self.enqueue(AsyncJob::Execute(job));
        Ok(())
    }

    /// Drain and stop regardless of the model count
    pub fn shutdown(&self) {
        let mut control = lock(&self.control);
        control.models = 0;
        self.stop(&mut control);
    }

    fn enqueue(&self, job: AsyncJob) {
        let (queue, ready) = &*self.queue;
        lock(queue).jobs.push_back(job);
        ready.notify_all();
    }

    fn stop(&self, control: &mut Control) {
        let Some(handle) = control.handle.take() else {
            control.state = WorkerState::Stopped;
            return;
        };
        control.state = WorkerState::Stopping;
        self.enqueue(AsyncJob::Destruct);
        if handle.join().is_err() {
            error!("async execution worker panicked");
        }
        control.state = WorkerState::Stopped;
        info!("Async execution worker stopped");
    }
}

impl Drop for AsyncExecutionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(queue: &(Mutex<Queue>, Condvar), runner: &dyn JobRunner) {
    let (jobs, ready) = queue;
    loop {
        let job = {
            let mut guard = lock(jobs);
            loop {
                if let Some(job) = guard.jobs.pop_front() {
                    break job;
                }
                guard = ready.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
        };

        match job {
            AsyncJob::Destruct => {
                debug!("async worker received destruct");
                break;
            }
            AsyncJob::Execute(job) => {
                debug!("async execute of {:#x}", job.model_id);
                if let Err(e) = runner.run(&job) {
                    error!("async execute of {:#x} failed: {e}", job.model_id);
                }
            }
        }
    }
}
