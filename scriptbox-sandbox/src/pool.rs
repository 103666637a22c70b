//! Worker pool bounding concurrent script executions.
//!
//! Each worker is a dedicated OS thread running its own current-thread tokio
//! runtime; the interpreter never shares a thread with the caller. Every
//! execution still gets a fresh isolate, so no script state survives on a
//! worker between requests.
//!
//! Cancellation is cooperative on the caller side (a [`CancellationToken`])
//! and forceful on the worker side: the pool interrupts the execution, retires
//! the worker and lets a replacement be spawned on demand. A reply that
//! arrives after cancellation is never delivered, but the concurrency slot
//! stays taken until the retired worker has actually stopped.

use crate::config::PoolConfig;
use crate::error::{PoolError, SandboxError};
use crate::files::{FileProxies, FileSource};
use crate::normalize::ResultNormalizer;
use crate::program::{LibraryBinding, SandboxProgramBuilder};
use crate::runtime::{ExecutionControl, ExecutionSandbox, SandboxEnv};
use scriptbox_common::{ExecutionEnvelope, ExecutionId, ExecutionRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Atomic counters for pool observability
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Worker threads started
    pub spawned: AtomicU64,
    /// Executions dispatched to an already warm worker
    pub reused: AtomicU64,
    /// Workers whose thread died while busy
    pub retired_fault: AtomicU64,
    /// Workers terminated because their execution was cancelled
    pub retired_cancelled: AtomicU64,
    /// Workers retired after reaching `max_uses`
    pub recycled: AtomicU64,
}

/// Lifecycle of a single worker as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminated,
}

/// What a worker thread sends back for one job
#[derive(Debug)]
enum WorkerReply {
    /// Encoded [`ExecutionEnvelope`]
    Envelope(String),
    /// The sandbox's own deadline fired
    TimedOut,
    /// The execution was interrupted from the pool side
    Interrupted,
}

struct Job {
    id: ExecutionId,
    request: ExecutionRequest,
    control: ExecutionControl,
    /// Carries the concurrency slot back, so it frees only once the worker
    /// is done with the job, even when the caller has stopped waiting
    reply: oneshot::Sender<(WorkerReply, OwnedSemaphorePermit)>,
    permit: OwnedSemaphorePermit,
}

/// Everything a worker thread needs to turn a request into an envelope
struct WorkerShared {
    sandbox: Arc<dyn ExecutionSandbox>,
    programs: SandboxProgramBuilder,
    files: FileSource,
    io: Handle,
    poll_interval: Duration,
}

/// Pool-side handle of a worker thread
struct Worker {
    id: u64,
    state: WorkerState,
    uses: u32,
    jobs: mpsc::UnboundedSender<Job>,
}

enum Lifecycle {
    Unconfigured,
    Running {
        shared: Arc<WorkerShared>,
        alive: mpsc::Sender<()>,
    },
    ShutDown,
}

/// Interrupts the execution if the `run` future is dropped before it settles
struct InFlight {
    control: ExecutionControl,
    armed: bool,
}

impl InFlight {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.control.interrupt();
        }
    }
}

/// Pool of interpreter worker threads
pub struct WorkerPool {
    config: PoolConfig,
    sandbox: Arc<dyn ExecutionSandbox>,
    programs: SandboxProgramBuilder,
    files: FileSource,
    poll_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<Worker>>,
    next_worker_id: AtomicU64,
    shutdown: CancellationToken,
    /// Closed once every worker thread has exited
    all_exited: tokio::sync::Mutex<mpsc::Receiver<()>>,
    alive_seed: Mutex<Option<mpsc::Sender<()>>>,
    metrics: Arc<PoolMetrics>,
}

impl WorkerPool {
    /// Create an unconfigured pool; call [`WorkerPool::configure`] before `run`
    pub fn new(config: PoolConfig, sandbox: Arc<dyn ExecutionSandbox>, files: FileSource) -> Self {
        let (alive_tx, alive_rx) = mpsc::channel(1);
        Self {
            slots: Arc::new(Semaphore::new(config.size)),
            config,
            sandbox,
            programs: SandboxProgramBuilder::default(),
            files,
            poll_interval: Duration::from_millis(100),
            lifecycle: Mutex::new(Lifecycle::Unconfigured),
            idle: Mutex::new(VecDeque::new()),
            next_worker_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            all_exited: tokio::sync::Mutex::new(alive_rx),
            alive_seed: Mutex::new(Some(alive_tx)),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Library bindings injected into every program
    pub fn with_libraries(mut self, libraries: Vec<LibraryBinding>) -> Self {
        self.programs = SandboxProgramBuilder::new(libraries);
        self
    }

    /// How often a blocking file read checks for interruption
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Configured number of workers (and concurrent executions)
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Number of warm workers waiting for a job
    pub fn idle_workers(&self) -> usize {
        self.lock_idle().len()
    }

    /// Spawn the workers. Calling it again on a running pool does nothing.
    ///
    /// File I/O of every execution runs on the runtime this is called from.
    #[tracing::instrument(skip(self), fields(size = self.config.size))]
    pub async fn configure(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lock_lifecycle();
        match &*lifecycle {
            Lifecycle::Running { .. } => {
                tracing::debug!("Pool already configured");
                return Ok(());
            }
            Lifecycle::ShutDown => return Err(PoolError::ShutDown),
            Lifecycle::Unconfigured => {}
        }

        let alive = self
            .alive_seed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PoolError::ShutDown)?;
        let shared = Arc::new(WorkerShared {
            sandbox: Arc::clone(&self.sandbox),
            programs: self.programs.clone(),
            files: self.files.clone(),
            io: Handle::current(),
            poll_interval: self.poll_interval,
        });

        let mut workers = Vec::with_capacity(self.config.size);
        for _ in 0..self.config.size {
            workers.push(self.spawn_worker(&shared, &alive)?);
        }
        self.lock_idle().extend(workers);
        *lifecycle = Lifecycle::Running { shared, alive };

        tracing::info!(sandbox = self.sandbox.name(), "Worker pool configured");
        Ok(())
    }

    /// Execute a request on a free worker and return the encoded envelope.
    ///
    /// Waits for a free slot. If `cancel` fires first, the execution is
    /// interrupted, its worker retired, and [`PoolError::Aborted`] returned.
    #[tracing::instrument(skip_all, fields(timeout_ms = request.timeout_ms, files = request.files.len()))]
    pub async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<String, PoolError> {
        self.ensure_running()?;

        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| PoolError::ShutDown)?
            }
            _ = cancel.cancelled() => return Err(PoolError::Aborted),
            _ = self.shutdown.cancelled() => return Err(PoolError::ShutDown),
        };

        let mut worker = self.checkout()?;
        worker.state = WorkerState::Busy;

        let id = ExecutionId::new();
        let started = Instant::now();
        let control = ExecutionControl::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        tracing::debug!(execution_id = %id, worker_id = worker.id, "Dispatching execution");

        let job = Job {
            id,
            request,
            control: control.clone(),
            reply: reply_tx,
            permit,
        };
        if worker.jobs.send(job).is_err() {
            worker.state = WorkerState::Terminated;
            self.metrics.retired_fault.fetch_add(1, Ordering::Relaxed);
            return Ok(fault_envelope(worker.id));
        }

        let guard = InFlight {
            control: control.clone(),
            armed: true,
        };
        let result = tokio::select! {
            reply = reply_rx => match reply {
                Ok((WorkerReply::Envelope(envelope), _permit)) => {
                    worker.uses += 1;
                    worker.state = WorkerState::Idle;
                    self.checkin(worker);
                    Ok(envelope)
                }
                Ok((WorkerReply::TimedOut | WorkerReply::Interrupted, _permit)) => {
                    worker.uses += 1;
                    worker.state = WorkerState::Idle;
                    self.checkin(worker);
                    Err(PoolError::Aborted)
                }
                Err(_) => {
                    tracing::error!(execution_id = %id, worker_id = worker.id, "Worker died during execution");
                    worker.state = WorkerState::Terminated;
                    self.metrics.retired_fault.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(worker_id = worker.id, state = ?worker.state, "Worker retired");
                    Ok(fault_envelope(worker.id))
                }
            },
            _ = cancel.cancelled() => {
                control.interrupt();
                worker.state = WorkerState::Terminated;
                self.metrics.retired_cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(execution_id = %id, worker_id = worker.id, "Execution cancelled, worker retired");
                Err(PoolError::Aborted)
            }
            _ = self.shutdown.cancelled() => {
                control.interrupt();
                worker.state = WorkerState::Terminated;
                Err(PoolError::ShutDown)
            }
        };
        guard.disarm();

        tracing::debug!(
            execution_id = %id,
            duration_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Execution finished"
        );
        result
    }

    /// Stop accepting work, cancel in-flight executions and wait for every
    /// worker thread to exit. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lock_lifecycle();
            if matches!(&*lifecycle, Lifecycle::ShutDown) {
                return;
            }
            *lifecycle = Lifecycle::ShutDown;
        }

        self.slots.close();
        self.shutdown.cancel();
        let idle: Vec<Worker> = self.lock_idle().drain(..).collect();
        let stopped = idle.len();
        drop(idle);
        self.alive_seed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        // Every worker thread holds an `alive` sender until it exits
        let mut all_exited = self.all_exited.lock().await;
        while all_exited.recv().await.is_some() {}

        tracing::info!(stopped_idle = stopped, "Worker pool shut down");
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        match &*self.lock_lifecycle() {
            Lifecycle::Running { .. } => Ok(()),
            Lifecycle::Unconfigured => Err(PoolError::NotConfigured),
            Lifecycle::ShutDown => Err(PoolError::ShutDown),
        }
    }

    /// Oldest idle worker, or a fresh one when none is idle
    fn checkout(&self) -> Result<Worker, PoolError> {
        if let Some(worker) = self.lock_idle().pop_front() {
            self.metrics.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(worker);
        }

        let lifecycle = self.lock_lifecycle();
        match &*lifecycle {
            Lifecycle::Running { shared, alive } => self.spawn_worker(shared, alive),
            Lifecycle::Unconfigured => Err(PoolError::NotConfigured),
            Lifecycle::ShutDown => Err(PoolError::ShutDown),
        }
    }

    fn checkin(&self, worker: Worker) {
        if worker.uses >= self.config.max_uses {
            tracing::debug!(worker_id = worker.id, uses = worker.uses, "Recycling worker");
            self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::trace!(worker_id = worker.id, state = ?worker.state, uses = worker.uses, "Worker checked in");
        self.lock_idle().push_back(worker);
    }

    fn spawn_worker(
        &self,
        shared: &Arc<WorkerShared>,
        alive: &mpsc::Sender<()>,
    ) -> Result<Worker, PoolError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(shared);
        let alive = alive.clone();

        std::thread::Builder::new()
            .name(format!("scriptbox-worker-{}", id))
            .spawn(move || worker_main(id, shared, jobs_rx, alive))?;

        self.metrics.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(worker_id = id, "Worker spawned");
        Ok(Worker {
            id,
            state: WorkerState::Idle,
            uses: 0,
            jobs: jobs_tx,
        })
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<Worker>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn encode(envelope: &ExecutionEnvelope) -> String {
    envelope.to_json_string().unwrap_or_else(|e| {
        serde_json::json!({ "error": format!("failed to encode result: {}", e), "log": [] })
            .to_string()
    })
}

fn fault_envelope(worker_id: u64) -> String {
    encode(&ExecutionEnvelope::with_error(
        format!("Worker {} terminated unexpectedly", worker_id),
        Vec::new(),
    ))
}

/// Body of a worker thread: serve jobs until the pool drops the sender
fn worker_main(
    id: u64,
    shared: Arc<WorkerShared>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    _alive: mpsc::Sender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(worker_id = id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    runtime.block_on(async move {
        while let Some(job) = jobs.recv().await {
            let Job {
                id: execution_id,
                request,
                control,
                reply,
                permit,
            } = job;
            let outcome = execute(&shared, request, control).await;
            if reply.send((outcome, permit)).is_err() {
                tracing::debug!(%execution_id, worker_id = id, "Reply discarded");
            }
        }
    });
    tracing::debug!(worker_id = id, "Worker exited");
}

async fn execute(
    shared: &WorkerShared,
    request: ExecutionRequest,
    control: ExecutionControl,
) -> WorkerReply {
    let built = match shared.programs.build(&request) {
        Ok(built) => built,
        Err(e) => return WorkerReply::Envelope(encode(&ExecutionEnvelope::with_error(e.to_string(), Vec::new()))),
    };
    let normalizer = ResultNormalizer::for_program(&built.program);

    let fetcher = shared.files.select(request.context.reads_local_files());
    let files = Arc::new(FileProxies::new(
        built.files.locations(),
        fetcher,
        shared.io.clone(),
        shared.poll_interval,
        control.clone(),
    ));
    let env = SandboxEnv {
        globals: built.globals,
        files,
        control,
        timeout_ms: request.timeout_ms,
    };

    match shared.sandbox.run(&built.program, env).await {
        Ok(outcome) => WorkerReply::Envelope(encode(&normalizer.envelope(outcome))),
        Err(SandboxError::Timeout { .. }) => WorkerReply::TimedOut,
        Err(SandboxError::Interrupted) => WorkerReply::Interrupted,
        Err(e) => {
            tracing::warn!(error = %e, "Sandbox run failed");
            WorkerReply::Envelope(encode(&ExecutionEnvelope::with_error(e.to_string(), Vec::new())))
        }
    }
}
