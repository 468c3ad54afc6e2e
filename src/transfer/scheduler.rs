//! Background task scheduler: a single worker thread draining a FIFO queue.
//!
//! The send side ([`Scheduler`]) is cloned into whatever needs to enqueue
//! work; the receive side ([`TaskReceiver`]) is moved onto a dedicated thread
//! that runs a current-thread tokio runtime. Tasks execute strictly in
//! submission order, and an optional recurring tick is interleaved between
//! them on the same thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Work executed on the scheduler thread.
pub trait TaskExecutor: Send + Sync + 'static {
    type Task: Send + 'static;

    /// Run one queued task.
    fn execute(&self, task: Self::Task);

    /// Run the recurring task.
    fn on_tick(&self);
}

enum Command<T> {
    Run(T),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    ticks: AtomicU64,
}

/// Snapshot of scheduler activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_panicked: u64,
    pub total_ticks: u64,
}

/// Send side of the task queue.
pub struct Scheduler<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    pending: Arc<AtomicUsize>,
    stopped: AtomicBool,
    counters: Arc<Counters>,
}

/// Receive side of the task queue, consumed by [`TaskReceiver::spawn`].
pub struct TaskReceiver<T> {
    rx: mpsc::UnboundedReceiver<Command<T>>,
    pending: Arc<AtomicUsize>,
    counters: Arc<Counters>,
}

/// Create a connected scheduler / receiver pair.
pub fn channel<T: Send + 'static>() -> (Scheduler<T>, TaskReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let counters = Arc::new(Counters::default());
    (
        Scheduler {
            tx,
            pending: pending.clone(),
            stopped: AtomicBool::new(false),
            counters: counters.clone(),
        },
        TaskReceiver {
            rx,
            pending,
            counters,
        },
    )
}

impl<T> Scheduler<T> {
    /// Enqueue a task. Hands the task back if the worker is gone.
    pub fn submit(&self, task: T) -> Result<(), T> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(task);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(Command::Run(task)) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(command)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match command {
                    Command::Run(task) => Err(task),
                    Command::Shutdown => unreachable!("only Run commands are submitted"),
                }
            }
        }
    }

    /// Tasks queued and not yet started.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Stop accepting tasks and queue the shutdown marker behind everything
    /// already submitted.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Shutdown);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_submitted: self.counters.submitted.load(Ordering::Relaxed),
            total_completed: self.counters.completed.load(Ordering::Relaxed),
            total_panicked: self.counters.panicked.load(Ordering::Relaxed),
            total_ticks: self.counters.ticks.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + 'static> TaskReceiver<T> {
    /// Start the worker thread. `tick` enables the recurring task.
    pub fn spawn<E>(
        self,
        name: &str,
        executor: Arc<E>,
        tick: Option<Duration>,
    ) -> std::io::Result<WorkerHandle>
    where
        E: TaskExecutor<Task = T>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runtime.block_on(self.run(executor, tick)))?;

        info!(worker = name, ?tick, "Started disk worker");
        Ok(WorkerHandle { thread })
    }

    async fn run<E>(mut self, executor: Arc<E>, tick: Option<Duration>)
    where
        E: TaskExecutor<Task = T>,
    {
        let mut ticker = tick.filter(|period| !period.is_zero()).map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;
                command = self.rx.recv() => match command {
                    Some(Command::Run(task)) => {
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        let outcome = catch_unwind(AssertUnwindSafe(|| executor.execute(task)));
                        match outcome {
                            Ok(()) => {
                                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                                error!("Disk task panicked, worker continues");
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = next_tick(&mut ticker) => {
                    self.counters.ticks.fetch_add(1, Ordering::Relaxed);
                    if catch_unwind(AssertUnwindSafe(|| executor.on_tick())).is_err() {
                        error!("Recurring disk task panicked, worker continues");
                    }
                }
            }
        }

        debug!(pending = self.pending.load(Ordering::Acquire), "Disk worker stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Join handle for the worker thread.
pub struct WorkerHandle {
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait up to `grace` for the worker to exit. Returns `false` on timeout,
    /// leaving the thread detached.
    pub fn join_timeout(self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(?grace, "Disk worker did not drain within grace period");
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.thread.join().is_err() {
            error!("Disk worker thread panicked");
        }
        true
    }
}
