//! Supervised task group that runs job bodies.
//!
//! A single background task owns the [`JoinSet`]; it spawns submitted work and
//! is woken by `join_next` as tasks finish, so finished tasks are released as
//! soon as they complete instead of on a polling scan.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};

type BoxedWork = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work for the runner.
pub enum Work {
    /// Cooperative work, polled on the async runtime.
    Future(BoxedWork),
    /// Blocking work, moved to the blocking thread pool.
    Blocking(Box<dyn FnOnce() + Send + 'static>),
}

impl Work {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Work::Future(Box::pin(future))
    }

    pub fn blocking<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Blocking(Box::new(work))
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Task runner is shut down")]
    ShutDown,
    #[error("{0} task(s) panicked")]
    TaskPanics(usize),
}

#[derive(Debug)]
struct TaskState {
    id: u64,
    done: AtomicBool,
    cancelled: AtomicBool,
    cancel: Notify,
}

/// Handle to one submitted unit of work.
#[derive(Debug)]
pub struct TaskHandle {
    task: Arc<TaskState>,
}

impl TaskHandle {
    /// Whether the work has finished, failed or been cancelled.
    pub fn is_done(&self) -> bool {
        self.task.done.load(Ordering::SeqCst)
    }

    /// Request cancellation. Cooperative work stops at its next suspension
    /// point; blocking work that already started runs to completion.
    pub fn cancel(&self) {
        if !self.task.cancelled.swap(true, Ordering::SeqCst) {
            self.task.cancel.notify_one();
        }
    }
}

#[derive(Default)]
struct Shared {
    active: AtomicUsize,
    tracked: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Marks its task done when dropped, whether the work returned, panicked or
/// was dropped unpolled.
struct DoneGuard {
    task: Arc<TaskState>,
    shared: Arc<Shared>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.task.done.store(true, Ordering::SeqCst);
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Command {
    Spawn { work: Work, guard: DoneGuard },
    Shutdown { reply: oneshot::Sender<usize> },
}

/// In-process execution engine for job bodies.
///
/// Cheap to clone; clones submit into the same task group.
#[derive(Clone)]
pub struct TaskRunner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskRunner {
    /// Create the task group. Must be called inside a Tokio runtime.
    pub fn start() -> Self {
        let shared = Arc::new(Shared::default());
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(supervise(shared.clone(), receiver));
        Self { shared, commands }
    }

    /// Hand work to the group and return without waiting for it.
    pub fn submit(&self, work: Work) -> Result<TaskHandle, RunnerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RunnerError::ShutDown);
        }

        let task = Arc::new(TaskState {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        });
        self.shared.active.fetch_add(1, Ordering::SeqCst);
        let guard = DoneGuard {
            task: task.clone(),
            shared: self.shared.clone(),
        };

        // On failure the command, and with it the guard, is dropped here.
        self.commands
            .send(Command::Spawn { work, guard })
            .map_err(|_| RunnerError::ShutDown)?;

        Ok(TaskHandle { task })
    }

    /// Work submitted and not yet finished.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Tasks still held by the group, finished or not.
    pub fn tracked(&self) -> usize {
        self.shared.tracked.load(Ordering::SeqCst)
    }

    /// Cancel everything in flight and wait for the group to drain.
    ///
    /// Returns [`RunnerError::TaskPanics`] if any task panicked over the
    /// runner's lifetime. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Shutting down task runner ({} active)", self.active());

        let (reply, panics) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_err() {
            return Ok(());
        }

        match panics.await {
            Ok(0) | Err(_) => Ok(()),
            Ok(count) => Err(RunnerError::TaskPanics(count)),
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut tasks = JoinSet::new();
    let mut panics = 0;

    let reply = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Spawn { work, guard }) => spawn_into(&mut tasks, work, guard),
                Some(Command::Shutdown { reply }) => break Some(reply),
                None => break None,
            },
            Some(joined) = tasks.join_next() => panics += reap(joined),
        }
        shared.tracked.store(tasks.len(), Ordering::SeqCst);
    };

    // Work that raced with shutdown is dropped without running.
    commands.close();
    while commands.try_recv().is_ok() {}

    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        panics += reap(joined);
    }
    shared.tracked.store(0, Ordering::SeqCst);

    if let Some(reply) = reply {
        let _ = reply.send(panics);
    }
}

fn spawn_into(tasks: &mut JoinSet<()>, work: Work, guard: DoneGuard) {
    match work {
        Work::Future(future) => {
            tasks.spawn(async move {
                let task = guard.task.clone();
                tokio::select! {
                    _ = task.cancel.notified() => {
                        tracing::debug!("Task {} cancelled", task.id);
                    }
                    _ = future => {}
                }
                drop(guard);
            });
        }
        Work::Blocking(work) => {
            tasks.spawn_blocking(move || {
                if !guard.task.cancelled.load(Ordering::SeqCst) {
                    work();
                }
                drop(guard);
            });
        }
    }
}

/// Returns 1 for a panicked task, 0 otherwise.
fn reap(joined: Result<(), JoinError>) -> usize {
    match joined {
        Ok(()) => 0,
        Err(e) if e.is_panic() => {
            tracing::error!("Task panicked: {}", e);
            1
        }
        Err(_) => 0,
    }
}
