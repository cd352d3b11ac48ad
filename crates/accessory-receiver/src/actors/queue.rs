//! Serial actor queues.
//!
//! Every server and session owns exactly one queue: a single tokio task that
//! processes its inputs strictly in order. Code running on a queue is tagged
//! with that queue's [`QueueId`] through a task-local, which lets direct calls
//! detect re-entry instead of deadlocking.
//!
//! Besides its bounded request mailbox each actor has an unbounded [`Lane`]
//! that carries completion jobs and actor-to-actor notices. Posting to a lane
//! never waits, so two actors notifying each other can never block on each
//! other's mailbox.

use crate::errors::{ReceiverError, ReceiverResult};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

tokio::task_local! {
    static CURRENT_QUEUE: QueueId;
}

/// Identity of one actor queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The queue the calling code is running on, if any.
#[must_use]
pub fn current_queue() -> Option<QueueId> {
    CURRENT_QUEUE.try_with(|id| *id).ok()
}

/// Run `fut` tagged as executing on queue `id`.
pub(crate) async fn run_on_queue<F: Future>(id: QueueId, fut: F) -> F::Output {
    CURRENT_QUEUE.scope(id, fut).await
}

/// A unit of work executed on some queue.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Run a job, containing a panic to the job itself.
pub(crate) fn run_job(job: Job) -> ReceiverResult<()> {
    std::panic::catch_unwind(AssertUnwindSafe(job))
        .map_err(|_| ReceiverError::Unknown("queued job panicked".to_string()))
}

/// Anything that can run a [`Job`] on its own queue. Completions are
/// delivered through this.
pub trait CompletionQueue: Send + Sync {
    fn queue_id(&self) -> QueueId;

    /// Enqueue `job`. Fails only once the queue has shut down.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the queue is gone.
    fn submit(&self, job: Job) -> ReceiverResult<()>;
}

/// Unbounded internal input of an actor.
pub struct Lane<M> {
    id: QueueId,
    tx: mpsc::UnboundedSender<M>,
    wrap: fn(Job) -> M,
}

impl<M> Clone for Lane<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            wrap: self.wrap,
        }
    }
}

impl<M: Send + 'static> Lane<M> {
    pub(crate) fn new(id: QueueId, wrap: fn(Job) -> M) -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx, wrap }, rx)
    }

    /// Post an internal notice.
    pub(crate) fn post(&self, msg: M) -> ReceiverResult<()> {
        self.try_post(msg).map_err(|_| ReceiverError::Cancelled)
    }

    /// Post, handing the notice back if the actor is gone.
    pub(crate) fn try_post(&self, msg: M) -> Result<(), M> {
        self.tx.send(msg).map_err(|e| e.0)
    }
}

impl<M: Send + 'static> CompletionQueue for Lane<M> {
    fn queue_id(&self) -> QueueId {
        self.id
    }

    fn submit(&self, job: Job) -> ReceiverResult<()> {
        self.post((self.wrap)(job))
    }
}

/// A free-standing serial queue with no state of its own.
///
/// Embedders use one as the completion queue for async calls, and as a
/// place to run ordered work of their own.
#[derive(Clone)]
pub struct SerialQueue {
    lane: Lane<Job>,
    cancel_token: CancellationToken,
}

impl SerialQueue {
    /// Spawn the queue's worker task.
    #[must_use]
    pub fn spawn(label: &'static str, cancel_token: CancellationToken) -> (Self, JoinHandle<()>) {
        let id = QueueId::next();
        let (lane, receiver) = Lane::new(id, |job| job);
        let worker_token = cancel_token.clone();
        let task = tokio::spawn(run_on_queue(id, run_serial(label, receiver, worker_token)));
        (Self { lane, cancel_token }, task)
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.lane.id
    }

    /// Run `work` on this queue and wait for its result. Called from the
    /// queue itself, `work` runs inline.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the queue shut down before running `work`.
    pub async fn run_direct<F, R>(&self, work: F) -> ReceiverResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if current_queue() == Some(self.id()) {
            return Ok(work());
        }
        let (tx, rx) = oneshot::channel();
        self.lane.submit(Box::new(move || {
            let _ = tx.send(work());
        }))?;
        rx.await.map_err(|_| ReceiverError::Cancelled)
    }

    /// Enqueue `work`. When it finishes, `completion` (if any) is enqueued
    /// on `completion_queue`, or on this queue when none is given.
    ///
    /// # Errors
    ///
    /// `Cancelled` if the queue has shut down; `completion` will not run.
    pub fn run_async<F, R, C>(
        &self,
        work: F,
        completion_queue: Option<Arc<dyn CompletionQueue>>,
        completion: Option<C>,
    ) -> ReceiverResult<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        C: FnOnce(R) + Send + 'static,
    {
        let own = self.lane.clone();
        self.lane.submit(Box::new(move || {
            let result = work();
            let Some(completion) = completion else {
                return;
            };
            let job: Job = Box::new(move || completion(result));
            let delivered = match completion_queue {
                Some(queue) => queue.submit(job),
                None => own.submit(job),
            };
            if let Err(e) = delivered {
                warn!(target: "ar.actor.queue", error = %e, "Completion queue closed, completion dropped");
            }
        }))
    }

    /// Stop the worker after it drains what is already queued.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl CompletionQueue for SerialQueue {
    fn queue_id(&self) -> QueueId {
        self.lane.id
    }

    fn submit(&self, job: Job) -> ReceiverResult<()> {
        self.lane.submit(job)
    }
}

async fn run_serial(
    label: &'static str,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    cancel_token: CancellationToken,
) {
    debug!(target: "ar.actor.queue", queue = label, "Serial queue started");

    loop {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => break,

            job = receiver.recv() => match job {
                Some(job) => {
                    if let Err(e) = run_job(job) {
                        error!(target: "ar.actor.queue", queue = label, error = %e, "Job failed");
                    }
                }
                None => break,
            },
        }
    }

    // Drain: nothing already accepted is lost
    receiver.close();
    while let Ok(job) = receiver.try_recv() {
        if let Err(e) = run_job(job) {
            error!(target: "ar.actor.queue", queue = label, error = %e, "Job failed during drain");
        }
    }

    debug!(target: "ar.actor.queue", queue = label, "Serial queue stopped");
}
