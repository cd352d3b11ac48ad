//! Command dispatcher.
//!
//! One envelope ([`Request`]) carries every Control, GetProperty,
//! SetProperty and Event message. A request is enqueued together with a
//! [`Reply`] that says how its result travels back: to a blocked caller, to
//! a completion on a caller-chosen queue, or nowhere. The two call styles
//! ([`Dispatcher::call_blocking`] and [`Dispatcher::call_with_completion`])
//! are thin wrappers over the single [`Dispatcher::enqueue`] primitive.
//!
//! Failures are always values: a handler's error becomes the `Err` of the
//! reply, never a panic that escapes the target's queue.

use crate::actors::queue::{current_queue, CompletionQueue, Job, QueueId};
use crate::errors::{ReceiverError, ReceiverResult};
use crate::value::{Dict, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

/// Shape-specific part of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Control { command: String, params: Dict },
    GetProperty { name: String },
    SetProperty { name: String, value: Value },
    /// One-way notification; never produces a reply.
    Event { name: String, params: Dict },
}

/// Dispatch envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    /// Narrows the target (e.g. a stream or sub-object name).
    pub qualifier: Option<String>,
    /// Taken when the request is built, before it reaches any queue.
    /// Resource claims use it to order Borrows that race across queues.
    pub issued_at: Instant,
}

impl Request {
    fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            qualifier: None,
            issued_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn control(command: impl Into<String>, params: Dict) -> Self {
        Self::new(RequestKind::Control {
            command: command.into(),
            params,
        })
    }

    #[must_use]
    pub fn get_property(name: impl Into<String>) -> Self {
        Self::new(RequestKind::GetProperty { name: name.into() })
    }

    #[must_use]
    pub fn set_property(name: impl Into<String>, value: Value) -> Self {
        Self::new(RequestKind::SetProperty {
            name: name.into(),
            value,
        })
    }

    #[must_use]
    pub fn event(name: impl Into<String>, params: Dict) -> Self {
        Self::new(RequestKind::Event {
            name: name.into(),
            params,
        })
    }

    #[must_use]
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Command id or property/event name.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            RequestKind::Control { command, .. } => command,
            RequestKind::GetProperty { name }
            | RequestKind::SetProperty { name, .. }
            | RequestKind::Event { name, .. } => name,
        }
    }

    /// Bounded label for logs and metrics.
    #[must_use]
    pub fn shape(&self) -> &'static str {
        match self.kind {
            RequestKind::Control { .. } => "control",
            RequestKind::GetProperty { .. } => "get_property",
            RequestKind::SetProperty { .. } => "set_property",
            RequestKind::Event { .. } => "event",
        }
    }
}

/// Callback invoked with the result of an async call.
pub type Completion = Box<dyn FnOnce(ReceiverResult<Value>) + Send + 'static>;

/// Where a request's result goes.
pub enum Reply {
    /// A caller blocked in [`Dispatcher::call_blocking`].
    Direct(oneshot::Sender<ReceiverResult<Value>>),
    /// A completion enqueued on `queue`, or on the target's own queue when
    /// `queue` is `None`.
    Completion {
        queue: Option<Arc<dyn CompletionQueue>>,
        callback: Completion,
    },
    /// Fire-and-forget.
    Discard,
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Direct(_) => f.write_str("Reply::Direct"),
            Reply::Completion { queue, .. } => f
                .debug_struct("Reply::Completion")
                .field("queue", &queue.as_ref().map(|q| q.queue_id()))
                .finish_non_exhaustive(),
            Reply::Discard => f.write_str("Reply::Discard"),
        }
    }
}

impl Reply {
    #[must_use]
    pub fn completion<F>(queue: Option<Arc<dyn CompletionQueue>>, callback: F) -> Self
    where
        F: FnOnce(ReceiverResult<Value>) + Send + 'static,
    {
        Reply::Completion {
            queue,
            callback: Box::new(callback),
        }
    }

    /// Hand `result` to whoever is waiting. `own` is the target's queue.
    pub(crate) fn deliver(self, result: ReceiverResult<Value>, own: &dyn CompletionQueue) {
        match self {
            Reply::Direct(tx) => {
                // Receiver dropped means the caller stopped waiting
                let _ = tx.send(result);
            }
            Reply::Completion { queue, callback } => {
                let job: Job = Box::new(move || callback(result));
                let delivered = match queue {
                    Some(queue) => queue.submit(job),
                    None => own.submit(job),
                };
                if let Err(e) = delivered {
                    warn!(target: "ar.dispatch", error = %e, "Completion queue closed, completion dropped");
                }
            }
            Reply::Discard => {}
        }
    }
}

/// A dispatch target: anything with a queue that accepts [`Request`]s.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The target's queue.
    fn queue_id(&self) -> QueueId;

    /// Put `request` on the target's queue; its result goes to `reply`.
    ///
    /// # Errors
    ///
    /// Fails if the target has shut down, in which case `reply` is dropped
    /// without being invoked.
    async fn enqueue(&self, request: Request, reply: Reply) -> ReceiverResult<()>;

    /// Handle `request` immediately for a caller already running on the
    /// target's queue.
    ///
    /// # Errors
    ///
    /// The handler's error, or `NotReady` when the request can only be
    /// answered after the caller returns to the queue.
    fn dispatch_inline(&self, request: Request) -> ReceiverResult<Value>;

    /// Enqueue and wait for the result.
    ///
    /// Issued from the target's own queue the request runs inline through
    /// [`Dispatcher::dispatch_inline`] instead of waiting on itself.
    ///
    /// # Errors
    ///
    /// The handler's error, `Cancelled` if the target stopped before
    /// answering, or `NotReady` for an inline request that cannot complete
    /// inline.
    async fn call_blocking(&self, request: Request) -> ReceiverResult<Value> {
        if current_queue() == Some(self.queue_id()) {
            return self.dispatch_inline(request);
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(request, Reply::Direct(tx)).await?;
        rx.await.map_err(|_| ReceiverError::Cancelled)?
    }

    /// Enqueue and return immediately. `completion`, if any, later runs on
    /// `queue` (or on the target's queue) with the result.
    ///
    /// # Errors
    ///
    /// Fails only if the request could not be enqueued.
    async fn call_with_completion(
        &self,
        request: Request,
        queue: Option<Arc<dyn CompletionQueue>>,
        completion: Option<Completion>,
    ) -> ReceiverResult<()> {
        let reply = match completion {
            Some(callback) => Reply::Completion { queue, callback },
            None => Reply::Discard,
        };
        self.enqueue(request, reply).await
    }

    /// Blocking Control call returning the response mapping.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::call_blocking`].
    async fn control(&self, command: &str, params: Dict) -> ReceiverResult<Dict> {
        self.call_blocking(Request::control(command, params))
            .await
            .map(Value::into_dict)
    }

    /// # Errors
    ///
    /// See [`Dispatcher::call_blocking`].
    async fn get_property(&self, name: &str) -> ReceiverResult<Value> {
        self.call_blocking(Request::get_property(name)).await
    }

    /// # Errors
    ///
    /// See [`Dispatcher::call_blocking`].
    async fn set_property(&self, name: &str, value: Value) -> ReceiverResult<()> {
        self.call_blocking(Request::set_property(name, value))
            .await
            .map(|_| ())
    }

    /// One-way event.
    ///
    /// # Errors
    ///
    /// Fails only if the event could not be enqueued.
    async fn send_event(&self, name: &str, params: Dict) -> ReceiverResult<()> {
        self.enqueue(Request::event(name, params), Reply::Discard)
            .await
    }
}

/// An outstanding command awaiting a controller reply.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub command: String,
    pub reply: Reply,
    pub deadline: Instant,
}

/// Pending commands keyed by transaction id.
///
/// A transaction leaves the table exactly once: by reply, by deadline, or by
/// teardown. A reply for a transaction no longer present is late and is
/// discarded by the caller.
#[derive(Debug, Default)]
pub(crate) struct PendingCommands {
    next_transaction: u64,
    entries: BTreeMap<u64, PendingCommand>,
}

impl PendingCommands {
    pub fn insert(&mut self, command: &str, reply: Reply, deadline: Instant) -> u64 {
        self.next_transaction += 1;
        let transaction = self.next_transaction;
        self.entries.insert(
            transaction,
            PendingCommand {
                command: command.to_string(),
                reply,
                deadline,
            },
        );
        transaction
    }

    pub fn take(&mut self, transaction: u64) -> Option<PendingCommand> {
        self.entries.remove(&transaction)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<(u64, PendingCommand)> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(u64, PendingCommand)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::queue::SerialQueue;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_request_name_and_shape() {
        let req = Request::control("setUpStreams", Dict::new()).with_qualifier("main");
        assert_eq!(req.name(), "setUpStreams");
        assert_eq!(req.shape(), "control");
        assert_eq!(req.qualifier.as_deref(), Some("main"));

        let req = Request::set_property("playing", Value::from(true));
        assert_eq!(req.name(), "playing");
        assert_eq!(req.shape(), "set_property");

        assert_eq!(Request::event("modesChanged", Dict::new()).shape(), "event");
    }

    #[tokio::test]
    async fn test_direct_reply_delivers_result() {
        let (queue, task) = SerialQueue::spawn("own", CancellationToken::new());
        let (tx, rx) = oneshot::channel();

        Reply::Direct(tx).deliver(Ok(Value::from(3_i64)), &queue);
        assert_eq!(rx.await.unwrap(), Ok(Value::from(3_i64)));

        queue.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_completion_defaults_to_target_queue() {
        let (own, task) = SerialQueue::spawn("own", CancellationToken::new());
        let own_id = own.id();
        let (tx, rx) = oneshot::channel();

        Reply::completion(None, move |result| {
            let _ = tx.send((result, current_queue()));
        })
        .deliver(Err(ReceiverError::Cancelled), &own);

        let (result, ran_on) = rx.await.unwrap();
        assert_eq!(result, Err(ReceiverError::Cancelled));
        assert_eq!(ran_on, Some(own_id));

        own.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_commands_expire_once() {
        let mut pending = PendingCommands::default();
        let now = Instant::now();

        let a = pending.insert("changeModes", Reply::Discard, now + Duration::from_secs(2));
        let b = pending.insert("requestUI", Reply::Discard, now + Duration::from_secs(5));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.next_deadline(), Some(now + Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = pending.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired.first().map(|(id, _)| *id), Some(a));

        // The late reply finds nothing to complete
        assert!(pending.take(a).is_none());
        assert!(pending.take(b).is_some());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_drain_empties_table() {
        let mut pending = PendingCommands::default();
        let deadline = Instant::now() + Duration::from_secs(1);
        pending.insert("forceKeyFrame", Reply::Discard, deadline);
        pending.insert("setNightMode", Reply::Discard, deadline);

        let drained = pending.drain();
        assert_eq!(drained.len(), 2);
        assert!(pending.is_empty());
        assert!(pending.next_deadline().is_none());
    }
}
