//! Deferred work executed outside of interrupt context.

use std::{fmt, sync::Arc};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
};

use crate::{
    channel::ChannelCore,
    request::{try_alloc, ControlRequest, RequestData, ResultCode, State, Storage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    /// Hand the request to the handler.
    ProcessRequest,
    /// Allocate the payload buffer of the request.
    AllocRequestBuffer,
}

/// A unit of deferred work.
///
/// Owns the request record it operates on until it has run.
pub struct Task {
    core: Arc<ChannelCore>,
    slot: usize,
    data: RequestData,
    kind: TaskKind,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task").field("kind", &self.kind).field("id", &self.data.id).finish()
    }
}

impl Task {
    pub(crate) fn process_request(core: Arc<ChannelCore>, slot: usize, data: RequestData) -> Self {
        Self { core, slot, data, kind: TaskKind::ProcessRequest }
    }

    pub(crate) fn alloc_request_buffer(core: Arc<ChannelCore>, slot: usize, data: RequestData) -> Self {
        Self { core, slot, data, kind: TaskKind::AllocRequestBuffer }
    }

    /// Returns the request record of a task that was not run.
    pub(crate) fn into_data(self) -> RequestData {
        self.data
    }

    /// Runs the task.
    ///
    /// Must not be called from interrupt context.
    pub fn run(self) {
        let Self { core, slot, mut data, kind } = self;
        match kind {
            TaskKind::ProcessRequest => {
                tracing::debug!("processing request {}", data.id);
                let handler = core.handler();
                handler.process_request(ControlRequest::new(core, slot, data));
            }
            TaskKind::AllocRequestBuffer => match try_alloc(data.request_size) {
                Ok(buf) => {
                    tracing::debug!("allocated {} bytes for request {}", data.request_size, data.id);
                    data.request = Storage::Heap(buf);
                    core.complete(slot, data, State::Allocating, State::Receiving);
                }
                Err(err) => {
                    tracing::warn!("cannot allocate buffer for request {}: {err}", data.id);
                    data.result = ResultCode::NO_MEMORY;
                    core.complete(slot, data, State::Allocating, State::Done);
                }
            },
        }
    }
}

/// Queue of deferred work.
pub trait TaskQueue: Send + Sync {
    /// Enqueues a task for execution outside of interrupt context.
    ///
    /// Called from interrupt context; must neither block nor allocate, and must not
    /// run the task before returning. Queued tasks run at most once and in order.
    /// If the task cannot be queued it is returned.
    fn enqueue(&self, task: Task) -> Result<(), Task>;
}

impl<T: TaskQueue + ?Sized> TaskQueue for Arc<T> {
    fn enqueue(&self, task: Task) -> Result<(), Task> {
        (**self).enqueue(task)
    }
}

/// Bounded task queue drained by a single Tokio worker task.
#[derive(Debug, Clone)]
pub struct SystemTaskQueue {
    tx: mpsc::Sender<Task>,
}

impl SystemTaskQueue {
    /// Creates a queue holding at most `depth` tasks and spawns its worker onto `tasks`.
    ///
    /// # Panics
    /// Panics if `depth` is zero or when called outside a Tokio runtime.
    pub fn new(depth: usize, tasks: &mut JoinSet<()>) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        tasks.spawn(Self::worker(rx));
        Self { tx }
    }

    async fn worker(mut rx: mpsc::Receiver<Task>) {
        while let Some(task) = rx.recv().await {
            task.run();
        }
        tracing::debug!("task queue closed");
    }
}

impl TaskQueue for SystemTaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), Task> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                tracing::debug!("task queue full");
                Err(task)
            }
            Err(TrySendError::Closed(task)) => {
                tracing::warn!("task queue closed");
                Err(task)
            }
        }
    }
}
