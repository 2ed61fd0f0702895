//! Job queue for operation application.
//!
//! Jobs target one (document, scope) pair. Jobs for the same target run
//! strictly in submission order, one at a time; jobs for different targets
//! run concurrently. The manager is a single actor task owning all queue
//! state, with a oneshot ticket per job the way callers await replies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::document::{Action, Operation, Scope};
use crate::engine::OperationResult;
use crate::transmitter::UpdateSource;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job contains no work")]
    Empty,
    #[error("job mixes operations from different scopes")]
    MixedScopes,
    #[error("document {0} was deleted, queue rejects new jobs")]
    DocumentDeleted(String),
    #[error("queue manager is shut down")]
    Closed,
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
}

#[derive(Debug, Clone)]
pub enum JobKind {
    Operations(Vec<Operation>),
    Actions(Vec<Action>),
}

/// A unit of queued work against one scope of one document.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub document_id: String,
    pub scope: Scope,
    pub kind: JobKind,
    /// Where the work originated; pulled strands carry their trigger.
    pub source: UpdateSource,
}

impl Job {
    pub fn operations(
        document_id: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Result<Self, QueueError> {
        let scope = uniform_scope(operations.iter().map(|op| op.scope))?;
        Ok(Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            scope,
            kind: JobKind::Operations(operations),
            source: UpdateSource::Local,
        })
    }

    pub fn actions(
        document_id: impl Into<String>,
        actions: Vec<Action>,
    ) -> Result<Self, QueueError> {
        let scope = uniform_scope(actions.iter().map(|a| a.scope))?;
        Ok(Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            scope,
            kind: JobKind::Actions(actions),
            source: UpdateSource::Local,
        })
    }

    pub fn with_source(mut self, source: UpdateSource) -> Self {
        self.source = source;
        self
    }
}

fn uniform_scope(mut scopes: impl Iterator<Item = Scope>) -> Result<Scope, QueueError> {
    let first = scopes.next().ok_or(QueueError::Empty)?;
    if scopes.any(|s| s != first) {
        return Err(QueueError::MixedScopes);
    }
    Ok(first)
}

/// Executes jobs handed out by the queue. Implemented by the engine.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Infrastructure failures only; a rejected operation is a successful
    /// job whose [`OperationResult`] carries the error.
    async fn process_job(&self, job: Job) -> anyhow::Result<OperationResult>;
}

type JobOutcome = Result<OperationResult, QueueError>;

/// Handle to an enqueued job, resolved when the job ran.
#[derive(derive_more::Debug)]
pub struct JobTicket {
    pub job_id: String,
    #[debug("receiver")]
    receiver: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub async fn wait(self) -> Result<OperationResult, QueueError> {
        self.receiver.await.map_err(|_| QueueError::Closed)?
    }
}

#[derive(derive_more::Debug)]
enum ToQueue {
    Enqueue {
        job: Job,
        #[debug("reply")]
        reply: oneshot::Sender<Result<JobTicket, QueueError>>,
    },
    MarkDeleted {
        document_id: String,
    },
    Shutdown,
}

/// Client handle to the queue actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueManager {
    tx: mpsc::Sender<ToQueue>,
}

impl QueueManager {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        let (tx, inbox) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::channel(64);
        let actor = QueueActor {
            inbox,
            handler,
            done_tx,
            done_rx,
            queues: HashMap::new(),
            deleted: HashSet::new(),
        };
        tokio::spawn(async move {
            actor.run().await;
        });
        Self { tx }
    }

    pub async fn enqueue(&self, job: Job) -> Result<JobTicket, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ToQueue::Enqueue { job, reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)?
    }

    /// Drops pending jobs for the document and rejects future ones.
    pub async fn mark_deleted(&self, document_id: impl Into<String>) {
        let _ = self
            .tx
            .send(ToQueue::MarkDeleted {
                document_id: document_id.into(),
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ToQueue::Shutdown).await;
    }
}

type TargetKey = (String, Scope);

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
struct TargetQueue {
    pending: VecDeque<QueuedJob>,
    running: bool,
}

struct QueueActor {
    inbox: mpsc::Receiver<ToQueue>,
    handler: Arc<dyn JobHandler>,
    done_tx: mpsc::Sender<TargetKey>,
    done_rx: mpsc::Receiver<TargetKey>,
    queues: HashMap<TargetKey, TargetQueue>,
    deleted: HashSet<String>,
}

impl QueueActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    match msg {
                        Some(ToQueue::Enqueue { job, reply }) => {
                            let _ = reply.send(self.enqueue(job));
                        }
                        Some(ToQueue::MarkDeleted { document_id }) => {
                            self.mark_deleted(document_id);
                        }
                        Some(ToQueue::Shutdown) | None => break,
                    }
                }
                Some(key) = self.done_rx.recv() => {
                    if let Some(queue) = self.queues.get_mut(&key) {
                        queue.running = false;
                    }
                    self.start_next(key);
                }
            }
        }
        debug!("queue actor loop stopped");
    }

    fn enqueue(&mut self, job: Job) -> Result<JobTicket, QueueError> {
        if self.deleted.contains(&job.document_id) {
            warn!(document_id = %job.document_id, "rejecting job for deleted document");
            return Err(QueueError::DocumentDeleted(job.document_id));
        }

        let job_id = job.job_id.clone();
        let key = (job.document_id.clone(), job.scope);
        let (done, receiver) = oneshot::channel();
        trace!(job_id = %job_id, document_id = %key.0, scope = %key.1, "job enqueued");
        self.queues
            .entry(key.clone())
            .or_default()
            .pending
            .push_back(QueuedJob { job, done });
        self.start_next(key);

        Ok(JobTicket { job_id, receiver })
    }

    fn mark_deleted(&mut self, document_id: String) {
        self.deleted.insert(document_id.clone());
        self.queues.retain(|(doc, _), queue| {
            if doc != &document_id {
                return true;
            }
            for queued in queue.pending.drain(..) {
                let _ = queued
                    .done
                    .send(Err(QueueError::DocumentDeleted(document_id.clone())));
            }
            queue.running
        });
    }

    fn start_next(&mut self, key: TargetKey) {
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        if queue.running {
            return;
        }
        let Some(QueuedJob { job, done }) = queue.pending.pop_front() else {
            return;
        };
        queue.running = true;

        let handler = self.handler.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let job_id = job.job_id.clone();
            trace!(job_id = %job_id, "job started");
            let outcome = match handler.process_job(job).await {
                Ok(result) => Ok(result),
                Err(err) => {
                    error!(job_id = %job_id, "job failed: {err:#}");
                    Err(QueueError::JobFailed {
                        job_id: job_id.clone(),
                        message: format!("{err:#}"),
                    })
                }
            };
            let _ = done.send(outcome);
            let _ = done_tx.send(key).await;
        });
    }
}
