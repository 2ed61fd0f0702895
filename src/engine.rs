//! The drive engine: ties storage, queue, replay, synchronization state
//! and listeners together.
//!
//! All writes go through the job queue, one lane per (document, scope).
//! A job rebuilds the document from storage, rebases the incoming
//! operations onto the stored history, applies them through the document
//! model, persists atomically and then fans the new revisions out to the
//! registered listeners. Signals collected while reducing run only after
//! the whole batch is applied.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::document::{Action, Document, Operation, Scope, DRIVE_DOCUMENT_TYPE};
use crate::drive::drive_local_state;
use crate::history::{
    attach_branch, garbage_collect, merge, precedes, remove_existing_operations,
    reshuffle_by_timestamp, sort_operations,
};
use crate::listener::{Listener, ListenerManager, ListenerManagerOptions};
use crate::queue::{Job, JobHandler, JobKind, QueueError, QueueManager};
use crate::replay::{
    apply_action, apply_operation, create_document, replay_document, ApplyOptions, DocumentModel,
    ModelRegistry, ReplayError, Signal, SignalQueue, UnsupportedDocumentType,
};
use crate::storage::{with_retry, RetryOptions, Storage, StorageError};
use crate::sync::{SyncError, SyncStatus, SyncStatusUpdate, SyncUnitId, SynchronizationManager};
use crate::transmitter::{
    PullLoop, PullOptions, StrandSink, StrandTransport, StrandUpdate, UpdateSource, UpdateStatus,
};

/// Why an operation was rejected by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The recomputed state hash differs from the one the operation
    /// arrived with: both replicas applied the same position differently.
    #[error(
        "conflicting operation {}:{} for scope {}",
        attempted.index, attempted.skip, attempted.scope
    )]
    Conflict {
        existing: Box<Operation>,
        attempted: Box<Operation>,
    },
    #[error("Missing operations: expected {expected} with skip 0 or equivalent, got index {index} with skip {skip}")]
    Missing { expected: i64, index: u64, skip: u64 },
    #[error("{0}")]
    Apply(String),
}

impl OperationError {
    pub fn status(&self) -> UpdateStatus {
        match self {
            OperationError::Conflict { .. } => UpdateStatus::Conflict,
            OperationError::Missing { .. } => UpdateStatus::Missing,
            OperationError::Apply(_) => UpdateStatus::Error,
        }
    }
}

/// A side effect requested by a reducer, with the outcome of running it.
#[derive(Debug)]
pub struct SignalResult {
    pub signal: Signal,
    pub error: Option<String>,
}

/// Outcome of an operation or action batch.
#[derive(Debug)]
pub struct OperationResult {
    pub status: UpdateStatus,
    pub document: Option<Document>,
    /// Operations as actually recorded, possibly reindexed by a merge.
    pub operations: Vec<Operation>,
    pub signals: Vec<SignalResult>,
    pub error: Option<OperationError>,
}

impl OperationResult {
    pub fn success() -> Self {
        Self {
            status: UpdateStatus::Success,
            document: None,
            operations: Vec::new(),
            signals: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UpdateStatus::Success
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("document {0} is not a drive")]
    NotADrive(String),
    #[error("invalid drive state: {0}")]
    InvalidDriveState(String),
    #[error(transparent)]
    UnsupportedType(#[from] UnsupportedDocumentType),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub listener: ListenerManagerOptions,
    pub retry: RetryOptions,
}

pub struct Engine {
    // self handle for tasks spawned from &self methods
    this: Weak<Engine>,
    storage: Arc<dyn Storage>,
    models: Arc<ModelRegistry>,
    sync_manager: Arc<SynchronizationManager>,
    listeners: Arc<ListenerManager>,
    queue: QueueManager,
    options: EngineOptions,
    // drive id -> trigger id -> cancel handle for the pull loop
    triggers: Mutex<HashMap<String, HashMap<String, CancellationToken>>>,
}

/// Delegates queue jobs back into the engine. Holds a weak handle so the
/// queue actor does not keep a dropped engine alive.
struct EngineJobHandler {
    engine: Weak<Engine>,
}

#[async_trait]
impl JobHandler for EngineJobHandler {
    async fn process_job(&self, job: Job) -> anyhow::Result<OperationResult> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("engine was dropped"))?;
        engine.process_job(job).await.map_err(anyhow::Error::from)
    }
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        models: ModelRegistry,
        options: EngineOptions,
    ) -> Arc<Self> {
        let models = Arc::new(models);
        let sync_manager = Arc::new(SynchronizationManager::new(storage.clone(), models.clone()));
        let listeners = Arc::new(ListenerManager::new(sync_manager.clone(), options.listener));
        Arc::new_cyclic(|engine: &Weak<Engine>| {
            let queue = QueueManager::new(Arc::new(EngineJobHandler {
                engine: engine.clone(),
            }));
            Engine {
                this: engine.clone(),
                storage,
                models,
                sync_manager,
                listeners,
                queue,
                options,
                triggers: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn sync_manager(&self) -> &Arc<SynchronizationManager> {
        &self.sync_manager
    }

    pub fn listener_manager(&self) -> &Arc<ListenerManager> {
        &self.listeners
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Creates an empty document of the given type.
    pub async fn add_document(
        &self,
        document_id: &str,
        document_type: &str,
    ) -> Result<Document, EngineError> {
        let model = self.models.get(document_type)?;
        let document = create_document(&**model);
        self.storage
            .create_document(document_id, document.clone())
            .await?;
        debug!(document_id, document_type, "document created");
        Ok(document)
    }

    /// Creates an empty drive and seeds its sync status from whatever
    /// listeners and triggers its state carries (none, for a fresh one).
    pub async fn add_drive(&self, drive_id: &str, name: &str) -> Result<Document, EngineError> {
        let model = self.models.get(DRIVE_DOCUMENT_TYPE)?;
        let mut document = create_document(&**model);
        document.name = name.to_string();
        self.storage
            .create_document(drive_id, document.clone())
            .await?;
        self.sync_manager
            .initialize_drive_sync_status(drive_id, &document)
            .await?;
        info!(drive_id, name, "drive created");
        Ok(document)
    }

    /// Rebuilds the document from storage, verifying operation hashes.
    pub async fn get_document(&self, document_id: &str) -> Result<Document, EngineError> {
        Ok(self.sync_manager.build_document(document_id).await?)
    }

    pub async fn document_ids(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.storage.document_ids().await?)
    }

    /// Deletes a document, dropping its queued jobs and sync state. For a
    /// drive this also stops pull loops and disconnects its listeners.
    pub async fn delete_document(&self, document_id: &str) -> Result<(), EngineError> {
        self.queue.mark_deleted(document_id).await;
        let stored = self.storage.get_document(document_id).await?;
        if stored.document_type == DRIVE_DOCUMENT_TYPE {
            self.stop_pull(document_id).await;
            self.listeners.remove_drive(document_id).await;
        }
        self.storage.delete_document(document_id).await?;
        self.sync_manager.remove_document(document_id).await;
        info!(document_id, "document deleted");
        Ok(())
    }

    pub async fn delete_drive(&self, drive_id: &str) -> Result<(), EngineError> {
        self.delete_document(drive_id).await
    }

    /// Registers a push listener and runs a catch-up round for it.
    pub async fn add_listener(&self, listener: Listener) -> Result<(), EngineError> {
        Ok(self.listeners.set_listener(listener).await?)
    }

    pub async fn remove_listener(&self, drive_id: &str, listener_id: &str) -> bool {
        self.listeners.remove_listener(drive_id, listener_id).await
    }

    /// Events for every sync status change, across all units.
    pub async fn subscribe_sync_events(
        &self,
    ) -> flume::Receiver<crate::sync::SyncStatusEvent> {
        self.sync_manager.subscribe().await
    }

    /// Queues operations for application; resolves when the jobs ran.
    pub async fn queue_operations(
        &self,
        document_id: &str,
        operations: Vec<Operation>,
    ) -> Result<OperationResult, EngineError> {
        self.queue_operations_with_source(document_id, operations, UpdateSource::Local)
            .await
    }

    pub async fn add_operations(
        &self,
        document_id: &str,
        operations: Vec<Operation>,
    ) -> Result<OperationResult, EngineError> {
        self.queue_operations(document_id, operations).await
    }

    async fn queue_operations_with_source(
        &self,
        document_id: &str,
        operations: Vec<Operation>,
        source: UpdateSource,
    ) -> Result<OperationResult, EngineError> {
        if let Some(result) = self
            .result_if_existing_operations(document_id, &operations)
            .await
        {
            trace!(document_id, "all operations already stored");
            return Ok(result);
        }
        let mut jobs = Vec::new();
        for scope in Scope::ALL {
            let scoped: Vec<Operation> = operations
                .iter()
                .filter(|op| op.scope == scope)
                .cloned()
                .collect();
            if scoped.is_empty() {
                continue;
            }
            jobs.push(Job::operations(document_id, scoped)?.with_source(source.clone()));
        }
        self.run_jobs(jobs).await
    }

    /// Turns actions into operations on the current document and queues
    /// them, one job per scope.
    pub async fn queue_actions(
        &self,
        document_id: &str,
        actions: Vec<Action>,
    ) -> Result<OperationResult, EngineError> {
        let mut jobs = Vec::new();
        for scope in Scope::ALL {
            let scoped: Vec<Action> = actions
                .iter()
                .filter(|a| a.scope == scope)
                .cloned()
                .collect();
            if scoped.is_empty() {
                continue;
            }
            jobs.push(Job::actions(document_id, scoped)?);
        }
        self.run_jobs(jobs).await
    }

    pub async fn add_actions(
        &self,
        document_id: &str,
        actions: Vec<Action>,
    ) -> Result<OperationResult, EngineError> {
        self.queue_actions(document_id, actions).await
    }

    pub async fn add_action(
        &self,
        document_id: &str,
        action: Action,
    ) -> Result<OperationResult, EngineError> {
        self.queue_actions(document_id, vec![action]).await
    }

    async fn run_jobs(&self, jobs: Vec<Job>) -> Result<OperationResult, EngineError> {
        let mut tickets = Vec::with_capacity(jobs.len());
        for job in jobs {
            tickets.push(self.queue.enqueue(job).await?);
        }
        let mut combined = OperationResult::success();
        for ticket in tickets {
            let result = ticket.wait().await?;
            combined.operations.extend(result.operations);
            combined.signals.extend(result.signals);
            if combined.error.is_none() && result.error.is_some() {
                combined.status = result.status;
                combined.error = result.error;
            }
            if result.document.is_some() {
                combined.document = result.document;
            }
        }
        Ok(combined)
    }

    async fn process_job(&self, job: Job) -> Result<OperationResult, EngineError> {
        match job.kind {
            JobKind::Operations(operations) => {
                self.process_operations(&job.document_id, operations, job.source)
                    .await
            }
            JobKind::Actions(actions) => {
                self.process_actions(&job.document_id, actions).await
            }
        }
    }

    /// Runs the actions through the model to turn them into operations
    /// with fresh indexes and hashes, then feeds those into the pipeline.
    async fn process_actions(
        &self,
        document_id: &str,
        actions: Vec<Action>,
    ) -> Result<OperationResult, EngineError> {
        let mut scratch = self.sync_manager.build_document(document_id).await?;
        let model = self.models.get(&scratch.document_type)?.clone();
        let mut operations = Vec::with_capacity(actions.len());
        // signals fire when the pipeline applies the built operations, not
        // during this dry run
        let mut discard = SignalQueue::default();
        for action in actions {
            let operation = apply_action(
                &mut scratch,
                &*model,
                action,
                &mut discard,
                0,
                &ApplyOptions::default(),
            )?;
            operations.push(operation);
        }
        self.process_operations(document_id, operations, UpdateSource::Local)
            .await
    }

    async fn process_operations(
        &self,
        document_id: &str,
        operations: Vec<Operation>,
        source: UpdateSource,
    ) -> Result<OperationResult, EngineError> {
        if let Some(result) = self
            .result_if_existing_operations(document_id, &operations)
            .await
        {
            return Ok(result);
        }

        enum Attempt {
            Done(PipelineOutcome),
            Failed(EngineError),
        }

        let ops = &operations;
        let attempt = with_retry(&self.options.retry, move || async move {
            let stored = self.storage.get_document(document_id).await?;
            let outcome = match self.pipeline(&stored, ops).await {
                Ok(outcome) => outcome,
                Err(err) => return Ok(Attempt::Failed(err)),
            };
            if !outcome.applied.is_empty() {
                self.storage
                    .add_operations(document_id, &outcome.applied, &outcome.document)
                    .await?;
            }
            Ok(Attempt::Done(outcome))
        })
        .await;

        let mut outcome = match attempt {
            Ok(Attempt::Done(outcome)) => outcome,
            Ok(Attempt::Failed(err)) => return Err(err),
            Err(StorageError::Conflict {
                existing,
                attempted,
            }) => {
                warn!(
                    document_id,
                    index = attempted.index,
                    "storage rejected conflicting operation"
                );
                return Ok(OperationResult {
                    status: UpdateStatus::Conflict,
                    document: None,
                    operations: Vec::new(),
                    signals: Vec::new(),
                    error: Some(OperationError::Conflict {
                        existing,
                        attempted,
                    }),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let signals = self
            .execute_signals(document_id, std::mem::take(&mut outcome.signals))
            .await;
        self.notify_applied(document_id, &operations, &outcome, source)
            .await;

        let status = outcome
            .error
            .as_ref()
            .map(|e| e.status())
            .unwrap_or(UpdateStatus::Success);
        Ok(OperationResult {
            status,
            document: Some(outcome.document),
            operations: outcome.applied,
            signals,
            error: outcome.error,
        })
    }

    /// Retransmission check: when every operation (by id, index, type and
    /// hash) is already part of the stored history, the batch is a replayed
    /// delivery and succeeds without touching the pipeline.
    async fn result_if_existing_operations(
        &self,
        document_id: &str,
        operations: &[Operation],
    ) -> Option<OperationResult> {
        if operations.is_empty() {
            return None;
        }
        let document = self.sync_manager.build_document(document_id).await.ok()?;
        let all_existing = operations.iter().all(|op| {
            op.id.is_some()
                && document.operations.get(op.scope).iter().any(|existing| {
                    existing.id == op.id
                        && existing.index == op.index
                        && existing.action_type == op.action_type
                        && existing.hash == op.hash
                })
        });
        all_existing.then(|| OperationResult {
            status: UpdateStatus::Success,
            document: Some(document),
            operations: operations.to_vec(),
            signals: Vec::new(),
            error: None,
        })
    }

    /// Rebases the incoming operations onto the stored history and applies
    /// them one by one, stopping at the first rejection but keeping what
    /// was applied before it.
    async fn pipeline(
        &self,
        stored: &Document,
        operations: &[Operation],
    ) -> Result<PipelineOutcome, EngineError> {
        let model = self.models.get(&stored.document_type)?.clone();
        let options = ApplyOptions {
            check_hashes: true,
            reuse_resulting_state: true,
        };
        let mut document = replay_document(
            stored.initial_state.clone(),
            &stored.operations,
            &*model,
            &options,
        )?;
        document.name = stored.name.clone();
        document.created = stored.created;

        let mut applied = Vec::new();
        let mut signal_queue = SignalQueue::default();
        let mut error = None;

        'scopes: for scope in Scope::ALL {
            let incoming: Vec<Operation> = operations
                .iter()
                .filter(|op| op.scope == scope)
                .cloned()
                .collect();
            if incoming.is_empty() {
                continue;
            }
            let stored_ops = stored.operations.get(scope);
            let branch = remove_existing_operations(&incoming, stored_ops);
            if branch.is_empty() {
                continue;
            }

            let trunk = garbage_collect(&sort_operations(stored_ops));
            let (inverted_trunk, tail) = attach_branch(&trunk, &branch);
            let new_history = if tail.is_empty() {
                inverted_trunk
            } else {
                merge(&trunk, &inverted_trunk, reshuffle_by_timestamp)
            };
            let last_trunk = trunk.last().cloned();
            let to_apply = new_history
                .into_iter()
                .filter(|op| last_trunk.as_ref().map_or(true, |t| precedes(t, op)));

            for next in to_apply {
                // a merge reindexes displaced operations, their original
                // hashes no longer match the new positions
                let mut skip_hash_validation = false;
                if !tail.is_empty() {
                    let source_op = operations.iter().find(|op| op.hash == next.hash);
                    skip_hash_validation = source_op
                        .map_or(true, |s| s.index != next.index || s.skip != next.skip);
                }

                tokio::task::yield_now().await;
                match perform_operation(
                    &mut document,
                    &*model,
                    &next,
                    skip_hash_validation,
                    &mut signal_queue,
                ) {
                    Ok(operation) => applied.push(operation),
                    Err(err) => {
                        warn!(scope = %scope, index = next.index, "operation rejected: {err}");
                        error = Some(err);
                        break 'scopes;
                    }
                }
            }
        }

        Ok(PipelineOutcome {
            document,
            applied,
            signals: signal_queue.drain(),
            error,
        })
    }

    async fn execute_signals(
        &self,
        document_id: &str,
        signals: Vec<Signal>,
    ) -> Vec<SignalResult> {
        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            let outcome = self.execute_signal(&signal).await;
            let error = outcome.err().map(|e| e.to_string());
            if let Some(err) = &error {
                error!(document_id, ?signal, "signal execution failed: {err}");
            }
            results.push(SignalResult { signal, error });
        }
        results
    }

    async fn execute_signal(&self, signal: &Signal) -> Result<(), EngineError> {
        match signal {
            Signal::CreateChild { id, document_type } => {
                match self.add_document(id, document_type).await {
                    // a replayed batch recreates children it already made
                    Err(EngineError::Storage(StorageError::AlreadyExists(_))) => Ok(()),
                    other => other.map(|_| ()),
                }
            }
            Signal::DeleteChild { id } => {
                self.queue.mark_deleted(id).await;
                match self.storage.delete_document(id).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.sync_manager.remove_document(id).await;
                Ok(())
            }
            Signal::CopyChild { id, new_id } => {
                let source = self.storage.get_document(id).await?;
                match self.storage.create_document(new_id, source).await {
                    Err(StorageError::AlreadyExists(_)) => Ok(()),
                    other => Ok(other?),
                }
            }
        }
    }

    /// Marks the touched units as syncing and kicks off a listener round;
    /// the round resolves the statuses when it finishes.
    async fn notify_applied(
        &self,
        document_id: &str,
        submitted: &[Operation],
        outcome: &PipelineOutcome,
        source: UpdateSource,
    ) {
        if outcome.applied.is_empty() {
            return;
        }
        let Some(engine) = self.this.upgrade() else {
            return;
        };

        // a merge produced operations the sender never saw, so from the
        // listeners' point of view this node originated new changes
        let reshuffled = outcome.applied.iter().any(|applied| {
            !submitted.iter().any(|op| {
                op.id == applied.id
                    && op.index == applied.index
                    && op.skip == applied.skip
                    && op.hash == applied.hash
            })
        });
        let source = if reshuffled { UpdateSource::Local } else { source };
        let force = source == UpdateSource::Local;

        let mut units: Vec<SyncUnitId> = Vec::new();
        for operation in &outcome.applied {
            let unit = SyncUnitId::new(document_id, operation.scope);
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        for unit in &units {
            self.sync_manager
                .update_sync_status(unit, direction_update(&source, SyncStatus::Syncing), None)
                .await;
        }

        tokio::spawn(async move {
            let result = engine.listeners.trigger_update(force, source.clone()).await;
            match result {
                Ok(()) => {
                    for unit in &units {
                        engine
                            .sync_manager
                            .update_sync_status(
                                unit,
                                direction_update(&source, SyncStatus::Success),
                                None,
                            )
                            .await;
                    }
                }
                Err(err) => {
                    error!("listener fanout failed: {err:#}");
                    for unit in &units {
                        engine
                            .sync_manager
                            .update_sync_status(
                                unit,
                                direction_update(&source, SyncStatus::Error),
                                Some(format!("{err:#}")),
                            )
                            .await;
                    }
                }
            }
        });
    }

    /// Starts a pull loop for every trigger of the drive that is not
    /// already running.
    pub async fn start_pull(
        &self,
        drive_id: &str,
        transport: Arc<dyn StrandTransport>,
    ) -> Result<(), EngineError> {
        let sink = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("engine was dropped"))?;
        let drive = self.get_document(drive_id).await?;
        if drive.document_type != DRIVE_DOCUMENT_TYPE {
            return Err(EngineError::NotADrive(drive_id.to_string()));
        }
        let local =
            drive_local_state(&drive.state.local).map_err(EngineError::InvalidDriveState)?;

        let mut triggers = self.triggers.lock().await;
        let drive_triggers = triggers.entry(drive_id.to_string()).or_default();
        for trigger in &local.triggers {
            if drive_triggers.contains_key(&trigger.id) {
                continue;
            }
            self.sync_manager
                .update_sync_status(
                    &SyncUnitId::new(drive_id, Scope::Global),
                    SyncStatusUpdate::pull(SyncStatus::Syncing),
                    None,
                )
                .await;
            let options = PullOptions {
                interval: Duration::from_secs(trigger.interval_seconds.max(1)),
                ..PullOptions::new(trigger.id.clone(), trigger.listener_id.clone())
            };
            let token = PullLoop::spawn(
                transport.clone(),
                options,
                sink.clone() as Arc<dyn StrandSink>,
            );
            debug!(drive_id, trigger_id = %trigger.id, "pull loop registered");
            drive_triggers.insert(trigger.id.clone(), token);
        }
        Ok(())
    }

    /// Cancels all pull loops of a drive.
    pub async fn stop_pull(&self, drive_id: &str) {
        if let Some(tokens) = self.triggers.lock().await.remove(drive_id) {
            for token in tokens.into_values() {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl StrandSink for Engine {
    async fn apply_strand(
        &self,
        strand: StrandUpdate,
        source: UpdateSource,
    ) -> anyhow::Result<OperationResult> {
        if strand.operations.is_empty() {
            return Ok(OperationResult::success());
        }
        let unit_id = strand.unit_id();
        self.sync_manager
            .update_sync_status(&unit_id, SyncStatusUpdate::pull(SyncStatus::Syncing), None)
            .await;

        let operations = strand.operations();
        let result = self
            .queue_operations_with_source(&strand.document_id, operations, source)
            .await?;

        self.sync_manager
            .update_sync_status(
                &unit_id,
                SyncStatusUpdate::pull(result.status.to_sync_status()),
                result.error.as_ref().map(|e| e.to_string()),
            )
            .await;
        Ok(result)
    }

    async fn on_pull_error(&self, error: &anyhow::Error) {
        error!("pull failed: {error:#}");
    }
}

fn direction_update(source: &UpdateSource, status: SyncStatus) -> SyncStatusUpdate {
    match source {
        UpdateSource::Local => SyncStatusUpdate::push(status),
        UpdateSource::Trigger { .. } => SyncStatusUpdate::pull(status),
    }
}

struct PipelineOutcome {
    document: Document,
    applied: Vec<Operation>,
    signals: Vec<Signal>,
    error: Option<OperationError>,
}

/// Applies one rebased operation through the model and validates the
/// recorded result against what the sender claimed.
fn perform_operation(
    document: &mut Document,
    model: &dyn DocumentModel,
    operation: &Operation,
    skip_hash_validation: bool,
    signals: &mut SignalQueue,
) -> Result<Operation, OperationError> {
    let options = ApplyOptions {
        check_hashes: true,
        reuse_resulting_state: true,
    };
    let applied = apply_operation(document, model, operation, signals, &options).map_err(
        |err| match err {
            ReplayError::MissingOperations {
                expected,
                index,
                skip,
            } => OperationError::Missing {
                expected,
                index,
                skip,
            },
            other => OperationError::Apply(other.to_string()),
        },
    )?;

    if applied.index != operation.index || applied.skip != operation.skip {
        return Err(OperationError::Apply(format!(
            "Operation with index {}:{} was not applied.",
            operation.index, operation.skip
        )));
    }
    if applied.error.is_none() && applied.hash != operation.hash && !skip_hash_validation {
        return Err(OperationError::Conflict {
            existing: Box::new(applied),
            attempted: Box::new(operation.clone()),
        });
    }
    Ok(applied)
}
