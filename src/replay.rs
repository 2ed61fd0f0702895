//! Reducer contract and the base apply/replay machinery.
//!
//! Concrete document models only implement [`DocumentModel::reduce`], a pure
//! function from scope state and action to the next scope state. Everything
//! else lives here: index and skip bookkeeping, garbage collection on skips,
//! state hashing, error capture and the resulting-state cache used to avoid
//! replaying long histories.

use serde_json::Value;

use crate::document::{
    hash_scope_state, Action, Document, DocumentOperations, DocumentState, Operation, Scope,
};
use crate::history::{garbage_collect, garbage_collect_document_operations, sort_operations};

/// Side effect requested by a reducer, executed by the engine after the
/// operation batch is applied.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    CreateChild { id: String, document_type: String },
    DeleteChild { id: String },
    CopyChild { id: String, new_id: String },
}

/// Collects signals dispatched while a reducer runs.
///
/// Signals never execute inside the reducer; the pipeline drains the queue
/// once the batch is done.
#[derive(Debug, Default)]
pub struct SignalQueue {
    signals: Vec<Signal>,
}

impl SignalQueue {
    pub fn dispatch(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    pub fn drain(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// A document type implementation.
///
/// `reduce` must be pure over `(state, action)`: same inputs, same output,
/// on every replica. An `Err` rejects the action; the operation is still
/// recorded, carrying the message in `error`, and the state stays unchanged.
pub trait DocumentModel: Send + Sync + 'static {
    fn document_type(&self) -> &str;

    /// State of a freshly created document of this type.
    fn initial_state(&self) -> DocumentState;

    fn reduce(
        &self,
        state: &Value,
        action: &Action,
        signals: &mut SignalQueue,
    ) -> Result<Value, String>;
}

/// Fresh document for `model` with no operations.
pub fn create_document(model: &dyn DocumentModel) -> Document {
    Document::new(model.document_type(), model.initial_state())
}

#[derive(Debug, thiserror::Error)]
#[error("document type {0} not supported")]
pub struct UnsupportedDocumentType(pub String);

/// Lookup table from document type to model implementation.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: std::collections::HashMap<String, std::sync::Arc<dyn DocumentModel>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("types", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    pub fn new(
        models: impl IntoIterator<Item = std::sync::Arc<dyn DocumentModel>>,
    ) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|m| (m.document_type().to_string(), m))
                .collect(),
        }
    }

    pub fn get(
        &self,
        document_type: &str,
    ) -> Result<&std::sync::Arc<dyn DocumentModel>, UnsupportedDocumentType> {
        self.models
            .get(document_type)
            .ok_or_else(|| UnsupportedDocumentType(document_type.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Recomputed state hash differs from the one the operation carries.
    /// The stored history no longer reproduces the stored state.
    #[error("hash mismatch for {scope} operation {index}")]
    HashMismatch { scope: Scope, index: u64 },
    #[error("Missing operations: expected {expected} with skip 0 or equivalent, got index {index} with skip {skip}")]
    MissingOperations { expected: i64, index: u64, skip: u64 },
    #[error("invalid cached resulting state: {0}")]
    StateParse(#[from] serde_json::Error),
}

/// Options for applying and replaying operations.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Recompute every operation's hash and fail on mismatch.
    pub check_hashes: bool,
    /// Cache the post-state on each written operation and seed replays from
    /// the latest cached state instead of the initial state.
    pub reuse_resulting_state: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            check_hashes: true,
            reuse_resulting_state: false,
        }
    }
}

/// Parses the JSON text cached on an operation back into a scope state.
pub fn parse_resulting_state(cached: &str) -> Result<Value, ReplayError> {
    Ok(serde_json::from_str(cached)?)
}

/// Applies a new action to the document, recording it at the next free
/// index of its scope. `skip > 0` voids that many preceding operations
/// before the action runs.
pub fn apply_action(
    document: &mut Document,
    model: &dyn DocumentModel,
    action: Action,
    signals: &mut SignalQueue,
    skip: u64,
    options: &ApplyOptions,
) -> Result<Operation, ReplayError> {
    apply_inner(document, model, action, signals, skip, ApplyMode::Action, options)
}

/// Re-applies a stored operation during replay: index, skip, timestamp and
/// id are taken from the operation, and its stored hash is preserved.
pub fn replay_operation(
    document: &mut Document,
    model: &dyn DocumentModel,
    operation: &Operation,
    signals: &mut SignalQueue,
    options: &ApplyOptions,
) -> Result<Operation, ReplayError> {
    apply_inner(
        document,
        model,
        operation.action(),
        signals,
        operation.skip,
        ApplyMode::Replay(operation),
        options,
    )
}

/// Applies an operation received from another replica as new work: index,
/// skip, timestamp and id are taken from the operation, its skip is
/// processed, and the hash is recomputed from the resulting state so the
/// caller can compare it against the hash the operation arrived with.
pub fn apply_operation(
    document: &mut Document,
    model: &dyn DocumentModel,
    operation: &Operation,
    signals: &mut SignalQueue,
    options: &ApplyOptions,
) -> Result<Operation, ReplayError> {
    apply_inner(
        document,
        model,
        operation.action(),
        signals,
        operation.skip,
        ApplyMode::Incoming(operation),
        options,
    )
}

#[derive(Clone, Copy)]
enum ApplyMode<'a> {
    /// A brand new action, recorded at the next free index.
    Action,
    /// A stored operation re-executed to rebuild state.
    Replay(&'a Operation),
    /// A remote operation applied for the first time on this replica.
    Incoming(&'a Operation),
}

impl<'a> ApplyMode<'a> {
    fn stored(&self) -> Option<&'a Operation> {
        match self {
            ApplyMode::Action => None,
            ApplyMode::Replay(op) | ApplyMode::Incoming(op) => Some(op),
        }
    }
}

fn apply_inner(
    document: &mut Document,
    model: &dyn DocumentModel,
    action: Action,
    signals: &mut SignalQueue,
    skip: u64,
    mode: ApplyMode<'_>,
    options: &ApplyOptions,
) -> Result<Operation, ReplayError> {
    let scope = action.scope;
    let next_index = document.revision(scope) + 1;

    let mut operation = match mode.stored() {
        Some(stored) => {
            if stored.index as i64 - stored.skip as i64 > next_index {
                return Err(ReplayError::MissingOperations {
                    expected: next_index,
                    index: stored.index,
                    skip: stored.skip,
                });
            }
            let mut op = stored.clone();
            op.resulting_state = None;
            op
        }
        None => Operation {
            index: next_index as u64,
            skip,
            action_type: action.action_type.clone(),
            scope,
            input: action.input.clone(),
            hash: String::new(),
            timestamp: chrono::Utc::now(),
            id: action.id.clone(),
            resulting_state: None,
            error: None,
        },
    };

    // Replayed logs are already garbage collected, so their skip headers
    // void nothing that is still present; action and incoming skips run.
    let process_skip = skip > 0 && !matches!(mode, ApplyMode::Replay(_));
    let snapshot = process_skip.then(|| {
        (
            document.state.get(scope).clone(),
            document.operations.get(scope).clone(),
        )
    });

    if process_skip {
        let mut with_header = document.operations.get(scope).clone();
        with_header.push(operation.clone());
        let pruned = garbage_collect(&sort_operations(&with_header));
        let survivors = &pruned[..pruned.len() - 1];

        let base_state = survivors
            .last()
            .and_then(|op| op.resulting_state.as_deref())
            .filter(|_| options.reuse_resulting_state)
            .and_then(|cached| parse_resulting_state(cached).ok())
            .unwrap_or_else(|| {
                fold_scope_state(document.initial_state.get(scope), survivors, model)
            });

        document.state.set(scope, base_state);
        *document.operations.get_mut(scope) = pruned;
    } else {
        document.operations.get_mut(scope).push(operation.clone());
    }

    // Errored operations replay as inert records: the reducer already
    // rejected them once, the state did not change.
    let rejected = operation.error.is_some();
    if !rejected && !operation.is_noop() {
        match model.reduce(document.state.get(scope), &action, signals) {
            Ok(new_state) => document.state.set(scope, new_state),
            Err(message) => {
                operation.error = Some(message);
                operation.skip = 0;
                if let Some((state, mut ops)) = snapshot {
                    document.state.set(scope, state);
                    ops.push(operation.clone());
                    *document.operations.get_mut(scope) = ops;
                } else if let Some(last) = document.operations.get_mut(scope).last_mut() {
                    last.error = operation.error.clone();
                    last.skip = 0;
                }
            }
        }
    }

    let computed = hash_scope_state(document.state.get(scope));
    match mode {
        ApplyMode::Replay(stored) if !stored.hash.is_empty() => {
            if options.check_hashes
                && operation.error.is_none()
                && stored.hash != computed
            {
                // roll back the appended record before surfacing
                document.operations.get_mut(scope).pop();
                return Err(ReplayError::HashMismatch {
                    scope,
                    index: stored.index,
                });
            }
            operation.hash = stored.hash.clone();
        }
        _ => operation.hash = computed,
    }

    if options.reuse_resulting_state {
        operation.resulting_state = Some(document.state.get(scope).to_string());
    }

    if let Some(last) = document.operations.get_mut(scope).last_mut() {
        last.hash = operation.hash.clone();
        last.skip = operation.skip;
        last.error = operation.error.clone();
        last.resulting_state = operation.resulting_state.clone();
    }
    if operation.timestamp > document.last_modified {
        document.last_modified = operation.timestamp;
    }

    Ok(operation)
}

/// Folds a garbage-collected operation range into a scope state, starting
/// from `initial`. Errored operations and NOOPs leave the state unchanged.
/// Signals are suppressed; they already ran when the operations were first
/// applied.
fn fold_scope_state(initial: &Value, operations: &[Operation], model: &dyn DocumentModel) -> Value {
    let mut state = initial.clone();
    let mut discard = SignalQueue::default();
    for op in operations {
        if op.error.is_some() || op.is_noop() {
            continue;
        }
        if let Ok(next) = model.reduce(&state, &op.action(), &mut discard) {
            state = next;
        }
    }
    state
}

/// Rebuilds a document from its initial state and operation history.
///
/// With `reuse_resulting_state` the replay seeds each scope from the latest
/// operation carrying a cached state and only re-executes what follows; if
/// every scope's last operation has a cache, nothing is re-executed at all.
/// With `check_hashes` every re-executed operation is verified against the
/// hash it carries; otherwise only the final state of each scope is checked
/// against the last operation's hash.
pub fn replay_document(
    initial_state: DocumentState,
    operations: &DocumentOperations,
    model: &dyn DocumentModel,
    options: &ApplyOptions,
) -> Result<Document, ReplayError> {
    let cleared = garbage_collect_document_operations(operations);

    let mut document = Document::new(model.document_type(), initial_state);
    let mut to_replay: Vec<Operation> = Vec::new();

    for scope in Scope::ALL {
        let scope_ops = cleared.get(scope);
        if options.reuse_resulting_state {
            let seed = scope_ops
                .iter()
                .rposition(|op| op.resulting_state.is_some())
                .and_then(|pos| {
                    let cached = scope_ops[pos].resulting_state.as_deref()?;
                    parse_resulting_state(cached).ok().map(|state| (pos, state))
                });
            match seed {
                Some((pos, state)) => {
                    document.state.set(scope, state);
                    document
                        .operations
                        .get_mut(scope)
                        .extend_from_slice(&scope_ops[..=pos]);
                    to_replay.extend_from_slice(&scope_ops[pos + 1..]);
                }
                None => to_replay.extend_from_slice(scope_ops),
            }
        } else {
            to_replay.extend_from_slice(scope_ops);
        }
    }

    let mut discard = SignalQueue::default();
    for operation in &to_replay {
        replay_operation(&mut document, model, operation, &mut discard, options)?;
    }

    if !options.check_hashes {
        for scope in Scope::ALL {
            let last_replayed = to_replay.iter().rev().find(|op| op.scope == scope);
            if let Some(op) = last_replayed {
                if op.hash != hash_scope_state(document.state.get(scope)) {
                    return Err(ReplayError::HashMismatch {
                        scope,
                        index: op.index,
                    });
                }
            }
        }
    }

    let last_ts = Scope::ALL
        .iter()
        .filter_map(|s| document.operations.get(*s).last())
        .map(|op| op.timestamp)
        .max();
    if let Some(ts) = last_ts {
        document.last_modified = ts;
    }

    Ok(document)
}
