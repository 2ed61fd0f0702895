//! Listener manager: push-side fanout of new operations.
//!
//! A listener subscribes a transmitter to the synchronization units of a
//! drive, narrowed by a [`ListenerFilter`]. The manager keeps a cursor per
//! (listener, unit) with the last acknowledged revision, and on every
//! update round pushes the operations past that cursor through the
//! listener's transmitter. Rounds are debounced so bursts of local writes
//! collapse into one push.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::sync::{GetStrandsOptions, SyncUnit, SyncUnitId, SynchronizationManager};
use crate::transmitter::{
    OperationUpdate, StrandUpdate, Transmitter, UpdateSource, UpdateStatus,
};

/// Narrows which synchronization units a listener receives. An empty
/// field or a `"*"` entry matches everything for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerFilter {
    pub document_id: Vec<String>,
    pub document_type: Vec<String>,
    pub scope: Vec<String>,
    pub branch: Vec<String>,
}

impl ListenerFilter {
    pub fn matches(&self, document_id: &str, document_type: &str, unit_id: &SyncUnitId) -> bool {
        field_matches(&self.document_id, document_id)
            && field_matches(&self.document_type, document_type)
            && field_matches(&self.scope, &unit_id.scope.to_string())
            && field_matches(&self.branch, &unit_id.branch)
    }
}

fn field_matches(allowed: &[String], value: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|a| a == "*" || a == value)
}

/// A registered listener with its live transmitter.
#[derive(Clone, derive_more::Debug)]
pub struct Listener {
    pub listener_id: String,
    pub drive_id: String,
    pub label: Option<String>,
    /// Blocking listeners must acknowledge before an update round counts
    /// as done; non-blocking ones are best effort.
    pub block: bool,
    pub system: bool,
    pub filter: ListenerFilter,
    #[debug("transmitter")]
    pub transmitter: Arc<dyn Transmitter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerStatus {
    Created,
    Pending,
    Success,
    Missing,
    Conflict,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct UnitCursor {
    listener_rev: i64,
    #[allow(dead_code)]
    last_updated: DateTime<Utc>,
}

struct ListenerEntry {
    listener: Listener,
    status: ListenerStatus,
    cursors: HashMap<SyncUnitId, UnitCursor>,
}

/// Cloned view of one listener, taken so update rounds do not hold the
/// state lock across transmitter calls.
struct ListenerSnapshot {
    drive_id: String,
    listener_id: String,
    filter: ListenerFilter,
    transmitter: Arc<dyn Transmitter>,
    cursors: HashMap<SyncUnitId, i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerManagerOptions {
    /// Debounce window for non-forced update triggers.
    pub update_delay: Duration,
    /// Collect strand data unit by unit instead of concurrently.
    pub sequential_updates: bool,
    /// Bound on immediate re-runs when a listener reports it is still
    /// behind after a round.
    pub max_continues: u32,
}

impl Default for ListenerManagerOptions {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_millis(250),
            sequential_updates: true,
            max_continues: 500,
        }
    }
}

/// Called when pushing to one listener failed; other listeners are
/// unaffected.
pub type ListenerErrorHandler = Box<dyn Fn(&str, &str, &anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Scheduled,
    Running { rerun: bool },
}

pub struct ListenerManager {
    sync_manager: Arc<SynchronizationManager>,
    options: ListenerManagerOptions,
    // drive id -> listener id -> state
    state: Mutex<HashMap<String, HashMap<String, ListenerEntry>>>,
    debounce: Mutex<DebounceState>,
    on_error: std::sync::Mutex<Option<ListenerErrorHandler>>,
}

impl ListenerManager {
    pub fn new(sync_manager: Arc<SynchronizationManager>, options: ListenerManagerOptions) -> Self {
        Self {
            sync_manager,
            options,
            state: Mutex::new(HashMap::new()),
            debounce: Mutex::new(DebounceState::Idle),
            on_error: std::sync::Mutex::new(None),
        }
    }

    pub fn set_error_handler(&self, handler: ListenerErrorHandler) {
        *self.on_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub async fn drive_has_listeners(&self, drive_id: &str) -> bool {
        self.state
            .lock()
            .await
            .get(drive_id)
            .map_or(false, |m| !m.is_empty())
    }

    pub async fn listener_status(
        &self,
        drive_id: &str,
        listener_id: &str,
    ) -> Option<ListenerStatus> {
        self.state
            .lock()
            .await
            .get(drive_id)
            .and_then(|m| m.get(listener_id))
            .map(|entry| entry.status)
    }

    /// Registers (or replaces) a listener, keeping any cursors it already
    /// had, and forces an update round so it catches up immediately.
    pub async fn set_listener(self: &Arc<Self>, listener: Listener) -> anyhow::Result<()> {
        let drive_id = listener.drive_id.clone();
        let listener_id = listener.listener_id.clone();
        {
            let mut state = self.state.lock().await;
            let drive = state.entry(drive_id.clone()).or_default();
            let cursors = drive
                .remove(&listener_id)
                .map(|entry| entry.cursors)
                .unwrap_or_default();
            drive.insert(
                listener_id.clone(),
                ListenerEntry {
                    listener,
                    status: ListenerStatus::Created,
                    cursors,
                },
            );
        }
        debug!(drive_id, listener_id, "listener registered");
        self.trigger_update(true, UpdateSource::Local).await
    }

    pub async fn remove_listener(&self, drive_id: &str, listener_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state
            .get_mut(drive_id)
            .and_then(|m| m.remove(listener_id))
            .is_some()
    }

    /// Drops all listeners of a drive, disconnecting their transmitters.
    pub async fn remove_drive(&self, drive_id: &str) {
        let removed = self.state.lock().await.remove(drive_id);
        let Some(listeners) = removed else {
            return;
        };
        for (listener_id, entry) in listeners {
            if let Err(err) = entry.listener.transmitter.disconnect().await {
                warn!(drive_id, listener_id, "transmitter disconnect failed: {err:#}");
            }
        }
    }

    /// Forgets the cursors of removed units on every listener of a drive.
    pub async fn remove_sync_units(&self, drive_id: &str, units: &[SyncUnitId]) {
        let mut state = self.state.lock().await;
        let Some(listeners) = state.get_mut(drive_id) else {
            return;
        };
        for entry in listeners.values_mut() {
            for unit in units {
                entry.cursors.remove(unit);
            }
        }
    }

    /// Acknowledges that a listener processed a unit up to `revision`.
    /// Returns `false` when the listener is unknown.
    pub async fn update_listener_revision(
        &self,
        drive_id: &str,
        listener_id: &str,
        unit_id: &SyncUnitId,
        revision: i64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(drive_id).and_then(|m| m.get_mut(listener_id)) else {
            return Ok(false);
        };
        entry.cursors.insert(
            unit_id.clone(),
            UnitCursor {
                listener_rev: revision,
                last_updated: Utc::now(),
            },
        );
        trace!(drive_id, listener_id, unit = %unit_id, revision, "listener cursor advanced");
        Ok(true)
    }

    /// Strands a pull client still has to fetch, honoring the listener's
    /// cursors and the request limit across all units.
    pub async fn get_strands(
        &self,
        drive_id: &str,
        listener_id: &str,
        options: GetStrandsOptions,
    ) -> anyhow::Result<Vec<StrandUpdate>> {
        let snapshot = self
            .snapshot_listener(drive_id, listener_id)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("listener {listener_id} not found on drive {drive_id}")
            })?;
        let units = self
            .sync_manager
            .get_synchronization_units(drive_id, Some(&snapshot.filter))
            .await?;

        let mut strands = Vec::new();
        let mut remaining = options.limit;
        for unit in units {
            if remaining == Some(0) {
                break;
            }
            if unit.revision < 0 {
                continue;
            }
            let cursor = snapshot.cursors.get(&unit.id).copied();
            if cursor.map_or(false, |c| c >= unit.revision) {
                continue;
            }
            let operations = match self
                .sync_manager
                .get_operation_data(
                    &unit.id,
                    GetStrandsOptions {
                        since: options.since,
                        from_revision: options.from_revision.or(cursor),
                        limit: remaining,
                    },
                )
                .await
            {
                Ok(ops) => ops,
                Err(err) => {
                    warn!(unit = %unit.id, "failed to read operation data: {err}");
                    continue;
                }
            };
            if operations.is_empty() {
                continue;
            }
            if let Some(rem) = remaining.as_mut() {
                *rem -= operations.len().min(*rem);
            }
            strands.push(StrandUpdate {
                drive_id: drive_id.to_string(),
                document_id: unit.id.document_id.clone(),
                document_type: unit.document_type.clone(),
                scope: unit.id.scope,
                branch: unit.id.branch.clone(),
                operations: operations.iter().map(OperationUpdate::from).collect(),
            });
        }
        Ok(strands)
    }

    /// Schedules an update round. Forced triggers run right away and
    /// return when the round finished; debounced triggers return
    /// immediately and the round runs after the update delay, with calls
    /// inside the window collapsed into one round.
    pub async fn trigger_update(
        self: &Arc<Self>,
        force: bool,
        source: UpdateSource,
    ) -> anyhow::Result<()> {
        if force {
            return self.run_update(source).await;
        }
        let mut debounce = self.debounce.lock().await;
        match *debounce {
            DebounceState::Scheduled => Ok(()),
            DebounceState::Running { .. } => {
                *debounce = DebounceState::Running { rerun: true };
                Ok(())
            }
            DebounceState::Idle => {
                *debounce = DebounceState::Scheduled;
                drop(debounce);
                let this = self.clone();
                let delay = self.options.update_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = this.run_update(source).await {
                        error!("listener update failed: {err:#}");
                    }
                });
                Ok(())
            }
        }
    }

    async fn run_update(self: &Arc<Self>, source: UpdateSource) -> anyhow::Result<()> {
        {
            let mut debounce = self.debounce.lock().await;
            if let DebounceState::Running { ref mut rerun } = *debounce {
                // a round is already in flight, let it pick the work up
                *rerun = true;
                return Ok(());
            }
            *debounce = DebounceState::Running { rerun: false };
        }
        loop {
            let result = self.update_round(&source).await;
            let mut debounce = self.debounce.lock().await;
            if result.is_ok() && *debounce == (DebounceState::Running { rerun: true }) {
                *debounce = DebounceState::Running { rerun: false };
                continue;
            }
            *debounce = DebounceState::Idle;
            return result;
        }
    }

    /// One full round over all listeners, re-running while any listener
    /// reports it is still behind, up to the continuation bound.
    async fn update_round(&self, source: &UpdateSource) -> anyhow::Result<()> {
        let mut continues = self.options.max_continues;
        loop {
            if !self.update_listeners(source).await? {
                return Ok(());
            }
            if continues == 0 {
                anyhow::bail!("maximum update continuations exhausted");
            }
            continues -= 1;
            trace!(remaining = continues, "continuing listener update round");
        }
    }

    async fn update_listeners(&self, source: &UpdateSource) -> anyhow::Result<bool> {
        let snapshots = self.snapshot_all().await;
        let mut continuation = false;
        for snapshot in snapshots {
            if !snapshot.transmitter.is_push() {
                continue;
            }
            match self.update_listener(&snapshot, source).await {
                Ok(needs_more) => continuation |= needs_more,
                Err(err) => {
                    error!(
                        drive_id = %snapshot.drive_id,
                        listener_id = %snapshot.listener_id,
                        "listener update failed: {err:#}"
                    );
                    self.set_status(&snapshot, ListenerStatus::Error).await;
                    if let Some(handler) =
                        self.on_error.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
                    {
                        handler(&snapshot.drive_id, &snapshot.listener_id, &err);
                    }
                }
            }
        }
        Ok(continuation)
    }

    async fn update_listener(
        &self,
        snapshot: &ListenerSnapshot,
        source: &UpdateSource,
    ) -> anyhow::Result<bool> {
        let units = self
            .sync_manager
            .get_synchronization_units(&snapshot.drive_id, Some(&snapshot.filter))
            .await?;
        let strands = self.collect_strands(snapshot, &units).await;
        if strands.is_empty() {
            return Ok(false);
        }

        self.set_status(snapshot, ListenerStatus::Pending).await;
        let revisions = snapshot
            .transmitter
            .transmit(strands.clone(), source.clone())
            .await?;

        let mut continuation = false;
        for revision in &revisions {
            let unit_id = revision.unit_id();
            if !units.iter().any(|unit| unit.id == unit_id) {
                warn!(
                    listener_id = %snapshot.listener_id,
                    unit = %unit_id,
                    "acknowledgement for untracked unit"
                );
                continue;
            }
            self.update_listener_revision(
                &snapshot.drive_id,
                &snapshot.listener_id,
                &unit_id,
                revision.revision,
            )
            .await?;
            // acknowledged short of what was sent, the listener is behind
            let sent = strands
                .iter()
                .find(|strand| strand.unit_id() == unit_id)
                .and_then(|strand| strand.operations.last());
            if let Some(last) = sent {
                if last.index as i64 != revision.revision {
                    continuation = true;
                }
            }
        }

        for revision in &revisions {
            let missing_ops = revision
                .error
                .as_deref()
                .map_or(false, |e| e.contains("Missing operations"));
            if missing_ops {
                continuation = true;
            } else if revision.status == UpdateStatus::Error {
                anyhow::bail!(
                    "listener rejected update for {}: {}",
                    revision.unit_id(),
                    revision.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        self.set_status(snapshot, ListenerStatus::Success).await;
        Ok(continuation)
    }

    async fn collect_strands(
        &self,
        snapshot: &ListenerSnapshot,
        units: &[SyncUnit],
    ) -> Vec<StrandUpdate> {
        if self.options.sequential_updates {
            let mut strands = Vec::new();
            for unit in units {
                let cursor = snapshot.cursors.get(&unit.id).copied();
                if let Some(strand) = build_strand(
                    self.sync_manager.clone(),
                    snapshot.drive_id.clone(),
                    unit.clone(),
                    cursor,
                )
                .await
                {
                    strands.push(strand);
                }
            }
            strands
        } else {
            let mut tasks = tokio::task::JoinSet::new();
            for (position, unit) in units.iter().enumerate() {
                let sync_manager = self.sync_manager.clone();
                let drive_id = snapshot.drive_id.clone();
                let cursor = snapshot.cursors.get(&unit.id).copied();
                let unit = unit.clone();
                tasks.spawn(async move {
                    (position, build_strand(sync_manager, drive_id, unit, cursor).await)
                });
            }
            let mut collected = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                if let Ok((position, Some(strand))) = joined {
                    collected.push((position, strand));
                }
            }
            collected.sort_by_key(|(position, _)| *position);
            collected.into_iter().map(|(_, strand)| strand).collect()
        }
    }

    async fn snapshot_all(&self) -> Vec<ListenerSnapshot> {
        let state = self.state.lock().await;
        let mut snapshots = Vec::new();
        for (drive_id, listeners) in state.iter() {
            for (listener_id, entry) in listeners.iter() {
                snapshots.push(ListenerSnapshot {
                    drive_id: drive_id.clone(),
                    listener_id: listener_id.clone(),
                    filter: entry.listener.filter.clone(),
                    transmitter: entry.listener.transmitter.clone(),
                    cursors: entry
                        .cursors
                        .iter()
                        .map(|(unit, cursor)| (unit.clone(), cursor.listener_rev))
                        .collect(),
                });
            }
        }
        snapshots
    }

    async fn snapshot_listener(
        &self,
        drive_id: &str,
        listener_id: &str,
    ) -> Option<ListenerSnapshot> {
        let state = self.state.lock().await;
        let entry = state.get(drive_id)?.get(listener_id)?;
        Some(ListenerSnapshot {
            drive_id: drive_id.to_string(),
            listener_id: listener_id.to_string(),
            filter: entry.listener.filter.clone(),
            transmitter: entry.listener.transmitter.clone(),
            cursors: entry
                .cursors
                .iter()
                .map(|(unit, cursor)| (unit.clone(), cursor.listener_rev))
                .collect(),
        })
    }

    async fn set_status(&self, snapshot: &ListenerSnapshot, status: ListenerStatus) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .get_mut(&snapshot.drive_id)
            .and_then(|m| m.get_mut(&snapshot.listener_id))
        {
            entry.status = status;
        }
    }
}

/// Fetches the not-yet-acknowledged operations of one unit. `None` when
/// the listener is up to date. An empty-log unit (revision `-1`) still
/// yields a strand so the listener learns the unit exists.
async fn build_strand(
    sync_manager: Arc<SynchronizationManager>,
    drive_id: String,
    unit: SyncUnit,
    cursor: Option<i64>,
) -> Option<StrandUpdate> {
    if cursor.map_or(false, |c| c >= unit.revision) {
        return None;
    }
    let mut operations = Vec::new();
    if unit.revision >= 0 {
        match sync_manager
            .get_operation_data(
                &unit.id,
                GetStrandsOptions {
                    from_revision: cursor,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(ops) => operations = ops.iter().map(OperationUpdate::from).collect(),
            Err(err) => warn!(unit = %unit.id, "failed to read operation data: {err}"),
        }
        if operations.is_empty() {
            return None;
        }
    }
    Some(StrandUpdate {
        drive_id,
        document_id: unit.id.document_id.clone(),
        document_type: unit.document_type.clone(),
        scope: unit.id.scope,
        branch: unit.id.branch.clone(),
        operations,
    })
}

impl std::fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, DocumentState, Operation, Scope};
    use crate::drive::{actions, AddFileInput, DriveModel, SyncUnitRef};
    use crate::replay::{
        apply_action, create_document, ApplyOptions, DocumentModel, ModelRegistry, SignalQueue,
    };
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;
    use crate::transmitter::ListenerRevision;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingTransmitter {
        calls: StdMutex<Vec<Vec<StrandUpdate>>>,
        /// Error text attached to revisions of the nth transmit call.
        fail_call_with: Option<(usize, String)>,
    }

    impl RecordingTransmitter {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_call_with: None,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transmitter for RecordingTransmitter {
        async fn transmit(
            &self,
            strands: Vec<StrandUpdate>,
            _source: UpdateSource,
        ) -> anyhow::Result<Vec<ListenerRevision>> {
            let mut calls = self.calls.lock().unwrap();
            let call_index = calls.len();
            calls.push(strands.clone());
            drop(calls);

            let error = self
                .fail_call_with
                .as_ref()
                .filter(|(n, _)| *n == call_index)
                .map(|(_, msg)| msg.clone());
            Ok(strands
                .iter()
                .map(|strand| ListenerRevision {
                    drive_id: strand.drive_id.clone(),
                    document_id: strand.document_id.clone(),
                    scope: strand.scope,
                    branch: strand.branch.clone(),
                    status: if error.is_some() {
                        UpdateStatus::Missing
                    } else {
                        UpdateStatus::Success
                    },
                    revision: if error.is_some() {
                        -1
                    } else {
                        strand.operations.last().map(|op| op.index as i64).unwrap_or(-1)
                    },
                    error: error.clone(),
                })
                .collect())
        }
    }

    struct FailingTransmitter {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transmitter for FailingTransmitter {
        async fn transmit(
            &self,
            _strands: Vec<StrandUpdate>,
            _source: UpdateSource,
        ) -> anyhow::Result<Vec<ListenerRevision>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("endpoint unreachable")
        }
    }

    async fn setup() -> (Arc<MemoryStorage>, Arc<ListenerManager>) {
        let storage = Arc::new(MemoryStorage::new());
        let models = Arc::new(ModelRegistry::new([
            Arc::new(DriveModel) as Arc<dyn DocumentModel>
        ]));
        let sync_manager = Arc::new(SynchronizationManager::new(storage.clone(), models));
        let manager = Arc::new(ListenerManager::new(
            sync_manager,
            ListenerManagerOptions::default(),
        ));

        // a drive with one file node plus the child document with two ops
        let mut drive = create_document(&DriveModel);
        let mut signals = SignalQueue::default();
        apply_action(
            &mut drive,
            &DriveModel,
            actions::add_file(AddFileInput {
                id: "child".to_string(),
                name: "child".to_string(),
                document_type: "test/doc".to_string(),
                parent_folder: None,
                synchronization_units: vec![SyncUnitRef::main(Scope::Global)],
            }),
            &mut signals,
            0,
            &ApplyOptions::default(),
        )
        .unwrap();
        storage.create_document("drive", drive).await.unwrap();

        let mut child = Document::new("test/doc", DocumentState::default());
        for i in 0..2u64 {
            child.operations.global.push(Operation {
                index: i,
                skip: 0,
                action_type: "SET".to_string(),
                scope: Scope::Global,
                input: json!(i),
                hash: format!("h{i}"),
                timestamp: Utc::now(),
                id: None,
                resulting_state: None,
                error: None,
            });
        }
        storage.create_document("child", child).await.unwrap();

        (storage, manager)
    }

    fn listener(id: &str, transmitter: Arc<dyn Transmitter>, filter: ListenerFilter) -> Listener {
        Listener {
            listener_id: id.to_string(),
            drive_id: "drive".to_string(),
            label: None,
            block: false,
            system: false,
            filter,
            transmitter,
        }
    }

    #[test]
    fn filter_matching() {
        let unit = SyncUnitId::new("doc-1", Scope::Global);
        let all = ListenerFilter::default();
        assert!(all.matches("doc-1", "test/doc", &unit));

        let wildcard = ListenerFilter {
            document_id: vec!["*".to_string()],
            ..Default::default()
        };
        assert!(wildcard.matches("doc-1", "test/doc", &unit));

        let narrowed = ListenerFilter {
            document_type: vec!["other/type".to_string()],
            ..Default::default()
        };
        assert!(!narrowed.matches("doc-1", "test/doc", &unit));

        let local_only = ListenerFilter {
            scope: vec!["local".to_string()],
            ..Default::default()
        };
        assert!(!local_only.matches("doc-1", "test/doc", &unit));
    }

    #[tokio::test]
    async fn push_round_delivers_and_advances_cursor() {
        let (_, manager) = setup().await;
        let transmitter = Arc::new(RecordingTransmitter::new());
        manager
            .set_listener(listener("l1", transmitter.clone(), ListenerFilter::default()))
            .await
            .unwrap();

        assert_eq!(transmitter.call_count(), 1);
        let calls = transmitter.calls.lock().unwrap();
        let strands = &calls[0];
        assert_eq!(strands.len(), 2);
        assert_eq!(strands[0].document_id, "drive");
        assert_eq!(strands[0].operations.len(), 1); // the ADD_FILE operation
        assert_eq!(strands[1].document_id, "child");
        assert_eq!(strands[1].operations.len(), 2);
        drop(calls);

        assert_eq!(
            manager.listener_status("drive", "l1").await,
            Some(ListenerStatus::Success)
        );

        // everything acknowledged, the next round transmits nothing
        manager
            .trigger_update(true, UpdateSource::Local)
            .await
            .unwrap();
        assert_eq!(transmitter.call_count(), 1);
    }

    #[tokio::test]
    async fn filter_narrows_pushed_units() {
        let (_, manager) = setup().await;
        let transmitter = Arc::new(RecordingTransmitter::new());
        let filter = ListenerFilter {
            document_type: vec!["test/doc".to_string()],
            ..Default::default()
        };
        manager
            .set_listener(listener("l1", transmitter.clone(), filter))
            .await
            .unwrap();

        let calls = transmitter.calls.lock().unwrap();
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].document_id, "child");
    }

    #[tokio::test]
    async fn missing_operations_ack_continues_the_round() {
        let (_, manager) = setup().await;
        let transmitter = Arc::new(RecordingTransmitter {
            calls: StdMutex::new(Vec::new()),
            fail_call_with: Some((0, "Missing operations: revision 3 expected".to_string())),
        });
        manager
            .set_listener(listener("l1", transmitter.clone(), ListenerFilter::default()))
            .await
            .unwrap();

        // first call acknowledged -1 with a missing-operations error, the
        // round re-ran immediately and the second call succeeded
        assert_eq!(transmitter.call_count(), 2);
        assert_eq!(
            manager.listener_status("drive", "l1").await,
            Some(ListenerStatus::Success)
        );

        manager
            .trigger_update(true, UpdateSource::Local)
            .await
            .unwrap();
        assert_eq!(transmitter.call_count(), 2);
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let (_, manager) = setup().await;
        let failing = Arc::new(FailingTransmitter {
            attempts: AtomicUsize::new(0),
        });
        let healthy = Arc::new(RecordingTransmitter::new());

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_seen = errors.clone();
        manager.set_error_handler(Box::new(move |_, _, _| {
            errors_seen.fetch_add(1, Ordering::SeqCst);
        }));

        manager
            .set_listener(listener("bad", failing.clone(), ListenerFilter::default()))
            .await
            .unwrap();
        manager
            .set_listener(listener("good", healthy.clone(), ListenerFilter::default()))
            .await
            .unwrap();

        assert!(healthy.call_count() >= 1);
        assert!(errors.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            manager.listener_status("drive", "bad").await,
            Some(ListenerStatus::Error)
        );
        assert_eq!(
            manager.listener_status("drive", "good").await,
            Some(ListenerStatus::Success)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_triggers_collapse_into_one_round() {
        let (_, manager) = setup().await;
        let transmitter = Arc::new(RecordingTransmitter::new());
        {
            // register without the forced round by inserting directly
            let mut state = manager.state.lock().await;
            state.entry("drive".to_string()).or_default().insert(
                "l1".to_string(),
                ListenerEntry {
                    listener: listener("l1", transmitter.clone(), ListenerFilter::default()),
                    status: ListenerStatus::Created,
                    cursors: HashMap::new(),
                },
            );
        }

        for _ in 0..3 {
            manager
                .trigger_update(false, UpdateSource::Local)
                .await
                .unwrap();
        }
        while transmitter.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transmitter.call_count(), 1);
    }

    #[tokio::test]
    async fn pull_strands_respect_acknowledged_cursor() {
        let (_, manager) = setup().await;
        // pull responders are not pushed to
        let transmitter = Arc::new(RecordingTransmitter::new());
        manager
            .set_listener(listener("pull", transmitter, ListenerFilter::default()))
            .await
            .unwrap();

        let child_unit = SyncUnitId::new("child", Scope::Global);
        manager
            .update_listener_revision("drive", "pull", &child_unit, 0)
            .await
            .unwrap();

        let strands = manager
            .get_strands("drive", "pull", GetStrandsOptions::default())
            .await
            .unwrap();
        // drive already acknowledged by the forced round, child is behind
        let child_strand = strands
            .iter()
            .find(|s| s.document_id == "child")
            .expect("child strand");
        let indexes: Vec<u64> = child_strand.operations.iter().map(|op| op.index).collect();
        assert_eq!(indexes, vec![1]);

        manager
            .update_listener_revision("drive", "pull", &child_unit, 1)
            .await
            .unwrap();
        let strands = manager
            .get_strands("drive", "pull", GetStrandsOptions::default())
            .await
            .unwrap();
        assert!(strands.iter().all(|s| s.document_id != "child"));
    }
}
