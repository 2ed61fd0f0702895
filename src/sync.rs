//! Synchronization manager: per-unit sync state and delta reads.
//!
//! A synchronization unit is one (document, scope, branch) triple of a
//! drive. The manager derives the unit list from drive state, serves
//! operation deltas for units, and tracks a `{push, pull}` status pair per
//! unit, collapsing the pair into one user-facing status with a fixed
//! severity order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::document::{Document, Operation, Scope, DRIVE_DOCUMENT_TYPE, MAIN_BRANCH};
use crate::drive::drive_state;
use crate::listener::ListenerFilter;
use crate::replay::{replay_document, ApplyOptions, ModelRegistry, ReplayError};
use crate::storage::{Storage, StorageError};

/// Sync state of one direction of one unit.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// First synchronization after registration has not completed yet.
    InitialSync,
    Syncing,
    Success,
    Conflict,
    Missing,
    Error,
}

impl SyncStatus {
    /// Lower rank wins when collapsing a status pair.
    fn severity(self) -> u8 {
        match self {
            SyncStatus::Error => 0,
            SyncStatus::Missing => 1,
            SyncStatus::Conflict => 2,
            SyncStatus::Syncing => 3,
            SyncStatus::Success => 4,
            SyncStatus::InitialSync => 5,
        }
    }
}

/// Identity of a synchronization unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncUnitId {
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
}

impl SyncUnitId {
    pub fn new(document_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            document_id: document_id.into(),
            scope,
            branch: MAIN_BRANCH.to_string(),
        }
    }
}

impl std::fmt::Display for SyncUnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

/// A unit together with its current revision.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncUnit {
    pub id: SyncUnitId,
    pub document_type: String,
    /// Index of the last operation, `-1` when the log is empty.
    pub revision: i64,
    pub last_updated: DateTime<Utc>,
}

/// Per-direction status pair of a unit. A direction is `None` until that
/// side of the sync is configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUnitStatus {
    pub push: Option<SyncStatus>,
    pub pull: Option<SyncStatus>,
}

/// Partial status update; `None` leaves the direction untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatusUpdate {
    pub push: Option<SyncStatus>,
    pub pull: Option<SyncStatus>,
}

impl SyncStatusUpdate {
    pub fn push(status: SyncStatus) -> Self {
        Self {
            push: Some(status),
            pull: None,
        }
    }

    pub fn pull(status: SyncStatus) -> Self {
        Self {
            push: None,
            pull: Some(status),
        }
    }
}

/// Emitted whenever the combined status of a unit changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusEvent {
    pub unit_id: SyncUnitId,
    pub status: SyncStatus,
    pub error: Option<String>,
    pub detail: SyncUnitStatus,
}

/// Filter for operation delta reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetStrandsOptions {
    pub since: Option<DateTime<Utc>>,
    /// Only operations with a strictly greater index are returned.
    pub from_revision: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync status not found for unit {0}")]
    UnitNotFound(SyncUnitId),
    #[error("document {0} is not a drive")]
    NotADrive(String),
    #[error("invalid drive state: {0}")]
    InvalidDriveState(String),
    #[error(transparent)]
    UnsupportedType(#[from] crate::replay::UnsupportedDocumentType),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

pub struct SynchronizationManager {
    storage: Arc<dyn Storage>,
    models: Arc<ModelRegistry>,
    status: Mutex<HashMap<SyncUnitId, SyncUnitStatus>>,
    subscribers: Mutex<Vec<flume::Sender<SyncStatusEvent>>>,
}

impl SynchronizationManager {
    pub fn new(storage: Arc<dyn Storage>, models: Arc<ModelRegistry>) -> Self {
        Self {
            storage,
            models,
            status: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Events for every combined-status change, across all units.
    pub async fn subscribe(&self) -> flume::Receiver<SyncStatusEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Rebuilds a document from storage, verifying hashes and reusing the
    /// cached resulting state where present.
    pub async fn build_document(&self, document_id: &str) -> Result<Document, SyncError> {
        let stored = self.storage.get_document(document_id).await?;
        let model = self.models.get(&stored.document_type)?.clone();
        let options = ApplyOptions {
            check_hashes: true,
            reuse_resulting_state: true,
        };
        let mut document =
            replay_document(stored.initial_state.clone(), &stored.operations, &*model, &options)?;
        document.name = stored.name;
        document.created = stored.created;
        Ok(document)
    }

    /// The units a drive exposes: one for the drive document itself plus
    /// one per synchronization unit of every file node, optionally
    /// narrowed by a listener filter.
    pub async fn get_synchronization_units(
        &self,
        drive_id: &str,
        filter: Option<&ListenerFilter>,
    ) -> Result<Vec<SyncUnit>, SyncError> {
        let drive = self.storage.get_document(drive_id).await?;
        if drive.document_type != DRIVE_DOCUMENT_TYPE {
            return Err(SyncError::NotADrive(drive_id.to_string()));
        }
        let state = drive_state(&drive.state.global).map_err(SyncError::InvalidDriveState)?;

        let mut queries: Vec<(SyncUnitId, String)> = Vec::new();
        let drive_unit = SyncUnitId::new(drive_id, Scope::Global);
        if filter.map_or(true, |f| {
            f.matches(&drive_unit.document_id, DRIVE_DOCUMENT_TYPE, &drive_unit)
        }) {
            queries.push((drive_unit, DRIVE_DOCUMENT_TYPE.to_string()));
        }
        for file in state.file_nodes() {
            for unit_ref in &file.synchronization_units {
                let unit_id = SyncUnitId {
                    document_id: file.id.clone(),
                    scope: unit_ref.scope,
                    branch: unit_ref.branch.clone(),
                };
                let keep = filter.map_or(true, |f| {
                    f.matches(&file.id, &file.document_type, &unit_id)
                });
                if keep {
                    queries.push((unit_id, file.document_type.clone()));
                }
            }
        }

        let mut units = Vec::with_capacity(queries.len());
        for (id, document_type) in queries {
            match self.storage.get_document(&id.document_id).await {
                Ok(doc) => {
                    let last = doc.operations.get(id.scope).last();
                    units.push(SyncUnit {
                        revision: doc.revision(id.scope),
                        last_updated: last.map(|op| op.timestamp).unwrap_or(doc.created),
                        id,
                        document_type,
                    });
                }
                Err(StorageError::NotFound(_)) => {
                    // node exists in drive state but the child document is
                    // not materialized yet
                    units.push(SyncUnit {
                        revision: -1,
                        last_updated: drive.created,
                        id,
                        document_type,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        trace!(drive_id, units = units.len(), "resolved synchronization units");
        Ok(units)
    }

    /// Operations of one unit, filtered and with the state cache stripped.
    pub async fn get_operation_data(
        &self,
        unit_id: &SyncUnitId,
        options: GetStrandsOptions,
    ) -> Result<Vec<Operation>, SyncError> {
        let document = self.storage.get_document(&unit_id.document_id).await?;
        let mut operations: Vec<Operation> = document
            .operations
            .get(unit_id.scope)
            .iter()
            .filter(|op| {
                options
                    .since
                    .map_or(true, |since| op.timestamp > since)
                    && options
                        .from_revision
                        .map_or(true, |rev| op.index as i64 > rev)
            })
            .cloned()
            .collect();
        if let Some(limit) = options.limit {
            operations.truncate(limit);
        }
        for op in &mut operations {
            op.resulting_state = None;
        }
        Ok(operations)
    }

    /// Collapses a status pair into one user-facing status.
    pub fn combined_status(status: SyncUnitStatus) -> SyncStatus {
        match (status.push, status.pull) {
            (None, None) => SyncStatus::InitialSync,
            (_, Some(SyncStatus::InitialSync)) => SyncStatus::InitialSync,
            (Some(SyncStatus::InitialSync), pull) => pull.unwrap_or(SyncStatus::InitialSync),
            (push, pull) => [push, pull]
                .into_iter()
                .flatten()
                .min_by_key(|s| s.severity())
                .unwrap_or(SyncStatus::InitialSync),
        }
    }

    pub async fn get_sync_status(&self, unit_id: &SyncUnitId) -> Result<SyncStatus, SyncError> {
        self.status
            .lock()
            .await
            .get(unit_id)
            .map(|s| Self::combined_status(*s))
            .ok_or_else(|| SyncError::UnitNotFound(unit_id.clone()))
    }

    pub async fn get_sync_status_detail(&self, unit_id: &SyncUnitId) -> Option<SyncUnitStatus> {
        self.status.lock().await.get(unit_id).copied()
    }

    /// Applies a partial status update, emitting an event only when the
    /// combined status changed. While a direction is still in its initial
    /// sync, `SYNCING` does not displace `INITIAL_SYNC`.
    pub async fn update_sync_status(
        &self,
        unit_id: &SyncUnitId,
        update: SyncStatusUpdate,
        error: Option<String>,
    ) {
        let mut map = self.status.lock().await;
        let Some(current) = map.get(unit_id).copied() else {
            drop(map);
            self.init_sync_status(unit_id, update).await;
            return;
        };

        let mut next = current;
        if let Some(push) = update.push {
            next.push = Some(sticky_initial(current.push, push));
        }
        if let Some(pull) = update.pull {
            next.pull = Some(sticky_initial(current.pull, pull));
        }

        if next == current {
            return;
        }
        map.insert(unit_id.clone(), next);
        drop(map);

        let previous_combined = Self::combined_status(current);
        let combined = Self::combined_status(next);
        if previous_combined != combined {
            debug!(unit = %unit_id, status = %combined, "sync status changed");
            self.emit(SyncStatusEvent {
                unit_id: unit_id.clone(),
                status: combined,
                error,
                detail: next,
            })
            .await;
        }
    }

    /// First status for a unit. An incoming `SYNCING` is recorded as
    /// `INITIAL_SYNC` so the very first round is distinguishable.
    pub async fn init_sync_status(&self, unit_id: &SyncUnitId, update: SyncStatusUpdate) {
        let status = SyncUnitStatus {
            push: update.push.map(initial_of),
            pull: update.pull.map(initial_of),
        };
        self.status.lock().await.insert(unit_id.clone(), status);
        self.emit(SyncStatusEvent {
            unit_id: unit_id.clone(),
            status: Self::combined_status(status),
            error: None,
            detail: status,
        })
        .await;
    }

    /// Drops the status entry of one unit.
    pub async fn remove_sync_status(&self, unit_id: &SyncUnitId) {
        self.status.lock().await.remove(unit_id);
    }

    /// Drops the status entries of all units of a document.
    pub async fn remove_document(&self, document_id: &str) {
        self.status
            .lock()
            .await
            .retain(|unit, _| unit.document_id != document_id);
    }

    /// Seeds sync status for a drive and all its units, based on whether
    /// the drive has pull triggers and/or push listeners configured.
    pub async fn initialize_drive_sync_status(
        &self,
        drive_id: &str,
        drive: &Document,
    ) -> Result<(), SyncError> {
        let local = crate::drive::drive_local_state(&drive.state.local)
            .map_err(SyncError::InvalidDriveState)?;
        let update = SyncStatusUpdate {
            pull: (!local.triggers.is_empty()).then_some(SyncStatus::InitialSync),
            push: (!local.listeners.is_empty()).then_some(SyncStatus::Success),
        };
        if update.pull.is_none() && update.push.is_none() {
            return Ok(());
        }

        let units = self.get_synchronization_units(drive_id, None).await?;
        for unit in units {
            self.init_sync_status(&unit.id, update).await;
        }
        Ok(())
    }

    async fn emit(&self, event: SyncStatusEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!(unit = %event.unit_id, "no sync status subscribers");
        }
    }
}

fn sticky_initial(current: Option<SyncStatus>, incoming: SyncStatus) -> SyncStatus {
    if current == Some(SyncStatus::InitialSync) && incoming == SyncStatus::Syncing {
        SyncStatus::InitialSync
    } else {
        incoming
    }
}

fn initial_of(status: SyncStatus) -> SyncStatus {
    if status == SyncStatus::Syncing {
        SyncStatus::InitialSync
    } else {
        status
    }
}

impl std::fmt::Debug for SynchronizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizationManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentState;
    use crate::drive::{actions, AddFileInput, DriveModel, SyncUnitRef};
    use crate::replay::{apply_action, create_document, DocumentModel, SignalQueue};
    use crate::storage::memory::MemoryStorage;
    use serde_json::{json, Value};

    fn manager() -> (Arc<MemoryStorage>, SynchronizationManager) {
        let storage = Arc::new(MemoryStorage::new());
        let models = Arc::new(ModelRegistry::new([Arc::new(DriveModel)
            as Arc<dyn DocumentModel>]));
        let manager = SynchronizationManager::new(storage.clone(), models);
        (storage, manager)
    }

    fn unit(document_id: &str) -> SyncUnitId {
        SyncUnitId::new(document_id, Scope::Global)
    }

    #[test]
    fn combined_status_severity_order() {
        let cases = [
            (Some(SyncStatus::Error), Some(SyncStatus::Success), SyncStatus::Error),
            (Some(SyncStatus::Missing), Some(SyncStatus::Conflict), SyncStatus::Missing),
            (Some(SyncStatus::Success), Some(SyncStatus::Syncing), SyncStatus::Syncing),
            (Some(SyncStatus::Success), Some(SyncStatus::Success), SyncStatus::Success),
            (None, None, SyncStatus::InitialSync),
            (Some(SyncStatus::Error), Some(SyncStatus::InitialSync), SyncStatus::InitialSync),
            (Some(SyncStatus::InitialSync), Some(SyncStatus::Conflict), SyncStatus::Conflict),
            (Some(SyncStatus::InitialSync), None, SyncStatus::InitialSync),
        ];
        for (push, pull, expected) in cases {
            assert_eq!(
                SynchronizationManager::combined_status(SyncUnitStatus { push, pull }),
                expected,
                "push {push:?} pull {pull:?}"
            );
        }
    }

    #[tokio::test]
    async fn initial_sync_is_sticky_until_first_resolution() {
        let (_, manager) = manager();
        let events = manager.subscribe().await;
        let id = unit("doc");

        manager
            .update_sync_status(&id, SyncStatusUpdate::pull(SyncStatus::Syncing), None)
            .await;
        assert_eq!(
            manager.get_sync_status(&id).await.unwrap(),
            SyncStatus::InitialSync
        );
        assert_eq!(events.recv().unwrap().status, SyncStatus::InitialSync);

        // further SYNCING reports do not flap the status
        manager
            .update_sync_status(&id, SyncStatusUpdate::pull(SyncStatus::Syncing), None)
            .await;
        assert!(events.is_empty());

        manager
            .update_sync_status(&id, SyncStatusUpdate::pull(SyncStatus::Success), None)
            .await;
        assert_eq!(events.recv().unwrap().status, SyncStatus::Success);

        // now a regular round reports SYNCING normally
        manager
            .update_sync_status(&id, SyncStatusUpdate::pull(SyncStatus::Syncing), None)
            .await;
        assert_eq!(events.recv().unwrap().status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn events_only_on_combined_change() {
        let (_, manager) = manager();
        let id = unit("doc");
        manager
            .init_sync_status(
                &id,
                SyncStatusUpdate {
                    push: Some(SyncStatus::Success),
                    pull: Some(SyncStatus::Success),
                },
            )
            .await;
        let events = manager.subscribe().await;

        // pull degrades to ERROR, combined changes
        manager
            .update_sync_status(
                &id,
                SyncStatusUpdate::pull(SyncStatus::Error),
                Some("boom".to_string()),
            )
            .await;
        let event = events.recv().unwrap();
        assert_eq!(event.status, SyncStatus::Error);
        assert_eq!(event.error.as_deref(), Some("boom"));

        // push degrades too, combined already ERROR, no event
        manager
            .update_sync_status(&id, SyncStatusUpdate::push(SyncStatus::Conflict), None)
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn status_removed_on_document_removal() {
        let (_, manager) = manager();
        let id = unit("doc");
        manager
            .init_sync_status(&id, SyncStatusUpdate::push(SyncStatus::Success))
            .await;
        manager.remove_document("doc").await;
        assert!(matches!(
            manager.get_sync_status(&id).await,
            Err(SyncError::UnitNotFound(_))
        ));
    }

    #[tokio::test]
    async fn derives_units_from_drive_state() {
        let (storage, manager) = manager();

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
                synchronization_units: vec![
                    SyncUnitRef::main(Scope::Global),
                    SyncUnitRef::main(Scope::Local),
                ],
            }),
            &mut signals,
            0,
            &crate::replay::ApplyOptions::default(),
        )
        .unwrap();
        storage.create_document("drive", drive).await.unwrap();

        let mut child = Document::new("test/doc", DocumentState::default());
        child.operations.global.push(Operation {
            index: 0,
            skip: 0,
            action_type: "SET".to_string(),
            scope: Scope::Global,
            input: json!(1),
            hash: crate::document::hash_scope_state(&Value::Null),
            timestamp: Utc::now(),
            id: None,
            resulting_state: None,
            error: None,
        });
        storage.create_document("child", child).await.unwrap();

        let units = manager.get_synchronization_units("drive", None).await.unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].id, unit("drive"));
        assert_eq!(units[0].revision, 0); // the ADD_FILE operation
        assert_eq!(units[1].id, unit("child"));
        assert_eq!(units[1].revision, 0);
        assert_eq!(units[2].id.scope, Scope::Local);
        assert_eq!(units[2].revision, -1);
    }

    #[tokio::test]
    async fn operation_data_respects_from_revision_and_limit() {
        let (storage, manager) = manager();
        let mut doc = Document::new("test/doc", DocumentState::default());
        for i in 0..10u64 {
            doc.operations.global.push(Operation {
                index: i,
                skip: 0,
                action_type: "SET".to_string(),
                scope: Scope::Global,
                input: json!(i),
                hash: format!("h{i}"),
                timestamp: Utc::now(),
                id: None,
                resulting_state: Some("{}".to_string()),
                error: None,
            });
        }
        storage.create_document("doc", doc).await.unwrap();

        let ops = manager
            .get_operation_data(
                &unit("doc"),
                GetStrandsOptions {
                    from_revision: Some(5),
                    limit: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let indexes: Vec<u64> = ops.iter().map(|op| op.index).collect();
        assert_eq!(indexes, vec![6, 7, 8]);
        assert!(ops.iter().all(|op| op.resulting_state.is_none()));
    }
}
