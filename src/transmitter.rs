//! Transmitter roles and the pull loop.
//!
//! Push listeners deliver strands through a [`Transmitter`]. Pull clients
//! run a [`PullLoop`] against a [`StrandTransport`], feed received strands
//! into a [`StrandSink`] (the engine) and acknowledge the processed
//! revisions back to the remote.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::document::{Operation, Scope};
use crate::engine::OperationResult;
use crate::listener::{ListenerFilter, ListenerManager};
use crate::sync::{GetStrandsOptions, SyncStatus, SyncUnitId};

/// Revisions acknowledged per call, to bound request sizes.
pub const MAX_REVISIONS_PER_ACK: usize = 100;

/// Wire form of an operation: everything a replica needs to re-apply it,
/// without local caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    pub index: u64,
    pub skip: u64,
    #[serde(rename = "type")]
    pub action_type: String,
    pub input: Value,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Operation> for OperationUpdate {
    fn from(op: &Operation) -> Self {
        Self {
            index: op.index,
            skip: op.skip,
            action_type: op.action_type.clone(),
            input: op.input.clone(),
            hash: op.hash.clone(),
            timestamp: op.timestamp,
            id: op.id.clone(),
            error: op.error.clone(),
        }
    }
}

impl OperationUpdate {
    pub fn into_operation(self, scope: Scope) -> Operation {
        Operation {
            index: self.index,
            skip: self.skip,
            action_type: self.action_type,
            scope,
            input: self.input,
            hash: self.hash,
            timestamp: self.timestamp,
            id: self.id,
            resulting_state: None,
            error: self.error,
        }
    }
}

/// A batch of operations of one synchronization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandUpdate {
    pub drive_id: String,
    pub document_id: String,
    pub document_type: String,
    pub scope: Scope,
    pub branch: String,
    pub operations: Vec<OperationUpdate>,
}

impl StrandUpdate {
    pub fn unit_id(&self) -> SyncUnitId {
        SyncUnitId {
            document_id: self.document_id.clone(),
            scope: self.scope,
            branch: self.branch.clone(),
        }
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations
            .iter()
            .map(|op| op.clone().into_operation(self.scope))
            .collect()
    }
}

/// Outcome of applying one strand, as reported back to the sender.
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
pub enum UpdateStatus {
    Success,
    Conflict,
    Missing,
    Error,
}

impl UpdateStatus {
    pub fn to_sync_status(self) -> SyncStatus {
        match self {
            UpdateStatus::Success => SyncStatus::Success,
            UpdateStatus::Conflict => SyncStatus::Conflict,
            UpdateStatus::Missing => SyncStatus::Missing,
            UpdateStatus::Error => SyncStatus::Error,
        }
    }
}

/// Acknowledgement for one unit up to `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerRevision {
    pub drive_id: String,
    pub document_id: String,
    pub scope: Scope,
    pub branch: String,
    pub status: UpdateStatus,
    /// Index of the last processed operation, `-1` for an empty strand.
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ListenerRevision {
    pub fn unit_id(&self) -> SyncUnitId {
        SyncUnitId {
            document_id: self.document_id.clone(),
            scope: self.scope,
            branch: self.branch.clone(),
        }
    }
}

/// Where a strand came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    /// Applied by this node's own API.
    Local,
    /// Received through a pull trigger.
    Trigger { trigger_id: String },
}

/// Push side of a listener: delivers strands to wherever the listener
/// points (a remote replica, a local subscriber, an internal processor).
#[async_trait]
pub trait Transmitter: Send + Sync + 'static {
    /// Pull-style transmitters return `false` and are skipped by the push
    /// rounds; the remote fetches strands itself.
    fn is_push(&self) -> bool {
        true
    }

    async fn transmit(
        &self,
        strands: Vec<StrandUpdate>,
        source: UpdateSource,
    ) -> anyhow::Result<Vec<ListenerRevision>>;

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Serves a remote puller: strands on demand, acknowledgements into the
/// listener cursor.
pub struct PullResponder {
    drive_id: String,
    listener_id: String,
    manager: Arc<ListenerManager>,
}

impl PullResponder {
    pub fn new(
        drive_id: impl Into<String>,
        listener_id: impl Into<String>,
        manager: Arc<ListenerManager>,
    ) -> Self {
        Self {
            drive_id: drive_id.into(),
            listener_id: listener_id.into(),
            manager,
        }
    }

    pub async fn get_strands(
        &self,
        options: GetStrandsOptions,
    ) -> anyhow::Result<Vec<StrandUpdate>> {
        self.manager
            .get_strands(&self.drive_id, &self.listener_id, options)
            .await
    }

    /// Moves the listener cursor forward; returns `false` when any
    /// revision could not be applied.
    pub async fn process_acknowledge(
        &self,
        revisions: &[ListenerRevision],
    ) -> anyhow::Result<bool> {
        let mut success = true;
        for revision in revisions {
            let applied = self
                .manager
                .update_listener_revision(
                    &self.drive_id,
                    &self.listener_id,
                    &revision.unit_id(),
                    revision.revision,
                )
                .await?;
            success &= applied;
        }
        Ok(success)
    }
}

#[async_trait]
impl Transmitter for PullResponder {
    fn is_push(&self) -> bool {
        false
    }

    async fn transmit(
        &self,
        _strands: Vec<StrandUpdate>,
        _source: UpdateSource,
    ) -> anyhow::Result<Vec<ListenerRevision>> {
        Ok(Vec::new())
    }
}

/// Remote channel a pull loop talks through.
#[async_trait]
pub trait StrandTransport: Send + Sync + 'static {
    /// Registers a pull listener on the remote, returning its id.
    async fn register_listener(&self, filter: &ListenerFilter) -> anyhow::Result<String>;

    async fn pull_strands(&self, listener_id: &str) -> anyhow::Result<Vec<StrandUpdate>>;

    /// Returns `false` when the remote rejected the acknowledgement.
    async fn acknowledge(
        &self,
        listener_id: &str,
        revisions: Vec<ListenerRevision>,
    ) -> anyhow::Result<bool>;
}

/// Consumer of pulled strands. Implemented by the engine.
#[async_trait]
pub trait StrandSink: Send + Sync + 'static {
    async fn apply_strand(
        &self,
        strand: StrandUpdate,
        source: UpdateSource,
    ) -> anyhow::Result<OperationResult>;

    /// Called when fetching strands failed; the loop stays alive.
    async fn on_pull_error(&self, _error: &anyhow::Error) {}
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    pub trigger_id: String,
    pub listener_id: String,
    pub interval: Duration,
}

impl PullOptions {
    pub fn new(trigger_id: impl Into<String>, listener_id: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            listener_id: listener_id.into(),
            interval: Duration::from_secs(5),
        }
    }
}

/// Periodic pull against a remote drive.
pub struct PullLoop;

impl PullLoop {
    /// Spawns the loop; cancel the returned token to stop it. The first
    /// pull runs immediately, later ones on the configured interval.
    /// Transport errors are reported to the sink and do not stop the loop.
    pub fn spawn(
        transport: Arc<dyn StrandTransport>,
        options: PullOptions,
        sink: Arc<dyn StrandSink>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        tokio::spawn(async move {
            debug!(trigger_id = %options.trigger_id, "pull loop started");
            loop {
                if let Err(err) = execute_pull(&*transport, &options, &*sink).await {
                    warn!(trigger_id = %options.trigger_id, "pull failed: {err:#}");
                    sink.on_pull_error(&err).await;
                }
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(options.interval) => {}
                }
            }
            debug!(trigger_id = %options.trigger_id, "pull loop stopped");
        });
        token
    }
}

async fn execute_pull(
    transport: &dyn StrandTransport,
    options: &PullOptions,
    sink: &dyn StrandSink,
) -> anyhow::Result<()> {
    let strands = transport.pull_strands(&options.listener_id).await?;
    if strands.is_empty() {
        trace!(trigger_id = %options.trigger_id, "nothing to pull");
        return Ok(());
    }

    let mut revisions = Vec::with_capacity(strands.len());
    for strand in strands {
        let revision = strand
            .operations
            .last()
            .map(|op| op.index as i64)
            .unwrap_or(-1);
        let result = sink
            .apply_strand(
                strand.clone(),
                UpdateSource::Trigger {
                    trigger_id: options.trigger_id.clone(),
                },
            )
            .await?;
        revisions.push(ListenerRevision {
            drive_id: strand.drive_id,
            document_id: strand.document_id,
            scope: strand.scope,
            branch: strand.branch,
            status: result.status,
            revision,
            error: result.error.as_ref().map(|e| e.to_string()),
        });
    }

    for chunk in revisions.chunks(MAX_REVISIONS_PER_ACK) {
        let accepted = transport
            .acknowledge(&options.listener_id, chunk.to_vec())
            .await?;
        if !accepted {
            warn!(listener_id = %options.listener_id, "acknowledgement rejected");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MAIN_BRANCH;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn strand(document_id: &str, indexes: &[u64]) -> StrandUpdate {
        StrandUpdate {
            drive_id: "drive".to_string(),
            document_id: document_id.to_string(),
            document_type: "test/doc".to_string(),
            scope: Scope::Global,
            branch: MAIN_BRANCH.to_string(),
            operations: indexes
                .iter()
                .map(|&i| OperationUpdate {
                    index: i,
                    skip: 0,
                    action_type: "SET".to_string(),
                    input: serde_json::json!(i),
                    hash: format!("h{i}"),
                    timestamp: Utc::now(),
                    id: None,
                    error: None,
                })
                .collect(),
        }
    }

    struct FakeTransport {
        pulls: AtomicUsize,
        fail_first: bool,
        acked: Mutex<Vec<ListenerRevision>>,
    }

    #[async_trait]
    impl StrandTransport for FakeTransport {
        async fn register_listener(&self, _filter: &ListenerFilter) -> anyhow::Result<String> {
            Ok("listener".to_string())
        }

        async fn pull_strands(&self, _listener_id: &str) -> anyhow::Result<Vec<StrandUpdate>> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("network unreachable");
            }
            if n < 3 {
                Ok(vec![strand("doc", &[0, 1])])
            } else {
                Ok(Vec::new())
            }
        }

        async fn acknowledge(
            &self,
            _listener_id: &str,
            revisions: Vec<ListenerRevision>,
        ) -> anyhow::Result<bool> {
            self.acked.lock().unwrap().extend(revisions);
            Ok(true)
        }
    }

    struct CountingSink {
        applied: AtomicUsize,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl StrandSink for CountingSink {
        async fn apply_strand(
            &self,
            _strand: StrandUpdate,
            source: UpdateSource,
        ) -> anyhow::Result<OperationResult> {
            assert!(matches!(source, UpdateSource::Trigger { .. }));
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(OperationResult::success())
        }

        async fn on_pull_error(&self, _error: &anyhow::Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pull_loop_applies_and_acknowledges() {
        let transport = Arc::new(FakeTransport {
            pulls: AtomicUsize::new(0),
            fail_first: false,
            acked: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(CountingSink {
            applied: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let options = PullOptions {
            interval: Duration::from_millis(10),
            ..PullOptions::new("t1", "l1")
        };
        let token = PullLoop::spawn(transport.clone(), options, sink.clone());

        while transport.pulls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        assert_eq!(sink.applied.load(Ordering::SeqCst), 3);
        let acked = transport.acked.lock().unwrap();
        assert_eq!(acked.len(), 3);
        assert!(acked
            .iter()
            .all(|r| r.status == UpdateStatus::Success && r.revision == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_loop_survives_fetch_errors() {
        let transport = Arc::new(FakeTransport {
            pulls: AtomicUsize::new(0),
            fail_first: true,
            acked: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(CountingSink {
            applied: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        let options = PullOptions {
            interval: Duration::from_millis(10),
            ..PullOptions::new("t1", "l1")
        };
        let token = PullLoop::spawn(transport.clone(), options, sink.clone());

        while sink.applied.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        assert_eq!(sink.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operation_update_roundtrip() {
        let op = Operation {
            index: 2,
            skip: 1,
            action_type: "SET".to_string(),
            scope: Scope::Local,
            input: serde_json::json!({"v": 1}),
            hash: "abc".to_string(),
            timestamp: Utc::now(),
            id: Some("op-1".to_string()),
            resulting_state: Some("{}".to_string()),
            error: None,
        };
        let update = OperationUpdate::from(&op);
        let back = update.into_operation(Scope::Local);
        assert_eq!(back.resulting_state, None);
        assert_eq!(back.index, op.index);
        assert_eq!(back.hash, op.hash);
        assert_eq!(back.id, op.id);
    }
}
