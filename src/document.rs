//! Core data model: actions, operations and versioned documents.
//!
//! A [`Document`] is a pair of independently versioned scope states. Every
//! mutation is recorded as an [`Operation`] in the per-scope operation log,
//! carrying the SHA-256 hash of the state it produced so that replicas can
//! detect divergence without exchanging full state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The only branch in use today. Kept as an explicit field on sync units so
/// the wire format does not change when branching lands.
pub const MAIN_BRANCH: &str = "main";

/// Document type identifier of the built-in drive model.
pub const DRIVE_DOCUMENT_TYPE: &str = "drivesync/drive";

/// The two visibility scopes of a document.
///
/// Scopes version independently: each has its own operation log, revision
/// counter and state hash. `Global` state is shared with every replica,
/// `Local` state never leaves the node that produced it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Global,
    Local,
}

impl Scope {
    /// All scopes, in canonical order.
    pub const ALL: [Scope; 2] = [Scope::Global, Scope::Local];
}

/// A user intent, not yet recorded in any log.
///
/// Actions are what reducers understand. Applying an action to a document
/// produces an [`Operation`] with index, hash and timestamp filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub scope: Scope,
    pub input: Value,
    /// Optional idempotency key, carried through to the recorded operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Action {
    pub fn new(action_type: impl Into<String>, scope: Scope, input: Value) -> Self {
        Self {
            action_type: action_type.into(),
            scope,
            input,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A recorded state transition of one scope of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Position in the scope's log. Assigned by the node that recorded it.
    pub index: u64,
    /// Number of immediately preceding operations this one voids.
    pub skip: u64,
    #[serde(rename = "type")]
    pub action_type: String,
    pub scope: Scope,
    pub input: Value,
    /// Hex SHA-256 of the scope state after applying this operation.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    /// Stable identity across replicas, if the producer assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Cached JSON text of the scope state after this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_state: Option<String>,
    /// Reducer error message, if the action was rejected. Errored operations
    /// still occupy an index but leave the state unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Action type recorded for skip markers produced by merges and undos.
pub const NOOP: &str = "NOOP";

impl Operation {
    /// Operation voiding the `skip` operations before `index`, changing
    /// nothing else.
    pub fn noop(index: u64, skip: u64, scope: Scope, hash: impl Into<String>) -> Self {
        Self {
            index,
            skip,
            action_type: NOOP.to_string(),
            scope,
            input: Value::Null,
            hash: hash.into(),
            timestamp: Utc::now(),
            id: None,
            resulting_state: None,
            error: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.action_type == NOOP
    }

    /// The action this operation records, for replay.
    pub fn action(&self) -> Action {
        Action {
            action_type: self.action_type.clone(),
            scope: self.scope,
            input: self.input.clone(),
            id: self.id.clone(),
        }
    }
}

/// The per-scope states of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub global: Value,
    pub local: Value,
}

impl Default for DocumentState {
    fn default() -> Self {
        Self {
            global: Value::Null,
            local: Value::Null,
        }
    }
}

impl DocumentState {
    pub fn get(&self, scope: Scope) -> &Value {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
        }
    }

    pub fn get_mut(&mut self, scope: Scope) -> &mut Value {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Local => &mut self.local,
        }
    }

    pub fn set(&mut self, scope: Scope, value: Value) {
        *self.get_mut(scope) = value;
    }
}

/// The per-scope operation logs of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentOperations {
    pub global: Vec<Operation>,
    pub local: Vec<Operation>,
}

impl DocumentOperations {
    pub fn get(&self, scope: Scope) -> &Vec<Operation> {
        match scope {
            Scope::Global => &self.global,
            Scope::Local => &self.local,
        }
    }

    pub fn get_mut(&mut self, scope: Scope) -> &mut Vec<Operation> {
        match scope {
            Scope::Global => &mut self.global,
            Scope::Local => &mut self.local,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Scope, &Vec<Operation>)> {
        Scope::ALL.iter().map(move |s| (*s, self.get(*s)))
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.local.is_empty()
    }
}

/// A versioned document: header, current state and full operation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub document_type: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub initial_state: DocumentState,
    pub state: DocumentState,
    pub operations: DocumentOperations,
}

impl Document {
    /// Fresh document with no operations. `state` starts equal to
    /// `initial_state`.
    pub fn new(document_type: impl Into<String>, initial_state: DocumentState) -> Self {
        let now = Utc::now();
        Self {
            name: String::new(),
            document_type: document_type.into(),
            created: now,
            last_modified: now,
            state: initial_state.clone(),
            initial_state,
            operations: DocumentOperations::default(),
        }
    }

    /// Index of the last operation in `scope`, or `-1` when the log is
    /// empty. The sentinel matches the wire protocol.
    pub fn revision(&self, scope: Scope) -> i64 {
        self.operations
            .get(scope)
            .last()
            .map(|op| op.index as i64)
            .unwrap_or(-1)
    }
}

/// Canonical hash of a scope state: hex SHA-256 over the JSON encoding.
///
/// `serde_json` maps are BTreeMap-backed, so key order is deterministic and
/// two replicas hashing equal states get equal digests.
pub fn hash_scope_state(state: &Value) -> String {
    let digest = Sha256::digest(state.to_string().as_bytes());
    data_encoding::HEXLOWER.encode(&digest)
}
