//! The built-in drive document model.
//!
//! A drive is itself a document: its global scope holds the node tree
//! (files and folders), its local scope the listeners and triggers
//! configured on this node. File nodes point at child documents and name
//! the synchronization units the drive exposes for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Action, DocumentState, Scope, DRIVE_DOCUMENT_TYPE, MAIN_BRANCH};
use crate::listener::ListenerFilter;
use crate::replay::{DocumentModel, Signal, SignalQueue};

/// Reference to one synchronization unit of a file node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUnitRef {
    pub scope: Scope,
    pub branch: String,
}

impl SyncUnitRef {
    pub fn main(scope: Scope) -> Self {
        Self {
            scope,
            branch: MAIN_BRANCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    pub document_type: String,
    pub parent_folder: Option<String>,
    pub synchronization_units: Vec<SyncUnitRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderNode {
    pub id: String,
    pub name: String,
    pub parent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    File(FileNode),
    Folder(FolderNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::File(f) => &f.id,
            Node::Folder(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::File(f) => &f.name,
            Node::Folder(f) => &f.name,
        }
    }

    pub fn parent_folder(&self) -> Option<&str> {
        match self {
            Node::File(f) => f.parent_folder.as_deref(),
            Node::Folder(f) => f.parent_folder.as_deref(),
        }
    }

    fn set_parent_folder(&mut self, parent: Option<String>) {
        match self {
            Node::File(f) => f.parent_folder = parent,
            Node::Folder(f) => f.parent_folder = parent,
        }
    }

    fn set_name(&mut self, name: String) {
        match self {
            Node::File(f) => f.name = name,
            Node::Folder(f) => f.name = name,
        }
    }
}

/// Global scope of a drive: its display name and node tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveState {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl DriveState {
    pub fn file_nodes(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.iter().filter_map(|node| match node {
            Node::File(f) => Some(f),
            Node::Folder(_) => None,
        })
    }
}

/// A listener stored in drive state. The runtime listener (with its
/// transmitter) is registered separately on the listener manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub listener_id: String,
    pub label: Option<String>,
    pub block: bool,
    pub system: bool,
    pub filter: ListenerFilter,
}

/// A pull trigger stored in drive state: poll `url` on `interval_seconds`
/// for strands addressed to `listener_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub listener_id: String,
    pub url: String,
    pub interval_seconds: u64,
}

/// Local scope of a drive: node-private sync configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveLocalState {
    pub listeners: Vec<ListenerSpec>,
    pub triggers: Vec<Trigger>,
}

pub const ADD_FILE: &str = "ADD_FILE";
pub const ADD_FOLDER: &str = "ADD_FOLDER";
pub const DELETE_NODE: &str = "DELETE_NODE";
pub const UPDATE_NODE: &str = "UPDATE_NODE";
pub const MOVE_NODE: &str = "MOVE_NODE";
pub const COPY_NODE: &str = "COPY_NODE";
pub const SET_DRIVE_NAME: &str = "SET_DRIVE_NAME";
pub const ADD_LISTENER: &str = "ADD_LISTENER";
pub const REMOVE_LISTENER: &str = "REMOVE_LISTENER";
pub const ADD_TRIGGER: &str = "ADD_TRIGGER";
pub const REMOVE_TRIGGER: &str = "REMOVE_TRIGGER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFileInput {
    pub id: String,
    pub name: String,
    pub document_type: String,
    #[serde(default)]
    pub parent_folder: Option<String>,
    pub synchronization_units: Vec<SyncUnitRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFolderInput {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeInput {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveNodeInput {
    pub src_id: String,
    #[serde(default)]
    pub target_parent_folder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyNodeInput {
    pub src_id: String,
    pub target_id: String,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub target_parent_folder: Option<String>,
}

/// Action constructors for the drive model.
pub mod actions {
    use super::*;
    use serde_json::json;

    fn to_input<T: Serialize>(input: &T) -> Value {
        serde_json::to_value(input).unwrap_or_default()
    }

    pub fn add_file(input: AddFileInput) -> Action {
        Action::new(ADD_FILE, Scope::Global, to_input(&input))
    }

    pub fn add_folder(id: impl Into<String>, name: impl Into<String>) -> Action {
        add_folder_in(id, name, None)
    }

    pub fn add_folder_in(
        id: impl Into<String>,
        name: impl Into<String>,
        parent_folder: Option<String>,
    ) -> Action {
        Action::new(
            ADD_FOLDER,
            Scope::Global,
            to_input(&AddFolderInput {
                id: id.into(),
                name: name.into(),
                parent_folder,
            }),
        )
    }

    pub fn delete_node(id: impl Into<String>) -> Action {
        Action::new(DELETE_NODE, Scope::Global, json!({ "id": id.into() }))
    }

    pub fn update_node(input: UpdateNodeInput) -> Action {
        Action::new(UPDATE_NODE, Scope::Global, to_input(&input))
    }

    pub fn move_node(input: MoveNodeInput) -> Action {
        Action::new(MOVE_NODE, Scope::Global, to_input(&input))
    }

    pub fn copy_node(input: CopyNodeInput) -> Action {
        Action::new(COPY_NODE, Scope::Global, to_input(&input))
    }

    pub fn set_drive_name(name: impl Into<String>) -> Action {
        Action::new(SET_DRIVE_NAME, Scope::Global, json!({ "name": name.into() }))
    }

    pub fn add_listener(spec: ListenerSpec) -> Action {
        Action::new(ADD_LISTENER, Scope::Local, to_input(&spec))
    }

    pub fn remove_listener(listener_id: impl Into<String>) -> Action {
        Action::new(
            REMOVE_LISTENER,
            Scope::Local,
            json!({ "listener_id": listener_id.into() }),
        )
    }

    pub fn add_trigger(trigger: Trigger) -> Action {
        Action::new(ADD_TRIGGER, Scope::Local, to_input(&trigger))
    }

    pub fn remove_trigger(trigger_id: impl Into<String>) -> Action {
        Action::new(REMOVE_TRIGGER, Scope::Local, json!({ "id": trigger_id.into() }))
    }
}

/// Reducer for drive documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriveModel;

impl DocumentModel for DriveModel {
    fn document_type(&self) -> &str {
        DRIVE_DOCUMENT_TYPE
    }

    fn initial_state(&self) -> DocumentState {
        DocumentState {
            global: serde_json::to_value(DriveState::default()).unwrap_or_default(),
            local: serde_json::to_value(DriveLocalState::default()).unwrap_or_default(),
        }
    }

    fn reduce(
        &self,
        state: &Value,
        action: &Action,
        signals: &mut SignalQueue,
    ) -> Result<Value, String> {
        match action.scope {
            Scope::Global => {
                let mut drive: DriveState = parse(state)?;
                reduce_global(&mut drive, action, signals)?;
                serde_json::to_value(drive).map_err(|e| e.to_string())
            }
            Scope::Local => {
                let mut local: DriveLocalState = parse(state)?;
                reduce_local(&mut local, action)?;
                serde_json::to_value(local).map_err(|e| e.to_string())
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned + Default>(state: &Value) -> Result<T, String> {
    if state.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(state.clone()).map_err(|e| e.to_string())
}

fn parse_input<T: serde::de::DeserializeOwned>(action: &Action) -> Result<T, String> {
    serde_json::from_value(action.input.clone())
        .map_err(|e| format!("invalid {} input: {e}", action.action_type))
}

fn reduce_global(
    drive: &mut DriveState,
    action: &Action,
    signals: &mut SignalQueue,
) -> Result<(), String> {
    match action.action_type.as_str() {
        ADD_FILE => {
            let input: AddFileInput = parse_input(action)?;
            ensure_new_node(drive, &input.id)?;
            signals.dispatch(Signal::CreateChild {
                id: input.id.clone(),
                document_type: input.document_type.clone(),
            });
            drive.nodes.push(Node::File(FileNode {
                id: input.id,
                name: input.name,
                document_type: input.document_type,
                parent_folder: input.parent_folder,
                synchronization_units: input.synchronization_units,
            }));
            Ok(())
        }
        ADD_FOLDER => {
            let input: AddFolderInput = parse_input(action)?;
            ensure_new_node(drive, &input.id)?;
            drive.nodes.push(Node::Folder(FolderNode {
                id: input.id,
                name: input.name,
                parent_folder: input.parent_folder,
            }));
            Ok(())
        }
        DELETE_NODE => {
            #[derive(Deserialize)]
            struct DeleteNodeInput {
                id: String,
            }
            let input: DeleteNodeInput = parse_input(action)?;
            find_node(drive, &input.id)?;
            let mut removed = descendant_ids(&drive.nodes, &input.id);
            removed.insert(0, input.id.clone());
            // only file nodes map to child documents
            let removed_files: Vec<String> = drive
                .nodes
                .iter()
                .filter(|n| matches!(n, Node::File(_)) && removed.iter().any(|id| id == n.id()))
                .map(|n| n.id().to_string())
                .collect();
            drive
                .nodes
                .retain(|n| !removed.iter().any(|id| id == n.id()));
            for id in removed_files {
                signals.dispatch(Signal::DeleteChild { id });
            }
            Ok(())
        }
        UPDATE_NODE => {
            let input: UpdateNodeInput = parse_input(action)?;
            let node = find_node_mut(drive, &input.id)?;
            if let Some(name) = input.name {
                node.set_name(name);
            }
            if let Some(parent) = input.parent_folder {
                node.set_parent_folder(Some(parent));
            }
            Ok(())
        }
        MOVE_NODE => {
            let input: MoveNodeInput = parse_input(action)?;
            if input.target_parent_folder.as_deref() == Some(input.src_id.as_str()) {
                return Err(
                    "Circular Reference Error: Attempting to move a node into itself".to_string(),
                );
            }
            let node = find_node(drive, &input.src_id)?;
            if matches!(node, Node::Folder(_)) {
                if let Some(target) = &input.target_parent_folder {
                    let descendants = descendant_ids(&drive.nodes, &input.src_id);
                    if descendants.contains(target) {
                        return Err(
                            "Circular Reference Error: Cannot move a folder to one of its descendants"
                                .to_string(),
                        );
                    }
                }
            }
            let node = find_node_mut(drive, &input.src_id)?;
            node.set_parent_folder(input.target_parent_folder);
            Ok(())
        }
        COPY_NODE => {
            let input: CopyNodeInput = parse_input(action)?;
            let src = find_node(drive, &input.src_id)?.clone();
            ensure_new_node(drive, &input.target_id)?;
            let mut copy = src.clone();
            match &mut copy {
                Node::File(f) => f.id = input.target_id.clone(),
                Node::Folder(f) => f.id = input.target_id.clone(),
            }
            if let Some(name) = input.target_name {
                copy.set_name(name);
            }
            copy.set_parent_folder(input.target_parent_folder);
            let is_file = matches!(copy, Node::File(_));
            drive.nodes.push(copy);
            if is_file {
                signals.dispatch(Signal::CopyChild {
                    id: input.src_id,
                    new_id: input.target_id,
                });
            }
            Ok(())
        }
        SET_DRIVE_NAME => {
            #[derive(Deserialize)]
            struct SetDriveNameInput {
                name: String,
            }
            let input: SetDriveNameInput = parse_input(action)?;
            drive.name = input.name;
            Ok(())
        }
        other => Err(format!("unknown action type {other} for scope global")),
    }
}

fn reduce_local(local: &mut DriveLocalState, action: &Action) -> Result<(), String> {
    match action.action_type.as_str() {
        ADD_LISTENER => {
            let spec: ListenerSpec = parse_input(action)?;
            if local.listeners.iter().any(|l| l.listener_id == spec.listener_id) {
                return Err(format!(
                    "Listener with id {} already exists",
                    spec.listener_id
                ));
            }
            local.listeners.push(spec);
            Ok(())
        }
        REMOVE_LISTENER => {
            #[derive(Deserialize)]
            struct RemoveListenerInput {
                listener_id: String,
            }
            let input: RemoveListenerInput = parse_input(action)?;
            local.listeners.retain(|l| l.listener_id != input.listener_id);
            Ok(())
        }
        ADD_TRIGGER => {
            let trigger: Trigger = parse_input(action)?;
            if local.triggers.iter().any(|t| t.id == trigger.id) {
                return Err(format!("Trigger with id {} already exists", trigger.id));
            }
            local.triggers.push(trigger);
            Ok(())
        }
        REMOVE_TRIGGER => {
            #[derive(Deserialize)]
            struct RemoveTriggerInput {
                id: String,
            }
            let input: RemoveTriggerInput = parse_input(action)?;
            local.triggers.retain(|t| t.id != input.id);
            Ok(())
        }
        other => Err(format!("unknown action type {other} for scope local")),
    }
}

fn ensure_new_node(drive: &DriveState, id: &str) -> Result<(), String> {
    if drive.nodes.iter().any(|n| n.id() == id) {
        return Err(format!("Node with id {id} already exists"));
    }
    Ok(())
}

fn find_node<'a>(drive: &'a DriveState, id: &str) -> Result<&'a Node, String> {
    drive
        .nodes
        .iter()
        .find(|n| n.id() == id)
        .ok_or_else(|| format!("Node with id {id} not found"))
}

fn find_node_mut<'a>(drive: &'a mut DriveState, id: &str) -> Result<&'a mut Node, String> {
    drive
        .nodes
        .iter_mut()
        .find(|n| n.id() == id)
        .ok_or_else(|| format!("Node with id {id} not found"))
}

/// Transitive children of `root`, following `parent_folder` links.
fn descendant_ids(nodes: &[Node], root: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        for node in nodes {
            if node.parent_folder() == Some(current.as_str()) {
                let id = node.id().to_string();
                if !result.contains(&id) {
                    result.push(id.clone());
                    frontier.push(id);
                }
            }
        }
    }
    result
}

/// Parses the global scope state of a drive document.
pub fn drive_state(state: &Value) -> Result<DriveState, String> {
    parse(state)
}

/// Parses the local scope state of a drive document.
pub fn drive_local_state(state: &Value) -> Result<DriveLocalState, String> {
    parse(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{apply_action, create_document, ApplyOptions};

    fn apply(doc: &mut crate::document::Document, action: Action) -> crate::document::Operation {
        let mut signals = SignalQueue::default();
        apply_action(
            doc,
            &DriveModel,
            action,
            &mut signals,
            0,
            &ApplyOptions::default(),
        )
        .unwrap()
    }

    fn file_input(id: &str, name: &str) -> AddFileInput {
        AddFileInput {
            id: id.to_string(),
            name: name.to_string(),
            document_type: "test/counter".to_string(),
            parent_folder: None,
            synchronization_units: vec![SyncUnitRef::main(Scope::Global)],
        }
    }

    #[test]
    fn add_folder_then_duplicate_errors() {
        let mut doc = create_document(&DriveModel);
        let op = apply(&mut doc, actions::add_folder("1", "folder"));
        assert!(op.error.is_none());

        let op = apply(&mut doc, actions::add_folder("1", "other"));
        assert_eq!(op.error.as_deref(), Some("Node with id 1 already exists"));

        let drive = drive_state(&doc.state.global).unwrap();
        assert_eq!(drive.nodes.len(), 1);
        assert_eq!(drive.nodes[0].name(), "folder");
    }

    #[test]
    fn add_file_dispatches_create_child() {
        let mut doc = create_document(&DriveModel);
        let mut signals = SignalQueue::default();
        apply_action(
            &mut doc,
            &DriveModel,
            actions::add_file(file_input("f1", "file")),
            &mut signals,
            0,
            &ApplyOptions::default(),
        )
        .unwrap();

        assert_eq!(
            signals.drain(),
            vec![Signal::CreateChild {
                id: "f1".to_string(),
                document_type: "test/counter".to_string()
            }]
        );
    }

    #[test]
    fn delete_folder_removes_descendants_and_signals_files() {
        let mut doc = create_document(&DriveModel);
        apply(&mut doc, actions::add_folder("root", "root"));
        apply(
            &mut doc,
            actions::add_folder_in("sub", "sub", Some("root".to_string())),
        );
        let mut input = file_input("f1", "file");
        input.parent_folder = Some("sub".to_string());
        apply(&mut doc, actions::add_file(input));

        let mut signals = SignalQueue::default();
        apply_action(
            &mut doc,
            &DriveModel,
            actions::delete_node("root"),
            &mut signals,
            0,
            &ApplyOptions::default(),
        )
        .unwrap();

        let drive = drive_state(&doc.state.global).unwrap();
        assert!(drive.nodes.is_empty());
        assert_eq!(
            signals.drain(),
            vec![Signal::DeleteChild {
                id: "f1".to_string()
            }]
        );
    }

    #[test]
    fn move_folder_into_descendant_errors() {
        let mut doc = create_document(&DriveModel);
        apply(&mut doc, actions::add_folder("a", "a"));
        apply(&mut doc, actions::add_folder_in("b", "b", Some("a".to_string())));

        let op = apply(
            &mut doc,
            actions::move_node(MoveNodeInput {
                src_id: "a".to_string(),
                target_parent_folder: Some("b".to_string()),
            }),
        );
        assert!(op
            .error
            .as_deref()
            .unwrap()
            .starts_with("Circular Reference Error"));
    }

    #[test]
    fn copy_file_dispatches_copy_child() {
        let mut doc = create_document(&DriveModel);
        apply(&mut doc, actions::add_file(file_input("f1", "file")));

        let mut signals = SignalQueue::default();
        apply_action(
            &mut doc,
            &DriveModel,
            actions::copy_node(CopyNodeInput {
                src_id: "f1".to_string(),
                target_id: "f2".to_string(),
                target_name: Some("copy".to_string()),
                target_parent_folder: None,
            }),
            &mut signals,
            0,
            &ApplyOptions::default(),
        )
        .unwrap();

        let drive = drive_state(&doc.state.global).unwrap();
        assert_eq!(drive.nodes.len(), 2);
        assert_eq!(
            signals.drain(),
            vec![Signal::CopyChild {
                id: "f1".to_string(),
                new_id: "f2".to_string()
            }]
        );
    }

    #[test]
    fn set_drive_name_updates_state() {
        let mut doc = create_document(&DriveModel);
        apply(&mut doc, actions::set_drive_name("my drive"));
        let drive = drive_state(&doc.state.global).unwrap();
        assert_eq!(drive.name, "my drive");
    }

    #[test]
    fn listeners_live_in_local_scope() {
        let mut doc = create_document(&DriveModel);
        let spec = ListenerSpec {
            listener_id: "l1".to_string(),
            label: None,
            block: false,
            system: false,
            filter: ListenerFilter::default(),
        };
        apply(&mut doc, actions::add_listener(spec));

        let local = drive_local_state(&doc.state.local).unwrap();
        assert_eq!(local.listeners.len(), 1);
        let drive = drive_state(&doc.state.global).unwrap();
        assert!(drive.nodes.is_empty());

        apply(&mut doc, actions::remove_listener("l1"));
        let local = drive_local_state(&doc.state.local).unwrap();
        assert!(local.listeners.is_empty());
        assert_eq!(doc.revision(Scope::Local), 1);
        assert_eq!(doc.revision(Scope::Global), 0);
    }
}
