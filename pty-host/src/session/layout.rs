// Workspace terminal layouts
//
// Clients store tab/pane geometry keyed by workspace so a reloaded window can
// put its terminals back where they were. The stored form references session
// ids; the expanded form returned to clients carries full process details.

use super::protocol::{ProcessDetails, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInstanceLayoutInfoById {
    #[serde(default)]
    pub relative_size: f64,
    pub terminal: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalTabLayoutInfoById {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_persistent_process_id: Option<SessionId>,
    pub terminals: Vec<TerminalInstanceLayoutInfoById>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTerminalLayoutInfoArgs {
    pub workspace_id: String,
    pub tabs: Vec<TerminalTabLayoutInfoById>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Vec<SessionId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInstanceLayoutInfo {
    pub relative_size: f64,
    pub terminal: ProcessDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalTabLayoutInfo {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_persistent_process_id: Option<SessionId>,
    pub terminals: Vec<TerminalInstanceLayoutInfo>,
}

/// A layout with every id resolved to a live process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalsLayoutInfo {
    pub tabs: Vec<TerminalTabLayoutInfo>,
    pub background: Vec<ProcessDetails>,
}

/// Key into the revived-id map: ids are only unique per workspace
pub fn reviving_process_key(workspace_id: &str, id: SessionId) -> String {
    format!("{}-{}", workspace_id, id)
}

/// Last layout set per workspace
#[derive(Debug, Default)]
pub struct LayoutStore {
    layouts: HashMap<String, SetTerminalLayoutInfoArgs>,
}

impl LayoutStore {
    pub fn set(&mut self, args: SetTerminalLayoutInfoArgs) {
        self.layouts.insert(args.workspace_id.clone(), args);
    }

    pub fn get(&self, workspace_id: &str) -> Option<SetTerminalLayoutInfoArgs> {
        self.layouts.get(workspace_id).cloned()
    }
}

/// Tracks ids already placed during one expansion so no process shows up twice
#[derive(Debug, Default)]
pub struct ExpansionGuard {
    done: HashSet<SessionId>,
}

impl ExpansionGuard {
    /// Returns false if `id` was already expanded
    pub fn claim(&mut self, id: SessionId) -> bool {
        self.done.insert(id)
    }
}
