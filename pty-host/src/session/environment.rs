// Environment variable collections contributed by extensions
//
// A collection is an ordered list of mutators against single variables. The
// merged view keeps every mutator per variable, later collections first.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutatorType {
    Replace,
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariableMutator {
    pub variable: String,
    pub value: String,
    #[serde(rename = "type")]
    pub kind: MutatorType,
    /// Workspace folder the mutator is limited to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariableCollection {
    pub extension_id: String,
    pub mutators: Vec<EnvironmentVariableMutator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedMutator {
    pub extension_id: String,
    pub value: String,
    pub kind: MutatorType,
}

/// Merge collections into a per-variable mutator list, honoring workspace scoping
pub fn merge_collections(
    collections: &[EnvironmentVariableCollection],
    workspace_folder: Option<&str>,
) -> HashMap<String, Vec<MergedMutator>> {
    let mut merged: HashMap<String, Vec<MergedMutator>> = HashMap::new();
    for collection in collections {
        for mutator in &collection.mutators {
            let in_scope = match (&mutator.scope, workspace_folder) {
                (None, _) => true,
                (Some(scope), Some(folder)) => scope == folder,
                (Some(_), None) => false,
            };
            if !in_scope {
                continue;
            }
            let entry = merged.entry(mutator.variable.clone()).or_default();
            entry.insert(
                0,
                MergedMutator {
                    extension_id: collection.extension_id.clone(),
                    value: mutator.value.clone(),
                    kind: mutator.kind,
                },
            );
        }
    }
    merged
}

/// Values of every PATH prepend mutator, in merged order
pub fn path_prepend_values(
    collections: &[EnvironmentVariableCollection],
    workspace_folder: Option<&str>,
) -> Vec<String> {
    merge_collections(collections, workspace_folder)
        .remove("PATH")
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.kind == MutatorType::Prepend)
        .map(|m| m.value)
        .collect()
}

/// Apply merged mutators to `env` in place
pub fn apply_collections(
    env: &mut HashMap<String, String>,
    collections: &[EnvironmentVariableCollection],
    workspace_folder: Option<&str>,
) {
    for (variable, mutators) in merge_collections(collections, workspace_folder) {
        // Merged order puts the newest mutator first; apply oldest first
        for mutator in mutators.into_iter().rev() {
            let current = env.remove(&variable).unwrap_or_default();
            let value = match mutator.kind {
                MutatorType::Replace => mutator.value,
                MutatorType::Append => current + &mutator.value,
                MutatorType::Prepend => mutator.value + &current,
            };
            env.insert(variable.clone(), value);
        }
    }
}
