//! Pure change-merge semantics.
//!
//! [`merge`] folds one update (a freshly fetched initial value, or a batch
//! of change events) onto the prior aggregated value and returns the new
//! aggregate. An aggregated value has the shape
//! `{data: {<field>: {nodes: [...], ...}, ...}, ...}`; change events apply
//! to every field container carrying a `nodes` list.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ChangeAction, ChangeEvent};

/// Caller-supplied deterministic ordering applied to a freshly arrived
/// initial value before it becomes the aggregate.
pub type InitialSort = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Options controlling how change events fold into an aggregated value.
#[derive(Clone, Default)]
pub struct MergeOptions {
    pub initial_sort: Option<InitialSort>,
    /// Cap on the node list; on overflow the node furthest from the insert
    /// side is dropped.
    pub limit: Option<usize>,
    /// Insert created nodes at the front instead of appending.
    pub should_prepend_new_updates: bool,
    /// Skip child-level changes that originated from this connection, so a
    /// locally applied optimistic increment is not counted twice.
    pub ignore_increments_from_me: bool,
    /// Suppress `create` events entirely.
    pub ignore_new_streams: bool,
}

impl fmt::Debug for MergeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeOptions")
            .field("initial_sort", &self.initial_sort.as_ref().map(|_| "<fn>"))
            .field("limit", &self.limit)
            .field("should_prepend_new_updates", &self.should_prepend_new_updates)
            .field("ignore_increments_from_me", &self.ignore_increments_from_me)
            .field("ignore_new_streams", &self.ignore_new_streams)
            .finish()
    }
}

/// One update folded onto the aggregate.
#[derive(Debug, Clone)]
pub enum MergeUpdate {
    /// A full value from the network; replaces any prior aggregate.
    Initial(Value),
    /// A batch of incremental changes.
    Changes {
        /// Connection the change originated from, for the self-origin rule.
        connection_id: Option<Uuid>,
        changes: Vec<ChangeEvent>,
        /// Whether the batch came from a local optimistic edit rather than
        /// the server push channel.
        is_client: bool,
    },
}

/// Fold `update` onto `current`.
///
/// A change batch arriving before any initial value is discarded (a known
/// race on page transitions; the refetch triggered by invalidation covers
/// it). Changes within one batch apply strictly in emission order against
/// the evolving node list.
pub fn merge(
    current: Option<&Value>,
    update: &MergeUpdate,
    options: &MergeOptions,
    local_connection_id: Uuid,
) -> Option<Value> {
    match update {
        MergeUpdate::Initial(initial) => {
            let value = initial.clone();
            Some(match &options.initial_sort {
                Some(sort) => sort(value),
                None => value,
            })
        }
        MergeUpdate::Changes {
            connection_id,
            changes,
            is_client,
        } => {
            let Some(current) = current else {
                debug!(
                    change_count = changes.len(),
                    is_client, "change batch arrived before the initial value; discarded"
                );
                return None;
            };
            let is_from_me = *connection_id == Some(local_connection_id);
            Some(apply_changes(current, changes, options, is_from_me))
        }
    }
}

fn apply_changes(
    current: &Value,
    changes: &[ChangeEvent],
    options: &MergeOptions,
    is_from_me: bool,
) -> Value {
    let mut next = current.clone();
    let Some(data) = next.get_mut("data").and_then(Value::as_object_mut) else {
        return next;
    };
    for container in data.values_mut() {
        let Some(nodes) = container.get_mut("nodes").and_then(Value::as_array_mut) else {
            continue;
        };
        for change in changes {
            apply_change(nodes, change, options, is_from_me);
        }
    }
    next
}

fn apply_change(
    nodes: &mut Vec<Value>,
    change: &ChangeEvent,
    options: &MergeOptions,
    is_from_me: bool,
) {
    let mut action = change.action;
    let mut existing = match action {
        ChangeAction::Update
        | ChangeAction::Delete
        | ChangeAction::IncrementChildren
        | ChangeAction::UpdateChild
        | ChangeAction::UpdateChildren => find_by(nodes, "id", change.old_id.as_ref()),
        ChangeAction::Create => None,
    };

    // a create for a client id we already rendered optimistically is an update
    if action == ChangeAction::Create {
        let client_id = change.new_val.as_ref().and_then(|val| val.get("clientId"));
        existing = find_by(nodes, "clientId", client_id);
        if existing.is_some() {
            action = ChangeAction::Update;
        }
    }

    if action == ChangeAction::Delete && change.client_id.is_some() {
        existing = find_by(nodes, "clientId", change.client_id.as_ref());
    }

    let skip_self_origin = is_from_me && options.ignore_increments_from_me;

    match (action, existing) {
        (ChangeAction::IncrementChildren, Some(index)) if !skip_self_origin => {
            increment_children(&mut nodes[index], change);
        }
        (ChangeAction::UpdateChild, Some(index)) if !skip_self_origin => {
            update_child(&mut nodes[index], change);
        }
        (ChangeAction::UpdateChildren, Some(index)) if !skip_self_origin => {
            update_children(&mut nodes[index], change);
        }
        (ChangeAction::Update, Some(index)) => {
            if let Some(new_val) = &change.new_val {
                nodes[index] = new_val.clone();
            }
        }
        (ChangeAction::Delete, Some(index)) => {
            nodes.remove(index);
        }
        (ChangeAction::Create, None) if !options.ignore_new_streams => {
            let Some(new_val) = &change.new_val else {
                return;
            };
            if options.should_prepend_new_updates {
                nodes.insert(0, new_val.clone());
                if options.limit.is_some_and(|limit| nodes.len() > limit) {
                    nodes.pop();
                }
            } else {
                nodes.push(new_val.clone());
                if options.limit.is_some_and(|limit| nodes.len() > limit) {
                    nodes.remove(0);
                }
            }
        }
        // unmatched update/delete/child actions are no-ops
        _ => {}
    }
}

fn increment_children(node: &mut Value, change: &ChangeEvent) {
    let Some(children) = children_list(node, change) else {
        return;
    };
    let Some(deltas) = &change.children else {
        return;
    };
    for delta in deltas {
        // match an existing child ignoring its counter field
        let probe = without_field(delta, "count");
        match children.iter_mut().find(|child| matches_subset(child, &probe)) {
            Some(child) => {
                let prior = child.get("count").and_then(Value::as_i64).unwrap_or(0);
                let added = delta.get("count").and_then(Value::as_i64).unwrap_or(0);
                if let Some(obj) = child.as_object_mut() {
                    obj.insert("count".to_string(), Value::from(prior + added));
                }
            }
            None => children.push(delta.clone()),
        }
    }
}

fn update_child(node: &mut Value, change: &ChangeEvent) {
    let (Some(child_key), Some(new_child_value)) = (&change.child_key, &change.new_child_value)
    else {
        return;
    };
    if let Some(obj) = node.as_object_mut() {
        obj.insert(child_key.clone(), new_child_value.clone());
    }
}

fn update_children(node: &mut Value, change: &ChangeEvent) {
    let Some(children) = children_list(node, change) else {
        return;
    };
    let Some(patches) = &change.children else {
        return;
    };
    for patch in patches {
        let Some(find) = patch.get("find") else {
            continue;
        };
        let replace = patch.get("replace").cloned().unwrap_or(Value::Null);
        match children.iter().position(|child| matches_subset(child, find)) {
            Some(index) => {
                let merged = defaults(&replace, &children[index]);
                children[index] = merged;
            }
            None => children.push(defaults(&replace, find)),
        }
    }
}

/// The node's child list under the change's `child_key`, created empty when
/// absent.
fn children_list<'a>(node: &'a mut Value, change: &ChangeEvent) -> Option<&'a mut Vec<Value>> {
    let child_key = change.child_key.as_ref()?;
    let obj = node.as_object_mut()?;
    obj.entry(child_key.clone())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
}

fn find_by(nodes: &[Value], field: &str, needle: Option<&Value>) -> Option<usize> {
    let needle = needle.filter(|val| !val.is_null())?;
    nodes.iter().position(|node| node.get(field) == Some(needle))
}

/// True when every field of `probe` matches in `candidate`; non-object
/// probes compare by equality.
fn matches_subset(candidate: &Value, probe: &Value) -> bool {
    match probe.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| candidate.get(key) == Some(expected)),
        None => candidate == probe,
    }
}

fn without_field(value: &Value, field: &str) -> Value {
    match value.as_object() {
        Some(obj) => {
            let mut trimmed: Map<String, Value> = obj.clone();
            trimmed.remove(field);
            Value::Object(trimmed)
        }
        None => value.clone(),
    }
}

/// Field-level merge where `primary`'s fields win and `fallback` fills the
/// gaps.
fn defaults(primary: &Value, fallback: &Value) -> Value {
    match (primary.as_object(), fallback.as_object()) {
        (Some(primary), Some(fallback)) => {
            let mut merged = fallback.clone();
            for (key, value) in primary {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => {
            if primary.is_null() {
                fallback.clone()
            } else {
                primary.clone()
            }
        }
    }
}
