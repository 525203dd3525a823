//! Wire types for the socket protocol.
//!
//! Outbound request batches, inbound batch responses, change push payloads,
//! and the serialized cache boundary format. Field names are camelCase on
//! the wire to match the socket server.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Transport event carrying outbound request batches.
pub const BATCH_EVENT: &str = "graphqlClient";

/// Transport event emitted by the socket layer after a reconnect.
pub const RECONNECT_EVENT: &str = "reconnect";

/// One outbound batch of requests, emitted on [`BATCH_EVENT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEnvelope {
    pub connection_id: Uuid,
    pub batch_id: Uuid,
    pub requests: Vec<BatchItem>,
}

/// One request within a batch, correlated by `stream_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub stream_id: Uuid,
    pub path: String,
    pub body: Value,
    pub is_streamed: bool,
}

/// Per-request response within a batch chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// One inbound message on a batch channel.
///
/// The server may answer a batch in several chunks; each chunk maps stream
/// ids to item responses. A top-level `{isError, info}` object signals a
/// transport-level failure for the whole batch.
#[derive(Debug, Clone)]
pub enum BatchResponse {
    Failure { info: Value },
    Chunk(HashMap<Uuid, ItemResponse>),
}

impl BatchResponse {
    pub fn parse(payload: &Value) -> Result<Self, serde_json::Error> {
        if payload
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Ok(Self::Failure {
                info: payload.get("info").cloned().unwrap_or(Value::Null),
            });
        }
        let chunk: HashMap<Uuid, ItemResponse> = serde_json::from_value(payload.clone())?;
        Ok(Self::Chunk(chunk))
    }
}

/// Kinds of incremental change pushed against a previously fetched list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    IncrementChildren,
    UpdateChild,
    UpdateChildren,
}

/// One incremental mutation notification.
///
/// Which optional fields are meaningful depends on `action`:
/// `old_id` locates the affected node, `client_id` locates it by a
/// client-assigned temporary id, `child_key`/`children`/`new_child_value`
/// drive the child-level actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_val: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_child_value: Option<Value>,
}

impl ChangeEvent {
    fn bare(action: ChangeAction) -> Self {
        Self {
            action,
            old_id: None,
            new_val: None,
            client_id: None,
            child_key: None,
            children: None,
            new_child_value: None,
        }
    }

    pub fn create(new_val: Value) -> Self {
        Self {
            new_val: Some(new_val),
            ..Self::bare(ChangeAction::Create)
        }
    }

    pub fn update(old_id: Value, new_val: Value) -> Self {
        Self {
            old_id: Some(old_id),
            new_val: Some(new_val),
            ..Self::bare(ChangeAction::Update)
        }
    }

    pub fn delete(old_id: Value) -> Self {
        Self {
            old_id: Some(old_id),
            ..Self::bare(ChangeAction::Delete)
        }
    }

    pub fn increment_children(old_id: Value, child_key: &str, children: Vec<Value>) -> Self {
        Self {
            old_id: Some(old_id),
            child_key: Some(child_key.to_string()),
            children: Some(children),
            ..Self::bare(ChangeAction::IncrementChildren)
        }
    }

    pub fn update_child(old_id: Value, child_key: &str, new_child_value: Value) -> Self {
        Self {
            old_id: Some(old_id),
            child_key: Some(child_key.to_string()),
            new_child_value: Some(new_child_value),
            ..Self::bare(ChangeAction::UpdateChild)
        }
    }

    /// `children` entries are `{find, replace}` pairs.
    pub fn update_children(old_id: Value, child_key: &str, children: Vec<Value>) -> Self {
        Self {
            old_id: Some(old_id),
            child_key: Some(child_key.to_string()),
            children: Some(children),
            ..Self::bare(ChangeAction::UpdateChildren)
        }
    }
}

/// One inbound message on a change feed channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePayload {
    #[serde(default)]
    pub initial: Option<Value>,
    #[serde(default)]
    pub connection_id: Option<Uuid>,
    #[serde(default)]
    pub changes: Option<Vec<ChangeEvent>>,
}

/// One entry of the serialized cache boundary payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub value: Value,
    #[serde(default)]
    pub should_refetch_after_ssr: bool,
}
