use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::clock::UnixTimeMs;

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, InvalidOpId> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), InvalidOpId> {
        if id.is_empty() {
            return Err(InvalidOpId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(InvalidOpId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(InvalidOpId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OpId {
    type Error = InvalidOpId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OpId> for String {
    fn from(id: OpId) -> Self {
        id.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation id: {0}")]
pub struct InvalidOpId(String);

/// Kind of deferred mutation; handlers are registered per kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Custom(String),
}

impl OperationKind {
    pub fn name(&self) -> &str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What business code hands over when a write cannot reach the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub resource: String,
    pub payload: serde_json::Value,
}

impl NewOperation {
    pub fn new(
        kind: OperationKind,
        resource: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            resource: resource.into(),
            payload,
        }
    }

    pub fn create(resource: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OperationKind::Create, resource, payload)
    }

    pub fn update(resource: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OperationKind::Update, resource, payload)
    }

    pub fn delete(resource: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OperationKind::Delete, resource, payload)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedOperation {
    pub id: OpId,
    pub kind: OperationKind,
    pub resource: String,
    pub payload: serde_json::Value,
    pub created_at: UnixTimeMs,
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_error: Option<String>,
}

impl QueuedOperation {
    pub fn from_new(op: NewOperation, now: UnixTimeMs) -> Self {
        Self {
            id: OpId::generate(),
            kind: op.kind,
            resource: op.resource,
            payload: op.payload,
            created_at: now,
            attempts: 0,
            last_attempt_error: None,
        }
    }
}

/// One operation that did not replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub operation_id: OpId,
    pub resource: String,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of one replay pass, owned by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SyncFailure>,
    /// Set when the pass was skipped because connectivity was down.
    pub skipped_offline: bool,
}

impl SyncResult {
    pub fn offline() -> Self {
        Self {
            skipped_offline: true,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.skipped_offline && self.failed == 0
    }

    pub fn permanent_failures(&self) -> impl Iterator<Item = &SyncFailure> {
        self.failures.iter().filter(|f| !f.retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_id_validation() {
        assert!(OpId::new("").is_err());
        assert!(OpId::new("a".repeat(129)).is_err());
        assert!(OpId::new("has space").is_err());
        assert_eq!(OpId::new("  op-1 ").unwrap().as_str(), "op-1");
    }

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = OpId::generate();
        let b = OpId::generate();
        assert_ne!(a, b);
        assert!(OpId::new(a.as_str()).is_ok());
    }

    #[test]
    fn invalid_id_rejected_on_deserialize() {
        let result: Result<OpId, _> = serde_json::from_value(json!("bad id!"));
        assert!(result.is_err());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(serde_json::to_value(OperationKind::Create).unwrap(), json!("create"));
        assert_eq!(
            serde_json::to_value(OperationKind::Custom("archive".into())).unwrap(),
            json!({"custom": "archive"})
        );
        assert_eq!(OperationKind::Custom("archive".into()).name(), "archive");
    }

    #[test]
    fn new_queued_operation_starts_clean() {
        let op = QueuedOperation::from_new(
            NewOperation::create("materials", json!({"name": "cement"})),
            UnixTimeMs(42),
        );
        assert_eq!(op.attempts, 0);
        assert_eq!(op.created_at, UnixTimeMs(42));
        assert!(op.last_attempt_error.is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        let raw = json!({
            "id": "op-1",
            "kind": "create",
            "resource": "materials",
            "payload": {},
            "created_at": 1,
            "attempts": 0,
            "synced": true
        });
        assert!(serde_json::from_value::<QueuedOperation>(raw).is_err());
    }

    #[test]
    fn offline_result_is_not_success() {
        let result = SyncResult::offline();
        assert_eq!(result.attempted, 0);
        assert!(!result.is_success());
        assert!(SyncResult::default().is_success());
    }
}
