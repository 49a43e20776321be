//! Audit events emitted by the connection lifecycle.
//!
//! Delivery is fire-and-forget: a sink must never fail the operation that
//! triggered it, so [`AuditSink::record`] returns nothing.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConnectionEstablished,
    ConnectionRemoved,
    ManualSync,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ConnectionEstablished => "connection_established",
            AuditAction::ConnectionRemoved => "connection_removed",
            AuditAction::ManualSync => "manual_sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub tenant_id: Uuid,
    pub principal_id: Uuid,
    /// Provider name, counts and similar small values
    pub metadata: BTreeMap<String, Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, tenant_id: Uuid, principal_id: Uuid) -> Self {
        Self {
            action,
            tenant_id,
            principal_id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        tracing::info!(
            target: "audit",
            action = event.action.as_str(),
            tenant_id = %event.tenant_id,
            principal_id = %event.principal_id,
            metadata = %metadata,
            "audit event"
        );
    }
}
