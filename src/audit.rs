use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One fact emitted toward the external append-only audit store. The store's
/// schema is not defined here beyond the fields we supply.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: &str, severity: Severity) -> Self {
        Self {
            event_type: event_type.to_string(),
            username: None,
            session_id: None,
            room_id: None,
            ip_address: None,
            details: None,
            severity,
            created_at: Utc::now(),
        }
    }

    pub fn room(mut self, room_id: &str) -> Self {
        self.room_id = Some(room_id.to_string());
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn ip(mut self, ip: impl ToString) -> Self {
        self.ip_address = Some(ip.to_string());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// External audit collaborator boundary.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// In-memory sink backing the admin `list-audit-events` query. A deployment
/// wanting durable audit swaps this for a store-backed implementation.
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: RwLock::new(Vec::new()),
            capacity,
        })
    }

    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) {
        log::info!(
            "audit: {} room={:?} session={:?} ip={:?} details={:?}",
            event.event_type,
            event.room_id,
            event.session_id,
            event.ip_address,
            event.details
        );
        let mut events = self.events.write().await;
        if events.len() == self.capacity {
            events.remove(0);
        }
        events.push(event);
    }
}
