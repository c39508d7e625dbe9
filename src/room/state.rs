use crate::signaling::connection::ConnectionHandle;
use crate::types::ConnectionId;
use crate::utils::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    Pending,
    Approved,
}

pub struct ViewerEntry {
    pub connection: Arc<ConnectionHandle>,
    pub state: ApprovalState,
    pub joined_at: Instant,
}

/// One streaming session: a single presenter fanning out to N viewers.
/// The registry owns room lifecycle; everything else only reads the viewer
/// set or writes to viewer channels.
pub struct Room {
    pub id: String,
    pub presenter_id: ConnectionId,
    pub presenter: Arc<ConnectionHandle>,
    pub require_approval: bool,
    pub access_code: Option<String>,
    pub created_at: Instant,
    viewers: RwLock<HashMap<ConnectionId, ViewerEntry>>,
    banned_ips: RwLock<HashSet<IpAddr>>,
    /// Last init segment from the presenter. Swapped whole under the lock,
    /// so a racing join observes the old or the new bytes, never a torn mix.
    init_segment: RwLock<Option<Bytes>>,
}

impl Room {
    pub fn new(
        id: String,
        presenter: Arc<ConnectionHandle>,
        require_approval: bool,
        access_code: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            presenter_id: presenter.id.clone(),
            presenter,
            require_approval,
            access_code,
            created_at: Instant::now(),
            viewers: RwLock::new(HashMap::new()),
            banned_ips: RwLock::new(HashSet::new()),
            init_segment: RwLock::new(None),
        })
    }

    /// Inserts a viewer and, when it is immediately approved, delivers the
    /// cached init segment while still holding the viewer-map write lock.
    /// Holding the lock keeps any concurrent live-frame broadcast from
    /// reaching the new viewer's queue before its init segment is out.
    pub async fn add_viewer(&self, connection: Arc<ConnectionHandle>, state: ApprovalState) {
        let mut viewers = self.viewers.write().await;
        let conn_id = connection.id.clone();
        if state == ApprovalState::Approved {
            if let Some(segment) = self.init_segment.read().await.clone() {
                let _ = connection.send_init_segment(segment);
            }
        }
        viewers.insert(
            conn_id,
            ViewerEntry {
                connection,
                state,
                joined_at: Instant::now(),
            },
        );
    }

    /// Idempotent; removing a non-member is a no-op.
    pub async fn remove_viewer(&self, conn_id: &str) -> Option<ViewerEntry> {
        let mut viewers = self.viewers.write().await;
        viewers.remove(conn_id)
    }

    /// Flips a pending viewer to approved and bootstraps its stream with the
    /// cached init segment, under the same lock discipline as `add_viewer`.
    pub async fn approve_viewer(&self, conn_id: &str) -> Result<Arc<ConnectionHandle>> {
        let mut viewers = self.viewers.write().await;
        let entry = viewers
            .get_mut(conn_id)
            .ok_or_else(|| Error::Connection(format!("viewer {} not in room {}", conn_id, self.id)))?;
        entry.state = ApprovalState::Approved;
        // Approval notice first, then the bootstrap bytes, before any live
        // frame can be enqueued for this viewer.
        let _ = entry
            .connection
            .send_control(&crate::signaling::messages::ControlMessage::ViewerApproved {
                room_id: self.id.clone(),
            });
        if let Some(segment) = self.init_segment.read().await.clone() {
            let _ = entry.connection.send_init_segment(segment);
        }
        Ok(entry.connection.clone())
    }

    pub async fn ban_ip(&self, ip: IpAddr) {
        self.banned_ips.write().await.insert(ip);
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned_ips.read().await.contains(&ip)
    }

    /// Stores the new bootstrap segment. Callers broadcast only after this
    /// returns so late joiners can never observe frames from the new epoch
    /// without a cached segment for it.
    pub async fn set_init_segment(&self, segment: Bytes) {
        *self.init_segment.write().await = Some(segment);
    }

    pub async fn init_segment(&self) -> Option<Bytes> {
        self.init_segment.read().await.clone()
    }

    /// Snapshot of approved viewer channels for fan-out. Pending viewers
    /// receive no frames until approved.
    pub async fn approved_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.viewers
            .read()
            .await
            .values()
            .filter(|v| v.state == ApprovalState::Approved)
            .map(|v| v.connection.clone())
            .collect()
    }

    pub async fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.viewers
            .read()
            .await
            .values()
            .map(|v| v.connection.clone())
            .collect()
    }

    pub async fn viewer_state(&self, conn_id: &str) -> Option<ApprovalState> {
        self.viewers.read().await.get(conn_id).map(|v| v.state)
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn viewer_ids(&self) -> Vec<ConnectionId> {
        self.viewers.read().await.keys().cloned().collect()
    }

    pub fn is_presenter(&self, conn_id: &str) -> bool {
        self.presenter_id == conn_id
    }
}
