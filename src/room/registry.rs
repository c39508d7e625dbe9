use super::state::{ApprovalState, Room};
use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::signaling::connection::ConnectionHandle;
use crate::signaling::messages::{disconnect_reason, ControlMessage};
use crate::types::ConnectionId;
use crate::utils::{Error, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Room ids are letters, digits, hyphen or underscore, 1 to 64 characters.
pub fn validate_room_id(room_id: &str) -> Result<()> {
    let valid_len = (1..=64).contains(&room_id.len());
    let valid_chars = room_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(Error::InvalidRoomId(room_id.to_string()))
    }
}

/// Owns every room's lifecycle. Passed by handle to the components that
/// need it; nothing here is a process-global.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Reverse index answering "which room is connection X in" without
    /// back-pointers from viewer entries to rooms.
    membership: RwLock<HashMap<ConnectionId, String>>,
    max_viewers_per_room: usize,
    audit: Arc<dyn AuditSink>,
}

impl RoomRegistry {
    pub fn new(max_viewers_per_room: usize, audit: Arc<dyn AuditSink>) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            membership: RwLock::new(HashMap::new()),
            max_viewers_per_room,
            audit,
        })
    }

    /// Registers a new room with `presenter` as its single presenter.
    /// Callers validate the room id first; the registry assumes it is clean.
    pub async fn create_room(
        &self,
        room_id: &str,
        presenter: Arc<ConnectionHandle>,
        require_approval: bool,
        access_code: Option<String>,
    ) -> Result<Arc<Room>> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(room_id) {
            return Err(Error::RoomAlreadyExists(room_id.to_string()));
        }
        let room = Room::new(
            room_id.to_string(),
            presenter.clone(),
            require_approval,
            access_code,
        );
        rooms.insert(room_id.to_string(), room.clone());
        drop(rooms);

        self.membership
            .write()
            .await
            .insert(presenter.id.clone(), room_id.to_string());

        info!("Room {} created by {}", room_id, presenter.id);
        metrics::increment_counter!("rooms_created");
        self.record(
            AuditEvent::new("room-created", Severity::Info)
                .room(room_id)
                .session(&presenter.id)
                .ip(presenter.ip),
            presenter.username(),
        )
        .await;
        Ok(room)
    }

    /// Adds a viewer, returning the room and the approval state it entered
    /// with. `Pending` means the presenter must approve before frames flow.
    pub async fn join_room(
        &self,
        room_id: &str,
        viewer: Arc<ConnectionHandle>,
        password: Option<&str>,
    ) -> Result<(Arc<Room>, ApprovalState)> {
        let room = self.get_room(room_id).await?;

        if room.is_banned(viewer.ip).await {
            return Err(Error::Banned(room_id.to_string()));
        }
        // Access-code comparison stands in for the external credential check.
        if let Some(code) = &room.access_code {
            if password != Some(code.as_str()) {
                self.record(
                    AuditEvent::new("join-denied", Severity::Warning)
                        .room(room_id)
                        .session(&viewer.id)
                        .ip(viewer.ip)
                        .details("bad access code"),
                    viewer.username(),
                )
                .await;
                return Err(Error::AccessDenied(room_id.to_string()));
            }
        }
        if room.viewer_count().await >= self.max_viewers_per_room {
            return Err(Error::RoomFull(room_id.to_string()));
        }

        let state = if room.require_approval {
            ApprovalState::Pending
        } else {
            ApprovalState::Approved
        };
        room.add_viewer(viewer.clone(), state).await;
        self.membership
            .write()
            .await
            .insert(viewer.id.clone(), room_id.to_string());

        debug!("Viewer {} joined room {} ({:?})", viewer.id, room_id, state);
        metrics::increment_counter!("viewers_joined");
        self.record(
            AuditEvent::new("viewer-joined", Severity::Info)
                .room(room_id)
                .session(&viewer.id)
                .ip(viewer.ip)
                .details(format!("{:?}", state)),
            viewer.username(),
        )
        .await;
        Ok((room, state))
    }

    /// Presenter-only: flips a pending viewer to approved.
    pub async fn approve_viewer(
        &self,
        room_id: &str,
        presenter_id: &str,
        target: &str,
    ) -> Result<Arc<ConnectionHandle>> {
        let room = self.get_room(room_id).await?;
        self.require_presenter(&room, presenter_id)?;
        let connection = room.approve_viewer(target).await?;
        self.record(
            AuditEvent::new("viewer-approved", Severity::Info)
                .room(room_id)
                .session(target),
            None,
        )
        .await;
        Ok(connection)
    }

    /// Presenter-only: rejects a pending viewer and disconnects it.
    pub async fn deny_viewer(&self, room_id: &str, presenter_id: &str, target: &str) -> Result<()> {
        let room = self.get_room(room_id).await?;
        self.require_presenter(&room, presenter_id)?;
        if let Some(entry) = room.remove_viewer(target).await {
            self.membership.write().await.remove(target);
            entry.connection.close(disconnect_reason::DENIED);
        }
        self.record(
            AuditEvent::new("viewer-denied", Severity::Info)
                .room(room_id)
                .session(target),
            None,
        )
        .await;
        Ok(())
    }

    /// Presenter-only: removes a viewer, disconnects it and bars its IP from
    /// rejoining this room.
    pub async fn ban_viewer(&self, room_id: &str, presenter_id: &str, target: &str) -> Result<()> {
        let room = self.get_room(room_id).await?;
        self.require_presenter(&room, presenter_id)?;
        if let Some(entry) = room.remove_viewer(target).await {
            self.membership.write().await.remove(target);
            room.ban_ip(entry.connection.ip).await;
            entry.connection.close(disconnect_reason::BANNED);
            self.record(
                AuditEvent::new("viewer-banned", Severity::Warning)
                    .room(room_id)
                    .session(target)
                    .ip(entry.connection.ip),
                None,
            )
            .await;
        }
        Ok(())
    }

    /// Idempotent. A presenter leaving destroys the room and disconnects
    /// every viewer; a viewer leaving only removes itself.
    pub async fn leave_room(&self, conn_id: &str) {
        let room_id = match self.membership.write().await.remove(conn_id) {
            Some(room_id) => room_id,
            None => return,
        };
        let room = match self.rooms.read().await.get(&room_id).cloned() {
            Some(room) => room,
            None => return,
        };

        if room.is_presenter(conn_id) {
            self.destroy_room(&room).await;
        } else {
            room.remove_viewer(conn_id).await;
            let _ = room.presenter.send_control(&ControlMessage::ViewerLeft {
                room_id: room_id.clone(),
                conn_id: conn_id.to_string(),
            });
            debug!("Viewer {} left room {}", conn_id, room_id);
            self.record(
                AuditEvent::new("viewer-left", Severity::Info)
                    .room(&room_id)
                    .session(conn_id),
                None,
            )
            .await;
        }
    }

    async fn destroy_room(&self, room: &Arc<Room>) {
        self.rooms.write().await.remove(&room.id);
        let viewers = room.all_connections().await;
        {
            let mut membership = self.membership.write().await;
            for viewer in &viewers {
                membership.remove(&viewer.id);
            }
        }
        for viewer in viewers {
            viewer.close(disconnect_reason::PRESENTER_LEFT);
        }
        info!("Room {} destroyed (presenter left)", room.id);
        metrics::increment_counter!("rooms_destroyed");
        self.record(
            AuditEvent::new("room-destroyed", Severity::Info)
                .room(&room.id)
                .session(&room.presenter_id),
            None,
        )
        .await;
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Arc<Room>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))
    }

    /// Which room is connection X in, via the reverse index.
    pub async fn room_of(&self, conn_id: &str) -> Option<String> {
        self.membership.read().await.get(conn_id).cloned()
    }

    pub async fn viewer_count(&self, room_id: &str) -> Result<usize> {
        Ok(self.get_room(room_id).await?.viewer_count().await)
    }

    pub async fn list_viewers(&self, room_id: &str) -> Result<Vec<ConnectionId>> {
        Ok(self.get_room(room_id).await?.viewer_ids().await)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// (room id, viewer count) snapshot for the status surface.
    pub async fn snapshot(&self) -> Vec<(String, usize)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            out.push((room.id.clone(), room.viewer_count().await));
        }
        out
    }

    fn require_presenter(&self, room: &Room, conn_id: &str) -> Result<()> {
        if room.is_presenter(conn_id) {
            Ok(())
        } else {
            warn!(
                "Connection {} attempted a presenter action on room {}",
                conn_id, room.id
            );
            Err(Error::NotAuthorized(format!(
                "only the presenter may manage room {}",
                room.id
            )))
        }
    }

    async fn record(&self, mut event: AuditEvent, username: Option<String>) {
        event.username = username;
        self.audit.record(event).await;
    }
}
