use crate::admission::AdmissionControl;
use crate::auth::Authenticator;
use crate::quality::QualitySampler;
use crate::relay::{wire, RelayEngine};
use crate::room::{validate_room_id, ApprovalState, RoomRegistry};
use crate::signaling::connection::{ConnectionHandle, ConnectionRegistry};
use crate::signaling::messages::ControlMessage;
use crate::types::Role;
use crate::utils::{Error, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Dispatches inbound control and frame messages against the core
/// components. One instance serves every connection task.
pub struct MessageHandler {
    pub connections: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub relay: Arc<RelayEngine>,
    pub sampler: Arc<QualitySampler>,
    pub admission: Arc<AdmissionControl>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl MessageHandler {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        rooms: Arc<RoomRegistry>,
        relay: Arc<RelayEngine>,
        sampler: Arc<QualitySampler>,
        admission: Arc<AdmissionControl>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections,
            rooms,
            relay,
            sampler,
            admission,
            authenticator,
        })
    }

    pub async fn handle_message(
        &self,
        conn: &Arc<ConnectionHandle>,
        message: ControlMessage,
    ) -> Result<()> {
        match message {
            ControlMessage::CreateRoom {
                room_id,
                access_code,
                require_approval,
            } => {
                self.handle_create_room(conn, room_id, access_code, require_approval)
                    .await
            }
            ControlMessage::JoinRoom { room_id, password } => {
                self.handle_join_room(conn, room_id, password).await
            }
            ControlMessage::LeaveRoom => {
                self.rooms.leave_room(&conn.id).await;
                Ok(())
            }
            ControlMessage::ApproveViewer { target_conn_id } => {
                self.handle_approve(conn, &target_conn_id).await
            }
            ControlMessage::DenyViewer { target_conn_id } => {
                self.handle_deny(conn, &target_conn_id).await
            }
            ControlMessage::BanViewer { target_conn_id } => {
                self.handle_ban(conn, &target_conn_id).await
            }
            ControlMessage::Ping { client_timestamp } => {
                // Client-initiated ping: echo with our clock attached.
                conn.send_control(&ControlMessage::Pong {
                    client_timestamp,
                    server_timestamp: now_millis(),
                })
            }
            ControlMessage::Pong {
                client_timestamp, ..
            } => self.handle_pong(conn, client_timestamp).await,
            // Server-to-client messages arriving inbound are protocol noise.
            other => {
                debug!("Ignoring unexpected inbound message: {:?}", other);
                Ok(())
            }
        }
    }

    async fn handle_create_room(
        &self,
        conn: &Arc<ConnectionHandle>,
        room_id: String,
        access_code: Option<String>,
        require_approval: bool,
    ) -> Result<()> {
        self.admission.check_connection(conn.ip, "create-room").await?;
        validate_room_id(&room_id)?;
        self.ensure_identity(conn)?;

        conn.set_role(Role::Presenter);
        self.rooms
            .create_room(&room_id, conn.clone(), require_approval, access_code)
            .await?;
        conn.send_control(&ControlMessage::RoomCreated {
            room_id,
            conn_id: conn.id.clone(),
        })
    }

    async fn handle_join_room(
        &self,
        conn: &Arc<ConnectionHandle>,
        room_id: String,
        password: Option<String>,
    ) -> Result<()> {
        self.admission.check_connection(conn.ip, "join-room").await?;
        validate_room_id(&room_id)?;
        self.ensure_identity(conn)?;

        let (room, state) = self
            .rooms
            .join_room(&room_id, conn.clone(), password.as_deref())
            .await?;
        conn.set_role(Role::Viewer);

        match state {
            ApprovalState::Approved => {
                conn.send_control(&ControlMessage::RoomJoined {
                    room_id: room_id.clone(),
                    conn_id: conn.id.clone(),
                    viewer_count: room.viewer_count().await,
                })?;
                let _ = room.presenter.send_control(&ControlMessage::ViewerJoined {
                    room_id,
                    conn_id: conn.id.clone(),
                });
            }
            ApprovalState::Pending => {
                conn.send_control(&ControlMessage::ViewerPending {
                    room_id: room_id.clone(),
                    conn_id: conn.id.clone(),
                })?;
                let _ = room.presenter.send_control(&ControlMessage::ViewerPending {
                    room_id,
                    conn_id: conn.id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn handle_approve(&self, conn: &Arc<ConnectionHandle>, target: &str) -> Result<()> {
        let room_id = self.room_of(conn).await?;
        // The approval notice reaches the viewer from inside the room's
        // lock, ahead of its bootstrap bytes.
        self.rooms.approve_viewer(&room_id, &conn.id, target).await?;
        let _ = conn.send_control(&ControlMessage::ViewerJoined {
            room_id,
            conn_id: target.to_string(),
        });
        Ok(())
    }

    async fn handle_deny(&self, conn: &Arc<ConnectionHandle>, target: &str) -> Result<()> {
        let room_id = self.room_of(conn).await?;
        self.rooms.deny_viewer(&room_id, &conn.id, target).await
    }

    async fn handle_ban(&self, conn: &Arc<ConnectionHandle>, target: &str) -> Result<()> {
        let room_id = self.room_of(conn).await?;
        self.rooms.ban_viewer(&room_id, &conn.id, target).await
    }

    async fn handle_pong(&self, conn: &Arc<ConnectionHandle>, client_timestamp: u64) -> Result<()> {
        conn.note_pong();
        let rtt = now_millis().saturating_sub(client_timestamp);
        self.sampler.record_sample(&conn.id, rtt as f64).await;
        Ok(())
    }

    /// Opaque binary payloads are presenter frames: flag byte + payload.
    pub async fn handle_frame(&self, conn: &Arc<ConnectionHandle>, data: Vec<u8>) -> Result<()> {
        // Flag byte excluded from the payload bound.
        if data.len() > self.relay.max_frame_size() + 1 {
            return Err(Error::FrameTooLarge {
                size: data.len() - 1,
                limit: self.relay.max_frame_size(),
            });
        }
        if conn.role() != Some(Role::Presenter) {
            return Err(Error::NotAuthorized(
                "only the presenter sends frames".to_string(),
            ));
        }
        let room_id = self.room_of(conn).await?;
        let (is_init, payload) = wire::decode(&data)?;
        self.relay.on_presenter_frame(&room_id, payload, is_init).await
    }

    /// Single cleanup path for graceful disconnects, transport errors and
    /// kicks alike. Leaves nothing orphaned: room membership, quality
    /// history, the connection registry entry and the frame queue all go.
    pub async fn handle_disconnect(&self, conn: &Arc<ConnectionHandle>) {
        debug!("Cleaning up connection {}", conn.id);
        if conn.role() == Some(Role::Viewer) {
            if let Some(room_id) = self.rooms.room_of(&conn.id).await {
                self.relay.on_viewer_disconnect(&room_id, &conn.id).await;
            }
        }
        self.rooms.leave_room(&conn.id).await;
        self.sampler.unregister(&conn.id).await;
        self.connections.remove(&conn.id).await;
        conn.frames.close();
    }

    /// Reports a recoverable error on the control channel; fatal errors
    /// propagate so the connection task tears the socket down.
    pub async fn report_error(&self, conn: &Arc<ConnectionHandle>, error: &Error) {
        warn!("Connection {}: {}", conn.id, error);
        let _ = conn.send_control(&ControlMessage::error(error));
    }

    async fn room_of(&self, conn: &Arc<ConnectionHandle>) -> Result<String> {
        self.rooms
            .room_of(&conn.id)
            .await
            .ok_or_else(|| Error::NotAuthorized("not in a room".to_string()))
    }

    fn ensure_identity(&self, conn: &Arc<ConnectionHandle>) -> Result<()> {
        if conn.identity().is_some() {
            return Ok(());
        }
        match self.authenticator.authenticate(&conn.id, None) {
            Some(identity) => {
                conn.set_identity(identity);
                Ok(())
            }
            None => Err(Error::NotAuthorized("authentication refused".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryBlockStore;
    use crate::audit::MemoryAuditSink;
    use crate::auth::AllowAllAuthenticator;
    use crate::config::ServerConfig;
    use crate::signaling::connection::test_support::handle_with_receiver;
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::Message;

    fn handler() -> Arc<MessageHandler> {
        let config = ServerConfig::default();
        let audit = MemoryAuditSink::new(256);
        let rooms = RoomRegistry::new(config.max_viewers_per_room, audit.clone());
        let relay = RelayEngine::new(rooms.clone(), config.max_frame_size);
        let sampler = QualitySampler::new(config.quality.clone());
        let admission = Arc::new(AdmissionControl::new(
            &config.admission,
            MemoryBlockStore::new(),
            audit,
        ));
        MessageHandler::new(
            ConnectionRegistry::new(),
            rooms,
            relay,
            sampler,
            admission,
            Arc::new(AllowAllAuthenticator),
        )
    }

    async fn connect(
        handler: &MessageHandler,
        id: &str,
    ) -> (Arc<ConnectionHandle>, UnboundedReceiver<Message>) {
        let (conn, rx) = handle_with_receiver(id, 16);
        handler.connections.register(conn.clone()).await;
        handler.sampler.register(id).await;
        (conn, rx)
    }

    fn next_text(rx: &mut UnboundedReceiver<Message>) -> String {
        loop {
            match rx.try_recv().expect("expected an outbound message") {
                Message::Text(json) => return json,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn create_join_and_frame_flow() {
        let handler = handler();
        let (presenter, mut prx) = connect(&handler, "p1").await;
        handler
            .handle_message(
                &presenter,
                ControlMessage::CreateRoom {
                    room_id: "demo".to_string(),
                    access_code: None,
                    require_approval: false,
                },
            )
            .await
            .unwrap();
        assert!(next_text(&mut prx).contains("room-created"));

        let (viewer, mut vrx) = connect(&handler, "v1").await;
        handler
            .handle_message(
                &viewer,
                ControlMessage::JoinRoom {
                    room_id: "demo".to_string(),
                    password: None,
                },
            )
            .await
            .unwrap();
        assert!(next_text(&mut vrx).contains("room-joined"));
        assert!(next_text(&mut prx).contains("viewer-joined"));

        let frame = wire::encode(&Bytes::from_static(b"payload"), false);
        handler.handle_frame(&presenter, frame).await.unwrap();
        assert_eq!(
            viewer.frames.pop().await.unwrap(),
            Bytes::from_static(b"payload")
        );
    }

    #[tokio::test]
    async fn viewers_may_not_send_frames() {
        let handler = handler();
        let (presenter, _prx) = connect(&handler, "p1").await;
        handler
            .handle_message(
                &presenter,
                ControlMessage::CreateRoom {
                    room_id: "demo".to_string(),
                    access_code: None,
                    require_approval: false,
                },
            )
            .await
            .unwrap();
        let (viewer, _vrx) = connect(&handler, "v1").await;
        handler
            .handle_message(
                &viewer,
                ControlMessage::JoinRoom {
                    room_id: "demo".to_string(),
                    password: None,
                },
            )
            .await
            .unwrap();

        let frame = wire::encode(&Bytes::from_static(b"rogue"), false);
        let err = handler.handle_frame(&viewer, frame).await.unwrap_err();
        assert_eq!(err.error_type(), "not-authorized");
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn invalid_room_id_is_reported_before_any_mutation() {
        let handler = handler();
        let (presenter, _prx) = connect(&handler, "p1").await;
        let err = handler
            .handle_message(
                &presenter,
                ControlMessage::CreateRoom {
                    room_id: "not valid!".to_string(),
                    access_code: None,
                    require_approval: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "invalid-room-id");
        assert_eq!(handler.rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn pong_feeds_the_quality_sampler() {
        let handler = handler();
        let (conn, _rx) = connect(&handler, "c1").await;
        let sent_at = now_millis().saturating_sub(42);
        handler
            .handle_message(
                &conn,
                ControlMessage::Pong {
                    client_timestamp: sent_at,
                    server_timestamp: now_millis(),
                },
            )
            .await
            .unwrap();
        let reports = handler.sampler.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].assessment_count, 1);
    }

    #[tokio::test]
    async fn disconnect_cleans_every_registry() {
        let handler = handler();
        let (presenter, _prx) = connect(&handler, "p1").await;
        handler
            .handle_message(
                &presenter,
                ControlMessage::CreateRoom {
                    room_id: "demo".to_string(),
                    access_code: None,
                    require_approval: false,
                },
            )
            .await
            .unwrap();
        let (viewer, _vrx) = connect(&handler, "v1").await;
        handler
            .handle_message(
                &viewer,
                ControlMessage::JoinRoom {
                    room_id: "demo".to_string(),
                    password: None,
                },
            )
            .await
            .unwrap();

        handler.handle_disconnect(&viewer).await;
        assert!(handler.connections.get("v1").await.is_none());
        assert!(handler.sampler.level_of("v1").await.is_none());
        assert_eq!(handler.rooms.viewer_count("demo").await.unwrap(), 0);

        // Presenter disconnect destroys the room as well.
        handler.handle_disconnect(&presenter).await;
        assert_eq!(handler.rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn blocked_ip_cannot_create_rooms() {
        let handler = handler();
        let (conn, _rx) = connect(&handler, "p1").await;
        handler.admission.block_ip(conn.ip, 10, "test").await;
        let err = handler
            .handle_message(
                &conn,
                ControlMessage::CreateRoom {
                    room_id: "demo".to_string(),
                    access_code: None,
                    require_approval: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "ip-blocked");
        assert!(err.is_fatal());
        assert_eq!(handler.rooms.room_count().await, 0);
    }
}
