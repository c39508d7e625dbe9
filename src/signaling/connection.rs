use crate::auth::Identity;
use crate::relay::queue::FrameQueue;
use crate::relay::wire;
use crate::signaling::messages::ControlMessage;
use crate::types::{ConnectionId, Role};
use crate::utils::{Error, Result};
use bytes::Bytes;
use log::debug;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Server-side handle for one live connection. Control messages and init
/// segments travel on the unbounded outbound channel; live frames go
/// through the bounded drop-oldest queue so a slow viewer only sheds its
/// own frames.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub ip: IpAddr,
    outbound: mpsc::UnboundedSender<Message>,
    pub frames: Arc<FrameQueue>,
    role: SyncRwLock<Option<Role>>,
    identity: SyncRwLock<Option<Identity>>,
    last_pong_at: SyncRwLock<std::time::Instant>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        ip: IpAddr,
        outbound: mpsc::UnboundedSender<Message>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ip,
            outbound,
            frames: Arc::new(FrameQueue::new(queue_capacity)),
            role: SyncRwLock::new(None),
            identity: SyncRwLock::new(None),
            last_pong_at: SyncRwLock::new(std::time::Instant::now()),
        })
    }

    pub fn note_pong(&self) {
        *self.last_pong_at.write() = std::time::Instant::now();
    }

    pub fn since_last_pong(&self) -> std::time::Duration {
        self.last_pong_at.read().elapsed()
    }

    pub fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| Error::Connection(format!("connection {} is gone", self.id)))
    }

    /// Init segments bypass the bounded frame queue: they are bootstrap
    /// state, never shed under backpressure.
    pub fn send_init_segment(&self, payload: Bytes) -> Result<()> {
        self.outbound
            .send(Message::Binary(wire::encode(&payload, true)))
            .map_err(|_| Error::Connection(format!("connection {} is gone", self.id)))
    }

    /// Non-blocking live-frame enqueue; overflow sheds this viewer's oldest
    /// queued frames only.
    pub fn enqueue_frame(&self, payload: Bytes) {
        self.frames.push(payload);
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write() = Some(role);
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.read()
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.username.clone())
    }

    /// Tells the client why it is going away, then closes the outbound path.
    /// Dropping the outbound sender ends the writer task, which closes the
    /// socket; the frame queue is released so no pop() waiter leaks.
    pub fn close(&self, reason: &str) {
        let _ = self.send_control(&ControlMessage::Disconnected {
            reason: reason.to_string(),
        });
        let _ = self.outbound.send(Message::Close(None));
        self.frames.close();
        debug!("Closed connection {} ({})", self.id, reason);
    }
}

/// Registry of all live connections, keyed by connection id. The equivalent
/// of the handler's websocket sender map, but owned and injected rather
/// than ambient.
pub struct ConnectionRegistry {
    connections: tokio::sync::RwLock<HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections
            .write()
            .await
            .insert(handle.id.clone(), handle);
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn presenters(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.role() == Some(Role::Presenter))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a handle whose outbound messages land in the returned receiver.
    pub fn handle_with_receiver(
        id: &str,
        queue_capacity: usize,
    ) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(
            id.to_string(),
            IpAddr::from([127, 0, 0, 1]),
            tx,
            queue_capacity,
        );
        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::handle_with_receiver;
    use super::*;

    #[tokio::test]
    async fn control_messages_reach_the_outbound_channel() {
        let (handle, mut rx) = handle_with_receiver("c1", 4);
        handle
            .send_control(&ControlMessage::Disconnected {
                reason: "test".to_string(),
            })
            .unwrap();
        match rx.recv().await.unwrap() {
            Message::Text(json) => assert!(json.contains("disconnected")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn init_segments_bypass_the_frame_queue() {
        let (handle, mut rx) = handle_with_receiver("c2", 1);
        // Saturate the bounded queue first.
        handle.enqueue_frame(Bytes::from_static(b"live-1"));
        handle.enqueue_frame(Bytes::from_static(b"live-2"));
        handle.send_init_segment(Bytes::from_static(b"init")).unwrap();

        // The init segment is on the unbounded path regardless of queue state.
        match rx.recv().await.unwrap() {
            Message::Binary(data) => {
                let (is_init, payload) = wire::decode(&data).unwrap();
                assert!(is_init);
                assert_eq!(&payload[..], b"init");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // And the queue kept only the most recent live frame.
        assert_eq!(handle.frames.len(), 1);
    }

    #[tokio::test]
    async fn send_after_close_reports_connection_gone() {
        let (handle, rx) = handle_with_receiver("c3", 4);
        drop(rx);
        let err = handle
            .send_control(&ControlMessage::LeaveRoom)
            .unwrap_err();
        assert_eq!(err.error_type(), "connection");
    }
}
