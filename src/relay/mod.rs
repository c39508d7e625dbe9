//! Presenter-to-viewers frame fan-out with bounded per-viewer memory.

pub mod queue;

use crate::room::{Room, RoomRegistry};
use crate::signaling::connection::ConnectionHandle;
use crate::utils::{Error, Result};
use bytes::Bytes;
use log::{debug, trace};
use std::sync::Arc;

/// Binary frame layout on the wire: one flag byte, then the opaque payload.
pub mod wire {
    use super::*;

    pub const FLAG_LIVE: u8 = 0x00;
    pub const FLAG_INIT_SEGMENT: u8 = 0x01;

    pub fn encode(payload: &Bytes, is_init: bool) -> Vec<u8> {
        let flag = if is_init { FLAG_INIT_SEGMENT } else { FLAG_LIVE };
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(flag);
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(data: &[u8]) -> Result<(bool, Bytes)> {
        match data.split_first() {
            Some((&FLAG_INIT_SEGMENT, payload)) => Ok((true, Bytes::copy_from_slice(payload))),
            Some((&FLAG_LIVE, payload)) => Ok((false, Bytes::copy_from_slice(payload))),
            Some((flag, _)) => Err(Error::Connection(format!("unknown frame flag {:#x}", flag))),
            None => Err(Error::Connection("empty binary frame".to_string())),
        }
    }
}

pub struct RelayEngine {
    registry: Arc<RoomRegistry>,
    max_frame_size: usize,
}

impl RelayEngine {
    pub fn new(registry: Arc<RoomRegistry>, max_frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            max_frame_size,
        })
    }

    /// Fans one presenter frame out to every approved viewer. Init segments
    /// are cached on the room before the broadcast and travel outside the
    /// bounded queues; live frames go through each viewer's drop-oldest
    /// queue so no viewer can stall the presenter or its peers.
    pub async fn on_presenter_frame(
        &self,
        room_id: &str,
        payload: Bytes,
        is_init_segment: bool,
    ) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: payload.len(),
                limit: self.max_frame_size,
            });
        }
        let room = self.registry.get_room(room_id).await?;

        if is_init_segment {
            room.set_init_segment(payload.clone()).await;
            debug!(
                "Cached init segment for room {} ({} bytes)",
                room_id,
                payload.len()
            );
            for viewer in room.approved_connections().await {
                let _ = viewer.send_init_segment(payload.clone());
            }
            metrics::increment_counter!("relay_init_segments");
        } else {
            let viewers = room.approved_connections().await;
            trace!(
                "Relaying {} byte frame to {} viewers in room {}",
                payload.len(),
                viewers.len(),
                room_id
            );
            for viewer in viewers {
                viewer.enqueue_frame(payload.clone());
            }
            metrics::increment_counter!("relay_frames");
        }
        Ok(())
    }

    /// Viewer-side failures are local: drop the membership and release the
    /// queue, nothing else is touched.
    pub async fn on_viewer_disconnect(&self, room_id: &str, conn_id: &str) {
        if let Ok(room) = self.registry.get_room(room_id).await {
            if let Some(entry) = room.remove_viewer(conn_id).await {
                entry.connection.frames.close();
            }
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::room::ApprovalState;
    use crate::signaling::connection::test_support::handle_with_receiver;
    use tokio_tungstenite::tungstenite::Message;

    async fn room_with_presenter(
        registry: &RoomRegistry,
        room_id: &str,
    ) -> (
        Arc<crate::room::Room>,
        tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) {
        let (presenter, rx) = handle_with_receiver("presenter", 8);
        let room = registry
            .create_room(room_id, presenter, false, None)
            .await
            .unwrap();
        (room, rx)
    }

    fn engine(max_frame: usize) -> (Arc<RoomRegistry>, Arc<RelayEngine>) {
        let registry = RoomRegistry::new(100, MemoryAuditSink::new(64));
        let engine = RelayEngine::new(registry.clone(), max_frame);
        (registry, engine)
    }

    #[tokio::test]
    async fn frames_reach_all_viewers_in_order() {
        let (registry, engine) = engine(1024);
        let (_room, _prx) = room_with_presenter(&registry, "r1").await;

        let (v1, _rx1) = handle_with_receiver("v1", 16);
        let (v2, _rx2) = handle_with_receiver("v2", 16);
        registry.join_room("r1", v1.clone(), None).await.unwrap();
        registry.join_room("r1", v2.clone(), None).await.unwrap();

        for i in 0u8..5 {
            engine
                .on_presenter_frame("r1", Bytes::from(vec![i]), false)
                .await
                .unwrap();
        }
        for viewer in [&v1, &v2] {
            for i in 0u8..5 {
                let frame = viewer.frames.pop().await.unwrap();
                assert_eq!(frame, Bytes::from(vec![i]));
            }
        }
    }

    #[tokio::test]
    async fn slow_viewer_keeps_the_most_recent_frames() {
        let (registry, engine) = engine(1024);
        let (_room, _prx) = room_with_presenter(&registry, "r1").await;

        let capacity = 4;
        let (slow, _rx) = handle_with_receiver("slow", capacity);
        registry.join_room("r1", slow.clone(), None).await.unwrap();

        let total = capacity + 3;
        for i in 0..total {
            engine
                .on_presenter_frame("r1", Bytes::from(vec![i as u8]), false)
                .await
                .unwrap();
        }
        // Exactly the newest `capacity` frames survive, oldest dropped.
        assert_eq!(slow.frames.len(), capacity);
        for i in (total - capacity)..total {
            assert_eq!(slow.frames.pop().await.unwrap(), Bytes::from(vec![i as u8]));
        }
    }

    #[tokio::test]
    async fn late_joiner_receives_init_segment_first() {
        let (registry, engine) = engine(1024);
        let (room, _prx) = room_with_presenter(&registry, "r1").await;

        engine
            .on_presenter_frame("r1", Bytes::from_static(b"bootstrap"), true)
            .await
            .unwrap();
        assert_eq!(
            room.init_segment().await,
            Some(Bytes::from_static(b"bootstrap"))
        );
        engine
            .on_presenter_frame("r1", Bytes::from_static(b"frame-before-join"), false)
            .await
            .unwrap();

        let (late, mut rx) = handle_with_receiver("late", 16);
        registry.join_room("r1", late.clone(), None).await.unwrap();
        engine
            .on_presenter_frame("r1", Bytes::from_static(b"frame-after-join"), false)
            .await
            .unwrap();

        // First delivery on the unbounded path is the cached init segment.
        match rx.recv().await.unwrap() {
            Message::Binary(data) => {
                let (is_init, payload) = wire::decode(&data).unwrap();
                assert!(is_init);
                assert_eq!(&payload[..], b"bootstrap");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Live frames start strictly after the join.
        assert_eq!(
            late.frames.pop().await.unwrap(),
            Bytes::from_static(b"frame-after-join")
        );
    }

    #[tokio::test]
    async fn pending_viewers_receive_no_frames() {
        let registry = RoomRegistry::new(100, MemoryAuditSink::new(64));
        let engine = RelayEngine::new(registry.clone(), 1024);
        let (presenter, _prx) = handle_with_receiver("p", 8);
        registry
            .create_room("gated", presenter, true, None)
            .await
            .unwrap();
        let (pending, _rx) = handle_with_receiver("v", 8);
        let (room, state) = registry.join_room("gated", pending.clone(), None).await.unwrap();
        assert_eq!(state, ApprovalState::Pending);

        engine
            .on_presenter_frame("gated", Bytes::from_static(b"seg"), true)
            .await
            .unwrap();
        engine
            .on_presenter_frame("gated", Bytes::from_static(b"live"), false)
            .await
            .unwrap();
        assert!(pending.frames.is_empty());

        // Approval bootstraps the viewer with the cached segment.
        let approved = registry.approve_viewer("gated", "p", "v").await.unwrap();
        assert_eq!(room.viewer_state("v").await, Some(ApprovalState::Approved));
        engine
            .on_presenter_frame("gated", Bytes::from_static(b"live-2"), false)
            .await
            .unwrap();
        assert_eq!(approved.frames.pop().await.unwrap(), Bytes::from_static(b"live-2"));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (registry, engine) = engine(16);
        let (_room, _prx) = room_with_presenter(&registry, "r1").await;
        let err = engine
            .on_presenter_frame("r1", Bytes::from(vec![0u8; 17]), false)
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "frame-too-large");
        assert!(err.is_fatal());
    }

    #[test]
    fn wire_format_round_trips() {
        let payload = Bytes::from_static(b"opaque-bytes");
        let (is_init, decoded) = wire::decode(&wire::encode(&payload, true)).unwrap();
        assert!(is_init);
        assert_eq!(decoded, payload);
        let (is_init, _) = wire::decode(&wire::encode(&payload, false)).unwrap();
        assert!(!is_init);
        assert!(wire::decode(&[]).is_err());
        assert!(wire::decode(&[0x7f, 1, 2]).is_err());
    }
}
