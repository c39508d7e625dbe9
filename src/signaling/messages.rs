use crate::types::StreamingParameters;
use serde::{Deserialize, Serialize};

/// Control messages exchanged on the text channel of a session connection.
/// Binary websocket messages carry frame payloads and are not represented
/// here (see `relay::wire`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    // Client -> server
    CreateRoom {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        access_code: Option<String>,
        #[serde(default)]
        require_approval: bool,
    },
    JoinRoom {
        room_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    LeaveRoom,
    ApproveViewer {
        target_conn_id: String,
    },
    DenyViewer {
        target_conn_id: String,
    },
    BanViewer {
        target_conn_id: String,
    },
    Ping {
        client_timestamp: u64,
    },
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },

    // Server -> client
    RoomCreated {
        room_id: String,
        conn_id: String,
    },
    RoomJoined {
        room_id: String,
        conn_id: String,
        viewer_count: usize,
    },
    ViewerPending {
        room_id: String,
        conn_id: String,
    },
    ViewerJoined {
        room_id: String,
        conn_id: String,
    },
    ViewerApproved {
        room_id: String,
    },
    ViewerLeft {
        room_id: String,
        conn_id: String,
    },
    Reconfigure {
        bitrate_bps: u32,
        frame_rate_fps: u32,
        resolution_scale: f32,
    },
    Error {
        error_type: String,
        description: String,
    },
    Disconnected {
        reason: String,
    },
}

impl ControlMessage {
    pub fn error(err: &crate::utils::Error) -> Self {
        ControlMessage::Error {
            error_type: err.error_type().to_string(),
            description: err.to_string(),
        }
    }

    pub fn reconfigure(params: StreamingParameters) -> Self {
        ControlMessage::Reconfigure {
            bitrate_bps: params.bitrate_bps,
            frame_rate_fps: params.frame_rate_fps,
            resolution_scale: params.resolution_scale,
        }
    }
}

/// Reasons attached to server-initiated disconnects.
pub mod disconnect_reason {
    pub const PRESENTER_LEFT: &str = "presenter-left";
    pub const BANNED: &str = "banned";
    pub const DENIED: &str = "denied";
    pub const PROTOCOL_ERROR: &str = "protocol-error";
}
