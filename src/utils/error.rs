use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;

#[derive(Debug)]
pub enum Error {
    WebSocket(tokio_tungstenite::tungstenite::Error),
    Json(serde_json::Error),
    IO(std::io::Error),
    // Admission errors: rejected before any registry mutation.
    IpBlocked(IpAddr),
    RateLimited(IpAddr),
    // Room errors: recoverable, the connection stays open.
    RoomNotFound(String),
    RoomAlreadyExists(String),
    AccessDenied(String),
    Banned(String),
    RoomFull(String),
    InvalidRoomId(String),
    NotAuthorized(String),
    // Relay errors: fatal for the offending connection only.
    FrameTooLarge { size: usize, limit: usize },
    // Controller errors: logged by the control loop, never fatal to it.
    Producer(String),
    Connection(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::IO(e) => write!(f, "IO error: {}", e),
            Error::IpBlocked(ip) => write!(f, "IP {} is blocked", ip),
            Error::RateLimited(ip) => write!(f, "IP {} exceeded the action quota", ip),
            Error::RoomNotFound(id) => write!(f, "Room {} not found", id),
            Error::RoomAlreadyExists(id) => write!(f, "Room {} already exists", id),
            Error::AccessDenied(id) => write!(f, "Access to room {} denied", id),
            Error::Banned(id) => write!(f, "Banned from room {}", id),
            Error::RoomFull(id) => write!(f, "Room {} is full", id),
            Error::InvalidRoomId(id) => write!(f, "Invalid room id: {}", id),
            Error::NotAuthorized(what) => write!(f, "Not authorized: {}", what),
            Error::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {} bytes exceeds the {} byte limit", size, limit)
            }
            Error::Producer(e) => write!(f, "Producer error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e),
        }
    }
}

impl StdError for Error {}

impl Error {
    /// Stable machine-readable tag carried in `error` control messages.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::WebSocket(_) => "websocket",
            Error::Json(_) => "json",
            Error::IO(_) => "io",
            Error::IpBlocked(_) => "ip-blocked",
            Error::RateLimited(_) => "rate-limited",
            Error::RoomNotFound(_) => "room-not-found",
            Error::RoomAlreadyExists(_) => "room-already-exists",
            Error::AccessDenied(_) => "access-denied",
            Error::Banned(_) => "banned",
            Error::RoomFull(_) => "room-full",
            Error::InvalidRoomId(_) => "invalid-room-id",
            Error::NotAuthorized(_) => "not-authorized",
            Error::FrameTooLarge { .. } => "frame-too-large",
            Error::Producer(_) => "producer",
            Error::Connection(_) => "connection",
        }
    }

    /// Recoverable errors are reported on the control channel and the
    /// connection stays open; fatal ones tear the connection down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::Json(_)
                | Error::IO(_)
                | Error::IpBlocked(_)
                | Error::RateLimited(_)
                | Error::FrameTooLarge { .. }
                | Error::Connection(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
