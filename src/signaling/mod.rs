pub mod connection;
pub mod handler;
pub mod messages;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use handler::MessageHandler;
pub use messages::ControlMessage;
pub use server::SignalingServer;
