pub mod adaptation;
pub mod admission;
pub mod audit;
pub mod auth;
pub mod config;
pub mod monitoring;
pub mod quality;
pub mod relay;
pub mod room;
pub mod signaling;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use adaptation::AdaptiveController;
pub use config::ServerConfig;
pub use relay::RelayEngine;
pub use room::RoomRegistry;
pub use signaling::SignalingServer;
