pub mod registry;
pub mod state;

pub use registry::{validate_room_id, RoomRegistry};
pub use state::{ApprovalState, Room, ViewerEntry};
