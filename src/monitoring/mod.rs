pub mod dashboard;

pub use dashboard::{run_status_server, StatusContext};
