pub mod session_manager;
pub mod tracing;

pub use session_manager::SessionManager;
pub use tracing::setup_tracing;
