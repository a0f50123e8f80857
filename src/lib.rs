pub mod calls;
pub mod config;
pub mod types;

pub use calls::{CallCoordinator, CallError, CallSessionDriver, SignalingHandler};
pub use config::CallConfig;
pub use types::events::CallEventBus;
