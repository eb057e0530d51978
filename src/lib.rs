pub mod ai;
pub mod automation;
pub mod core;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod platforms;
pub mod store;

// --- Primary core exports ---
pub use core::config;
pub use core::types;
pub use core::types::*;
pub use error::MissionError;
pub use jobs::JobSystem;
