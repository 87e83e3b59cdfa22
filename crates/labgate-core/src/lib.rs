pub mod config;
pub mod error;
pub mod id;

// Re-export commonly used types
pub use config::ArbitrationConfig;
pub use error::ArbitrationError;
pub use id::{EquipmentId, SessionId};
