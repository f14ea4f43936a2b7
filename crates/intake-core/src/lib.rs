pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::IntakeConfig;
pub use error::{IntakeError, Result};
pub use events::{JobEnvelope, JobEvent};
pub use types::*;
