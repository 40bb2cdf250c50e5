pub mod client;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod providers;
pub mod scheduler;
pub mod services;

pub use crate::client::{EngineParts, PersonaEngine};
pub use crate::config::Config;
pub use crate::error::{EngineError, Result};
pub use crate::services::chat::ChatOutcome;
pub use crate::services::gate::{Action, Authorization, DenialReason};
