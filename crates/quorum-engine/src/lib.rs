pub mod deliberation;
pub mod error;
pub mod memory;
pub mod moderator;
pub mod registry;
pub mod runner;

pub use deliberation::{DeliberationResult, DeliberationService, Outcome};
pub use error::{DeliberationError, EngineError};
pub use registry::ToolRegistry;
pub use runner::ExpertRunner;
