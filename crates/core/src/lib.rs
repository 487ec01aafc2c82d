pub mod capture;
pub mod catalogue;
pub mod diag;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod loader;
pub mod logger;
pub mod platform;
pub mod preset;
pub mod runtime;
pub mod settings;
pub mod sim;
pub mod sleep;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalogue::Catalogue;
pub use engine::{Engine, EngineStatus, RunState, StopReason};
pub use error::{EngineError, LoadError};
pub use preset::{validate_preset, PresetDoc, ValidationReport};
pub use settings::Settings;
