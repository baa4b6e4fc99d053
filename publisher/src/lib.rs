//! Local bot-runtime publisher
//!
//! Packages a bot project into a versioned snapshot, provisions and builds a
//! runtime for it, and runs that runtime as a separate local server process
//! whose status the rest of the application polls.

pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod port;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod supervisor;

pub use error::{PublishError, Result};
pub use orchestrator::PublishOrchestrator;
pub use state::AppState;
