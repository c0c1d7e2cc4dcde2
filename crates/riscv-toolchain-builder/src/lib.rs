pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod layout;
pub mod orchestrator;
pub mod plan;
pub mod profile;
pub mod progress;
pub mod repos;
pub mod report;
pub mod stages;
pub mod submodules;
pub mod telemetry;

pub use error::{Error, Result};
