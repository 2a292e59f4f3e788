pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod tools;

pub use config::{ControllerConfig, StagePrompts, StartupError};
pub use error::PipelineError;
pub use pipeline::{Controller, SummaryService};
