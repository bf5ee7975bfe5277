pub mod config;
pub mod environment;
pub mod error;
pub mod types;

pub use config::ShiftConfig;
pub use environment::EnvironmentRef;
pub use error::{CoreError, CoreResult};
pub use types::*;
