pub mod engine;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod queue;
pub mod run;
pub mod supervisor;
pub mod translate;

pub use engine::Engine;
pub use error::{Result, RunnerError};
