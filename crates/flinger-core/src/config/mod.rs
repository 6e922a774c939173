//! Engine configuration
//!
//! - [`EngineConfig`]: timing and retry knobs shared by every worker thread
//! - [`load_config`] / [`save_config`]: generic YAML persistence

mod engine;
mod io;

pub use engine::EngineConfig;
pub use io::{load_config, save_config};
