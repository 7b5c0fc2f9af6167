//! AVD Demon Library
//!
//! Command-line and headless frontends over the `avdemon-app` engine.

pub mod cli;
pub mod headless;
pub mod output;

// Re-export main entry points
pub use headless::runner::run_headless;
