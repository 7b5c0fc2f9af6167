//! # avdemon-core - Core Domain Types
//!
//! Foundation crate for AVD Demon. Provides domain types, error handling and
//! logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, regex, tracing).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`AvdImage`] - An enumerated virtual device image and its metadata
//! - [`MetadataSource`] - Which fallback produced an image's metadata
//! - [`TransitionIntent`] - A start or stop in flight for one image
//! - [`LifecyclePhase`] - Stopped / Starting / Running / Stopping
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use avdemon_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, Result, ResultExt};
pub use types::{
    is_valid_avd_name, AvdImage, LifecyclePhase, MetadataSource, TransitionIntent,
    DEFAULT_TARGET, UNKNOWN_API_LEVEL, UNKNOWN_DEVICE,
};
