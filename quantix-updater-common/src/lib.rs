//! # Quantix Updater Common
//!
//! Shared utilities for hosts that embed the Quantix updater.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use quantix_updater_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(state = "downloading_package", "Update progressing");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
