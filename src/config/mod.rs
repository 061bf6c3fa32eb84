//! Runtime Configuration
//!
//! Settings are loaded from a TOML file at startup and handed to each
//! component as an explicit snapshot.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `INREACH_COT_CONFIG` environment variable (path to TOML file)
//! 3. `config.toml` in the current working directory
//!
//! Unknown keys produce warnings with "did you mean?" suggestions; invalid
//! values are collected and reported together.

pub mod defaults;
mod settings;
pub mod validation;

pub use settings::*;
