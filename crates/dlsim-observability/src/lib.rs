// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # dlsim-observability
//!
//! Logging and profiling infrastructure shared by the dlsim crates.
//!
//! ## Features
//! - `file-logging`: per-run log folders with rotation and retention
//! - `profiling`: Chrome trace capture (`chrome://tracing`, Perfetto)

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod config;
pub mod init;
#[cfg(feature = "profiling")]
pub mod profiling;

pub use cli::*;
pub use config::*;
pub use init::*;
#[cfg(feature = "profiling")]
pub use profiling::{with_chrome_trace, ProfileError};

/// Known dlsim crate names for debug flags
pub const KNOWN_CRATES: &[&str] = &[
    "dlsim",
    "dlsim-config",
    "dlsim-model",
    "dlsim-engine",
    "dlsim-observability",
];
