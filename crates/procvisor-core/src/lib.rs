//! procvisor core - platform-independent process supervision types
//!
//! This crate provides the process description and state types, configuration and error
//! types, and the termination trait shared by the platform crates.

pub mod config;
pub mod error;
pub mod process;
pub mod spec;

pub use config::*;
pub use error::*;
pub use process::*;
pub use spec::*;
