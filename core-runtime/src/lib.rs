//! # Core Runtime Module
//!
//! Ambient runtime shared by the library crates:
//! - Configuration ([`config::LibraryConfig`])
//! - Logging and tracing setup
//! - Change notification ([`events::ChangeNotifier`])

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
