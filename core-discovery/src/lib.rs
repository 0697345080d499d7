//! # Media Discovery
//!
//! Walks registered entry points in the background and keeps the entity store
//! in step with what is on disk.
//!
//! ## Overview
//!
//! - [`DiscoveryController`] owns the worker thread and accepts
//!   fire-and-forget commands (reload, rescan, parser retry, pause/resume,
//!   ban/unban, entry point add/remove, device mount changes)
//! - [`state`] holds the per-entry-point state machine and progress counters
//!
//! Listing and parsing are delegated to a
//! [`MediaScanner`](bridge_traits::scanner::MediaScanner). A failing entry
//! point or file is reported on its own and never stops the others.

pub mod controller;
pub mod error;
pub mod state;

pub use controller::{Command, DiscoveryController};
pub use error::{DiscoveryError, Result};
pub use state::{DiscoveryState, DiscoveryStats, EntryPointState, ParsingProgress};
