//! # Host Bridge Traits
//!
//! Contracts between the media library core and the collaborators it does not
//! own.
//!
//! ## Overview
//!
//! The core indexes media, tracks presence and raises change events, but it
//! never reads a file itself. Walking entry points and extracting metadata is
//! delegated to a [`MediaScanner`](scanner::MediaScanner), and log output can be
//! mirrored into the host's own logging through a
//! [`LoggerSink`](time::LoggerSink).
//!
//! ## Traits
//!
//! - [`MediaScanner`](scanner::MediaScanner) - List files below an entry point and parse them
//! - [`mrl`] - Locator normalization shared by scanners and the store
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Implementations
//!
//! | Platform | Implementation Crate |
//! |----------|----------------------|
//! | Desktop  | `bridge-desktop`     |
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it and keep the offending MRL in the
//! message so per-file failures can be attributed.
//!
//! ## Thread Safety
//!
//! Every trait requires `Send + Sync`: scanners run on the discovery worker
//! thread while the host thread registers listeners and queries the store.

pub mod error;
pub mod mrl;
pub mod scanner;
pub mod time;

pub use error::BridgeError;

pub use scanner::{DiscoveredFile, MediaScanner, MediaType, ParsedMedia};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, SystemClock};
