//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `MediaScanner` using `walkdir` over the local file system, with media
//!   classification by file extension and metadata derived from the directory
//!   layout
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::FsMediaScanner;
//! use bridge_traits::MediaScanner;
//!
//! let scanner = FsMediaScanner::new().with_follow_links(true);
//! let files = scanner.list_files("file:///home/me/Music")?;
//! ```

mod scanner;

pub use scanner::FsMediaScanner;
