//! Workspace umbrella crate.
//!
//! Re-exports the `core-service` façade so host applications can depend on
//! `medialib-workspace` alone and pick the documented features (for example
//! `desktop-shims`, which wires the file-system scanner from `bridge-desktop`).

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
