//! Media library facade.
//!
//! Wires the entity store, query engine, change notifier and discovery worker
//! behind one [`MediaLibrary`] handle with an explicit lifecycle:
//! `construct` → `init` → `start` → `release`.
//!
//! Hosts supply the [`MediaScanner`](bridge_traits::scanner::MediaScanner)
//! that lists and parses files. Desktop builds enable the `desktop-shims`
//! feature and use [`MediaLibrary::desktop`], which wires the file-system
//! scanner from `bridge-desktop`.
//!
//! ```no_run
//! use core_runtime::config::LibraryConfig;
//! use core_service::MediaLibrary;
//!
//! # fn main() -> core_service::Result<()> {
//! let library = MediaLibrary::desktop();
//! let config = LibraryConfig::builder()
//!     .database_dir("/var/lib/app/db")
//!     .media_dir("/var/lib/app/media")
//!     .build()?;
//!
//! if library.construct(&config) {
//!     let result = library.init()?;
//!     if result.is_usable() {
//!         library.start();
//!         library.add_entry_point("/home/me/Music")?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod facade;

pub use error::{CoreError, Result};
pub use facade::MediaLibrary;

pub use core_library::{InitResult, LibraryItem, PlaybackResult, QueryParams, SortKey};
pub use core_runtime::config::LibraryConfig;
pub use core_runtime::events::ChangeNotifier;
