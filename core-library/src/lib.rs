//! # Media Library Store
//!
//! Owns the persistent media library: every media, artist, genre, playlist,
//! media group and bookmark, addressed by a stable numeric id.
//!
//! ## Overview
//!
//! This crate manages:
//! - The SQLite file the library lives in, including schema versioning and
//!   recovery from corrupted or foreign files ([`db`])
//! - The in-memory working set and every mutation on it ([`store::EntityStore`])
//! - Sorted, paged and searched listings ([`query::QueryEngine`])
//! - Clamped pagination helpers ([`pagination`])
//!
//! Mutations raise change events through the
//! [`ChangeNotifier`](core_runtime::events::ChangeNotifier) handed to the store.

pub mod db;
pub mod error;
pub mod models;
pub mod pagination;
pub mod query;
pub mod store;

pub use error::{LibraryError, Result};
pub use models::{InitResult, ItemDetails, ItemType, LibraryItem, PlaybackResult, SearchAggregate};
pub use pagination::{secure_sublist, Page, PageRequest};
pub use query::{Listing, QueryEngine, QueryParams, SortKey};
pub use store::EntityStore;
