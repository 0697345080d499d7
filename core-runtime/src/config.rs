//! # Core Configuration Module
//!
//! Provides configuration management for the media library core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `LibraryConfig` holding the storage locations and tunables the library
//! needs. Validation is fail-fast: a configuration that is missing a required
//! directory never gets built.
//!
//! ## Required Settings
//!
//! - `database_dir` - Application-private directory holding the database file
//! - `media_dir` - External working directory for media artefacts
//!
//! ## Optional Settings (with defaults)
//!
//! - `PlaybackThresholds` - Resume-point policy for `set_playback_time`
//! - `DiscoverySettings` - Discovery worker tunables
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{LibraryConfig, PlaybackThresholds};
//!
//! let config = LibraryConfig::builder()
//!     .database_dir("/data/app/db")
//!     .media_dir("/sdcard/Android/data/app/files")
//!     .playback(PlaybackThresholds::new(0.05, 0.95))
//!     .build()
//!     .expect("valid config");
//!
//! assert!(config.database_path().ends_with("medialibrary.db"));
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::LibraryConfig;
//!
//! // Missing media directory
//! let config = LibraryConfig::builder()
//!     .database_dir("/data/app/db")
//!     .build()
//!     .expect("Should fail - missing media directory");
//! ```

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Database file name, relative to [`LibraryConfig::database_dir`].
pub const DATABASE_FILE_NAME: &str = "medialibrary.db";

/// Media artefacts directory name, relative to [`LibraryConfig::media_dir`].
pub const MEDIA_FOLDER_NAME: &str = "medialib";

/// Thumbnail directory left behind by older releases.
pub const LEGACY_THUMBS_FOLDER_NAME: &str = "thumbs";

/// Configuration for the media library core.
///
/// Use [`LibraryConfigBuilder`] to construct instances.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryConfig {
    /// Application-private directory holding the database
    pub database_dir: PathBuf,

    /// External working directory
    pub media_dir: PathBuf,

    /// Resume-point policy
    pub playback: PlaybackThresholds,

    /// Discovery worker tunables
    pub discovery: DiscoverySettings,
}

impl LibraryConfig {
    /// Creates a new builder for constructing a `LibraryConfig`.
    pub fn builder() -> LibraryConfigBuilder {
        LibraryConfigBuilder::default()
    }

    /// Full path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.database_dir.join(DATABASE_FILE_NAME)
    }

    /// Directory holding media artefacts.
    pub fn media_artifacts_dir(&self) -> PathBuf {
        self.media_dir.join(MEDIA_FOLDER_NAME)
    }

    /// Thumbnail directory of older releases, removed on construction.
    pub fn legacy_thumbnails_dir(&self) -> PathBuf {
        self.media_dir.join(LEGACY_THUMBS_FOLDER_NAME)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.database_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "Database directory cannot be empty".to_string(),
            ));
        }

        if self.media_dir.as_os_str().is_empty() {
            return Err(Error::Config("Media directory cannot be empty".to_string()));
        }

        self.playback.validate()?;
        self.discovery.validate()?;

        Ok(())
    }
}

/// Thresholds deciding how a reported playback time is stored.
///
/// Both values are fractions of the media duration. A time before
/// `begin_ratio` counts as "not really started", a time after `end_ratio` as
/// "finished".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackThresholds {
    pub begin_ratio: f64,
    pub end_ratio: f64,
}

impl PlaybackThresholds {
    pub fn new(begin_ratio: f64, end_ratio: f64) -> Self {
        Self {
            begin_ratio,
            end_ratio,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.begin_ratio) || !in_range(self.end_ratio) {
            return Err(Error::Config(
                "Playback thresholds must be within [0, 1]".to_string(),
            ));
        }
        if self.begin_ratio >= self.end_ratio {
            return Err(Error::Config(format!(
                "Begin threshold ({}) must be lower than end threshold ({})",
                self.begin_ratio, self.end_ratio
            )));
        }
        Ok(())
    }
}

impl Default for PlaybackThresholds {
    fn default() -> Self {
        Self::new(0.05, 0.95)
    }
}

/// Discovery worker tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Parsing stats are reported every `progress_tick` parsed files
    pub progress_tick: u32,

    /// Name given to the worker thread
    pub worker_name: String,
}

impl DiscoverySettings {
    pub fn validate(&self) -> Result<()> {
        if self.progress_tick == 0 {
            return Err(Error::Config(
                "Progress tick must be greater than 0".to_string(),
            ));
        }
        if self.worker_name.trim().is_empty() {
            return Err(Error::Config("Worker name cannot be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            progress_tick: 10,
            worker_name: "medialib-discovery".to_string(),
        }
    }
}

/// Builder for constructing [`LibraryConfig`] instances.
#[derive(Debug, Default)]
pub struct LibraryConfigBuilder {
    database_dir: Option<PathBuf>,
    media_dir: Option<PathBuf>,
    playback: Option<PlaybackThresholds>,
    discovery: Option<DiscoverySettings>,
}

impl LibraryConfigBuilder {
    /// Sets the application-private database directory.
    pub fn database_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_dir = Some(path.into());
        self
    }

    /// Sets the external working directory.
    pub fn media_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.media_dir = Some(path.into());
        self
    }

    pub fn playback(mut self, thresholds: PlaybackThresholds) -> Self {
        self.playback = Some(thresholds);
        self
    }

    pub fn discovery(mut self, settings: DiscoverySettings) -> Self {
        self.discovery = Some(settings);
        self
    }

    /// Sets the parsing stats reporting interval.
    pub fn progress_tick(mut self, tick: u32) -> Self {
        self.discovery.get_or_insert_with(DiscoverySettings::default).progress_tick = tick;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a required directory is missing or a
    /// tunable is out of range.
    pub fn build(self) -> Result<LibraryConfig> {
        let database_dir = self.database_dir.ok_or_else(|| {
            Error::Config("Database directory is required".to_string())
        })?;
        let media_dir = self
            .media_dir
            .ok_or_else(|| Error::Config("Media directory is required".to_string()))?;

        let config = LibraryConfig {
            database_dir,
            media_dir,
            playback: self.playback.unwrap_or_default(),
            discovery: self.discovery.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Whether `path` is an existing directory the process can create files in.
pub fn is_writable_dir(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => !meta.permissions().readonly(),
        _ => false,
    }
}
