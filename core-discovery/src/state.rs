//! # Entry Point State Machine
//!
//! Tracks where each entry point is in its discovery lifecycle.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Discovering → Completed
//!            ↑   ↓         │
//!            │  Failed     │
//!            └─────┴───────┘
//! ```
//!
//! A new pass may start from any state except that it supersedes the running
//! one. Banning is tracked separately and does not change the discovery
//! state.

use crate::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryState {
    #[default]
    Idle,
    Discovering,
    Completed,
    Failed,
}

impl DiscoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryState::Completed | DiscoveryState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryState::Idle => "idle",
            DiscoveryState::Discovering => "discovering",
            DiscoveryState::Completed => "completed",
            DiscoveryState::Failed => "failed",
        }
    }
}

impl FromStr for DiscoveryState {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(DiscoveryState::Idle),
            "discovering" => Ok(DiscoveryState::Discovering),
            "completed" => Ok(DiscoveryState::Completed),
            "failed" => Ok(DiscoveryState::Failed),
            _ => Err(DiscoveryError::InvalidState(s.to_string())),
        }
    }
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Parse counters for the current pass. Both only grow until [`reset`].
///
/// [`reset`]: ParsingProgress::reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsingProgress {
    pub done: u32,
    pub scheduled: u32,
}

impl ParsingProgress {
    pub fn schedule(&mut self, count: u32) {
        self.scheduled = self.scheduled.saturating_add(count);
    }

    /// Count one finished task; returns `true` when a report is due every
    /// `tick` tasks.
    pub fn finish_one(&mut self, tick: u32) -> bool {
        self.done = self.done.saturating_add(1);
        tick > 0 && self.done % tick == 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome counters of the last pass over one entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryStats {
    /// Files returned by the listing
    pub listed: u32,
    /// Files parsed into the store
    pub parsed: u32,
    /// Files skipped because the stored media is up to date
    pub unchanged: u32,
    /// Files that failed to parse
    pub failed: u32,
    /// Known media no longer in the listing
    pub missing: u32,
}

// ============================================================================
// Entry point
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointState {
    pub mrl: String,
    pub state: DiscoveryState,
    pub banned: bool,
    /// Bumped by every pass; tasks from older passes are dropped.
    pub generation: u64,
    pub stats: DiscoveryStats,
}

impl EntryPointState {
    pub fn new(mrl: impl Into<String>) -> Self {
        Self {
            mrl: mrl.into(),
            state: DiscoveryState::Idle,
            banned: false,
            generation: 0,
            stats: DiscoveryStats::default(),
        }
    }

    /// Start a new pass, superseding any pass in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point is banned.
    pub fn begin(&mut self) -> Result<u64> {
        if self.banned {
            return Err(self.transition_error(DiscoveryState::Discovering, "entry point is banned"));
        }
        self.generation += 1;
        self.state = DiscoveryState::Discovering;
        self.stats = DiscoveryStats::default();
        Ok(self.generation)
    }

    /// # Errors
    ///
    /// Returns an error if no pass is running.
    pub fn complete(&mut self) -> Result<()> {
        self.finish(DiscoveryState::Completed)
    }

    /// # Errors
    ///
    /// Returns an error if no pass is running.
    pub fn fail(&mut self) -> Result<()> {
        self.finish(DiscoveryState::Failed)
    }

    /// Move back to `Discovering` for a parser retry without starting a new
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns an error unless the last pass ended.
    pub fn retry(&mut self) -> Result<()> {
        if !self.state.is_terminal() {
            return Err(self.transition_error(DiscoveryState::Discovering, "no finished pass to retry"));
        }
        self.state = DiscoveryState::Discovering;
        Ok(())
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.banned
    }

    fn finish(&mut self, to: DiscoveryState) -> Result<()> {
        if self.state != DiscoveryState::Discovering {
            return Err(self.transition_error(to, "entry point is not being discovered"));
        }
        self.state = to;
        Ok(())
    }

    fn transition_error(&self, to: DiscoveryState, reason: &str) -> DiscoveryError {
        DiscoveryError::InvalidStateTransition {
            from: self.state.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.to_string(),
        }
    }
}
