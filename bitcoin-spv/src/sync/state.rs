//! Sync state management.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::SyncProgress;

/// Where the download stands relative to the network.
///
/// `Empty` → `Syncing` ⇄ `Reorganizing` → `Synced`. A synced node drops back
/// to `Syncing` when a peer announces a higher chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncState {
    /// Nothing requested this session.
    #[default]
    Empty,
    Syncing,
    /// The last integrated block switched the main chain.
    Reorganizing,
    /// Caught up with the download peer's advertised height.
    Synced,
}

/// Tracks the [`SyncState`] and the progress counters.
#[derive(Debug, Clone)]
pub struct SyncTracker {
    progress: SyncProgress,
}

impl SyncTracker {
    pub fn new(current_height: u32) -> Self {
        Self {
            progress: SyncProgress {
                current_height,
                ..SyncProgress::default()
            },
        }
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    pub fn state(&self) -> SyncState {
        self.progress.state
    }

    pub fn is_synced(&self) -> bool {
        self.progress.state == SyncState::Synced
    }

    pub fn target_height(&self) -> u32 {
        self.progress.target_height
    }

    pub fn blocks_left(&self) -> u32 {
        self.progress.blocks_left()
    }

    /// A download cycle began towards `target_height`.
    pub fn start(&mut self, current_height: u32, target_height: u32) {
        if self.progress.state == SyncState::Empty {
            self.progress.sync_start = SystemTime::now();
        }
        self.progress.state = SyncState::Syncing;
        self.progress.current_height = current_height;
        self.progress.target_height = target_height;
        self.touch();
    }

    /// A peer announced a higher chain than the current target.
    pub fn raise_target(&mut self, height: u32) {
        if height <= self.progress.target_height {
            return;
        }
        self.progress.target_height = height;
        if self.progress.state == SyncState::Synced && height > self.progress.current_height {
            self.progress.state = SyncState::Syncing;
        }
    }

    /// `count` blocks were integrated and the head is now at `current_height`.
    pub fn record_blocks(&mut self, current_height: u32, count: usize, reorganized: bool) {
        self.progress.current_height = current_height;
        self.progress.blocks_downloaded += count as u64;
        self.progress.target_height = self.progress.target_height.max(current_height);
        match (self.progress.state, reorganized) {
            // Announced blocks and reorgs at the tip keep a synced node synced.
            (SyncState::Synced, _) if current_height >= self.progress.target_height => {}
            (SyncState::Synced, false) => {}
            (_, true) => self.progress.state = SyncState::Reorganizing,
            (_, false) => self.progress.state = SyncState::Syncing,
        }
        self.touch();
    }

    pub fn mark_synced(&mut self, current_height: u32) {
        self.progress.current_height = current_height;
        self.progress.target_height = self.progress.target_height.max(current_height);
        self.progress.state = SyncState::Synced;
        self.touch();
    }

    /// Forget the download after a rescan reset the chain.
    pub fn reset(&mut self, current_height: u32) {
        self.progress.state = SyncState::Empty;
        self.progress.current_height = current_height;
        self.touch();
    }

    fn touch(&mut self) {
        self.progress.last_update = SystemTime::now();
    }
}
