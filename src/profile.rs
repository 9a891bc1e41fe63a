//! Player profile: wallet and per-level progress
//!
//! Persisted as JSON. The simulation never owns the wallet; whoever drives a
//! world passes the profile by reference into `tick` and paid actions.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Progress persistence seen by the simulation
pub trait ProgressStore {
    /// Whether the level has ever been passed
    fn is_level_passed(&self, level: &str) -> bool;
    /// Best coin total recorded for a level
    fn level_coins(&self, level: &str) -> u32;
    /// Wallet balance
    fn total_coins(&self) -> u32;
    /// Deduct `price` from the wallet; false (and no change) if it can't be afforded
    fn try_spend(&mut self, price: u32) -> bool;
    /// Record a passed level with the coins earned in that run
    fn commit_win(&mut self, level: &str, coins: u32);
}

/// Stored progress for one level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelRecord {
    /// Best coin total
    pub coins: u32,
    pub passed: bool,
}

/// Wallet plus per-level records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub total_coins: u32,
    #[serde(default)]
    pub levels: BTreeMap<String, LevelRecord>,
}

impl PlayerProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a profile from disk
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let json = std::fs::read_to_string(path)?;
        let profile: PlayerProfile = serde_json::from_str(&json)?;
        log::info!(
            "Loaded profile ({} coins, {} levels)",
            profile.total_coins,
            profile.levels.len()
        );
        Ok(profile)
    }

    /// Read a profile, starting fresh if it is missing or unreadable
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(profile) => profile,
            Err(e) => {
                log::warn!("No usable profile at {}: {e}, starting fresh", path.display());
                Self::new()
            }
        }
    }

    /// Write the profile to disk
    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::info!("Profile saved ({} coins)", self.total_coins);
        Ok(())
    }
}

impl ProgressStore for PlayerProfile {
    fn is_level_passed(&self, level: &str) -> bool {
        self.levels.get(level).is_some_and(|r| r.passed)
    }

    fn level_coins(&self, level: &str) -> u32 {
        self.levels.get(level).map(|r| r.coins).unwrap_or(0)
    }

    fn total_coins(&self) -> u32 {
        self.total_coins
    }

    fn try_spend(&mut self, price: u32) -> bool {
        if self.total_coins < price {
            return false;
        }
        self.total_coins -= price;
        true
    }

    fn commit_win(&mut self, level: &str, coins: u32) {
        let record = self.levels.entry(level.to_string()).or_default();
        record.passed = true;
        // Only an improvement on the level best reaches the wallet
        if coins > record.coins {
            self.total_coins += coins - record.coins;
            record.coins = coins;
        }
    }
}
