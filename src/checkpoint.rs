use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SearchError};

/// Coarse snapshot of aggregate search progress.
///
/// Overwritten on every save. Counters that can exceed 64 bits are stored as
/// decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub total_attempts: String,
    pub valid_count: u64,
    pub found_candidates: Vec<String>,
    pub search_started_at: String,
    pub checkpointed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_size: Option<String>,
    /// First index of the range this checkpoint covers; absent means 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,
}

impl Checkpoint {
    /// Create a new checkpoint stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `total_attempts` - Indices passed so far, skipped ones included
    /// * `found_candidates` - Confirmed matches in discovery order
    /// * `search_started_at` - RFC 3339 timestamp of the first run
    /// * `space_size` - Size of the search space, if known
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_finder::Checkpoint;
    /// use num_bigint::BigUint;
    ///
    /// let checkpoint = Checkpoint::new(
    ///     &BigUint::from(42u32),
    ///     vec!["x b y b".to_string()],
    ///     "2024-01-01T00:00:00+00:00".to_string(),
    ///     Some(&BigUint::from(81u32)),
    /// );
    /// assert_eq!(checkpoint.valid_count, 1);
    /// ```
    pub fn new(
        total_attempts: &BigUint,
        found_candidates: Vec<String>,
        search_started_at: String,
        space_size: Option<&BigUint>,
    ) -> Self {
        Checkpoint {
            total_attempts: total_attempts.to_string(),
            valid_count: found_candidates.len() as u64,
            found_candidates,
            search_started_at,
            checkpointed_at: now_timestamp(),
            space_size: space_size.map(|s| s.to_string()),
            range_start: None,
        }
    }

    /// Tag a shard checkpoint with the start of its range.
    pub fn with_range_start(mut self, start: &BigUint) -> Self {
        if !start.is_zero() {
            self.range_start = Some(start.to_string());
        }
        self
    }

    /// Start of the covered range, 0 when untagged.
    pub fn range_start(&self) -> std::result::Result<BigUint, num_bigint::ParseBigIntError> {
        match &self.range_start {
            Some(start) => start.parse(),
            None => Ok(BigUint::zero()),
        }
    }

    /// Parse the attempt counter back into an integer.
    pub fn total_attempts(&self) -> std::result::Result<BigUint, num_bigint::ParseBigIntError> {
        self.total_attempts.parse()
    }

    /// Percentage of the space passed, when the space size was recorded.
    pub fn progress_percentage(&self) -> Option<f64> {
        let total: BigUint = self.space_size.as_deref()?.parse().ok()?;
        let done = self.total_attempts().ok()?;
        Some(crate::driver::fraction(&done, &total) * 100.0)
    }

    pub fn display_info(&self) {
        println!("📂 Checkpoint Information");
        println!("  Started at: {}", self.search_started_at);
        println!("  Saved at: {}", self.checkpointed_at);
        println!("  Total attempts: {}", self.total_attempts);
        if let Some(space) = &self.space_size {
            println!("  Search space: {}", space);
        }
        if let Some(start) = &self.range_start {
            println!("  Range start: {}", start);
        }
        if let Some(pct) = self.progress_percentage() {
            println!("  Progress: {:.4}%", pct);
        }
        println!("  Matches found: {}", self.valid_count);
        for candidate in &self.found_candidates {
            println!("    {}", candidate);
        }
    }
}

pub fn now_timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Single-file checkpoint persistence with atomic replace.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        crate::io_utils::save_to_file(checkpoint, &self.path).map_err(|e| {
            SearchError::persistence(format!("save checkpoint {}", self.path.display()), e)
        })
    }

    /// `Ok(None)` when no checkpoint has been written yet.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let loaded: Option<Checkpoint> = crate::io_utils::load_optional(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                SearchError::CorruptState {
                    path: self.path.clone(),
                    detail: e.to_string(),
                }
            } else {
                SearchError::persistence(format!("load checkpoint {}", self.path.display()), e)
            }
        })?;

        match loaded {
            Some(checkpoint) => {
                checkpoint
                    .total_attempts()
                    .map_err(|e| SearchError::CorruptState {
                        path: self.path.clone(),
                        detail: format!("totalAttempts: {}", e),
                    })?;
                checkpoint
                    .range_start()
                    .map_err(|e| SearchError::CorruptState {
                        path: self.path.clone(),
                        detail: format!("rangeStart: {}", e),
                    })?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }
}
