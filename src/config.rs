use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::DriverOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    None,
    Bip39,
}

/// Everything needed to run or resume one logical search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub vocabulary_file: PathBuf,
    /// Whitespace-separated tokens, `?` for each free slot.
    pub template: String,
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    /// `null` disables the found-match log.
    #[serde(default = "default_found_file")]
    pub found_file: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub stop_on_first_match: bool,
    #[serde(default = "default_true")]
    pub sync_ledger: bool,
    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,
    #[serde(default = "default_oracle_retries")]
    pub oracle_retries: u32,
    #[serde(default = "default_checksum")]
    pub checksum: ChecksumMode,
}

fn default_ledger_file() -> PathBuf {
    PathBuf::from("attempts.ledger")
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("checkpoint.json")
}

fn default_found_file() -> Option<PathBuf> {
    Some(PathBuf::from("found.txt"))
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_progress_interval() -> u64 {
    100_000
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_oracle_timeout_ms() -> u64 {
    30_000
}

fn default_oracle_retries() -> u32 {
    2
}

fn default_checksum() -> ChecksumMode {
    ChecksumMode::None
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            vocabulary_file: PathBuf::from("vocabulary.txt"),
            template: "word ? word ?".to_string(),
            ledger_file: default_ledger_file(),
            checkpoint_file: default_checkpoint_file(),
            found_file: default_found_file(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            progress_interval: default_progress_interval(),
            workers: default_workers(),
            stop_on_first_match: false,
            sync_ledger: true,
            oracle_timeout_ms: default_oracle_timeout_ms(),
            oracle_retries: default_oracle_retries(),
            checksum: default_checksum(),
        }
    }
}

impl SearchConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        crate::io_utils::load_from_file(path)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        crate::io_utils::save_to_file(self, path)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            ledger_path: self.ledger_file.clone(),
            checkpoint_path: self.checkpoint_file.clone(),
            found_path: self.found_file.clone(),
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs),
            progress_interval: self.progress_interval,
            stop_on_first_match: self.stop_on_first_match,
            sync_ledger: self.sync_ledger,
            related_ledgers: Vec::new(),
        }
    }
}
