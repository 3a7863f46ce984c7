//! Append-only attempt ledger.
//!
//! Layout:
//!
//! ```text
//! # slot-finder attempt ledger
//! [header]
//! {"known_tokens":[...],"free_positions":[2,4],"template_length":4,"vocabulary_size":3,"space_size":"9"}
//! [attempts]
//! 0
//! 1
//! ```
//!
//! Every attempted index is one decimal line after `[attempts]`. Replaying
//! the file rebuilds an [`AttemptSet`]. A torn final line left by a crash
//! mid-append is ignored.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::attempt_set::AttemptSet;
use crate::error::{Result, SearchError};
use crate::indexer::CombinationIndexer;

const LEDGER_BANNER: &str = "# slot-finder attempt ledger";
const HEADER_SECTION: &str = "[header]";
const ATTEMPTS_SECTION: &str = "[attempts]";

/// Search parameters recorded at the top of a ledger. A ledger is only
/// reusable by a search whose parameters are identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub known_tokens: Vec<String>,
    pub free_positions: Vec<usize>,
    pub template_length: usize,
    pub vocabulary_size: usize,
    pub space_size: String,
}

impl LedgerHeader {
    pub fn for_indexer(indexer: &CombinationIndexer) -> Self {
        let template = indexer.template();
        LedgerHeader {
            known_tokens: template.known_tokens(),
            free_positions: template.free_positions(),
            template_length: template.len(),
            vocabulary_size: indexer.vocabulary().len(),
            space_size: indexer.space_size().to_string(),
        }
    }

    /// Fails with the first differing field.
    pub fn ensure_matches(&self, expected: &LedgerHeader) -> Result<()> {
        fn check<T: PartialEq + std::fmt::Debug>(
            field: &'static str,
            expected: &T,
            found: &T,
        ) -> Result<()> {
            if expected == found {
                Ok(())
            } else {
                Err(SearchError::ParameterMismatch {
                    field,
                    expected: format!("{:?}", expected),
                    found: format!("{:?}", found),
                })
            }
        }

        check("known_tokens", &expected.known_tokens, &self.known_tokens)?;
        check("free_positions", &expected.free_positions, &self.free_positions)?;
        check("template_length", &expected.template_length, &self.template_length)?;
        check("vocabulary_size", &expected.vocabulary_size, &self.vocabulary_size)?;
        check("space_size", &expected.space_size, &self.space_size)
    }
}

/// Result of replaying a ledger file.
#[derive(Debug, Clone)]
pub struct LedgerReplay {
    pub header: LedgerHeader,
    pub attempted: AttemptSet,
    /// Lowest index `>= 0` not yet attempted.
    pub resume_from: BigUint,
    /// Byte length of the complete lines.
    pub valid_len: u64,
    pub torn_tail: bool,
}

/// Read a ledger file without opening it for writing.
pub fn replay(path: &Path) -> Result<Option<LedgerReplay>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SearchError::persistence(
                format!("read ledger {}", path.display()),
                e,
            ))
        }
    };

    let corrupt = |detail: String| SearchError::CorruptState {
        path: path.to_path_buf(),
        detail,
    };

    // Anything after the final newline is an incomplete append.
    let valid_len = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let torn_tail = valid_len < content.len();
    if torn_tail {
        warn!(
            path = %path.display(),
            bytes = content.len() - valid_len,
            "ignoring torn ledger tail"
        );
    }

    let mut lines = content[..valid_len].lines().map(str::trim).enumerate();
    let mut header: Option<LedgerHeader> = None;
    let mut in_attempts = false;
    let mut attempted = AttemptSet::new();

    while let Some((lineno, line)) = lines.next() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == HEADER_SECTION {
            let Some((_, json)) = lines.next() else {
                break;
            };
            let parsed: LedgerHeader = serde_json::from_str(json)
                .map_err(|e| corrupt(format!("bad header record: {}", e)))?;
            header = Some(parsed);
            continue;
        }
        if line == ATTEMPTS_SECTION {
            if header.is_none() {
                return Err(corrupt("attempts section before header".to_string()));
            }
            in_attempts = true;
            continue;
        }
        if !in_attempts {
            return Err(corrupt(format!("unexpected line {}: {}", lineno + 1, line)));
        }

        let index = line
            .parse::<BigUint>()
            .map_err(|e| corrupt(format!("bad index on line {}: {}", lineno + 1, e)))?;
        attempted.insert(index);
    }

    // No attempt can precede the attempts section, so a file that stops
    // short of it holds nothing worth keeping.
    let header = match header {
        Some(header) if in_attempts => header,
        _ => {
            warn!(path = %path.display(), "ledger was never fully created, starting fresh");
            return Ok(None);
        }
    };
    let resume_from = attempted.first_gap_from(&BigUint::from(0u32));
    debug!(
        path = %path.display(),
        runs = attempted.run_count(),
        resume_from = %resume_from,
        "replayed ledger"
    );

    Ok(Some(LedgerReplay {
        header,
        attempted,
        resume_from,
        valid_len: valid_len as u64,
        torn_tail,
    }))
}

/// Durable record of attempted indices for one logical search (or one shard
/// of it).
#[derive(Debug)]
pub struct AttemptLedger {
    path: PathBuf,
    file: File,
    attempted: AttemptSet,
    resume_from: BigUint,
    sync_on_record: bool,
}

impl AttemptLedger {
    /// Open an existing ledger and replay it, or create a fresh one with
    /// `header`. An existing ledger with different parameters is rejected.
    pub fn open(path: &Path, header: &LedgerHeader, sync_on_record: bool) -> Result<Self> {
        let (attempted, resume_from, torn_len) = match replay(path)? {
            Some(existing) => {
                existing.header.ensure_matches(header)?;
                info!(
                    path = %path.display(),
                    attempted = %existing.attempted.len(),
                    resume_from = %existing.resume_from,
                    "resuming attempt ledger"
                );
                let torn_len = existing.torn_tail.then_some(existing.valid_len);
                (existing.attempted, existing.resume_from, torn_len)
            }
            None => {
                write_new(path, header)?;
                info!(path = %path.display(), "created attempt ledger");
                (AttemptSet::new(), BigUint::from(0u32), None)
            }
        };

        // Drop a torn line so the next record starts cleanly.
        if let Some(valid_len) = torn_len {
            OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|f| f.set_len(valid_len))
                .map_err(|e| SearchError::persistence("truncate torn ledger tail", e))?;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| SearchError::persistence(format!("open ledger {}", path.display()), e))?;

        Ok(AttemptLedger {
            path: path.to_path_buf(),
            file,
            attempted,
            resume_from,
            sync_on_record,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_attempted(&self, index: &BigUint) -> bool {
        self.attempted.contains(index)
    }

    /// Lowest unattempted index at the time the ledger was opened.
    pub fn resume_from(&self) -> &BigUint {
        &self.resume_from
    }

    pub fn attempted(&self) -> &AttemptSet {
        &self.attempted
    }

    /// Treat indices recorded in other ledgers of the same search as
    /// attempted. Nothing is written here.
    pub fn absorb(&mut self, other: &AttemptSet) {
        self.attempted.union(other);
    }

    /// Mark `index` attempted in memory, then append it to the file.
    ///
    /// The in-memory set is updated even when the write fails, so the
    /// current run never revisits the index.
    pub fn record_attempt(&mut self, index: &BigUint) -> Result<()> {
        self.attempted.insert(index.clone());
        let line = format!("{}\n", index);
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| {
                if self.sync_on_record {
                    self.file.sync_data()
                } else {
                    Ok(())
                }
            })
            .map_err(|e| {
                SearchError::persistence(format!("append to ledger {}", self.path.display()), e)
            })
    }
}

fn write_new(path: &Path, header: &LedgerHeader) -> Result<()> {
    let json = serde_json::to_string(header)
        .map_err(|e| SearchError::persistence("encode ledger header", e.into()))?;
    let body = format!(
        "{}\n{}\n{}\n{}\n",
        LEDGER_BANNER, HEADER_SECTION, json, ATTEMPTS_SECTION
    );
    crate::io_utils::replace_file(path, body.as_bytes())
        .map_err(|e| SearchError::persistence(format!("create ledger {}", path.display()), e))
}

/// Union several ledgers that share the same parameters.
pub fn merge_ledgers(paths: &[PathBuf], header: &LedgerHeader) -> Result<AttemptSet> {
    let mut merged = AttemptSet::new();
    for path in paths {
        if let Some(shard) = replay(path)? {
            shard.header.ensure_matches(header)?;
            merged.union(&shard.attempted);
        }
    }
    Ok(merged)
}
