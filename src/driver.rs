use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{now_timestamp, Checkpoint, CheckpointStore};
use crate::error::{Result, SearchError};
use crate::indexer::CombinationIndexer;
use crate::ledger::{merge_ledgers, AttemptLedger, LedgerHeader};
use crate::shard::existing_shard_paths;
use crate::validator::{Validate, Verdict};

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Initializing,
    Resuming,
    Enumerating,
    Checkpointing,
    /// The range was exhausted.
    Completed,
    /// Stopped early but resumable.
    Stopped,
    /// Configuration failure; nothing was enumerated.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    FirstMatch,
}

/// Cloneable stop flag shared between the driver and whoever wants it to
/// stop (a signal handler, another worker).
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub ledger_path: PathBuf,
    pub checkpoint_path: PathBuf,
    /// Append-only list of confirmed matches, one per line.
    pub found_path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
    /// Emit progress every N indices.
    pub progress_interval: u64,
    pub stop_on_first_match: bool,
    pub sync_ledger: bool,
    /// Other ledgers of the same search (shards of an earlier layout, or the
    /// single-worker ledger). Their attempts are skipped, never rewritten.
    /// `<ledger_path>.shard-<n>` files are always included.
    pub related_ledgers: Vec<PathBuf>,
}

impl DriverOptions {
    pub fn new(ledger_path: impl Into<PathBuf>, checkpoint_path: impl Into<PathBuf>) -> Self {
        DriverOptions {
            ledger_path: ledger_path.into(),
            checkpoint_path: checkpoint_path.into(),
            found_path: None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stop_on_first_match: false,
            sync_ledger: true,
            related_ledgers: Vec::new(),
        }
    }
}

/// Periodic status passed to the progress callback.
#[derive(Debug, Clone)]
pub struct Progress {
    pub processed: BigUint,
    pub total: BigUint,
    pub fraction: f64,
    pub elapsed: Duration,
    pub valid_count: u64,
    pub checkpointed: bool,
}

/// Counters owned by one driver. Shards each own one and are combined only
/// when the run finishes.
#[derive(Debug, Clone)]
pub struct DriverState {
    pub phase: DriverPhase,
    /// Next index to consider.
    pub cursor: BigUint,
    /// Indices passed in this range, skipped ones included.
    pub total_attempts: BigUint,
    pub validated: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub oracle_failures: u64,
    pub persistence_failures: u64,
    pub found: Vec<String>,
    pub search_started_at: String,
}

impl DriverState {
    fn new(start: &BigUint) -> Self {
        DriverState {
            phase: DriverPhase::Initializing,
            cursor: start.clone(),
            total_attempts: BigUint::zero(),
            validated: 0,
            skipped: 0,
            malformed: 0,
            oracle_failures: 0,
            persistence_failures: 0,
            found: Vec::new(),
            search_started_at: now_timestamp(),
        }
    }

    pub fn valid_count(&self) -> u64 {
        self.found.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub phase: DriverPhase,
    pub stop_reason: Option<StopReason>,
    pub state: DriverState,
    pub range_size: BigUint,
    pub elapsed: Duration,
}

impl SearchOutcome {
    pub fn is_complete(&self) -> bool {
        self.phase == DriverPhase::Completed
    }
}

/// `done / total` as a float; a zero-sized total counts as finished.
///
/// Both sides are shifted down to 64 significant bits of `total` first, so
/// totals beyond `f64::MAX` still report progress.
pub fn fraction(done: &BigUint, total: &BigUint) -> f64 {
    if total.is_zero() {
        return 1.0;
    }
    let shift = total.bits().saturating_sub(64);
    let done = done >> shift;
    let total = total >> shift;
    match (done.to_f64(), total.to_f64()) {
        (Some(d), Some(t)) if t > 0.0 => (d / t).min(1.0),
        _ => 0.0,
    }
}

/// Walks `[start, end)` in increasing order, validating every index not
/// already in the ledger.
pub struct SearchDriver<'a> {
    indexer: &'a CombinationIndexer,
    validator: &'a dyn Validate,
    options: DriverOptions,
    start: BigUint,
    end: BigUint,
    stop: StopHandle,
    state: DriverState,
}

impl<'a> SearchDriver<'a> {
    /// Driver over the whole search space.
    pub fn new(
        indexer: &'a CombinationIndexer,
        validator: &'a dyn Validate,
        options: DriverOptions,
    ) -> Self {
        let end = indexer.space_size().clone();
        Self::for_range(indexer, validator, options, BigUint::zero(), end)
    }

    /// Driver over `[start, end)` only, used for shards.
    pub fn for_range(
        indexer: &'a CombinationIndexer,
        validator: &'a dyn Validate,
        options: DriverOptions,
        start: BigUint,
        end: BigUint,
    ) -> Self {
        let state = DriverState::new(&start);
        SearchDriver {
            indexer,
            validator,
            options,
            start,
            end,
            stop: StopHandle::new(),
            state,
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn phase(&self) -> DriverPhase {
        self.state.phase
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    fn range_size(&self) -> BigUint {
        if self.end > self.start {
            &self.end - &self.start
        } else {
            BigUint::zero()
        }
    }

    /// Run to completion, cancellation, or first match (if configured).
    ///
    /// Configuration errors leave the driver in [`DriverPhase::Aborted`]
    /// and are returned before any index is processed.
    pub fn run<F>(&mut self, mut progress: F) -> Result<SearchOutcome>
    where
        F: FnMut(&Progress),
    {
        let run_started = Instant::now();

        let (mut ledger, store) = match self.initialize().and_then(|_| self.resume()) {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, "search aborted");
                self.state.phase = DriverPhase::Aborted;
                return Err(e);
            }
        };

        let stop_reason = self.enumerate(&mut ledger, &store, run_started, &mut progress);

        self.save_checkpoint(&store);
        self.state.phase = match stop_reason {
            Some(_) => DriverPhase::Stopped,
            None => DriverPhase::Completed,
        };
        info!(
            phase = ?self.state.phase,
            total_attempts = %self.state.total_attempts,
            validated = self.state.validated,
            matches = self.state.valid_count(),
            "search finished"
        );

        Ok(SearchOutcome {
            phase: self.state.phase,
            stop_reason,
            state: self.state.clone(),
            range_size: self.range_size(),
            elapsed: run_started.elapsed(),
        })
    }

    fn initialize(&mut self) -> Result<()> {
        self.state.phase = DriverPhase::Initializing;

        let unknown = self
            .indexer
            .template()
            .unknown_tokens(self.indexer.vocabulary());
        if !unknown.is_empty() {
            return Err(SearchError::UnknownFixedTokens { tokens: unknown });
        }

        if self.end > *self.indexer.space_size() || self.start > self.end {
            return Err(SearchError::ParameterMismatch {
                field: "range",
                expected: format!("within [0, {})", self.indexer.space_size()),
                found: format!("[{}, {})", self.start, self.end),
            });
        }

        info!(
            space_size = %self.indexer.space_size(),
            start = %self.start,
            end = %self.end,
            template = %self.indexer.template(),
            "initialized search"
        );
        Ok(())
    }

    fn resume(&mut self) -> Result<(AttemptLedger, CheckpointStore)> {
        self.state.phase = DriverPhase::Resuming;

        let store = CheckpointStore::new(&self.options.checkpoint_path);
        let checkpoint = store.load()?;
        let range_size = self.range_size();

        let mut total_attempts = BigUint::zero();
        if let Some(checkpoint) = &checkpoint {
            total_attempts = checkpoint.total_attempts().map_err(|e| SearchError::CorruptState {
                path: store.path().to_path_buf(),
                detail: e.to_string(),
            })?;
            if total_attempts > range_size {
                return Err(SearchError::ParameterMismatch {
                    field: "totalAttempts",
                    expected: format!("<= {}", range_size),
                    found: total_attempts.to_string(),
                });
            }
            let recorded_start = checkpoint.range_start().map_err(|e| SearchError::CorruptState {
                path: store.path().to_path_buf(),
                detail: e.to_string(),
            })?;
            if recorded_start != self.start {
                return Err(SearchError::ParameterMismatch {
                    field: "rangeStart",
                    expected: self.start.to_string(),
                    found: recorded_start.to_string(),
                });
            }
            if let Some(space) = &checkpoint.space_size {
                if *space != range_size.to_string() {
                    return Err(SearchError::ParameterMismatch {
                        field: "spaceSize",
                        expected: range_size.to_string(),
                        found: space.clone(),
                    });
                }
            }
            self.state.found = checkpoint.found_candidates.clone();
            self.state.search_started_at = checkpoint.search_started_at.clone();
        }

        let header = LedgerHeader::for_indexer(self.indexer);
        let mut ledger =
            AttemptLedger::open(&self.options.ledger_path, &header, self.options.sync_ledger)?;

        let mut related = self.options.related_ledgers.clone();
        related.extend(existing_shard_paths(&self.options.ledger_path));
        related.retain(|p| *p != self.options.ledger_path);
        if !related.is_empty() {
            let prior = merge_ledgers(&related, &header)?;
            if !prior.is_empty() {
                info!(
                    ledgers = related.len(),
                    attempted = %prior.len(),
                    "skipping attempts recorded by related ledgers"
                );
                ledger.absorb(&prior);
            }
        }

        // The checkpoint may lag the ledger; never restart below the
        // ledger's contiguous prefix.
        let from_checkpoint = &self.start + &total_attempts;
        let from_ledger = ledger.attempted().first_gap_from(&self.start);
        let cursor = std::cmp::max(from_checkpoint, from_ledger).min(self.end.clone());
        self.state.total_attempts = &cursor - &self.start;
        self.state.cursor = cursor;

        self.recover_found_file();

        info!(
            resume_from = %self.state.cursor,
            total_attempts = %self.state.total_attempts,
            matches = self.state.valid_count(),
            from_checkpoint = checkpoint.is_some(),
            "resuming search"
        );
        Ok((ledger, store))
    }

    /// Matches written to the found file but missing from the checkpoint
    /// (the checkpoint save failed or was interrupted).
    fn recover_found_file(&mut self) {
        let Some(path) = &self.options.found_path else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read found file");
                return;
            }
        };
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !self.state.found.iter().any(|f| f == line) {
                warn!(candidate = line, "recovered match missing from checkpoint");
                self.state.found.push(line.to_string());
            }
        }
    }

    fn enumerate<F>(
        &mut self,
        ledger: &mut AttemptLedger,
        store: &CheckpointStore,
        run_started: Instant,
        progress: &mut F,
    ) -> Option<StopReason>
    where
        F: FnMut(&Progress),
    {
        self.state.phase = DriverPhase::Enumerating;
        let mut last_checkpoint = Instant::now();
        let mut since_progress = 0u64;

        while self.state.cursor < self.end {
            if self.stop.is_stop_requested() {
                info!(cursor = %self.state.cursor, "stop requested");
                return Some(StopReason::Cancelled);
            }

            let index = self.state.cursor.clone();
            let mut matched = false;

            if ledger.has_attempted(&index) {
                self.state.skipped += 1;
            } else {
                if let Err(e) = ledger.record_attempt(&index) {
                    self.state.persistence_failures += 1;
                    warn!(error = %e, index = %index, "ledger append failed, resumability degraded");
                }

                match self.indexer.encode(&index) {
                    Some(candidate) => {
                        self.state.validated += 1;
                        match self.validator.validate(&candidate) {
                            Verdict::Match => {
                                matched = true;
                                self.record_match(candidate.to_string(), store);
                            }
                            Verdict::NoMatch => {}
                            Verdict::Malformed => self.state.malformed += 1,
                            Verdict::OracleFailed => self.state.oracle_failures += 1,
                        }
                    }
                    None => {
                        // Unreachable while cursor < end <= space size.
                        error!(index = %index, "index outside search space");
                    }
                }
            }

            self.state.cursor += 1u32;
            self.state.total_attempts += 1u32;
            since_progress += 1;

            if matched && self.options.stop_on_first_match {
                return Some(StopReason::FirstMatch);
            }

            let checkpoint_due = last_checkpoint.elapsed() >= self.options.checkpoint_interval;
            if checkpoint_due {
                self.state.phase = DriverPhase::Checkpointing;
                self.save_checkpoint(store);
                last_checkpoint = Instant::now();
                self.state.phase = DriverPhase::Enumerating;
            }

            if checkpoint_due
                || (self.options.progress_interval > 0
                    && since_progress >= self.options.progress_interval)
            {
                since_progress = 0;
                progress(&self.progress(run_started, checkpoint_due));
            }
        }

        None
    }

    /// Persist a match right away: found file first, then the checkpoint.
    fn record_match(&mut self, candidate: String, store: &CheckpointStore) {
        info!(candidate = %candidate, index = %self.state.cursor, "match found");
        if let Some(path) = &self.options.found_path {
            if let Err(e) = crate::io_utils::append_line(path, &candidate, true) {
                self.state.persistence_failures += 1;
                warn!(path = %path.display(), error = %e, "could not append to found file");
            }
        }
        self.state.found.push(candidate);
        // The in-flight index counts as attempted in the saved snapshot.
        let through_current = &self.state.total_attempts + 1u32;
        self.save_checkpoint_at(store, &through_current);
    }

    fn save_checkpoint(&mut self, store: &CheckpointStore) {
        let total_attempts = self.state.total_attempts.clone();
        self.save_checkpoint_at(store, &total_attempts);
    }

    fn save_checkpoint_at(&mut self, store: &CheckpointStore, total_attempts: &BigUint) {
        let checkpoint = self.checkpoint_at(total_attempts);
        match store.save(&checkpoint) {
            Ok(()) => debug!(total_attempts = %checkpoint.total_attempts, "checkpoint saved"),
            Err(e) => {
                self.state.persistence_failures += 1;
                warn!(error = %e, "checkpoint save failed, resumability degraded");
            }
        }
    }

    /// Snapshot of the current counters.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint_at(&self.state.total_attempts)
    }

    fn checkpoint_at(&self, total_attempts: &BigUint) -> Checkpoint {
        Checkpoint::new(
            total_attempts,
            self.state.found.clone(),
            self.state.search_started_at.clone(),
            Some(&self.range_size()),
        )
        .with_range_start(&self.start)
    }

    fn progress(&self, run_started: Instant, checkpointed: bool) -> Progress {
        let total = self.range_size();
        Progress {
            fraction: fraction(&self.state.total_attempts, &total),
            processed: self.state.total_attempts.clone(),
            total,
            elapsed: run_started.elapsed(),
            valid_count: self.state.valid_count(),
            checkpointed,
        }
    }
}
