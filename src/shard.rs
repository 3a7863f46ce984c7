use num_bigint::BigUint;
use num_traits::Zero;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::checkpoint::{now_timestamp, Checkpoint, CheckpointStore};
use crate::driver::{
    DriverOptions, DriverPhase, Progress, SearchDriver, SearchOutcome, StopHandle, StopReason,
};
use crate::error::{Result, SearchError};
use crate::indexer::CombinationIndexer;
use crate::ledger::{merge_ledgers, LedgerHeader};
use crate::validator::Validate;

/// One contiguous slice `[start, end)` of the search space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: usize,
    pub start: BigUint,
    pub end: BigUint,
}

/// Partition `[0, space)` into at most `workers` contiguous shards. The last
/// shard absorbs the remainder; empty shards are dropped.
pub fn partition(space: &BigUint, workers: usize) -> Vec<Shard> {
    let workers = workers.max(1);
    let width = space / BigUint::from(workers);

    let mut shards = Vec::with_capacity(workers);
    let mut start = BigUint::zero();
    for id in 0..workers {
        let end = if id + 1 == workers {
            space.clone()
        } else {
            &start + &width
        };
        if end > start {
            shards.push(Shard {
                id: shards.len(),
                start: start.clone(),
                end: end.clone(),
            });
        }
        start = end;
    }
    shards
}

/// `<path>.shard-<id>`
pub fn shard_path(path: &Path, id: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".shard-{}", id));
    PathBuf::from(name)
}

/// Shard files of `path` present on disk, from `.shard-0` up to the first gap.
pub fn existing_shard_paths(path: &Path) -> Vec<PathBuf> {
    (0..)
        .map(|id| shard_path(path, id))
        .take_while(|p| p.exists())
        .collect()
}

fn shard_options(options: &DriverOptions, shard: &Shard) -> DriverOptions {
    let mut shard_opts = options.clone();
    shard_opts.ledger_path = shard_path(&options.ledger_path, shard.id);
    shard_opts.checkpoint_path = shard_path(&options.checkpoint_path, shard.id);
    shard_opts.found_path = options.found_path.as_ref().map(|p| shard_path(p, shard.id));
    // The single-worker ledger and shards of any earlier layout.
    shard_opts.related_ledgers.push(options.ledger_path.clone());
    shard_opts
        .related_ledgers
        .extend(existing_shard_paths(&options.ledger_path));
    shard_opts
}

/// Drop a shard checkpoint left by a different worker count. Its ledger
/// stays, so no attempt is forgotten.
fn discard_stale_checkpoint(path: &Path, shard: &Shard) -> Result<()> {
    let Some(checkpoint) = CheckpointStore::new(path).load()? else {
        return Ok(());
    };
    let size = &shard.end - &shard.start;
    let same_range = checkpoint.range_start().ok().as_ref() == Some(&shard.start)
        && checkpoint.space_size.as_deref() == Some(size.to_string().as_str());
    if !same_range {
        warn!(
            path = %path.display(),
            shard = shard.id,
            "shard layout changed, discarding stale shard checkpoint"
        );
        std::fs::remove_file(path)
            .map_err(|e| SearchError::persistence(format!("remove {}", path.display()), e))?;
    }
    Ok(())
}

/// Combined result of all shards.
#[derive(Debug, Clone)]
pub struct ShardedOutcome {
    pub phase: DriverPhase,
    pub shards: Vec<SearchOutcome>,
    pub checkpoint: Checkpoint,
    pub persistence_failures: u64,
    pub elapsed: Duration,
}

impl ShardedOutcome {
    /// Indices passed by the shards in this run, skipped ones included.
    pub fn total_attempts(&self) -> BigUint {
        self.shards
            .iter()
            .fold(BigUint::zero(), |acc, s| acc + &s.state.total_attempts)
    }

    pub fn found(&self) -> &[String] {
        &self.checkpoint.found_candidates
    }
}

/// Run one driver per shard in parallel.
///
/// Each shard owns its own ledger and checkpoint file and skips indices
/// recorded by every other ledger of the search. When all shards return, an
/// aggregate checkpoint is written to `options.checkpoint_path`. Its
/// `totalAttempts` is the contiguous prefix covered by all ledgers together,
/// so a later single-worker run resumes without gaps. A fatal error in any
/// shard stops the others.
pub fn run_sharded<F>(
    indexer: &CombinationIndexer,
    validator: &dyn Validate,
    options: &DriverOptions,
    workers: usize,
    stop: StopHandle,
    progress: F,
) -> Result<ShardedOutcome>
where
    F: Fn(usize, &Progress) + Sync,
{
    let started = Instant::now();
    // Shards resume from their own files; the aggregate only carries the
    // start time and earlier matches forward.
    let previous = match CheckpointStore::new(&options.checkpoint_path).load() {
        Ok(previous) => previous,
        Err(e) => {
            warn!(error = %e, "could not read aggregate checkpoint");
            None
        }
    };
    let search_started_at = previous
        .as_ref()
        .map(|c| c.search_started_at.clone())
        .unwrap_or_else(now_timestamp);

    let shards = partition(indexer.space_size(), workers);
    for shard in &shards {
        discard_stale_checkpoint(&shard_path(&options.checkpoint_path, shard.id), shard)?;
    }
    info!(shards = shards.len(), space_size = %indexer.space_size(), "starting sharded search");

    // The first match anywhere ends every shard when configured to.
    let first_match_stop = options.stop_on_first_match;

    let results: Vec<Result<SearchOutcome>> = shards
        .par_iter()
        .map(|shard| {
            let mut driver = SearchDriver::for_range(
                indexer,
                validator,
                shard_options(options, shard),
                shard.start.clone(),
                shard.end.clone(),
            )
            .with_stop_handle(stop.clone());

            let outcome = driver.run(|p| progress(shard.id, p));
            match &outcome {
                Err(_) => stop.request_stop(),
                Ok(o) if first_match_stop && o.stop_reason == Some(StopReason::FirstMatch) => {
                    stop.request_stop();
                }
                Ok(_) => {}
            }
            outcome
        })
        .collect();

    let mut outcomes = Vec::with_capacity(results.len());
    let mut first_error: Option<SearchError> = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(_) => {}
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let mut persistence_failures: u64 = outcomes.iter().map(|o| o.state.persistence_failures).sum();

    let mut found: Vec<String> = previous.map(|c| c.found_candidates).unwrap_or_default();
    for candidate in outcomes.iter().flat_map(|o| o.state.found.iter()) {
        if !found.contains(candidate) {
            found.push(candidate.clone());
        }
    }

    let mut ledgers = vec![options.ledger_path.clone()];
    ledgers.extend(existing_shard_paths(&options.ledger_path));
    let header = LedgerHeader::for_indexer(indexer);
    let covered_prefix = match merge_ledgers(&ledgers, &header) {
        Ok(covered) => Some(covered.first_gap_from(&BigUint::zero())),
        Err(e) => {
            persistence_failures += 1;
            warn!(error = %e, "could not merge shard ledgers, aggregate checkpoint not saved");
            None
        }
    };

    let checkpoint = Checkpoint::new(
        covered_prefix.as_ref().unwrap_or(&BigUint::zero()),
        found,
        search_started_at,
        Some(indexer.space_size()),
    );
    if covered_prefix.is_some() {
        if let Err(e) = CheckpointStore::new(&options.checkpoint_path).save(&checkpoint) {
            persistence_failures += 1;
            warn!(error = %e, "aggregate checkpoint save failed, resumability degraded");
        }
    }
    if let Some(path) = &options.found_path {
        if let Err(e) = append_missing_found(path, &checkpoint.found_candidates) {
            persistence_failures += 1;
            warn!(path = %path.display(), error = %e, "could not update found file");
        }
    }

    let phase = if outcomes.iter().all(|o| o.is_complete()) {
        DriverPhase::Completed
    } else {
        DriverPhase::Stopped
    };

    Ok(ShardedOutcome {
        phase,
        shards: outcomes,
        checkpoint,
        persistence_failures,
        elapsed: started.elapsed(),
    })
}

/// Copy shard matches into the main found file, skipping ones already there.
fn append_missing_found(path: &Path, found: &[String]) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(SearchError::persistence(format!("read {}", path.display()), e)),
    };
    let existing: Vec<&str> = existing.lines().map(str::trim).collect();
    for candidate in found {
        if !existing.contains(&candidate.as_str()) {
            crate::io_utils::append_line(path, candidate, true)
                .map_err(|e| SearchError::persistence(format!("append {}", path.display()), e))?;
        }
    }
    Ok(())
}
