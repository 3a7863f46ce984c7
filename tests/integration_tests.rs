use num_bigint::BigUint;
use slot_finder::ledger::{merge_ledgers, replay};
use slot_finder::shard::shard_path;
use slot_finder::{
    partition, run_sharded, AcceptAll, Candidate, CheckpointStore, CombinationIndexer,
    DriverOptions, DriverPhase, LedgerHeader, OracleError, SearchDriver, SearchError, StopHandle,
    StopReason, Template, Validator, Vocabulary,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn indexer(template: &str) -> CombinationIndexer {
    CombinationIndexer::new(
        Vocabulary::parse("a\nb\nc\nx\ny").unwrap(),
        Template::parse(template).unwrap(),
    )
}

fn options(dir: &Path) -> DriverOptions {
    let mut options = DriverOptions::new(dir.join("attempts.ledger"), dir.join("checkpoint.json"));
    options.found_path = Some(dir.join("found.txt"));
    options.sync_ledger = false;
    options
}

#[test]
fn test_interrupted_search_resumes_without_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("x ? y ?");
    let seen: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());
    let calls = AtomicUsize::new(0);
    let stop = StopHandle::new();

    let oracle_stop = stop.clone();
    let validator = Validator::new(AcceptAll, |c: &Candidate| -> Result<bool, OracleError> {
        *seen.lock().unwrap().entry(c.to_string()).or_insert(0) += 1;
        if calls.fetch_add(1, Ordering::SeqCst) + 1 == 7 {
            oracle_stop.request_stop();
        }
        Ok(c.to_string() == "x c y a")
    });

    let mut first = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .with_stop_handle(stop.clone());
    let outcome = first.run(|_| {}).unwrap();
    assert_eq!(outcome.phase, DriverPhase::Stopped);
    assert_eq!(outcome.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(outcome.state.total_attempts, BigUint::from(7u32));

    let saved = CheckpointStore::new(dir.path().join("checkpoint.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.total_attempts, "7");

    let mut second = SearchDriver::new(&indexer, &validator, options(dir.path()));
    let outcome = second.run(|_| {}).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.state.total_attempts, BigUint::from(25u32));
    assert_eq!(outcome.state.validated, 18);
    assert_eq!(outcome.state.found, vec!["x c y a".to_string()]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 25);
    assert!(seen.values().all(|&count| count == 1));

    let ledger = replay(&dir.path().join("attempts.ledger")).unwrap().unwrap();
    assert_eq!(ledger.attempted.len(), BigUint::from(25u32));
    assert_eq!(ledger.resume_from, BigUint::from(25u32));
}

#[test]
fn test_lost_checkpoint_resumes_from_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let stop = StopHandle::new();
    let calls = AtomicUsize::new(0);

    let oracle_stop = stop.clone();
    let validator = Validator::new(AcceptAll, |_: &Candidate| -> Result<bool, OracleError> {
        if calls.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
            oracle_stop.request_stop();
        }
        Ok(false)
    });

    SearchDriver::new(&indexer, &validator, options(dir.path()))
        .with_stop_handle(stop)
        .run(|_| {})
        .unwrap();
    std::fs::remove_file(dir.path().join("checkpoint.json")).unwrap();

    let outcome = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.state.validated, 15);
    assert_eq!(calls.load(Ordering::SeqCst), 25);
}

#[test]
fn test_match_is_persisted_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("x ? y ?");
    let validator = Validator::new(AcceptAll, |c: &Candidate| -> Result<bool, OracleError> {
        Ok(c.tokens()[3] == "c")
    });
    let mut opts = options(dir.path());
    opts.stop_on_first_match = true;

    let outcome = SearchDriver::new(&indexer, &validator, opts)
        .run(|_| {})
        .unwrap();
    assert_eq!(outcome.stop_reason, Some(StopReason::FirstMatch));

    let found = std::fs::read_to_string(dir.path().join("found.txt")).unwrap();
    assert_eq!(found.lines().collect::<Vec<_>>(), vec!["x a y c"]);

    let saved = CheckpointStore::new(dir.path().join("checkpoint.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.valid_count, 1);
    assert_eq!(saved.found_candidates, vec!["x a y c".to_string()]);
    assert_eq!(saved.total_attempts, "3");
}

#[test]
fn test_found_file_entries_recovered_into_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("found.txt"), "x c y c\n").unwrap();
    let indexer = indexer("x ? y ?");
    let validator = Validator::new(AcceptAll, |_: &Candidate| -> Result<bool, OracleError> {
        Ok(false)
    });

    let outcome = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();
    assert_eq!(outcome.state.found, vec!["x c y c".to_string()]);

    let saved = CheckpointStore::new(dir.path().join("checkpoint.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.valid_count, 1);
}

#[test]
fn test_unknown_fixed_token_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let vocab_path = dir.path().join("vocabulary.txt");
    std::fs::write(&vocab_path, "a\nb\nc\n").unwrap();
    let indexer = CombinationIndexer::new(
        Vocabulary::load(&vocab_path).unwrap(),
        Template::parse("x ? y ?").unwrap(),
    );
    let validator = Validator::new(AcceptAll, |_: &Candidate| -> Result<bool, OracleError> {
        Ok(true)
    });

    let err = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap_err();

    assert!(err.is_configuration());
    match err {
        SearchError::UnknownFixedTokens { tokens } => assert_eq!(tokens, vec!["x", "y"]),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dir.path().join("attempts.ledger").exists());
    assert!(!dir.path().join("checkpoint.json").exists());
}

#[test]
fn test_changed_template_rejects_existing_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let validator = Validator::new(AcceptAll, |_: &Candidate| -> Result<bool, OracleError> {
        Ok(false)
    });

    let original = indexer("x ? y ?");
    SearchDriver::new(&original, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();
    std::fs::remove_file(dir.path().join("checkpoint.json")).unwrap();
    let before = std::fs::read(dir.path().join("attempts.ledger")).unwrap();

    let changed = indexer("x ? y ? ?");
    let mut driver = SearchDriver::new(&changed, &validator, options(dir.path()));
    let err = driver.run(|_| {}).unwrap_err();

    assert!(matches!(
        err,
        SearchError::ParameterMismatch {
            field: "free_positions",
            ..
        }
    ));
    assert_eq!(driver.phase(), DriverPhase::Aborted);
    assert_eq!(std::fs::read(dir.path().join("attempts.ledger")).unwrap(), before);
}

#[test]
fn test_oracle_outage_counts_as_no_match() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? y ?");
    let validator = Validator::new(AcceptAll, |c: &Candidate| -> Result<bool, OracleError> {
        if c.tokens()[0] == "a" {
            Err(OracleError::Timeout(std::time::Duration::from_secs(30)))
        } else {
            Ok(c.to_string() == "b y b")
        }
    });

    let outcome = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.state.oracle_failures, 5);
    assert_eq!(outcome.state.found, vec!["b y b".to_string()]);
}

#[test]
fn test_cancel_before_start_is_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let validator = Validator::new(AcceptAll, |_: &Candidate| -> Result<bool, OracleError> {
        Ok(false)
    });
    let stop = StopHandle::new();
    stop.request_stop();

    let outcome = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .with_stop_handle(stop)
        .run(|_| {})
        .unwrap();
    assert_eq!(outcome.phase, DriverPhase::Stopped);
    assert_eq!(outcome.state.total_attempts, BigUint::from(0u32));

    let outcome = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.state.validated, 25);
}

#[test]
fn test_sharded_search_matches_single_worker() {
    let indexer = indexer("x ? ? y");
    let oracle = |c: &Candidate| -> Result<bool, OracleError> {
        Ok(c.tokens()[1] == c.tokens()[2])
    };
    let validator = Validator::new(AcceptAll, oracle);

    let single_dir = tempfile::tempdir().unwrap();
    let single = SearchDriver::new(&indexer, &validator, options(single_dir.path()))
        .run(|_| {})
        .unwrap();

    let sharded_dir = tempfile::tempdir().unwrap();
    let opts = options(sharded_dir.path());
    let sharded = run_sharded(&indexer, &validator, &opts, 3, StopHandle::new(), |_, _| {}).unwrap();

    assert_eq!(sharded.phase, DriverPhase::Completed);
    assert_eq!(sharded.total_attempts(), BigUint::from(25u32));

    let mut expected = single.state.found.clone();
    let mut found = sharded.found().to_vec();
    expected.sort();
    found.sort();
    assert_eq!(found, expected);
    assert_eq!(found.len(), 5);

    let saved = CheckpointStore::new(&opts.checkpoint_path).load().unwrap().unwrap();
    assert_eq!(saved.total_attempts, "25");
    assert_eq!(saved.valid_count, 5);

    let ledgers: Vec<_> = partition(indexer.space_size(), 3)
        .iter()
        .map(|s| shard_path(&opts.ledger_path, s.id))
        .collect();
    let covered = merge_ledgers(&ledgers, &LedgerHeader::for_indexer(&indexer)).unwrap();
    assert_eq!(covered.len(), BigUint::from(25u32));
    assert_eq!(covered.run_count(), 1);
}

/// Counts every candidate it sees and requests a stop after `stop_after`
/// calls.
struct CountingOracle {
    seen: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
    stop_after: AtomicUsize,
    stop: StopHandle,
}

impl CountingOracle {
    fn new(stop: StopHandle, stop_after: usize) -> Self {
        CountingOracle {
            seen: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            stop_after: AtomicUsize::new(stop_after),
            stop,
        }
    }

    fn rearm(&self, stop_after: usize) {
        self.calls.store(0, Ordering::SeqCst);
        self.stop_after.store(stop_after, Ordering::SeqCst);
    }

    fn assert_each_validated_once(&self, space: usize) {
        let seen = self.seen.lock().unwrap();
        assert_eq!(seen.len(), space, "missing candidates: {:?}", seen.keys());
        for (candidate, count) in seen.iter() {
            assert_eq!(*count, 1, "{} validated {} times", candidate, count);
        }
    }
}

impl CountingOracle {
    fn check(&self, candidate: &Candidate) -> Result<bool, OracleError> {
        *self.seen.lock().unwrap().entry(candidate.to_string()).or_insert(0) += 1;
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.stop_after.load(Ordering::SeqCst) {
            self.stop.request_stop();
        }
        Ok(candidate.to_string() == "b b")
    }
}

#[test]
fn test_stopped_sharded_search_resumes_single_worker() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let stop = StopHandle::new();
    let oracle = CountingOracle::new(stop.clone(), 3);
    let validator = Validator::new(AcceptAll, |c: &Candidate| oracle.check(c));

    let sharded = run_sharded(&indexer, &validator, &options(dir.path()), 3, stop, |_, _| {}).unwrap();
    assert_eq!(sharded.phase, DriverPhase::Stopped);

    oracle.rearm(0);
    let single = SearchDriver::new(&indexer, &validator, options(dir.path()))
        .run(|_| {})
        .unwrap();

    assert!(single.is_complete());
    assert_eq!(single.state.total_attempts, BigUint::from(25u32));
    assert_eq!(single.state.found, vec!["b b".to_string()]);
    oracle.assert_each_validated_once(25);
}

#[test]
fn test_stopped_sharded_search_resumes_with_fewer_workers() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let stop = StopHandle::new();
    let oracle = CountingOracle::new(stop.clone(), 4);
    let validator = Validator::new(AcceptAll, |c: &Candidate| oracle.check(c));
    let opts = options(dir.path());

    let first = run_sharded(&indexer, &validator, &opts, 3, stop, |_, _| {}).unwrap();
    assert_eq!(first.phase, DriverPhase::Stopped);

    oracle.rearm(0);
    let second = run_sharded(&indexer, &validator, &opts, 2, StopHandle::new(), |_, _| {}).unwrap();
    assert_eq!(second.phase, DriverPhase::Completed);
    assert_eq!(second.found(), ["b b".to_string()]);
    oracle.assert_each_validated_once(25);

    let saved = CheckpointStore::new(&opts.checkpoint_path).load().unwrap().unwrap();
    assert_eq!(saved.total_attempts, "25");
}

#[test]
fn test_stopped_single_worker_search_resumes_sharded() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let stop = StopHandle::new();
    let oracle = CountingOracle::new(stop.clone(), 5);
    let validator = Validator::new(AcceptAll, |c: &Candidate| oracle.check(c));
    let opts = options(dir.path());

    let first = SearchDriver::new(&indexer, &validator, opts.clone())
        .with_stop_handle(stop)
        .run(|_| {})
        .unwrap();
    assert_eq!(first.phase, DriverPhase::Stopped);

    oracle.rearm(0);
    let sharded = run_sharded(&indexer, &validator, &opts, 3, StopHandle::new(), |_, _| {}).unwrap();
    assert_eq!(sharded.phase, DriverPhase::Completed);
    oracle.assert_each_validated_once(25);

    let saved = CheckpointStore::new(&opts.checkpoint_path).load().unwrap().unwrap();
    assert_eq!(saved.total_attempts, "25");
    assert_eq!(saved.found_candidates, vec!["b b".to_string()]);
}

#[test]
fn test_sharded_aggregate_save_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let indexer = indexer("? ?");
    let validator = Validator::new(AcceptAll, |c: &Candidate| -> Result<bool, OracleError> {
        Ok(c.to_string() == "a c")
    });
    let opts = options(dir.path());
    // A directory where the aggregate checkpoint should go.
    std::fs::create_dir(&opts.checkpoint_path).unwrap();

    let outcome = run_sharded(&indexer, &validator, &opts, 2, StopHandle::new(), |_, _| {}).unwrap();

    assert_eq!(outcome.phase, DriverPhase::Completed);
    assert!(outcome.persistence_failures >= 1);
    assert_eq!(outcome.found(), ["a c".to_string()]);
    let found = std::fs::read_to_string(opts.found_path.as_ref().unwrap()).unwrap();
    assert_eq!(found.lines().collect::<Vec<_>>(), vec!["a c"]);
}
