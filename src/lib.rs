pub mod attempt_set;
pub mod checkpoint;
pub mod checksum;
pub mod config;
pub mod driver;
pub mod error;
pub mod indexer;
pub mod io_utils;
pub mod ledger;
pub mod shard;
pub mod template;
pub mod validator;
pub mod vocabulary;

pub use attempt_set::AttemptSet;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use checksum::Bip39Checksum;
pub use config::{ChecksumMode, SearchConfig};
pub use driver::{
    DriverOptions, DriverPhase, DriverState, Progress, SearchDriver, SearchOutcome, StopHandle,
    StopReason,
};
pub use error::{OracleError, Result, SearchError};
pub use indexer::{Candidate, CombinationIndexer};
pub use ledger::{AttemptLedger, LedgerHeader};
pub use shard::{partition, run_sharded, Shard, ShardedOutcome};
pub use template::{Slot, Template};
pub use validator::{
    AcceptAll, CommandOracle, Oracle, RetryingOracle, Validate, Validator, Verdict, WellFormed,
};
pub use vocabulary::Vocabulary;
