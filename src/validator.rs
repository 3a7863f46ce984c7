use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::indexer::Candidate;

/// Cheap local structural check. Pure, no I/O.
pub trait WellFormed: Send + Sync {
    fn is_well_formed(&self, candidate: &Candidate) -> bool;
}

impl<F> WellFormed for F
where
    F: Fn(&Candidate) -> bool + Send + Sync,
{
    fn is_well_formed(&self, candidate: &Candidate) -> bool {
        self(candidate)
    }
}

/// Accepts every candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl WellFormed for AcceptAll {
    fn is_well_formed(&self, _candidate: &Candidate) -> bool {
        true
    }
}

/// External, possibly slow and fallible check.
pub trait Oracle: Send + Sync {
    fn check(&self, candidate: &Candidate) -> Result<bool, OracleError>;
}

impl<F> Oracle for F
where
    F: Fn(&Candidate) -> Result<bool, OracleError> + Send + Sync,
{
    fn check(&self, candidate: &Candidate) -> Result<bool, OracleError> {
        self(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    NoMatch,
    /// Rejected locally; the oracle was not consulted.
    Malformed,
    /// The oracle failed. Counts as no match.
    OracleFailed,
}

impl Verdict {
    pub fn is_match(self) -> bool {
        self == Verdict::Match
    }
}

/// What the driver needs from validation.
pub trait Validate: Send + Sync {
    fn validate(&self, candidate: &Candidate) -> Verdict;
}

/// Two-stage check: local well-formedness first, then the oracle.
pub struct Validator<W, O> {
    well_formed: W,
    oracle: O,
}

impl<W: WellFormed, O: Oracle> Validator<W, O> {
    pub fn new(well_formed: W, oracle: O) -> Self {
        Validator {
            well_formed,
            oracle,
        }
    }
}

impl<W: WellFormed, O: Oracle> Validate for Validator<W, O> {
    /// Never fails: an oracle error is logged and reported as
    /// [`Verdict::OracleFailed`].
    fn validate(&self, candidate: &Candidate) -> Verdict {
        if !self.well_formed.is_well_formed(candidate) {
            return Verdict::Malformed;
        }
        match self.oracle.check(candidate) {
            Ok(true) => Verdict::Match,
            Ok(false) => Verdict::NoMatch,
            Err(e) => {
                debug!(error = %e, "oracle check failed, treating as no match");
                Verdict::OracleFailed
            }
        }
    }
}

/// Retries transient oracle failures a bounded number of times.
pub struct RetryingOracle<O> {
    inner: O,
    max_retries: u32,
    backoff: Duration,
}

impl<O: Oracle> RetryingOracle<O> {
    pub fn new(inner: O, max_retries: u32, backoff: Duration) -> Self {
        RetryingOracle {
            inner,
            max_retries,
            backoff,
        }
    }
}

impl<O: Oracle> Oracle for RetryingOracle<O> {
    fn check(&self, candidate: &Candidate) -> Result<bool, OracleError> {
        let mut attempt = 0;
        loop {
            match self.inner.check(candidate) {
                Ok(found) => return Ok(found),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "retrying oracle call");
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff * attempt);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Runs an external program per candidate.
///
/// The candidate is written to the program's stdin as one line. Exit status
/// zero means match, any other exit code means no match. Failing to spawn,
/// exceeding the timeout, or being killed by a signal is an [`OracleError`].
///
/// On unix the child gets its own process group, so a Ctrl-C aimed at the
/// search lets the in-flight check finish.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl CommandOracle {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        CommandOracle {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl Oracle for CommandOracle {
    fn check(&self, candidate: &Candidate) -> Result<bool, OracleError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading its input closes the pipe.
            if let Err(e) = writeln!(stdin, "{}", candidate) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            }
        }

        let started = Instant::now();
        loop {
            let status = match child.try_wait() {
                Ok(status) => status,
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            };
            if let Some(status) = status {
                return match status.code() {
                    Some(0) => Ok(true),
                    Some(_) => Ok(false),
                    None => Err(OracleError::Terminated(status)),
                };
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OracleError::Timeout(self.timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
