use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SearchError>;

/// Everything that can stop a search before or during enumeration.
///
/// Configuration variants are fatal and surface before the first index is
/// processed. `Persistence` is produced by the ledger and checkpoint stores;
/// the driver downgrades it to a warning once enumeration has started.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("fixed template tokens not found in vocabulary: {}", tokens.join(", "))]
    UnknownFixedTokens { tokens: Vec<String> },

    #[error("vocabulary is empty")]
    EmptyVocabulary,

    #[error("vocabulary contains duplicate token '{token}' at lines {first} and {second}")]
    DuplicateToken {
        token: String,
        first: usize,
        second: usize,
    },

    #[error("failed to load vocabulary from {}: {source}", path.display())]
    VocabularyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("resumed state does not match search parameters: {field} is {found}, expected {expected}")]
    ParameterMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("corrupt search state in {}: {detail}", path.display())]
    CorruptState { path: PathBuf, detail: String },

    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SearchError {
    /// Fatal errors that must abort the search before enumeration begins.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, SearchError::Persistence { .. })
    }

    pub(crate) fn persistence(context: impl Into<String>, source: std::io::Error) -> Self {
        SearchError::Persistence {
            context: context.into(),
            source,
        }
    }
}

/// Failure of the external check. Never fatal: the driver counts it and
/// treats the candidate as a non-match.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transient oracle failure: {0}")]
    Transient(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("oracle process ended without an exit code ({0})")]
    Terminated(std::process::ExitStatus),

    #[error("oracle i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tokens_message_lists_offenders() {
        let err = SearchError::UnknownFixedTokens {
            tokens: vec!["zebra".to_string(), "quux".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "fixed template tokens not found in vocabulary: zebra, quux"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_persistence_is_not_configuration() {
        let err = SearchError::persistence(
            "append to ledger",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(!err.is_configuration());
        assert_eq!(err.to_string(), "append to ledger: disk full");
    }
}
