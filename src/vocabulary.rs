use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, SearchError};

/// Immutable ordered token list. Position in the list is the digit value a
/// token contributes to a combination index.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Vocabulary {
    /// Build a vocabulary from tokens in index order.
    ///
    /// Rejects an empty list and duplicate tokens, since either would make
    /// index decoding ambiguous. Duplicates are reported by 1-based position.
    pub fn new<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(SearchError::EmptyVocabulary);
        }

        let mut positions = HashMap::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            if let Some(first) = positions.insert(token.clone(), i) {
                return Err(SearchError::DuplicateToken {
                    token: token.clone(),
                    first: first + 1,
                    second: i + 1,
                });
            }
        }

        Ok(Vocabulary { tokens, positions })
    }

    /// Parse newline-separated tokens. Surrounding whitespace is trimmed and
    /// blank lines are skipped. Duplicates are reported by file line number.
    pub fn parse(text: &str) -> Result<Self> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut tokens = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(first) = seen.insert(token, lineno + 1) {
                return Err(SearchError::DuplicateToken {
                    token: token.to_string(),
                    first,
                    second: lineno + 1,
                });
            }
            tokens.push(token);
        }
        Self::new(tokens)
    }

    /// Load the whole vocabulary file before any encoding happens.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SearchError::VocabularyLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.positions.get(token).copied()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.positions.contains_key(token)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_lines() {
        let vocab = Vocabulary::parse("a\n\n  b \nc\n").unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.token(1), Some("b"));
        assert_eq!(vocab.index_of("c"), Some(2));
        assert!(!vocab.contains("d"));
    }

    #[test]
    fn test_empty_vocabulary_rejected() {
        assert!(matches!(
            Vocabulary::parse("\n\n"),
            Err(SearchError::EmptyVocabulary)
        ));
    }

    #[test]
    fn test_duplicate_token_rejected() {
        match Vocabulary::parse("a\nb\na\n") {
            Err(SearchError::DuplicateToken {
                token,
                first,
                second,
            }) => {
                assert_eq!(token, "a");
                assert_eq!(first, 1);
                assert_eq!(second, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_reported_by_file_line() {
        match Vocabulary::parse("\na\n\nb\n\n  a\n") {
            Err(SearchError::DuplicateToken { first, second, .. }) => {
                assert_eq!((first, second), (2, 6));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = Vocabulary::load(Path::new("/nonexistent/words.txt")).unwrap_err();
        assert!(matches!(err, SearchError::VocabularyLoad { .. }));
        assert!(err.is_configuration());
    }
}
