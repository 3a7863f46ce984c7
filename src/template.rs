use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SearchError};
use crate::vocabulary::Vocabulary;

/// Marker for a free slot in the textual template form.
pub const FREE_MARKER: &str = "?";
const ALT_FREE_MARKER: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Fixed(String),
    Free,
}

/// The known sequence with its unknown positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    slots: Vec<Slot>,
}

impl Template {
    pub fn new(slots: Vec<Slot>) -> Self {
        Template { slots }
    }

    /// Parse a whitespace-separated template where `?` or `_` marks a free
    /// slot, e.g. `"x ? y ?"`.
    pub fn parse(text: &str) -> Result<Self> {
        let slots: Vec<Slot> = text
            .split_whitespace()
            .map(|token| {
                if token == FREE_MARKER || token == ALT_FREE_MARKER {
                    Slot::Free
                } else {
                    Slot::Fixed(token.to_string())
                }
            })
            .collect();

        if slots.is_empty() {
            return Err(SearchError::InvalidTemplate("template is empty".to_string()));
        }
        Ok(Template { slots })
    }

    /// Build a template from the known tokens in order, with free slots
    /// inserted at the given 1-based positions of the full sequence.
    pub fn from_known(known: &[String], free_positions: &[usize]) -> Result<Self> {
        let length = known.len() + free_positions.len();
        let mut free = vec![false; length];

        for &position in free_positions {
            if position == 0 || position > length {
                return Err(SearchError::InvalidTemplate(format!(
                    "free position {} outside 1..={}",
                    position, length
                )));
            }
            if free[position - 1] {
                return Err(SearchError::InvalidTemplate(format!(
                    "free position {} listed twice",
                    position
                )));
            }
            free[position - 1] = true;
        }

        let mut known = known.iter();
        let slots = free
            .into_iter()
            .map(|is_free| match is_free {
                true => Some(Slot::Free),
                false => known.next().map(|token| Slot::Fixed(token.clone())),
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| SearchError::InvalidTemplate("not enough known tokens".to_string()))?;

        if slots.is_empty() {
            return Err(SearchError::InvalidTemplate("template is empty".to_string()));
        }
        Ok(Template { slots })
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 1-based positions of the free slots, ascending.
    pub fn free_positions(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Free))
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Free)).count()
    }

    pub fn known_tokens(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Fixed(token) => Some(token.clone()),
                Slot::Free => None,
            })
            .collect()
    }

    /// Fixed tokens missing from `vocabulary`, deduplicated, in template order.
    pub fn unknown_tokens(&self, vocabulary: &Vocabulary) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for token in self.known_tokens() {
            if !vocabulary.contains(&token) && !missing.contains(&token) {
                missing.push(token);
            }
        }
        missing
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match slot {
                Slot::Fixed(token) => f.write_str(token)?,
                Slot::Free => f.write_str(FREE_MARKER)?,
            }
        }
        Ok(())
    }
}
