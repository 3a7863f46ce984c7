use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::fmt;

use crate::error::{Result, SearchError};
use crate::template::{Slot, Template};
use crate::vocabulary::Vocabulary;

/// A fully resolved token sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate(Vec<String>);

impl Candidate {
    pub fn new(tokens: Vec<String>) -> Self {
        Candidate(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Mixed-radix mapping between combination indices and candidates.
///
/// The free slots are the digits of a base-`V` number, most significant
/// digit at the first free position. Fixed slots are copied verbatim.
#[derive(Debug, Clone)]
pub struct CombinationIndexer {
    vocabulary: Vocabulary,
    template: Template,
    radix: BigUint,
    space_size: BigUint,
}

impl CombinationIndexer {
    /// Fixed slots are not checked against the vocabulary here; see
    /// [`CombinationIndexer::checked`].
    pub fn new(vocabulary: Vocabulary, template: Template) -> Self {
        let radix = BigUint::from(vocabulary.len());
        let space_size = radix.pow(template.free_count() as u32);

        CombinationIndexer {
            vocabulary,
            template,
            radix,
            space_size,
        }
    }

    /// Like [`new`](Self::new), but fails with
    /// [`SearchError::UnknownFixedTokens`] if any fixed slot holds a token
    /// outside the vocabulary.
    pub fn checked(vocabulary: Vocabulary, template: Template) -> Result<Self> {
        let unknown = template.unknown_tokens(&vocabulary);
        if !unknown.is_empty() {
            return Err(SearchError::UnknownFixedTokens { tokens: unknown });
        }
        Ok(Self::new(vocabulary, template))
    }

    /// `V^M`. One when the template has no free slots.
    pub fn space_size(&self) -> &BigUint {
        &self.space_size
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Decode `index` into its candidate. `None` outside `[0, V^M)`.
    pub fn encode(&self, index: &BigUint) -> Option<Candidate> {
        if index >= &self.space_size {
            return None;
        }

        let free = self.template.free_count();
        let mut digits = vec![0usize; free];
        let mut rest = index.clone();
        for digit in digits.iter_mut().rev() {
            // Each remainder is < V, which came from a usize.
            *digit = (&rest % &self.radix).to_usize()?;
            rest /= &self.radix;
        }
        debug_assert!(rest.is_zero());

        let mut digits = digits.into_iter();
        let tokens = self
            .template
            .slots()
            .iter()
            .map(|slot| match slot {
                Slot::Fixed(token) => Some(token.clone()),
                Slot::Free => digits
                    .next()
                    .and_then(|d| self.vocabulary.token(d))
                    .map(str::to_string),
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Candidate(tokens))
    }

    /// Inverse of [`encode`](Self::encode). `None` if the candidate has the
    /// wrong length, disagrees with a fixed slot, or uses a token outside the
    /// vocabulary.
    pub fn decode(&self, candidate: &Candidate) -> Option<BigUint> {
        if candidate.len() != self.template.len() {
            return None;
        }

        let mut index = BigUint::zero();
        for (slot, token) in self.template.slots().iter().zip(candidate.tokens()) {
            match slot {
                Slot::Fixed(fixed) if fixed != token => return None,
                Slot::Fixed(_) => {}
                Slot::Free => {
                    let digit = self.vocabulary.index_of(token)?;
                    index = index * &self.radix + BigUint::from(digit);
                }
            }
        }
        Some(index)
    }
}
