use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::BTreeMap;

/// Set of attempted indices stored as disjoint half-open runs `[start, end)`.
///
/// Enumeration is monotonic, so a healthy ledger collapses into a single run;
/// gaps only appear around crashes or when shards are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptSet {
    runs: BTreeMap<BigUint, BigUint>,
}

impl AttemptSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The run whose start is the greatest start `<= index`.
    fn run_at_or_before(&self, index: &BigUint) -> Option<(&BigUint, &BigUint)> {
        self.runs.range(..=index.clone()).next_back()
    }

    pub fn contains(&self, index: &BigUint) -> bool {
        self.run_at_or_before(index)
            .map(|(_, end)| index < end)
            .unwrap_or(false)
    }

    /// Insert one index. Returns `false` if it was already present.
    pub fn insert(&mut self, index: BigUint) -> bool {
        let next = &index + 1u32;
        self.insert_range(index, next)
    }

    /// Insert `[start, end)`, coalescing with touching or overlapping runs.
    /// Returns `true` if any index was new.
    pub fn insert_range(&mut self, start: BigUint, end: BigUint) -> bool {
        if start >= end {
            return false;
        }

        if let Some((_, run_end)) = self.run_at_or_before(&start) {
            if run_end >= &end {
                return false;
            }
        }

        let mut new_start = start;
        let mut new_end = end;

        // Absorb a preceding run that reaches new_start.
        if let Some((run_start, run_end)) = self.run_at_or_before(&new_start) {
            if run_end >= &new_start {
                let run_start = run_start.clone();
                if let Some(run_end) = self.runs.remove(&run_start) {
                    if run_end > new_end {
                        new_end = run_end;
                    }
                }
                new_start = run_start;
            }
        }

        // Absorb every run starting inside [new_start, new_end].
        let overlapping: Vec<BigUint> = self
            .runs
            .range(new_start.clone()..=new_end.clone())
            .map(|(s, _)| s.clone())
            .collect();
        for run_start in overlapping {
            if let Some(run_end) = self.runs.remove(&run_start) {
                if run_end > new_end {
                    new_end = run_end;
                }
            }
        }

        self.runs.insert(new_start, new_end);
        true
    }

    /// Union another set into this one.
    pub fn union(&mut self, other: &AttemptSet) {
        for (start, end) in &other.runs {
            self.insert_range(start.clone(), end.clone());
        }
    }

    /// Total number of attempted indices.
    pub fn len(&self) -> BigUint {
        self.runs
            .iter()
            .fold(BigUint::zero(), |acc, (start, end)| acc + (end - start))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// First index `>= from` that has not been attempted.
    pub fn first_gap_from(&self, from: &BigUint) -> BigUint {
        match self.run_at_or_before(from) {
            Some((_, end)) if from < end => end.clone(),
            _ => from.clone(),
        }
    }

    pub fn runs(&self) -> impl Iterator<Item = (&BigUint, &BigUint)> {
        self.runs.iter()
    }
}
