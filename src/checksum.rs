//! BIP39-style mnemonic checksum.
//!
//! Each word contributes 11 bits (its position in a 2048-word list). The
//! concatenated bits are entropy followed by a checksum of `bits / 33` bits,
//! which must equal the leading bits of SHA-256 over the entropy bytes.

use sha2::{Digest, Sha256};

use crate::indexer::Candidate;
use crate::validator::WellFormed;
use crate::vocabulary::Vocabulary;

pub const BIP39_WORDLIST_LEN: usize = 2048;
const BITS_PER_WORD: usize = 11;
const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Rejects candidates whose trailing checksum bits do not match.
#[derive(Debug, Clone)]
pub struct Bip39Checksum {
    vocabulary: Vocabulary,
}

impl Bip39Checksum {
    /// `None` unless the vocabulary has exactly 2048 tokens.
    pub fn new(vocabulary: Vocabulary) -> Option<Self> {
        (vocabulary.len() == BIP39_WORDLIST_LEN).then_some(Bip39Checksum { vocabulary })
    }

    pub fn is_valid_length(words: usize) -> bool {
        VALID_WORD_COUNTS.contains(&words)
    }

    fn word_indices(&self, candidate: &Candidate) -> Option<Vec<usize>> {
        candidate
            .tokens()
            .iter()
            .map(|token| self.vocabulary.index_of(token))
            .collect()
    }
}

/// Check the checksum over raw 11-bit word indices.
pub fn checksum_matches(indices: &[usize]) -> bool {
    if !VALID_WORD_COUNTS.contains(&indices.len()) {
        return false;
    }

    let total_bits = indices.len() * BITS_PER_WORD;
    let checksum_bits = total_bits / 33;
    let entropy_bits = total_bits - checksum_bits;

    let mut bits = Vec::with_capacity(total_bits);
    for &index in indices {
        if index >= BIP39_WORDLIST_LEN {
            return false;
        }
        for shift in (0..BITS_PER_WORD).rev() {
            bits.push((index >> shift) & 1 == 1);
        }
    }

    let entropy: Vec<u8> = bits[..entropy_bits]
        .chunks(8)
        .map(|byte| byte.iter().fold(0u8, |acc, &bit| (acc << 1) | bit as u8))
        .collect();
    let digest = Sha256::digest(&entropy);

    bits[entropy_bits..]
        .iter()
        .enumerate()
        .all(|(i, &bit)| ((digest[i / 8] >> (7 - i % 8)) & 1 == 1) == bit)
}

impl WellFormed for Bip39Checksum {
    fn is_well_formed(&self, candidate: &Candidate) -> bool {
        match self.word_indices(candidate) {
            Some(indices) => checksum_matches(&indices),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Synthetic list: only the positions matter to the checksum.
    fn wordlist() -> Vocabulary {
        Vocabulary::new((0..BIP39_WORDLIST_LEN).map(|i| format!("w{i}"))).unwrap()
    }

    fn candidate(indices: &[usize]) -> Candidate {
        Candidate::new(indices.iter().map(|i| format!("w{i}")).collect())
    }

    #[test]
    fn test_all_zero_entropy_12_words() {
        // "abandon" x11 + "about": SHA-256 of 16 zero bytes starts with 0x37.
        let mut indices = vec![0usize; 11];
        indices.push(3);
        assert!(checksum_matches(&indices));

        indices[11] = 4;
        assert!(!checksum_matches(&indices));
    }

    #[test]
    fn test_all_zero_entropy_24_words() {
        // "abandon" x23 + "art": SHA-256 of 32 zero bytes starts with 0x66.
        let mut indices = vec![0usize; 23];
        indices.push(0x66);
        assert!(checksum_matches(&indices));
    }

    #[test]
    fn test_all_ones_entropy_12_words() {
        // "zoo" x11 + "wrong": entropy 0xff * 16.
        let mut indices = vec![2047usize; 11];
        indices.push(2037);
        assert!(checksum_matches(&indices));
    }

    #[test]
    fn test_invalid_length() {
        assert!(!checksum_matches(&[0usize; 11]));
        assert!(!Bip39Checksum::is_valid_length(13));
    }

    #[test]
    fn test_well_formed_through_vocabulary() {
        let checker = Bip39Checksum::new(wordlist()).unwrap();
        let mut indices = vec![0usize; 11];
        indices.push(3);
        assert!(checker.is_well_formed(&candidate(&indices)));

        let unknown = Candidate::new(vec!["nope".to_string(); 12]);
        assert!(!checker.is_well_formed(&unknown));
    }

    #[test]
    fn test_requires_full_wordlist() {
        let small = Vocabulary::parse("a\nb").unwrap();
        assert!(Bip39Checksum::new(small).is_none());
    }
}
