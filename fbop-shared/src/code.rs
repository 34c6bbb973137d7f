//! Short human-typeable codes for invites and kid-device pairing.

use rand::Rng;
use rand::seq::SliceRandom;

/// Symbols used for codes. Excludes look-alikes such as `0/O`, `1/I/L`.
pub const CODE_ALPHABET: &str = "ABCDEFGHJKMNPQRSTWXYZ23456789";

/// Length of invite and child-lookup codes.
pub const DEFAULT_CODE_LEN: usize = 8;

/// Draws `length` symbols uniformly and independently from `alphabet`.
/// An empty alphabet yields an empty code.
pub fn generate_code_with<R: Rng + ?Sized>(rng: &mut R, length: usize, alphabet: &str) -> String {
    let symbols: Vec<char> = alphabet.chars().collect();
    (0..length)
        .filter_map(|_| symbols.choose(rng).copied())
        .collect()
}

pub fn generate_code(length: usize, alphabet: &str) -> String {
    generate_code_with(&mut rand::thread_rng(), length, alphabet)
}

/// Eight symbols from [`CODE_ALPHABET`].
pub fn generate_default_code() -> String {
    generate_code(DEFAULT_CODE_LEN, CODE_ALPHABET)
}

/// Codes are matched case-insensitively; storage keys are uppercase.
pub fn normalize_code(input: &str) -> String {
    input.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn alphabet_has_29_unambiguous_symbols() {
        let set: HashSet<char> = CODE_ALPHABET.chars().collect();
        assert_eq!(set.len(), 29);
        assert_eq!(CODE_ALPHABET.len(), 29);
        for c in ['0', 'O', '1', 'I', 'L'] {
            assert!(!set.contains(&c), "{c} must not be in the alphabet");
        }
    }

    #[test]
    fn codes_use_only_alphabet_symbols() {
        for _ in 0..200 {
            let code = generate_default_code();
            assert_eq!(code.len(), DEFAULT_CODE_LEN);
            assert!(code.chars().all(|c| CODE_ALPHABET.contains(c)), "{code}");
        }
        assert_eq!(generate_code(6, CODE_ALPHABET).len(), 6);
        assert_eq!(generate_code(8, ""), "");
    }

    #[test]
    fn every_symbol_is_reachable() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<char, usize> = HashMap::new();
        for _ in 0..2_000 {
            for c in generate_code_with(&mut rng, DEFAULT_CODE_LEN, CODE_ALPHABET).chars() {
                *counts.entry(c).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 29);
        // 16k draws over 29 symbols: ~552 each; a generous band catches bias.
        assert!(counts.values().all(|n| (350..800).contains(n)), "{counts:?}");
    }

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(normalize_code("  ab23xz7k\n"), "AB23XZ7K");
    }
}
