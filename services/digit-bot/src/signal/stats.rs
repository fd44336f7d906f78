//! Estimators over a digit sequence (oldest first)
//!
//! All functions are total: empty or short input yields neutral values.

use crate::types::OUTCOME_CLASSES;

/// Trailing `window` digits (or everything when shorter)
pub fn tail(digits: &[u8], window: usize) -> &[u8] {
    &digits[digits.len().saturating_sub(window)..]
}

pub fn digit_counts(digits: &[u8]) -> [usize; OUTCOME_CLASSES] {
    let mut counts = [0usize; OUTCOME_CLASSES];
    for &d in digits {
        if let Some(slot) = counts.get_mut(d as usize) {
            *slot += 1;
        }
    }
    counts
}

/// z-score of each digit's count against the uniform expectation
pub fn frequency_z_scores(digits: &[u8]) -> [f64; OUTCOME_CLASSES] {
    let mut z = [0.0; OUTCOME_CLASSES];
    let n = digits.len() as f64;
    if digits.is_empty() {
        return z;
    }
    let p = 1.0 / OUTCOME_CLASSES as f64;
    let expected = n * p;
    let sd = (n * p * (1.0 - p)).sqrt();
    for (slot, count) in z.iter_mut().zip(digit_counts(digits)) {
        *slot = (count as f64 - expected) / sd;
    }
    z
}

/// Run of identical digits at the end of the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub digit: u8,
    pub length: usize,
}

pub fn current_run(digits: &[u8]) -> Option<Run> {
    let &digit = digits.last()?;
    let length = digits.iter().rev().take_while(|&&d| d == digit).count();
    Some(Run { digit, length })
}

/// P(next == digit | current == digit), None when `digit` never had a successor
pub fn repetition_rate(digits: &[u8], digit: u8) -> Option<f64> {
    let mut occurrences = 0usize;
    let mut repeats = 0usize;
    for pair in digits.windows(2) {
        if pair[0] == digit {
            occurrences += 1;
            if pair[1] == digit {
                repeats += 1;
            }
        }
    }
    (occurrences > 0).then(|| repeats as f64 / occurrences as f64)
}

/// Share of consecutive pairs that repeat, pooled over all digits
pub fn overall_repetition_rate(digits: &[u8]) -> Option<f64> {
    if digits.len() < 2 {
        return None;
    }
    let repeats = digits.windows(2).filter(|pair| pair[0] == pair[1]).count();
    Some(repeats as f64 / (digits.len() - 1) as f64)
}

/// What followed earlier occurrences of the trailing window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternStats {
    pub window: Vec<u8>,
    pub matches: usize,
    pub continuations: [usize; OUTCOME_CLASSES],
}

impl PatternStats {
    pub fn hits(&self, digit: u8) -> usize {
        self.continuations.get(digit as usize).copied().unwrap_or(0)
    }

    pub fn hit_ratio(&self, digit: u8) -> f64 {
        if self.matches == 0 {
            return 0.0;
        }
        self.hits(digit) as f64 / self.matches as f64
    }
}

/// Scan for prior (possibly overlapping) occurrences of the last `k` digits
pub fn pattern_continuations(digits: &[u8], k: usize) -> Option<PatternStats> {
    if k == 0 || digits.len() <= k {
        return None;
    }
    let start = digits.len() - k;
    let window = &digits[start..];
    let mut continuations = [0usize; OUTCOME_CLASSES];
    let mut matches = 0usize;
    for i in 0..start {
        if &digits[i..i + k] == window {
            matches += 1;
            if let Some(slot) = continuations.get_mut(digits[i + k] as usize) {
                *slot += 1;
            }
        }
    }
    Some(PatternStats {
        window: window.to_vec(),
        matches,
        continuations,
    })
}

/// Index of each digit's most recent occurrence
pub fn last_seen(digits: &[u8]) -> [Option<usize>; OUTCOME_CLASSES] {
    let mut seen = [None; OUTCOME_CLASSES];
    for (i, &d) in digits.iter().enumerate() {
        if let Some(slot) = seen.get_mut(d as usize) {
            *slot = Some(i);
        }
    }
    seen
}

/// Shannon entropy of the digit distribution divided by log2(10)
pub fn normalized_entropy(digits: &[u8]) -> f64 {
    if digits.is_empty() {
        return 0.0;
    }
    let n = digits.len() as f64;
    let h: f64 = digit_counts(digits)
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum();
    (h / (OUTCOME_CLASSES as f64).log2()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_counts_and_z_scores() {
        let digits = [1, 1, 1, 1, 1, 2, 3, 4, 5, 6];
        let counts = digit_counts(&digits);
        assert_eq!(counts[1], 5);
        assert_eq!(counts[0], 0);

        let z = frequency_z_scores(&digits);
        assert!(z[1] > 3.0);
        assert!(z[0] < 0.0);
        assert_eq!(frequency_z_scores(&[]), [0.0; OUTCOME_CLASSES]);
    }

    #[test]
    fn test_current_run() {
        assert_eq!(current_run(&[1, 2, 2, 2]), Some(Run { digit: 2, length: 3 }));
        assert_eq!(current_run(&[5]), Some(Run { digit: 5, length: 1 }));
        assert_eq!(current_run(&[]), None);
    }

    #[test]
    fn test_repetition_rate() {
        let digits = [3, 3, 7, 3, 1];
        assert_eq!(repetition_rate(&digits, 3), Some(1.0 / 3.0));
        assert_eq!(repetition_rate(&digits, 7), Some(0.0));
        // Only ever the final digit: no successor observed
        assert_eq!(repetition_rate(&digits, 1), None);
        assert_eq!(repetition_rate(&digits, 9), None);
    }

    #[test]
    fn test_uniform_repetition_rate_converges() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let digits: Vec<u8> = (0..50_000).map(|_| rng.gen_range(0..10u8)).collect();

        let overall = overall_repetition_rate(&digits).unwrap();
        assert!((overall - 0.1).abs() < 0.01, "overall rate {}", overall);

        for d in 0..10u8 {
            let rate = repetition_rate(&digits, d).unwrap();
            assert!((rate - 0.1).abs() < 0.02, "digit {} rate {}", d, rate);
        }
    }

    #[test]
    fn test_pattern_continuations() {
        let digits = [7, 2, 5, 7, 2, 5, 7, 2];
        let stats = pattern_continuations(&digits, 2).unwrap();
        assert_eq!(stats.window, vec![7, 2]);
        assert_eq!(stats.matches, 2);
        assert_eq!(stats.hits(5), 2);
        assert_eq!(stats.hits(7), 0);
        assert_eq!(stats.hit_ratio(5), 1.0);

        assert!(pattern_continuations(&[1, 2], 2).is_none());
        assert!(pattern_continuations(&[1, 2, 3], 0).is_none());
    }

    #[test]
    fn test_last_seen() {
        let seen = last_seen(&[4, 1, 4, 9]);
        assert_eq!(seen[4], Some(2));
        assert_eq!(seen[9], Some(3));
        assert_eq!(seen[0], None);
    }

    #[test]
    fn test_normalized_entropy() {
        assert_eq!(normalized_entropy(&[]), 0.0);
        assert_eq!(normalized_entropy(&[5; 20]), 0.0);

        let uniform: Vec<u8> = (0..100).map(|i| (i % 10) as u8).collect();
        assert!((normalized_entropy(&uniform) - 1.0).abs() < 1e-9);

        let two_way: Vec<u8> = (0..100).map(|i| (i % 2) as u8).collect();
        let h = normalized_entropy(&two_way);
        assert!((h - 1.0 / 10f64.log2()).abs() < 1e-9);
    }
}
