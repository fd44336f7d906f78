//! Signal Engine
//!
//! Scores a bounded digit history and either proposes a digit to trade on
//! or explains why there is no signal. The engine holds only its
//! configuration; every call is a pure function of the history passed in.
//!
//! Sub-analyses:
//! - pattern continuation of the trailing window (decides the candidate)
//! - frequency deviation (z-score against the uniform rate)
//! - current run length
//! - self-transition rate (refuses repetitive candidates)
//! - normalized Shannon entropy (penalises structureless windows)

pub mod stats;

use serde::Serialize;

use crate::config::{ScoringMode, StrategyConfig, StreakBias};
use crate::types::{ObservationHistory, OUTCOME_CLASSES};
use stats::{PatternStats, Run};

/// Per-component scores behind a signal, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalComponents {
    pub pattern: f64,
    pub frequency: f64,
    pub streak: f64,
    pub entropy: f64,
    pub entropy_penalty: f64,
}

/// A proposed trade direction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub predicted_outcome: u8,
    pub confidence: f64,
    pub method: ScoringMode,
    /// Prior matches of the trailing pattern backing this signal
    pub sample_size: usize,
    pub rationale: String,
    pub components: SignalComponents,
}

/// Why an evaluation produced no signal
#[derive(Debug, Clone, PartialEq)]
pub enum NoSignal {
    InsufficientHistory { have: usize, need: usize },
    InsufficientPatternSamples { matches: usize, need: usize },
    NoSafeCandidate,
    LowConfidence { digit: u8, confidence: f64, min: f64 },
}

impl std::fmt::Display for NoSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoSignal::InsufficientHistory { have, need } => {
                write!(f, "insufficient history ({}/{})", have, need)
            }
            NoSignal::InsufficientPatternSamples { matches, need } => {
                write!(f, "pattern matched {} times, need {}", matches, need)
            }
            NoSignal::NoSafeCandidate => write!(f, "no safe candidate digit"),
            NoSignal::LowConfidence { digit, confidence, min } => write!(
                f,
                "digit {} confidence {:.3} below {:.3}",
                digit, confidence, min
            ),
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Signal(Signal),
    NoSignal(NoSignal),
}

impl Evaluation {
    pub fn signal(&self) -> Option<&Signal> {
        match self {
            Evaluation::Signal(s) => Some(s),
            Evaluation::NoSignal(_) => None,
        }
    }

    pub fn into_signal(self) -> Option<Signal> {
        match self {
            Evaluation::Signal(s) => Some(s),
            Evaluation::NoSignal(_) => None,
        }
    }
}

/// Verdict on one digit as a trade candidate
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateVerdict {
    Safe,
    /// Followed the trailing pattern too often
    PatternHit { hits: usize, matches: usize },
    /// Self-transition rate above the ceiling
    Repetitive { rate: f64 },
    /// Same as the previously accepted prediction
    RepeatsLastPrediction,
}

impl CandidateVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, CandidateVerdict::Safe)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigitAssessment {
    pub digit: u8,
    pub verdict: CandidateVerdict,
    pub last_seen: Option<usize>,
    pub z_score: f64,
    pub repetition_rate: Option<f64>,
}

/// Everything the engine measured for one history
#[derive(Debug, Clone)]
pub struct Assessment {
    pub sample_len: usize,
    pub pattern: Option<PatternStats>,
    pub run: Option<Run>,
    pub entropy: f64,
    pub digits: Vec<DigitAssessment>,
}

impl Assessment {
    pub fn digit(&self, digit: u8) -> Option<&DigitAssessment> {
        self.digits.get(digit as usize)
    }

    pub fn pattern_matches(&self) -> usize {
        self.pattern.as_ref().map(|p| p.matches).unwrap_or(0)
    }

    fn safe_digits(&self) -> impl Iterator<Item = &DigitAssessment> {
        self.digits.iter().filter(|d| d.verdict.is_safe())
    }

    /// Safe digit whose last occurrence is furthest in the past (never seen first)
    fn coldest_safe(&self, exclude: Option<u8>) -> Option<u8> {
        self.safe_digits()
            .filter(|d| Some(d.digit) != exclude)
            .min_by_key(|d| (d.last_seen.map(|i| i as i64).unwrap_or(-1), d.digit))
            .map(|d| d.digit)
    }
}

/// Stateless digit signal engine
#[derive(Debug, Clone)]
pub struct SignalEngine {
    config: StrategyConfig,
}

impl SignalEngine {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn evaluate(&self, history: &ObservationHistory, last_prediction: Option<u8>) -> Evaluation {
        self.evaluate_digits(&history.digits(), last_prediction)
    }

    /// Evaluate a digit sequence (oldest first)
    pub fn evaluate_digits(&self, digits: &[u8], last_prediction: Option<u8>) -> Evaluation {
        if digits.len() < self.config.min_history {
            return Evaluation::NoSignal(NoSignal::InsufficientHistory {
                have: digits.len(),
                need: self.config.min_history,
            });
        }

        let assessment = self.assess(digits, last_prediction);
        let matches = assessment.pattern_matches();
        if matches < self.config.min_pattern_samples {
            return Evaluation::NoSignal(NoSignal::InsufficientPatternSamples {
                matches,
                need: self.config.min_pattern_samples,
            });
        }

        let digit = match self.select_candidate(&assessment) {
            Some(d) => d,
            None => return Evaluation::NoSignal(NoSignal::NoSafeCandidate),
        };

        let components = self.components(&assessment, digit);
        let confidence = self.composite(&components);

        if confidence < self.config.min_confidence {
            return Evaluation::NoSignal(NoSignal::LowConfidence {
                digit,
                confidence,
                min: self.config.min_confidence,
            });
        }

        let rationale = format!(
            "{} | window {:?} matched {}x, digit {} followed {}x | z {:.2} | run {} | entropy {:.2}",
            self.config.scoring,
            assessment.pattern.as_ref().map(|p| p.window.clone()).unwrap_or_default(),
            matches,
            digit,
            assessment.pattern.as_ref().map(|p| p.hits(digit)).unwrap_or(0),
            assessment.digits[digit as usize].z_score,
            assessment.run.map(|r| format!("{}x{}", r.digit, r.length)).unwrap_or_default(),
            assessment.entropy,
        );

        Evaluation::Signal(Signal {
            predicted_outcome: digit,
            confidence,
            method: self.config.scoring,
            sample_size: matches,
            rationale,
            components,
        })
    }

    /// Measure every digit as a candidate
    pub fn assess(&self, digits: &[u8], last_prediction: Option<u8>) -> Assessment {
        let pattern = stats::pattern_continuations(digits, self.config.pattern_len);
        let pattern_trusted = pattern
            .as_ref()
            .map(|p| p.matches >= self.config.min_pattern_samples)
            .unwrap_or(false);
        let last_seen = stats::last_seen(digits);
        let z_scores = stats::frequency_z_scores(stats::tail(digits, self.config.frequency_window));
        let entropy = stats::normalized_entropy(stats::tail(digits, self.config.entropy_window));

        let assessments = (0..OUTCOME_CLASSES as u8)
            .map(|digit| {
                let repetition_rate = stats::repetition_rate(digits, digit);
                let verdict = match &pattern {
                    Some(p)
                        if pattern_trusted
                            && p.hit_ratio(digit) > self.config.max_pattern_hit_ratio =>
                    {
                        CandidateVerdict::PatternHit {
                            hits: p.hits(digit),
                            matches: p.matches,
                        }
                    }
                    _ => match repetition_rate {
                        Some(rate) if rate > self.config.max_repetition_rate => {
                            CandidateVerdict::Repetitive { rate }
                        }
                        _ if last_prediction == Some(digit) => {
                            CandidateVerdict::RepeatsLastPrediction
                        }
                        _ => CandidateVerdict::Safe,
                    },
                };
                DigitAssessment {
                    digit,
                    verdict,
                    last_seen: last_seen[digit as usize],
                    z_score: z_scores[digit as usize],
                    repetition_rate,
                }
            })
            .collect();

        Assessment {
            sample_len: digits.len(),
            pattern,
            run: stats::current_run(digits),
            entropy,
            digits: assessments,
        }
    }

    fn select_candidate(&self, assessment: &Assessment) -> Option<u8> {
        match self.config.scoring {
            ScoringMode::Pattern | ScoringMode::Hybrid => assessment.coldest_safe(None),
            ScoringMode::Frequency => assessment
                .safe_digits()
                .min_by(|a, b| {
                    a.z_score
                        .total_cmp(&b.z_score)
                        .then_with(|| {
                            a.last_seen
                                .map(|i| i as i64)
                                .unwrap_or(-1)
                                .cmp(&b.last_seen.map(|i| i as i64).unwrap_or(-1))
                        })
                })
                .map(|d| d.digit),
            ScoringMode::Streak => {
                let run = assessment.run?;
                match self.config.streak_bias {
                    StreakBias::Reversal => {
                        let run_digit_safe = assessment
                            .digit(run.digit)
                            .map(|d| d.verdict.is_safe())
                            .unwrap_or(false);
                        (run.length >= 2 && run_digit_safe).then_some(run.digit)
                    }
                    StreakBias::Continuation => {
                        if run.length < 2 {
                            return None;
                        }
                        assessment.coldest_safe(Some(run.digit))
                    }
                }
            }
        }
    }

    fn components(&self, assessment: &Assessment, digit: u8) -> SignalComponents {
        let cfg = &self.config;

        let pattern = assessment
            .pattern
            .as_ref()
            .filter(|p| p.matches >= cfg.min_pattern_samples)
            .map(|p| 1.0 - p.hit_ratio(digit))
            .unwrap_or(0.0);

        let z = assessment.digits[digit as usize].z_score;
        let frequency = (-z / cfg.z_score_cap).clamp(0.0, 1.0);

        let streak = assessment
            .run
            .map(|run| {
                let strength =
                    ((run.length as f64 - 1.0) / (cfg.streak_cap as f64 - 1.0)).clamp(0.0, 1.0);
                let applies = match cfg.streak_bias {
                    StreakBias::Reversal => run.digit == digit,
                    StreakBias::Continuation => run.digit != digit,
                };
                if applies { strength } else { 0.0 }
            })
            .unwrap_or(0.0);

        let entropy = assessment.entropy;
        let entropy_penalty = if entropy > cfg.entropy_ceiling && cfg.entropy_ceiling < 1.0 {
            ((entropy - cfg.entropy_ceiling) / (1.0 - cfg.entropy_ceiling)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        SignalComponents {
            pattern,
            frequency,
            streak,
            entropy,
            entropy_penalty,
        }
    }

    fn composite(&self, c: &SignalComponents) -> f64 {
        let w = &self.config.weights;
        let total = w.pattern + w.frequency + w.streak;
        if total <= 0.0 {
            return 0.0;
        }
        let score = (w.pattern * c.pattern + w.frequency * c.frequency + w.streak * c.streak) / total;
        (score - w.entropy * c.entropy_penalty).clamp(0.0, 1.0)
    }
}
