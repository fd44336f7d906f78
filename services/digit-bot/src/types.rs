//! Core market types shared by the engine, position manager and runner

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::last_digit;

/// Number of discrete outcome classes (last digit 0-9)
pub const OUTCOME_CLASSES: usize = 10;

/// One streamed tick reduced to its last digit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub instrument: String,
    pub value: Decimal,
    pub digit: u8,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    /// Build an observation, extracting the digit at `decimals` precision
    pub fn from_quote(
        instrument: &str,
        value: Decimal,
        decimals: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            value,
            digit: last_digit(value, decimals),
            timestamp,
        }
    }
}

/// FIFO-bounded observation history for one instrument
#[derive(Debug, Clone)]
pub struct ObservationHistory {
    instrument: String,
    observations: VecDeque<Observation>,
    max_len: usize,
}

impl ObservationHistory {
    pub fn new(instrument: &str, max_len: usize) -> Self {
        Self {
            instrument: instrument.to_string(),
            observations: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Append an observation, evicting the oldest beyond `max_len`
    ///
    /// Returns false when the tick is not newer than the last one (replayed
    /// tick after a resubscribe or the overlap between history and stream).
    pub fn push(&mut self, observation: Observation) -> bool {
        if let Some(last) = self.observations.back() {
            if observation.timestamp <= last.timestamp {
                return false;
            }
        }
        self.observations.push_back(observation);
        while self.observations.len() > self.max_len {
            self.observations.pop_front();
        }
        true
    }

    /// Replace contents with a historical window (oldest first)
    pub fn seed(&mut self, observations: impl IntoIterator<Item = Observation>) {
        self.observations.clear();
        for observation in observations {
            self.push(observation);
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn last(&self) -> Option<&Observation> {
        self.observations.back()
    }

    /// Digit sequence, oldest first
    pub fn digits(&self) -> Vec<u8> {
        self.observations.iter().map(|o| o.digit).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }
}
