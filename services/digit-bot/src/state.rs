//! Session state and the snapshot file (state/now.json)

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::config::InstrumentConfig;
use crate::transport::ConnectionState;
use crate::types::ObservationHistory;

/// Per-instrument runtime state owned by the orchestrator
#[derive(Debug, Clone)]
pub struct InstrumentState {
    pub config: InstrumentConfig,
    pub history: ObservationHistory,
    pub tick_subscription: Option<String>,
    /// History seeded and tick stream requested on the current connection
    pub loaded: bool,
    /// No new positions (or load retries) before this instant
    pub retry_after: Option<DateTime<Utc>>,
}

impl InstrumentState {
    pub fn new(config: InstrumentConfig, history_len: usize) -> Self {
        let history = ObservationHistory::new(&config.symbol, history_len);
        Self {
            config,
            history,
            tick_subscription: None,
            loaded: false,
            retry_after: None,
        }
    }

    pub fn backing_off(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map(|until| now < until).unwrap_or(false)
    }

    /// Due for another history and subscription attempt
    pub fn needs_load(&self, now: DateTime<Utc>) -> bool {
        !self.loaded && !self.backing_off(now)
    }
}

/// Everything the orchestrator knows about the session
#[derive(Debug, Clone)]
pub struct SessionState {
    pub instruments: HashMap<String, InstrumentState>,
    pub connection: ConnectionState,
}

impl SessionState {
    pub fn new(instruments: &[InstrumentConfig], history_len: usize) -> Self {
        Self {
            instruments: instruments
                .iter()
                .map(|c| (c.symbol.clone(), InstrumentState::new(c.clone(), history_len)))
                .collect(),
            connection: ConnectionState::Ready,
        }
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentState> {
        self.instruments.get(symbol)
    }

    pub fn instrument_mut(&mut self, symbol: &str) -> Option<&mut InstrumentState> {
        self.instruments.get_mut(symbol)
    }

    /// Instrument symbols in a stable order
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.instruments.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

/// Snapshot written to state/now.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: String,
    pub session_id: String,
    pub connection: String,
    pub trading: bool,
    pub halted: Option<String>,
    pub stats: SessionStats,
    pub instruments: Vec<InstrumentSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl: String,
    pub current_stake: String,
    pub consecutive_losses: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub symbol: String,
    pub observations: usize,
    pub last_digit: Option<u8>,
    pub position: String,
    pub last_prediction: Option<u8>,
}

/// Writes snapshot files for observability
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    pub fn new(workspace_dir: &str) -> Self {
        Self {
            state_dir: PathBuf::from(workspace_dir).join("state"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let path = self.state_dir.join("now.json");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    pub async fn read_now(&self) -> anyhow::Result<NowState> {
        let raw = fs::read_to_string(self.state_dir.join("now.json")).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}
