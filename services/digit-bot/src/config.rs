//! Bot Configuration
//!
//! Resolved once at startup from a TOML file layered with `DIGIT_BOT__*`
//! environment variables, validated, and never mutated afterwards.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Environment variable holding the config file path
pub const CONFIG_PATH_ENV: &str = "DIGIT_BOT_CONFIG";

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/digit-bot.toml";

/// Complete bot configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub session: SessionConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub staking: StakeConfig,
    pub instruments: Vec<InstrumentConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Directory for state snapshots (state/now.json); disabled when unset
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl AppConfig {
    /// Load from the path in `DIGIT_BOT_CONFIG` (or the default path)
    pub fn load() -> Result<Self, ValidationError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load a config file, overlay environment variables, then validate
    pub fn load_from(path: &Path) -> Result<Self, ValidationError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(config::Environment::with_prefix("DIGIT_BOT").separator("__"))
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid combinations before the session starts
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.session.validate()?;
        self.strategy.validate()?;
        self.staking.validate()?;

        if self.instruments.is_empty() {
            return Err(ValidationError::invalid(
                "instruments",
                "at least one instrument is required",
            ));
        }

        let mut seen = HashSet::new();
        for instrument in &self.instruments {
            if instrument.symbol.trim().is_empty() {
                return Err(ValidationError::invalid("instruments.symbol", "empty symbol"));
            }
            if !seen.insert(instrument.symbol.as_str()) {
                return Err(ValidationError::invalid(
                    "instruments.symbol",
                    format!("duplicate instrument {}", instrument.symbol),
                ));
            }
            if instrument.decimals > MAX_DECIMALS {
                return Err(ValidationError::invalid(
                    "instruments.decimals",
                    format!(
                        "{} has precision {} (max {})",
                        instrument.symbol, instrument.decimals, MAX_DECIMALS
                    ),
                ));
            }
        }

        Ok(())
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }
}

const MAX_DECIMALS: u32 = 10;
/// One day; keeps `StakeConfig::cooldown` inside chrono's range
const MAX_COOLDOWN_SECS: u64 = 86_400;

/// Connection parameters for the contract service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// API token used to authorize (and re-authorize after reconnects)
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Delay before retrying after a rate-limit error
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    /// Delay before retrying after a market-closed error
    #[serde(default = "default_market_closed_backoff_secs")]
    pub market_closed_backoff_secs: u64,
}

impl SessionConfig {
    pub fn url(&self) -> Result<url::Url, ValidationError> {
        url::Url::parse_with_params(&self.endpoint, &[("app_id", self.app_id.as_str())])
            .map_err(|e| ValidationError::invalid("session.endpoint", e.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.url()?;
        if self.connect_timeout_secs == 0 {
            return Err(ValidationError::invalid("session.connect_timeout_secs", "must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::invalid("session.request_timeout_secs", "must be > 0"));
        }
        self.reconnect.validate()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            app_id: default_app_id(),
            api_token: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            reconnect: ReconnectConfig::default(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            market_closed_backoff_secs: default_market_closed_backoff_secs(),
        }
    }
}

/// Exponential backoff for reconnects
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl ReconnectConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.base_delay_ms == 0 {
            return Err(ValidationError::invalid("session.reconnect.base_delay_ms", "must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ValidationError::invalid(
                "session.reconnect.max_delay_ms",
                "must be >= base_delay_ms",
            ));
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid("session.reconnect.max_attempts", "must be > 0"));
        }
        Ok(())
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: true,
        }
    }
}

/// How the predicted digit is chosen
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Safest pattern continuation
    Pattern,
    /// Most under-represented digit
    Frequency,
    /// Digit of the current run
    Streak,
    /// Pattern prediction, confidence from every analysis
    #[default]
    Hybrid,
}

impl std::fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoringMode::Pattern => write!(f, "pattern"),
            ScoringMode::Frequency => write!(f, "frequency"),
            ScoringMode::Streak => write!(f, "streak"),
            ScoringMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// How run length moves confidence
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreakBias {
    /// Longer runs make a repeat of the run digit less likely
    #[default]
    Reversal,
    /// Longer runs favour a breakout in the run's direction
    Continuation,
}

/// Relative weights of the sub-analyses
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct SignalWeights {
    #[serde(default = "default_pattern_weight")]
    pub pattern: f64,
    #[serde(default = "default_frequency_weight")]
    pub frequency: f64,
    #[serde(default = "default_streak_weight")]
    pub streak: f64,
    /// Multiplier on the high-entropy penalty
    #[serde(default = "default_entropy_weight")]
    pub entropy: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            pattern: default_pattern_weight(),
            frequency: default_frequency_weight(),
            streak: default_streak_weight(),
            entropy: default_entropy_weight(),
        }
    }
}

/// Digit contract types offered by the service
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    /// Wins when the settlement digit differs from the prediction
    #[default]
    Differs,
    Matches,
    Over,
    Under,
}

impl ContractKind {
    pub fn contract_type(&self) -> &'static str {
        match self {
            ContractKind::Differs => "DIGITDIFF",
            ContractKind::Matches => "DIGITMATCH",
            ContractKind::Over => "DIGITOVER",
            ContractKind::Under => "DIGITUNDER",
        }
    }
}

/// Contract parameters sent with every proposal
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ContractSpec {
    #[serde(default)]
    pub kind: ContractKind,
    #[serde(default = "default_duration_ticks")]
    pub duration_ticks: u32,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for ContractSpec {
    fn default() -> Self {
        Self {
            kind: ContractKind::default(),
            duration_ticks: default_duration_ticks(),
            currency: default_currency(),
        }
    }
}

/// Signal engine parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StrategyConfig {
    #[serde(default)]
    pub scoring: ScoringMode,
    #[serde(default)]
    pub streak_bias: StreakBias,
    /// Observations kept per instrument
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Below this many observations there is never a signal
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Trailing window length for pattern matching
    #[serde(default = "default_pattern_len")]
    pub pattern_len: usize,
    /// Prior matches of the trailing window required before trusting it
    #[serde(default = "default_min_pattern_samples")]
    pub min_pattern_samples: usize,
    /// A digit counts as safe when hits/matches stays at or below this ratio
    #[serde(default)]
    pub max_pattern_hit_ratio: f64,
    #[serde(default = "default_frequency_window")]
    pub frequency_window: usize,
    #[serde(default = "default_entropy_window")]
    pub entropy_window: usize,
    /// Normalized entropy above which confidence is reduced
    #[serde(default = "default_entropy_ceiling")]
    pub entropy_ceiling: f64,
    /// Candidates whose self-transition rate exceeds this are refused
    #[serde(default = "default_max_repetition_rate")]
    pub max_repetition_rate: f64,
    /// |z| at which the frequency score saturates
    #[serde(default = "default_z_score_cap")]
    pub z_score_cap: f64,
    /// Run length at which the streak score saturates
    #[serde(default = "default_streak_cap")]
    pub streak_cap: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub weights: SignalWeights,
    #[serde(default)]
    pub contract: ContractSpec,
}

impl StrategyConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.history_len == 0 {
            return Err(ValidationError::invalid("strategy.history_len", "must be > 0"));
        }
        if self.min_history > self.history_len {
            return Err(ValidationError::invalid(
                "strategy.min_history",
                format!("{} exceeds history_len {}", self.min_history, self.history_len),
            ));
        }
        if self.pattern_len == 0 {
            return Err(ValidationError::invalid("strategy.pattern_len", "must be > 0"));
        }
        if self.pattern_len >= self.min_history.max(1) {
            return Err(ValidationError::invalid(
                "strategy.pattern_len",
                "must be shorter than min_history",
            ));
        }
        if self.min_pattern_samples == 0 {
            return Err(ValidationError::invalid("strategy.min_pattern_samples", "must be > 0"));
        }
        if self.frequency_window == 0 || self.entropy_window == 0 {
            return Err(ValidationError::invalid(
                "strategy.frequency_window",
                "analysis windows must be > 0",
            ));
        }
        if self.streak_cap < 2 {
            return Err(ValidationError::invalid("strategy.streak_cap", "must be >= 2"));
        }
        if !(self.z_score_cap > 0.0) {
            return Err(ValidationError::invalid("strategy.z_score_cap", "must be > 0"));
        }
        for (field, value) in [
            ("strategy.min_confidence", self.min_confidence),
            ("strategy.max_pattern_hit_ratio", self.max_pattern_hit_ratio),
            ("strategy.entropy_ceiling", self.entropy_ceiling),
            ("strategy.max_repetition_rate", self.max_repetition_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::invalid(field, format!("{} not in [0, 1]", value)));
            }
        }
        let w = &self.weights;
        if [w.pattern, w.frequency, w.streak, w.entropy]
            .iter()
            .any(|v| *v < 0.0 || !v.is_finite())
        {
            return Err(ValidationError::invalid("strategy.weights", "weights must be >= 0"));
        }
        if w.pattern + w.frequency + w.streak <= 0.0 {
            return Err(ValidationError::invalid(
                "strategy.weights",
                "at least one scoring weight must be positive",
            ));
        }
        if self.contract.duration_ticks == 0 {
            return Err(ValidationError::invalid("strategy.contract.duration_ticks", "must be > 0"));
        }
        Ok(())
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringMode::default(),
            streak_bias: StreakBias::default(),
            history_len: default_history_len(),
            min_history: default_min_history(),
            pattern_len: default_pattern_len(),
            min_pattern_samples: default_min_pattern_samples(),
            max_pattern_hit_ratio: 0.0,
            frequency_window: default_frequency_window(),
            entropy_window: default_entropy_window(),
            entropy_ceiling: default_entropy_ceiling(),
            max_repetition_rate: default_max_repetition_rate(),
            z_score_cap: default_z_score_cap(),
            streak_cap: default_streak_cap(),
            min_confidence: default_min_confidence(),
            weights: SignalWeights::default(),
            contract: ContractSpec::default(),
        }
    }
}

/// Stake progression
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StakingMode {
    #[default]
    Martingale,
    Grid,
}

/// Stake policy and risk guard parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StakeConfig {
    #[serde(default)]
    pub mode: StakingMode,
    #[serde(default = "default_initial_stake")]
    pub initial_stake: Decimal,
    /// Martingale loss multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: Decimal,
    /// Grid layer fraction (stake_i = initial * factor^i)
    #[serde(default = "default_grid_factor")]
    pub grid_factor: Decimal,
    #[serde(default = "default_grid_layers")]
    pub grid_layers: u32,
    /// Floor stake accepted by the service
    #[serde(default = "default_min_stake")]
    pub min_stake: Decimal,
    #[serde(default = "default_max_stake")]
    pub max_stake: Decimal,
    /// Minimum tradable increment stakes are rounded to
    #[serde(default = "default_stake_increment")]
    pub stake_increment: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    #[serde(default = "default_take_profit")]
    pub take_profit: Decimal,
    /// Concurrency ceiling across instruments
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Idle interval per instrument after a settlement
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Sell contracts still open when the session shuts down
    #[serde(default)]
    pub close_on_shutdown: bool,
}

impl StakeConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("staking.initial_stake", self.initial_stake),
            ("staking.min_stake", self.min_stake),
            ("staking.stake_increment", self.stake_increment),
            ("staking.daily_loss_limit", self.daily_loss_limit),
            ("staking.take_profit", self.take_profit),
        ];
        for (field, value) in positive {
            if value <= Decimal::ZERO {
                return Err(ValidationError::invalid(field, format!("{} must be > 0", value)));
            }
        }
        if self.max_stake < self.min_stake {
            return Err(ValidationError::invalid("staking.max_stake", "must be >= min_stake"));
        }
        if self.initial_stake < self.min_stake || self.initial_stake > self.max_stake {
            return Err(ValidationError::invalid(
                "staking.initial_stake",
                format!(
                    "{} outside [{}, {}]",
                    self.initial_stake, self.min_stake, self.max_stake
                ),
            ));
        }
        match self.mode {
            StakingMode::Martingale => {
                if self.multiplier < Decimal::ONE {
                    return Err(ValidationError::invalid("staking.multiplier", "must be >= 1"));
                }
            }
            StakingMode::Grid => {
                if self.grid_factor <= Decimal::ZERO || self.grid_factor >= Decimal::ONE {
                    return Err(ValidationError::invalid("staking.grid_factor", "must be in (0, 1)"));
                }
                if self.grid_layers == 0 {
                    return Err(ValidationError::invalid("staking.grid_layers", "must be > 0"));
                }
            }
        }
        if self.max_consecutive_losses == 0 {
            return Err(ValidationError::invalid("staking.max_consecutive_losses", "must be > 0"));
        }
        if self.max_open_positions == 0 {
            return Err(ValidationError::invalid("staking.max_open_positions", "must be > 0"));
        }
        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(ValidationError::invalid(
                "staking.cooldown_secs",
                format!("must be <= {}", MAX_COOLDOWN_SECS),
            ));
        }
        Ok(())
    }
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            mode: StakingMode::default(),
            initial_stake: default_initial_stake(),
            multiplier: default_multiplier(),
            grid_factor: default_grid_factor(),
            grid_layers: default_grid_layers(),
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            stake_increment: default_stake_increment(),
            max_consecutive_losses: default_max_consecutive_losses(),
            daily_loss_limit: default_daily_loss_limit(),
            take_profit: default_take_profit(),
            max_open_positions: default_max_open_positions(),
            cooldown_secs: default_cooldown_secs(),
            close_on_shutdown: false,
        }
    }
}

/// Per-instrument parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstrumentConfig {
    pub symbol: String,
    /// Decimal precision used to extract the last digit of a quote
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

/// Notification channel settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NotifyConfig {
    /// Chat/webhook endpoint receiving `{ "text": ... }` posts
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            summary_interval_secs: default_summary_interval_secs(),
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String { "wss://ws.derivws.com/websockets/v3".to_string() }
fn default_app_id() -> String { "1089".to_string() }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_keepalive_secs() -> u64 { 30 }
fn default_rate_limit_backoff_secs() -> u64 { 5 }
fn default_market_closed_backoff_secs() -> u64 { 600 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_max_attempts() -> u32 { 10 }
fn default_true() -> bool { true }
fn default_pattern_weight() -> f64 { 0.5 }
fn default_frequency_weight() -> f64 { 0.3 }
fn default_streak_weight() -> f64 { 0.2 }
fn default_entropy_weight() -> f64 { 1.0 }
fn default_duration_ticks() -> u32 { 1 }
fn default_currency() -> String { "USD".to_string() }
fn default_history_len() -> usize { 200 }
fn default_min_history() -> usize { 50 }
fn default_pattern_len() -> usize { 2 }
fn default_min_pattern_samples() -> usize { 5 }
fn default_frequency_window() -> usize { 100 }
fn default_entropy_window() -> usize { 100 }
fn default_entropy_ceiling() -> f64 { 0.97 }
fn default_max_repetition_rate() -> f64 { 0.15 }
fn default_z_score_cap() -> f64 { 2.0 }
fn default_streak_cap() -> usize { 5 }
fn default_min_confidence() -> f64 { 0.6 }
fn default_initial_stake() -> Decimal { Decimal::ONE }
fn default_multiplier() -> Decimal { Decimal::TWO }
fn default_grid_factor() -> Decimal { Decimal::new(5, 1) }
fn default_grid_layers() -> u32 { 3 }
fn default_min_stake() -> Decimal { Decimal::new(35, 2) }
fn default_max_stake() -> Decimal { Decimal::from(100) }
fn default_stake_increment() -> Decimal { Decimal::new(1, 2) }
fn default_max_consecutive_losses() -> u32 { 5 }
fn default_daily_loss_limit() -> Decimal { Decimal::from(50) }
fn default_take_profit() -> Decimal { Decimal::from(20) }
fn default_max_open_positions() -> usize { 1 }
fn default_cooldown_secs() -> u64 { 5 }
fn default_decimals() -> u32 { 2 }
fn default_summary_interval_secs() -> u64 { 3600 }
fn default_notify_timeout_secs() -> u64 { 10 }
