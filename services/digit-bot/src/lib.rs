//! Digit Bot Library
//!
//! Digit-contract trading client: streams ticks over one multiplexed
//! WebSocket session, scores the last-digit sequence, and opens positions
//! under a stake policy with hard risk limits.

pub mod amount;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notifier;
pub mod position;
pub mod protocol;
pub mod reconciler;
pub mod runner;
pub mod signal;
pub mod stake;
pub mod state;
pub mod transport;
pub mod types;


// Re-export main types for convenience
pub use config::{AppConfig, ScoringMode, StakeConfig, StakingMode, StrategyConfig};
pub use error::{ProtocolError, SessionError, ValidationError};
pub use gateway::{ContractGateway, ContractOrder, MarketEvent, OpenedContract, WsGateway};
pub use notifier::{LogNotifier, Notification, Notifier, SessionSummary, WebhookNotifier};
pub use position::{Outcome, Position, PositionManager, PositionState};
pub use runner::{ControlHandle, EvaluationOutcome, Orchestrator, SessionExit, SessionReport};
pub use signal::{Evaluation, NoSignal, Signal, SignalEngine};
pub use stake::{GuardVerdict, RiskLimit, StakePolicy, StakePolicyState};
pub use transport::{SessionTransport, TransportEvent};
pub use types::{Observation, ObservationHistory};
