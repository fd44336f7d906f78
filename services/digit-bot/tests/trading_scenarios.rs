//! Orchestrator scenarios against a scripted gateway
//!
//! Every test drives the event loop one step at a time so the order of
//! proposal, execution and settlement is deterministic.


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::timeout;

use digit_bot::config::{
    AppConfig, InstrumentConfig, NotifyConfig, ScoringMode, SessionConfig, StakeConfig,
    StrategyConfig,
};
use digit_bot::error::{ProtocolError, SessionError};
use digit_bot::gateway::MarketEvent;
use digit_bot::protocol::OpenContract;
use digit_bot::runner::{EvaluationOutcome, Orchestrator, SessionExit};
use digit_bot::{NoSignal, Notification, Outcome, PositionState, RiskLimit, TransportEvent};

use mock_gateway::{alternating, observation, settled, MockGateway, RecordingNotifier};

const SYMBOL: &str = "R_100";

fn config(symbols: &[&str], staking: StakeConfig) -> AppConfig {
    AppConfig {
        session: SessionConfig {
            rate_limit_backoff_secs: 5,
            ..SessionConfig::default()
        },
        strategy: StrategyConfig {
            scoring: ScoringMode::Hybrid,
            history_len: 64,
            min_history: 20,
            pattern_len: 2,
            min_pattern_samples: 3,
            max_repetition_rate: 0.3,
            min_confidence: 0.6,
            ..StrategyConfig::default()
        },
        staking,
        instruments: symbols
            .iter()
            .map(|s| InstrumentConfig {
                symbol: s.to_string(),
                decimals: 2,
            })
            .collect(),
        notify: NotifyConfig::default(),
        state_dir: None,
    }
}

fn no_cooldown() -> StakeConfig {
    StakeConfig {
        cooldown_secs: 0,
        ..StakeConfig::default()
    }
}

struct Harness {
    orchestrator: Orchestrator<MockGateway>,
    gateway: Arc<MockGateway>,
    notifier: Arc<RecordingNotifier>,
    /// Seconds after t0 of the next synthetic tick
    clock: i64,
}

impl Harness {
    async fn new(config: AppConfig, gateway: MockGateway) -> Self {
        let gateway = Arc::new(gateway);
        let notifier = Arc::new(RecordingNotifier::default());
        let mut orchestrator = Orchestrator::new(config, Arc::clone(&gateway), notifier.clone());
        orchestrator.bootstrap().await.unwrap();
        Self {
            orchestrator,
            gateway,
            notifier,
            clock: 100,
        }
    }

    fn tick(&mut self, symbol: &str, digit: u8) -> Option<EvaluationOutcome> {
        self.clock += 1;
        self.orchestrator
            .on_observation(observation(symbol, digit, self.clock), Utc::now())
    }

    async fn step(&mut self) -> Option<SessionExit> {
        timeout(Duration::from_secs(2), self.orchestrator.step())
            .await
            .expect("no event within 2s")
    }

    /// Tick until a proposal, then run execution, settlement and the
    /// stream id report of the watched contract
    async fn trade(&mut self, digit: u8) -> Decimal {
        let Some(EvaluationOutcome::Proposed(proposed)) = self.tick(SYMBOL, digit) else {
            panic!("expected a proposal");
        };
        assert_eq!(self.step().await, None);
        assert_eq!(
            self.orchestrator.positions().instrument_state(SYMBOL),
            PositionState::Open
        );
        assert_eq!(self.step().await, None);
        assert_eq!(self.step().await, None);
        proposed.stakes[0]
    }

    /// Tick until a proposal and open it; the contract stays unsettled
    async fn open(&mut self, digit: u8) {
        assert!(matches!(
            self.tick(SYMBOL, digit),
            Some(EvaluationOutcome::Proposed(_))
        ));
        assert_eq!(self.step().await, None);
        assert_eq!(self.step().await, None);
        assert_eq!(
            self.orchestrator.positions().instrument_state(SYMBOL),
            PositionState::Open
        );
    }
}

fn open_contract(contract_id: &str) -> OpenContract {
    OpenContract {
        contract_id: contract_id.to_string(),
        symbol: Some(SYMBOL.to_string()),
        buy_price: Some(Decimal::ONE),
    }
}

async fn wait_for(mut ready: impl FnMut() -> bool) {
    for _ in 0..50 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn leg_subscription(h: &Harness) -> Option<String> {
    h.orchestrator.positions().position(SYMBOL)?.legs[0]
        .subscription_id
        .clone()
}

fn seeded_gateway() -> MockGateway {
    MockGateway::new().with_history(SYMBOL, alternating(SYMBOL, 15))
}

#[tokio::test]
async fn test_loss_loss_win_stake_trajectory() {
    let gateway = seeded_gateway();
    gateway.push_outcome(Decimal::new(-1, 0));
    gateway.push_outcome(Decimal::new(-2, 0));
    gateway.push_outcome(Decimal::new(380, 2));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    let mut stakes = Vec::new();
    let mut losses = Vec::new();
    for digit in [7, 2, 7] {
        stakes.push(h.trade(digit).await);
        losses.push(h.orchestrator.positions().policy_state().consecutive_losses);
    }

    assert_eq!(stakes, vec![Decimal::ONE, Decimal::TWO, Decimal::from(4)]);
    assert_eq!(losses, vec![1, 2, 0]);

    let state = h.orchestrator.positions().policy_state();
    assert_eq!(state.current_stake, Decimal::ONE);
    assert_eq!(state.total_trades, 3);
    assert_eq!(state.wins, 1);
    assert_eq!(state.cumulative_pnl, Decimal::new(80, 2));
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Settled(Outcome::Won)
    );

    let orders = h.gateway.orders();
    assert_eq!(orders.len(), 3);
    assert_ne!(orders[0].barrier, orders[1].barrier);
    assert_ne!(orders[1].barrier, orders[2].barrier);
}

#[tokio::test]
async fn test_consecutive_loss_limit_halts_trading() {
    let gateway = seeded_gateway();
    gateway.push_outcome(Decimal::new(-1, 0));
    gateway.push_outcome(Decimal::new(-2, 0));
    let staking = StakeConfig {
        max_consecutive_losses: 2,
        ..no_cooldown()
    };
    let mut h = Harness::new(config(&[SYMBOL], staking), gateway).await;

    h.trade(7).await;
    h.trade(2).await;
    assert_eq!(
        h.orchestrator.halted(),
        Some(&RiskLimit::ConsecutiveLosses { count: 2, max: 2 })
    );

    assert_eq!(
        h.tick(SYMBOL, 7),
        Some(EvaluationOutcome::RiskLimitExceeded(RiskLimit::ConsecutiveLosses {
            count: 2,
            max: 2
        }))
    );
    assert_eq!(h.gateway.orders().len(), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let halts = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::Halted { .. }))
        .count();
    assert_eq!(halts, 1);

    // A new session starts from the initial stake
    h.orchestrator.control_handle().reset_session();
    assert_eq!(h.step().await, None);
    assert!(h.orchestrator.halted().is_none());
    assert_eq!(h.orchestrator.positions().policy_state().current_stake, Decimal::ONE);
    assert!(matches!(
        h.tick(SYMBOL, 2),
        Some(EvaluationOutcome::Proposed(_))
    ));
}

#[tokio::test]
async fn test_rejected_contract_returns_to_idle() {
    let gateway = seeded_gateway();
    gateway.push_failure(SessionError::Protocol(ProtocolError::new(
        "ContractBuyValidationError",
        "price moved",
    )));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Proposed
    );
    // Busy while the proposal is in flight
    assert_eq!(
        h.tick(SYMBOL, 2),
        Some(EvaluationOutcome::Busy(PositionState::Proposed))
    );

    assert_eq!(h.step().await, None);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Idle
    );
    let state = h.orchestrator.positions().policy_state();
    assert_eq!(state.current_stake, Decimal::ONE);
    assert_eq!(state.total_trades, 0);
    assert_eq!(h.orchestrator.positions().last_prediction(SYMBOL), None);
    assert!(h.gateway.orders().is_empty());
}

#[tokio::test]
async fn test_rate_limit_backs_off_instrument() {
    let gateway = seeded_gateway();
    gateway.push_failure(SessionError::Protocol(ProtocolError::new(
        "RateLimit",
        "too many requests",
    )));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    assert_eq!(h.step().await, None);

    let outcome = h.tick(SYMBOL, 2);
    let Some(EvaluationOutcome::BackingOff { until }) = outcome else {
        panic!("expected backoff, got {:?}", outcome);
    };
    assert!(until > Utc::now());
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Idle
    );
}

#[tokio::test]
async fn test_invalid_token_is_fatal() {
    let gateway = seeded_gateway();
    gateway.push_failure(SessionError::Protocol(ProtocolError::new(
        "InvalidToken",
        "token revoked",
    )));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    let exit = h.step().await;
    assert!(matches!(exit, Some(SessionExit::Fatal(reason)) if reason.contains("InvalidToken")));
}

#[tokio::test]
async fn test_short_history_never_signals() {
    let gateway = MockGateway::new()
        .with_history("R_50", alternating("R_50", 2))
        .with_history("R_75", alternating("R_75", 2));
    let mut h = Harness::new(config(&["R_50", "R_75"], no_cooldown()), gateway).await;

    for symbol in ["R_50", "R_75"] {
        assert_eq!(
            h.tick(symbol, 7),
            Some(EvaluationOutcome::NoSignal(NoSignal::InsufficientHistory {
                have: 7,
                need: 20
            }))
        );
    }
    assert!(h.gateway.orders().is_empty());
}

#[tokio::test]
async fn test_out_of_order_tick_is_ignored() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    let before = h.orchestrator.session().instrument(SYMBOL).unwrap().history.len();

    assert_eq!(
        h.orchestrator
            .on_observation(observation(SYMBOL, 7, 0), Utc::now()),
        None
    );
    assert_eq!(
        h.orchestrator.on_observation(observation("R_10", 7, 500), Utc::now()),
        None
    );
    assert_eq!(
        h.orchestrator.session().instrument(SYMBOL).unwrap().history.len(),
        before
    );
}

#[tokio::test]
async fn test_stop_pauses_trading_but_keeps_observing() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    let before = h.orchestrator.session().instrument(SYMBOL).unwrap().history.len();

    h.orchestrator.control_handle().stop();
    assert_eq!(h.step().await, None);
    assert!(!h.orchestrator.is_trading());
    assert_eq!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Paused));
    assert_eq!(
        h.orchestrator.session().instrument(SYMBOL).unwrap().history.len(),
        before + 1
    );

    h.orchestrator.control_handle().start();
    assert_eq!(h.step().await, None);
    assert!(matches!(h.tick(SYMBOL, 2), Some(EvaluationOutcome::Proposed(_))));
}

#[tokio::test]
async fn test_reconnect_settles_missed_contract() {
    // No scripted outcome: the contract stays open until reconciliation
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    assert_eq!(h.step().await, None);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Open
    );

    h.gateway.set_status(settled("1000", Decimal::new(95, 2)));
    h.orchestrator
        .handle_transport(
            TransportEvent::Disconnected {
                reason: "reset by peer".to_string(),
            },
            Utc::now(),
        )
        .await;
    assert!(h
        .orchestrator
        .session()
        .instrument(SYMBOL)
        .unwrap()
        .tick_subscription
        .is_none());

    let exit = h
        .orchestrator
        .handle_transport(TransportEvent::Reconnected, Utc::now())
        .await;
    assert_eq!(exit, None);

    assert_eq!(h.gateway.tick_subscriptions(), 2);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Settled(Outcome::Won)
    );
    let state = h.orchestrator.positions().policy_state();
    assert_eq!(state.wins, 1);
    assert_eq!(state.cumulative_pnl, Decimal::new(95, 2));
}

#[tokio::test]
async fn test_reconnect_rewatches_open_contract() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    assert_eq!(h.step().await, None);

    h.gateway.set_open(vec![open_contract("1000")]);
    h.orchestrator
        .handle_transport(TransportEvent::Reconnected, Utc::now())
        .await;

    wait_for(|| h.gateway.watched().len() >= 2).await;
    assert_eq!(h.gateway.watched(), vec!["1000".to_string(), "1000".to_string()]);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Open
    );
}

#[tokio::test]
async fn test_reconnect_adopts_contract_bought_for_proposal() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));
    wait_for(|| !h.gateway.orders().is_empty()).await;

    // The buy went through but its execution report is still queued
    h.gateway.set_open(vec![open_contract("1000")]);
    let exit = h
        .orchestrator
        .handle_transport(TransportEvent::Reconnected, Utc::now())
        .await;
    assert_eq!(exit, None);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Open
    );

    // Execution report and stream id, in either order
    assert_eq!(h.step().await, None);
    assert_eq!(h.step().await, None);
    let position = h.orchestrator.positions().position(SYMBOL).unwrap();
    assert_eq!(position.state, PositionState::Open);
    let contracts: Vec<&str> = position.contract_ids().collect();
    assert_eq!(contracts, vec!["1000"]);
    assert_eq!(h.gateway.watched(), vec!["1000".to_string()]);
    assert_eq!(h.gateway.orders().len(), 1);
    assert_eq!(h.orchestrator.positions().policy_state().total_trades, 0);
}

#[tokio::test]
async fn test_reconnect_abandons_proposal_without_contract() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));

    h.orchestrator
        .handle_transport(TransportEvent::Reconnected, Utc::now())
        .await;
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Idle
    );
    assert_eq!(h.orchestrator.positions().policy_state().total_trades, 0);
}

#[tokio::test]
async fn test_late_execution_after_abandon_still_settles() {
    let gateway = seeded_gateway();
    gateway.push_outcome(Decimal::new(-1, 0));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;
    assert!(matches!(h.tick(SYMBOL, 7), Some(EvaluationOutcome::Proposed(_))));

    // Portfolio did not list the contract yet
    h.orchestrator
        .handle_transport(TransportEvent::Reconnected, Utc::now())
        .await;
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Idle
    );

    // Execution report, settlement, stream id
    assert_eq!(h.step().await, None);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Open
    );
    assert_eq!(h.step().await, None);
    assert_eq!(h.step().await, None);

    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Settled(Outcome::Lost)
    );
    let state = h.orchestrator.positions().policy_state();
    assert_eq!(state.total_trades, 1);
    assert_eq!(state.cumulative_pnl, Decimal::new(-1, 0));
    assert_eq!(state.current_stake, Decimal::TWO);
}

#[tokio::test]
async fn test_failed_load_is_retried_by_housekeeping() {
    let gateway = seeded_gateway();
    gateway.push_history_failure(SessionError::Protocol(ProtocolError::new(
        "RateLimit",
        "too many requests",
    )));
    gateway.push_history_failure(SessionError::Connection("reset".to_string()));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    let instrument = h.orchestrator.session().instrument(SYMBOL).unwrap();
    assert!(!instrument.loaded);
    assert!(instrument.tick_subscription.is_none());
    assert_eq!(instrument.history.len(), 0);
    assert_eq!(h.gateway.tick_subscriptions(), 0);

    // Still inside the rate-limit back-off
    assert_eq!(h.orchestrator.housekeeping(Utc::now(), false).await, None);
    assert_eq!(h.gateway.tick_subscriptions(), 0);

    // Second attempt hits a dropped connection and waits again
    let later: DateTime<Utc> = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(h.orchestrator.housekeeping(later, false).await, None);
    assert!(!h.orchestrator.session().instrument(SYMBOL).unwrap().loaded);
    assert_eq!(
        h.orchestrator
            .housekeeping(later + chrono::Duration::seconds(1), false)
            .await,
        None
    );
    assert_eq!(h.gateway.tick_subscriptions(), 0);

    assert_eq!(
        h.orchestrator
            .housekeeping(later + chrono::Duration::seconds(10), false)
            .await,
        None
    );
    let instrument = h.orchestrator.session().instrument(SYMBOL).unwrap();
    assert!(instrument.loaded);
    assert!(instrument.tick_subscription.is_some());
    assert_eq!(instrument.history.len(), 32);
    assert_eq!(h.gateway.tick_subscriptions(), 1);

    // Loaded instruments are left alone
    h.orchestrator
        .housekeeping(later + chrono::Duration::seconds(20), false)
        .await;
    assert_eq!(h.gateway.tick_subscriptions(), 1);
}

#[tokio::test]
async fn test_settled_contract_stream_is_released() {
    let gateway = seeded_gateway();
    gateway.push_outcome(Decimal::new(95, 2));
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), gateway).await;

    // Settlement arrives before the stream id
    h.trade(7).await;
    wait_for(|| !h.gateway.unsubscribed().is_empty()).await;
    assert_eq!(h.gateway.unsubscribed(), vec!["poc-1000".to_string()]);
    assert_eq!(leg_subscription(&h), None);
}

#[tokio::test]
async fn test_stream_released_when_watched_contract_settles() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    h.open(7).await;
    assert_eq!(leg_subscription(&h), Some("poc-1000".to_string()));
    assert!(h.gateway.unsubscribed().is_empty());

    h.orchestrator
        .market_sender()
        .send(MarketEvent::Contract(settled("1000", Decimal::new(-1, 0))))
        .unwrap();
    assert_eq!(h.step().await, None);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Settled(Outcome::Lost)
    );
    wait_for(|| !h.gateway.unsubscribed().is_empty()).await;
    assert_eq!(h.gateway.unsubscribed(), vec!["poc-1000".to_string()]);
    assert_eq!(leg_subscription(&h), None);
}

#[tokio::test]
async fn test_close_open_positions_settles_with_sale_proceeds() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    h.open(7).await;
    h.gateway.set_sale_price(Decimal::new(40, 2));

    h.orchestrator.close_open_positions(Utc::now()).await;
    assert_eq!(h.gateway.closed(), vec!["1000".to_string()]);
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Settled(Outcome::Lost)
    );
    let state = h.orchestrator.positions().policy_state();
    assert_eq!(state.total_trades, 1);
    assert_eq!(state.cumulative_pnl, Decimal::new(-60, 2));
    wait_for(|| !h.gateway.unsubscribed().is_empty()).await;
    assert_eq!(h.gateway.unsubscribed(), vec!["poc-1000".to_string()]);

    // Nothing left to sell
    h.orchestrator.close_open_positions(Utc::now()).await;
    assert_eq!(h.gateway.closed().len(), 1);
}

#[tokio::test]
async fn test_unsellable_contract_stays_open() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    h.open(7).await;

    h.orchestrator.close_open_positions(Utc::now()).await;
    assert!(h.gateway.closed().is_empty());
    assert_eq!(
        h.orchestrator.positions().instrument_state(SYMBOL),
        PositionState::Open
    );
    assert_eq!(h.orchestrator.positions().policy_state().total_trades, 0);
}

#[tokio::test]
async fn test_fatal_disconnect_ends_session() {
    let mut h = Harness::new(config(&[SYMBOL], no_cooldown()), seeded_gateway()).await;
    let exit = h
        .orchestrator
        .handle_transport(TransportEvent::FatalDisconnect { attempts: 10 }, Utc::now())
        .await;
    assert!(matches!(exit, Some(SessionExit::Fatal(_))));
}

#[tokio::test]
async fn test_run_reports_summary_on_shutdown() {
    let gateway = Arc::new(seeded_gateway());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut orchestrator = Orchestrator::new(
        config(&[SYMBOL], no_cooldown()),
        Arc::clone(&gateway),
        notifier.clone(),
    );
    orchestrator.bootstrap().await.unwrap();

    let control = orchestrator.control_handle();
    let session = tokio::spawn(orchestrator.run());
    assert!(control.shutdown());

    let report = timeout(Duration::from_secs(2), session)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.exit, SessionExit::Shutdown);
    assert_eq!(report.summary.total_trades, 0);
    assert!(notifier
        .sent()
        .iter()
        .any(|n| matches!(n, Notification::Summary(_))));
}

#[tokio::test]
async fn test_shutdown_closes_open_contracts_when_configured() {
    let staking = StakeConfig {
        close_on_shutdown: true,
        ..no_cooldown()
    };
    let mut h = Harness::new(config(&[SYMBOL], staking), seeded_gateway()).await;
    h.open(7).await;
    h.gateway.set_sale_price(Decimal::new(150, 2));

    let Harness {
        orchestrator,
        gateway,
        ..
    } = h;
    let control = orchestrator.control_handle();
    let session = tokio::spawn(orchestrator.run());
    assert!(control.shutdown());

    let report = timeout(Duration::from_secs(2), session)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.exit, SessionExit::Shutdown);
    assert_eq!(gateway.closed(), vec!["1000".to_string()]);
    assert_eq!(report.summary.total_trades, 1);
    assert_eq!(report.summary.wins, 1);
    assert_eq!(report.summary.cumulative_pnl, Decimal::new(50, 2));
    assert_eq!(report.summary.open_positions, 0);
}
