//! Orchestrator - the only component with side effects
//!
//! Owns the session state, feeds observations to the signal engine, asks the
//! position manager for proposals and executes them through the gateway.
//! Events are handled one at a time; contract execution runs in a spawned
//! task and reports back, so one instrument sitting in Proposed never blocks
//! the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, SessionConfig};
use crate::error::{ProtocolErrorClass, SessionError};
use crate::gateway::{ContractGateway, ContractOrder, MarketEvent, MarketSender};
use crate::notifier::{Notification, Notifier, SessionSummary};
use crate::position::{
    OpenedLeg, PositionManager, PositionState, ProposeRejection, ProposedPosition,
    SettlementUpdate,
};
use crate::protocol::ContractUpdate;
use crate::reconciler;
use crate::signal::{Evaluation, NoSignal, SignalEngine};
use crate::stake::{GuardContext, GuardVerdict, RiskLimit, StakePolicy};
use crate::state::{InstrumentSnapshot, NowState, SessionState, SessionStats, StateManager};
use crate::transport::{ConnectionState, TransportEvent};
use crate::types::Observation;

/// Open positions older than this are checked against the service
const STALE_POSITION_SECS: i64 = 30;

/// Housekeeping ticks between stale-position checks
const STALE_CHECK_EVERY: u32 = 15;

/// Commands from the external scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Resume opening positions
    Start,
    /// Stop opening positions; observation and settlement continue
    Stop,
    /// Fresh stake state for a new trading day
    ResetSession,
    Shutdown,
}

/// Cloneable handle for controlling a running orchestrator
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    pub fn start(&self) -> bool {
        self.tx.send(Command::Start).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.tx.send(Command::Stop).is_ok()
    }

    pub fn reset_session(&self) -> bool {
        self.tx.send(Command::ResetSession).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(Command::Shutdown).is_ok()
    }
}

/// Result of a spawned execution
#[derive(Debug)]
pub struct ExecutionReport {
    pub instrument: String,
    pub position_id: Uuid,
    pub predicted_outcome: u8,
    /// Legs the service accepted before any failure
    pub legs: Vec<OpenedLeg>,
    pub error: Option<SessionError>,
}

/// What happened when an instrument was evaluated
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Paused,
    UnknownInstrument,
    BackingOff { until: DateTime<Utc> },
    Busy(PositionState),
    RiskLimitExceeded(RiskLimit),
    NoSignal(NoSignal),
    Proposed(ProposedPosition),
}

/// How the session reacts to a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Fatal,
    RetryAfter(Duration),
    Continue,
}

pub fn classify_error(err: &SessionError, config: &SessionConfig) -> ErrorAction {
    match err {
        SessionError::Protocol(e) => match e.class() {
            ProtocolErrorClass::InvalidCredential => ErrorAction::Fatal,
            ProtocolErrorClass::RateLimited => {
                ErrorAction::RetryAfter(Duration::from_secs(config.rate_limit_backoff_secs))
            }
            ProtocolErrorClass::MarketClosed => {
                ErrorAction::RetryAfter(Duration::from_secs(config.market_closed_backoff_secs))
            }
            ProtocolErrorClass::Unknown => ErrorAction::Continue,
        },
        SessionError::FatalDisconnect { .. } => ErrorAction::Fatal,
        SessionError::Connection(_)
        | SessionError::RequestTimeout { .. }
        | SessionError::Malformed(_) => ErrorAction::Continue,
    }
}

/// Why the session loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    Shutdown,
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub exit: SessionExit,
    pub summary: SessionSummary,
}

/// One unit of work for the event loop
#[derive(Debug)]
pub enum Input {
    Market(MarketEvent),
    Execution(ExecutionReport),
    Transport(TransportEvent),
    Control(Command),
}

pub struct Orchestrator<G: ContractGateway + 'static> {
    config: AppConfig,
    gateway: Arc<G>,
    engine: SignalEngine,
    positions: PositionManager,
    session: SessionState,
    notifier: Arc<dyn Notifier>,
    state_manager: Option<StateManager>,
    market_tx: MarketSender,
    market_rx: mpsc::UnboundedReceiver<MarketEvent>,
    exec_tx: mpsc::UnboundedSender<ExecutionReport>,
    exec_rx: mpsc::UnboundedReceiver<ExecutionReport>,
    control_tx: mpsc::UnboundedSender<Command>,
    control_rx: mpsc::UnboundedReceiver<Command>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    trading: bool,
    halted: Option<RiskLimit>,
    session_id: Uuid,
    started_at: DateTime<Utc>,
}

impl<G: ContractGateway + 'static> Orchestrator<G> {
    pub fn new(config: AppConfig, gateway: Arc<G>, notifier: Arc<dyn Notifier>) -> Self {
        let (market_tx, market_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = SessionState::new(&config.instruments, config.strategy.history_len);

        Self {
            engine: SignalEngine::new(config.strategy.clone()),
            positions: PositionManager::new(StakePolicy::new(config.staking.clone())),
            session,
            config,
            gateway,
            notifier,
            state_manager: None,
            market_tx,
            market_rx,
            exec_tx,
            exec_rx,
            control_tx,
            control_rx,
            transport_rx: None,
            trading: true,
            halted: None,
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn with_transport_events(mut self, rx: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        self.transport_rx = Some(rx);
        self
    }

    pub fn with_state_manager(mut self, state_manager: StateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn market_sender(&self) -> MarketSender {
        self.market_tx.clone()
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_trading(&self) -> bool {
        self.trading
    }

    pub fn halted(&self) -> Option<&RiskLimit> {
        self.halted.as_ref()
    }

    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary::from_state(
            self.session_id,
            self.started_at,
            now,
            self.positions.policy_state(),
            self.positions.open_positions(),
            self.halted.as_ref().map(|l| l.to_string()),
        )
    }

    /// Seed every instrument's history and subscribe to its ticks
    ///
    /// An instrument that fails to load is retried by `housekeeping` once
    /// its back-off has passed; a fatal error is returned.
    pub async fn bootstrap(&mut self) -> Result<(), SessionError> {
        let now = Utc::now();
        for symbol in self.session.symbols() {
            self.try_load(&symbol, now).await?;
        }
        Ok(())
    }

    /// Load one instrument, scheduling a retry when that fails
    async fn try_load(&mut self, symbol: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
        let Err(e) = self.load_instrument(symbol).await else {
            return Ok(());
        };
        if self.handle_error(Some(symbol), &e, now).is_some() {
            return Err(e);
        }
        // Errors without their own back-off still wait one rate-limit interval
        let delay = chrono_delay(Duration::from_secs(self.config.session.rate_limit_backoff_secs));
        if let Some(state) = self.session.instrument_mut(symbol) {
            if !state.backing_off(now) {
                state.retry_after = Some(now + delay);
            }
        }
        Ok(())
    }

    /// Retry instruments whose history or tick stream failed to load
    async fn reload_instruments(&mut self, now: DateTime<Utc>) -> Option<SessionExit> {
        if self.session.connection != ConnectionState::Ready {
            return None;
        }
        let due: Vec<String> = self
            .session
            .symbols()
            .into_iter()
            .filter(|s| self.session.instrument(s).map(|i| i.needs_load(now)).unwrap_or(false))
            .collect();
        for symbol in due {
            info!("{}: retrying history and tick stream", symbol);
            if let Err(e) = self.try_load(&symbol, now).await {
                return Some(SessionExit::Fatal(e.to_string()));
            }
        }
        None
    }

    async fn load_instrument(&mut self, symbol: &str) -> Result<(), SessionError> {
        let Some(instrument) = self.session.instrument(symbol).map(|i| i.config.clone()) else {
            return Ok(());
        };
        let history = self
            .gateway
            .history(&instrument, self.config.strategy.history_len)
            .await?;
        let subscription = self
            .gateway
            .watch_ticks(&instrument, self.market_tx.clone())
            .await?;

        if let Some(state) = self.session.instrument_mut(symbol) {
            state.history.seed(history);
            state.tick_subscription = subscription;
            state.loaded = true;
            info!(
                "{} ready: {} observations, subscription {:?}",
                symbol,
                state.history.len(),
                state.tick_subscription
            );
        }
        Ok(())
    }

    /// The single observation update path
    pub fn on_observation(
        &mut self,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Option<EvaluationOutcome> {
        let symbol = observation.instrument.clone();
        let state = self.session.instrument_mut(&symbol)?;
        if !state.history.push(observation) {
            return None;
        }
        Some(self.evaluate_instrument(&symbol, now))
    }

    /// Decide whether to open a position on `symbol` right now
    pub fn evaluate_instrument(&mut self, symbol: &str, now: DateTime<Utc>) -> EvaluationOutcome {
        if !self.trading {
            return EvaluationOutcome::Paused;
        }
        match self.session.instrument(symbol) {
            None => return EvaluationOutcome::UnknownInstrument,
            Some(instrument) if instrument.backing_off(now) => {
                if let Some(until) = instrument.retry_after {
                    return EvaluationOutcome::BackingOff { until };
                }
            }
            Some(_) => {}
        }
        let position_state = self.positions.instrument_state(symbol);
        if position_state.is_active() {
            return EvaluationOutcome::Busy(position_state);
        }
        if let GuardVerdict::RiskLimitExceeded(limit) = self.positions.check_guards(symbol, now) {
            self.on_risk_limit(&limit);
            return EvaluationOutcome::RiskLimitExceeded(limit);
        }

        let Some(instrument) = self.session.instrument(symbol) else {
            return EvaluationOutcome::UnknownInstrument;
        };
        let evaluation = self
            .engine
            .evaluate(&instrument.history, self.positions.last_prediction(symbol));
        let signal = match evaluation {
            Evaluation::Signal(signal) => signal,
            Evaluation::NoSignal(reason) => {
                debug!("{}: no signal ({})", symbol, reason);
                return EvaluationOutcome::NoSignal(reason);
            }
        };

        match self.positions.try_propose(symbol, &signal, now) {
            Ok(proposed) => {
                info!(
                    "{}: signal digit {} confidence {:.2} -> proposing {:?}",
                    symbol, signal.predicted_outcome, signal.confidence, proposed.stakes
                );
                debug!("{}: {}", symbol, signal.rationale);
                self.spawn_execution(&proposed);
                EvaluationOutcome::Proposed(proposed)
            }
            Err(ProposeRejection::Busy(state)) => EvaluationOutcome::Busy(state),
            Err(ProposeRejection::RiskLimitExceeded(limit)) => {
                self.on_risk_limit(&limit);
                EvaluationOutcome::RiskLimitExceeded(limit)
            }
        }
    }

    fn spawn_execution(&self, proposed: &ProposedPosition) {
        let contract = &self.config.strategy.contract;
        let orders: Vec<ContractOrder> = proposed
            .stakes
            .iter()
            .map(|stake| ContractOrder {
                instrument: proposed.instrument.clone(),
                kind: contract.kind,
                barrier: proposed.predicted_outcome,
                stake: *stake,
                currency: contract.currency.clone(),
                duration_ticks: contract.duration_ticks,
            })
            .collect();
        let gateway = Arc::clone(&self.gateway);
        let tx = self.exec_tx.clone();
        let instrument = proposed.instrument.clone();
        let position_id = proposed.position_id;
        let predicted_outcome = proposed.predicted_outcome;

        tokio::spawn(async move {
            let mut legs = Vec::with_capacity(orders.len());
            let mut error = None;
            for order in &orders {
                match gateway.open_contract(order).await {
                    Ok(contract) => legs.push(OpenedLeg {
                        contract_id: contract.contract_id,
                        stake: contract.buy_price,
                    }),
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            let _ = tx.send(ExecutionReport {
                instrument,
                position_id,
                predicted_outcome,
                legs,
                error,
            });
        });
    }

    /// Follow a contract; the stream id comes back as `ContractWatched`
    fn spawn_watch(&self, contract_id: String) {
        let gateway = Arc::clone(&self.gateway);
        let sink = self.market_tx.clone();
        tokio::spawn(async move {
            match gateway.watch_contract(&contract_id, sink.clone()).await {
                Ok(Some(subscription_id)) => {
                    let _ = sink.send(MarketEvent::ContractWatched {
                        contract_id,
                        subscription_id,
                    });
                }
                Ok(None) => debug!("Contract {} watched without a stream id", contract_id),
                Err(e) => warn!("Failed to watch contract {}: {}", contract_id, e),
            }
        });
    }

    fn release_stream(&self, subscription_id: String) {
        let gateway = Arc::clone(&self.gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.unsubscribe(&subscription_id).await {
                debug!("Failed to release stream {}: {}", subscription_id, e);
            }
        });
    }

    pub fn handle_execution(
        &mut self,
        report: ExecutionReport,
        now: DateTime<Utc>,
    ) -> Option<SessionExit> {
        let contract_ids: Vec<String> = report.legs.iter().map(|l| l.contract_id.clone()).collect();
        if contract_ids.is_empty() {
            self.positions.reject_proposal(report.position_id);
        } else if self.positions.mark_open(report.position_id, report.legs.clone()) {
            for contract_id in contract_ids {
                self.spawn_watch(contract_id);
            }
        } else {
            // Proposal was reconciled before the report arrived
            let adopted = self.positions.adopt(
                &report.instrument,
                report.predicted_outcome,
                report.legs,
                now,
            );
            for contract_id in adopted {
                self.spawn_watch(contract_id);
            }
        }

        let err = report.error?;
        warn!("{}: execution failed: {}", report.instrument, err);
        self.handle_error(Some(&report.instrument), &err, now)
    }

    pub async fn handle_market(&mut self, event: MarketEvent, now: DateTime<Utc>) -> Option<EvaluationOutcome> {
        match event {
            MarketEvent::Observation(observation) => self.on_observation(observation, now),
            MarketEvent::Contract(update) => {
                self.on_contract_update(update, now).await;
                None
            }
            MarketEvent::ContractWatched {
                contract_id,
                subscription_id,
            } => {
                if !self.positions.attach_subscription(&contract_id, subscription_id.clone()) {
                    debug!("Contract {} already settled, releasing its stream", contract_id);
                    self.release_stream(subscription_id);
                }
                None
            }
        }
    }

    async fn on_contract_update(&mut self, update: ContractUpdate, now: DateTime<Utc>) {
        let Some(profit) = update.settled_profit() else {
            return;
        };
        let recorded = self.positions.record_settlement(&update.contract_id, profit, now);
        if let Some(subscription_id) = self.positions.take_subscription(&update.contract_id) {
            self.release_stream(subscription_id);
        }
        match recorded {
            SettlementUpdate::Settled(settlement) => {
                self.notify(Notification::Settlement(settlement));
                let verdict = self.positions.policy().check_guards(
                    self.positions.policy_state(),
                    &GuardContext::default(),
                );
                if let GuardVerdict::RiskLimitExceeded(limit) = verdict {
                    self.on_risk_limit(&limit);
                }
                self.write_snapshot(now).await;
            }
            SettlementUpdate::Pending { remaining } => {
                debug!("Contract {} settled, {} leg(s) open", update.contract_id, remaining);
            }
            SettlementUpdate::Duplicate => {
                debug!("Duplicate settlement for {}", update.contract_id);
            }
            SettlementUpdate::Unknown => {
                warn!("Settlement for untracked contract {}", update.contract_id);
            }
        }
    }

    fn on_risk_limit(&mut self, limit: &RiskLimit) {
        if !limit.halts_session() {
            debug!("Risk limit: {}", limit);
            return;
        }
        if self.halted.is_none() {
            warn!("Trading halted: {}", limit);
            self.halted = Some(limit.clone());
            self.notify(Notification::Halted {
                reason: limit.to_string(),
            });
        }
    }

    pub async fn handle_transport(&mut self, event: TransportEvent, now: DateTime<Utc>) -> Option<SessionExit> {
        match event {
            TransportEvent::Disconnected { reason } => {
                warn!("Session disconnected: {}", reason);
                self.session.connection = ConnectionState::Disconnected;
                for state in self.session.instruments.values_mut() {
                    state.tick_subscription = None;
                    state.loaded = false;
                }
                self.positions.clear_subscriptions();
                None
            }
            TransportEvent::Reconnected => {
                info!("Session reconnected, replaying subscriptions");
                self.session.connection = ConnectionState::Ready;
                if let Err(e) = self.bootstrap().await {
                    return Some(SessionExit::Fatal(e.to_string()));
                }
                self.reconcile(true, now).await
            }
            TransportEvent::FatalDisconnect { attempts } => {
                self.session.connection = ConnectionState::Failed;
                Some(SessionExit::Fatal(format!(
                    "connection lost after {} reconnect attempts",
                    attempts
                )))
            }
        }
    }

    /// Compare tracked positions with the service's open contracts
    ///
    /// `rewatch` re-subscribes to contracts that are still open, needed after
    /// a reconnect dropped every subscription.
    pub async fn reconcile(&mut self, rewatch: bool, now: DateTime<Utc>) -> Option<SessionExit> {
        let open = match self.gateway.open_contracts().await {
            Ok(open) => open,
            Err(e) => {
                warn!("Reconciliation skipped: {}", e);
                return self.handle_error(None, &e, now);
            }
        };
        let result = reconciler::reconcile(self.positions.positions(), &open);

        for adoption in result.adopted {
            let adopted = self.positions.adopt(
                &adoption.instrument,
                adoption.predicted_outcome,
                adoption.legs,
                now,
            );
            for contract_id in adopted {
                self.spawn_watch(contract_id);
            }
        }
        for position_id in &result.abandoned {
            if self.positions.abandon(*position_id) {
                warn!("Abandoned proposal {} with no contract", position_id);
            }
        }
        for contract in result.missing {
            match self.gateway.contract_status(&contract.contract_id).await {
                Ok(update) if update.settled_profit().is_some() => {
                    self.on_contract_update(update, now).await;
                }
                Ok(_) => self.spawn_watch(contract.contract_id),
                Err(e) => {
                    warn!("Status query for {} failed: {}", contract.contract_id, e);
                    if let Some(exit) = self.handle_error(Some(&contract.instrument), &e, now) {
                        return Some(exit);
                    }
                }
            }
        }
        if rewatch {
            for contract in result.confirmed {
                self.spawn_watch(contract.contract_id);
            }
        }
        None
    }

    /// Apply the error policy; returns an exit for fatal errors
    fn handle_error(
        &mut self,
        instrument: Option<&str>,
        err: &SessionError,
        now: DateTime<Utc>,
    ) -> Option<SessionExit> {
        match classify_error(err, &self.config.session) {
            ErrorAction::Fatal => {
                error!("Fatal session error: {}", err);
                Some(SessionExit::Fatal(err.to_string()))
            }
            ErrorAction::RetryAfter(delay) => {
                let until = now + chrono_delay(delay);
                match instrument.and_then(|s| self.session.instrument_mut(s)) {
                    Some(state) => {
                        warn!("{}: {} - backing off until {}", state.config.symbol, err, until);
                        state.retry_after = Some(until);
                    }
                    None => warn!("{} - no instrument to back off", err),
                }
                None
            }
            ErrorAction::Continue => {
                warn!("Session error: {}", err);
                None
            }
        }
    }

    pub fn handle_command(&mut self, command: Command) -> Option<SessionExit> {
        match command {
            Command::Start => {
                info!("Trading started");
                self.trading = true;
            }
            Command::Stop => {
                info!("Trading stopped, still observing");
                self.trading = false;
            }
            Command::ResetSession => {
                self.positions.reset_session();
                self.halted = None;
            }
            Command::Shutdown => {
                info!("Shutdown requested");
                return Some(SessionExit::Shutdown);
            }
        }
        None
    }

    /// Wait for the next event from any source
    pub async fn next_input(&mut self) -> Input {
        loop {
            tokio::select! {
                Some(event) = self.market_rx.recv() => return Input::Market(event),
                Some(report) = self.exec_rx.recv() => return Input::Execution(report),
                Some(command) = self.control_rx.recv() => return Input::Control(command),
                event = recv_transport(&mut self.transport_rx) => match event {
                    Some(event) => return Input::Transport(event),
                    None => self.transport_rx = None,
                },
            }
        }
    }

    pub async fn handle_input(&mut self, input: Input, now: DateTime<Utc>) -> Option<SessionExit> {
        match input {
            Input::Market(event) => {
                self.handle_market(event, now).await;
                None
            }
            Input::Execution(report) => self.handle_execution(report, now),
            Input::Transport(event) => self.handle_transport(event, now).await,
            Input::Control(command) => self.handle_command(command),
        }
    }

    /// Handle exactly one event
    pub async fn step(&mut self) -> Option<SessionExit> {
        let input = self.next_input().await;
        self.handle_input(input, Utc::now()).await
    }

    /// Periodic work: cooldown release, load retries and stale position checks
    pub async fn housekeeping(&mut self, now: DateTime<Utc>, check_stale: bool) -> Option<SessionExit> {
        for symbol in self.positions.tick(now) {
            debug!("{} back to idle", symbol);
        }
        if let Some(exit) = self.reload_instruments(now).await {
            return Some(exit);
        }
        if !check_stale {
            return None;
        }
        let stale = self.positions.positions().any(|p| {
            p.state == PositionState::Open
                && now - p.opened_at > chrono::Duration::seconds(STALE_POSITION_SECS)
        });
        if stale {
            return self.reconcile(false, now).await;
        }
        None
    }

    /// Sell every unsettled contract at market and settle it with the proceeds
    pub async fn close_open_positions(&mut self, now: DateTime<Utc>) {
        let legs: Vec<(String, Decimal)> = self
            .positions
            .positions()
            .filter(|p| p.state == PositionState::Open)
            .flat_map(|p| {
                p.legs
                    .iter()
                    .filter(|l| l.profit.is_none())
                    .map(|l| (l.contract_id.clone(), l.stake))
            })
            .collect();

        for (contract_id, stake) in legs {
            match self.gateway.close_contract(&contract_id).await {
                Ok(sold_for) => {
                    info!("Closed contract {} for {}", contract_id, sold_for);
                    let update = ContractUpdate {
                        contract_id,
                        symbol: None,
                        profit: Some(sold_for - stake),
                        is_sold: true,
                        status: Some("sold".to_string()),
                    };
                    self.on_contract_update(update, now).await;
                }
                Err(e) => warn!("Failed to close contract {}: {}", contract_id, e),
            }
        }
    }

    /// Run until shutdown or a fatal error
    pub async fn run(mut self) -> anyhow::Result<SessionReport> {
        self.notify(Notification::Started {
            instruments: self.session.symbols(),
        });
        if let Some(state_manager) = &self.state_manager {
            state_manager.init().await?;
        }

        let mut summary_interval = interval(Duration::from_secs(
            self.config.notify.summary_interval_secs.max(1),
        ));
        summary_interval.tick().await;
        let mut housekeeping_interval = interval(Duration::from_secs(1));
        let mut ticks: u32 = 0;

        let exit = loop {
            tokio::select! {
                input = self.next_input() => {
                    if let Some(exit) = self.handle_input(input, Utc::now()).await {
                        break exit;
                    }
                }
                _ = summary_interval.tick() => {
                    let summary = self.summary(Utc::now());
                    self.notify(Notification::Summary(summary));
                }
                _ = housekeeping_interval.tick() => {
                    ticks = ticks.wrapping_add(1);
                    let check_stale = ticks % STALE_CHECK_EVERY == 0;
                    if let Some(exit) = self.housekeeping(Utc::now(), check_stale).await {
                        break exit;
                    }
                }
            }
        };

        if exit == SessionExit::Shutdown && self.config.staking.close_on_shutdown {
            self.close_open_positions(Utc::now()).await;
        }

        let now = Utc::now();
        let summary = self.summary(now);
        let notification = match &exit {
            SessionExit::Shutdown => Notification::Summary(summary.clone()),
            SessionExit::Fatal(reason) => Notification::Fatal {
                reason: reason.clone(),
                summary: summary.clone(),
            },
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!("Final notification failed: {}", e);
        }
        self.write_snapshot(now).await;

        info!(
            "Session {} ended ({:?}): {} trades, P&L {}",
            self.session_id, exit, summary.total_trades, summary.cumulative_pnl
        );
        Ok(SessionReport { exit, summary })
    }

    fn notify(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!("Notification failed: {}", e);
            }
        });
    }

    fn snapshot(&self, now: DateTime<Utc>) -> NowState {
        let stake = self.positions.policy_state();
        let instruments = self
            .session
            .symbols()
            .into_iter()
            .filter_map(|symbol| {
                let state = self.session.instrument(&symbol)?;
                Some(InstrumentSnapshot {
                    observations: state.history.len(),
                    last_digit: state.history.last().map(|o| o.digit),
                    position: format!("{:?}", self.positions.instrument_state(&symbol)),
                    last_prediction: self.positions.last_prediction(&symbol),
                    symbol,
                })
            })
            .collect();

        NowState {
            timestamp: now.to_rfc3339(),
            session_id: self.session_id.to_string(),
            connection: format!("{:?}", self.session.connection),
            trading: self.trading,
            halted: self.halted.as_ref().map(|l| l.to_string()),
            stats: SessionStats {
                trades: stake.total_trades,
                wins: stake.wins,
                losses: stake.losses,
                pnl: stake.cumulative_pnl.to_string(),
                current_stake: stake.current_stake.to_string(),
                consecutive_losses: stake.consecutive_losses,
            },
            instruments,
        }
    }

    async fn write_snapshot(&self, now: DateTime<Utc>) {
        let Some(state_manager) = &self.state_manager else {
            return;
        };
        if let Err(e) = state_manager.write_now(&self.snapshot(now)).await {
            warn!("Failed to write snapshot: {}", e);
        }
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

async fn recv_transport(rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_classify_error() {
        let config = SessionConfig {
            rate_limit_backoff_secs: 7,
            market_closed_backoff_secs: 900,
            ..SessionConfig::default()
        };
        let protocol = |code: &str| SessionError::Protocol(ProtocolError::new(code, "x"));

        assert_eq!(classify_error(&protocol("InvalidToken"), &config), ErrorAction::Fatal);
        assert_eq!(
            classify_error(&protocol("RateLimit"), &config),
            ErrorAction::RetryAfter(Duration::from_secs(7))
        );
        assert_eq!(
            classify_error(&protocol("MarketIsClosed"), &config),
            ErrorAction::RetryAfter(Duration::from_secs(900))
        );
        assert_eq!(
            classify_error(&protocol("ContractBuyValidationError"), &config),
            ErrorAction::Continue
        );
        assert_eq!(
            classify_error(&SessionError::Connection("reset".into()), &config),
            ErrorAction::Continue
        );
        assert_eq!(
            classify_error(&SessionError::FatalDisconnect { attempts: 10 }, &config),
            ErrorAction::Fatal
        );
    }

    #[test]
    fn test_control_handle_sends_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ControlHandle { tx };
        assert!(handle.stop());
        assert!(handle.start());
        assert!(handle.reset_session());
        assert!(handle.shutdown());
        let received: Vec<Command> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![Command::Stop, Command::Start, Command::ResetSession, Command::Shutdown]
        );
    }
}
