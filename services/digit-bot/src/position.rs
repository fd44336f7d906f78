//! Position Manager - per-instrument position lifecycle
//!
//! Each instrument moves through
//! `Idle -> Proposed -> Open -> Settled(Won|Lost) -> Idle` (after cooldown).
//! Only settlements touch the stake policy; a rejected proposal returns the
//! instrument to Idle with the stake state unchanged.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::signal::Signal;
use crate::stake::{GuardContext, GuardVerdict, RiskLimit, StakePolicy, StakePolicyState};

/// Settled result of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Won,
    Lost,
}

impl Outcome {
    pub fn from_profit(profit: Decimal) -> Self {
        if profit > Decimal::ZERO {
            Outcome::Won
        } else {
            Outcome::Lost
        }
    }
}

/// Lifecycle state of an instrument's position slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionState {
    Idle,
    /// Contract requested, not yet confirmed
    Proposed,
    Open,
    Settled(Outcome),
}

impl PositionState {
    /// Proposed and Open block further proposals on the instrument
    pub fn is_active(&self) -> bool {
        matches!(self, PositionState::Proposed | PositionState::Open)
    }
}

/// One contract of a position; grid positions hold several
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionLeg {
    pub contract_id: String,
    pub stake: Decimal,
    pub profit: Option<Decimal>,
    /// Status stream following this contract, released once it settles
    pub subscription_id: Option<String>,
}

impl PositionLeg {
    fn opened(leg: OpenedLeg) -> Self {
        Self {
            contract_id: leg.contract_id,
            stake: leg.stake,
            profit: None,
            subscription_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: String,
    pub predicted_outcome: u8,
    /// Total stake across legs
    pub stake: Decimal,
    pub state: PositionState,
    pub opened_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub legs: Vec<PositionLeg>,
}

impl Position {
    pub fn contract_ids(&self) -> impl Iterator<Item = &str> {
        self.legs.iter().map(|l| l.contract_id.as_str())
    }

    fn unsettled_legs(&self) -> usize {
        self.legs.iter().filter(|l| l.profit.is_none()).count()
    }

    fn realized_profit(&self) -> Decimal {
        self.legs.iter().filter_map(|l| l.profit).sum()
    }
}

/// A proposal accepted by the guards; the caller executes it
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedPosition {
    pub position_id: Uuid,
    pub instrument: String,
    pub predicted_outcome: u8,
    /// One entry per leg
    pub stakes: Vec<Decimal>,
}

/// Contract confirmed by the service for one leg
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedLeg {
    pub contract_id: String,
    pub stake: Decimal,
}

/// Why a proposal was refused
#[derive(Debug, Clone, PartialEq)]
pub enum ProposeRejection {
    /// Instrument already has a non-terminal position
    Busy(PositionState),
    RiskLimitExceeded(RiskLimit),
}

impl std::fmt::Display for ProposeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposeRejection::Busy(state) => write!(f, "instrument busy ({:?})", state),
            ProposeRejection::RiskLimitExceeded(limit) => write!(f, "risk limit: {}", limit),
        }
    }
}

/// A fully settled position with the stake state after it
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub position_id: Uuid,
    pub instrument: String,
    pub predicted_outcome: u8,
    pub stake: Decimal,
    pub profit: Decimal,
    pub outcome: Outcome,
    pub policy: StakePolicyState,
}

/// Result of recording one leg's settlement
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementUpdate {
    /// Other legs are still open
    Pending { remaining: usize },
    Settled(Settlement),
    /// Leg was already settled
    Duplicate,
    /// No known position holds this contract
    Unknown,
}

#[derive(Debug, Default)]
struct Slot {
    position: Option<Position>,
    last_settlement: Option<DateTime<Utc>>,
    last_prediction: Option<u8>,
}

impl Slot {
    fn state(&self) -> PositionState {
        self.position
            .as_ref()
            .map(|p| p.state)
            .unwrap_or(PositionState::Idle)
    }
}

/// Position registry plus the session's stake state
pub struct PositionManager {
    policy: StakePolicy,
    state: StakePolicyState,
    slots: HashMap<String, Slot>,
}

impl PositionManager {
    pub fn new(policy: StakePolicy) -> Self {
        let state = policy.initial_state();
        Self {
            policy,
            state,
            slots: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &StakePolicy {
        &self.policy
    }

    pub fn policy_state(&self) -> &StakePolicyState {
        &self.state
    }

    pub fn instrument_state(&self, instrument: &str) -> PositionState {
        self.slots
            .get(instrument)
            .map(Slot::state)
            .unwrap_or(PositionState::Idle)
    }

    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.slots.get(instrument).and_then(|s| s.position.as_ref())
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.slots.values().filter_map(|s| s.position.as_ref())
    }

    /// Number of Proposed or Open positions across instruments
    pub fn open_positions(&self) -> usize {
        self.slots.values().filter(|s| s.state().is_active()).count()
    }

    /// Last prediction that resulted in an opened position
    pub fn last_prediction(&self, instrument: &str) -> Option<u8> {
        self.slots.get(instrument).and_then(|s| s.last_prediction)
    }

    /// Guard verdict for a new position on `instrument` at `now`
    pub fn check_guards(&self, instrument: &str, now: DateTime<Utc>) -> GuardVerdict {
        let ctx = GuardContext {
            open_positions: self.open_positions(),
            since_last_settlement: self
                .slots
                .get(instrument)
                .and_then(|s| s.last_settlement)
                .map(|at| now - at),
        };
        self.policy.check_guards(&self.state, &ctx)
    }

    /// Move an instrument to Proposed if it is free and every guard passes
    pub fn try_propose(
        &mut self,
        instrument: &str,
        signal: &Signal,
        now: DateTime<Utc>,
    ) -> Result<ProposedPosition, ProposeRejection> {
        let current = self.instrument_state(instrument);
        if current.is_active() {
            return Err(ProposeRejection::Busy(current));
        }
        if let GuardVerdict::RiskLimitExceeded(limit) = self.check_guards(instrument, now) {
            return Err(ProposeRejection::RiskLimitExceeded(limit));
        }

        let stakes = self.policy.entry_stakes(&self.state);
        let position = Position {
            id: Uuid::new_v4(),
            instrument: instrument.to_string(),
            predicted_outcome: signal.predicted_outcome,
            stake: stakes.iter().copied().sum(),
            state: PositionState::Proposed,
            opened_at: now,
            settled_at: None,
            legs: Vec::new(),
        };
        let proposed = ProposedPosition {
            position_id: position.id,
            instrument: instrument.to_string(),
            predicted_outcome: signal.predicted_outcome,
            stakes,
        };

        debug!(
            "Proposed position {} on {}: digit {} stake {}",
            position.id, instrument, position.predicted_outcome, position.stake
        );
        self.slots.entry(instrument.to_string()).or_default().position = Some(position);
        Ok(proposed)
    }

    /// Confirm a Proposed position with the contracts the service accepted
    ///
    /// An empty leg list counts as a rejection. Returns false when the
    /// position is no longer Proposed; see `adopt` for that case.
    pub fn mark_open(&mut self, position_id: Uuid, legs: Vec<OpenedLeg>) -> bool {
        if legs.is_empty() {
            return self.reject_proposal(position_id);
        }
        let Some(slot) = self.slot_for_position(position_id) else {
            debug!("mark_open for unknown position {}", position_id);
            return false;
        };
        let Some(position) = slot.position.as_mut() else {
            return false;
        };
        if position.state != PositionState::Proposed {
            debug!(
                "Position {} cannot open from {:?}",
                position_id, position.state
            );
            return false;
        }

        position.legs = legs.into_iter().map(PositionLeg::opened).collect();
        position.stake = position.legs.iter().map(|l| l.stake).sum();
        position.state = PositionState::Open;
        slot.last_prediction = Some(position.predicted_outcome);

        info!(
            "Opened position {} on {}: {} leg(s), stake {}",
            position.id,
            position.instrument,
            position.legs.len(),
            position.stake
        );
        true
    }

    /// Track contracts the service opened without a matching confirmation
    ///
    /// Happens when a proposal was reconciled away before its execution
    /// report arrived, or when the open-contract list shows a contract for a
    /// Proposed instrument. Contracts already tracked are skipped. The rest
    /// join the instrument's active position (which becomes Open), or a new
    /// Open position when the instrument is free. Returns the ids of the
    /// contracts now tracked for the first time.
    pub fn adopt(
        &mut self,
        instrument: &str,
        predicted_outcome: u8,
        legs: Vec<OpenedLeg>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let legs: Vec<OpenedLeg> = legs
            .into_iter()
            .filter(|leg| !self.is_tracked(&leg.contract_id))
            .collect();
        if legs.is_empty() {
            return Vec::new();
        }
        let adopted: Vec<String> = legs.iter().map(|l| l.contract_id.clone()).collect();

        let slot = self.slots.entry(instrument.to_string()).or_default();
        match slot.position.as_mut().filter(|p| p.state.is_active()) {
            Some(position) => {
                position.legs.extend(legs.into_iter().map(PositionLeg::opened));
                position.stake = position.legs.iter().map(|l| l.stake).sum();
                position.state = PositionState::Open;
                slot.last_prediction = Some(position.predicted_outcome);
                warn!(
                    "Adopted {} contract(s) into position {} on {}",
                    adopted.len(),
                    position.id,
                    instrument
                );
            }
            None => {
                let legs: Vec<PositionLeg> = legs.into_iter().map(PositionLeg::opened).collect();
                let position = Position {
                    id: Uuid::new_v4(),
                    instrument: instrument.to_string(),
                    predicted_outcome,
                    stake: legs.iter().map(|l| l.stake).sum(),
                    state: PositionState::Open,
                    opened_at: now,
                    settled_at: None,
                    legs,
                };
                warn!(
                    "Adopted {} contract(s) as position {} on {}",
                    adopted.len(),
                    position.id,
                    instrument
                );
                slot.position = Some(position);
                slot.last_prediction = Some(predicted_outcome);
            }
        }
        adopted
    }

    /// Drop a Proposed position without touching the stake state
    pub fn reject_proposal(&mut self, position_id: Uuid) -> bool {
        let Some(slot) = self.slot_for_position(position_id) else {
            return false;
        };
        match slot.position.as_ref().map(|p| p.state) {
            Some(PositionState::Proposed) => {
                slot.position = None;
                debug!("Proposal {} rejected, instrument back to idle", position_id);
                true
            }
            _ => false,
        }
    }

    /// Record the final profit of one contract
    pub fn record_settlement(
        &mut self,
        contract_id: &str,
        profit: Decimal,
        now: DateTime<Utc>,
    ) -> SettlementUpdate {
        let Some(slot) = self.slots.values_mut().find(|s| {
            s.position
                .as_ref()
                .map(|p| p.contract_ids().any(|id| id == contract_id))
                .unwrap_or(false)
        }) else {
            return SettlementUpdate::Unknown;
        };
        let Some(position) = slot.position.as_mut() else {
            return SettlementUpdate::Unknown;
        };
        if position.state != PositionState::Open {
            return SettlementUpdate::Duplicate;
        }
        let Some(leg) = position.legs.iter_mut().find(|l| l.contract_id == contract_id) else {
            return SettlementUpdate::Unknown;
        };
        if leg.profit.is_some() {
            return SettlementUpdate::Duplicate;
        }
        leg.profit = Some(profit);

        let remaining = position.unsettled_legs();
        if remaining > 0 {
            return SettlementUpdate::Pending { remaining };
        }

        let total = position.realized_profit();
        let outcome = Outcome::from_profit(total);
        position.state = PositionState::Settled(outcome);
        position.settled_at = Some(now);
        slot.last_settlement = Some(now);

        let settlement = Settlement {
            position_id: position.id,
            instrument: position.instrument.clone(),
            predicted_outcome: position.predicted_outcome,
            stake: position.stake,
            profit: total,
            outcome,
            policy: self.policy.apply(&self.state, total),
        };
        self.state = settlement.policy.clone();

        info!(
            "Settled {} on {}: {:?} {} (stake {}, next stake {}, losses {})",
            settlement.position_id,
            settlement.instrument,
            outcome,
            total,
            settlement.stake,
            self.state.current_stake,
            self.state.consecutive_losses
        );
        SettlementUpdate::Settled(settlement)
    }

    /// Return settled instruments to Idle once their cooldown elapsed
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cooldown = self.policy.config().cooldown();
        let mut released = Vec::new();
        for (instrument, slot) in self.slots.iter_mut() {
            let settled = matches!(slot.state(), PositionState::Settled(_));
            let cooled = slot
                .last_settlement
                .map(|at| now - at >= cooldown)
                .unwrap_or(true);
            if settled && cooled {
                slot.position = None;
                released.push(instrument.clone());
            }
        }
        released
    }

    /// Forget a position the service has no record of
    ///
    /// Only Proposed positions can be abandoned; an Open one always has a
    /// contract that must be queried.
    pub fn abandon(&mut self, position_id: Uuid) -> bool {
        self.reject_proposal(position_id)
    }

    /// Remember the status stream following `contract_id`
    ///
    /// Returns false when no unsettled leg holds the contract, in which case
    /// the stream has nothing left to report.
    pub fn attach_subscription(&mut self, contract_id: &str, subscription_id: String) -> bool {
        match self.leg_mut(contract_id) {
            Some(leg) if leg.profit.is_none() => {
                leg.subscription_id = Some(subscription_id);
                true
            }
            _ => false,
        }
    }

    /// Take the status stream of a leg, leaving none behind
    pub fn take_subscription(&mut self, contract_id: &str) -> Option<String> {
        self.leg_mut(contract_id)?.subscription_id.take()
    }

    /// Forget every stream id; the transport drops them on disconnect
    pub fn clear_subscriptions(&mut self) {
        for position in self.slots.values_mut().filter_map(|s| s.position.as_mut()) {
            for leg in position.legs.iter_mut() {
                leg.subscription_id = None;
            }
        }
    }

    /// Explicit session reset: fresh stake state, predictions forgotten
    ///
    /// Active positions are kept so their settlements are still observed.
    pub fn reset_session(&mut self) {
        self.state = self.policy.initial_state();
        for slot in self.slots.values_mut() {
            slot.last_prediction = None;
            slot.last_settlement = None;
            if matches!(slot.state(), PositionState::Settled(_)) {
                slot.position = None;
            }
        }
        info!("Session reset, stake back to {}", self.state.current_stake);
    }

    fn is_tracked(&self, contract_id: &str) -> bool {
        self.positions()
            .any(|p| p.contract_ids().any(|id| id == contract_id))
    }

    fn leg_mut(&mut self, contract_id: &str) -> Option<&mut PositionLeg> {
        self.slots
            .values_mut()
            .filter_map(|s| s.position.as_mut())
            .flat_map(|p| p.legs.iter_mut())
            .find(|l| l.contract_id == contract_id)
    }

    fn slot_for_position(&mut self, position_id: Uuid) -> Option<&mut Slot> {
        self.slots.values_mut().find(|s| {
            s.position
                .as_ref()
                .map(|p| p.id == position_id)
                .unwrap_or(false)
        })
    }
}
