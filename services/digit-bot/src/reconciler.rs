//! Position reconciliation - compare tracked positions with the service
//!
//! Run after a reconnect. Nothing is assumed won or lost: contracts the
//! service no longer lists as open are queried individually. A proposal is
//! matched with untracked open contracts on its instrument, and abandoned
//! only when there are none.

use std::collections::HashSet;

use tracing::{info, warn};
use uuid::Uuid;

use crate::position::{OpenedLeg, Position, PositionState};
use crate::protocol::OpenContract;

/// Outcome of comparing local positions with the open-contract list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Tracked contracts still open on the service
    pub confirmed: Vec<ContractRef>,
    /// Tracked contracts missing from the open list; status must be queried
    pub missing: Vec<ContractRef>,
    /// Proposed positions whose contracts were bought but never confirmed
    pub adopted: Vec<Adoption>,
    /// Proposed positions with no contract to follow
    pub abandoned: Vec<Uuid>,
    /// Open contracts the bot does not track
    pub untracked: Vec<OpenContract>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractRef {
    pub position_id: Uuid,
    pub instrument: String,
    pub contract_id: String,
}

/// Untracked contracts claimed by a Proposed position on the same instrument
#[derive(Debug, Clone, PartialEq)]
pub struct Adoption {
    pub position_id: Uuid,
    pub instrument: String,
    pub predicted_outcome: u8,
    pub legs: Vec<OpenedLeg>,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.adopted.is_empty()
            && self.abandoned.is_empty()
            && self.untracked.is_empty()
    }
}

/// Compare positions against the service's open contracts
pub fn reconcile<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    open_contracts: &[OpenContract],
) -> ReconciliationResult {
    let remote: HashSet<&str> = open_contracts
        .iter()
        .map(|c| c.contract_id.as_str())
        .collect();
    let mut tracked = HashSet::new();
    let mut result = ReconciliationResult {
        timestamp: chrono::Utc::now(),
        ..Default::default()
    };

    let mut proposed = Vec::new();
    for position in positions {
        match position.state {
            PositionState::Proposed => proposed.push(position),
            PositionState::Open => {
                for leg in position.legs.iter().filter(|l| l.profit.is_none()) {
                    tracked.insert(leg.contract_id.as_str());
                    let contract = ContractRef {
                        position_id: position.id,
                        instrument: position.instrument.clone(),
                        contract_id: leg.contract_id.clone(),
                    };
                    if remote.contains(leg.contract_id.as_str()) {
                        result.confirmed.push(contract);
                    } else {
                        result.missing.push(contract);
                    }
                }
            }
            PositionState::Idle | PositionState::Settled(_) => {}
        }
    }

    let mut untracked: Vec<OpenContract> = open_contracts
        .iter()
        .filter(|c| !tracked.contains(c.contract_id.as_str()))
        .cloned()
        .collect();

    for position in proposed {
        let (claimed, rest): (Vec<OpenContract>, Vec<OpenContract>) = untracked
            .into_iter()
            .partition(|c| c.symbol.as_deref() == Some(position.instrument.as_str()));
        untracked = rest;
        if claimed.is_empty() {
            result.abandoned.push(position.id);
            continue;
        }
        result.adopted.push(Adoption {
            position_id: position.id,
            instrument: position.instrument.clone(),
            predicted_outcome: position.predicted_outcome,
            legs: claimed
                .into_iter()
                .map(|c| OpenedLeg {
                    stake: c.buy_price.unwrap_or(position.stake),
                    contract_id: c.contract_id,
                })
                .collect(),
        });
    }
    result.untracked = untracked;

    info!(
        "Reconciliation complete: {} confirmed, {} missing, {} adopted, {} abandoned, {} untracked",
        result.confirmed.len(),
        result.missing.len(),
        result.adopted.len(),
        result.abandoned.len(),
        result.untracked.len()
    );
    for contract in &result.untracked {
        warn!(
            "Untracked open contract {} on {}",
            contract.contract_id,
            contract.symbol.as_deref().unwrap_or("?")
        );
    }

    result
}
