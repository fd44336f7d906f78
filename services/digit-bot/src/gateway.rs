//! Contract gateway - the seam between the orchestrator and the service
//!
//! `ContractGateway` exposes the handful of operations the bot needs in
//! domain terms. `WsGateway` implements them over `SessionTransport`; tests
//! substitute a scripted gateway.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ContractKind, InstrumentConfig};
use crate::error::{Result, SessionError};
use crate::protocol::{
    self, ContractUpdate, OpenContract, Proposal, ProposalRequest, Purchase, Request, Sale, Tick,
    TickHistory,
};
use crate::transport::SessionTransport;
use crate::types::Observation;

/// Data pushed by the service while subscribed
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Observation(Observation),
    Contract(ContractUpdate),
    /// Status stream for `contract_id` is live under `subscription_id`
    ContractWatched {
        contract_id: String,
        subscription_id: String,
    },
}

pub type MarketSender = mpsc::UnboundedSender<MarketEvent>;

/// One contract to buy
#[derive(Debug, Clone, PartialEq)]
pub struct ContractOrder {
    pub instrument: String,
    pub kind: ContractKind,
    pub barrier: u8,
    pub stake: Decimal,
    pub currency: String,
    pub duration_ticks: u32,
}

/// Contract accepted by the service
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedContract {
    pub contract_id: String,
    pub buy_price: Decimal,
    pub payout: Decimal,
}

/// Operations the orchestrator performs against the contract service
#[async_trait]
pub trait ContractGateway: Send + Sync {
    /// Most recent `count` observations, oldest first
    async fn history(&self, instrument: &InstrumentConfig, count: usize) -> Result<Vec<Observation>>;

    /// Stream observations into `sink`; returns the subscription id
    async fn watch_ticks(&self, instrument: &InstrumentConfig, sink: MarketSender) -> Result<Option<String>>;

    /// Price and buy one contract
    async fn open_contract(&self, order: &ContractOrder) -> Result<OpenedContract>;

    /// Stream status updates of an open contract into `sink`
    async fn watch_contract(&self, contract_id: &str, sink: MarketSender) -> Result<Option<String>>;

    /// One-shot status query
    async fn contract_status(&self, contract_id: &str) -> Result<ContractUpdate>;

    /// Contracts the service still considers open
    async fn open_contracts(&self) -> Result<Vec<OpenContract>>;

    /// Sell an open contract at market; returns the amount received
    async fn close_contract(&self, contract_id: &str) -> Result<Decimal>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;
}

/// Gateway over the live WebSocket session
#[derive(Clone)]
pub struct WsGateway {
    transport: SessionTransport,
}

impl WsGateway {
    pub fn new(transport: SessionTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }
}

fn epoch_to_utc(epoch: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch, 0).single()
}

#[async_trait]
impl ContractGateway for WsGateway {
    async fn history(&self, instrument: &InstrumentConfig, count: usize) -> Result<Vec<Observation>> {
        let response = self
            .transport
            .call(Request::TicksHistory {
                symbol: instrument.symbol.clone(),
                count,
            })
            .await?;
        let history = TickHistory::parse(&response)?;

        let observations: Vec<Observation> = history
            .prices
            .into_iter()
            .zip(history.times)
            .filter_map(|(price, epoch)| {
                epoch_to_utc(epoch).map(|ts| {
                    Observation::from_quote(&instrument.symbol, price, instrument.decimals, ts)
                })
            })
            .collect();
        debug!(
            "Fetched {} historical ticks for {}",
            observations.len(),
            instrument.symbol
        );
        Ok(observations)
    }

    async fn watch_ticks(&self, instrument: &InstrumentConfig, sink: MarketSender) -> Result<Option<String>> {
        let symbol = instrument.symbol.clone();
        let decimals = instrument.decimals;
        let handler = Arc::new(move |msg: Value| {
            let tick = match Tick::parse(&msg) {
                Ok(tick) => tick,
                Err(e) => {
                    warn!("Dropping tick for {}: {}", symbol, e);
                    return;
                }
            };
            let Some(ts) = epoch_to_utc(tick.epoch) else {
                warn!("Dropping tick for {} with bad epoch {}", symbol, tick.epoch);
                return;
            };
            let observation = Observation::from_quote(&symbol, tick.quote, decimals, ts);
            let _ = sink.send(MarketEvent::Observation(observation));
        });

        self.transport
            .subscribe(
                Request::Ticks {
                    symbol: instrument.symbol.clone(),
                },
                handler,
            )
            .await
    }

    async fn open_contract(&self, order: &ContractOrder) -> Result<OpenedContract> {
        let response = self
            .transport
            .call(Request::Proposal(ProposalRequest {
                symbol: order.instrument.clone(),
                contract_type: order.kind.contract_type(),
                barrier: order.barrier,
                amount: order.stake,
                currency: order.currency.clone(),
                duration_ticks: order.duration_ticks,
            }))
            .await?;
        let proposal = Proposal::parse(&response)?;
        debug!(
            "Proposal {} for {}: ask {} payout {}",
            proposal.id, order.instrument, proposal.ask_price, proposal.payout
        );

        let response = self
            .transport
            .call(Request::Buy {
                proposal_id: proposal.id,
                price: proposal.ask_price,
            })
            .await?;
        let purchase = Purchase::parse(&response)?;

        Ok(OpenedContract {
            contract_id: purchase.contract_id,
            buy_price: purchase.buy_price,
            payout: purchase.payout,
        })
    }

    async fn watch_contract(&self, contract_id: &str, sink: MarketSender) -> Result<Option<String>> {
        let id = contract_id.to_string();
        let handler = Arc::new(move |msg: Value| match ContractUpdate::parse(&msg) {
            Ok(Some(update)) => {
                let _ = sink.send(MarketEvent::Contract(update));
            }
            Ok(None) => debug!("Contract stream {} ended", id),
            Err(e) => warn!("Dropping update for contract {}: {}", id, e),
        });

        self.transport
            .subscribe(
                Request::OpenContract {
                    contract_id: contract_id.to_string(),
                    subscribe: true,
                },
                handler,
            )
            .await
    }

    async fn contract_status(&self, contract_id: &str) -> Result<ContractUpdate> {
        let response = self
            .transport
            .call(Request::OpenContract {
                contract_id: contract_id.to_string(),
                subscribe: false,
            })
            .await?;
        ContractUpdate::parse(&response)?.ok_or_else(|| {
            SessionError::Malformed(format!("empty status for contract {}", contract_id))
        })
    }

    async fn open_contracts(&self) -> Result<Vec<OpenContract>> {
        let response = self.transport.call(Request::Portfolio).await?;
        protocol::parse_portfolio(&response)
    }

    async fn close_contract(&self, contract_id: &str) -> Result<Decimal> {
        let response = self
            .transport
            .call(Request::Sell {
                contract_id: contract_id.to_string(),
                price: Decimal::ZERO,
            })
            .await?;
        let sale = Sale::parse(&response)?;
        debug!("Sold contract {} for {}", sale.contract_id, sale.sold_for);
        Ok(sale.sold_for)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.transport.unsubscribe(subscription_id).await
    }
}
