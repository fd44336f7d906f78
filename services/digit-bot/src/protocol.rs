//! Wire protocol - JSON messages exchanged with the contract service
//!
//! Every outbound call carries a numeric `req_id` that the service echoes.
//! Streamed pushes carry `subscription.id`; failures arrive as
//! `{ "error": { "code", "message" } }` alongside the echoed `req_id`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::error::{ProtocolError, SessionError};

/// Outbound requests
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authorize { token: String },
    TicksHistory { symbol: String, count: usize },
    /// Tick stream subscription
    Ticks { symbol: String },
    Proposal(ProposalRequest),
    Buy { proposal_id: String, price: Decimal },
    /// Contract status, streamed when `subscribe` is set
    OpenContract { contract_id: String, subscribe: bool },
    /// Early close; a zero price sells at market
    Sell { contract_id: String, price: Decimal },
    Forget { subscription_id: String },
    Portfolio,
    Ping,
}

/// Price request for one digit contract
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
    pub symbol: String,
    pub contract_type: &'static str,
    pub barrier: u8,
    pub amount: Decimal,
    pub currency: String,
    pub duration_ticks: u32,
}

impl Request {
    /// Short name used in logs and timeout errors
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Authorize { .. } => "authorize",
            Request::TicksHistory { .. } => "ticks_history",
            Request::Ticks { .. } => "ticks",
            Request::Proposal(_) => "proposal",
            Request::Buy { .. } => "buy",
            Request::OpenContract { .. } => "proposal_open_contract",
            Request::Sell { .. } => "sell",
            Request::Forget { .. } => "forget",
            Request::Portfolio => "portfolio",
            Request::Ping => "ping",
        }
    }

    pub fn is_subscription(&self) -> bool {
        match self {
            Request::Ticks { .. } => true,
            Request::OpenContract { subscribe, .. } => *subscribe,
            _ => false,
        }
    }

    /// JSON payload with the correlation id attached
    pub fn to_payload(&self, req_id: u64) -> Value {
        let mut payload = match self {
            Request::Authorize { token } => json!({ "authorize": token }),
            Request::TicksHistory { symbol, count } => json!({
                "ticks_history": symbol,
                "count": count,
                "end": "latest",
                "style": "ticks",
            }),
            Request::Ticks { symbol } => json!({ "ticks": symbol, "subscribe": 1 }),
            Request::Proposal(p) => json!({
                "proposal": 1,
                "amount": amount(p.amount),
                "basis": "stake",
                "contract_type": p.contract_type,
                "currency": p.currency,
                "duration": p.duration_ticks,
                "duration_unit": "t",
                "symbol": p.symbol,
                "barrier": p.barrier.to_string(),
            }),
            Request::Buy { proposal_id, price } => json!({
                "buy": proposal_id,
                "price": amount(*price),
            }),
            Request::OpenContract {
                contract_id,
                subscribe,
            } => {
                let mut v = json!({
                    "proposal_open_contract": 1,
                    "contract_id": contract_id_value(contract_id),
                });
                if *subscribe {
                    v["subscribe"] = json!(1);
                }
                v
            }
            Request::Sell { contract_id, price } => json!({
                "sell": contract_id_value(contract_id),
                "price": amount(*price),
            }),
            Request::Forget { subscription_id } => json!({ "forget": subscription_id }),
            Request::Portfolio => json!({ "portfolio": 1 }),
            Request::Ping => json!({ "ping": 1 }),
        };
        payload["req_id"] = json!(req_id);
        payload
    }
}

fn amount(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Numeric ids go out as numbers, anything else as a string
fn contract_id_value(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(n) => json!(n),
        Err(_) => json!(id),
    }
}

pub fn req_id(msg: &Value) -> Option<u64> {
    msg.get("req_id").and_then(Value::as_u64)
}

pub fn msg_type(msg: &Value) -> Option<&str> {
    msg.get("msg_type").and_then(Value::as_str)
}

pub fn subscription_id(msg: &Value) -> Option<String> {
    msg.get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(id_string)
}

/// Error envelope, if present
pub fn error(msg: &Value) -> Option<ProtocolError> {
    let err = msg.get("error")?;
    Some(ProtocolError::new(
        err.get("code").and_then(Value::as_str).unwrap_or("UnknownError"),
        err.get("message").and_then(Value::as_str).unwrap_or(""),
    ))
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    id_string(&v).ok_or_else(|| serde::de::Error::custom(format!("invalid id {}", v)))
}

fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

/// Deserialize the body stored under `field`
fn body<T: for<'de> Deserialize<'de>>(msg: &Value, field: &str) -> Result<T, SessionError> {
    let value = msg
        .get(field)
        .ok_or_else(|| SessionError::Malformed(format!("missing '{}'", field)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| SessionError::Malformed(format!("{}: {}", field, e)))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Authorization {
    pub loginid: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub currency: String,
}

impl Authorization {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        body(msg, "authorize")
    }
}

/// One streamed quote
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: Decimal,
    pub epoch: i64,
    #[serde(default)]
    pub pip_size: Option<u32>,
}

impl Tick {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        body(msg, "tick")
    }
}

/// Historical quotes, oldest first
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickHistory {
    pub prices: Vec<Decimal>,
    pub times: Vec<i64>,
}

impl TickHistory {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        let history: TickHistory = body(msg, "history")?;
        if history.prices.len() != history.times.len() {
            return Err(SessionError::Malformed(format!(
                "history has {} prices but {} times",
                history.prices.len(),
                history.times.len()
            )));
        }
        Ok(history)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Proposal {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub ask_price: Decimal,
    #[serde(default)]
    pub payout: Decimal,
}

impl Proposal {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        body(msg, "proposal")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Purchase {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    pub buy_price: Decimal,
    #[serde(default)]
    pub payout: Decimal,
}

impl Purchase {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        body(msg, "buy")
    }
}

/// Early close of an open contract
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sale {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    pub sold_for: Decimal,
}

impl Sale {
    pub fn parse(msg: &Value) -> Result<Self, SessionError> {
        body(msg, "sell")
    }
}

/// Contract status, pushed while subscribed or returned by a one-shot query
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContractUpdate {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    #[serde(default, rename = "underlying")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_sold: bool,
    #[serde(default)]
    pub status: Option<String>,
}

impl ContractUpdate {
    /// None for the empty body sent when a contract stream ends
    pub fn parse(msg: &Value) -> Result<Option<Self>, SessionError> {
        match msg.get("proposal_open_contract") {
            Some(Value::Object(map)) if map.is_empty() => Ok(None),
            Some(_) => body(msg, "proposal_open_contract").map(Some),
            None => Err(SessionError::Malformed("missing 'proposal_open_contract'".into())),
        }
    }

    /// Final profit once the contract has settled
    pub fn settled_profit(&self) -> Option<Decimal> {
        if self.is_sold {
            self.profit
        } else {
            None
        }
    }
}

/// Entry of the open-contract list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenContract {
    #[serde(deserialize_with = "de_id")]
    pub contract_id: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub buy_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct Portfolio {
    #[serde(default)]
    contracts: Vec<OpenContract>,
}

pub fn parse_portfolio(msg: &Value) -> Result<Vec<OpenContract>, SessionError> {
    body::<Portfolio>(msg, "portfolio").map(|p| p.contracts)
}
