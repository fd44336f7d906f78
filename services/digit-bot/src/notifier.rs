//! Outbound notifications (settlements, halts, periodic summaries)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::position::{Outcome, Settlement};
use crate::stake::StakePolicyState;

/// Session totals sent periodically and at exit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub at: DateTime<Utc>,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub cumulative_pnl: Decimal,
    pub current_stake: Decimal,
    pub consecutive_losses: u32,
    pub open_positions: usize,
    pub halted: Option<String>,
}

impl SessionSummary {
    pub fn from_state(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        at: DateTime<Utc>,
        state: &StakePolicyState,
        open_positions: usize,
        halted: Option<String>,
    ) -> Self {
        Self {
            session_id,
            started_at,
            at,
            total_trades: state.total_trades,
            wins: state.wins,
            losses: state.losses,
            win_rate: state.win_rate(),
            cumulative_pnl: state.cumulative_pnl,
            current_stake: state.current_stake,
            consecutive_losses: state.consecutive_losses,
            open_positions,
            halted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Started { instruments: Vec<String> },
    Settlement(Settlement),
    Halted { reason: String },
    Summary(SessionSummary),
    Fatal { reason: String, summary: SessionSummary },
}

impl Notification {
    pub fn render(&self) -> String {
        match self {
            Notification::Started { instruments } => {
                format!("digit-bot started on {}", instruments.join(", "))
            }
            Notification::Settlement(s) => {
                let verdict = match s.outcome {
                    Outcome::Won => "WON",
                    Outcome::Lost => "LOST",
                };
                format!(
                    "{} {} digit {}: stake {} profit {} | session P&L {} | next stake {}",
                    verdict,
                    s.instrument,
                    s.predicted_outcome,
                    s.stake,
                    s.profit,
                    s.policy.cumulative_pnl,
                    s.policy.current_stake
                )
            }
            Notification::Halted { reason } => format!("Trading halted: {}", reason),
            Notification::Summary(summary) => render_summary("Session summary", summary),
            Notification::Fatal { reason, summary } => {
                render_summary(&format!("Session stopped: {}", reason), summary)
            }
        }
    }
}

fn render_summary(title: &str, s: &SessionSummary) -> String {
    let mut text = format!(
        "{}\ntrades {} (won {}, lost {}, win rate {:.1}%)\nP&L {} | stake {} | losing streak {} | open {}",
        title,
        s.total_trades,
        s.wins,
        s.losses,
        s.win_rate * 100.0,
        s.cumulative_pnl,
        s.current_stake,
        s.consecutive_losses,
        s.open_positions
    );
    if let Some(reason) = &s.halted {
        text.push_str(&format!("\nhalted: {}", reason));
    }
    text
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        info!("{}", notification.render());
        Ok(())
    }
}

/// Posts `{ "text": ... }` to a chat webhook
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let payload = serde_json::json!({ "text": notification.render() });
        let response = self.client.post(&self.url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Webhook failed: {} - {}", status, body));
        }

        debug!("Notification delivered");
        Ok(())
    }
}
