//! Stake Policy - stake progression and risk guards
//!
//! `StakePolicy::apply` is a pure transition from one `StakePolicyState` to the
//! next given a settled profit; `check_guards` decides whether a new position
//! may be opened. Neither touches the network or the clock.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::amount::bounded_stake;
use crate::config::{StakeConfig, StakingMode};

/// Stake progression state for one trading session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StakePolicyState {
    pub current_stake: Decimal,
    pub consecutive_losses: u32,
    pub cumulative_pnl: Decimal,
    pub daily_loss_limit: Decimal,
    pub max_consecutive_losses: u32,
    pub take_profit: Decimal,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_wins: u32,
    pub best_win_streak: u32,
    pub worst_loss_streak: u32,
}

impl StakePolicyState {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.total_trades as f64
    }
}

/// Why a new position is not allowed
#[derive(Debug, Clone, PartialEq)]
pub enum RiskLimit {
    ConsecutiveLosses { count: u32, max: u32 },
    DailyLossLimit { pnl: Decimal, limit: Decimal },
    /// Success stop
    TakeProfitReached { pnl: Decimal, target: Decimal },
    ConcurrencyCeiling { open: usize, max: usize },
    Cooldown { remaining: Duration },
}

impl RiskLimit {
    /// Limits that stop trading until the session is reset
    pub fn halts_session(&self) -> bool {
        matches!(
            self,
            RiskLimit::ConsecutiveLosses { .. }
                | RiskLimit::DailyLossLimit { .. }
                | RiskLimit::TakeProfitReached { .. }
        )
    }
}

impl std::fmt::Display for RiskLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLimit::ConsecutiveLosses { count, max } => {
                write!(f, "{} consecutive losses (max {})", count, max)
            }
            RiskLimit::DailyLossLimit { pnl, limit } => {
                write!(f, "session P&L {} reached loss limit -{}", pnl, limit)
            }
            RiskLimit::TakeProfitReached { pnl, target } => {
                write!(f, "session P&L {} reached take-profit {}", pnl, target)
            }
            RiskLimit::ConcurrencyCeiling { open, max } => {
                write!(f, "{} open positions (max {})", open, max)
            }
            RiskLimit::Cooldown { remaining } => {
                write!(f, "cooling down for {}ms", remaining.num_milliseconds())
            }
        }
    }
}

/// Guard evaluation result
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Allowed,
    RiskLimitExceeded(RiskLimit),
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allowed)
    }
}

/// Inputs to the guards that live outside the stake state
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardContext {
    pub open_positions: usize,
    /// Time since this instrument last settled, None if never
    pub since_last_settlement: Option<Duration>,
}

/// Stake policy configured once per session
#[derive(Debug, Clone)]
pub struct StakePolicy {
    config: StakeConfig,
}

impl StakePolicy {
    pub fn new(config: StakeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StakeConfig {
        &self.config
    }

    /// Fresh state at session start or after an explicit reset
    pub fn initial_state(&self) -> StakePolicyState {
        StakePolicyState {
            current_stake: self.bounded(self.config.initial_stake),
            consecutive_losses: 0,
            cumulative_pnl: Decimal::ZERO,
            daily_loss_limit: self.config.daily_loss_limit,
            max_consecutive_losses: self.config.max_consecutive_losses,
            take_profit: self.config.take_profit,
            total_trades: 0,
            wins: 0,
            losses: 0,
            consecutive_wins: 0,
            best_win_streak: 0,
            worst_loss_streak: 0,
        }
    }

    /// Transition on a settled position; profit <= 0 counts as a loss
    pub fn apply(&self, state: &StakePolicyState, profit: Decimal) -> StakePolicyState {
        let mut next = state.clone();
        next.cumulative_pnl += profit;
        next.total_trades += 1;

        if profit > Decimal::ZERO {
            next.wins += 1;
            next.consecutive_losses = 0;
            next.consecutive_wins += 1;
            next.best_win_streak = next.best_win_streak.max(next.consecutive_wins);
            next.current_stake = self.bounded(self.config.initial_stake);
        } else {
            next.losses += 1;
            next.consecutive_wins = 0;
            next.consecutive_losses += 1;
            next.worst_loss_streak = next.worst_loss_streak.max(next.consecutive_losses);
            next.current_stake = match self.config.mode {
                StakingMode::Martingale => self.martingale_stake(next.consecutive_losses),
                StakingMode::Grid => self.bounded(self.config.initial_stake),
            };
        }

        next
    }

    /// Stakes for each entry of a new position
    ///
    /// Martingale opens one entry at the current stake; grid opens
    /// `grid_layers` entries at `current * factor^i`.
    pub fn entry_stakes(&self, state: &StakePolicyState) -> Vec<Decimal> {
        match self.config.mode {
            StakingMode::Martingale => vec![state.current_stake],
            StakingMode::Grid => {
                let mut stakes = Vec::with_capacity(self.config.grid_layers as usize);
                let mut raw = state.current_stake;
                for _ in 0..self.config.grid_layers {
                    stakes.push(self.bounded(raw));
                    raw *= self.config.grid_factor;
                }
                stakes
            }
        }
    }

    /// Evaluate every guard; the first failing one is reported
    pub fn check_guards(&self, state: &StakePolicyState, ctx: &GuardContext) -> GuardVerdict {
        if state.consecutive_losses >= state.max_consecutive_losses {
            return GuardVerdict::RiskLimitExceeded(RiskLimit::ConsecutiveLosses {
                count: state.consecutive_losses,
                max: state.max_consecutive_losses,
            });
        }
        if state.cumulative_pnl <= -state.daily_loss_limit {
            return GuardVerdict::RiskLimitExceeded(RiskLimit::DailyLossLimit {
                pnl: state.cumulative_pnl,
                limit: state.daily_loss_limit,
            });
        }
        if state.cumulative_pnl >= state.take_profit {
            return GuardVerdict::RiskLimitExceeded(RiskLimit::TakeProfitReached {
                pnl: state.cumulative_pnl,
                target: state.take_profit,
            });
        }
        if ctx.open_positions >= self.config.max_open_positions {
            return GuardVerdict::RiskLimitExceeded(RiskLimit::ConcurrencyCeiling {
                open: ctx.open_positions,
                max: self.config.max_open_positions,
            });
        }
        if let Some(elapsed) = ctx.since_last_settlement {
            let cooldown = self.config.cooldown();
            if elapsed < cooldown {
                return GuardVerdict::RiskLimitExceeded(RiskLimit::Cooldown {
                    remaining: cooldown - elapsed,
                });
            }
        }
        GuardVerdict::Allowed
    }

    /// initial * multiplier^losses, rounded once
    fn martingale_stake(&self, losses: u32) -> Decimal {
        let mut raw = self.config.initial_stake;
        for _ in 0..losses {
            match raw.checked_mul(self.config.multiplier) {
                Some(v) if v <= self.config.max_stake => raw = v,
                _ => return self.bounded(self.config.max_stake),
            }
        }
        self.bounded(raw)
    }

    fn bounded(&self, raw: Decimal) -> Decimal {
        bounded_stake(
            raw,
            self.config.stake_increment,
            self.config.min_stake,
            self.config.max_stake,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn martingale(initial: &str, multiplier: &str) -> StakePolicy {
        StakePolicy::new(StakeConfig {
            mode: StakingMode::Martingale,
            initial_stake: dec(initial),
            multiplier: dec(multiplier),
            min_stake: dec("0.35"),
            max_stake: dec("1000"),
            stake_increment: dec("0.01"),
            max_consecutive_losses: 10,
            daily_loss_limit: dec("100"),
            take_profit: dec("100"),
            ..StakeConfig::default()
        })
    }

    #[test]
    fn test_loss_loss_win_trajectory() {
        let policy = martingale("1", "2");
        let s0 = policy.initial_state();
        let s1 = policy.apply(&s0, dec("-1"));
        let s2 = policy.apply(&s1, dec("-2"));
        let s3 = policy.apply(&s2, dec("3.8"));

        let stakes: Vec<Decimal> = [&s0, &s1, &s2, &s3].iter().map(|s| s.current_stake).collect();
        assert_eq!(stakes, vec![dec("1"), dec("2"), dec("4"), dec("1")]);

        let losses: Vec<u32> = [&s0, &s1, &s2, &s3].iter().map(|s| s.consecutive_losses).collect();
        assert_eq!(losses, vec![0, 1, 2, 0]);

        assert_eq!(s3.cumulative_pnl, dec("0.8"));
        assert_eq!(s3.total_trades, 3);
        assert_eq!(s3.wins, 1);
        assert_eq!(s3.worst_loss_streak, 2);
    }

    #[test]
    fn test_two_losses_equal_multiplier_squared() {
        let policy = martingale("0.35", "2.15");
        let s = policy.apply(&policy.apply(&policy.initial_state(), dec("-0.35")), dec("-0.75"));
        // 0.35 * 2.15^2 = 1.617875
        assert_eq!(s.current_stake, dec("1.62"));
    }

    #[test]
    fn test_stake_never_below_floor_or_above_cap() {
        let policy = StakePolicy::new(StakeConfig {
            initial_stake: dec("0.35"),
            multiplier: dec("10"),
            min_stake: dec("0.35"),
            max_stake: dec("20"),
            max_consecutive_losses: 10,
            ..StakeConfig::default()
        });
        let mut state = policy.initial_state();
        for _ in 0..6 {
            state = policy.apply(&state, dec("-1"));
            assert!(state.current_stake >= dec("0.35"));
            assert!(state.current_stake <= dec("20"));
        }
        assert_eq!(state.current_stake, dec("20"));
    }

    #[test]
    fn test_capped_stake_stays_on_increment() {
        let policy = StakePolicy::new(StakeConfig {
            initial_stake: dec("1"),
            multiplier: dec("3"),
            min_stake: dec("0.35"),
            max_stake: dec("5.005"),
            stake_increment: dec("0.01"),
            max_consecutive_losses: 10,
            ..StakeConfig::default()
        });
        let mut state = policy.initial_state();
        for _ in 0..3 {
            state = policy.apply(&state, dec("-1"));
        }
        assert_eq!(state.current_stake, dec("5"));
    }

    #[test]
    fn test_grid_layers() {
        let policy = StakePolicy::new(StakeConfig {
            mode: StakingMode::Grid,
            initial_stake: dec("2"),
            grid_factor: dec("0.5"),
            grid_layers: 4,
            min_stake: dec("0.35"),
            ..StakeConfig::default()
        });
        let state = policy.initial_state();
        assert_eq!(
            policy.entry_stakes(&state),
            vec![dec("2"), dec("1"), dec("0.5"), dec("0.35")]
        );

        // Losses do not escalate grid entries
        let after_loss = policy.apply(&state, dec("-3.85"));
        assert_eq!(after_loss.current_stake, dec("2"));
        assert_eq!(after_loss.consecutive_losses, 1);
    }

    #[test]
    fn test_guard_consecutive_losses() {
        let policy = martingale("1", "2");
        let mut state = policy.initial_state();
        state.consecutive_losses = state.max_consecutive_losses;
        assert!(matches!(
            policy.check_guards(&state, &GuardContext::default()),
            GuardVerdict::RiskLimitExceeded(RiskLimit::ConsecutiveLosses { .. })
        ));
    }

    #[test]
    fn test_guard_daily_loss_limit() {
        let policy = martingale("1", "2");
        let mut state = policy.initial_state();
        state.cumulative_pnl = -state.daily_loss_limit;
        let verdict = policy.check_guards(&state, &GuardContext::default());
        assert!(matches!(
            verdict,
            GuardVerdict::RiskLimitExceeded(RiskLimit::DailyLossLimit { .. })
        ));

        state.cumulative_pnl = -state.daily_loss_limit + dec("0.01");
        assert!(policy.check_guards(&state, &GuardContext::default()).is_allowed());
    }

    #[test]
    fn test_guard_take_profit() {
        let policy = martingale("1", "2");
        let mut state = policy.initial_state();
        state.cumulative_pnl = state.take_profit;
        match policy.check_guards(&state, &GuardContext::default()) {
            GuardVerdict::RiskLimitExceeded(limit) => {
                assert!(matches!(limit, RiskLimit::TakeProfitReached { .. }));
                assert!(limit.halts_session());
            }
            GuardVerdict::Allowed => panic!("take-profit should stop trading"),
        }
    }

    #[test]
    fn test_guard_concurrency_ceiling() {
        let policy = StakePolicy::new(StakeConfig {
            max_open_positions: 2,
            ..StakeConfig::default()
        });
        let state = policy.initial_state();
        let ctx = GuardContext {
            open_positions: 2,
            since_last_settlement: None,
        };
        match policy.check_guards(&state, &ctx) {
            GuardVerdict::RiskLimitExceeded(limit) => {
                assert_eq!(limit, RiskLimit::ConcurrencyCeiling { open: 2, max: 2 });
                assert!(!limit.halts_session());
            }
            GuardVerdict::Allowed => panic!("ceiling should block"),
        }

        let ctx = GuardContext {
            open_positions: 1,
            since_last_settlement: None,
        };
        assert!(policy.check_guards(&state, &ctx).is_allowed());
    }

    #[test]
    fn test_guard_cooldown() {
        let policy = StakePolicy::new(StakeConfig {
            cooldown_secs: 10,
            ..StakeConfig::default()
        });
        let state = policy.initial_state();
        let ctx = GuardContext {
            open_positions: 0,
            since_last_settlement: Some(Duration::seconds(4)),
        };
        assert_eq!(
            policy.check_guards(&state, &ctx),
            GuardVerdict::RiskLimitExceeded(RiskLimit::Cooldown {
                remaining: Duration::seconds(6)
            })
        );

        let ctx = GuardContext {
            open_positions: 0,
            since_last_settlement: Some(Duration::seconds(10)),
        };
        assert!(policy.check_guards(&state, &ctx).is_allowed());
    }
}
