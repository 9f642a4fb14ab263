//! Stake limits and risk flags
//!
//! Hard limits (per-type stake range, per-round cap, daily cap) reject the
//! placement. Risk flags (placement frequency, anomalous stake size) only
//! log a warning for the risk desk; they never block a bet.

use crate::betting::BetType;
use crate::config::BettingConfig;
use crate::errors::{BusinessError, EngineResult};
use crate::stores::OddsProvider;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub struct BetLimits {
    config: BettingConfig,
}

impl BetLimits {
    pub fn new(config: BettingConfig) -> Self {
        Self { config }
    }

    /// Per-type stake range from the paytable
    pub fn check_stake(
        &self,
        bet_type: &BetType,
        stake: u64,
        odds: &dyn OddsProvider,
    ) -> EngineResult<u32> {
        let odds = odds
            .odds(bet_type)
            .ok_or_else(|| crate::errors::ValidationError::UnknownBetType(bet_type.code()))?;
        if stake < odds.min_bet || stake > odds.max_bet {
            return Err(BusinessError::StakeOutOfRange {
                bet_type: bet_type.code(),
                stake,
                min: odds.min_bet,
                max: odds.max_bet,
            }
            .into());
        }
        Ok(odds.multiplier)
    }

    /// Round cap applies to the replacement total, since a new placement
    /// supersedes the user's prior bets in the round
    pub fn check_round_cap(&self, round_total: u64) -> EngineResult<()> {
        if round_total > self.config.per_round_cap {
            return Err(BusinessError::RoundCapExceeded {
                cap: self.config.per_round_cap,
            }
            .into());
        }
        Ok(())
    }

    /// Daily cap over all non-cancelled stakes, with the stake this
    /// placement is about to supersede taken back out
    pub fn check_daily_cap(
        &self,
        daily_so_far: u64,
        superseded_in_round: u64,
        new_total: u64,
    ) -> EngineResult<()> {
        let effective = daily_so_far.saturating_sub(superseded_in_round) + new_total;
        if effective > self.config.daily_cap {
            return Err(BusinessError::DailyCapExceeded {
                cap: self.config.daily_cap,
            }
            .into());
        }
        Ok(())
    }

    pub fn max_bets_per_call(&self) -> usize {
        self.config.max_bets_per_call
    }
}

/// Non-blocking behavioral flags, logged for the risk desk
pub struct RiskMonitor {
    placements: DashMap<u64, Vec<Instant>>,
    frequency_flag: u32,
    anomalous_stake: u64,
}

const FREQUENCY_WINDOW: Duration = Duration::from_secs(60);

impl RiskMonitor {
    pub fn new(config: &BettingConfig) -> Self {
        Self {
            placements: DashMap::new(),
            frequency_flag: config.placements_per_minute_flag,
            anomalous_stake: config.anomalous_stake_flag,
        }
    }

    /// Record an accepted placement and emit any flags it trips
    pub fn observe(&self, user_id: u64, max_stake: u64) {
        let now = Instant::now();
        let mut stamps = self.placements.entry(user_id).or_default();
        stamps.retain(|t| now.duration_since(*t) < FREQUENCY_WINDOW);
        stamps.push(now);
        let rate = stamps.len();
        drop(stamps);

        if rate as u32 > self.frequency_flag {
            tracing::warn!(
                user_id,
                placements_last_minute = rate,
                "risk flag: placement frequency"
            );
        }
        if max_stake >= self.anomalous_stake {
            tracing::warn!(user_id, stake = max_stake, "risk flag: anomalous stake");
        }
    }

    pub fn cleanup(&self) {
        let now = Instant::now();
        self.placements
            .retain(|_, stamps| stamps.iter().any(|t| now.duration_since(*t) < FREQUENCY_WINDOW));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::StaticOddsProvider;

    fn limits() -> BetLimits {
        BetLimits::new(BettingConfig::default())
    }

    #[test]
    fn test_stake_range_per_type() {
        let odds = StaticOddsProvider;
        // Triple max is tighter than the flag bets
        assert!(limits().check_stake(&BetType::Triple(3), 5_000, &odds).is_ok());
        let err = limits()
            .check_stake(&BetType::Triple(3), 50_000, &odds)
            .unwrap_err();
        assert_eq!(err.code(), "STAKE_OUT_OF_RANGE");

        let err = limits().check_stake(&BetType::Big, 1, &odds).unwrap_err();
        assert_eq!(err.code(), "STAKE_OUT_OF_RANGE");
    }

    #[test]
    fn test_quoted_multiplier_comes_from_paytable() {
        let odds = StaticOddsProvider;
        assert_eq!(limits().check_stake(&BetType::Total(4), 100, &odds).unwrap(), 50);
        assert_eq!(limits().check_stake(&BetType::Big, 100, &odds).unwrap(), 1);
    }

    #[test]
    fn test_daily_cap_discounts_superseded_stake() {
        let limits = BetLimits::new(BettingConfig {
            daily_cap: 1_000,
            ..BettingConfig::default()
        });
        // 900 wagered today, 400 of it about to be replaced by 450
        assert!(limits.check_daily_cap(900, 400, 450).is_ok());
        let err = limits.check_daily_cap(900, 400, 600).unwrap_err();
        assert_eq!(err.code(), "DAILY_CAP_EXCEEDED");
    }

    #[test]
    fn test_round_cap() {
        let limits = BetLimits::new(BettingConfig {
            per_round_cap: 500,
            ..BettingConfig::default()
        });
        assert!(limits.check_round_cap(500).is_ok());
        assert_eq!(
            limits.check_round_cap(501).unwrap_err().code(),
            "ROUND_CAP_EXCEEDED"
        );
    }
}
