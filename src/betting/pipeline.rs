//! Betting pipeline
//!
//! Single entry point for placing and cancelling bets. Validation runs in a
//! fixed order so clients get deterministic error codes: frame shape, then
//! account standing, then round state, then stake limits, then caps, and
//! only then the funded commit under the per-(user, round) lock. A repeat
//! placement in the same round supersedes the user's earlier pending bets
//! inside the same transaction.

use super::limits::{BetLimits, RiskMonitor};
use super::types::BetType;
use crate::config::BettingConfig;
use crate::errors::{BusinessError, EngineError, EngineResult, ValidationError};
use crate::gateway::messages::BetRequest;
use crate::metrics::MetricsRegistry;
use crate::rounds::{RoundMachine, RoundPhase};
use crate::stores::{
    AccountStore, CancellationReceipt, LockManager, NewBet, OddsProvider, OwnedLock,
    PlacementCommit, PlacementReceipt,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

const LOCK_RETRY_PAUSE_MS: u64 = 25;

pub struct BettingPipeline {
    accounts: Arc<dyn AccountStore>,
    odds: Arc<dyn OddsProvider>,
    machine: Arc<RoundMachine>,
    locks: Arc<dyn LockManager>,
    limits: BetLimits,
    risk: RiskMonitor,
    metrics: MetricsRegistry,
    config: BettingConfig,
}

impl BettingPipeline {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        odds: Arc<dyn OddsProvider>,
        machine: Arc<RoundMachine>,
        locks: Arc<dyn LockManager>,
        metrics: MetricsRegistry,
        config: BettingConfig,
    ) -> Self {
        Self {
            accounts,
            odds,
            machine,
            locks,
            limits: BetLimits::new(config.clone()),
            risk: RiskMonitor::new(&config),
            metrics,
            config,
        }
    }

    /// Acquire the per-(user, round) lock, retrying within the configured
    /// wait budget before giving up with LOCK_BUSY
    async fn acquire_lock(&self, key: &str) -> EngineResult<OwnedLock> {
        let deadline = Instant::now() + self.config.lock_wait();
        loop {
            if let Some(guard) = self.locks.try_acquire(key, self.config.lock_ttl()) {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                MetricsRegistry::incr(&self.metrics.lock_contention_total);
                return Err(EngineError::LockBusy {
                    key: key.to_string(),
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(LOCK_RETRY_PAUSE_MS)).await;
        }
    }

    /// Shape checks that need no I/O: bet list size, known types, positive
    /// stakes, no duplicate types, declared total
    fn parse_requests(
        &self,
        requests: &[BetRequest],
        total_amount: u64,
    ) -> EngineResult<Vec<(BetType, u64)>> {
        if requests.is_empty() {
            return Err(ValidationError::EmptyBetList.into());
        }
        if requests.len() > self.limits.max_bets_per_call() {
            return Err(ValidationError::BadMessage(format!(
                "at most {} bets per request",
                self.limits.max_bets_per_call()
            ))
            .into());
        }

        let mut parsed = Vec::with_capacity(requests.len());
        let mut seen: HashSet<BetType> = HashSet::new();
        let mut actual = 0u64;
        for request in requests {
            let bet_type = BetType::from_code(&request.bet_type)?;
            if request.amount == 0 {
                return Err(ValidationError::NonPositiveStake.into());
            }
            if !seen.insert(bet_type) {
                return Err(ValidationError::DuplicateBetType(bet_type.code()).into());
            }
            actual += request.amount;
            parsed.push((bet_type, request.amount));
        }
        if actual != total_amount {
            return Err(ValidationError::TotalMismatch {
                declared: total_amount,
                actual,
            }
            .into());
        }
        Ok(parsed)
    }

    async fn check_account(&self, user_id: u64) -> EngineResult<()> {
        let account = self
            .accounts
            .account(user_id)
            .await?
            .ok_or(BusinessError::AccountNotFound(user_id))?;
        if account.blacklisted {
            return Err(BusinessError::AccountBlacklisted(user_id).into());
        }
        if !account.active {
            return Err(BusinessError::AccountInactive(user_id).into());
        }
        Ok(())
    }

    /// The round must be the table's current one, in Betting, with the
    /// window still open
    async fn check_round(&self, table_id: u64, round_id: &str) -> EngineResult<()> {
        let round = self
            .machine
            .current_round(table_id)
            .await?
            .ok_or(BusinessError::RoundNotFound(table_id))?;
        if round.round_id != round_id {
            return Err(BusinessError::RoundMismatch {
                requested: round_id.to_string(),
                current: round.round_id,
            }
            .into());
        }
        if round.phase != RoundPhase::Betting {
            return Err(BusinessError::PhaseMismatch {
                expected: RoundPhase::Betting.to_string(),
                actual: round.phase.to_string(),
            }
            .into());
        }
        if !round.window_open(Utc::now()) {
            return Err(BusinessError::WindowClosed.into());
        }
        Ok(())
    }

    /// Place (or replace) the user's bets for a round
    pub async fn place_bets(
        &self,
        user_id: u64,
        table_id: u64,
        round_id: &str,
        requests: &[BetRequest],
        total_amount: u64,
    ) -> EngineResult<PlacementReceipt> {
        let result = self
            .try_place(user_id, table_id, round_id, requests, total_amount)
            .await;
        if let Err(err) = &result {
            MetricsRegistry::incr(&self.metrics.bets_rejected_total);
            tracing::debug!(user_id, table_id, round_id, code = err.code(), "bet rejected");
        }
        result
    }

    async fn try_place(
        &self,
        user_id: u64,
        table_id: u64,
        round_id: &str,
        requests: &[BetRequest],
        total_amount: u64,
    ) -> EngineResult<PlacementReceipt> {
        let parsed = self.parse_requests(requests, total_amount)?;
        self.check_account(user_id).await?;
        self.check_round(table_id, round_id).await?;

        let mut new_bets = Vec::with_capacity(parsed.len());
        let mut max_stake = 0u64;
        for (bet_type, stake) in &parsed {
            let quoted_multiplier = self.limits.check_stake(bet_type, *stake, &*self.odds)?;
            max_stake = max_stake.max(*stake);
            new_bets.push(NewBet {
                bet_type: *bet_type,
                stake: *stake,
                quoted_multiplier,
            });
        }

        self.limits.check_round_cap(total_amount)?;
        let now = Utc::now();
        let daily = self.accounts.daily_stake(user_id, now.date_naive()).await?;
        let superseded: u64 = self
            .accounts
            .user_round_bets(user_id, round_id)
            .await?
            .iter()
            .filter(|b| b.status == crate::betting::BetStatus::Pending)
            .map(|b| b.stake)
            .sum();
        self.limits.check_daily_cap(daily, superseded, total_amount)?;

        let lock_key = format!("bet:{}:{}", user_id, round_id);
        let _guard = self.acquire_lock(&lock_key).await?;

        // Window may have closed while we waited on the lock
        self.check_round(table_id, round_id).await?;

        let receipt = self
            .accounts
            .commit_placement(PlacementCommit {
                user_id,
                table_id,
                round_id: round_id.to_string(),
                bets: new_bets,
                now,
            })
            .await?;

        MetricsRegistry::add(&self.metrics.bets_placed_total, receipt.accepted.len() as u64);
        MetricsRegistry::add(&self.metrics.stake_accepted_total, receipt.total_stake);
        self.risk.observe(user_id, max_stake);
        tracing::info!(
            user_id,
            table_id,
            round_id,
            bets = receipt.accepted.len(),
            total_stake = receipt.total_stake,
            superseded = receipt.refund_from_prior_bets,
            "bets placed"
        );
        Ok(receipt)
    }

    /// Cancel every pending bet the user holds in the round. Refused inside
    /// the cutoff at the end of the window.
    pub async fn cancel_bets(
        &self,
        user_id: u64,
        table_id: u64,
        round_id: &str,
    ) -> EngineResult<CancellationReceipt> {
        self.check_account(user_id).await?;

        let round = self
            .machine
            .current_round(table_id)
            .await?
            .ok_or(BusinessError::RoundNotFound(table_id))?;
        if round.round_id != round_id {
            return Err(BusinessError::RoundMismatch {
                requested: round_id.to_string(),
                current: round.round_id,
            }
            .into());
        }
        let now = Utc::now();
        if round.phase != RoundPhase::Betting || !round.window_open(now) {
            return Err(BusinessError::WindowClosed.into());
        }
        let cutoff = self.config.cancel_cutoff_secs;
        if round.remaining_secs(now) <= cutoff {
            return Err(BusinessError::CancelCutoff(cutoff).into());
        }

        let lock_key = format!("bet:{}:{}", user_id, round_id);
        let _guard = self.acquire_lock(&lock_key).await?;

        let receipt = self
            .accounts
            .commit_cancellation(user_id, round_id, now)
            .await?;
        MetricsRegistry::add(&self.metrics.bets_cancelled_total, receipt.cancelled as u64);
        tracing::info!(
            user_id,
            round_id,
            cancelled = receipt.cancelled,
            refund = receipt.refund,
            "bets cancelled"
        );
        Ok(receipt)
    }

    /// Periodic upkeep for the risk monitor's rolling windows
    pub fn cleanup(&self) {
        self.risk.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoundsConfig, SettlementConfig};
    use crate::notify::NotificationDispatcher;
    use crate::registry::ConnectionRegistry;
    use crate::rounds::{Round, Table, TableStatus};
    use crate::settlement::SettlementEngine;
    use crate::stores::{
        Account, KeyedLockManager, MemoryAccountStore, MemoryFastCache, MemoryRoundStore,
        MemoryTableStore, StaticOddsProvider,
    };

    struct Harness {
        pipeline: BettingPipeline,
        machine: Arc<RoundMachine>,
        accounts: Arc<MemoryAccountStore>,
    }

    async fn harness_with(betting: BettingConfig, rounds_config: RoundsConfig) -> Harness {
        let tables = Arc::new(MemoryTableStore::new());
        tables.insert_table(Table {
            table_id: 1,
            name: "Main".to_string(),
            status: TableStatus::Open,
            run_status: RoundPhase::Waiting,
            min_bet: 10,
            max_bet: 100_000,
        });
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 42,
                balance: 100_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Arc::new(NotificationDispatcher::new(registry));
        let metrics = MetricsRegistry::new();
        let odds = Arc::new(StaticOddsProvider);
        let settlement = Arc::new(SettlementEngine::new(
            accounts.clone(),
            odds.clone(),
            notifier.clone(),
            metrics.clone(),
            SettlementConfig::default(),
        ));
        let machine = Arc::new(RoundMachine::new(
            tables,
            Arc::new(MemoryRoundStore::new()),
            Arc::new(MemoryFastCache::new()),
            accounts.clone(),
            settlement,
            notifier,
            metrics.clone(),
            rounds_config,
        ));
        let pipeline = BettingPipeline::new(
            accounts.clone(),
            odds,
            machine.clone(),
            Arc::new(KeyedLockManager::new()),
            metrics,
            betting,
        );
        Harness {
            pipeline,
            machine,
            accounts,
        }
    }

    async fn harness() -> Harness {
        harness_with(BettingConfig::default(), RoundsConfig::default()).await
    }

    fn req(bet_type: &str, amount: u64) -> BetRequest {
        BetRequest {
            bet_type: bet_type.to_string(),
            amount,
        }
    }

    async fn open_round(h: &Harness) -> Round {
        h.machine.start_round(1, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_place_and_replace() {
        let h = harness().await;
        let round = open_round(&h).await;

        let receipt = h
            .pipeline
            .place_bets(42, 1, &round.round_id, &[req("big", 100), req("total_10", 50)], 150)
            .await
            .unwrap();
        assert_eq!(receipt.accepted.len(), 2);
        assert_eq!(receipt.new_balance, 99_850);
        // Quoted multiplier pinned from the paytable
        let total_bet = receipt
            .accepted
            .iter()
            .find(|b| b.bet_type == BetType::Total(10))
            .unwrap();
        assert_eq!(total_bet.quoted_multiplier, 6);

        // Replacement supersedes both earlier bets
        let receipt = h
            .pipeline
            .place_bets(42, 1, &round.round_id, &[req("odd", 80)], 80)
            .await
            .unwrap();
        assert_eq!(receipt.refund_from_prior_bets, 150);
        assert_eq!(receipt.new_balance, 99_920);
        let pending = h
            .accounts
            .round_pending_bets(&round.round_id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].bet_type, BetType::Odd);
    }

    #[tokio::test]
    async fn test_validation_error_codes() {
        let h = harness().await;
        let round = open_round(&h).await;
        let rid = round.round_id.as_str();

        let err = h.pipeline.place_bets(42, 1, rid, &[], 0).await.unwrap_err();
        assert_eq!(err.code(), "EMPTY_BET_LIST");

        let err = h
            .pipeline
            .place_bets(42, 1, rid, &[req("lucky_seven", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_BET_TYPE");

        let err = h
            .pipeline
            .place_bets(42, 1, rid, &[req("big", 100), req("big", 50)], 150)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_BET_TYPE");

        let err = h
            .pipeline
            .place_bets(42, 1, rid, &[req("big", 100)], 90)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TOTAL_MISMATCH");

        let err = h
            .pipeline
            .place_bets(42, 1, "T001-19990101-001", &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROUND_MISMATCH");
    }

    #[tokio::test]
    async fn test_account_standing_checks() {
        let h = harness().await;
        let round = open_round(&h).await;
        h.accounts
            .insert_account(Account {
                user_id: 7,
                balance: 1_000,
                active: true,
                blacklisted: true,
            })
            .await;
        h.accounts
            .insert_account(Account {
                user_id: 8,
                balance: 1_000,
                active: false,
                blacklisted: false,
            })
            .await;

        let err = h
            .pipeline
            .place_bets(7, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_BLACKLISTED");

        let err = h
            .pipeline
            .place_bets(8, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_INACTIVE");

        let err = h
            .pipeline
            .place_bets(9, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_window_closed_after_betting_ends() {
        let h = harness().await;
        let round = open_round(&h).await;
        h.machine.stop_betting(1).await.unwrap();

        let err = h
            .pipeline
            .place_bets(42, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PHASE_MISMATCH");
    }

    #[tokio::test]
    async fn test_caps() {
        let h = harness_with(
            BettingConfig {
                per_round_cap: 1_000,
                daily_cap: 1_500,
                ..BettingConfig::default()
            },
            RoundsConfig::default(),
        )
        .await;
        let round = open_round(&h).await;
        let rid = round.round_id.as_str();

        let err = h
            .pipeline
            .place_bets(42, 1, rid, &[req("big", 1_100)], 1_100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROUND_CAP_EXCEEDED");

        // 900 in this round, replaced by 900 again is fine under daily 1500
        h.pipeline
            .place_bets(42, 1, rid, &[req("big", 900)], 900)
            .await
            .unwrap();
        h.pipeline
            .place_bets(42, 1, rid, &[req("small", 1_000)], 1_000)
            .await
            .unwrap();

        // A second round the same day: 1000 already counted, 600 more busts
        h.machine.stop_betting(1).await.unwrap();
        h.machine.submit_outcome(1, rid, [1, 2, 3]).await.unwrap();
        let round2 = h.machine.start_round(1, None).await.unwrap();
        let err = h
            .pipeline
            .place_bets(42, 1, &round2.round_id, &[req("big", 600)], 600)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DAILY_CAP_EXCEEDED");
        h.pipeline
            .place_bets(42, 1, &round2.round_id, &[req("big", 500)], 500)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let h = harness().await;
        let round = open_round(&h).await;
        h.accounts
            .insert_account(Account {
                user_id: 5,
                balance: 50,
                active: true,
                blacklisted: false,
            })
            .await;
        let err = h
            .pipeline
            .place_bets(5, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[tokio::test]
    async fn test_cancel_within_window_outside_cutoff() {
        let h = harness().await;
        let round = open_round(&h).await;
        h.pipeline
            .place_bets(42, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap();

        let receipt = h
            .pipeline
            .cancel_bets(42, 1, &round.round_id)
            .await
            .unwrap();
        assert_eq!(receipt.cancelled, 1);
        assert_eq!(receipt.new_balance, 100_000);

        // Nothing left to cancel
        let err = h
            .pipeline
            .cancel_bets(42, 1, &round.round_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOTHING_TO_CANCEL");
    }

    #[tokio::test]
    async fn test_cancel_blocked_inside_cutoff() {
        // Window equals the cutoff: every instant is inside the cutoff
        let h = harness_with(
            BettingConfig {
                cancel_cutoff_secs: 30,
                ..BettingConfig::default()
            },
            RoundsConfig {
                betting_secs: 30,
                ..RoundsConfig::default()
            },
        )
        .await;
        let round = open_round(&h).await;
        h.pipeline
            .place_bets(42, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap();

        let err = h
            .pipeline
            .cancel_bets(42, 1, &round.round_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANCEL_CUTOFF");
    }

    #[tokio::test]
    async fn test_lock_busy_when_held_elsewhere() {
        let h = harness_with(
            BettingConfig {
                lock_wait_ms: 30,
                ..BettingConfig::default()
            },
            RoundsConfig::default(),
        )
        .await;
        let round = open_round(&h).await;

        // Hold the user's lock externally so the placement times out
        let locks = Arc::new(KeyedLockManager::new());
        let pipeline = BettingPipeline::new(
            h.accounts.clone(),
            Arc::new(StaticOddsProvider),
            h.machine.clone(),
            locks.clone(),
            MetricsRegistry::new(),
            BettingConfig {
                lock_wait_ms: 30,
                ..BettingConfig::default()
            },
        );
        let key = format!("bet:42:{}", round.round_id);
        let _held = locks
            .try_acquire(&key, std::time::Duration::from_secs(5))
            .unwrap();

        let err = pipeline
            .place_bets(42, 1, &round.round_id, &[req("big", 100)], 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_BUSY");
        assert!(err.retryable());
    }
}
