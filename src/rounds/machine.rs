//! Round state machine
//!
//! Drives each table through its round lifecycle:
//! Waiting -> Betting -> Dealing -> Settling -> Finished, with Cancelled as
//! an operator exit from Betting/Dealing and Failed as the landing state
//! when a settlement commit rolls back. Every transition is persisted to the
//! durable round store and mirrored into the fast cache before anyone is
//! notified.

use super::round::{Round, RoundPhase, TableStatus, round_id};
use crate::config::RoundsConfig;
use crate::errors::{BusinessError, EngineResult};
use crate::metrics::MetricsRegistry;
use crate::notify::NotificationDispatcher;
use crate::settlement::{SettlementEngine, SettlementSummary};
use crate::stores::{AccountStore, FastStateCache, RoundStore, TableStore};
use chrono::Utc;
use std::sync::Arc;

pub struct RoundMachine {
    tables: Arc<dyn TableStore>,
    rounds: Arc<dyn RoundStore>,
    cache: Arc<dyn FastStateCache>,
    accounts: Arc<dyn AccountStore>,
    settlement: Arc<SettlementEngine>,
    notifier: Arc<NotificationDispatcher>,
    metrics: MetricsRegistry,
    config: RoundsConfig,
}

impl RoundMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tables: Arc<dyn TableStore>,
        rounds: Arc<dyn RoundStore>,
        cache: Arc<dyn FastStateCache>,
        accounts: Arc<dyn AccountStore>,
        settlement: Arc<SettlementEngine>,
        notifier: Arc<NotificationDispatcher>,
        metrics: MetricsRegistry,
        config: RoundsConfig,
    ) -> Self {
        Self {
            tables,
            rounds,
            cache,
            accounts,
            settlement,
            notifier,
            metrics,
            config,
        }
    }

    /// Current round for a table: fast cache first, durable store on miss.
    /// A hit on a terminal round still counts as "no active round" for
    /// callers that check the phase.
    pub async fn current_round(&self, table_id: u64) -> EngineResult<Option<Round>> {
        if let Some(round) = self.cache.get_round(table_id).await? {
            return Ok(Some(round));
        }
        let recent = self.rounds.recent_rounds(table_id, 1).await?;
        match recent.into_iter().next() {
            // Failed rounds stay visible so an operator can resettle them
            // after the cache entry has expired
            Some(round) if !round.phase.is_terminal() || round.phase == RoundPhase::Failed => {
                // Re-prime the cache so the next lookup is fast again
                self.cache
                    .put_round(&round, self.config.cache_ttl())
                    .await?;
                Ok(Some(round))
            }
            _ => Ok(None),
        }
    }

    async fn persist(&self, round: &Round) -> EngineResult<()> {
        self.rounds.update_round(round).await?;
        self.cache.put_round(round, self.config.cache_ttl()).await?;
        self.tables.set_run_status(round.table_id, round.phase).await
    }

    /// Open a new betting round on an open, idle table
    pub async fn start_round(&self, table_id: u64, dealer_id: Option<u64>) -> EngineResult<Round> {
        let table = self
            .tables
            .table(table_id)
            .await?
            .ok_or(BusinessError::TableNotFound(table_id))?;
        if table.status != TableStatus::Open {
            return Err(BusinessError::TableClosed(table_id).into());
        }
        if let Some(active) = self.current_round(table_id).await? {
            if !active.phase.is_terminal() {
                tracing::warn!(table_id, round_id = %active.round_id, "round already active");
                return Err(BusinessError::RoundInProgress(table_id).into());
            }
        }

        let now = Utc::now();
        let seq = self.rounds.next_round_seq(table_id).await?;
        let round = Round {
            round_id: round_id(table_id, now, seq),
            table_id,
            phase: RoundPhase::Betting,
            betting_start: now,
            betting_end: now + chrono::Duration::seconds(self.config.betting_secs as i64),
            dealer_id,
            outcome: None,
            created_at: now,
            closed_at: None,
        };
        self.rounds.insert_round(&round).await?;
        self.cache.put_round(&round, self.config.cache_ttl()).await?;
        self.tables.set_run_status(table_id, RoundPhase::Betting).await?;

        MetricsRegistry::incr(&self.metrics.rounds_started_total);
        tracing::info!(table_id, round_id = %round.round_id, betting_secs = self.config.betting_secs, "round started");
        self.notifier.round_started(&round);
        Ok(round)
    }

    /// Close the betting window: Betting -> Dealing. Idempotent from the
    /// ticker's point of view: a round already past Betting is an error the
    /// caller may ignore.
    pub async fn stop_betting(&self, table_id: u64) -> EngineResult<Round> {
        let mut round = self
            .current_round(table_id)
            .await?
            .ok_or(BusinessError::RoundNotFound(table_id))?;
        if round.phase != RoundPhase::Betting {
            return Err(BusinessError::PhaseMismatch {
                expected: RoundPhase::Betting.to_string(),
                actual: round.phase.to_string(),
            }
            .into());
        }

        round.phase = RoundPhase::Dealing;
        self.persist(&round).await?;
        tracing::info!(table_id, round_id = %round.round_id, "betting closed");
        self.notifier.betting_ended(table_id, &round.round_id);
        Ok(round)
    }

    /// Record the dice and settle. Accepted in Dealing, and again in Failed
    /// so an operator can retry after a settlement rollback. The caller
    /// names the round it is settling; a stale or duplicated submission
    /// aimed at an earlier round is rejected instead of landing on the
    /// current one.
    pub async fn submit_outcome(
        &self,
        table_id: u64,
        round_id: &str,
        dice: [u8; 3],
    ) -> EngineResult<SettlementSummary> {
        let mut round = self
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
        match round.phase {
            RoundPhase::Dealing => {}
            RoundPhase::Failed => {
                let reverted = self.accounts.revert_settlement(&round.round_id).await?;
                if reverted > 0 {
                    tracing::warn!(round_id = %round.round_id, reverted, "reverted partial settlement before retry");
                }
            }
            phase => {
                return Err(BusinessError::PhaseMismatch {
                    expected: RoundPhase::Dealing.to_string(),
                    actual: phase.to_string(),
                }
                .into());
            }
        }

        round.phase = RoundPhase::Settling;
        self.persist(&round).await?;

        match self.settlement.settle(&round, dice).await {
            Ok(summary) => {
                round.outcome = Some(summary.outcome.clone());
                round.phase = RoundPhase::Finished;
                round.closed_at = Some(Utc::now());
                self.persist(&round).await?;
                MetricsRegistry::incr(&self.metrics.rounds_settled_total);
                MetricsRegistry::add(&self.metrics.payout_total, summary.total_payout);
                MetricsRegistry::add(&self.metrics.rebate_total, summary.total_rebate);
                tracing::info!(
                    table_id,
                    round_id = %round.round_id,
                    dice = ?dice,
                    total_bets = summary.total_bets,
                    total_stake = summary.total_stake,
                    total_payout = summary.total_payout,
                    house_profit = summary.house_profit,
                    "round settled"
                );
                Ok(summary)
            }
            Err(err) => {
                round.phase = RoundPhase::Failed;
                self.persist(&round).await?;
                MetricsRegistry::incr(&self.metrics.settlement_failures_total);
                tracing::error!(table_id, round_id = %round.round_id, error = %err, "settlement failed, round marked for retry");
                Err(err)
            }
        }
    }

    /// Operator abort: refund every pending bet in one batch and close the
    /// round. A refund failure aborts the cancellation and the round stays
    /// in its current phase.
    pub async fn cancel_round(&self, table_id: u64) -> EngineResult<Round> {
        let mut round = self
            .current_round(table_id)
            .await?
            .ok_or(BusinessError::RoundNotFound(table_id))?;
        if !matches!(round.phase, RoundPhase::Betting | RoundPhase::Dealing) {
            return Err(BusinessError::PhaseMismatch {
                expected: "betting or dealing".to_string(),
                actual: round.phase.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let receipts = self
            .accounts
            .commit_round_refunds(&round.round_id, now)
            .await?;
        for receipt in &receipts {
            self.notifier.balance_update(
                receipt.user_id,
                receipt.new_balance,
                receipt.refund as i64,
                "bet_refund",
            );
        }

        round.phase = RoundPhase::Cancelled;
        round.closed_at = Some(now);
        self.rounds.update_round(&round).await?;
        // A cancelled round has nothing left to poll; drop the snapshot
        // instead of letting it age out of the cache
        self.cache.remove_round(table_id).await?;
        self.tables
            .set_run_status(table_id, RoundPhase::Cancelled)
            .await?;
        MetricsRegistry::incr(&self.metrics.rounds_cancelled_total);
        tracing::info!(table_id, round_id = %round.round_id, refunded_users = receipts.len(), "round cancelled");
        self.notifier.round_cancelled(table_id, &round.round_id);
        Ok(round)
    }

    pub fn config(&self) -> &RoundsConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::registry::ConnectionRegistry;
    use crate::rounds::Table;
    use crate::stores::{
        Account, MemoryAccountStore, MemoryFastCache, MemoryRoundStore, MemoryTableStore, NewBet,
        PlacementCommit, StaticOddsProvider,
    };

    struct Harness {
        machine: RoundMachine,
        accounts: Arc<MemoryAccountStore>,
        tables: Arc<MemoryTableStore>,
    }

    async fn harness() -> Harness {
        let tables = Arc::new(MemoryTableStore::new());
        tables.insert_table(Table {
            table_id: 1,
            name: "Main Floor".to_string(),
            status: TableStatus::Open,
            run_status: RoundPhase::Waiting,
            min_bet: 10,
            max_bet: 100_000,
        });
        let rounds = Arc::new(MemoryRoundStore::new());
        let cache = Arc::new(MemoryFastCache::new());
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 42,
                balance: 10_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let registry = Arc::new(ConnectionRegistry::new());
        let notifier = Arc::new(NotificationDispatcher::new(registry));
        let metrics = MetricsRegistry::new();
        let settlement = Arc::new(SettlementEngine::new(
            accounts.clone(),
            Arc::new(StaticOddsProvider),
            notifier.clone(),
            metrics.clone(),
            SettlementConfig::default(),
        ));
        let machine = RoundMachine::new(
            tables.clone(),
            rounds,
            cache,
            accounts.clone(),
            settlement,
            notifier,
            metrics,
            RoundsConfig::default(),
        );
        Harness {
            machine,
            accounts,
            tables,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let h = harness().await;
        let round = h.machine.start_round(1, Some(9)).await.unwrap();
        assert_eq!(round.phase, RoundPhase::Betting);
        assert_eq!(h.tables.table(1).await.unwrap().unwrap().run_status, RoundPhase::Betting);

        // Second start while active is refused
        let err = h.machine.start_round(1, None).await.unwrap_err();
        assert_eq!(err.code(), "ROUND_IN_PROGRESS");

        let round = h.machine.stop_betting(1).await.unwrap();
        assert_eq!(round.phase, RoundPhase::Dealing);

        let summary = h
            .machine
            .submit_outcome(1, &round.round_id, [4, 5, 6])
            .await
            .unwrap();
        assert_eq!(summary.outcome.total, 15);

        // Round is terminal: a new one can start
        assert!(h.machine.current_round(1).await.unwrap().is_none() || {
            let r = h.machine.current_round(1).await.unwrap();
            r.map(|r| r.phase.is_terminal()).unwrap_or(true)
        });
        h.machine.start_round(1, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_outcome_requires_dealing_phase() {
        let h = harness().await;
        let round = h.machine.start_round(1, None).await.unwrap();
        let err = h
            .machine
            .submit_outcome(1, &round.round_id, [1, 2, 3])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PHASE_MISMATCH");
    }

    #[tokio::test]
    async fn test_stale_outcome_targets_no_other_round() {
        let h = harness().await;
        let r1 = h.machine.start_round(1, None).await.unwrap();
        h.machine.stop_betting(1).await.unwrap();
        h.machine
            .submit_outcome(1, &r1.round_id, [4, 5, 6])
            .await
            .unwrap();

        // New round opens and takes a bet
        let r2 = h.machine.start_round(1, None).await.unwrap();
        h.accounts
            .commit_placement(PlacementCommit {
                user_id: 42,
                table_id: 1,
                round_id: r2.round_id.clone(),
                bets: vec![NewBet {
                    bet_type: crate::betting::BetType::Big,
                    stake: 1_000,
                    quoted_multiplier: 1,
                }],
                now: Utc::now(),
            })
            .await
            .unwrap();

        // A duplicated submission still naming the finished round must not
        // settle the new one
        let err = h
            .machine
            .submit_outcome(1, &r1.round_id, [4, 5, 6])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROUND_MISMATCH");
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 9_000);
        let current = h.machine.current_round(1).await.unwrap().unwrap();
        assert_eq!(current.round_id, r2.round_id);
        assert_eq!(current.phase, RoundPhase::Betting);
    }

    #[tokio::test]
    async fn test_cancel_refunds_pending_bets() {
        let h = harness().await;
        let round = h.machine.start_round(1, None).await.unwrap();
        h.accounts
            .commit_placement(PlacementCommit {
                user_id: 42,
                table_id: 1,
                round_id: round.round_id.clone(),
                bets: vec![NewBet {
                    bet_type: crate::betting::BetType::Big,
                    stake: 500,
                    quoted_multiplier: 1,
                }],
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 9_500);

        let cancelled = h.machine.cancel_round(1).await.unwrap();
        assert_eq!(cancelled.phase, RoundPhase::Cancelled);
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 10_000);
        // The cancelled snapshot is evicted, not left to expire
        assert!(h.machine.current_round(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_when_refund_commit_fails() {
        let h = harness().await;
        let round = h.machine.start_round(1, None).await.unwrap();
        h.accounts
            .commit_placement(PlacementCommit {
                user_id: 42,
                table_id: 1,
                round_id: round.round_id.clone(),
                bets: vec![NewBet {
                    bet_type: crate::betting::BetType::Big,
                    stake: 500,
                    quoted_multiplier: 1,
                }],
                now: Utc::now(),
            })
            .await
            .unwrap();

        h.accounts.set_fail_commits(true);
        let err = h.machine.cancel_round(1).await.unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        // Nothing applied: round still open, stake still held
        let current = h.machine.current_round(1).await.unwrap().unwrap();
        assert_eq!(current.phase, RoundPhase::Betting);
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 9_500);

        h.accounts.set_fail_commits(false);
        h.machine.cancel_round(1).await.unwrap();
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 10_000);
    }

    #[tokio::test]
    async fn test_failed_settlement_is_retryable() {
        let h = harness().await;
        let round = h.machine.start_round(1, None).await.unwrap();
        h.accounts
            .commit_placement(PlacementCommit {
                user_id: 42,
                table_id: 1,
                round_id: round.round_id.clone(),
                bets: vec![NewBet {
                    bet_type: crate::betting::BetType::Small,
                    stake: 100,
                    quoted_multiplier: 1,
                }],
                now: Utc::now(),
            })
            .await
            .unwrap();
        h.machine.stop_betting(1).await.unwrap();

        h.accounts.set_fail_commits(true);
        let err = h
            .machine
            .submit_outcome(1, &round.round_id, [1, 2, 3])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        let failed = h.machine.current_round(1).await.unwrap().unwrap();
        assert_eq!(failed.phase, RoundPhase::Failed);

        // Store recovers: resubmitting the outcome settles the round
        h.accounts.set_fail_commits(false);
        let summary = h
            .machine
            .submit_outcome(1, &round.round_id, [1, 2, 3])
            .await
            .unwrap();
        assert_eq!(summary.total_bets, 1);
        // Small wins on total 6: stake back plus 1x
        assert_eq!(h.accounts.account(42).await.unwrap().unwrap().balance, 10_100);
    }

    #[tokio::test]
    async fn test_closed_table_rejects_rounds() {
        let h = harness().await;
        h.tables.insert_table(Table {
            table_id: 2,
            name: "Dark".to_string(),
            status: TableStatus::Closed,
            run_status: RoundPhase::Waiting,
            min_bet: 10,
            max_bet: 100_000,
        });
        let err = h.machine.start_round(2, None).await.unwrap_err();
        assert_eq!(err.code(), "TABLE_CLOSED");
    }
}
