//! Settlement engine
//!
//! Resolves every pending bet of a round against the dice outcome, credits
//! winners, applies the loss rebate, and commits the whole thing to the
//! account store as one transaction. The commit either lands completely or
//! not at all; on failure the round machine parks the round in Failed and
//! an operator resubmits the outcome once the store recovers.

use super::outcome::DiceOutcome;
use crate::betting::{Bet, BetType};
use crate::config::SettlementConfig;
use crate::errors::{BusinessError, EngineResult};
use crate::metrics::MetricsRegistry;
use crate::notify::NotificationDispatcher;
use crate::rounds::Round;
use crate::stores::{
    AccountStore, BalanceCredit, BetSettlementUpdate, LedgerReason, OddsProvider, SettlementBatch,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-round totals produced by a settlement run
#[derive(Debug, Clone, serde::Serialize)]
pub struct SettlementSummary {
    pub round_id: String,
    pub outcome: DiceOutcome,
    pub total_bets: usize,
    pub total_stake: u64,
    pub total_payout: u64,
    pub total_rebate: u64,
    /// Stake kept minus winnings and rebates paid; negative means the house
    /// lost this round
    pub house_profit: i64,
}

/// One user's aggregate over a round, accumulated while resolving bets
#[derive(Debug, Default)]
struct UserTotals {
    bet_count: usize,
    win_count: usize,
    total_stake: u64,
    total_win: u64,
    /// stake refund + winnings for won bets
    credit: u64,
}

pub struct SettlementEngine {
    accounts: Arc<dyn AccountStore>,
    odds: Arc<dyn OddsProvider>,
    notifier: Arc<NotificationDispatcher>,
    metrics: MetricsRegistry,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        odds: Arc<dyn OddsProvider>,
        notifier: Arc<NotificationDispatcher>,
        metrics: MetricsRegistry,
        config: SettlementConfig,
    ) -> Self {
        Self {
            accounts,
            odds,
            notifier,
            metrics,
            config,
        }
    }

    /// Effective multiplier for a bet against an outcome. Single-die bets
    /// pay by matching-die count (1x-3x) regardless of the quoted odds.
    fn multiplier_for(&self, bet: &Bet, outcome: &DiceOutcome) -> u32 {
        match bet.bet_type {
            BetType::Single(face) => outcome.face_count(face) as u32,
            _ => {
                // Quoted multiplier was pinned at placement; fall back to
                // the current paytable if an old row predates quoting
                if bet.quoted_multiplier > 0 {
                    bet.quoted_multiplier
                } else {
                    self.odds
                        .odds(&bet.bet_type)
                        .map(|o| o.multiplier)
                        .unwrap_or(0)
                }
            }
        }
    }

    /// Settle a round. The caller has already moved the round to Settling
    /// and guarantees no new bets can arrive.
    pub async fn settle(&self, round: &Round, dice: [u8; 3]) -> EngineResult<SettlementSummary> {
        if round.outcome.is_some() {
            return Err(BusinessError::AlreadySettled(round.round_id.clone()).into());
        }
        let outcome = DiceOutcome::derive(dice[0], dice[1], dice[2])?;

        let pending = self.accounts.round_pending_bets(&round.round_id).await?;
        let settled_at = Utc::now();

        let mut updates = Vec::with_capacity(pending.len());
        let mut per_user: BTreeMap<u64, UserTotals> = BTreeMap::new();
        let mut total_stake = 0u64;
        let mut total_payout = 0u64;

        for bet in &pending {
            let won = outcome.pays(&bet.bet_type);
            let win_amount = if won {
                bet.stake * self.multiplier_for(bet, &outcome) as u64
            } else {
                0
            };
            updates.push(BetSettlementUpdate {
                bet_id: bet.id,
                won,
                win_amount,
            });

            let totals = per_user.entry(bet.user_id).or_default();
            totals.bet_count += 1;
            totals.total_stake += bet.stake;
            total_stake += bet.stake;
            if won {
                totals.win_count += 1;
                totals.total_win += win_amount;
                totals.credit += bet.stake + win_amount;
                total_payout += win_amount;
            }
        }

        let mut credits = Vec::new();
        let mut rebates: BTreeMap<u64, u64> = BTreeMap::new();
        let mut total_rebate = 0u64;
        for (&user_id, totals) in &per_user {
            if totals.credit > 0 {
                credits.push(BalanceCredit {
                    user_id,
                    amount: totals.credit,
                    reason: LedgerReason::BetPayout,
                });
            }
            // Rebate applies only when the user finished the round down
            let net = totals.total_win as i64 - totals.total_stake as i64;
            if net < 0 && self.config.rebate_bps > 0 {
                let rebate = totals.total_stake * self.config.rebate_bps / 10_000;
                if rebate > 0 {
                    credits.push(BalanceCredit {
                        user_id,
                        amount: rebate,
                        reason: LedgerReason::Rebate,
                    });
                    rebates.insert(user_id, rebate);
                    total_rebate += rebate;
                }
            }
        }

        self.accounts
            .commit_settlement(SettlementBatch {
                round_id: round.round_id.clone(),
                table_id: round.table_id,
                updates,
                credits,
                settled_at,
            })
            .await?;

        // Commit landed: fan out the table result, then each user's summary
        self.notifier
            .game_result(round.table_id, &round.round_id, &outcome);
        for (&user_id, totals) in &per_user {
            let rebate = rebates.get(&user_id).copied().unwrap_or(0);
            // The settlement has already landed; a failed balance read only
            // degrades the notice, it must not fail the round
            let balance = match self.accounts.account(user_id).await {
                Ok(account) => account.map(|a| a.balance).unwrap_or(0),
                Err(err) => {
                    tracing::warn!(user_id, round_id = %round.round_id, error = %err, "balance lookup failed after settlement commit");
                    0
                }
            };
            self.notifier.personal_settlement(
                user_id,
                &round.round_id,
                totals.bet_count,
                totals.win_count,
                totals.total_stake,
                totals.total_win,
                rebate,
                balance,
            );
            if totals.total_win >= self.config.large_win_alert {
                tracing::warn!(
                    user_id,
                    round_id = %round.round_id,
                    total_win = totals.total_win,
                    "large win"
                );
            }
        }

        let house_profit = total_stake as i64 - total_payout as i64 - total_rebate as i64;
        Ok(SettlementSummary {
            round_id: round.round_id.clone(),
            outcome,
            total_bets: pending.len(),
            total_stake,
            total_payout,
            total_rebate,
            house_profit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use crate::rounds::{round_id, RoundPhase};
    use crate::stores::{
        Account, MemoryAccountStore, NewBet, PlacementCommit, StaticOddsProvider,
    };

    fn engine(accounts: Arc<MemoryAccountStore>, rebate_bps: u64) -> SettlementEngine {
        let registry = Arc::new(ConnectionRegistry::new());
        SettlementEngine::new(
            accounts,
            Arc::new(StaticOddsProvider),
            Arc::new(NotificationDispatcher::new(registry)),
            MetricsRegistry::new(),
            SettlementConfig {
                rebate_bps,
                large_win_alert: 1_000_000,
            },
        )
    }

    fn round(rid: &str) -> Round {
        let now = Utc::now();
        Round {
            round_id: rid.to_string(),
            table_id: 1,
            phase: RoundPhase::Settling,
            betting_start: now,
            betting_end: now,
            dealer_id: None,
            outcome: None,
            created_at: now,
            closed_at: None,
        }
    }

    async fn place(
        accounts: &MemoryAccountStore,
        user_id: u64,
        rid: &str,
        bets: Vec<(BetType, u64, u32)>,
    ) {
        accounts
            .commit_placement(PlacementCommit {
                user_id,
                table_id: 1,
                round_id: rid.to_string(),
                bets: bets
                    .into_iter()
                    .map(|(bet_type, stake, quoted_multiplier)| NewBet {
                        bet_type,
                        stake,
                        quoted_multiplier,
                    })
                    .collect(),
                now: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mixed_win_and_loss() {
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 42,
                balance: 1_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let rid = round_id(1, Utc::now(), 1);
        // 100 on big (wins on 4,5,6 = 15), 50 on total 10 (loses)
        place(
            &accounts,
            42,
            &rid,
            vec![(BetType::Big, 100, 1), (BetType::Total(10), 50, 6)],
        )
        .await;
        assert_eq!(accounts.account(42).await.unwrap().unwrap().balance, 850);

        let summary = engine(accounts.clone(), 0)
            .settle(&round(&rid), [4, 5, 6])
            .await
            .unwrap();
        assert_eq!(summary.total_bets, 2);
        assert_eq!(summary.total_stake, 150);
        assert_eq!(summary.total_payout, 100);
        assert_eq!(summary.house_profit, 50);

        // Winner gets stake + 1x back on the big bet; the total bet is lost
        assert_eq!(accounts.account(42).await.unwrap().unwrap().balance, 1_050);
        let bets = accounts.user_round_bets(42, &rid).await.unwrap();
        let big = bets.iter().find(|b| b.bet_type == BetType::Big).unwrap();
        assert!(big.won);
        assert_eq!(big.win_amount, 100);
    }

    #[tokio::test]
    async fn test_single_die_pays_by_match_count() {
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 1,
                balance: 1_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let rid = round_id(1, Utc::now(), 2);
        place(&accounts, 1, &rid, vec![(BetType::Single(5), 100, 1)]).await;

        // 5 appears twice: payout 2x, credit stake + 200
        let summary = engine(accounts.clone(), 0)
            .settle(&round(&rid), [5, 5, 2])
            .await
            .unwrap();
        assert_eq!(summary.total_payout, 200);
        assert_eq!(accounts.account(1).await.unwrap().unwrap().balance, 1_200);
    }

    #[tokio::test]
    async fn test_rebate_only_on_net_loss() {
        let accounts = Arc::new(MemoryAccountStore::new());
        for user_id in [1, 2] {
            accounts
                .insert_account(Account {
                    user_id,
                    balance: 100_000,
                    active: true,
                    blacklisted: false,
                })
                .await;
        }
        let rid = round_id(1, Utc::now(), 3);
        // User 1 loses 10_000; user 2 wins
        place(&accounts, 1, &rid, vec![(BetType::Small, 10_000, 1)]).await;
        place(&accounts, 2, &rid, vec![(BetType::Big, 10_000, 1)]).await;

        let summary = engine(accounts.clone(), 50)
            .settle(&round(&rid), [4, 5, 6])
            .await
            .unwrap();
        // 50 bps of 10_000 = 50
        assert_eq!(summary.total_rebate, 50);
        assert_eq!(accounts.account(1).await.unwrap().unwrap().balance, 90_050);
        assert_eq!(accounts.account(2).await.unwrap().unwrap().balance, 110_000);

        let ledger = accounts.ledger(1).await.unwrap();
        assert!(ledger
            .iter()
            .any(|e| e.reason == LedgerReason::Rebate && e.delta == 50));
    }

    #[tokio::test]
    async fn test_pair_bet_loses_on_triple_roll() {
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 1,
                balance: 1_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let rid = round_id(1, Utc::now(), 7);
        place(&accounts, 1, &rid, vec![(BetType::Pair(3), 100, 8)]).await;

        // The face shows three times, not exactly twice: no pair payout
        let summary = engine(accounts.clone(), 0)
            .settle(&round(&rid), [3, 3, 3])
            .await
            .unwrap();
        assert_eq!(summary.total_payout, 0);
        assert_eq!(accounts.account(1).await.unwrap().unwrap().balance, 900);
        let bets = accounts.user_round_bets(1, &rid).await.unwrap();
        assert!(!bets[0].won);
    }

    #[tokio::test]
    async fn test_degraded_balance_read_does_not_fail_settlement() {
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts
            .insert_account(Account {
                user_id: 1,
                balance: 1_000,
                active: true,
                blacklisted: false,
            })
            .await;
        let rid = round_id(1, Utc::now(), 8);
        place(&accounts, 1, &rid, vec![(BetType::Big, 100, 1)]).await;

        // Reads go down between the commit and the notices; the settlement
        // itself must still report success
        accounts.set_fail_reads(true);
        let summary = engine(accounts.clone(), 0)
            .settle(&round(&rid), [4, 5, 6])
            .await
            .unwrap();
        assert_eq!(summary.total_payout, 100);

        accounts.set_fail_reads(false);
        assert_eq!(accounts.account(1).await.unwrap().unwrap().balance, 1_100);
    }

    #[tokio::test]
    async fn test_already_settled_guard() {
        let accounts = Arc::new(MemoryAccountStore::new());
        let rid = round_id(1, Utc::now(), 4);
        let mut r = round(&rid);
        r.outcome = Some(DiceOutcome::derive(1, 2, 3).unwrap());
        let err = engine(accounts, 0).settle(&r, [1, 2, 3]).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_SETTLED");
    }

    #[tokio::test]
    async fn test_invalid_dice_rejected() {
        let accounts = Arc::new(MemoryAccountStore::new());
        let rid = round_id(1, Utc::now(), 5);
        let err = engine(accounts, 0)
            .settle(&round(&rid), [0, 2, 3])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DICE");
    }

    #[tokio::test]
    async fn test_empty_round_settles_cleanly() {
        let accounts = Arc::new(MemoryAccountStore::new());
        let rid = round_id(1, Utc::now(), 6);
        let summary = engine(accounts, 50)
            .settle(&round(&rid), [2, 3, 4])
            .await
            .unwrap();
        assert_eq!(summary.total_bets, 0);
        assert_eq!(summary.house_profit, 0);
    }
}
