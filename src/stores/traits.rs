//! Injected collaborator interfaces
//!
//! The engine never talks to a concrete database, cache, or identity backend;
//! it talks to these traits. Production wires real backends, tests wire the
//! in-memory implementations from `stores::memory`. Balance mutation only
//! happens inside the `commit_*` methods, each of which is one atomic
//! transaction in whatever backend implements it.

use crate::betting::{Bet, BetStatus, BetType, Odds};
use crate::errors::EngineResult;
use crate::rounds::{Round, Table};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of verifying a (user id, token) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: u64,
    pub nickname: String,
}

/// Token verification; fails closed when the provider is unreachable
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, user_id: u64, token: &str) -> EngineResult<Option<UserIdentity>>;
}

/// A user account as the betting pipeline sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub user_id: u64,
    pub balance: u64,
    pub active: bool,
    pub blacklisted: bool,
}

/// Reason code written with every balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    BetPlace,
    BetRefund,
    BetPayout,
    Rebate,
    SettlementRevert,
}

/// One ledger row: before/after values plus a reason code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: u64,
    pub delta: i64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub reason: LedgerReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// A new bet row to record, before an id is assigned
#[derive(Debug, Clone)]
pub struct NewBet {
    pub bet_type: BetType,
    pub stake: u64,
    pub quoted_multiplier: u32,
}

/// Atomic placement unit: cancel-and-refund the user's prior pending bets in
/// this round, debit the new stake, insert the new rows, write ledger entries
#[derive(Debug, Clone)]
pub struct PlacementCommit {
    pub user_id: u64,
    pub table_id: u64,
    pub round_id: String,
    pub bets: Vec<NewBet>,
    pub now: DateTime<Utc>,
}

/// What a successful placement commit returns
#[derive(Debug, Clone)]
pub struct PlacementReceipt {
    pub accepted: Vec<Bet>,
    pub total_stake: u64,
    pub refund_from_prior_bets: u64,
    pub new_balance: u64,
}

/// What a successful cancellation commit returns
#[derive(Debug, Clone)]
pub struct CancellationReceipt {
    pub cancelled: usize,
    pub refund: u64,
    pub new_balance: u64,
}

/// One user's share of a round-wide refund
#[derive(Debug, Clone)]
pub struct RoundRefund {
    pub user_id: u64,
    pub cancelled: usize,
    pub refund: u64,
    pub new_balance: u64,
}

/// Per-bet fields written by settlement
#[derive(Debug, Clone)]
pub struct BetSettlementUpdate {
    pub bet_id: u64,
    pub won: bool,
    pub win_amount: u64,
}

/// Per-user credit applied by settlement (payouts and rebates)
#[derive(Debug, Clone)]
pub struct BalanceCredit {
    pub user_id: u64,
    pub amount: u64,
    pub reason: LedgerReason,
}

/// Atomic settlement unit: all bet-row updates and all balance credits for a
/// round, applied as one batch or not at all
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    pub round_id: String,
    pub table_id: u64,
    pub updates: Vec<BetSettlementUpdate>,
    pub credits: Vec<BalanceCredit>,
    pub settled_at: DateTime<Utc>,
}

/// Bet-history pagination query
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub user_id: u64,
    /// 1-based
    pub page: usize,
    pub limit: usize,
    pub table_id: Option<u64>,
    pub status: Option<BetStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub bets: Vec<Bet>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Durable account + bet store with transaction support
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn account(&self, user_id: u64) -> EngineResult<Option<Account>>;

    /// Sum of the user's currently pending stakes across all rounds
    async fn frozen_amount(&self, user_id: u64) -> EngineResult<u64>;

    /// Stake the user has placed on the given calendar day (for the daily cap)
    async fn daily_stake(&self, user_id: u64, day: NaiveDate) -> EngineResult<u64>;

    async fn user_round_bets(&self, user_id: u64, round_id: &str) -> EngineResult<Vec<Bet>>;

    /// Every pending bet in the round, across all users
    async fn round_pending_bets(&self, round_id: &str) -> EngineResult<Vec<Bet>>;

    /// One transaction: refund prior pending bets, debit the new stake,
    /// insert the new rows, write both ledger entries. Fails without side
    /// effects if the refund-adjusted balance cannot cover the stake.
    async fn commit_placement(&self, commit: PlacementCommit) -> EngineResult<PlacementReceipt>;

    /// One transaction: cancel the user's pending bets in the round and
    /// refund their stakes
    async fn commit_cancellation(
        &self,
        user_id: u64,
        round_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<CancellationReceipt>;

    /// One transaction: cancel every pending bet in the round, across all
    /// users, and refund their stakes. Every refund lands or none do.
    async fn commit_round_refunds(
        &self,
        round_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<RoundRefund>>;

    /// One transaction: apply every bet update and balance credit of a
    /// finished round, or nothing
    async fn commit_settlement(&self, batch: SettlementBatch) -> EngineResult<()>;

    /// Revert a previously applied settlement: bets back to pending with win
    /// fields cleared, credited amounts debited back with a revert ledger
    /// entry. Returns the number of reverted bets.
    async fn revert_settlement(&self, round_id: &str) -> EngineResult<usize>;

    async fn bet_history(&self, query: HistoryQuery) -> EngineResult<HistoryPage>;

    /// Full ledger for a user, oldest first
    async fn ledger(&self, user_id: u64) -> EngineResult<Vec<LedgerEntry>>;
}

/// Durable round record store; rounds are mirrored here at creation and at
/// terminal transition
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Allocate the next monotonically increasing sequence for the table
    async fn next_round_seq(&self, table_id: u64) -> EngineResult<u64>;

    async fn insert_round(&self, round: &Round) -> EngineResult<()>;

    async fn update_round(&self, round: &Round) -> EngineResult<()>;

    /// Most recent rounds of a table, newest first
    async fn recent_rounds(&self, table_id: u64, limit: usize) -> EngineResult<Vec<Round>>;
}

/// Table configuration store
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table(&self, table_id: u64) -> EngineResult<Option<Table>>;

    /// Mirror the current round phase onto the table record
    async fn set_run_status(&self, table_id: u64, phase: crate::rounds::RoundPhase)
        -> EngineResult<()>;
}

/// Quoted odds lookup
pub trait OddsProvider: Send + Sync {
    fn odds(&self, bet_type: &BetType) -> Option<Odds>;
}

/// Low-latency shared cache for round-state polling. A performance cache,
/// not the system of record: the durable `RoundStore` is authoritative at
/// creation and terminal transitions.
#[async_trait]
pub trait FastStateCache: Send + Sync {
    async fn put_round(&self, round: &Round, ttl: Duration) -> EngineResult<()>;

    /// Current round snapshot for a table, if any and not expired
    async fn get_round(&self, table_id: u64) -> EngineResult<Option<Round>>;

    async fn remove_round(&self, table_id: u64) -> EngineResult<()>;
}

/// Releases its key when dropped
pub struct OwnedLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl OwnedLock {
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            release: Some(release),
        }
    }
}

impl Drop for OwnedLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for OwnedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLock").finish()
    }
}

/// Keyed exclusivity lock: `try_acquire` either takes the key immediately or
/// reports it busy. The TTL guards against a holder that never releases.
/// Deployments may back this with a distributed lock; in-process it is a
/// keyed map.
pub trait LockManager: Send + Sync {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<OwnedLock>;
}
