//! In-memory store implementations
//!
//! Single-process backends for every collaborator trait. They are the
//! reference implementations the test suite runs against and are also what a
//! single-node deployment wires up. The account store keeps bets, balances,
//! and the ledger behind one mutex so each `commit_*` behaves like one
//! database transaction: validation happens before any mutation, and a
//! failure leaves nothing applied.

use super::traits::*;
use crate::betting::{Bet, BetStatus, BetType, Odds};
use crate::errors::{BusinessError, EngineError, EngineResult, ExternalError, StoreError};
use crate::rounds::{Round, RoundPhase, Table};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Token-table identity provider
pub struct MemoryIdentityProvider {
    tokens: DashMap<u64, (String, String)>,
    unavailable: AtomicBool,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn register(&self, user_id: u64, token: &str, nickname: &str) {
        self.tokens
            .insert(user_id, (token.to_string(), nickname.to_string()));
    }

    /// Simulate an identity-provider outage (requests fail closed)
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn verify(&self, user_id: u64, token: &str) -> EngineResult<Option<UserIdentity>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExternalError::IdentityUnavailable("provider offline".to_string()).into());
        }
        Ok(self.tokens.get(&user_id).and_then(|entry| {
            let (expected, nickname) = entry.value();
            if expected == token {
                Some(UserIdentity {
                    user_id,
                    nickname: nickname.clone(),
                })
            } else {
                None
            }
        }))
    }
}

/// Everything the account transaction covers, behind one mutex
struct AccountDb {
    accounts: HashMap<u64, Account>,
    bets: HashMap<u64, Bet>,
    ledger: Vec<LedgerEntry>,
    next_bet_id: u64,
}

/// In-memory account + bet store with transactional commits
pub struct MemoryAccountStore {
    db: Mutex<AccountDb>,
    /// When set, every commit fails before touching state (rollback testing)
    fail_commits: AtomicBool,
    /// When set, account lookups fail (degraded-read testing)
    fail_reads: AtomicBool,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self {
            db: Mutex::new(AccountDb {
                accounts: HashMap::new(),
                bets: HashMap::new(),
                ledger: Vec::new(),
                next_bet_id: 1,
            }),
            fail_commits: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub async fn insert_account(&self, account: Account) {
        self.db.lock().await.accounts.insert(account.user_id, account);
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_commit_allowed(&self) -> EngineResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::CommitFailed("injected commit failure".to_string()).into());
        }
        Ok(())
    }
}

impl Default for MemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

fn push_ledger(
    db: &mut AccountDb,
    user_id: u64,
    delta: i64,
    reason: LedgerReason,
    round_id: Option<&str>,
    at: DateTime<Utc>,
) {
    let account = db.accounts.get(&user_id).expect("ledger for known account");
    let after = account.balance;
    let before = (after as i64 - delta) as u64;
    db.ledger.push(LedgerEntry {
        user_id,
        delta,
        balance_before: before,
        balance_after: after,
        reason,
        round_id: round_id.map(|s| s.to_string()),
        at,
    });
}

#[async_trait::async_trait]
impl AccountStore for MemoryAccountStore {
    async fn account(&self, user_id: u64) -> EngineResult<Option<Account>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::ReadFailed("injected read failure".to_string()).into());
        }
        Ok(self.db.lock().await.accounts.get(&user_id).cloned())
    }

    async fn frozen_amount(&self, user_id: u64) -> EngineResult<u64> {
        let db = self.db.lock().await;
        Ok(db
            .bets
            .values()
            .filter(|b| b.user_id == user_id && b.status == BetStatus::Pending)
            .map(|b| b.stake)
            .sum())
    }

    async fn daily_stake(&self, user_id: u64, day: NaiveDate) -> EngineResult<u64> {
        let db = self.db.lock().await;
        Ok(db
            .bets
            .values()
            .filter(|b| {
                b.user_id == user_id
                    && b.status != BetStatus::Cancelled
                    && b.placed_at.date_naive() == day
            })
            .map(|b| b.stake)
            .sum())
    }

    async fn user_round_bets(&self, user_id: u64, round_id: &str) -> EngineResult<Vec<Bet>> {
        let db = self.db.lock().await;
        let mut bets: Vec<Bet> = db
            .bets
            .values()
            .filter(|b| b.user_id == user_id && b.round_id == round_id)
            .cloned()
            .collect();
        bets.sort_by_key(|b| b.id);
        Ok(bets)
    }

    async fn round_pending_bets(&self, round_id: &str) -> EngineResult<Vec<Bet>> {
        let db = self.db.lock().await;
        let mut bets: Vec<Bet> = db
            .bets
            .values()
            .filter(|b| b.round_id == round_id && b.status == BetStatus::Pending)
            .cloned()
            .collect();
        bets.sort_by_key(|b| b.id);
        Ok(bets)
    }

    async fn commit_placement(&self, commit: PlacementCommit) -> EngineResult<PlacementReceipt> {
        self.check_commit_allowed()?;
        let mut db = self.db.lock().await;

        let balance = db
            .accounts
            .get(&commit.user_id)
            .ok_or(BusinessError::AccountNotFound(commit.user_id))?
            .balance;

        let prior_ids: Vec<u64> = db
            .bets
            .values()
            .filter(|b| {
                b.user_id == commit.user_id
                    && b.round_id == commit.round_id
                    && b.status == BetStatus::Pending
            })
            .map(|b| b.id)
            .collect();
        let refund: u64 = prior_ids.iter().map(|id| db.bets[id].stake).sum();
        let new_stake: u64 = commit.bets.iter().map(|b| b.stake).sum();

        // Validate before mutating anything
        if balance + refund < new_stake {
            return Err(BusinessError::InsufficientBalance {
                needed: new_stake,
                available: balance + refund,
            }
            .into());
        }

        for id in &prior_ids {
            let bet = db.bets.get_mut(id).expect("prior bet id");
            bet.status = BetStatus::Cancelled;
        }
        let account = db.accounts.get_mut(&commit.user_id).expect("checked above");
        account.balance = account.balance + refund - new_stake;
        let new_balance = account.balance;

        if refund > 0 {
            // Intermediate ledger values reflect refund-then-debit ordering
            let account = db.accounts.get_mut(&commit.user_id).expect("checked");
            account.balance = balance + refund;
            push_ledger(
                &mut db,
                commit.user_id,
                refund as i64,
                LedgerReason::BetRefund,
                Some(&commit.round_id),
                commit.now,
            );
            let account = db.accounts.get_mut(&commit.user_id).expect("checked");
            account.balance = new_balance;
        }
        push_ledger(
            &mut db,
            commit.user_id,
            -(new_stake as i64),
            LedgerReason::BetPlace,
            Some(&commit.round_id),
            commit.now,
        );

        let mut accepted = Vec::with_capacity(commit.bets.len());
        for new_bet in &commit.bets {
            let id = db.next_bet_id;
            db.next_bet_id += 1;
            let bet = Bet {
                id,
                user_id: commit.user_id,
                table_id: commit.table_id,
                round_id: commit.round_id.clone(),
                bet_type: new_bet.bet_type,
                stake: new_bet.stake,
                quoted_multiplier: new_bet.quoted_multiplier,
                status: BetStatus::Pending,
                won: false,
                win_amount: 0,
                placed_at: commit.now,
                settled_at: None,
            };
            db.bets.insert(id, bet.clone());
            accepted.push(bet);
        }

        Ok(PlacementReceipt {
            accepted,
            total_stake: new_stake,
            refund_from_prior_bets: refund,
            new_balance,
        })
    }

    async fn commit_cancellation(
        &self,
        user_id: u64,
        round_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<CancellationReceipt> {
        self.check_commit_allowed()?;
        let mut db = self.db.lock().await;

        let pending_ids: Vec<u64> = db
            .bets
            .values()
            .filter(|b| {
                b.user_id == user_id && b.round_id == round_id && b.status == BetStatus::Pending
            })
            .map(|b| b.id)
            .collect();
        if pending_ids.is_empty() {
            return Err(BusinessError::NothingToCancel.into());
        }

        let refund: u64 = pending_ids.iter().map(|id| db.bets[id].stake).sum();
        for id in &pending_ids {
            db.bets.get_mut(id).expect("pending bet id").status = BetStatus::Cancelled;
        }
        let account = db
            .accounts
            .get_mut(&user_id)
            .ok_or(BusinessError::AccountNotFound(user_id))?;
        account.balance += refund;
        let new_balance = account.balance;
        push_ledger(
            &mut db,
            user_id,
            refund as i64,
            LedgerReason::BetRefund,
            Some(round_id),
            now,
        );

        Ok(CancellationReceipt {
            cancelled: pending_ids.len(),
            refund,
            new_balance,
        })
    }

    async fn commit_round_refunds(
        &self,
        round_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<RoundRefund>> {
        self.check_commit_allowed()?;
        let mut db = self.db.lock().await;

        // Group pending bets per user before mutating anything
        let mut per_user: HashMap<u64, (Vec<u64>, u64)> = HashMap::new();
        for bet in db.bets.values() {
            if bet.round_id == round_id && bet.status == BetStatus::Pending {
                let (ids, refund) = per_user.entry(bet.user_id).or_default();
                ids.push(bet.id);
                *refund += bet.stake;
            }
        }
        for user_id in per_user.keys() {
            if !db.accounts.contains_key(user_id) {
                return Err(
                    StoreError::CommitFailed(format!("account {} not found", user_id)).into(),
                );
            }
        }

        let mut receipts: Vec<RoundRefund> = Vec::with_capacity(per_user.len());
        let mut user_ids: Vec<u64> = per_user.keys().copied().collect();
        user_ids.sort_unstable();
        for user_id in user_ids {
            let (ids, refund) = &per_user[&user_id];
            for id in ids {
                db.bets.get_mut(id).expect("pending bet id").status = BetStatus::Cancelled;
            }
            let account = db.accounts.get_mut(&user_id).expect("checked above");
            account.balance += *refund;
            let new_balance = account.balance;
            push_ledger(
                &mut db,
                user_id,
                *refund as i64,
                LedgerReason::BetRefund,
                Some(round_id),
                now,
            );
            receipts.push(RoundRefund {
                user_id,
                cancelled: ids.len(),
                refund: *refund,
                new_balance,
            });
        }

        Ok(receipts)
    }

    async fn commit_settlement(&self, batch: SettlementBatch) -> EngineResult<()> {
        self.check_commit_allowed()?;
        let mut db = self.db.lock().await;

        // Validation pass: every row must exist and still be pending, every
        // credited account must exist
        for update in &batch.updates {
            match db.bets.get(&update.bet_id) {
                Some(bet) if bet.status == BetStatus::Pending => {}
                Some(bet) => {
                    return Err(StoreError::CommitFailed(format!(
                        "bet {} is {}, not pending",
                        bet.id, bet.status
                    ))
                    .into());
                }
                None => {
                    return Err(
                        StoreError::CommitFailed(format!("bet {} not found", update.bet_id)).into(),
                    );
                }
            }
        }
        for credit in &batch.credits {
            if !db.accounts.contains_key(&credit.user_id) {
                return Err(StoreError::CommitFailed(format!(
                    "account {} not found",
                    credit.user_id
                ))
                .into());
            }
        }

        // Mutation pass
        for update in &batch.updates {
            let bet = db.bets.get_mut(&update.bet_id).expect("validated");
            bet.status = BetStatus::Settled;
            bet.won = update.won;
            bet.win_amount = update.win_amount;
            bet.settled_at = Some(batch.settled_at);
        }
        for credit in &batch.credits {
            let account = db.accounts.get_mut(&credit.user_id).expect("validated");
            account.balance += credit.amount;
            push_ledger(
                &mut db,
                credit.user_id,
                credit.amount as i64,
                credit.reason,
                Some(&batch.round_id),
                batch.settled_at,
            );
        }

        Ok(())
    }

    async fn revert_settlement(&self, round_id: &str) -> EngineResult<usize> {
        self.check_commit_allowed()?;
        let mut db = self.db.lock().await;

        let settled_ids: Vec<u64> = db
            .bets
            .values()
            .filter(|b| b.round_id == round_id && b.status == BetStatus::Settled)
            .map(|b| b.id)
            .collect();
        if settled_ids.is_empty() {
            return Ok(0);
        }

        // Reconstruct what each user was credited for this round
        let mut credited: HashMap<u64, i64> = HashMap::new();
        for entry in &db.ledger {
            if entry.round_id.as_deref() == Some(round_id)
                && matches!(entry.reason, LedgerReason::BetPayout | LedgerReason::Rebate)
            {
                *credited.entry(entry.user_id).or_default() += entry.delta;
            }
            if entry.round_id.as_deref() == Some(round_id)
                && entry.reason == LedgerReason::SettlementRevert
            {
                *credited.entry(entry.user_id).or_default() += entry.delta;
            }
        }

        // A revert that would drive any balance negative fails whole
        for (user_id, amount) in &credited {
            let balance = db
                .accounts
                .get(user_id)
                .map(|a| a.balance as i64)
                .unwrap_or(0);
            if balance < *amount {
                return Err(StoreError::CommitFailed(format!(
                    "revert would overdraw account {}",
                    user_id
                ))
                .into());
            }
        }

        let now = Utc::now();
        for id in &settled_ids {
            let bet = db.bets.get_mut(id).expect("settled bet id");
            bet.status = BetStatus::Pending;
            bet.won = false;
            bet.win_amount = 0;
            bet.settled_at = None;
        }
        for (user_id, amount) in credited {
            if amount == 0 {
                continue;
            }
            let account = db.accounts.get_mut(&user_id).expect("checked above");
            account.balance = (account.balance as i64 - amount) as u64;
            push_ledger(
                &mut db,
                user_id,
                -amount,
                LedgerReason::SettlementRevert,
                Some(round_id),
                now,
            );
        }

        Ok(settled_ids.len())
    }

    async fn bet_history(&self, query: HistoryQuery) -> EngineResult<HistoryPage> {
        let db = self.db.lock().await;
        let mut bets: Vec<Bet> = db
            .bets
            .values()
            .filter(|b| {
                b.user_id == query.user_id
                    && query.table_id.map_or(true, |t| b.table_id == t)
                    && query.status.map_or(true, |s| b.status == s)
            })
            .cloned()
            .collect();
        bets.sort_by(|a, b| b.placed_at.cmp(&a.placed_at).then(b.id.cmp(&a.id)));

        let total = bets.len();
        let page = query.page.max(1);
        let limit = query.limit.clamp(1, 100);
        let start = (page - 1) * limit;
        let bets = if start >= total {
            Vec::new()
        } else {
            bets[start..(start + limit).min(total)].to_vec()
        };

        Ok(HistoryPage {
            bets,
            total,
            page,
            limit,
        })
    }

    async fn ledger(&self, user_id: u64) -> EngineResult<Vec<LedgerEntry>> {
        let db = self.db.lock().await;
        Ok(db
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// In-memory durable round store
pub struct MemoryRoundStore {
    rounds: DashMap<String, Round>,
    seqs: DashMap<u64, u64>,
}

impl MemoryRoundStore {
    pub fn new() -> Self {
        Self {
            rounds: DashMap::new(),
            seqs: DashMap::new(),
        }
    }
}

impl Default for MemoryRoundStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RoundStore for MemoryRoundStore {
    async fn next_round_seq(&self, table_id: u64) -> EngineResult<u64> {
        let mut entry = self.seqs.entry(table_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn insert_round(&self, round: &Round) -> EngineResult<()> {
        self.rounds.insert(round.round_id.clone(), round.clone());
        Ok(())
    }

    async fn update_round(&self, round: &Round) -> EngineResult<()> {
        self.rounds.insert(round.round_id.clone(), round.clone());
        Ok(())
    }

    async fn recent_rounds(&self, table_id: u64, limit: usize) -> EngineResult<Vec<Round>> {
        let mut rounds: Vec<Round> = self
            .rounds
            .iter()
            .filter(|r| r.table_id == table_id)
            .map(|r| r.clone())
            .collect();
        rounds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rounds.truncate(limit);
        Ok(rounds)
    }
}

/// In-memory table configuration store
pub struct MemoryTableStore {
    tables: DashMap<u64, Table>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    pub fn insert_table(&self, table: Table) {
        self.tables.insert(table.table_id, table);
    }
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TableStore for MemoryTableStore {
    async fn table(&self, table_id: u64) -> EngineResult<Option<Table>> {
        Ok(self.tables.get(&table_id).map(|t| t.clone()))
    }

    async fn set_run_status(&self, table_id: u64, phase: RoundPhase) -> EngineResult<()> {
        match self.tables.get_mut(&table_id) {
            Some(mut table) => {
                table.run_status = phase;
                Ok(())
            }
            None => Err(EngineError::Business(BusinessError::TableNotFound(table_id))),
        }
    }
}

/// House paytable. Single-die bets quote 1x here; settlement recomputes
/// their multiplier from the matching-die count.
static PAYTABLE: Lazy<Vec<(&'static str, Odds)>> = Lazy::new(|| {
    fn odds(multiplier: u32, min_bet: u64, max_bet: u64) -> Odds {
        Odds {
            multiplier,
            min_bet,
            max_bet,
        }
    }
    vec![
        ("flag", odds(1, 10, 100_000)),
        ("single", odds(1, 10, 100_000)),
        ("pair", odds(8, 10, 50_000)),
        ("triple", odds(150, 10, 5_000)),
        ("any_triple", odds(24, 10, 20_000)),
        ("combo", odds(5, 10, 50_000)),
    ]
});

/// Multiplier per exact total, mirrored around 10/11
fn total_multiplier(total: u8) -> u32 {
    match total {
        4 | 17 => 50,
        5 | 16 => 18,
        6 | 15 => 14,
        7 | 14 => 12,
        8 | 13 => 8,
        9 | 10 | 11 | 12 => 6,
        _ => 0,
    }
}

/// Static odds provider backed by the house paytable
pub struct StaticOddsProvider;

impl OddsProvider for StaticOddsProvider {
    fn odds(&self, bet_type: &BetType) -> Option<Odds> {
        fn lookup(key: &str) -> Odds {
            PAYTABLE
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, o)| *o)
                .expect("paytable key")
        }
        let odds = match bet_type {
            BetType::Big | BetType::Small | BetType::Odd | BetType::Even => lookup("flag"),
            BetType::Total(n) => {
                let multiplier = total_multiplier(*n);
                if multiplier == 0 {
                    return None;
                }
                Odds {
                    multiplier,
                    min_bet: 10,
                    max_bet: 50_000,
                }
            }
            BetType::Single(_) => lookup("single"),
            BetType::Pair(_) => lookup("pair"),
            BetType::Triple(_) => lookup("triple"),
            BetType::AnyTriple => lookup("any_triple"),
            BetType::Combo(_, _) => lookup("combo"),
        };
        Some(odds)
    }
}

/// In-memory TTL cache of the current round per table
pub struct MemoryFastCache {
    rounds: DashMap<u64, (Round, Instant)>,
}

impl MemoryFastCache {
    pub fn new() -> Self {
        Self {
            rounds: DashMap::new(),
        }
    }
}

impl Default for MemoryFastCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FastStateCache for MemoryFastCache {
    async fn put_round(&self, round: &Round, ttl: Duration) -> EngineResult<()> {
        self.rounds
            .insert(round.table_id, (round.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_round(&self, table_id: u64) -> EngineResult<Option<Round>> {
        if let Some(entry) = self.rounds.get(&table_id) {
            let (round, expires) = entry.value();
            if Instant::now() < *expires {
                return Ok(Some(round.clone()));
            }
        }
        // Expired entries are dropped lazily on read
        self.rounds
            .remove_if(&table_id, |_, (_, expires)| Instant::now() >= *expires);
        Ok(None)
    }

    async fn remove_round(&self, table_id: u64) -> EngineResult<()> {
        self.rounds.remove(&table_id);
        Ok(())
    }
}

/// Keyed in-process lock table implementing the TryAcquire capability
pub struct KeyedLockManager {
    locks: Arc<DashMap<String, (u64, Instant)>>,
    tokens: AtomicU64,
}

impl KeyedLockManager {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            tokens: AtomicU64::new(1),
        }
    }
}

impl Default for KeyedLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for KeyedLockManager {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<OwnedLock> {
        let token = self.tokens.fetch_add(1, Ordering::SeqCst);
        let expires = Instant::now() + ttl;

        match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let (_, held_until) = *occupied.get();
                if Instant::now() < held_until {
                    return None;
                }
                // Expired holder: take over
                occupied.insert((token, expires));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((token, expires));
            }
        }

        let locks = Arc::clone(&self.locks);
        let key = key.to_string();
        Some(OwnedLock::new(Box::new(move || {
            // Only release our own acquisition; a TTL takeover keeps its entry
            locks.remove_if(&key, |_, (held_token, _)| *held_token == token);
        })))
    }
}
