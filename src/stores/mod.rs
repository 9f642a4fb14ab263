//! Storage and collaborator interfaces
//!
//! The engine talks to its account ledger, round history, table registry,
//! odds source, fast state cache, identity provider, and lock service only
//! through the traits in [`traits`]. [`memory`] provides the single-process
//! implementations used in tests and single-node deployments.

pub mod memory;
pub mod traits;

pub use memory::{
    KeyedLockManager, MemoryAccountStore, MemoryFastCache, MemoryIdentityProvider,
    MemoryRoundStore, MemoryTableStore, StaticOddsProvider,
};
pub use traits::{
    Account, AccountStore, BalanceCredit, BetSettlementUpdate, CancellationReceipt,
    FastStateCache, HistoryPage, HistoryQuery, IdentityProvider, LedgerEntry, LedgerReason,
    LockManager, NewBet, OddsProvider, OwnedLock, PlacementCommit, PlacementReceipt, RoundRefund,
    RoundStore, SettlementBatch, TableStore, UserIdentity,
};
