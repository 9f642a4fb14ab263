//! dicehall: a live round-based dice betting table server
//!
//! Players connect over WebSocket, join a table, and bet on the outcome of
//! three dice inside a timed betting window. Operators drive the round
//! lifecycle over HTTP: open the round, close betting, submit the dice, and
//! the settlement engine resolves every pending bet, credits winners, and
//! pushes results to everyone seated at the table.
//!
//! The crate is organized around the flow of a frame:
//! - [`registry`] tracks live connections and delivers outbound frames
//! - [`gateway`] validates, authenticates, and dispatches inbound frames
//! - [`rounds`] owns the per-table round state machine and the ticker
//! - [`betting`] validates and commits bet placements and cancellations
//! - [`settlement`] derives the dice outcome and settles the round
//! - [`notify`] fans engine events out to tables and users
//! - [`stores`] defines the storage traits and in-memory implementations

pub mod betting;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod rounds;
pub mod server;
pub mod settlement;
pub mod stores;

pub use betting::{Bet, BetStatus, BetType, BettingPipeline};
pub use config::DicehallConfig;
pub use errors::{EngineError, EngineResult};
pub use gateway::Gateway;
pub use metrics::MetricsRegistry;
pub use notify::NotificationDispatcher;
pub use registry::ConnectionRegistry;
pub use rounds::{Round, RoundMachine, RoundPhase, Table, TableStatus, TableTicker};
pub use settlement::{DiceOutcome, SettlementEngine, SettlementSummary};
