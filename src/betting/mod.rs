//! Bet types, limits, and the placement pipeline

pub mod limits;
pub mod pipeline;
pub mod types;

pub use limits::{BetLimits, RiskMonitor};
pub use pipeline::BettingPipeline;
pub use types::{Bet, BetStatus, BetType, Odds};
