//! Outcome derivation and round settlement

pub mod engine;
pub mod outcome;

pub use engine::{SettlementEngine, SettlementSummary};
pub use outcome::DiceOutcome;
