//! Round records and lifecycle phases

use crate::settlement::DiceOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a table's current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Waiting,
    Betting,
    Dealing,
    Settling,
    Finished,
    Cancelled,
    /// Settlement rolled back; bets remain pending, resettlement allowed
    Failed,
}

impl RoundPhase {
    /// Terminal phases never transition again (Failed may be resettled but
    /// the round no longer gates the table)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundPhase::Finished | RoundPhase::Cancelled | RoundPhase::Failed
        )
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::Waiting => "waiting",
            RoundPhase::Betting => "betting",
            RoundPhase::Dealing => "dealing",
            RoundPhase::Settling => "settling",
            RoundPhase::Finished => "finished",
            RoundPhase::Cancelled => "cancelled",
            RoundPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Build the round id for a table: `T{table:03}-{YYYYMMDD}-{seq:03}`
pub fn round_id(table_id: u64, date: DateTime<Utc>, seq: u64) -> String {
    format!("T{:03}-{}-{:03}", table_id, date.format("%Y%m%d"), seq)
}

/// One timed betting-and-outcome cycle on a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub table_id: u64,
    pub phase: RoundPhase,
    pub betting_start: DateTime<Utc>,
    pub betting_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dealer_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DiceOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Round {
    /// Remaining betting seconds at `now`, zero once the window is past
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.betting_end - now).num_seconds().max(0) as u64
    }

    /// Whether the betting window is still open at `now`
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.phase == RoundPhase::Betting && now < self.betting_end
    }
}

/// Operational status of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Closed,
    Open,
    Maintenance,
}

/// Table configuration plus its run-status mirror of the round phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub table_id: u64,
    pub name: String,
    pub status: TableStatus,
    /// Mirror of the current round's phase; Waiting means idle
    pub run_status: RoundPhase,
    pub min_bet: u64,
    pub max_bet: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_id_format() {
        let date = Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap();
        assert_eq!(round_id(7, date, 1), "T007-20260826-001");
        assert_eq!(round_id(123, date, 45), "T123-20260826-045");
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RoundPhase::Finished.is_terminal());
        assert!(RoundPhase::Cancelled.is_terminal());
        assert!(RoundPhase::Failed.is_terminal());
        assert!(!RoundPhase::Betting.is_terminal());
        assert!(!RoundPhase::Dealing.is_terminal());
        assert!(!RoundPhase::Settling.is_terminal());
    }

    #[test]
    fn test_remaining_secs_clamps_at_zero() {
        let start = Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap();
        let round = Round {
            round_id: round_id(1, start, 1),
            table_id: 1,
            phase: RoundPhase::Betting,
            betting_start: start,
            betting_end: start + chrono::Duration::seconds(30),
            dealer_id: None,
            outcome: None,
            created_at: start,
            closed_at: None,
        };
        assert_eq!(round.remaining_secs(start), 30);
        assert_eq!(
            round.remaining_secs(start + chrono::Duration::seconds(12)),
            18
        );
        assert_eq!(
            round.remaining_secs(start + chrono::Duration::seconds(60)),
            0
        );
        assert!(round.window_open(start));
        assert!(!round.window_open(start + chrono::Duration::seconds(31)));
    }
}
