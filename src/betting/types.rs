//! Bet taxonomy and bet records
//!
//! Wire codes:
//! "big" | "small" | "odd" | "even"   flag bets, 1:1
//! "total_N"                          exact three-dice total, N in 4-17
//! "single_N"                         die face N appears, N in 1-6
//! "pair_N"                           face N appears exactly twice, N in 1-6
//! "triple_N"                         all three dice show N, N in 1-6
//! "any_triple"                       any three of a kind
//! "combo_A_B"                        both faces A and B appear, 1 <= A < B <= 6

use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One wagerable category on the sic-bo layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BetType {
    Big,
    Small,
    Odd,
    Even,
    /// Exact total of the three dice (4-17; 3 and 18 are the triple bets)
    Total(u8),
    /// A specific face appears on at least one die
    Single(u8),
    /// A specific face appears on at least two dice
    Pair(u8),
    /// All three dice show this face
    Triple(u8),
    AnyTriple,
    /// Two distinct faces both appear, stored (low, high)
    Combo(u8, u8),
}

impl BetType {
    /// Parse a wire code, rejecting out-of-range parameters
    pub fn from_code(code: &str) -> Result<Self, ValidationError> {
        let unknown = || ValidationError::UnknownBetType(code.to_string());
        match code {
            "big" => return Ok(BetType::Big),
            "small" => return Ok(BetType::Small),
            "odd" => return Ok(BetType::Odd),
            "even" => return Ok(BetType::Even),
            "any_triple" => return Ok(BetType::AnyTriple),
            _ => {}
        }
        if let Some(rest) = code.strip_prefix("total_") {
            let n: u8 = rest.parse().map_err(|_| unknown())?;
            if (4..=17).contains(&n) {
                return Ok(BetType::Total(n));
            }
            return Err(unknown());
        }
        if let Some(rest) = code.strip_prefix("single_") {
            let n: u8 = rest.parse().map_err(|_| unknown())?;
            if (1..=6).contains(&n) {
                return Ok(BetType::Single(n));
            }
            return Err(unknown());
        }
        if let Some(rest) = code.strip_prefix("pair_") {
            let n: u8 = rest.parse().map_err(|_| unknown())?;
            if (1..=6).contains(&n) {
                return Ok(BetType::Pair(n));
            }
            return Err(unknown());
        }
        if let Some(rest) = code.strip_prefix("triple_") {
            let n: u8 = rest.parse().map_err(|_| unknown())?;
            if (1..=6).contains(&n) {
                return Ok(BetType::Triple(n));
            }
            return Err(unknown());
        }
        if let Some(rest) = code.strip_prefix("combo_") {
            let mut parts = rest.splitn(2, '_');
            let a: u8 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(unknown)?;
            let b: u8 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(unknown)?;
            if (1..=6).contains(&a) && (1..=6).contains(&b) && a != b {
                let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                return Ok(BetType::Combo(lo, hi));
            }
            return Err(unknown());
        }
        Err(unknown())
    }

    /// Canonical wire code
    pub fn code(&self) -> String {
        match self {
            BetType::Big => "big".to_string(),
            BetType::Small => "small".to_string(),
            BetType::Odd => "odd".to_string(),
            BetType::Even => "even".to_string(),
            BetType::Total(n) => format!("total_{}", n),
            BetType::Single(n) => format!("single_{}", n),
            BetType::Pair(n) => format!("pair_{}", n),
            BetType::Triple(n) => format!("triple_{}", n),
            BetType::AnyTriple => "any_triple".to_string(),
            BetType::Combo(a, b) => format!("combo_{}_{}", a, b),
        }
    }

    /// Whether settlement recomputes this bet's multiplier from the outcome
    /// instead of honoring the multiplier quoted at placement time
    pub fn multiplier_overridden_at_settlement(&self) -> bool {
        matches!(self, BetType::Single(_))
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl TryFrom<String> for BetType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BetType::from_code(&value)
    }
}

impl From<BetType> for String {
    fn from(value: BetType) -> Self {
        value.code()
    }
}

/// Settlement status of a bet row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Pending,
    Settled,
    Cancelled,
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetStatus::Pending => write!(f, "pending"),
            BetStatus::Settled => write!(f, "settled"),
            BetStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One bet row: (user, round, bet type), never deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: u64,
    pub user_id: u64,
    pub table_id: u64,
    pub round_id: String,
    pub bet_type: BetType,
    pub stake: u64,
    /// Multiplier quoted from the odds table at placement time. Single-die
    /// bets ignore this at settlement (the matching-die count wins out).
    pub quoted_multiplier: u32,
    pub status: BetStatus,
    pub won: bool,
    pub win_amount: u64,
    pub placed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

/// Quoted odds for a bet type
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Odds {
    pub multiplier: u32,
    pub min_bet: u64,
    pub max_bet: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_codes() {
        let types = [
            BetType::Big,
            BetType::Small,
            BetType::Odd,
            BetType::Even,
            BetType::Total(10),
            BetType::Single(5),
            BetType::Pair(3),
            BetType::Triple(6),
            BetType::AnyTriple,
            BetType::Combo(2, 5),
        ];
        for t in types {
            assert_eq!(BetType::from_code(&t.code()).unwrap(), t);
        }
    }

    #[test]
    fn test_combo_normalizes_order() {
        assert_eq!(
            BetType::from_code("combo_5_2").unwrap(),
            BetType::Combo(2, 5)
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        for code in [
            "total_3",
            "total_18",
            "single_0",
            "single_7",
            "pair_9",
            "triple_0",
            "combo_3_3",
            "combo_1_7",
            "banker",
            "total_",
            "combo_2",
        ] {
            assert!(BetType::from_code(code).is_err(), "{} should fail", code);
        }
    }

    #[test]
    fn test_serde_uses_wire_codes() {
        let json = serde_json::to_string(&BetType::Combo(2, 5)).unwrap();
        assert_eq!(json, "\"combo_2_5\"");
        let parsed: BetType = serde_json::from_str("\"single_4\"").unwrap();
        assert_eq!(parsed, BetType::Single(4));
    }

    #[test]
    fn test_single_die_override_flag() {
        assert!(BetType::Single(3).multiplier_overridden_at_settlement());
        assert!(!BetType::Big.multiplier_overridden_at_settlement());
        assert!(!BetType::Triple(3).multiplier_overridden_at_settlement());
    }
}
