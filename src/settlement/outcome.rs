//! Dice outcome derivation
//!
//! An outcome is created once per round when the dice are revealed and is
//! immutable afterwards. The winning-bet-type set is computed here and only
//! here, so settlement, notifications, and history all agree on it.

use crate::betting::BetType;
use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// Immutable record of a revealed roll and everything derived from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiceOutcome {
    pub dice: [u8; 3],
    pub total: u8,
    pub is_big: bool,
    pub is_odd: bool,
    pub has_pair: bool,
    pub has_triple: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triple_value: Option<u8>,
    /// Complete set of bet types that pay for this roll
    pub winning_bet_types: Vec<BetType>,
}

impl DiceOutcome {
    /// Derive the full outcome from three die values
    pub fn derive(d1: u8, d2: u8, d3: u8) -> Result<Self, ValidationError> {
        for d in [d1, d2, d3] {
            if !(1..=6).contains(&d) {
                return Err(ValidationError::InvalidDie(d));
            }
        }

        let dice = [d1, d2, d3];
        let total = d1 + d2 + d3;
        let is_big = total >= 11;
        let is_odd = total % 2 == 1;

        // counts[face - 1] = how many dice show that face
        let mut counts = [0u8; 6];
        for d in dice {
            counts[(d - 1) as usize] += 1;
        }
        let triple_value = counts
            .iter()
            .position(|&c| c == 3)
            .map(|i| (i + 1) as u8);
        let has_triple = triple_value.is_some();
        let has_pair = counts.iter().any(|&c| c == 2);

        let winning_bet_types = Self::winning_set(total, is_big, is_odd, &counts, triple_value);

        Ok(Self {
            dice,
            total,
            is_big,
            is_odd,
            has_pair,
            has_triple,
            triple_value,
            winning_bet_types,
        })
    }

    /// The deterministic winning set: exactly one big/small flag, one
    /// odd/even flag, one exact-total entry, one single entry per distinct
    /// face, a pair entry per face appearing exactly twice, the triple
    /// entries iff all three match, and a combo entry per unordered pair of
    /// distinct faces.
    fn winning_set(
        total: u8,
        is_big: bool,
        is_odd: bool,
        counts: &[u8; 6],
        triple_value: Option<u8>,
    ) -> Vec<BetType> {
        let mut set = Vec::with_capacity(12);

        set.push(if is_big { BetType::Big } else { BetType::Small });
        set.push(if is_odd { BetType::Odd } else { BetType::Even });
        set.push(BetType::Total(total));

        let faces: Vec<u8> = (1..=6u8)
            .filter(|&f| counts[(f - 1) as usize] > 0)
            .collect();

        for &f in &faces {
            set.push(BetType::Single(f));
        }
        for &f in &faces {
            if counts[(f - 1) as usize] == 2 {
                set.push(BetType::Pair(f));
            }
        }
        if let Some(v) = triple_value {
            set.push(BetType::Triple(v));
            set.push(BetType::AnyTriple);
        }
        for (i, &a) in faces.iter().enumerate() {
            for &b in &faces[i + 1..] {
                set.push(BetType::Combo(a, b));
            }
        }

        set
    }

    /// Membership test against the winning set
    pub fn pays(&self, bet_type: &BetType) -> bool {
        self.winning_bet_types.contains(bet_type)
    }

    /// How many dice show the given face; drives the single-die payout
    pub fn face_count(&self, face: u8) -> u8 {
        self.dice.iter().filter(|&&d| d == face).count() as u8
    }
}
