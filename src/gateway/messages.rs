//! Wire messages for the WebSocket gateway
//!
//! Every frame is a JSON object tagged by `type`. Inbound frames are what
//! clients may send; outbound frames cover direct replies, table broadcasts,
//! and server-initiated pushes. Unknown inbound types fail deserialization
//! and come back as a BAD_MESSAGE error frame.

use crate::betting::{Bet, BetStatus, BetType};
use crate::errors::ErrorBody;
use crate::rounds::{Round, RoundPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One requested bet inside a place_bet frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetRequest {
    pub bet_type: String,
    pub amount: u64,
}

/// Client-to-server frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Ping,
    Auth {
        user_id: u64,
        token: String,
    },
    Logout,
    JoinTable {
        table_id: u64,
    },
    LeaveTable,
    GameStatus,
    PlaceBet {
        round_id: String,
        bets: Vec<BetRequest>,
        total_amount: u64,
    },
    /// Same semantics as place_bet: prior pending bets in the round are
    /// refunded and replaced in one transaction
    ModifyBet {
        round_id: String,
        bets: Vec<BetRequest>,
        total_amount: u64,
    },
    CancelBet {
        round_id: String,
    },
    GetCurrentBets,
    GetBetHistory {
        #[serde(default = "default_page")]
        page: usize,
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        table_id: Option<u64>,
        #[serde(default)]
        status: Option<BetStatus>,
    },
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

/// Client-facing view of a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round_id: String,
    pub phase: RoundPhase,
    pub remaining_time: u64,
    pub betting_end: DateTime<Utc>,
}

impl RoundSnapshot {
    pub fn from_round(round: &Round, now: DateTime<Utc>) -> Self {
        Self {
            round_id: round.round_id.clone(),
            phase: round.phase,
            remaining_time: round.remaining_secs(now),
            betting_end: round.betting_end,
        }
    }
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Welcome {
        connection_id: String,
        server_time: DateTime<Utc>,
    },
    Pong,
    AuthSuccess {
        user_id: u64,
        nickname: String,
        balance: u64,
        /// Stake currently held in pending bets
        frozen: u64,
    },
    LogoutSuccess,
    Error {
        #[serde(flatten)]
        body: ErrorBody,
        /// Echo of the inbound type the error is answering, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        request: Option<String>,
    },
    JoinTableSuccess {
        table_id: u64,
        table_name: String,
        population: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<RoundSnapshot>,
    },
    LeaveTableSuccess {
        table_id: u64,
    },
    UserJoined {
        user_id: u64,
        nickname: String,
    },
    UserLeft {
        user_id: u64,
        nickname: String,
    },
    GameStatusSnapshot {
        table_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        round: Option<RoundSnapshot>,
    },
    GameStart {
        table_id: u64,
        round_id: String,
        betting_time: u64,
        betting_end: DateTime<Utc>,
    },
    Countdown {
        table_id: u64,
        round_id: String,
        remaining_time: u64,
    },
    BettingEnd {
        table_id: u64,
        round_id: String,
    },
    GameResult {
        table_id: u64,
        round_id: String,
        dice: [u8; 3],
        total: u8,
        is_big: bool,
        is_odd: bool,
        has_pair: bool,
        has_triple: bool,
        winning_bet_types: Vec<BetType>,
    },
    RoundCancelled {
        table_id: u64,
        round_id: String,
    },
    BetAccepted {
        round_id: String,
        bets: Vec<Bet>,
        total_stake: u64,
        refund_from_prior_bets: u64,
        balance: u64,
    },
    CancelSuccess {
        round_id: String,
        cancelled: usize,
        refund: u64,
        balance: u64,
    },
    CurrentBets {
        round_id: String,
        bets: Vec<Bet>,
    },
    BetHistory {
        bets: Vec<Bet>,
        total: usize,
        page: usize,
        limit: usize,
    },
    PersonalSettlement {
        round_id: String,
        bet_count: usize,
        win_count: usize,
        total_stake: u64,
        total_win: u64,
        rebate: u64,
        net_result: i64,
        balance: u64,
    },
    BalanceUpdate {
        balance: u64,
        change_amount: i64,
        reason: String,
    },
    Heartbeat {
        server_time: DateTime<Utc>,
    },
    SessionReplaced,
}

impl Outbound {
    /// Error frame answering a specific inbound type
    pub fn error_for(err: &crate::errors::EngineError, request: Option<&str>) -> Self {
        Outbound::Error {
            body: err.to_body(),
            request: request.map(|s| s.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_parses_tagged_frames() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, Inbound::Ping));

        let msg: Inbound =
            serde_json::from_str(r#"{"type":"auth","user_id":42,"token":"t0k"}"#).unwrap();
        assert!(matches!(msg, Inbound::Auth { user_id: 42, .. }));

        let msg: Inbound = serde_json::from_str(
            r#"{"type":"place_bet","round_id":"T001-20260826-001",
                "bets":[{"bet_type":"big","amount":100},{"bet_type":"total_10","amount":50}],
                "total_amount":150}"#,
        )
        .unwrap();
        match msg {
            Inbound::PlaceBet {
                bets, total_amount, ..
            } => {
                assert_eq!(bets.len(), 2);
                assert_eq!(total_amount, 150);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_history_defaults() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"get_bet_history"}"#).unwrap();
        match msg {
            Inbound::GetBetHistory { page, limit, .. } => {
                assert_eq!(page, 1);
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_outbound_error_flattens_body() {
        let err = crate::errors::EngineError::Business(crate::errors::BusinessError::WindowClosed);
        let frame = Outbound::error_for(&err, Some("place_bet"));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("WINDOW_CLOSED"));
        assert!(json.contains("place_bet"));
    }

    #[test]
    fn test_game_result_shape() {
        let frame = Outbound::GameResult {
            table_id: 1,
            round_id: "T001-20260826-001".to_string(),
            dice: [4, 5, 6],
            total: 15,
            is_big: true,
            is_odd: true,
            has_pair: false,
            has_triple: false,
            winning_bet_types: vec![BetType::Big, BetType::Total(15)],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"game_result""#));
        assert!(json.contains(r#""total_15""#));
    }
}
