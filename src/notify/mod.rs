//! Notification dispatcher
//!
//! Translates engine events into outbound frames and fans them out through
//! the connection registry. Table events reach everyone seated at the table;
//! personal events go to the owning user's live session. Delivery failures
//! are swallowed: a dead socket never stalls a settlement or a tick.

use crate::gateway::Outbound;
use crate::registry::ConnectionRegistry;
use crate::rounds::Round;
use crate::settlement::DiceOutcome;
use chrono::Utc;
use std::sync::Arc;

pub struct NotificationDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn round_started(&self, round: &Round) {
        let now = Utc::now();
        self.registry.multicast_table(
            round.table_id,
            &Outbound::GameStart {
                table_id: round.table_id,
                round_id: round.round_id.clone(),
                betting_time: round.remaining_secs(now),
                betting_end: round.betting_end,
            },
            None,
        );
    }

    pub fn countdown(&self, table_id: u64, round_id: &str, remaining_time: u64) {
        self.registry.multicast_table(
            table_id,
            &Outbound::Countdown {
                table_id,
                round_id: round_id.to_string(),
                remaining_time,
            },
            None,
        );
    }

    pub fn betting_ended(&self, table_id: u64, round_id: &str) {
        self.registry.multicast_table(
            table_id,
            &Outbound::BettingEnd {
                table_id,
                round_id: round_id.to_string(),
            },
            None,
        );
    }

    pub fn game_result(&self, table_id: u64, round_id: &str, outcome: &DiceOutcome) {
        self.registry.multicast_table(
            table_id,
            &Outbound::GameResult {
                table_id,
                round_id: round_id.to_string(),
                dice: outcome.dice,
                total: outcome.total,
                is_big: outcome.is_big,
                is_odd: outcome.is_odd,
                has_pair: outcome.has_pair,
                has_triple: outcome.has_triple,
                winning_bet_types: outcome.winning_bet_types.clone(),
            },
            None,
        );
    }

    pub fn round_cancelled(&self, table_id: u64, round_id: &str) {
        self.registry.multicast_table(
            table_id,
            &Outbound::RoundCancelled {
                table_id,
                round_id: round_id.to_string(),
            },
            None,
        );
    }

    /// Per-user settlement summary, delivered to the user's live session
    #[allow(clippy::too_many_arguments)]
    pub fn personal_settlement(
        &self,
        user_id: u64,
        round_id: &str,
        bet_count: usize,
        win_count: usize,
        total_stake: u64,
        total_win: u64,
        rebate: u64,
        balance: u64,
    ) {
        let net_result = total_win as i64 + rebate as i64 - total_stake as i64;
        let delivered = self.registry.send_to_user(
            user_id,
            &Outbound::PersonalSettlement {
                round_id: round_id.to_string(),
                bet_count,
                win_count,
                total_stake,
                total_win,
                rebate,
                net_result,
                balance,
            },
        );
        if !delivered {
            tracing::debug!(user_id, round_id, "settlement notice for offline user dropped");
        }
    }

    pub fn balance_update(&self, user_id: u64, balance: u64, change_amount: i64, reason: &str) {
        let _ = self.registry.send_to_user(
            user_id,
            &Outbound::BalanceUpdate {
                balance,
                change_amount,
                reason: reason.to_string(),
            },
        );
    }

    pub fn presence_joined(&self, table_id: u64, user_id: u64, nickname: &str, actor: uuid::Uuid) {
        self.registry.multicast_table(
            table_id,
            &Outbound::UserJoined {
                user_id,
                nickname: nickname.to_string(),
            },
            Some(actor),
        );
    }

    pub fn presence_left(&self, table_id: u64, user_id: u64, nickname: &str) {
        self.registry.multicast_table(
            table_id,
            &Outbound::UserLeft {
                user_id,
                nickname: nickname.to_string(),
            },
            None,
        );
    }

    pub fn heartbeat(&self) {
        self.registry.broadcast_all(&Outbound::Heartbeat {
            server_time: Utc::now(),
        });
    }
}
