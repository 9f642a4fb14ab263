//! Table ticker
//!
//! One periodic task drives every table with seated players: it emits
//! countdown frames at the configured thresholds and closes the betting
//! window when the clock runs out. Threshold dedup state is kept per round
//! and evicted an hour after the round is first seen, so a long-running
//! process does not accumulate old rounds.

use super::machine::RoundMachine;
use super::round::RoundPhase;
use crate::config::RoundsConfig;
use crate::notify::NotificationDispatcher;
use crate::registry::ConnectionRegistry;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::interval;

struct CountdownState {
    fired: HashSet<u64>,
    first_seen: Instant,
}

pub struct TableTicker {
    machine: Arc<RoundMachine>,
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<NotificationDispatcher>,
    config: RoundsConfig,
    countdowns: DashMap<String, CountdownState>,
}

impl TableTicker {
    pub fn new(
        machine: Arc<RoundMachine>,
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<NotificationDispatcher>,
        config: RoundsConfig,
    ) -> Self {
        Self {
            machine,
            registry,
            notifier,
            config,
            countdowns: DashMap::new(),
        }
    }

    /// One pass over every table with seated players
    pub async fn tick(&self) {
        for table_id in self.registry.active_table_ids() {
            if let Err(err) = self.tick_table(table_id).await {
                tracing::warn!(table_id, error = %err, "tick failed");
            }
        }
        self.evict_stale();
    }

    async fn tick_table(&self, table_id: u64) -> crate::errors::EngineResult<()> {
        let round = match self.machine.current_round(table_id).await? {
            Some(round) if round.phase == RoundPhase::Betting => round,
            _ => return Ok(()),
        };
        let remaining = round.remaining_secs(Utc::now());

        if remaining == 0 {
            // The window may have been closed by an operator between the
            // lookup and now; a phase mismatch here is not an error
            match self.machine.stop_betting(table_id).await {
                Ok(_) => {}
                Err(err) if err.code() == "PHASE_MISMATCH" => {}
                Err(err) => return Err(err),
            }
            return Ok(());
        }

        // Emit at most one countdown per tick; mark every threshold the
        // clock has passed so none fires twice
        let mut state = self
            .countdowns
            .entry(round.round_id.clone())
            .or_insert_with(|| CountdownState {
                fired: HashSet::new(),
                first_seen: Instant::now(),
            });
        let due: Vec<u64> = self
            .config
            .countdown_thresholds
            .iter()
            .copied()
            .filter(|t| remaining <= *t && !state.fired.contains(t))
            .collect();
        if !due.is_empty() {
            for t in &due {
                state.fired.insert(*t);
            }
            drop(state);
            self.notifier.countdown(table_id, &round.round_id, remaining);
        }
        Ok(())
    }

    fn evict_stale(&self) {
        let horizon = self.config.dedup_eviction();
        self.countdowns
            .retain(|_, state| state.first_seen.elapsed() < horizon);
    }

    /// Run the ticker until the process shuts down
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = interval(self.config.tick_interval());
            loop {
                ticks.tick().await;
                self.tick().await;
            }
        })
    }
}
