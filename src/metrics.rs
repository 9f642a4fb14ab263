//! Engine metrics
//!
//! Atomic counters and gauges exported in Prometheus text format via the
//! /metrics endpoint. Counters only ever go up; gauges mirror live state.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone)]
pub struct MetricsRegistry {
    /// Gateway
    pub connections_active: Arc<AtomicU64>,
    pub sessions_authenticated: Arc<AtomicU64>,
    pub messages_received_total: Arc<AtomicU64>,
    pub messages_sent_total: Arc<AtomicU64>,
    pub messages_rejected_total: Arc<AtomicU64>,

    /// Betting
    pub bets_placed_total: Arc<AtomicU64>,
    pub bets_cancelled_total: Arc<AtomicU64>,
    pub bets_rejected_total: Arc<AtomicU64>,
    pub stake_accepted_total: Arc<AtomicU64>,

    /// Rounds and settlement
    pub rounds_started_total: Arc<AtomicU64>,
    pub rounds_settled_total: Arc<AtomicU64>,
    pub rounds_cancelled_total: Arc<AtomicU64>,
    pub settlement_failures_total: Arc<AtomicU64>,
    pub payout_total: Arc<AtomicU64>,
    pub rebate_total: Arc<AtomicU64>,

    /// Infrastructure
    pub lock_contention_total: Arc<AtomicU64>,
    pub connections_swept_total: Arc<AtomicU64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            connections_active: Arc::new(AtomicU64::new(0)),
            sessions_authenticated: Arc::new(AtomicU64::new(0)),
            messages_received_total: Arc::new(AtomicU64::new(0)),
            messages_sent_total: Arc::new(AtomicU64::new(0)),
            messages_rejected_total: Arc::new(AtomicU64::new(0)),

            bets_placed_total: Arc::new(AtomicU64::new(0)),
            bets_cancelled_total: Arc::new(AtomicU64::new(0)),
            bets_rejected_total: Arc::new(AtomicU64::new(0)),
            stake_accepted_total: Arc::new(AtomicU64::new(0)),

            rounds_started_total: Arc::new(AtomicU64::new(0)),
            rounds_settled_total: Arc::new(AtomicU64::new(0)),
            rounds_cancelled_total: Arc::new(AtomicU64::new(0)),
            settlement_failures_total: Arc::new(AtomicU64::new(0)),
            payout_total: Arc::new(AtomicU64::new(0)),
            rebate_total: Arc::new(AtomicU64::new(0)),

            lock_contention_total: Arc::new(AtomicU64::new(0)),
            connections_swept_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn to_prometheus_format(&self) -> String {
        let mut output = String::new();
        let mut write = |name: &str, kind: &str, help: &str, value: u64| {
            output.push_str(&format!(
                "# HELP dicehall_{name} {help}\n# TYPE dicehall_{name} {kind}\ndicehall_{name} {value}\n\n"
            ));
        };

        write(
            "connections_active",
            "gauge",
            "Currently open WebSocket connections",
            self.connections_active.load(Ordering::Relaxed),
        );
        write(
            "sessions_authenticated",
            "gauge",
            "Currently authenticated sessions",
            self.sessions_authenticated.load(Ordering::Relaxed),
        );
        write(
            "messages_received_total",
            "counter",
            "Inbound frames received",
            self.messages_received_total.load(Ordering::Relaxed),
        );
        write(
            "messages_sent_total",
            "counter",
            "Outbound frames sent",
            self.messages_sent_total.load(Ordering::Relaxed),
        );
        write(
            "messages_rejected_total",
            "counter",
            "Inbound frames rejected before dispatch",
            self.messages_rejected_total.load(Ordering::Relaxed),
        );
        write(
            "bets_placed_total",
            "counter",
            "Bets accepted",
            self.bets_placed_total.load(Ordering::Relaxed),
        );
        write(
            "bets_cancelled_total",
            "counter",
            "Bets cancelled by users",
            self.bets_cancelled_total.load(Ordering::Relaxed),
        );
        write(
            "bets_rejected_total",
            "counter",
            "Bet placements rejected",
            self.bets_rejected_total.load(Ordering::Relaxed),
        );
        write(
            "stake_accepted_total",
            "counter",
            "Total stake accepted, minor units",
            self.stake_accepted_total.load(Ordering::Relaxed),
        );
        write(
            "rounds_started_total",
            "counter",
            "Rounds opened for betting",
            self.rounds_started_total.load(Ordering::Relaxed),
        );
        write(
            "rounds_settled_total",
            "counter",
            "Rounds settled successfully",
            self.rounds_settled_total.load(Ordering::Relaxed),
        );
        write(
            "rounds_cancelled_total",
            "counter",
            "Rounds cancelled with refunds",
            self.rounds_cancelled_total.load(Ordering::Relaxed),
        );
        write(
            "settlement_failures_total",
            "counter",
            "Settlement commits that failed and rolled back",
            self.settlement_failures_total.load(Ordering::Relaxed),
        );
        write(
            "payout_total",
            "counter",
            "Total winnings credited, minor units",
            self.payout_total.load(Ordering::Relaxed),
        );
        write(
            "rebate_total",
            "counter",
            "Total rebates credited, minor units",
            self.rebate_total.load(Ordering::Relaxed),
        );
        write(
            "lock_contention_total",
            "counter",
            "Placement lock acquisitions that timed out",
            self.lock_contention_total.load(Ordering::Relaxed),
        );
        write(
            "connections_swept_total",
            "counter",
            "Connections dropped by the idle sweep",
            self.connections_swept_total.load(Ordering::Relaxed),
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        MetricsRegistry::incr(&metrics.bets_placed_total);
        MetricsRegistry::add(&metrics.stake_accepted_total, 150);
        MetricsRegistry::set(&metrics.connections_active, 3);

        let text = metrics.to_prometheus_format();
        assert!(text.contains("dicehall_bets_placed_total 1"));
        assert!(text.contains("dicehall_stake_accepted_total 150"));
        assert!(text.contains("dicehall_connections_active 3"));
        assert!(text.contains("# TYPE dicehall_connections_active gauge"));
    }
}
