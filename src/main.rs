//! dicehall server binary
//!
//! Wires the in-memory stores to the engine, seeds a demo table and
//! accounts, and serves until interrupted.

use clap::Parser;
use dicehall::betting::BettingPipeline;
use dicehall::config::DicehallConfig;
use dicehall::gateway::Gateway;
use dicehall::metrics::MetricsRegistry;
use dicehall::notify::NotificationDispatcher;
use dicehall::registry::ConnectionRegistry;
use dicehall::rounds::{RoundMachine, RoundPhase, Table, TableStatus, TableTicker};
use dicehall::server::{AppState, DicehallServer};
use dicehall::settlement::SettlementEngine;
use dicehall::stores::{
    Account, KeyedLockManager, MemoryAccountStore, MemoryFastCache, MemoryIdentityProvider,
    MemoryRoundStore, MemoryTableStore, StaticOddsProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dicehall", about = "Live dice betting table server")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,

    /// Skip seeding the demo accounts
    #[arg(long)]
    no_demo_accounts: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dicehall=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DicehallConfig::load(path)?,
        None => DicehallConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    // In-memory backends; a multi-node deployment swaps these for shared
    // implementations of the same traits
    let accounts = Arc::new(MemoryAccountStore::new());
    let tables = Arc::new(MemoryTableStore::new());
    let rounds = Arc::new(MemoryRoundStore::new());
    let cache = Arc::new(MemoryFastCache::new());
    let identity = Arc::new(MemoryIdentityProvider::new());
    let odds = Arc::new(StaticOddsProvider);
    let locks = Arc::new(KeyedLockManager::new());

    tables.insert_table(Table {
        table_id: 1,
        name: "Main Floor".to_string(),
        status: TableStatus::Open,
        run_status: RoundPhase::Waiting,
        min_bet: 10,
        max_bet: 100_000,
    });
    info!("seeded table 1 (Main Floor)");

    if !cli.no_demo_accounts {
        for user_id in 1001..=1005u64 {
            accounts
                .insert_account(Account {
                    user_id,
                    balance: 1_000_000,
                    active: true,
                    blacklisted: false,
                })
                .await;
            identity.register(user_id, &format!("demo-{user_id}"), &format!("player{user_id}"));
        }
        info!("seeded demo accounts 1001-1005 (token: demo-<user_id>)");
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let notifier = Arc::new(NotificationDispatcher::new(registry.clone()));
    let metrics = MetricsRegistry::new();

    let settlement = Arc::new(SettlementEngine::new(
        accounts.clone(),
        odds.clone(),
        notifier.clone(),
        metrics.clone(),
        config.settlement.clone(),
    ));
    let machine = Arc::new(RoundMachine::new(
        tables.clone(),
        rounds,
        cache,
        accounts.clone(),
        settlement,
        notifier.clone(),
        metrics.clone(),
        config.rounds.clone(),
    ));
    let pipeline = Arc::new(BettingPipeline::new(
        accounts.clone(),
        odds,
        machine.clone(),
        locks,
        metrics.clone(),
        config.betting.clone(),
    ));
    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        identity,
        accounts,
        tables,
        machine.clone(),
        pipeline,
        notifier.clone(),
        metrics.clone(),
        config.session.clone(),
        &config.server,
    ));
    let ticker = Arc::new(TableTicker::new(
        machine.clone(),
        registry,
        notifier.clone(),
        config.rounds.clone(),
    ));

    let state = AppState {
        gateway,
        machine,
        notifier,
        metrics,
    };
    DicehallServer::new(config, state, ticker).run().await
}
