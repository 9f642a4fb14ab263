//! Message gateway
//!
//! Everything an inbound frame goes through before it touches game state:
//! size ceiling, rate budget, JSON parse, authentication gate, then dispatch
//! to the owning component. Replies and errors go back through the
//! connection registry so the socket task stays a dumb pump.

pub mod messages;
pub mod rate_limit;

pub use messages::{BetRequest, Inbound, Outbound, RoundSnapshot};
pub use rate_limit::MessageRateLimiter;

use crate::betting::{BetStatus, BettingPipeline};
use crate::config::{ServerConfig, SessionConfig};
use crate::errors::{BusinessError, EngineResult, ValidationError};
use crate::metrics::MetricsRegistry;
use crate::notify::NotificationDispatcher;
use crate::registry::ConnectionRegistry;
use crate::rounds::{RoundMachine, TableStatus};
use crate::stores::{AccountStore, HistoryQuery, IdentityProvider, TableStore, UserIdentity};
use chrono::Utc;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Verified identities, cached by a token digest so a hot reconnect skips
/// the identity provider
struct IdentityCache {
    entries: Mutex<LruCache<String, (UserIdentity, Instant)>>,
    ttl: Duration,
}

impl IdentityCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn key(user_id: u64, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(user_id.to_le_bytes());
        hasher.update(b":");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn get(&self, key: &str) -> Option<UserIdentity> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((identity, cached_at)) if cached_at.elapsed() < self.ttl => {
                Some(identity.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: String, identity: UserIdentity) {
        self.entries.lock().await.put(key, (identity, Instant::now()));
    }
}

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    limiter: MessageRateLimiter,
    identity: Arc<dyn IdentityProvider>,
    accounts: Arc<dyn AccountStore>,
    tables: Arc<dyn TableStore>,
    machine: Arc<RoundMachine>,
    pipeline: Arc<BettingPipeline>,
    notifier: Arc<NotificationDispatcher>,
    metrics: MetricsRegistry,
    identity_cache: IdentityCache,
    session: SessionConfig,
    max_frame_bytes: usize,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        identity: Arc<dyn IdentityProvider>,
        accounts: Arc<dyn AccountStore>,
        tables: Arc<dyn TableStore>,
        machine: Arc<RoundMachine>,
        pipeline: Arc<BettingPipeline>,
        notifier: Arc<NotificationDispatcher>,
        metrics: MetricsRegistry,
        session: SessionConfig,
        server: &ServerConfig,
    ) -> Self {
        Self {
            registry,
            limiter: MessageRateLimiter::new(session.messages_per_minute),
            identity,
            accounts,
            tables,
            machine,
            pipeline,
            notifier,
            metrics,
            identity_cache: IdentityCache::new(
                session.identity_cache_size,
                Duration::from_secs(session.identity_cache_ttl_secs),
            ),
            session,
            max_frame_bytes: server.max_frame_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    fn send(&self, conn_id: Uuid, frame: &Outbound) {
        if self.registry.unicast(conn_id, frame) {
            MetricsRegistry::incr(&self.metrics.messages_sent_total);
        }
    }

    fn send_error(&self, conn_id: Uuid, err: &crate::errors::EngineError, request: &str) {
        MetricsRegistry::incr(&self.metrics.messages_rejected_total);
        self.send(conn_id, &Outbound::error_for(err, Some(request)));
    }

    /// New socket accepted: register it and greet the client
    pub fn on_connect(
        &self,
        addr: std::net::SocketAddr,
        sender: tokio::sync::mpsc::UnboundedSender<Outbound>,
    ) -> Uuid {
        let conn_id = self.registry.register(addr, sender);
        MetricsRegistry::set(
            &self.metrics.connections_active,
            self.registry.connection_count() as u64,
        );
        self.send(
            conn_id,
            &Outbound::Welcome {
                connection_id: conn_id.to_string(),
                server_time: Utc::now(),
            },
        );
        conn_id
    }

    /// Socket closed or swept: clean up and tell the table
    pub fn on_disconnect(&self, conn_id: Uuid) {
        self.limiter.forget(conn_id);
        if let Some(dropped) = self.registry.unregister(conn_id) {
            if let (Some(table_id), Some(user_id)) = (dropped.table_id, dropped.user_id) {
                let nickname = dropped.nickname.unwrap_or_default();
                self.notifier.presence_left(table_id, user_id, &nickname);
            }
        }
        MetricsRegistry::set(
            &self.metrics.connections_active,
            self.registry.connection_count() as u64,
        );
        MetricsRegistry::set(
            &self.metrics.sessions_authenticated,
            self.registry.authenticated_count() as u64,
        );
    }

    /// One inbound text frame, end to end
    pub async fn handle_frame(&self, conn_id: Uuid, text: &str) {
        MetricsRegistry::incr(&self.metrics.messages_received_total);

        if text.len() > self.max_frame_bytes {
            let err = ValidationError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_bytes,
            }
            .into();
            self.send_error(conn_id, &err, "frame");
            return;
        }
        if !self.limiter.allow(conn_id) {
            let err = BusinessError::RateLimited {
                limit: self.limiter.limit(),
                window_secs: self.limiter.window_secs(),
            }
            .into();
            self.send_error(conn_id, &err, "frame");
            return;
        }
        self.registry.touch(conn_id);

        let frame: Inbound = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = ValidationError::BadMessage(err.to_string()).into();
                self.send_error(conn_id, &err, "frame");
                return;
            }
        };

        let name = frame_name(&frame);
        if let Err(err) = self.dispatch(conn_id, frame).await {
            self.send_error(conn_id, &err, name);
        }
    }

    /// Identity and seat, or AUTH_REQUIRED
    fn authed(&self, conn_id: Uuid) -> EngineResult<(u64, Option<u64>)> {
        match self.registry.snapshot(conn_id) {
            Some(snapshot) => match snapshot.user_id {
                Some(user_id) => Ok((user_id, snapshot.table_id)),
                None => Err(BusinessError::AuthRequired.into()),
            },
            None => Err(BusinessError::AuthRequired.into()),
        }
    }

    fn seated(&self, conn_id: Uuid) -> EngineResult<(u64, u64)> {
        let (user_id, table_id) = self.authed(conn_id)?;
        let table_id = table_id.ok_or(BusinessError::NotAtTable)?;
        Ok((user_id, table_id))
    }

    async fn dispatch(&self, conn_id: Uuid, frame: Inbound) -> EngineResult<()> {
        match frame {
            Inbound::Ping => {
                self.send(conn_id, &Outbound::Pong);
                Ok(())
            }
            Inbound::Auth { user_id, token } => self.handle_auth(conn_id, user_id, &token).await,
            Inbound::Logout => {
                if let Some(dropped) = self.registry.logout(conn_id) {
                    if let (Some(table_id), Some(user_id)) = (dropped.table_id, dropped.user_id) {
                        let nickname = dropped.nickname.unwrap_or_default();
                        self.notifier.presence_left(table_id, user_id, &nickname);
                    }
                }
                MetricsRegistry::set(
                    &self.metrics.sessions_authenticated,
                    self.registry.authenticated_count() as u64,
                );
                self.send(conn_id, &Outbound::LogoutSuccess);
                Ok(())
            }
            Inbound::JoinTable { table_id } => self.handle_join(conn_id, table_id).await,
            Inbound::LeaveTable => {
                let (user_id, _) = self.authed(conn_id)?;
                let table_id = self
                    .registry
                    .leave_table(conn_id)
                    .ok_or(BusinessError::NotAtTable)?;
                if let Some(snapshot) = self.registry.snapshot(conn_id) {
                    let nickname = snapshot.nickname.unwrap_or_default();
                    self.notifier.presence_left(table_id, user_id, &nickname);
                }
                self.send(conn_id, &Outbound::LeaveTableSuccess { table_id });
                Ok(())
            }
            Inbound::GameStatus => {
                let (_, table_id) = self.seated(conn_id)?;
                let round = self.machine.current_round(table_id).await?;
                let now = Utc::now();
                self.send(
                    conn_id,
                    &Outbound::GameStatusSnapshot {
                        table_id,
                        round: round.map(|r| RoundSnapshot::from_round(&r, now)),
                    },
                );
                Ok(())
            }
            Inbound::PlaceBet {
                round_id,
                bets,
                total_amount,
            }
            | Inbound::ModifyBet {
                round_id,
                bets,
                total_amount,
            } => {
                let (user_id, table_id) = self.seated(conn_id)?;
                let receipt = self
                    .pipeline
                    .place_bets(user_id, table_id, &round_id, &bets, total_amount)
                    .await?;
                self.send(
                    conn_id,
                    &Outbound::BetAccepted {
                        round_id,
                        bets: receipt.accepted,
                        total_stake: receipt.total_stake,
                        refund_from_prior_bets: receipt.refund_from_prior_bets,
                        balance: receipt.new_balance,
                    },
                );
                Ok(())
            }
            Inbound::CancelBet { round_id } => {
                let (user_id, table_id) = self.seated(conn_id)?;
                let receipt = self
                    .pipeline
                    .cancel_bets(user_id, table_id, &round_id)
                    .await?;
                self.send(
                    conn_id,
                    &Outbound::CancelSuccess {
                        round_id,
                        cancelled: receipt.cancelled,
                        refund: receipt.refund,
                        balance: receipt.new_balance,
                    },
                );
                Ok(())
            }
            Inbound::GetCurrentBets => {
                let (user_id, table_id) = self.seated(conn_id)?;
                let round = self
                    .machine
                    .current_round(table_id)
                    .await?
                    .ok_or(BusinessError::RoundNotFound(table_id))?;
                let bets: Vec<_> = self
                    .accounts
                    .user_round_bets(user_id, &round.round_id)
                    .await?
                    .into_iter()
                    .filter(|b| b.status == BetStatus::Pending)
                    .collect();
                self.send(
                    conn_id,
                    &Outbound::CurrentBets {
                        round_id: round.round_id,
                        bets,
                    },
                );
                Ok(())
            }
            Inbound::GetBetHistory {
                page,
                limit,
                table_id,
                status,
            } => {
                let (user_id, _) = self.authed(conn_id)?;
                let history = self
                    .accounts
                    .bet_history(HistoryQuery {
                        user_id,
                        page,
                        limit,
                        table_id,
                        status,
                    })
                    .await?;
                self.send(
                    conn_id,
                    &Outbound::BetHistory {
                        bets: history.bets,
                        total: history.total,
                        page: history.page,
                        limit: history.limit,
                    },
                );
                Ok(())
            }
        }
    }

    async fn handle_auth(&self, conn_id: Uuid, user_id: u64, token: &str) -> EngineResult<()> {
        let cache_key = IdentityCache::key(user_id, token);
        let identity = match self.identity_cache.get(&cache_key).await {
            Some(identity) => identity,
            None => {
                let identity = self
                    .identity
                    .verify(user_id, token)
                    .await?
                    .ok_or(BusinessError::AuthFailed(user_id))?;
                self.identity_cache.put(cache_key, identity.clone()).await;
                identity
            }
        };

        if let Some(evicted) = self.registry.authenticate(conn_id, &identity) {
            // The user logged in somewhere else: the old session is told
            // and then dropped
            self.send(evicted, &Outbound::SessionReplaced);
            if let Some(dropped) = self.registry.unregister(evicted) {
                if let Some(table_id) = dropped.table_id {
                    let nickname = dropped.nickname.unwrap_or_default();
                    self.notifier.presence_left(table_id, user_id, &nickname);
                }
            }
        }

        let balance = self
            .accounts
            .account(user_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0);
        let frozen = self.accounts.frozen_amount(user_id).await?;
        MetricsRegistry::set(
            &self.metrics.sessions_authenticated,
            self.registry.authenticated_count() as u64,
        );
        tracing::info!(user_id, %conn_id, "authenticated");
        self.send(
            conn_id,
            &Outbound::AuthSuccess {
                user_id,
                nickname: identity.nickname,
                balance,
                frozen,
            },
        );
        Ok(())
    }

    async fn handle_join(&self, conn_id: Uuid, table_id: u64) -> EngineResult<()> {
        let (user_id, _) = self.authed(conn_id)?;
        let table = self
            .tables
            .table(table_id)
            .await?
            .ok_or(BusinessError::TableNotFound(table_id))?;
        if table.status != TableStatus::Open {
            return Err(BusinessError::TableClosed(table_id).into());
        }

        let nickname = self
            .registry
            .snapshot(conn_id)
            .and_then(|s| s.nickname)
            .unwrap_or_default();
        if let Some(prior) = self.registry.join_table(conn_id, table_id) {
            self.notifier.presence_left(prior, user_id, &nickname);
        }
        self.notifier
            .presence_joined(table_id, user_id, &nickname, conn_id);

        let round = self.machine.current_round(table_id).await?;
        let now = Utc::now();
        self.send(
            conn_id,
            &Outbound::JoinTableSuccess {
                table_id,
                table_name: table.name,
                population: self.registry.table_population(table_id),
                round: round.map(|r| RoundSnapshot::from_round(&r, now)),
            },
        );
        Ok(())
    }

    /// Periodic sweep of dead connections plus limiter upkeep
    pub fn sweep(&self) {
        let dropped = self.registry.sweep(
            Duration::from_secs(self.session.auth_grace_secs),
            Duration::from_secs(self.session.idle_timeout_secs),
        );
        for connection in &dropped {
            self.limiter.forget(connection.conn_id);
            if let (Some(table_id), Some(user_id)) = (connection.table_id, connection.user_id) {
                let nickname = connection.nickname.clone().unwrap_or_default();
                self.notifier.presence_left(table_id, user_id, &nickname);
            }
        }
        if !dropped.is_empty() {
            MetricsRegistry::add(&self.metrics.connections_swept_total, dropped.len() as u64);
        }
        self.limiter.cleanup();
        self.pipeline.cleanup();
        MetricsRegistry::set(
            &self.metrics.connections_active,
            self.registry.connection_count() as u64,
        );
        MetricsRegistry::set(
            &self.metrics.sessions_authenticated,
            self.registry.authenticated_count() as u64,
        );
    }
}

fn frame_name(frame: &Inbound) -> &'static str {
    match frame {
        Inbound::Ping => "ping",
        Inbound::Auth { .. } => "auth",
        Inbound::Logout => "logout",
        Inbound::JoinTable { .. } => "join_table",
        Inbound::LeaveTable => "leave_table",
        Inbound::GameStatus => "game_status",
        Inbound::PlaceBet { .. } => "place_bet",
        Inbound::ModifyBet { .. } => "modify_bet",
        Inbound::CancelBet { .. } => "cancel_bet",
        Inbound::GetCurrentBets => "get_current_bets",
        Inbound::GetBetHistory { .. } => "get_bet_history",
    }
}
