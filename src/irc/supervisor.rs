/// Top-level coordinator: owns the session map and routes control-plane
/// operations to the right session, creating sessions on demand from the
/// per-server configuration (or the fallback). Also runs the periodic
/// reaper that evicts finished transfers and quits idle sessions.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::session::SessionHandle;
use crate::config::Config;
use crate::dcc::registry::TransferRegistry;
use crate::error::BotError;

pub struct Supervisor {
    pub config: Arc<Config>,
    pub registry: Arc<TransferRegistry>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Root token: cancelling it tears down every session and transfer.
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, registry: Arc<TransferRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get the session for a server, spawning it on first use.
    pub async fn session(&self, server: &str) -> Result<SessionHandle, BotError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(server) {
                if !handle.is_disconnected() {
                    return Ok(handle.clone());
                }
            }
        }

        let server_config = self.config.server_config(server)?;
        let mut sessions = self.sessions.write().await;
        // Double-checked: another request may have created it meanwhile.
        if let Some(handle) = sessions.get(server) {
            if !handle.is_disconnected() {
                return Ok(handle.clone());
            }
        }

        info!("starting session for {server}");
        let handle = SessionHandle::spawn(
            server.to_owned(),
            server_config,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.shutdown.child_token(),
        );
        sessions.insert(server.to_owned(), handle.clone());
        Ok(handle)
    }

    pub async fn join(&self, server: &str, channels: &[String]) -> Result<(), BotError> {
        let session = self.session(server).await?;
        for channel in channels {
            session.join(channel);
        }
        Ok(())
    }

    pub async fn part(
        &self,
        server: &str,
        channels: &[String],
        reason: Option<String>,
    ) -> Result<(), BotError> {
        let session = self.session(server).await?;
        for channel in channels {
            session.part(channel, reason.clone());
        }
        Ok(())
    }

    pub async fn msg(
        &self,
        server: &str,
        target: &str,
        text: &str,
        channels: Vec<String>,
    ) -> Result<(), BotError> {
        let session = self.session(server).await?;
        session.msg(target, text, channels);
        Ok(())
    }

    /// Cancel a transfer; true if a cancellable one matched.
    pub fn cancel(&self, server: &str, nick: &str, filename: &str) -> bool {
        self.registry.cancel(server, nick, filename)
    }

    /// Snapshot of every live session for `/info`.
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Orderly shutdown: cancel transfers, give them a grace period to
    /// settle their records, quit every session, then cancel the root
    /// token so the control plane stops serving.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.registry.cancel_all();

        let grace = Duration::from_secs(5);
        let drained = tokio::time::timeout(grace, async {
            while self.registry.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            info!("transfers did not settle within grace period");
        }

        for session in self.sessions.read().await.values() {
            session.quit("Shutting down");
        }
        // Give QUIT lines a moment to reach the wire before the tasks die.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.shutdown.cancel();
    }

    /// Periodic housekeeping: reap the registry, quit idle sessions, and
    /// drop handles of dead ones. Spawned once at startup.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = tick.tick() => supervisor.sweep().await,
                }
            }
        });
    }

    async fn sweep(&self) {
        self.registry.reap();

        let idle_after = Duration::from_secs(self.config.server_idle_timeout);
        let mut sessions = self.sessions.write().await;
        sessions.retain(|server, session| {
            if session.is_disconnected() {
                info!("dropping disconnected session for {server}");
                return false;
            }
            if self.config.server_idle_timeout > 0
                && session.is_idle(idle_after)
                && !self.registry.has_active_on(server)
            {
                info!("quitting idle session for {server}");
                session.quit("idle");
                return false;
            }
            true
        });
    }
}
