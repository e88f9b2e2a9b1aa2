/// One IRC server session: connection, registration, channel membership,
/// inbound dispatch, operator commands, and idle reclamation.
///
/// The session task owns the framed connection. Everything else talks to it
/// through [`SessionHandle`] (operator commands) or [`LineSender`] (the
/// narrow write-only capability handed to transfer engines for their
/// `DCC RESUME` and passive `DCC SEND` lines).
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::IrcCodec;
use super::message::Message;
use super::AsyncStream;
use crate::config::{Config, ServerConfig};
use crate::dcc::offer::{self, DccMessage};
use crate::dcc::registry::{AdvertisedMd5, TransferRegistry};
use crate::dcc::transfer::{self, TransferContext};
use crate::error::BotError;
use crate::tls;

type IrcFramed = Framed<Box<dyn AsyncStream>, IrcCodec>;

/// How long registration may take end to end.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for NickServ to confirm identification.
const NICKSERV_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before the single reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Registering,
    Identifying,
    Ready,
    Quitting,
    Disconnected,
}

/// Write-only capability for sending IRC lines through a session.
#[derive(Clone)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl LineSender {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    /// Send a CTCP payload to a target over PRIVMSG.
    pub fn ctcp(&self, target: &str, payload: &str) {
        self.send(Message::ctcp(target, payload));
    }
}

/// Operator commands routed into the session task.
enum SessionCommand {
    Join {
        channel: String,
    },
    Part {
        channel: String,
        reason: Option<String>,
    },
    Msg {
        target: String,
        text: String,
        /// Channel context from the control plane: joined before sending
        /// and consulted for the ssend rewrite.
        channels: Vec<String>,
    },
    Quit {
        reason: String,
    },
}

/// State shared with the control plane for `/info`.
struct Shared {
    nick: Mutex<String>,
    state: Mutex<SessionState>,
    /// Joined channels with their last-activity stamp.
    channels: Mutex<HashMap<String, Instant>>,
    last_active: Mutex<Instant>,
}

/// Handle held by the supervisor; cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    pub server: String,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Spawn a session task for `server` and return its handle.
    pub fn spawn(
        server: String,
        server_config: ServerConfig,
        config: Arc<Config>,
        registry: Arc<TransferRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let nick = if server_config.random_nick {
            format!("{}{}", server_config.nick, random_suffix())
        } else {
            server_config.nick.clone()
        };

        let shared = Arc::new(Shared {
            nick: Mutex::new(nick.clone()),
            state: Mutex::new(SessionState::Connecting),
            channels: Mutex::new(HashMap::new()),
            last_active: Mutex::new(Instant::now()),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let session = Session {
            server: server.clone(),
            server_config,
            config,
            registry,
            shutdown,
            shared: Arc::clone(&shared),
            nick,
            out_tx,
            peer_channels: HashMap::new(),
            outstanding: HashSet::new(),
            linked_from: HashMap::new(),
            pending_joins: HashSet::new(),
            banned_channels: HashSet::new(),
        };
        tokio::spawn(session.run(cmd_rx, out_rx));

        Self {
            server,
            cmd_tx,
            shared,
        }
    }

    pub fn join(&self, channel: &str) {
        let _ = self.cmd_tx.send(SessionCommand::Join {
            channel: fold(channel),
        });
    }

    pub fn part(&self, channel: &str, reason: Option<String>) {
        let _ = self.cmd_tx.send(SessionCommand::Part {
            channel: fold(channel),
            reason,
        });
    }

    pub fn msg(&self, target: &str, text: &str, channels: Vec<String>) {
        let _ = self.cmd_tx.send(SessionCommand::Msg {
            target: target.trim().to_owned(),
            text: text.trim().to_owned(),
            channels: channels.iter().map(|c| fold(c)).collect(),
        });
    }

    /// Ask a peer for a numbered pack.
    pub fn xdcc_request(&self, peer: &str, pack: u32) {
        self.msg(peer, &format!("xdcc send {pack}"), Vec::new());
    }

    pub fn quit(&self, reason: &str) {
        let _ = self.cmd_tx.send(SessionCommand::Quit {
            reason: reason.to_owned(),
        });
    }

    pub fn nick(&self) -> String {
        self.shared.nick.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Joined channels with seconds since their last activity.
    pub fn channels(&self) -> Vec<(String, u64)> {
        self.shared
            .channels
            .lock()
            .iter()
            .map(|(name, last)| (name.clone(), last.elapsed().as_secs()))
            .collect()
    }

    /// True when the session has had no channels and no activity for
    /// `idle_after`. Transfers are the supervisor's side of the check.
    pub fn is_idle(&self, idle_after: Duration) -> bool {
        self.state() == SessionState::Ready
            && self.shared.channels.lock().is_empty()
            && self.shared.last_active.lock().elapsed() > idle_after
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Disconnected | SessionState::Quitting
        )
    }
}

struct Session {
    server: String,
    server_config: ServerConfig,
    config: Arc<Config>,
    registry: Arc<TransferRegistry>,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
    nick: String,
    out_tx: mpsc::UnboundedSender<Message>,
    /// Peers we have interacted with, mapped to the channels they were
    /// encountered in; used to refresh channel activity and to block idle
    /// parts while their transfers run.
    peer_channels: HashMap<String, HashSet<String>>,
    /// Peers with an outstanding XDCC request.
    outstanding: HashSet<String>,
    /// Channels joined only because of an `also_join` rule, keyed to their
    /// source channel.
    linked_from: HashMap<String, String>,
    /// JOINs sent but not yet echoed, for idempotence.
    pending_joins: HashSet<String>,
    banned_channels: HashSet<String>,
}

enum RunEnd {
    Quit,
    ConnectionLost(String),
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let mut reconnected = false;
        loop {
            match self.connect_and_run(&mut cmd_rx, &mut out_rx).await {
                Ok(RunEnd::Quit) => {
                    self.set_state(SessionState::Quitting);
                    break;
                }
                Ok(RunEnd::ConnectionLost(reason)) if !reconnected => {
                    warn!(
                        "[{}] connection lost ({reason}), reconnecting in {}s",
                        self.server,
                        RECONNECT_DELAY.as_secs()
                    );
                    reconnected = true;
                    self.shared.channels.lock().clear();
                    self.pending_joins.clear();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
                Ok(RunEnd::ConnectionLost(reason)) => {
                    error!("[{}] connection lost again ({reason}), giving up", self.server);
                    break;
                }
                Err(e) => {
                    error!("[{}] session failed: {e}", self.server);
                    break;
                }
            }
        }
        self.shared.channels.lock().clear();
        self.set_state(SessionState::Disconnected);
    }

    async fn connect_and_run(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
        out_rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<RunEnd, BotError> {
        self.set_state(SessionState::Connecting);
        let (mut framed, local_ip) = self.connect().await?;

        self.set_state(SessionState::Registering);
        timeout(REGISTRATION_TIMEOUT, self.register(&mut framed))
            .await
            .map_err(|_| BotError::AuthFailed("registration timed out".into()))??;
        info!("[{}] registered as {}", self.server, self.nick);

        if self.server_config.nickserv_password.is_some() {
            self.set_state(SessionState::Identifying);
            self.identify(&mut framed).await?;
        }

        for channel in self.server_config.channels.clone() {
            self.join_channel(&mut framed, &fold(&channel), None).await?;
        }

        self.set_state(SessionState::Ready);
        self.touch();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = framed.send(Message::new("QUIT", vec!["shutting down".into()])).await;
                    return Ok(RunEnd::Quit);
                }
                frame = framed.next() => match frame {
                    Some(Ok(msg)) => {
                        if let Some(end) = self.dispatch(&mut framed, msg, local_ip).await? {
                            return Ok(end);
                        }
                    }
                    Some(Err(e)) => return Ok(RunEnd::ConnectionLost(e.to_string())),
                    None => return Ok(RunEnd::ConnectionLost("connection closed".into())),
                },
                Some(cmd) = cmd_rx.recv() => {
                    if let Some(end) = self.handle_command(&mut framed, cmd).await? {
                        return Ok(end);
                    }
                }
                Some(line) = out_rx.recv() => {
                    send(&mut framed, line).await?;
                }
                _ = tick.tick() => {
                    self.reclaim_idle_channels(&mut framed).await?;
                }
            }
        }
    }

    /// Open the TCP (and optionally TLS) connection.
    async fn connect(&self) -> Result<(IrcFramed, IpAddr), BotError> {
        let endpoint = (self.server.as_str(), self.server_config.port);
        let tcp = TcpStream::connect(endpoint)
            .await
            .map_err(|e| BotError::NetworkUnavailable(format!("{}: {e}", self.server)))?;
        let local_ip = tcp
            .local_addr()
            .map_err(|e| BotError::Internal(e.to_string()))?
            .ip();

        let stream: Box<dyn AsyncStream> = if self.server_config.use_tls {
            let connector = if self.server_config.verify_ssl {
                tls::verified_connector()
            } else {
                tls::insecure_connector()
            };
            let name = ServerName::try_from(self.server.clone())
                .map_err(|e| BotError::ConfigInvalid(format!("server name: {e}")))?;
            let tls_stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| BotError::NetworkUnavailable(format!("tls: {e}")))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        info!("[{}] connected with nick {}", self.server, self.nick);
        Ok((Framed::new(stream, IrcCodec), local_ip))
    }

    /// NICK/USER exchange until the end of the MOTD.
    async fn register(&mut self, framed: &mut IrcFramed) -> Result<(), BotError> {
        send(framed, Message::new("NICK", vec![self.nick.clone()])).await?;
        send(
            framed,
            Message::new(
                "USER",
                vec![
                    self.nick.clone(),
                    "0".into(),
                    "*".into(),
                    self.nick.clone(),
                ],
            ),
        )
        .await?;

        loop {
            let msg = next_message(framed).await?;
            match msg.command.as_str() {
                "PING" => pong(framed, &msg).await?,
                // Welcome: the server tells us our accepted nick.
                "001" => {
                    if let Some(accepted) = msg.params.first() {
                        self.nick = accepted.clone();
                        *self.shared.nick.lock() = accepted.clone();
                    }
                }
                // End of MOTD (or no MOTD at all): registration done.
                "376" | "422" => return Ok(()),
                // Nick in use / collision.
                "433" | "436" => {
                    if !self.server_config.random_nick {
                        return Err(BotError::ProtocolViolation(format!(
                            "nick {} already in use",
                            self.nick
                        )));
                    }
                    self.nick = format!("{}{}", self.server_config.nick, random_suffix());
                    *self.shared.nick.lock() = self.nick.clone();
                    info!("[{}] nick collision, retrying as {}", self.server, self.nick);
                    send(framed, Message::new("NICK", vec![self.nick.clone()])).await?;
                }
                "ERROR" => {
                    return Err(BotError::NetworkUnavailable(
                        msg.text().unwrap_or("server error").to_owned(),
                    ))
                }
                _ => {}
            }
        }
    }

    /// Identify with NickServ, waiting briefly for confirmation.
    async fn identify(&mut self, framed: &mut IrcFramed) -> Result<(), BotError> {
        let password = self
            .server_config
            .nickserv_password
            .clone()
            .unwrap_or_default();
        send(
            framed,
            Message::privmsg("NickServ", format!("IDENTIFY {password}")),
        )
        .await?;
        info!("[{}] sent NickServ IDENTIFY", self.server);

        let deadline = Instant::now() + NICKSERV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("[{}] no NickServ confirmation, joining anyway", self.server);
                return Ok(());
            }
            let msg = match timeout(remaining, framed.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(BotError::NetworkUnavailable(e.to_string())),
                Ok(None) => return Err(BotError::NetworkUnavailable("connection closed".into())),
                Err(_) => {
                    warn!("[{}] no NickServ confirmation, joining anyway", self.server);
                    return Ok(());
                }
            };

            let from_nickserv = msg
                .source_nick()
                .is_some_and(|nick| nick.eq_ignore_ascii_case("NickServ"));
            if from_nickserv && matches!(msg.command.as_str(), "NOTICE" | "PRIVMSG") {
                let text = msg.text().unwrap_or_default().to_lowercase();
                if text.contains("identified") || text.contains("accepted") {
                    info!("[{}] NickServ identification confirmed", self.server);
                    return Ok(());
                }
                if text.contains("invalid") || text.contains("incorrect") {
                    return Err(BotError::AuthFailed("NickServ rejected password".into()));
                }
            } else if msg.command == "PING" {
                pong(framed, &msg).await?;
            }
        }
    }

    /// Handle one inbound message. Returns `Some(end)` when the connection
    /// is over.
    async fn dispatch(
        &mut self,
        framed: &mut IrcFramed,
        msg: Message,
        local_ip: IpAddr,
    ) -> Result<Option<RunEnd>, BotError> {
        match msg.command.as_str() {
            // PONG resets session idleness but never channel idleness.
            "PING" => {
                pong(framed, &msg).await?;
                self.touch();
            }
            "PRIVMSG" | "NOTICE" => {
                self.touch();
                let sender = msg.source_nick().unwrap_or_default().to_owned();
                if let Some(payload) = msg.ctcp_payload() {
                    self.handle_ctcp(framed, &sender, &payload, local_ip).await?;
                } else if let Some(text) = msg.text() {
                    self.handle_chat(&sender, text);
                }
            }
            "JOIN" => {
                if msg.source_nick() == Some(self.nick.as_str()) {
                    if let Some(channel) = msg.params.first() {
                        self.on_self_join(framed, &fold(channel)).await?;
                    }
                }
            }
            "PART" => {
                if msg.source_nick() == Some(self.nick.as_str()) {
                    if let Some(channel) = msg.params.first() {
                        self.forget_channel(&fold(channel));
                    }
                }
            }
            "KICK" => {
                let victim = msg.params.get(1).map(String::as_str);
                if victim == Some(self.nick.as_str()) {
                    if let Some(channel) = msg.params.first() {
                        info!("[{}] kicked from {channel}", self.server);
                        self.forget_channel(&fold(channel));
                    }
                }
            }
            // Banned from channel.
            "474" => {
                if let Some(channel) = msg.params.get(1) {
                    warn!("[{}] banned from {channel}", self.server);
                    let folded = fold(channel);
                    self.banned_channels.insert(folded.clone());
                    self.pending_joins.remove(&folded);
                    self.forget_channel(&folded);
                }
            }
            "QUIT" => {
                if msg.source_nick() == Some(self.nick.as_str()) {
                    return Ok(Some(RunEnd::ConnectionLost("server closed session".into())));
                }
            }
            "ERROR" => {
                return Ok(Some(RunEnd::ConnectionLost(
                    msg.text().unwrap_or("server error").to_owned(),
                )));
            }
            _ => {}
        }
        Ok(None)
    }

    /// CTCP path: DCC offers/accepts, plus the classic VERSION/PING probes.
    async fn handle_ctcp(
        &mut self,
        framed: &mut IrcFramed,
        sender: &str,
        payload: &str,
        local_ip: IpAddr,
    ) -> Result<(), BotError> {
        if payload.starts_with("DCC ") || payload == "DCC" {
            self.refresh_peer_channels(sender);
            match offer::parse(payload) {
                Ok(DccMessage::Offer(offer)) => {
                    if let Err(e) = offer.validate(&self.config) {
                        warn!("[{sender}] rejected offer of {}: {e}", offer.filename);
                        return Ok(());
                    }
                    self.outstanding.remove(&fold(sender));
                    let ctx = TransferContext {
                        server: self.server.clone(),
                        config: Arc::clone(&self.config),
                        registry: Arc::clone(&self.registry),
                        lines: LineSender::new(self.out_tx.clone()),
                        local_ip,
                        shutdown: self.shutdown.clone(),
                    };
                    tokio::spawn(transfer::run(ctx, sender.to_owned(), offer));
                }
                Ok(DccMessage::Accept(accept)) => {
                    if !self.registry.route_accept(&self.server, sender, accept) {
                        warn!("[{sender}] DCC ACCEPT with no waiting transfer");
                    }
                }
                Err(e) => warn!("[{sender}] unparseable DCC message: {e}"),
            }
        } else if payload.eq_ignore_ascii_case("VERSION") {
            send(
                framed,
                Message::ctcp_reply(sender, &format!("VERSION dccbot {}", env!("CARGO_PKG_VERSION"))),
            )
            .await?;
        } else if let Some(ts) = payload.strip_prefix("PING ") {
            send(framed, Message::ctcp_reply(sender, &format!("PING {ts}"))).await?;
        } else {
            debug!("[{sender}] ignoring CTCP {payload}");
        }
        Ok(())
    }

    /// Plain chatter: scrape advertised checksums and surface denials.
    fn handle_chat(&mut self, sender: &str, text: &str) {
        info!("[{sender}] {text}");

        if text.starts_with("XDCC SEND denied") {
            error!("[{sender}] {text}");
            return;
        }

        if !self.config.auto_md5sum {
            return;
        }
        if let Some(md5) = find_md5_token(text) {
            let filename = quoted_name(text);
            let outcome =
                self.registry
                    .note_advertised_md5(&self.server, sender, filename, md5);
            if let AdvertisedMd5::NeedsHash { key, path } = outcome {
                // The transfer finished before the checksum arrived; hash it
                // now and reconcile.
                let registry = Arc::clone(&self.registry);
                tokio::spawn(async move {
                    match transfer::md5_file(path).await {
                        Ok(computed) => registry.record_md5(&key, &computed),
                        Err(e) => warn!("late md5 check failed: {e}"),
                    }
                });
            }
        }
    }

    async fn handle_command(
        &mut self,
        framed: &mut IrcFramed,
        cmd: SessionCommand,
    ) -> Result<Option<RunEnd>, BotError> {
        self.touch();
        match cmd {
            SessionCommand::Join { channel } => {
                self.join_channel(framed, &channel, None).await?;
            }
            SessionCommand::Part { channel, reason } => {
                self.part_channel(framed, &channel, reason.as_deref()).await?;
            }
            SessionCommand::Msg {
                target,
                text,
                channels,
            } => {
                for channel in &channels {
                    self.join_channel(framed, channel, None).await?;
                }
                let text = self.apply_ssend_rewrite(&target, &channels, text);

                info!("[{}] -> {target}: {text}", self.server);
                send(framed, Message::privmsg(target.clone(), text.clone())).await?;

                let folded_target = fold(&target);
                if fold(&text).starts_with("xdcc s") {
                    self.outstanding.insert(folded_target.clone());
                }
                if !channels.is_empty() {
                    let entry = self
                        .peer_channels
                        .entry(folded_target.clone())
                        .or_default();
                    entry.extend(channels.iter().cloned());
                }
                // The message itself counts as activity on its channels.
                let mut joined = self.shared.channels.lock();
                for channel in &channels {
                    if let Some(last) = joined.get_mut(channel) {
                        *last = Instant::now();
                    }
                }
                if let Some(last) = joined.get_mut(&folded_target) {
                    *last = Instant::now();
                }
            }
            SessionCommand::Quit { reason } => {
                let _ = framed.send(Message::new("QUIT", vec![reason])).await;
                return Ok(Some(RunEnd::Quit));
            }
        }
        Ok(None)
    }

    /// Rewrite `xdcc send`/`xdcc batch` to the TLS variants when the
    /// request context asks for it.
    fn apply_ssend_rewrite(&self, target: &str, channels: &[String], text: String) -> String {
        let target_folded = fold(target);
        let wants_ssend = self
            .server_config
            .rewrite_to_ssend
            .iter()
            .any(|c| fold(c) == target_folded || channels.contains(&fold(c)))
            || self.config.ssend_map.get(&target_folded).copied() == Some(true);
        if !wants_ssend {
            return text;
        }
        rewrite_to_ssend(&text).unwrap_or(text)
    }

    /// Idempotent JOIN: at most one line on the wire until the echo lands.
    async fn join_channel(
        &mut self,
        framed: &mut IrcFramed,
        channel: &str,
        source: Option<&str>,
    ) -> Result<(), BotError> {
        if channel.is_empty()
            || self.shared.channels.lock().contains_key(channel)
            || self.pending_joins.contains(channel)
            || self.banned_channels.contains(channel)
        {
            return Ok(());
        }
        self.pending_joins.insert(channel.to_owned());
        if let Some(source) = source {
            self.linked_from
                .insert(channel.to_owned(), source.to_owned());
        }
        info!("[{}] joining {channel}", self.server);
        send(framed, Message::new("JOIN", vec![channel.to_owned()])).await
    }

    /// The server confirmed our JOIN: record membership and chase the
    /// `also_join` satellites of this channel.
    async fn on_self_join(&mut self, framed: &mut IrcFramed, channel: &str) -> Result<(), BotError> {
        self.pending_joins.remove(channel);
        self.banned_channels.remove(channel);
        self.shared
            .channels
            .lock()
            .insert(channel.to_owned(), Instant::now());
        info!("[{}] joined {channel}", self.server);

        if let Some(extras) = self.server_config.also_join.get(channel).cloned() {
            for extra in extras {
                self.join_channel(framed, &fold(&extra), Some(channel)).await?;
            }
        }
        Ok(())
    }

    async fn part_channel(
        &mut self,
        framed: &mut IrcFramed,
        channel: &str,
        reason: Option<&str>,
    ) -> Result<(), BotError> {
        // Parting a channel also parts channels that were only entered as
        // its `also_join` satellites (and theirs, transitively).
        let mut queue = vec![channel.to_owned()];
        while let Some(channel) = queue.pop() {
            if !self.shared.channels.lock().contains_key(&channel) {
                continue; // part of an unjoined channel is a no-op
            }

            queue.extend(
                self.linked_from
                    .iter()
                    .filter(|(_, source)| **source == channel)
                    .map(|(child, _)| child.clone()),
            );

            let mut params = vec![channel.clone()];
            if let Some(reason) = reason {
                params.push(reason.to_owned());
            }
            info!("[{}] parting {channel}", self.server);
            send(framed, Message::new("PART", params)).await?;
            self.forget_channel(&channel);
        }
        Ok(())
    }

    fn forget_channel(&mut self, channel: &str) {
        self.shared.channels.lock().remove(channel);
        self.linked_from.remove(channel);
        self.touch();
    }

    /// Part channels idle past the timeout, unless a transfer from a peer
    /// encountered there is still running.
    async fn reclaim_idle_channels(&mut self, framed: &mut IrcFramed) -> Result<(), BotError> {
        if self.config.channel_idle_timeout == 0 {
            return Ok(());
        }
        let idle_after = Duration::from_secs(self.config.channel_idle_timeout);
        let idle: Vec<String> = self
            .shared
            .channels
            .lock()
            .iter()
            .filter(|(_, last)| last.elapsed() > idle_after)
            .map(|(name, _)| name.clone())
            .collect();

        for channel in idle {
            if self.channel_has_active_transfer(&channel) {
                continue;
            }
            info!("[{}] parting idle channel {channel}", self.server);
            self.part_channel(framed, &channel, Some("idle")).await?;
        }
        Ok(())
    }

    fn channel_has_active_transfer(&self, channel: &str) -> bool {
        self.peer_channels.iter().any(|(nick, channels)| {
            channels.contains(channel) && self.registry.has_active_from(&self.server, nick)
        })
    }

    /// A peer we talk DCC with keeps its channels alive.
    fn refresh_peer_channels(&mut self, sender: &str) {
        if let Some(channels) = self.peer_channels.get(&fold(sender)) {
            let mut joined = self.shared.channels.lock();
            for channel in channels {
                if let Some(last) = joined.get_mut(channel) {
                    *last = Instant::now();
                }
            }
        }
    }

    fn touch(&self) {
        *self.shared.last_active.lock() = Instant::now();
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock() = state;
    }
}

async fn send(framed: &mut IrcFramed, message: Message) -> Result<(), BotError> {
    framed
        .send(message)
        .await
        .map_err(|e| BotError::NetworkUnavailable(e.to_string()))
}

async fn next_message(framed: &mut IrcFramed) -> Result<Message, BotError> {
    match framed.next().await {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(BotError::NetworkUnavailable(e.to_string())),
        None => Err(BotError::NetworkUnavailable("connection closed".into())),
    }
}

async fn pong(framed: &mut IrcFramed, ping: &Message) -> Result<(), BotError> {
    let token = ping.params.first().cloned().unwrap_or_default();
    send(framed, Message::new("PONG", vec![token])).await
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect()
}

/// `xdcc send`/`xdcc batch` → `xdcc ssend`/`xdcc sbatch`.
fn rewrite_to_ssend(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    for (plain, secure) in [("xdcc send ", "xdcc ssend "), ("xdcc batch ", "xdcc sbatch ")] {
        if lower.starts_with(plain) {
            return Some(format!("{secure}{}", &text[plain.len()..]));
        }
    }
    None
}

/// First standalone 32-digit lowercase hex token in a line of chatter.
fn find_md5_token(text: &str) -> Option<&str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|token| {
            token.len() == 32
                && token
                    .bytes()
                    .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
}

/// First double-quoted name in a line of chatter.
fn quoted_name(text: &str) -> Option<&str> {
    let start = text.find('"')? + 1;
    let len = text[start..].find('"')?;
    Some(&text[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ssend_rewrite_applies_to_send_and_batch() {
        assert_eq!(
            rewrite_to_ssend("xdcc send 5").as_deref(),
            Some("xdcc ssend 5")
        );
        assert_eq!(
            rewrite_to_ssend("XDCC BATCH 1-3").as_deref(),
            Some("xdcc sbatch 1-3")
        );
        assert_eq!(rewrite_to_ssend("xdcc info 5"), None);
        assert_eq!(rewrite_to_ssend("hello"), None);
    }

    #[test]
    fn md5_token_is_found_in_bot_chatter() {
        assert_eq!(
            find_md5_token(
                "** Transfer Completed (1.0GB), md5sum: 82ce0f4fe6e5c862d54dae475b8a1b82"
            ),
            Some("82ce0f4fe6e5c862d54dae475b8a1b82")
        );
        assert_eq!(
            find_md5_token("** Sending you pack #1 (\"TEST.mkv\") [1.0GB, MD5:0123456789abcdef0123456789abcdef]"),
            Some("0123456789abcdef0123456789abcdef")
        );
        // Uppercase hex and wrong lengths are not checksums we trust.
        assert_eq!(
            find_md5_token("md5: 82CE0F4FE6E5C862D54DAE475B8A1B82"),
            None
        );
        assert_eq!(find_md5_token("deadbeef"), None);
    }

    #[test]
    fn quoted_name_extraction() {
        assert_eq!(
            quoted_name("** Sending you pack #1 (\"TEST.mkv\") [1.0GB]"),
            Some("TEST.mkv")
        );
        assert_eq!(quoted_name("no quotes here"), None);
        assert_eq!(quoted_name("\"unterminated"), None);
    }

    #[test]
    fn random_suffix_is_four_alphanumerics() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
