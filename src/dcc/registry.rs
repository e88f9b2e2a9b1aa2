/// Process-wide table of active and recently finished transfers.
///
/// The registry is the single owner of externally visible transfer state:
/// the engine mutates its record through [`TransferRegistry::update`], the
/// control plane reads consistent snapshots, and cancellation travels from
/// here to the engine through a token — the registry never owns the engine
/// task itself.
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::offer::DccAccept;
use crate::error::BotError;

/// `(server, peer_nick, filename)` — nicks are case-folded.
pub type TransferKey = (String, String, String);

pub fn transfer_key(server: &str, nick: &str, filename: &str) -> TransferKey {
    (
        server.to_owned(),
        nick.to_lowercase(),
        filename.to_owned(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub server: String,
    pub nick: String,
    pub filename: String,
    /// `host:port` of the data connection once known.
    pub host: Option<String>,
    pub status: TransferStatus,
    pub size: u64,
    /// Bytes received this run; the on-disk position is `received + offset`.
    pub received: u64,
    pub offset: u64,
    /// Bytes/sec over the last ~1 s window.
    pub speed: f64,
    /// Bytes/sec averaged over the whole transfer.
    pub speed_avg: f64,
    pub error: Option<String>,
    #[serde(rename = "md5")]
    pub md5_advertised: Option<String>,
    #[serde(rename = "file_md5")]
    pub md5_computed: Option<String>,
    pub resumed: bool,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl TransferRecord {
    pub fn new(server: &str, nick: &str, filename: &str, size: u64) -> Self {
        Self {
            server: server.to_owned(),
            nick: nick.to_owned(),
            filename: filename.to_owned(),
            host: None,
            status: TransferStatus::Queued,
            size,
            received: 0,
            offset: 0,
            speed: 0.0,
            speed_avg: 0.0,
            error: None,
            md5_advertised: None,
            md5_computed: None,
            resumed: false,
            path: PathBuf::new(),
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    pub fn key(&self) -> TransferKey {
        transfer_key(&self.server, &self.nick, &self.filename)
    }
}

struct Entry {
    record: TransferRecord,
    cancel: CancellationToken,
    /// Present while the engine is waiting for a `DCC ACCEPT`.
    accept_tx: Option<mpsc::Sender<DccAccept>>,
}

/// An MD5 advertised over PRIVMSG before any matching transfer existed.
struct PendingMd5 {
    server: String,
    nick: String,
    filename: Option<String>,
    md5: String,
    seen_at: Instant,
}

/// How long an early MD5 advertisement stays claimable.
const PENDING_MD5_TTL: Duration = Duration::from_secs(30);

/// Outcome of recording an advertised MD5 against a finished transfer.
pub enum AdvertisedMd5 {
    /// Stored (or parked as pending); nothing to do.
    Recorded,
    /// The transfer already finished without hashing — the caller should
    /// hash this file and report back via [`TransferRegistry::record_md5`].
    NeedsHash { key: TransferKey, path: PathBuf },
}

pub struct TransferRegistry {
    entries: Mutex<HashMap<TransferKey, Entry>>,
    pending_md5: Mutex<Vec<PendingMd5>>,
    list_timeout: Duration,
}

impl TransferRegistry {
    pub fn new(list_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            pending_md5: Mutex::new(Vec::new()),
            list_timeout,
        }
    }

    /// Register a new transfer. Fails with `AlreadyActive` if the key is
    /// taken by a queued or in-progress transfer; a finished entry under
    /// the same key is replaced.
    pub fn insert(&self, mut record: TransferRecord) -> Result<CancellationToken, BotError> {
        let key = record.key();

        // Claim any MD5 that was advertised before the offer arrived.
        if record.md5_advertised.is_none() {
            let mut pending = self.pending_md5.lock();
            if let Some(pos) = pending.iter().position(|p| {
                p.server == key.0
                    && p.nick.to_lowercase() == key.1
                    && p.seen_at.elapsed() < PENDING_MD5_TTL
                    && p.filename.as_deref().is_none_or(|f| f == record.filename)
            }) {
                record.md5_advertised = Some(pending.remove(pos).md5);
            }
        }

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if existing.record.status.is_active() {
                return Err(BotError::AlreadyActive(format!(
                    "{} from {} on {}",
                    key.2, key.1, key.0
                )));
            }
        }

        let cancel = CancellationToken::new();
        entries.insert(
            key,
            Entry {
                record,
                cancel: cancel.clone(),
                accept_tx: None,
            },
        );
        Ok(cancel)
    }

    /// Atomically patch a record.
    pub fn update(&self, key: &TransferKey, patch: impl FnOnce(&mut TransferRecord)) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            patch(&mut entry.record);
        }
    }

    /// Mark a transfer finished with the given status, stamping
    /// `finished_at` so the reaper can evict it later.
    pub fn finish(&self, key: &TransferKey, status: TransferStatus, error: Option<String>) {
        self.update(key, |record| {
            record.status = status;
            record.error = error;
            record.speed = 0.0;
            record.finished_at = Some(Instant::now());
        });
    }

    /// Signal cancellation to the engine owning the matching active
    /// transfer. Returns false if no cancellable transfer exists.
    pub fn cancel(&self, server: &str, nick: &str, filename: &str) -> bool {
        let key = transfer_key(server, nick, filename);
        let entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.record.status.is_active() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every active transfer (shutdown path).
    pub fn cancel_all(&self) {
        for entry in self.entries.lock().values() {
            if entry.record.status.is_active() {
                entry.cancel.cancel();
            }
        }
    }

    /// Copy of a single record.
    pub fn get(&self, key: &TransferKey) -> Option<TransferRecord> {
        self.entries.lock().get(key).map(|e| e.record.clone())
    }

    /// Point-in-time copy of every record, active and recently finished.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self
            .entries
            .lock()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.record.status.is_active())
            .count()
    }

    /// True if any active transfer on `server` comes from `nick`.
    pub fn has_active_from(&self, server: &str, nick: &str) -> bool {
        let nick = nick.to_lowercase();
        self.entries
            .lock()
            .values()
            .any(|e| e.record.status.is_active() && e.record.server == server && e.record.nick.to_lowercase() == nick)
    }

    /// True if any transfer on `server` is active.
    pub fn has_active_on(&self, server: &str) -> bool {
        self.entries
            .lock()
            .values()
            .any(|e| e.record.status.is_active() && e.record.server == server)
    }

    /// Evict finished entries older than the list timeout and stale
    /// pre-offer MD5 advertisements. Called at ≥1 Hz by the supervisor.
    pub fn reap(&self) {
        self.entries.lock().retain(|_, entry| {
            match entry.record.finished_at {
                Some(at) => at.elapsed() < self.list_timeout,
                None => true,
            }
        });
        self.pending_md5
            .lock()
            .retain(|p| p.seen_at.elapsed() < PENDING_MD5_TTL);
    }

    // ── Resume handshake rendezvous ──────────────────────────────

    /// Register the engine as waiting for a `DCC ACCEPT` on this key.
    pub fn register_accept_waiter(&self, key: &TransferKey) -> mpsc::Receiver<DccAccept> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.accept_tx = Some(tx);
        }
        rx
    }

    pub fn clear_accept_waiter(&self, key: &TransferKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.accept_tx = None;
        }
    }

    /// Route a `DCC ACCEPT` from the session to the matching waiting
    /// engine. Matches on sender and filename (falling back to port when
    /// the peer echoes a mangled name).
    pub fn route_accept(&self, server: &str, nick: &str, accept: DccAccept) -> bool {
        let nick = nick.to_lowercase();
        let entries = self.entries.lock();
        let matching = entries.values().find(|e| {
            e.record.server == server
                && e.record.nick.to_lowercase() == nick
                && e.accept_tx.is_some()
                && (e.record.filename == accept.filename || accept.filename.is_empty())
        });
        match matching {
            Some(entry) => entry
                .accept_tx
                .as_ref()
                .is_some_and(|tx| tx.try_send(accept).is_ok()),
            None => false,
        }
    }

    // ── Advertised checksums ─────────────────────────────────────

    /// Record an MD5 a peer advertised over PRIVMSG. Matches the newest
    /// transfer from that sender (optionally by filename); parks the hash
    /// for a future offer when nothing matches yet.
    pub fn note_advertised_md5(
        &self,
        server: &str,
        nick: &str,
        filename: Option<&str>,
        md5: &str,
    ) -> AdvertisedMd5 {
        let folded = nick.to_lowercase();
        let mut entries = self.entries.lock();
        let candidate = entries
            .values_mut()
            .filter(|e| {
                e.record.server == server
                    && e.record.nick.to_lowercase() == folded
                    && e.record.md5_advertised.is_none()
                    && filename.is_none_or(|f| f == e.record.filename)
            })
            .max_by_key(|e| e.record.started_at);

        let Some(entry) = candidate else {
            self.pending_md5.lock().push(PendingMd5 {
                server: server.to_owned(),
                nick: nick.to_owned(),
                filename: filename.map(str::to_owned),
                md5: md5.to_owned(),
                seen_at: Instant::now(),
            });
            return AdvertisedMd5::Recorded;
        };

        entry.record.md5_advertised = Some(md5.to_owned());
        match (&entry.record.status, &entry.record.md5_computed) {
            (TransferStatus::Completed, Some(computed)) => {
                if !computed.eq_ignore_ascii_case(md5) {
                    entry.record.status = TransferStatus::Failed;
                    entry.record.error = Some("md5 mismatch".into());
                }
                AdvertisedMd5::Recorded
            }
            (TransferStatus::Completed, None) => AdvertisedMd5::NeedsHash {
                key: entry.record.key(),
                path: entry.record.path.clone(),
            },
            _ => AdvertisedMd5::Recorded,
        }
    }

    /// Store a computed digest and reconcile it against the advertised one.
    pub fn record_md5(&self, key: &TransferKey, computed: &str) {
        self.update(key, |record| {
            record.md5_computed = Some(computed.to_owned());
            if let Some(advertised) = &record.md5_advertised {
                if !advertised.eq_ignore_ascii_case(computed) {
                    record.status = TransferStatus::Failed;
                    record.error = Some("md5 mismatch".into());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TransferRegistry {
        TransferRegistry::new(Duration::from_secs(86400))
    }

    #[test]
    fn duplicate_active_key_is_rejected() {
        let registry = registry();
        registry
            .insert(TransferRecord::new("irc.example.net", "Bot1", "f.bin", 10))
            .unwrap();
        let err = registry
            .insert(TransferRecord::new("irc.example.net", "bot1", "f.bin", 10))
            .unwrap_err();
        assert!(matches!(err, BotError::AlreadyActive(_)));

        // A different peer offering the same filename is a different key.
        registry
            .insert(TransferRecord::new("irc.example.net", "bot2", "f.bin", 10))
            .unwrap();
    }

    #[test]
    fn finished_entry_is_replaced_on_reinsert() {
        let registry = registry();
        let record = TransferRecord::new("irc.example.net", "bot1", "f.bin", 10);
        let key = record.key();
        registry.insert(record).unwrap();
        registry.finish(&key, TransferStatus::Failed, Some("short read".into()));

        registry
            .insert(TransferRecord::new("irc.example.net", "bot1", "f.bin", 10))
            .unwrap();
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn cancel_signals_only_active_transfers() {
        let registry = registry();
        let record = TransferRecord::new("irc.example.net", "bot1", "f.bin", 10);
        let key = record.key();
        let token = registry.insert(record).unwrap();

        assert!(registry.cancel("irc.example.net", "Bot1", "f.bin"));
        assert!(token.is_cancelled());

        registry.finish(&key, TransferStatus::Cancelled, None);
        assert!(!registry.cancel("irc.example.net", "bot1", "f.bin"));
    }

    #[test]
    fn reap_evicts_only_expired_finished_entries() {
        let registry = TransferRegistry::new(Duration::from_secs(0));
        let active = TransferRecord::new("irc.example.net", "bot1", "a.bin", 10);
        let done = TransferRecord::new("irc.example.net", "bot1", "b.bin", 10);
        let done_key = done.key();
        registry.insert(active).unwrap();
        registry.insert(done).unwrap();
        registry.finish(&done_key, TransferStatus::Completed, None);

        registry.reap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].filename, "a.bin");
    }

    #[test]
    fn advertised_md5_attaches_to_newest_matching_transfer() {
        let registry = registry();
        registry
            .insert(TransferRecord::new("irc.example.net", "bot1", "f.bin", 10))
            .unwrap();

        registry.note_advertised_md5(
            "irc.example.net",
            "Bot1",
            Some("f.bin"),
            "82ce0f4fe6e5c862d54dae475b8a1b82",
        );
        let record = &registry.snapshot()[0];
        assert_eq!(
            record.md5_advertised.as_deref(),
            Some("82ce0f4fe6e5c862d54dae475b8a1b82")
        );
    }

    #[test]
    fn early_advertised_md5_is_claimed_by_later_insert() {
        let registry = registry();
        registry.note_advertised_md5("irc.example.net", "bot1", Some("f.bin"), "deadbeef");

        registry
            .insert(TransferRecord::new("irc.example.net", "bot1", "f.bin", 10))
            .unwrap();
        let record = &registry.snapshot()[0];
        assert_eq!(record.md5_advertised.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn computed_md5_mismatch_fails_the_transfer() {
        let registry = registry();
        let record = TransferRecord::new("irc.example.net", "bot1", "f.bin", 10);
        let key = record.key();
        registry.insert(record).unwrap();
        registry.update(&key, |r| {
            r.md5_advertised = Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into())
        });
        registry.finish(&key, TransferStatus::Completed, None);
        registry.record_md5(&key, "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

        let record = &registry.snapshot()[0];
        assert_eq!(record.status, TransferStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("md5 mismatch"));
    }

    #[test]
    fn route_accept_reaches_registered_waiter() {
        let registry = registry();
        let record = TransferRecord::new("irc.example.net", "bot1", "f.bin", 10);
        let key = record.key();
        registry.insert(record).unwrap();

        let mut rx = registry.register_accept_waiter(&key);
        let accept = DccAccept {
            filename: "f.bin".into(),
            port: 5000,
            position: 100,
            token: None,
        };
        assert!(registry.route_accept("irc.example.net", "BOT1", accept.clone()));
        assert_eq!(rx.try_recv().unwrap(), accept);

        registry.clear_accept_waiter(&key);
        let again = DccAccept {
            filename: "f.bin".into(),
            port: 5000,
            position: 100,
            token: None,
        };
        assert!(!registry.route_accept("irc.example.net", "bot1", again));
    }
}
