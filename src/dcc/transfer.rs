/// The transfer engine: executes one DCC reception to completion.
///
/// Sequence: claim the registry key, probe for a resumable partial file,
/// establish the data connection (dialing out, or listening for passive
/// offers), stream to disk with ACKs, then verify and rename. Every
/// suspension point observes cancellation, so a cancel lands within one
/// chunk of I/O.
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use rustls::pki_types::ServerName;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::offer::{self, DccOffer};
use super::registry::{transfer_key, TransferKey, TransferRecord, TransferRegistry, TransferStatus};
use crate::config::Config;
use crate::error::BotError;
use crate::irc::session::LineSender;
use crate::irc::AsyncStream;
use crate::tls;

/// Read granularity; cancellation and progress both resolve within one chunk.
const CHUNK_SIZE: usize = 64 * 1024;

/// A stalled peer fails the transfer after this long without a byte.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes buffered before content sniffing.
const SNIFF_LEN: usize = 4096;

/// Everything a transfer needs from its surroundings. Deliberately narrow:
/// the engine can send IRC lines through the session but never touches the
/// session itself.
pub struct TransferContext {
    pub server: String,
    pub config: Arc<Config>,
    pub registry: Arc<TransferRegistry>,
    pub lines: LineSender,
    /// Our address on the IRC server's side, advertised for passive DCC.
    pub local_ip: IpAddr,
    pub shutdown: CancellationToken,
}

/// Run one reception. All errors end up in the transfer record; nothing
/// propagates to the caller.
pub async fn run(ctx: TransferContext, peer: String, offer: DccOffer) {
    let key = transfer_key(&ctx.server, &peer, &offer.filename);

    let record = TransferRecord::new(&ctx.server, &peer, &offer.filename, offer.size);
    let cancel = match ctx.registry.insert(record) {
        Ok(token) => token,
        Err(e) => {
            warn!("[{}] rejecting offer of {}: {e}", peer, offer.filename);
            return;
        }
    };

    info!(
        "[{}] receiving {} ({} bytes) via {}DCC",
        peer,
        offer.filename,
        offer.size,
        if offer.secure { "SSL " } else { "" }
    );

    match execute(&ctx, &key, &peer, &offer, &cancel).await {
        Ok(()) => {
            info!("[{}] download of {} complete", peer, offer.filename);
            ctx.registry.finish(&key, TransferStatus::Completed, None);
        }
        Err(e) => {
            let (status, detail) = match &e {
                BotError::Cancelled => (TransferStatus::Cancelled, "cancelled by user".into()),
                BotError::ShortRead { .. } => (TransferStatus::Failed, "short read".into()),
                BotError::ChecksumMismatch { .. } => {
                    (TransferStatus::Failed, "md5 mismatch".into())
                }
                other => (TransferStatus::Failed, other.to_string()),
            };
            warn!("[{}] download of {} failed: {e}", peer, offer.filename);
            ctx.registry.finish(&key, status, Some(detail));
        }
    }
}

async fn execute(
    ctx: &TransferContext,
    key: &TransferKey,
    peer: &str,
    offer: &DccOffer,
    cancel: &CancellationToken,
) -> Result<(), BotError> {
    let final_path = ctx.config.download_path.join(&offer.filename);
    let part_path = ctx.config.download_path.join(format!(
        "{}{}",
        offer.filename, ctx.config.incomplete_suffix
    ));
    ctx.registry.update(key, |r| r.path = part_path.clone());

    // A finished download may already be sitting in the target directory.
    if file_len(&final_path).await == Some(offer.size) && offer.size > 0 {
        info!("[{peer}] {} already downloaded", offer.filename);
        ctx.registry.update(key, |r| r.path = final_path.clone());
        verify_and_rename(ctx, key, &final_path, &final_path).await?;
        return Ok(());
    }

    // Resume probe against the partial file.
    let mut offset = 0u64;
    if let Some(partial_len) = file_len(&part_path).await {
        if partial_len > offer.size {
            return Err(BotError::ProtocolViolation(format!(
                "local partial is larger than the offer ({partial_len} > {})",
                offer.size
            )));
        }
        if partial_len == offer.size && partial_len > 0 {
            // Nothing left to transfer.
            info!("[{peer}] {} partial is already complete", offer.filename);
            verify_and_rename(ctx, key, &part_path, &final_path).await?;
            return Ok(());
        }
        if partial_len > 0 {
            offset = negotiate_resume(ctx, key, peer, offer, &part_path, partial_len, cancel)
                .await?;
        }
    }

    ctx.registry.update(key, |r| {
        r.offset = offset;
        r.resumed = offset > 0;
    });

    // Empty offers complete without opening a socket.
    if offer.size == 0 {
        let file = open_at(&part_path, 0).await?;
        drop(file);
        return verify_and_rename(ctx, key, &part_path, &final_path).await;
    }

    // Data connection.
    let mut stream = if offer.port != 0 {
        dial(ctx, key, offer, cancel).await?
    } else {
        listen_passive(ctx, key, peer, offer, cancel).await?
    };

    ctx.registry
        .update(key, |r| r.status = TransferStatus::InProgress);

    receive(ctx, key, offer, &part_path, offset, &mut stream, cancel).await?;
    drop(stream);

    verify_and_rename(ctx, key, &part_path, &final_path).await
}

/// Send `DCC RESUME` and wait for the matching `DCC ACCEPT`. On timeout the
/// partial is deleted and the transfer restarts from zero.
async fn negotiate_resume(
    ctx: &TransferContext,
    key: &TransferKey,
    peer: &str,
    offer: &DccOffer,
    part_path: &Path,
    partial_len: u64,
    cancel: &CancellationToken,
) -> Result<u64, BotError> {
    let mut accept_rx = ctx.registry.register_accept_waiter(key);
    info!(
        "[{peer}] requesting resume of {} at byte {partial_len}",
        offer.filename
    );
    ctx.lines.ctcp(
        peer,
        &offer::encode_resume(
            &offer.filename,
            offer.port,
            partial_len,
            offer.token.as_deref(),
        ),
    );

    let wait = Duration::from_secs(ctx.config.resume_timeout);
    let accepted = tokio::select! {
        _ = cancel.cancelled() => Err(BotError::Cancelled),
        _ = ctx.shutdown.cancelled() => Err(BotError::Cancelled),
        result = timeout(wait, accept_rx.recv()) => Ok(result.ok().flatten()),
    };
    ctx.registry.clear_accept_waiter(key);

    match accepted? {
        Some(accept) => {
            // The peer may answer with a different position; it wins.
            info!("[{peer}] resume accepted at byte {}", accept.position);
            Ok(accept.position.min(offer.size))
        }
        None => {
            info!(
                "[{peer}] no DCC ACCEPT for {} within {}s, restarting from zero",
                offer.filename, ctx.config.resume_timeout
            );
            fs::remove_file(part_path)
                .await
                .map_err(|e| BotError::Internal(format!("removing stale partial: {e}")))?;
            Ok(0)
        }
    }
}

/// Active DCC: dial the advertised endpoint, wrapping in TLS for SSEND.
async fn dial(
    ctx: &TransferContext,
    key: &TransferKey,
    offer: &DccOffer,
    cancel: &CancellationToken,
) -> Result<Box<dyn AsyncStream>, BotError> {
    let endpoint = (offer.ip, offer.port);
    let tcp = tokio::select! {
        _ = cancel.cancelled() => return Err(BotError::Cancelled),
        _ = ctx.shutdown.cancelled() => return Err(BotError::Cancelled),
        result = TcpStream::connect(endpoint) => result
            .map_err(|e| BotError::NetworkUnavailable(format!("connect {}:{}: {e}", offer.ip, offer.port)))?,
    };
    ctx.registry
        .update(key, |r| r.host = Some(format!("{}:{}", offer.ip, offer.port)));

    if !offer.secure {
        return Ok(Box::new(tcp));
    }

    // SSEND peers present self-signed certificates; encrypt, don't verify.
    let connector = tls::insecure_connector();
    let server_name = ServerName::try_from(offer.ip.to_string())
        .map_err(|e| BotError::Internal(format!("peer name: {e}")))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| BotError::NetworkUnavailable(format!("tls handshake: {e}")))?;
    Ok(Box::new(stream))
}

/// Passive (reverse) DCC: bind an ephemeral listener, advertise it back to
/// the peer with the echoed token, and accept exactly one connection.
async fn listen_passive(
    ctx: &TransferContext,
    key: &TransferKey,
    peer: &str,
    offer: &DccOffer,
    cancel: &CancellationToken,
) -> Result<Box<dyn AsyncStream>, BotError> {
    let token = offer.token.as_deref().ok_or_else(|| {
        BotError::ProtocolViolation("passive offer without a token".into())
    })?;
    if offer.secure {
        return Err(BotError::ProtocolViolation(
            "passive SSEND is not supported".into(),
        ));
    }

    let listener = TcpListener::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| BotError::NetworkUnavailable(format!("binding passive listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| BotError::Internal(e.to_string()))?
        .port();

    info!("[{peer}] passive offer for {}, listening on port {port}", offer.filename);
    ctx.lines.ctcp(
        peer,
        &offer::encode_passive_reply(
            &offer.filename,
            ctx.local_ip,
            port,
            offer.size,
            token,
            offer.secure,
        ),
    );

    let wait = Duration::from_secs(ctx.config.resume_timeout);
    let (stream, remote) = tokio::select! {
        _ = cancel.cancelled() => return Err(BotError::Cancelled),
        _ = ctx.shutdown.cancelled() => return Err(BotError::Cancelled),
        result = timeout(wait, listener.accept()) => match result {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(BotError::NetworkUnavailable(format!("accept: {e}"))),
            Err(_) => return Err(BotError::ResumeTimeout),
        },
    };
    ctx.registry
        .update(key, |r| r.host = Some(remote.to_string()));
    Ok(Box::new(stream))
}

/// Stream the file body: chunked reads, progressive writes, a 4-byte
/// big-endian ACK of the on-disk position after every chunk, MIME gating
/// once enough bytes are buffered, and ~1 Hz progress updates.
async fn receive(
    ctx: &TransferContext,
    key: &TransferKey,
    offer: &DccOffer,
    part_path: &Path,
    offset: u64,
    stream: &mut Box<dyn AsyncStream>,
    cancel: &CancellationToken,
) -> Result<(), BotError> {
    let mut file = open_at(part_path, offset).await?;

    let mut received = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sniff_buf: Vec<u8> = Vec::new();
    // Resumed transfers skip the gate: the head of the file is not ours.
    let mut sniffed = offset > 0 || ctx.config.allowed_mimetypes.is_empty();

    let started = Instant::now();
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    while received + offset < offer.size {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(BotError::Cancelled),
            _ = ctx.shutdown.cancelled() => return Err(BotError::Cancelled),
            result = timeout(CHUNK_TIMEOUT, stream.read(&mut buf)) => match result {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(BotError::NetworkUnavailable(e.to_string())),
                Err(_) => return Err(BotError::NetworkUnavailable("stalled".into())),
            },
        };
        if n == 0 {
            break; // peer closed
        }

        // Ignore any surplus past the advertised size.
        let remaining = (offer.size - offset - received) as usize;
        let take = n.min(remaining);
        file.write_all(&buf[..take])
            .await
            .map_err(|e| BotError::Internal(format!("writing {}: {e}", part_path.display())))?;
        received += take as u64;
        window_bytes += take as u64;

        if !sniffed {
            sniff_buf.extend_from_slice(&buf[..take]);
            if sniff_buf.len() >= SNIFF_LEN || received + offset >= offer.size {
                sniffed = true;
                check_mimetype(ctx, &sniff_buf, &mut file, part_path).await?;
            }
        }

        // ACK the absolute file position truncated to 32 bits; XDCC
        // senders ignore the high bytes on large files.
        let ack = ((received + offset) & 0xffff_ffff) as u32;
        let _ = stream.write_all(&ack.to_be_bytes()).await;

        if window_start.elapsed() >= Duration::from_secs(1) {
            let window_secs = window_start.elapsed().as_secs_f64();
            let total_secs = started.elapsed().as_secs_f64();
            let speed = window_bytes as f64 / window_secs;
            let speed_avg = received as f64 / total_secs;
            ctx.registry.update(key, |r| {
                r.received = received;
                r.speed = speed;
                r.speed_avg = speed_avg;
            });
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    // Files smaller than the sniff window get checked with what arrived.
    if !sniffed && !sniff_buf.is_empty() {
        check_mimetype(ctx, &sniff_buf, &mut file, part_path).await?;
    }

    file.flush()
        .await
        .map_err(|e| BotError::Internal(e.to_string()))?;

    ctx.registry.update(key, |r| r.received = received);

    if received + offset < offer.size {
        return Err(BotError::ShortRead {
            received: received + offset,
            size: offer.size,
        });
    }
    Ok(())
}

async fn open_at(path: &Path, offset: u64) -> Result<File, BotError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| BotError::Internal(format!("opening {}: {e}", path.display())))?;
    // Drop any stale tail past the resume point before appending.
    file.set_len(offset)
        .await
        .map_err(|e| BotError::Internal(e.to_string()))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| BotError::Internal(e.to_string()))?;
    Ok(file)
}

/// Content gate: classify the buffered head and abort the transfer when the
/// type is not allowlisted. The partial is deleted — nothing disallowed
/// stays on disk.
async fn check_mimetype(
    ctx: &TransferContext,
    head: &[u8],
    file: &mut File,
    part_path: &Path,
) -> Result<(), BotError> {
    let mime = infer::get(head)
        .map(|kind| kind.mime_type().to_owned())
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    if ctx.config.allowed_mimetypes.contains(&mime) {
        return Ok(());
    }

    let _ = file.shutdown().await;
    let _ = fs::remove_file(part_path).await;
    Err(BotError::DisallowedMimeType(mime))
}

/// Compute the digest when required, rename away the incomplete suffix, and
/// reconcile against an advertised checksum. A mismatch fails the transfer
/// but keeps the renamed file.
async fn verify_and_rename(
    ctx: &TransferContext,
    key: &TransferKey,
    from: &Path,
    to: &Path,
) -> Result<(), BotError> {
    let advertised = ctx
        .registry
        .get(key)
        .and_then(|record| record.md5_advertised);

    let computed = if ctx.config.auto_md5sum || advertised.is_some() {
        let digest = md5_file(from.to_owned()).await?;
        info!("md5 of {} is {digest}", from.display());
        Some(digest)
    } else {
        None
    };

    if from != to {
        fs::rename(from, to)
            .await
            .map_err(|e| BotError::Internal(format!("renaming to {}: {e}", to.display())))?;
    }
    ctx.registry.update(key, |r| {
        r.path = to.to_owned();
        r.md5_computed = computed.clone();
    });

    if let (Some(advertised), Some(computed)) = (advertised, computed) {
        if !advertised.eq_ignore_ascii_case(&computed) {
            return Err(BotError::ChecksumMismatch {
                advertised,
                computed,
            });
        }
    }
    Ok(())
}

/// MD5 the whole file on the blocking pool.
pub async fn md5_file(path: PathBuf) -> Result<String, BotError> {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)
            .map_err(|e| BotError::Internal(format!("opening {}: {e}", path.display())))?;
        let mut hasher = Md5::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| BotError::Internal(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex_encode(hasher.finalize().as_slice()))
    })
    .await
    .map_err(|e| BotError::Internal(e.to_string()))?
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().map(|meta| meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn md5_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = md5_file(path).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn hex_encoding_is_lowercase_and_padded() {
        assert_eq!(hex_encode(&[0x00, 0x0f, 0xa0, 0xff]), "000fa0ff");
    }

    #[tokio::test]
    async fn open_at_truncates_stale_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part");
        std::fs::write(&path, vec![7u8; 100]).unwrap();

        let file = open_at(&path, 40).await.unwrap();
        drop(file);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
    }
}
