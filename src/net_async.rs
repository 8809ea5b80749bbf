//! Async (Tokio) transfer engine for the ferry client and daemon.
//!
//! Protocol per connection:
//!
//! ```text
//! client -> HANDSHAKE frame  "<path>|<size>|<digest>"
//! server -> ACK frame        PROCEED | SKIP | REJECTED
//! client -> raw payload      exactly <size> bytes, then write-half shutdown
//! server -> ACK frame        COMPLETED | TRUNCATED | FAILED
//! ```
//!
//! The engine functions are generic over the stream so they run on TCP
//! sockets and in-memory pipes alike.

use crate::error::{Result, TransferError};
use crate::protocol::frame;
use crate::protocol_core::{
    build_frame_header, parse_frame_header, validate_frame_size, Ack, AckStatus,
    TransferOutcome, TransferReport, TransferRequest,
};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Run one I/O step under a deadline; expiry aborts the transfer
async fn timed<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransferError::TransferAborted(format!(
            "{} timeout ({} ms)",
            what,
            limit.as_millis()
        ))),
    }
}

pub mod server {
    use super::*;
    use crate::checksum::{hash_file, DigestAlgorithm, Digester};
    use crate::config::ServerConfig;
    use crate::log::{TransferLog, TransferLogEntry};
    use crate::logger::Logger;
    use crate::progress::TransferProgress;
    use crate::protocol_core::{destination_path, ensure_dir_exists};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::OwnedMutexGuard;

    pub async fn write_frame<S>(stream: &mut S, t: u8, payload: &[u8], limit: Duration) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        validate_frame_size(t, payload.len())?;
        let hdr = build_frame_header(t, payload.len() as u32);
        timed(limit, "frame write", async {
            stream.write_all(&hdr).await?;
            if !payload.is_empty() {
                stream.write_all(payload).await?;
            }
            stream.flush().await
        })
        .await
    }

    pub async fn read_frame<S>(stream: &mut S, limit: Duration) -> Result<(u8, Vec<u8>)>
    where
        S: AsyncRead + Unpin,
    {
        let mut hdr = [0u8; 11];
        timed(limit, "frame header read", stream.read_exact(&mut hdr)).await?;
        let (typ, len) = parse_frame_header(&hdr)?;
        let len = len as usize;
        validate_frame_size(typ, len)?;
        let mut payload = vec![0u8; len];
        if len > 0 {
            timed(limit, "frame payload read", stream.read_exact(&mut payload)).await?;
        }
        Ok((typ, payload))
    }

    pub async fn write_ack<S>(stream: &mut S, ack: &Ack, limit: Duration) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        write_frame(stream, frame::ACK, &ack.encode(), limit).await
    }

    pub async fn read_ack<S>(stream: &mut S, limit: Duration) -> Result<Ack>
    where
        S: AsyncRead + Unpin,
    {
        let (typ, payload) = read_frame(stream, limit).await?;
        if typ != frame::ACK {
            return Err(TransferError::MalformedHandshake(format!(
                "expected ACK frame, got type {}",
                typ
            )));
        }
        Ack::decode(&payload)
    }

    /// Per-destination mutual exclusion shared by all connection tasks.
    /// An entry lives only while someone holds or waits for it.
    #[derive(Clone, Default)]
    pub struct PathLocks {
        inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
    }

    pub struct PathGuard {
        path: PathBuf,
        map: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
        guard: Option<OwnedMutexGuard<()>>,
    }

    impl PathLocks {
        pub async fn lock(&self, path: &Path) -> PathGuard {
            let slot = {
                let mut map = self.inner.lock();
                Arc::clone(map.entry(path.to_path_buf()).or_default())
            };
            let guard = slot.lock_owned().await;
            PathGuard {
                path: path.to_path_buf(),
                map: Arc::clone(&self.inner),
                guard: Some(guard),
            }
        }

        /// Number of destinations currently locked or awaited
        #[cfg(test)]
        pub(crate) fn len(&self) -> usize {
            self.inner.lock().len()
        }
    }

    impl Drop for PathGuard {
        fn drop(&mut self) {
            // Hold the map lock so nobody can clone the slot between the
            // release and the count check.
            let mut map = self.map.lock();
            drop(self.guard.take());
            let idle = map
                .get(&self.path)
                .is_some_and(|slot| Arc::strong_count(slot) == 1);
            if idle {
                map.remove(&self.path);
            }
        }
    }

    /// Everything a connection task needs; shared read-only across tasks
    pub struct ServerContext {
        pub config: ServerConfig,
        pub algorithm: DigestAlgorithm,
        pub logger: Arc<dyn Logger>,
        pub locks: PathLocks,
        pub journal: Option<TransferLog>,
    }

    impl ServerContext {
        /// Validates the config and creates the storage root if needed
        pub fn new(config: ServerConfig, logger: Arc<dyn Logger>) -> Result<Self> {
            let algorithm = config.transfer.algorithm()?;
            if ensure_dir_exists(&config.root)? {
                logger.info(&format!("A directory \"{}\" was created", config.root.display()));
            }
            let journal = config.journal.as_deref().map(TransferLog::new);
            Ok(Self {
                config,
                algorithm,
                logger,
                locks: PathLocks::default(),
                journal,
            })
        }

        pub fn root(&self) -> &Path {
            &self.config.root
        }

        fn io_timeout(&self) -> Duration {
            self.config.transfer.io_timeout()
        }
    }

    pub async fn serve(config: ServerConfig, logger: Arc<dyn Logger>) -> Result<()> {
        let ctx = Arc::new(ServerContext::new(config, logger)?);
        let listener = TcpListener::bind(ctx.config.bind.as_str()).await?;
        serve_listener(listener, ctx).await
    }

    /// Accept forever, one task per connection
    pub async fn serve_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
        let local = listener.local_addr()?;
        ctx.logger.listening(&local.to_string(), ctx.root());
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    ctx.logger.error("accept", &e.to_string());
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                handle_conn(stream, peer.to_string(), &ctx).await;
            });
        }
    }

    async fn handle_conn(mut stream: TcpStream, peer: String, ctx: &ServerContext) {
        ctx.logger.connected(&peer);
        let mut entry = TransferLogEntry::new(&peer);

        let result = async {
            let request = read_request(&mut stream, ctx).await?;
            entry.declared_path = Some(request.path.clone());
            entry.declared_size = Some(request.size);
            ctx.logger.handshake(&peer, &request);
            serve_request(&mut stream, ctx, &request).await
        }
        .await;

        match result {
            Ok(report) => {
                entry.destination = Some(report.path);
                entry.bytes_received = report.bytes;
                entry.outcome = Some(report.outcome);
            }
            Err(e) => {
                ctx.logger.error(&format!("connection {}", peer), &e.to_string());
                entry.error = Some(e.to_string());
            }
        }
        let _ = stream.shutdown().await;

        if let Some(journal) = &ctx.journal {
            if let Err(e) = journal.add_entry(&entry) {
                ctx.logger.error("journal", &e.to_string());
            }
        }
    }

    /// Serve one transfer on an accepted stream
    pub async fn receive_file<S>(stream: &mut S, ctx: &ServerContext, peer: &str) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = read_request(stream, ctx).await?;
        ctx.logger.handshake(peer, &request);
        serve_request(stream, ctx, &request).await
    }

    /// Read and decode the handshake; a bad one is answered with REJECTED
    pub async fn read_request<S>(stream: &mut S, ctx: &ServerContext) -> Result<TransferRequest>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let decoded = match read_frame(stream, ctx.io_timeout()).await {
            Ok((frame::HANDSHAKE, payload)) => {
                TransferRequest::decode(&payload).and_then(|req| check_digest_len(req, ctx.algorithm))
            }
            Ok((typ, _)) => Err(TransferError::MalformedHandshake(format!(
                "expected HANDSHAKE frame, got type {}",
                typ
            ))),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(request) => Ok(request),
            Err(e @ TransferError::MalformedHandshake(_)) => Err(reject(stream, ctx, e).await),
            Err(e) => Err(e),
        }
    }

    /// Both sides must hash with the same algorithm or dedup can never hit.
    /// sha256 and blake3 share a length, so only the length is checked.
    fn check_digest_len(req: TransferRequest, algorithm: DigestAlgorithm) -> Result<TransferRequest> {
        if req.digest.len() == algorithm.hex_len() {
            return Ok(req);
        }
        Err(TransferError::MalformedHandshake(format!(
            "digest has {} hex digits, receiver uses {} ({} digits)",
            req.digest.len(),
            algorithm,
            algorithm.hex_len()
        )))
    }

    /// Best-effort REJECTED ack, then hand the error back
    async fn reject<S>(stream: &mut S, ctx: &ServerContext, err: TransferError) -> TransferError
    where
        S: AsyncWrite + Unpin,
    {
        let ack = Ack::new(AckStatus::Rejected, err.to_string());
        let _ = write_ack(stream, &ack, ctx.io_timeout()).await;
        err
    }

    /// Dedup check, then stream the payload into the storage root
    pub async fn serve_request<S>(
        stream: &mut S,
        ctx: &ServerContext,
        request: &TransferRequest,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = ctx.io_timeout();
        let dest = match destination_path(ctx.root(), &request.path) {
            Ok(p) => p,
            Err(e) => return Err(reject(stream, ctx, e).await),
        };

        // Held until this transfer is fully settled
        let _lock = ctx.locks.lock(&dest).await;

        let result = match is_identical(&dest, &request.digest, ctx.algorithm).await {
            Ok(true) => skip(stream, ctx, request, dest).await,
            Ok(false) => stream_to_destination(stream, ctx, request, &dest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            let _ = write_ack(stream, &Ack::new(AckStatus::Failed, e.to_string()), limit).await;
        }
        result
    }

    async fn skip<S>(
        stream: &mut S,
        ctx: &ServerContext,
        request: &TransferRequest,
        dest: PathBuf,
    ) -> Result<TransferReport>
    where
        S: AsyncWrite + Unpin,
    {
        ctx.logger.skipped(&dest);
        close_with(stream, ctx, Ack::new(AckStatus::Skip, "identical file already exists")).await;
        Ok(TransferReport {
            request: request.clone(),
            path: dest,
            bytes: 0,
            outcome: TransferOutcome::Skipped,
        })
    }

    async fn stream_to_destination<S>(
        stream: &mut S,
        ctx: &ServerContext,
        request: &TransferRequest,
        dest: &Path,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let limit = ctx.io_timeout();

        // Partial data never shows up under the final name; the temp file is
        // removed on every early return.
        let tmp = tempfile::Builder::new()
            .prefix(".ferry-")
            .suffix(".part")
            .tempfile_in(ctx.root())?;
        let mut out = tokio::fs::File::from_std(tmp.as_file().try_clone()?);

        write_ack(stream, &Ack::new(AckStatus::Proceed, ""), limit).await?;

        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let progress = TransferProgress::new(&label, request.size, ctx.config.progress);
        let mut digester = ctx.config.verify_digest.then(|| Digester::new(ctx.algorithm));

        let chunk = ctx.config.transfer.chunk();
        let mut buf = vec![0u8; chunk];
        let mut received = 0u64;
        // Stop exactly at the declared size so no byte past the payload is consumed
        while received < request.size {
            let want = (request.size - received).min(chunk as u64) as usize;
            let n = timed(limit, "payload read", stream.read(&mut buf[..want])).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            if let Some(d) = digester.as_mut() {
                d.update(&buf[..n]);
            }
            received += n as u64;
            progress.advance(n as u64);
        }
        out.flush().await?;

        let mut report = TransferReport {
            request: request.clone(),
            path: dest.to_path_buf(),
            bytes: received,
            outcome: TransferOutcome::Completed,
        };

        if received != request.size {
            drop(out);
            drop(tmp);
            progress.abandon("truncated");
            ctx.logger.truncated(dest, request.size, received);
            let reason = TransferError::Truncated {
                expected: request.size,
                received,
            };
            report.outcome = TransferOutcome::Truncated;
            close_with(stream, ctx, Ack::new(AckStatus::Truncated, reason.to_string())).await;
            return Ok(report);
        }

        if let Some(d) = digester {
            let computed = d.finalize();
            if computed != request.digest {
                progress.abandon("digest mismatch");
                return Err(TransferError::DigestMismatch {
                    path: dest.to_path_buf(),
                    declared: request.digest.clone(),
                    computed,
                });
            }
        }

        out.sync_all().await?;
        drop(out);
        tmp.persist(dest).map_err(|e| e.error)?;
        progress.finish("received");
        ctx.logger.completed(dest, received);
        close_with(stream, ctx, Ack::new(AckStatus::Completed, "")).await;
        Ok(report)
    }

    /// Final ack once the outcome is settled. The peer may already be gone,
    /// which does not change what happened on disk.
    async fn close_with<S>(stream: &mut S, ctx: &ServerContext, ack: Ack)
    where
        S: AsyncWrite + Unpin,
    {
        if let Err(e) = write_ack(stream, &ack, ctx.io_timeout()).await {
            ctx.logger.error(&format!("{} ack", ack.status), &e.to_string());
        }
    }

    /// Existing, non-empty, and hashing to the declared digest
    async fn is_identical(dest: &Path, digest: &str, algorithm: DigestAlgorithm) -> Result<bool> {
        match tokio::fs::metadata(dest).await {
            Ok(md) if md.is_file() && md.len() > 0 => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        let path = dest.to_path_buf();
        let (_, existing) = tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        Ok(existing == digest)
    }
}

pub mod client {
    use super::server::{read_ack, write_frame};
    use super::*;
    use crate::checksum::hash_file;
    use crate::config::{ClientConfig, TransferConfig};
    use crate::logger::Logger;
    use crate::progress::TransferProgress;
    use std::path::Path;
    use tokio::net::TcpStream;

    pub async fn connect(host: &str, port: u16) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Connect, retrying after a fixed backoff. Unlimited attempts unless
    /// `max_connect_attempts` is set.
    pub async fn connect_with_retry(
        host: &str,
        port: u16,
        cfg: &ClientConfig,
        logger: &dyn Logger,
    ) -> Result<TcpStream> {
        let addr = format!("{}:{}", host, port);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match connect(host, port).await {
                Ok(stream) => {
                    logger.connected(&addr);
                    return Ok(stream);
                }
                Err(e) => {
                    if cfg.max_connect_attempts.is_some_and(|max| attempt >= max) {
                        return Err(TransferError::ConnectionFailed {
                            addr,
                            attempts: attempt,
                            source: e,
                        });
                    }
                    logger.retry(&addr, attempt, &e.to_string());
                    tokio::time::sleep(cfg.retry_delay()).await;
                }
            }
        }
    }

    /// Offer `path` to the receiver and stream it if asked to.
    ///
    /// Returns the receiver's verdict. A file that changes size between
    /// hashing and streaming is logged as a size mismatch; the receiver
    /// then reports the transfer as truncated or, if the file grew,
    /// completed with the declared prefix.
    pub async fn send_file<S>(
        stream: &mut S,
        path: &Path,
        cfg: &TransferConfig,
        logger: &dyn Logger,
        show_progress: bool,
    ) -> Result<TransferReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let algorithm = cfg.algorithm()?;
        let limit = cfg.io_timeout();

        let owned = path.to_path_buf();
        let (size, digest) = tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        let request = TransferRequest::new(path.to_string_lossy(), size, digest);
        logger.debug(&format!("{} is {} bytes, {} {}", path.display(), size, algorithm, request.digest));

        write_frame(stream, frame::HANDSHAKE, &request.encode()?, limit).await?;

        let ack = read_ack(stream, limit).await?;
        match ack.status {
            AckStatus::Proceed => {}
            AckStatus::Skip => {
                logger.skipped(path);
                return Ok(TransferReport {
                    request,
                    path: path.to_path_buf(),
                    bytes: 0,
                    outcome: TransferOutcome::Skipped,
                });
            }
            AckStatus::Rejected | AckStatus::Failed => return Err(TransferError::Rejected(ack.reason)),
            other => {
                return Err(TransferError::MalformedHandshake(format!(
                    "unexpected {} in reply to handshake",
                    other
                )))
            }
        }

        let progress = TransferProgress::new("Sending file...", size, show_progress);
        let (sent, read_total) = stream_file(stream, path, size, cfg, &progress).await?;
        timed(limit, "shutdown", stream.shutdown()).await?;

        if read_total != size {
            logger.size_mismatch(path, size, read_total);
        }

        let done = read_ack(stream, limit).await?;
        let outcome = match done.status {
            AckStatus::Completed => {
                progress.finish("sent");
                logger.completed(path, sent);
                TransferOutcome::Completed
            }
            AckStatus::Truncated => {
                progress.abandon("truncated");
                logger.truncated(path, size, sent);
                TransferOutcome::Truncated
            }
            AckStatus::Rejected | AckStatus::Failed => {
                progress.abandon("failed");
                return Err(TransferError::Rejected(done.reason));
            }
            other => {
                return Err(TransferError::MalformedHandshake(format!(
                    "unexpected {} after payload",
                    other
                )))
            }
        };

        Ok(TransferReport {
            request,
            path: path.to_path_buf(),
            bytes: sent,
            outcome,
        })
    }

    /// Copy the file to the stream, never past `size` bytes.
    /// Returns (bytes sent, bytes read from the file).
    pub(super) async fn stream_file<S>(
        stream: &mut S,
        path: &Path,
        size: u64,
        cfg: &TransferConfig,
        progress: &TransferProgress,
    ) -> Result<(u64, u64)>
    where
        S: AsyncWrite + Unpin,
    {
        let limit = cfg.io_timeout();
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; cfg.chunk()];
        let mut sent = 0u64;
        let mut read_total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            read_total += n as u64;
            let allowed = (size - sent).min(n as u64) as usize;
            if allowed > 0 {
                timed(limit, "payload write", stream.write_all(&buf[..allowed])).await?;
                sent += allowed as u64;
                progress.advance(allowed as u64);
            }
            // File grew after hashing; the extra bytes are never sent
            if read_total > size {
                break;
            }
        }
        timed(limit, "payload flush", stream.flush()).await?;
        Ok((sent, read_total))
    }

    /// Connect with retry and send one file
    pub async fn push(
        host: &str,
        port: u16,
        path: &Path,
        cfg: &ClientConfig,
        logger: &dyn Logger,
    ) -> Result<TransferReport> {
        let mut stream = connect_with_retry(host, port, cfg, logger).await?;
        send_file(&mut stream, path, &cfg.transfer, logger, cfg.progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::server::{read_ack, receive_file, write_frame, PathLocks, ServerContext};
    use super::*;
    use crate::checksum::{digest_bytes, DigestAlgorithm};
    use crate::config::{ServerConfig, TransferConfig};
    use crate::logger::NoopLogger;
    use crate::progress::TransferProgress;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    fn server_ctx(root: &Path, verify: bool) -> ServerContext {
        let config = ServerConfig {
            root: root.to_path_buf(),
            verify_digest: verify,
            transfer: TransferConfig {
                chunk_bytes: 7,
                ..TransferConfig::default()
            },
            ..ServerConfig::default()
        };
        ServerContext::new(config, Arc::new(NoopLogger)).unwrap()
    }

    fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, data).unwrap();
        p
    }

    async fn run_pair(src: &Path, ctx: &ServerContext) -> (Result<TransferReport>, Result<TransferReport>) {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let cfg = TransferConfig::default();
        tokio::join!(
            client::send_file(&mut a, src, &cfg, &NoopLogger, false),
            receive_file(&mut b, ctx, "test-peer"),
        )
    }

    const LIMIT: Duration = Duration::from_secs(5);

    // Well-formed sha256-length digest that matches nothing
    fn fake_digest() -> String {
        "ab".repeat(32)
    }

    async fn raw_handshake(stream: &mut DuplexStream, text: &str) -> Ack {
        write_frame(stream, frame::HANDSHAKE, text.as_bytes(), LIMIT).await.unwrap();
        read_ack(stream, LIMIT).await.unwrap()
    }

    fn visible_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let src = write_source(src_dir.path(), "blob.bin", &data);
        let ctx = server_ctx(root.path(), false);

        let (sent, got) = run_pair(&src, &ctx).await;
        let sent = sent.unwrap();
        let got = got.unwrap();
        assert_eq!(sent.outcome, TransferOutcome::Completed);
        assert_eq!(got.outcome, TransferOutcome::Completed);
        assert_eq!(sent.bytes, data.len() as u64);
        assert_eq!(got.path, root.path().join("blob.bin"));
        assert_eq!(std::fs::read(&got.path).unwrap(), data);
        assert_eq!(got.request.digest, digest_bytes(&data, DigestAlgorithm::Sha256));
        // No temp files left behind
        assert_eq!(visible_files(root.path()), vec!["blob.bin".to_string()]);
    }

    #[tokio::test]
    async fn second_transfer_is_skipped_without_payload() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_source(src_dir.path(), "report.txt", b"quarterly numbers");
        let ctx = server_ctx(root.path(), false);

        let (first, _) = run_pair(&src, &ctx).await;
        assert_eq!(first.unwrap().outcome, TransferOutcome::Completed);

        let (sent, got) = run_pair(&src, &ctx).await;
        let sent = sent.unwrap();
        assert_eq!(sent.outcome, TransferOutcome::Skipped);
        assert_eq!(sent.bytes, 0);
        assert_eq!(got.unwrap().outcome, TransferOutcome::Skipped);
    }

    #[tokio::test]
    async fn changed_content_overwrites_destination() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("notes.md"), b"old text").unwrap();
        let src = write_source(src_dir.path(), "notes.md", b"new text, longer");
        let ctx = server_ctx(root.path(), false);

        let (_, got) = run_pair(&src, &ctx).await;
        assert_eq!(got.unwrap().outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::read(root.path().join("notes.md")).unwrap(), b"new text, longer");
    }

    #[tokio::test]
    async fn zero_byte_file_completes_immediately() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_source(src_dir.path(), "empty.dat", b"");
        let ctx = server_ctx(root.path(), false);

        let (sent, got) = run_pair(&src, &ctx).await;
        assert_eq!(sent.unwrap().request.size, 0);
        let got = got.unwrap();
        assert_eq!(got.outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::metadata(&got.path).unwrap().len(), 0);

        // An existing empty file is never a dedup hit
        let (sent, _) = run_pair(&src, &ctx).await;
        assert_eq!(sent.unwrap().outcome, TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn zero_size_request_needs_no_payload_read() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);
        let empty = digest_bytes(b"", DigestAlgorithm::Sha256);

        // The client never shuts down its write half; a payload read would hang
        let client = async {
            let proceed = raw_handshake(&mut a, &format!("z.bin|0|{}", empty)).await;
            assert_eq!(proceed.status, AckStatus::Proceed);
            read_ack(&mut a, LIMIT).await.unwrap()
        };
        let (done, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(done.status, AckStatus::Completed);
        assert_eq!(got.unwrap().outcome, TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn wrong_digest_is_stored_when_verification_is_off() {
        // Known gap: the declared digest is only used for dedup
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);
        let bogus = digest_bytes(b"something else", DigestAlgorithm::Sha256);

        let client = async {
            let ack = raw_handshake(&mut a, &format!("a.txt|5|{}", bogus)).await;
            assert_eq!(ack.status, AckStatus::Proceed);
            a.write_all(b"hello").await.unwrap();
            a.shutdown().await.unwrap();
            read_ack(&mut a, LIMIT).await.unwrap()
        };
        let (done, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(done.status, AckStatus::Completed);
        assert_eq!(got.unwrap().outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn wrong_digest_is_discarded_when_verification_is_on() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), true);
        let (mut a, mut b) = tokio::io::duplex(1024);
        let bogus = digest_bytes(b"something else", DigestAlgorithm::Sha256);

        let client = async {
            raw_handshake(&mut a, &format!("a.txt|5|{}", bogus)).await;
            a.write_all(b"hello").await.unwrap();
            read_ack(&mut a, LIMIT).await.unwrap()
        };
        let (done, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(done.status, AckStatus::Failed);
        assert!(matches!(got, Err(TransferError::DigestMismatch { .. })));
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn early_close_is_truncated_and_leaves_no_file() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);

        let client = async {
            raw_handshake(&mut a, &format!("part.bin|10|{}", fake_digest())).await;
            a.write_all(b"1234").await.unwrap();
            a.shutdown().await.unwrap();
            read_ack(&mut a, LIMIT).await.unwrap()
        };
        let (done, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(done.status, AckStatus::Truncated);
        let got = got.unwrap();
        assert_eq!(got.outcome, TransferOutcome::Truncated);
        assert_eq!(got.bytes, 4);
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn sender_vanishing_mid_stream_is_still_truncated() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);

        // The final ack has nowhere to go
        let client = async move {
            let ack = raw_handshake(&mut a, &format!("part.bin|10|{}", fake_digest())).await;
            assert_eq!(ack.status, AckStatus::Proceed);
            a.write_all(b"1234").await.unwrap();
            drop(a);
        };
        let (_, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        let got = got.unwrap();
        assert_eq!(got.outcome, TransferOutcome::Truncated);
        assert_eq!(got.bytes, 4);
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn sender_vanishing_after_payload_still_completes() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);
        let digest = digest_bytes(b"hello", DigestAlgorithm::Sha256);

        let client = async move {
            raw_handshake(&mut a, &format!("a.txt|5|{}", digest)).await;
            a.write_all(b"hello").await.unwrap();
            drop(a);
        };
        let (_, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(got.unwrap().outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::read(root.path().join("a.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn digest_from_another_algorithm_is_rejected() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_source(src_dir.path(), "report.txt", b"quarterly numbers");
        let ctx = server_ctx(root.path(), false);
        let cfg = TransferConfig {
            algorithm: "md5".into(),
            ..TransferConfig::default()
        };

        for _ in 0..2 {
            let (mut a, mut b) = tokio::io::duplex(64 * 1024);
            let (sent, got) = tokio::join!(
                client::send_file(&mut a, &src, &cfg, &NoopLogger, false),
                receive_file(&mut b, &ctx, "test-peer"),
            );
            match sent {
                Err(TransferError::Rejected(reason)) => assert!(reason.contains("sha256"), "{}", reason),
                other => panic!("expected Rejected, got {:?}", other),
            }
            assert!(matches!(got, Err(TransferError::MalformedHandshake(_))));
            assert!(visible_files(root.path()).is_empty());
        }
    }

    #[tokio::test]
    async fn file_grown_after_hashing_sends_only_declared_bytes() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_source(src_dir.path(), "grew.bin", b"0123456789");
        let ctx = server_ctx(root.path(), false);
        let cfg = TransferConfig {
            chunk_bytes: 3,
            ..TransferConfig::default()
        };
        let (mut a, mut b) = tokio::io::duplex(1024);
        let digest = digest_bytes(b"0123", DigestAlgorithm::Sha256);

        let client = async {
            raw_handshake(&mut a, &format!("grew.bin|4|{}", digest)).await;
            let progress = TransferProgress::new("grew.bin", 4, false);
            let counts = client::stream_file(&mut a, &src, 4, &cfg, &progress).await.unwrap();
            a.shutdown().await.unwrap();
            (counts, read_ack(&mut a, LIMIT).await.unwrap())
        };
        let (((sent, read), done), got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(sent, 4);
        assert!(read > 4);
        assert_eq!(done.status, AckStatus::Completed);
        assert_eq!(got.unwrap().outcome, TransferOutcome::Completed);
        assert_eq!(std::fs::read(root.path().join("grew.bin")).unwrap(), b"0123");
    }

    #[tokio::test]
    async fn file_shrunk_after_hashing_is_truncated() {
        let src_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_source(src_dir.path(), "shrunk.bin", b"0123");
        let ctx = server_ctx(root.path(), false);
        let cfg = TransferConfig::default();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let client = async {
            raw_handshake(&mut a, &format!("shrunk.bin|10|{}", fake_digest())).await;
            let progress = TransferProgress::new("shrunk.bin", 10, false);
            let counts = client::stream_file(&mut a, &src, 10, &cfg, &progress).await.unwrap();
            a.shutdown().await.unwrap();
            (counts, read_ack(&mut a, LIMIT).await.unwrap())
        };
        let ((counts, done), got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(counts, (4, 4));
        assert_eq!(done.status, AckStatus::Truncated);
        let got = got.unwrap();
        assert_eq!(got.outcome, TransferOutcome::Truncated);
        assert_eq!(got.bytes, 4);
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn payload_past_declared_size_is_not_consumed() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);

        let client = async {
            raw_handshake(&mut a, &format!("three.bin|3|{}", fake_digest())).await;
            a.write_all(b"abcXYZ").await.unwrap();
            read_ack(&mut a, LIMIT).await.unwrap()
        };
        let (done, got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(done.status, AckStatus::Completed);
        assert_eq!(got.unwrap().bytes, 3);
        assert_eq!(std::fs::read(root.path().join("three.bin")).unwrap(), b"abc");

        let mut rest = [0u8; 3];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"XYZ");
    }

    #[tokio::test]
    async fn two_field_handshake_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);

        let (ack, got) = tokio::join!(
            raw_handshake(&mut a, "client/report.txt|17"),
            receive_file(&mut b, &ctx, "raw")
        );
        assert_eq!(ack.status, AckStatus::Rejected);
        assert!(matches!(got, Err(TransferError::MalformedHandshake(_))));
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ctx = server_ctx(root.path(), false);
        let (mut a, mut b) = tokio::io::duplex(1024);

        let text = format!("../../etc/cron.d/x|1|{}", fake_digest());
        let (ack, got) = tokio::join!(
            raw_handshake(&mut a, &text),
            receive_file(&mut b, &ctx, "raw")
        );
        assert_eq!(ack.status, AckStatus::Rejected);
        assert!(matches!(got, Err(TransferError::UnsafePath { .. })));
    }

    #[tokio::test]
    async fn stalled_sender_aborts() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = server_ctx(root.path(), false);
        ctx.config.transfer.io_timeout_ms = 50;
        let (mut a, mut b) = tokio::io::duplex(1024);

        let client = async {
            write_frame(&mut a, frame::HANDSHAKE, format!("slow.bin|10|{}", fake_digest()).as_bytes(), LIMIT).await.unwrap();
            // Keep the stream open without sending payload
            let proceed = read_ack(&mut a, LIMIT).await.unwrap();
            let failed = read_ack(&mut a, LIMIT).await.unwrap();
            (proceed, failed)
        };
        let ((proceed, failed), got) = tokio::join!(client, receive_file(&mut b, &ctx, "raw"));
        assert_eq!(proceed.status, AckStatus::Proceed);
        assert_eq!(failed.status, AckStatus::Failed);
        assert!(matches!(got, Err(TransferError::TransferAborted(_))));
        assert!(visible_files(root.path()).is_empty());
    }

    #[tokio::test]
    async fn path_locks_serialize_and_clean_up() {
        let locks = PathLocks::default();
        let p = Path::new("server/same.bin");

        let first = locks.lock(p).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(Path::new("server/same.bin")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(locks.len(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
