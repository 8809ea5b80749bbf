use crate::error::TransferError;
use crate::protocol_core::TransferRequest;
use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Transfer event sink. Built once in `main` and handed to every component
/// as `Arc<dyn Logger>`; every hook defaults to a no-op.
pub trait Logger: Send + Sync {
    fn listening(&self, _bind: &str, _root: &Path) {}
    fn connected(&self, _peer: &str) {}
    fn retry(&self, _addr: &str, _attempt: u32, _msg: &str) {}
    fn handshake(&self, _peer: &str, _req: &TransferRequest) {}
    fn skipped(&self, _path: &Path) {}
    fn completed(&self, _path: &Path, _bytes: u64) {}
    fn truncated(&self, _path: &Path, _expected: u64, _received: u64) {}
    fn size_mismatch(&self, _path: &Path, _declared: u64, _sent: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Append-only key=value event log
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn listening(&self, bind: &str, root: &Path) {
        self.line(&format!("LISTEN bind={} root={}", bind, root.display()));
    }
    fn connected(&self, peer: &str) {
        self.line(&format!("CONNECT peer={}", peer));
    }
    fn retry(&self, addr: &str, attempt: u32, msg: &str) {
        self.line(&format!("RETRY addr={} attempt={} msg={}", addr, attempt, msg));
    }
    fn handshake(&self, peer: &str, req: &TransferRequest) {
        self.line(&format!(
            "HANDSHAKE peer={} path={} size={} digest={}",
            peer, req.path, req.size, req.digest
        ));
    }
    fn skipped(&self, path: &Path) {
        self.line(&format!("SKIP path={}", path.display()));
    }
    fn completed(&self, path: &Path, bytes: u64) {
        self.line(&format!("DONE path={} bytes={}", path.display(), bytes));
    }
    fn truncated(&self, path: &Path, expected: u64, received: u64) {
        self.line(&format!(
            "TRUNCATED path={} expected={} received={}",
            path.display(),
            expected,
            received
        ));
    }
    fn size_mismatch(&self, path: &Path, declared: u64, sent: u64) {
        self.line(&format!(
            "SIZE_MISMATCH path={} declared={} sent={}",
            path.display(),
            declared,
            sent
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn info(&self, msg: &str) {
        self.line(&format!("INFO msg={}", msg));
    }
}

/// Human-readable stderr output with a severity level per line
pub struct ConsoleLogger {
    name: &'static str,
    verbose: bool,
}

impl ConsoleLogger {
    pub fn new(name: &'static str, verbose: bool) -> Self {
        Self { name, verbose }
    }

    fn line(&self, level: &str, msg: &str) -> String {
        format!("[{}] {} {} - {}", self.name, Utc::now().to_rfc3339(), level, msg)
    }

    fn emit(&self, level: &str, msg: &str) {
        eprintln!("{}", self.line(level, msg));
    }
}

impl Logger for ConsoleLogger {
    fn listening(&self, bind: &str, root: &Path) {
        self.emit("INFO", &format!("Waiting for a connection on {} (root {})", bind, root.display()));
    }
    fn connected(&self, peer: &str) {
        self.emit("INFO", &format!("{} connected", peer));
    }
    fn retry(&self, addr: &str, attempt: u32, msg: &str) {
        self.emit("INFO", &format!("Couldn't connect to {} (attempt {})", addr, attempt));
        if self.verbose {
            self.emit("DEBUG", msg);
        }
    }
    fn handshake(&self, peer: &str, req: &TransferRequest) {
        if self.verbose {
            self.emit(
                "DEBUG",
                &format!("{} offers {} ({} bytes, digest {})", peer, req.path, req.size, req.digest),
            );
        }
    }
    fn skipped(&self, path: &Path) {
        self.emit("WARNING", &format!("Identical file already exists: {}", path.display()));
    }
    fn completed(&self, path: &Path, bytes: u64) {
        self.emit("INFO", &format!("File transferred successfully! {} ({} bytes)", path.display(), bytes));
    }
    fn truncated(&self, path: &Path, expected: u64, received: u64) {
        self.emit(
            "ERROR",
            &format!("Transfer of {} stopped at {} of {} bytes", path.display(), received, expected),
        );
    }
    fn size_mismatch(&self, path: &Path, declared: u64, sent: u64) {
        self.emit("ERROR", &size_mismatch_message(path, declared, sent));
    }
    fn error(&self, context: &str, msg: &str) {
        self.emit("ERROR", &format!("{}: {}", context, msg));
    }
    fn info(&self, msg: &str) {
        self.emit("INFO", msg);
    }
    fn debug(&self, msg: &str) {
        if self.verbose {
            self.emit("DEBUG", msg);
        }
    }
}

fn size_mismatch_message(path: &Path, declared: u64, sent: u64) -> String {
    let err = TransferError::SizeMismatch { declared, sent };
    format!("{} changed while sending: {}", path.display(), err)
}

/// Forwards every event to each inner logger
pub struct FanoutLogger {
    sinks: Vec<Arc<dyn Logger>>,
}

impl FanoutLogger {
    pub fn new(sinks: Vec<Arc<dyn Logger>>) -> Self {
        Self { sinks }
    }
}

impl Logger for FanoutLogger {
    fn listening(&self, bind: &str, root: &Path) {
        self.sinks.iter().for_each(|s| s.listening(bind, root));
    }
    fn connected(&self, peer: &str) {
        self.sinks.iter().for_each(|s| s.connected(peer));
    }
    fn retry(&self, addr: &str, attempt: u32, msg: &str) {
        self.sinks.iter().for_each(|s| s.retry(addr, attempt, msg));
    }
    fn handshake(&self, peer: &str, req: &TransferRequest) {
        self.sinks.iter().for_each(|s| s.handshake(peer, req));
    }
    fn skipped(&self, path: &Path) {
        self.sinks.iter().for_each(|s| s.skipped(path));
    }
    fn completed(&self, path: &Path, bytes: u64) {
        self.sinks.iter().for_each(|s| s.completed(path, bytes));
    }
    fn truncated(&self, path: &Path, expected: u64, received: u64) {
        self.sinks.iter().for_each(|s| s.truncated(path, expected, received));
    }
    fn size_mismatch(&self, path: &Path, declared: u64, sent: u64) {
        self.sinks.iter().for_each(|s| s.size_mismatch(path, declared, sent));
    }
    fn error(&self, context: &str, msg: &str) {
        self.sinks.iter().for_each(|s| s.error(context, msg));
    }
    fn info(&self, msg: &str) {
        self.sinks.iter().for_each(|s| s.info(msg));
    }
    fn debug(&self, msg: &str) {
        self.sinks.iter().for_each(|s| s.debug(msg));
    }
}

/// Console output plus an optional log file
pub fn build_logger(name: &'static str, verbose: bool, log_file: Option<&Path>) -> Result<Arc<dyn Logger>> {
    let console: Arc<dyn Logger> = Arc::new(ConsoleLogger::new(name, verbose));
    match log_file {
        Some(p) => {
            let text: Arc<dyn Logger> = Arc::new(TextLogger::new(p)?);
            Ok(Arc::new(FanoutLogger::new(vec![console, text])))
        }
        None => Ok(console),
    }
}
