use crate::protocol_core::TransferOutcome;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub transfer_id: String,
    pub peer: String,
    /// Declared path as sent by the peer; None when the handshake was unreadable
    pub declared_path: Option<String>,
    pub declared_size: Option<u64>,
    pub destination: Option<PathBuf>,
    pub bytes_received: u64,
    /// None when the transfer failed before an outcome was reached
    pub outcome: Option<TransferOutcome>,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn new(peer: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id: Uuid::new_v4().to_string(),
            peer: peer.to_string(),
            declared_path: None,
            declared_size: None,
            destination: None,
            bytes_received: 0,
            outcome: None,
            error: None,
        }
    }
}

/// Append-only JSON-lines journal kept by the receiver
pub struct TransferLog {
    log_file_path: PathBuf,
    // Serializes appends from concurrent connection tasks
    write_lock: Mutex<()>,
}

impl TransferLog {
    pub fn new(path: &Path) -> Self {
        TransferLog {
            log_file_path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.log_file_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransferLog::new(&dir.path().join("journal.jsonl"));
        assert!(log.read_log().unwrap().is_empty());

        let mut first = TransferLogEntry::new("10.0.0.2:4000");
        first.declared_path = Some("client/report.txt".into());
        first.declared_size = Some(17);
        first.bytes_received = 17;
        first.outcome = Some(TransferOutcome::Completed);
        log.add_entry(&first).unwrap();

        let mut second = TransferLogEntry::new("10.0.0.2:4001");
        second.error = Some("malformed handshake: expected 3 fields, got 2".into());
        log.add_entry(&second).unwrap();

        let entries = log.read_log().unwrap();
        assert_eq!(entries, vec![first.clone(), second]);
        assert_ne!(entries[0].transfer_id, entries[1].transfer_id);
    }
}
