//! Receiver-side transfer log: an append-only record of file sizes and
//! persisted block ranges, enabling crash-safe download resumption.
//!
//! Only the log-writer thread appends; resumption readers parse a frozen
//! snapshot before the writer opens. A torn tail entry (crash mid-append)
//! is tolerated: parsing stops at the first short read.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, UNIX_EPOCH};

use crate::protocol::{
    read_string, read_varint, write_string, write_varint, FileChunks, MAX_PATH_LEN,
};

/// Log file name, kept at the root of the receive directory.
pub const LOG_NAME: &str = ".wdt.log";

const LOG_MAGIC: &[u8; 4] = b"WDTL";
const LOG_VERSION: u8 = 2;

mod entry_kind {
    pub const FILE_CREATED: u8 = 1;
    pub const BLOCK_WRITTEN: u8 = 2;
    pub const FILE_INVALIDATED: u8 = 3;
    pub const FILE_RESIZED: u8 = 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferLogEntry {
    FileCreated {
        seq_id: u64,
        rel_path: String,
        size: u64,
        /// Destination file mtime right after creation, unix seconds.
        mtime: u64,
    },
    BlockWritten {
        seq_id: u64,
        offset: u64,
        length: u64,
    },
    FileInvalidated {
        seq_id: u64,
    },
    FileResized {
        seq_id: u64,
        new_size: u64,
    },
}

impl TransferLogEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TransferLogEntry::FileCreated {
                seq_id,
                rel_path,
                size,
                mtime,
            } => {
                buf.push(entry_kind::FILE_CREATED);
                write_varint(buf, *seq_id);
                write_string(buf, rel_path);
                write_varint(buf, *size);
                write_varint(buf, *mtime);
            }
            TransferLogEntry::BlockWritten {
                seq_id,
                offset,
                length,
            } => {
                buf.push(entry_kind::BLOCK_WRITTEN);
                write_varint(buf, *seq_id);
                write_varint(buf, *offset);
                write_varint(buf, *length);
            }
            TransferLogEntry::FileInvalidated { seq_id } => {
                buf.push(entry_kind::FILE_INVALIDATED);
                write_varint(buf, *seq_id);
            }
            TransferLogEntry::FileResized { seq_id, new_size } => {
                buf.push(entry_kind::FILE_RESIZED);
                write_varint(buf, *seq_id);
                write_varint(buf, *new_size);
            }
        }
    }

    fn decode(body: &[u8]) -> Result<TransferLogEntry> {
        let mut r = body;
        let mut kind = [0u8; 1];
        r.read_exact(&mut kind).context("entry kind")?;
        let entry = match kind[0] {
            entry_kind::FILE_CREATED => TransferLogEntry::FileCreated {
                seq_id: read_varint(&mut r)?,
                rel_path: read_string(&mut r, MAX_PATH_LEN)?,
                size: read_varint(&mut r)?,
                mtime: read_varint(&mut r)?,
            },
            entry_kind::BLOCK_WRITTEN => TransferLogEntry::BlockWritten {
                seq_id: read_varint(&mut r)?,
                offset: read_varint(&mut r)?,
                length: read_varint(&mut r)?,
            },
            entry_kind::FILE_INVALIDATED => TransferLogEntry::FileInvalidated {
                seq_id: read_varint(&mut r)?,
            },
            entry_kind::FILE_RESIZED => TransferLogEntry::FileResized {
                seq_id: read_varint(&mut r)?,
                new_size: read_varint(&mut r)?,
            },
            other => bail!("unknown log entry kind {}", other),
        };
        Ok(entry)
    }
}

/// Fixed header written once when the log file is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u8,
    pub transfer_id: String,
    pub block_size: u64,
}

impl LogHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(self.version);
        write_string(buf, &self.transfer_id);
        write_varint(buf, self.block_size);
    }

    fn decode<R: Read>(r: &mut R) -> Result<LogHeader> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).context("log magic")?;
        if &magic != LOG_MAGIC {
            bail!("not a transfer log (bad magic)");
        }
        let mut version = [0u8; 1];
        r.read_exact(&mut version).context("log version")?;
        if version[0] > LOG_VERSION {
            bail!("log format version {} is newer than {}", version[0], LOG_VERSION);
        }
        Ok(LogHeader {
            version: version[0],
            transfer_id: read_string(r, MAX_PATH_LEN)?,
            block_size: read_varint(r)?,
        })
    }
}

enum LogMsg {
    Entry(TransferLogEntry),
    Shutdown,
}

/// Owns the log file through a dedicated writer thread.
pub struct TransferLogManager {
    path: PathBuf,
    tx: Option<mpsc::Sender<LogMsg>>,
    handle: Option<JoinHandle<()>>,
}

impl TransferLogManager {
    pub fn log_path(root: &Path) -> PathBuf {
        root.join(LOG_NAME)
    }

    /// Open (appending) or create the log under `root`. A fresh file gets a
    /// header stamped with `transfer_id`; `fsync_per_block` makes every
    /// block entry durable before the matching ACK can cover it.
    pub fn open(
        root: &Path,
        transfer_id: &str,
        block_size: u64,
        fsync_per_block: bool,
    ) -> Result<TransferLogManager> {
        let path = Self::log_path(root);
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open transfer log {}", path.display()))?;
        if fresh {
            let mut buf = Vec::new();
            LogHeader {
                version: LOG_VERSION,
                transfer_id: transfer_id.to_string(),
                block_size,
            }
            .encode(&mut buf);
            file.write_all(&buf).context("write log header")?;
            file.sync_data().context("sync log header")?;
        }
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("wdt-log-writer".into())
            .spawn(move || writer_loop(file, rx, fsync_per_block))
            .context("spawn log writer")?;
        Ok(TransferLogManager {
            path,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an entry for the writer thread. Errors after shutdown are
    /// ignored; by then the transfer is already unwinding.
    pub fn append(&self, entry: TransferLogEntry) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LogMsg::Entry(entry));
        }
    }

    /// Flush and stop the writer thread.
    pub fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(LogMsg::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransferLogManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(mut file: File, rx: mpsc::Receiver<LogMsg>, fsync_per_block: bool) {
    let mut buf = Vec::with_capacity(256);
    let mut dirty = false;
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(LogMsg::Entry(entry)) => {
                buf.clear();
                entry.encode(&mut buf);
                let len = buf.len() as u16;
                if file.write_all(&len.to_le_bytes()).is_err() || file.write_all(&buf).is_err() {
                    eprintln!("transfer log write failed, resumption disabled for this run");
                    break;
                }
                let block = matches!(entry, TransferLogEntry::BlockWritten { .. });
                if (block && fsync_per_block) || !block {
                    let _ = file.sync_data();
                    dirty = false;
                } else {
                    dirty = true;
                }
            }
            Ok(LogMsg::Shutdown) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if dirty {
                    let _ = file.sync_data();
                    dirty = false;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = file.sync_data();
}

/// One file reconstructed from the log.
#[derive(Debug, Clone)]
pub struct ParsedLogFile {
    pub seq_id: u64,
    pub rel_path: String,
    pub size: u64,
    pub mtime: u64,
    pub invalidated: bool,
    /// Coalesced persisted ranges, ascending, non-overlapping.
    pub ranges: Vec<(u64, u64)>,
}

#[derive(Debug, Clone)]
pub struct ParsedLog {
    pub header: LogHeader,
    pub files: Vec<ParsedLogFile>,
}

/// Read the log back, reconciling block entries into per-file owned-range
/// sets. A truncated final entry ends parsing without error.
pub fn parse_log(path: &Path) -> Result<ParsedLog> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut r = &data[..];
    let header = LogHeader::decode(&mut r)?;
    let mut files: Vec<ParsedLogFile> = Vec::new();
    let mut by_seq: HashMap<u64, usize> = HashMap::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();

    loop {
        if r.len() < 2 {
            break;
        }
        let len = u16::from_le_bytes([r[0], r[1]]) as usize;
        if r.len() < 2 + len {
            // torn tail from a crash mid-append
            break;
        }
        let body = &r[2..2 + len];
        r = &r[2 + len..];
        let entry = match TransferLogEntry::decode(body) {
            Ok(e) => e,
            Err(e) => bail!("corrupt log entry: {}", e),
        };
        match entry {
            TransferLogEntry::FileCreated {
                seq_id,
                rel_path,
                size,
                mtime,
            } => {
                // a later session re-announcing the same path supersedes the
                // earlier record unless sizes agree, in which case ranges merge
                if let Some(&prev) = by_path.get(&rel_path) {
                    if files[prev].size != size {
                        files[prev].invalidated = true;
                    } else {
                        // a fresh announcement restarts an invalidated file
                        files[prev].invalidated = false;
                        by_seq.insert(seq_id, prev);
                        continue;
                    }
                }
                let idx = files.len();
                files.push(ParsedLogFile {
                    seq_id,
                    rel_path: rel_path.clone(),
                    size,
                    mtime,
                    invalidated: false,
                    ranges: Vec::new(),
                });
                by_seq.insert(seq_id, idx);
                by_path.insert(rel_path, idx);
            }
            TransferLogEntry::BlockWritten {
                seq_id,
                offset,
                length,
            } => {
                if let Some(&idx) = by_seq.get(&seq_id) {
                    files[idx].ranges.push((offset, length));
                }
            }
            TransferLogEntry::FileInvalidated { seq_id } => {
                if let Some(&idx) = by_seq.get(&seq_id) {
                    files[idx].invalidated = true;
                    files[idx].ranges.clear();
                }
            }
            TransferLogEntry::FileResized { seq_id, new_size } => {
                if let Some(&idx) = by_seq.get(&seq_id) {
                    files[idx].size = new_size;
                    files[idx].invalidated = true;
                    files[idx].ranges.clear();
                }
            }
        }
    }
    for f in &mut files {
        f.ranges = coalesce(std::mem::take(&mut f.ranges));
    }
    Ok(ParsedLog { header, files })
}

fn coalesce(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (off, len) in ranges {
        if let Some(last) = out.last_mut() {
            if off <= last.0 + last.1 {
                let end = (off + len).max(last.0 + last.1);
                last.1 = end - last.0;
                continue;
            }
        }
        out.push((off, len));
    }
    out
}

/// What resumption hands to the session: ranges to report to the sender and
/// per-file byte credits for completion tracking.
pub struct ResumeData {
    pub chunks: Vec<FileChunks>,
    pub resumed_bytes: HashMap<String, u64>,
    /// seq ids whose on-disk state disagreed with the log.
    pub invalidated: Vec<u64>,
}

fn file_mtime_secs(md: &std::fs::Metadata) -> u64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Check each logged file against the directory. A file whose on-disk size
/// or mtime disagrees with the log loses all its ranges (the whole file is
/// invalidated rather than rescued partially).
pub fn verify_log(parsed: &ParsedLog, root: &Path) -> ResumeData {
    let mut chunks = Vec::new();
    let mut resumed_bytes = HashMap::new();
    let mut invalidated = Vec::new();
    for f in &parsed.files {
        if f.invalidated || f.ranges.is_empty() {
            if f.invalidated {
                invalidated.push(f.seq_id);
            }
            continue;
        }
        let ok = match std::fs::metadata(root.join(&f.rel_path)) {
            Ok(md) if md.is_file() => {
                let disk_size = md.len();
                let max_end = f.ranges.iter().map(|(o, l)| o + l).max().unwrap_or(0);
                disk_size >= max_end && disk_size <= f.size && file_mtime_secs(&md) >= f.mtime
            }
            _ => false,
        };
        if !ok {
            invalidated.push(f.seq_id);
            continue;
        }
        let owned: u64 = f.ranges.iter().map(|(_, l)| l).sum();
        resumed_bytes.insert(f.rel_path.clone(), owned);
        chunks.push(FileChunks {
            rel_path: f.rel_path.clone(),
            file_size: f.size,
            ranges: f.ranges.clone(),
        });
    }
    ResumeData {
        chunks,
        resumed_bytes,
        invalidated,
    }
}

/// Operator diagnostic: dump the log in readable form.
pub fn print_log(path: &Path) -> Result<()> {
    let parsed = parse_log(path)?;
    println!(
        "transfer log {} (format v{}, transfer id {}, block size {})",
        path.display(),
        parsed.header.version,
        parsed.header.transfer_id,
        parsed.header.block_size
    );
    for f in &parsed.files {
        let owned: u64 = f.ranges.iter().map(|(_, l)| l).sum();
        println!(
            "  [{}] {} size={} owned={}{}",
            f.seq_id,
            f.rel_path,
            f.size,
            owned,
            if f.invalidated { " INVALIDATED" } else { "" }
        );
        for (off, len) in &f.ranges {
            println!("      range {}..{}", off, off + len);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_parse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid-1", 65536, false).unwrap();
        log.append(TransferLogEntry::FileCreated {
            seq_id: 0,
            rel_path: "a.txt".into(),
            size: 100,
            mtime: 123,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 0,
            offset: 0,
            length: 50,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 0,
            offset: 50,
            length: 50,
        });
        log.close();

        let parsed = parse_log(&TransferLogManager::log_path(dir.path())).unwrap();
        assert_eq!(parsed.header.transfer_id, "tid-1");
        assert_eq!(parsed.header.block_size, 65536);
        assert_eq!(parsed.files.len(), 1);
        // adjacent ranges coalesce
        assert_eq!(parsed.files[0].ranges, vec![(0, 100)]);
    }

    #[test]
    fn invalidation_drops_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid", 4096, false).unwrap();
        log.append(TransferLogEntry::FileCreated {
            seq_id: 7,
            rel_path: "x".into(),
            size: 10,
            mtime: 0,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 7,
            offset: 0,
            length: 10,
        });
        log.append(TransferLogEntry::FileInvalidated { seq_id: 7 });
        log.close();
        let parsed = parse_log(&TransferLogManager::log_path(dir.path())).unwrap();
        assert!(parsed.files[0].invalidated);
        assert!(parsed.files[0].ranges.is_empty());
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid", 4096, false).unwrap();
        log.append(TransferLogEntry::FileCreated {
            seq_id: 0,
            rel_path: "f".into(),
            size: 5,
            mtime: 0,
        });
        log.close();
        let path = TransferLogManager::log_path(dir.path());
        // simulate a crash mid-append
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[20u8, 0u8, entry_kind::BLOCK_WRITTEN]).unwrap();
        drop(f);
        let parsed = parse_log(&path).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert!(parsed.files[0].ranges.is_empty());
    }

    #[test]
    fn verify_accepts_matching_file_and_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good"), vec![1u8; 100]).unwrap();
        std::fs::write(dir.path().join("shrunk"), vec![1u8; 10]).unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid", 4096, false).unwrap();
        for (seq, name) in [(0u64, "good"), (1, "shrunk"), (2, "missing")] {
            log.append(TransferLogEntry::FileCreated {
                seq_id: seq,
                rel_path: name.into(),
                size: 100,
                mtime: 0,
            });
            log.append(TransferLogEntry::BlockWritten {
                seq_id: seq,
                offset: 0,
                length: 100,
            });
        }
        log.close();
        let parsed = parse_log(&TransferLogManager::log_path(dir.path())).unwrap();
        let resume = verify_log(&parsed, dir.path());
        assert_eq!(resume.chunks.len(), 1);
        assert_eq!(resume.chunks[0].rel_path, "good");
        assert_eq!(resume.resumed_bytes.get("good"), Some(&100));
        assert_eq!(resume.invalidated.len(), 2);
    }

    #[test]
    fn resized_file_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid", 4096, false).unwrap();
        log.append(TransferLogEntry::FileCreated {
            seq_id: 3,
            rel_path: "r".into(),
            size: 50,
            mtime: 0,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 3,
            offset: 0,
            length: 50,
        });
        log.append(TransferLogEntry::FileResized {
            seq_id: 3,
            new_size: 80,
        });
        log.close();
        let parsed = parse_log(&TransferLogManager::log_path(dir.path())).unwrap();
        assert!(parsed.files[0].invalidated);
        assert_eq!(parsed.files[0].size, 80);
    }

    #[test]
    fn same_path_new_session_merges_when_size_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransferLogManager::open(dir.path(), "tid", 4096, false).unwrap();
        log.append(TransferLogEntry::FileCreated {
            seq_id: 0,
            rel_path: "f".into(),
            size: 100,
            mtime: 0,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 0,
            offset: 0,
            length: 40,
        });
        // second session, same file re-announced under a new seq
        log.append(TransferLogEntry::FileCreated {
            seq_id: 9,
            rel_path: "f".into(),
            size: 100,
            mtime: 0,
        });
        log.append(TransferLogEntry::BlockWritten {
            seq_id: 9,
            offset: 40,
            length: 60,
        });
        log.close();
        let parsed = parse_log(&TransferLogManager::log_path(dir.path())).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].ranges, vec![(0, 100)]);
    }
}
