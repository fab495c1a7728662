//! Thread-safe source queue: one enumerator producing blocks, N workers
//! consuming them. Fresh blocks are FIFO; returned (retried) blocks jump
//! ahead of fresh ones.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::byte_source::{ByteSource, FileMetadata};
use crate::protocol::FileChunks;

/// Result of one consumer poll.
pub enum QueuePoll {
    Source(ByteSource),
    Timeout,
    /// Discovery completed and the queue is drained.
    Finished,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ByteSource>,
    discovery_done: bool,
    next_seq: u64,
    num_blocks_discovered: u64,
    bytes_discovered: u64,
    num_files: u64,
    /// Files the walk could not read or stat.
    failed_files: Vec<String>,
    /// Byte ranges the receiver reported owning, keyed by relative path.
    previously_received: HashMap<String, FileChunks>,
}

pub struct DirectorySourceQueue {
    root: PathBuf,
    block_size: u64,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl DirectorySourceQueue {
    pub fn new(root: &Path, block_size: u64) -> Arc<DirectorySourceQueue> {
        Arc::new(DirectorySourceQueue {
            root: root.to_path_buf(),
            block_size: block_size.max(1),
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Install the receiver-reported owned ranges. Must happen before
    /// discovery starts; emission then skips or splits around them.
    pub fn set_previously_received(&self, files: Vec<FileChunks>) {
        let mut state = self.state.lock();
        assert!(
            state.num_blocks_discovered == 0 && !state.discovery_done,
            "chunks info must be installed before discovery"
        );
        state.previously_received = files
            .into_iter()
            .map(|f| (f.rel_path.clone(), f))
            .collect();
    }

    /// Spawn the enumerator thread. With a file list, entries are served in
    /// the given order; otherwise the directory tree is walked depth-first.
    /// Blocks stream into the queue as the walk proceeds.
    pub fn start_discovery(
        self: &Arc<Self>,
        file_list: Option<Vec<(String, Option<u64>)>>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        thread::Builder::new()
            .name("wdt-discovery".into())
            .spawn(move || {
                match file_list {
                    Some(list) => queue.enumerate_file_list(list),
                    None => queue.enumerate_directory(),
                }
                let mut state = queue.state.lock();
                state.discovery_done = true;
                drop(state);
                queue.cond.notify_all();
            })
            .expect("failed to spawn discovery thread")
    }

    fn enumerate_directory(&self) {
        for entry in walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    eprintln!("discovery error: {}", e);
                    self.state.lock().failed_files.push(format!("{}", e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rel_path = match rel.to_str() {
                Some(s) => s.to_string(),
                None => {
                    eprintln!("skipping non-utf8 path {:?}", rel);
                    self.state
                        .lock()
                        .failed_files
                        .push(rel.to_string_lossy().into_owned());
                    continue;
                }
            };
            match entry.metadata() {
                Ok(md) => {
                    let perms = md.permissions().mode() & 0o7777;
                    self.emit_file(rel_path, md.len(), perms);
                }
                Err(e) => {
                    eprintln!("stat failed for {}: {}", rel_path, e);
                    self.state.lock().failed_files.push(rel_path);
                }
            }
        }
    }

    fn enumerate_file_list(&self, list: Vec<(String, Option<u64>)>) {
        for (rel_path, size) in list {
            let abs = self.root.join(&rel_path);
            let md = match std::fs::metadata(&abs) {
                Ok(md) if md.is_file() => md,
                Ok(_) => {
                    eprintln!("{} is not a regular file, skipping", rel_path);
                    self.state.lock().failed_files.push(rel_path);
                    continue;
                }
                Err(e) => {
                    eprintln!("stat failed for {}: {}", rel_path, e);
                    self.state.lock().failed_files.push(rel_path);
                    continue;
                }
            };
            let size = size.unwrap_or_else(|| md.len());
            let perms = md.permissions().mode() & 0o7777;
            self.emit_file(rel_path, size, perms);
        }
    }

    /// Split one file into blocks and append them, skipping ranges the
    /// receiver reported owning.
    fn emit_file(&self, rel_path: String, size: u64, perms: u32) {
        let mut state = self.state.lock();
        let seq_id = state.next_seq;
        state.next_seq += 1;
        state.num_files += 1;
        let meta = Arc::new(FileMetadata {
            rel_path: rel_path.clone(),
            size,
            perms,
            seq_id,
        });
        let owned: &[(u64, u64)] = state
            .previously_received
            .get(&rel_path)
            .filter(|f| f.file_size == size)
            .map(|f| f.ranges.as_slice())
            .unwrap_or(&[]);
        let wanted = subtract_ranges(size, owned);

        let mut emitted = 0u64;
        for (mut off, mut len) in wanted {
            while len > 0 {
                let n = len.min(self.block_size);
                state.queue.push_back(ByteSource {
                    meta: Arc::clone(&meta),
                    offset: off,
                    length: n,
                });
                state.num_blocks_discovered += 1;
                state.bytes_discovered += n;
                off += n;
                len -= n;
                emitted += 1;
            }
        }
        if size == 0 && !state.previously_received.contains_key(&rel_path) {
            // empty file still needs one zero-length block to get created
            state.queue.push_back(ByteSource {
                meta,
                offset: 0,
                length: 0,
            });
            state.num_blocks_discovered += 1;
            emitted += 1;
        }
        drop(state);
        if emitted > 0 {
            self.cond.notify_all();
        }
    }

    /// Consumer side. Blocks for up to `timeout`.
    pub fn get_next_source(&self, timeout: Duration) -> QueuePoll {
        let mut state = self.state.lock();
        loop {
            if let Some(src) = state.queue.pop_front() {
                return QueuePoll::Source(src);
            }
            if state.discovery_done {
                return QueuePoll::Finished;
            }
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                return QueuePoll::Timeout;
            }
        }
    }

    /// Reinsert sources at the head of the queue, preserving their order
    /// among themselves, so retried work is picked up promptly.
    pub fn return_to_queue(&self, sources: Vec<ByteSource>) {
        if sources.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for src in sources.into_iter().rev() {
            state.queue.push_front(src);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// A consumer could not read the block's backing file. The block leaves
    /// the discovered totals so DONE accounting no longer expects it, and
    /// the file joins the failed list like an enumeration failure would.
    pub fn mark_source_failed(&self, source: &ByteSource) {
        let mut state = self.state.lock();
        state.num_blocks_discovered = state.num_blocks_discovered.saturating_sub(1);
        state.bytes_discovered = state.bytes_discovered.saturating_sub(source.length);
        state.failed_files.push(source.identifier());
    }

    pub fn discovery_finished(&self) -> bool {
        self.state.lock().discovery_done
    }

    /// (blocks discovered, bytes discovered) so far.
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.num_blocks_discovered, state.bytes_discovered)
    }

    pub fn num_failed_files(&self) -> usize {
        self.state.lock().failed_files.len()
    }
}

/// Subtract `owned` (sorted, non-overlapping) from [0, size), returning the
/// ranges still to transfer.
fn subtract_ranges(size: u64, owned: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut wanted = Vec::new();
    let mut cursor = 0u64;
    for &(off, len) in owned {
        let off = off.min(size);
        let end = off.saturating_add(len).min(size);
        if off > cursor {
            wanted.push((cursor, off - cursor));
        }
        cursor = cursor.max(end);
    }
    if cursor < size {
        wanted.push((cursor, size - cursor));
    }
    wanted
}
