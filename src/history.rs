//! Per-connection history of blocks on the wire but not yet acknowledged.
//!
//! Under success blocks move queue -> history -> acked; on failure the
//! un-acked tail moves history -> queue, with the oldest entry trimmed by
//! however many bytes the receiver reported persisting of it.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::byte_source::ByteSource;
use crate::protocol::Checkpoint;
use crate::source_queue::DirectorySourceQueue;
use crate::stats::TransferStats;

pub struct InFlightRecord {
    pub source: ByteSource,
    /// Position of this block among all FILE_CHUNK frames of the current
    /// connection, starting at 0.
    pub send_pos: u64,
    pub header_bytes: u64,
}

pub struct ThreadTransferHistory {
    queue: Arc<DirectorySourceQueue>,
    history: VecDeque<InFlightRecord>,
    num_acked: u64,
    total_sent: u64,
}

impl ThreadTransferHistory {
    pub fn new(queue: Arc<DirectorySourceQueue>) -> ThreadTransferHistory {
        ThreadTransferHistory {
            queue,
            history: VecDeque::new(),
            num_acked: 0,
            total_sent: 0,
        }
    }

    /// Counters are connection-scoped; call on every (re)connect, after the
    /// previous connection's history has been rewound.
    pub fn reset_connection(&mut self) {
        debug_assert!(self.history.is_empty(), "resetting with blocks in flight");
        self.history.clear();
        self.num_acked = 0;
        self.total_sent = 0;
    }

    /// Record a block as sent; returns its connection-local position.
    pub fn append(&mut self, source: ByteSource, header_bytes: u64) -> u64 {
        let send_pos = self.total_sent;
        self.total_sent += 1;
        self.history.push_back(InFlightRecord {
            source,
            send_pos,
            header_bytes,
        });
        send_pos
    }

    pub fn in_flight(&self) -> usize {
        self.history.len()
    }

    /// Drop acknowledged entries from the front, moving their bytes into the
    /// effective counters. Ack positions must be monotonic and can never
    /// exceed what was sent.
    pub fn ack_up_to(&mut self, acked_blocks: u64, stats: &mut TransferStats) -> Result<()> {
        if acked_blocks > self.total_sent {
            bail!(
                "ack for {} blocks but only {} sent on this connection",
                acked_blocks,
                self.total_sent
            );
        }
        if acked_blocks < self.num_acked {
            bail!(
                "ack went backwards: {} after {}",
                acked_blocks,
                self.num_acked
            );
        }
        while let Some(front) = self.history.front() {
            if front.send_pos >= acked_blocks {
                break;
            }
            let rec = self.history.pop_front().unwrap();
            stats.add_effective(rec.header_bytes, rec.source.length);
        }
        self.num_acked = acked_blocks;
        Ok(())
    }

    /// Apply a reconnect checkpoint: ack the prefix, trim the partially
    /// persisted bytes off the oldest survivor, then return every remaining
    /// entry to the queue in original emission order. Returns how many
    /// blocks were rewound.
    pub fn set_checkpoint_and_rewind(
        &mut self,
        cp: Checkpoint,
        stats: &mut TransferStats,
    ) -> Result<u64> {
        self.ack_up_to(cp.acked_blocks, stats)?;
        if cp.partial_block_bytes > 0 {
            if let Some(front) = self.history.front_mut() {
                let n = cp.partial_block_bytes.min(front.source.length);
                front.source.advance(n);
                stats.add_effective(0, n);
            }
        }
        Ok(self.rewind_all(stats))
    }

    /// Return every un-acked entry to the queue. Used on connection failure
    /// when no checkpoint could be read.
    pub fn rewind_all(&mut self, stats: &mut TransferStats) -> u64 {
        let n = self.history.len() as u64;
        if n == 0 {
            return 0;
        }
        stats.num_failed_attempts += n;
        let sources: Vec<ByteSource> = self.history.drain(..).map(|r| r.source).collect();
        self.queue.return_to_queue(sources);
        n
    }

    /// Everything in flight was persisted (final DONE handshake).
    pub fn mark_all_acked(&mut self, stats: &mut TransferStats) {
        while let Some(rec) = self.history.pop_front() {
            stats.add_effective(rec.header_bytes, rec.source.length);
        }
        self.num_acked = self.total_sent;
    }
}
