//! Per-source, per-thread and per-transfer statistics.

use std::fmt;
use std::ops::AddAssign;
use std::time::Duration;

use crate::error::ErrorCode;

/// Byte and block counters accumulated by one source, one worker, or the
/// whole transfer. "Effective" bytes are those the peer acknowledged;
/// everything else may have to be re-sent.
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    pub header_bytes: u64,
    pub data_bytes: u64,
    pub effective_header_bytes: u64,
    pub effective_data_bytes: u64,
    pub num_blocks: u64,
    pub num_failed_attempts: u64,
    pub error: ErrorCode,
    pub remote_error: ErrorCode,
}

impl TransferStats {
    pub fn add_header_bytes(&mut self, n: u64) {
        self.header_bytes += n;
    }

    pub fn add_data_bytes(&mut self, n: u64) {
        self.data_bytes += n;
    }

    /// Credit bytes as acknowledged by the peer. Credit only moves forward:
    /// rewound blocks were never credited, so there is nothing to take back.
    pub fn add_effective(&mut self, header: u64, data: u64) {
        self.effective_header_bytes += header;
        self.effective_data_bytes += data;
    }

    pub fn record_error(&mut self, code: ErrorCode) {
        self.error = self.error.worst(code);
    }

    pub fn record_remote_error(&mut self, code: ErrorCode) {
        self.remote_error = self.remote_error.worst(code);
    }

    /// The worse of the local and remote codes.
    pub fn combined_error(&self) -> ErrorCode {
        self.error.worst(self.remote_error)
    }
}

impl AddAssign<&TransferStats> for TransferStats {
    fn add_assign(&mut self, rhs: &TransferStats) {
        self.header_bytes += rhs.header_bytes;
        self.data_bytes += rhs.data_bytes;
        self.effective_header_bytes += rhs.effective_header_bytes;
        self.effective_data_bytes += rhs.effective_data_bytes;
        self.num_blocks += rhs.num_blocks;
        self.num_failed_attempts += rhs.num_failed_attempts;
        self.error = self.error.worst(rhs.error);
        self.remote_error = self.remote_error.worst(rhs.remote_error);
    }
}

/// End-of-transfer report, folded bottom-up from the worker stats.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub thread_stats: Vec<TransferStats>,
    pub totals: TransferStats,
    pub elapsed: Duration,
    /// Total payload bytes the transfer was supposed to move.
    pub total_file_bytes: u64,
}

impl TransferReport {
    pub fn new(thread_stats: Vec<TransferStats>, elapsed: Duration, total_file_bytes: u64) -> Self {
        let mut totals = TransferStats::default();
        for s in &thread_stats {
            totals += s;
        }
        TransferReport {
            thread_stats,
            totals,
            elapsed,
            total_file_bytes,
        }
    }

    /// The single worst error code observed anywhere in the transfer.
    pub fn summary(&self) -> ErrorCode {
        self.totals.combined_error()
    }

    pub fn throughput_mbytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.totals.effective_data_bytes as f64 / secs / 1_048_576.0
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Transfer status {} blocks={} effective={} bytes ({} sent) in {:.2}s @ {:.1} MB/s",
            self.summary(),
            self.totals.num_blocks,
            self.totals.effective_data_bytes,
            self.totals.data_bytes,
            self.elapsed.as_secs_f64(),
            self.throughput_mbytes_per_sec(),
        )?;
        for (i, s) in self.thread_stats.iter().enumerate() {
            writeln!(
                f,
                "  thread {}: {} blocks={} data={} effective={} retries={}",
                i,
                s.combined_error(),
                s.num_blocks,
                s.data_bytes,
                s.effective_data_bytes,
                s.num_failed_attempts,
            )?;
        }
        Ok(())
    }
}
