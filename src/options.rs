//! Engine tunables, shared by sender and receiver.

use serde::Serialize;

/// Default first port a receiver tries to bind.
pub const DEFAULT_START_PORT: u16 = 22356;
/// Default number of striped connections.
pub const DEFAULT_NUM_PORTS: usize = 8;

/// All knobs of the transfer engine. The CLI maps its flags 1:1 onto this;
/// library consumers fill it directly.
#[derive(Debug, Clone, Serialize)]
pub struct WdtOptions {
    /// First port of the consecutive range.
    pub start_port: u16,
    /// Number of ports (= number of worker connections).
    pub num_ports: usize,
    /// Block size in mebibytes. Files are split into blocks of this size.
    pub block_size_mbytes: u64,
    /// Socket read timeout in milliseconds.
    pub read_timeout_millis: u64,
    /// Socket write timeout in milliseconds.
    pub write_timeout_millis: u64,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_millis: u64,
    /// How long an accept loop sleeps between polls of the abort flag.
    pub accept_poll_millis: u64,
    /// CRC32 every block body and verify before persisting.
    pub enable_checksum: bool,
    /// Keep a transfer log on the receiver and resume from it.
    pub enable_download_resumption: bool,
    /// Average throttle in mebibytes/sec across all workers; <= 0 disables.
    pub avg_mbytes_per_sec: f64,
    /// Peak (burst) throttle in mebibytes/sec; <= 0 derives from average.
    pub max_mbytes_per_sec: f64,
    /// Reconnect attempts per worker before giving up on its connection.
    pub max_transfer_retries: u32,
    /// Sleep between reconnect attempts, milliseconds.
    pub retry_sleep_millis: u64,
    /// Receiver emits an ACK every this many persisted blocks.
    pub ack_interval_blocks: u64,
    /// Read/write buffer size in bytes.
    pub buffer_size: usize,
    /// Open data files with O_DIRECT and do aligned I/O.
    pub odirect: bool,
    /// Pre-allocate destination files to their announced size.
    pub enable_file_preallocation: bool,
    /// fsync the transfer log after every block entry instead of per file.
    pub log_fsync_per_block: bool,
    /// Treat binding/reaching fewer ports than requested as a fatal error.
    pub treat_fewer_port_as_error: bool,
}

impl Default for WdtOptions {
    fn default() -> Self {
        WdtOptions {
            start_port: DEFAULT_START_PORT,
            num_ports: DEFAULT_NUM_PORTS,
            block_size_mbytes: 16,
            read_timeout_millis: 5000,
            write_timeout_millis: 5000,
            connect_timeout_millis: 2000,
            accept_poll_millis: 50,
            enable_checksum: true,
            enable_download_resumption: false,
            avg_mbytes_per_sec: -1.0,
            max_mbytes_per_sec: -1.0,
            max_transfer_retries: 3,
            retry_sleep_millis: 200,
            ack_interval_blocks: 64,
            buffer_size: 256 * 1024,
            odirect: false,
            enable_file_preallocation: false,
            log_fsync_per_block: false,
            treat_fewer_port_as_error: false,
        }
    }
}

/// Alignment required for O_DIRECT offsets, lengths and buffers.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

impl WdtOptions {
    pub fn block_size_bytes(&self) -> u64 {
        let sz = self.block_size_mbytes.max(1) * 1024 * 1024;
        if self.odirect {
            // O_DIRECT blocks must stay alignment-sized
            sz - (sz % DIRECT_IO_ALIGNMENT as u64)
        } else {
            sz
        }
    }

    pub fn throttler_enabled(&self) -> bool {
        self.avg_mbytes_per_sec > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_aligned_under_odirect() {
        let mut opts = WdtOptions::default();
        opts.odirect = true;
        assert_eq!(opts.block_size_bytes() % DIRECT_IO_ALIGNMENT as u64, 0);
        opts.block_size_mbytes = 0;
        assert!(opts.block_size_bytes() >= DIRECT_IO_ALIGNMENT as u64);
    }
}
