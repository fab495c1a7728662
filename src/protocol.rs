//! Wire protocol: opcodes, varint coding, and frame bodies.
//!
//! Every frame is a single opcode byte followed by a body whose layout the
//! opcode determines. Fixed-width integers are little-endian; sizes, offsets
//! and counts use a 7-bit-per-byte varint so small values stay compact.

use anyhow::{bail, Context, Result};
use std::io::Read;

use crate::error::ErrorCode;

/// Current protocol version. Matches the crate's minor version.
pub const PROTOCOL_VERSION: u32 = 27;
/// Oldest version this implementation still speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 24;

/// Longest relative path accepted off the wire.
pub const MAX_PATH_LEN: usize = 4096;
/// Longest sender/transfer id accepted off the wire.
pub const MAX_ID_LEN: usize = 128;
/// Cap on files enumerated in a FILE_CHUNKS_INFO frame.
pub const MAX_CHUNKS_FILES: u64 = 4_000_000;
/// Cap on byte ranges per file in a FILE_CHUNKS_INFO frame.
pub const MAX_CHUNKS_RANGES: u64 = 1_000_000;

// Opcodes (exhaustive). Numeric values are wire-stable.
pub mod op {
    pub const SETTINGS: u8 = 1;
    pub const FILE_CHUNK: u8 = 2;
    pub const FILE_CHUNKS_INFO: u8 = 3;
    pub const ACK: u8 = 4;
    pub const SIZE_CMD: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const DONE: u8 = 7;
    pub const WAIT: u8 = 8;
    pub const ERR_CMD: u8 = 9;
}

pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(b);
            return;
        }
        buf.push(b | 0x80);
    }
}

pub fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b).context("varint read")?;
        v |= ((b[0] & 0x7f) as u64) << shift;
        if b[0] & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
    bail!("varint longer than 10 bytes")
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

pub fn read_string<R: Read>(r: &mut R, max_len: usize) -> Result<String> {
    let len = read_varint(r)? as usize;
    if len > max_len {
        bail!("string length {} exceeds limit {}", len, max_len);
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).context("string read")?;
    String::from_utf8(bytes).context("string utf8")
}

fn write_bool_flags(buf: &mut Vec<u8>, flags: &[bool]) {
    let mut b = 0u8;
    for (i, f) in flags.iter().enumerate() {
        if *f {
            b |= 1 << i;
        }
    }
    buf.push(b);
}

/// Handshake settings. The sender leads with this; the receiver replies with
/// its own frame, possibly constraining values down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub protocol_version: u32,
    pub sender_id: String,
    pub transfer_id: String,
    pub read_timeout_millis: u64,
    pub write_timeout_millis: u64,
    pub block_size: u64,
    pub enable_checksum: bool,
    pub enable_download_resumption: bool,
    /// Set on the probe connection only: asks the receiver to report the
    /// byte ranges it already owns.
    pub request_chunks_info: bool,
}

impl Settings {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.protocol_version as u64);
        write_string(buf, &self.sender_id);
        write_string(buf, &self.transfer_id);
        write_varint(buf, self.read_timeout_millis);
        write_varint(buf, self.write_timeout_millis);
        write_varint(buf, self.block_size);
        write_bool_flags(
            buf,
            &[
                self.enable_checksum,
                self.enable_download_resumption,
                self.request_chunks_info,
            ],
        );
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Settings> {
        let protocol_version = read_varint(r)? as u32;
        let sender_id = read_string(r, MAX_ID_LEN)?;
        let transfer_id = read_string(r, MAX_ID_LEN)?;
        let read_timeout_millis = read_varint(r)?;
        let write_timeout_millis = read_varint(r)?;
        let block_size = read_varint(r)?;
        let mut flags = [0u8; 1];
        r.read_exact(&mut flags).context("settings flags")?;
        Ok(Settings {
            protocol_version,
            sender_id,
            transfer_id,
            read_timeout_millis,
            write_timeout_millis,
            block_size,
            enable_checksum: flags[0] & 0b001 != 0,
            enable_download_resumption: flags[0] & 0b010 != 0,
            request_chunks_info: flags[0] & 0b100 != 0,
        })
    }
}

/// FILE_CHUNK header. The body (`length` raw bytes) follows on the wire,
/// plus a 4-byte CRC32 footer when checksumming is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub seq_id: u64,
    pub file_size: u64,
    pub offset: u64,
    pub length: u64,
    /// Low 12 bits carry the unix permission bits of the source file.
    pub flags: u64,
    pub rel_path: String,
}

impl BlockHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.seq_id);
        write_varint(buf, self.file_size);
        write_varint(buf, self.offset);
        write_varint(buf, self.length);
        write_varint(buf, self.flags);
        write_string(buf, &self.rel_path);
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<BlockHeader> {
        let seq_id = read_varint(r)?;
        let file_size = read_varint(r)?;
        let offset = read_varint(r)?;
        let length = read_varint(r)?;
        let flags = read_varint(r)?;
        let rel_path = read_string(r, MAX_PATH_LEN)?;
        if offset.checked_add(length).map_or(true, |end| end > file_size) {
            bail!(
                "block [{}, +{}) escapes file of size {} ({})",
                offset,
                length,
                file_size,
                rel_path
            );
        }
        Ok(BlockHeader {
            seq_id,
            file_size,
            offset,
            length,
            flags,
            rel_path,
        })
    }

    pub fn perms(&self) -> u32 {
        (self.flags & 0o7777) as u32
    }
}

/// ACK / ERR_CMD body. `acked_blocks` counts FILE_CHUNK frames of the
/// current connection persisted in order from its start;
/// `partial_block_bytes` is how much of the next block landed on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub acked_blocks: u64,
    pub partial_block_bytes: u64,
}

impl Checkpoint {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.acked_blocks);
        write_varint(buf, self.partial_block_bytes);
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Checkpoint> {
        Ok(Checkpoint {
            acked_blocks: read_varint(r)?,
            partial_block_bytes: read_varint(r)?,
        })
    }
}

/// DONE body: what the sender believes the whole transfer contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneInfo {
    pub num_blocks: u64,
    pub total_bytes: u64,
}

impl DoneInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.num_blocks);
        write_varint(buf, self.total_bytes);
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<DoneInfo> {
        Ok(DoneInfo {
            num_blocks: read_varint(r)?,
            total_bytes: read_varint(r)?,
        })
    }
}

/// ABORT body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortInfo {
    pub protocol_version: u32,
    pub error: ErrorCode,
    /// Blocks of the current connection the aborting side had persisted.
    pub checkpoint: u64,
}

impl AbortInfo {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        write_varint(buf, self.protocol_version as u64);
        buf.push(self.error.to_wire());
        write_varint(buf, self.checkpoint);
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<AbortInfo> {
        let protocol_version = read_varint(r)? as u32;
        let mut code = [0u8; 1];
        r.read_exact(&mut code).context("abort code")?;
        let checkpoint = read_varint(r)?;
        Ok(AbortInfo {
            protocol_version,
            error: ErrorCode::from_wire(code[0]),
            checkpoint,
        })
    }
}

/// Byte ranges of one file a receiver already owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunks {
    pub rel_path: String,
    pub file_size: u64,
    /// (offset, length) pairs, non-overlapping, ascending offset.
    pub ranges: Vec<(u64, u64)>,
}

pub fn encode_file_chunks_info(buf: &mut Vec<u8>, files: &[FileChunks]) {
    write_varint(buf, files.len() as u64);
    for f in files {
        write_string(buf, &f.rel_path);
        write_varint(buf, f.file_size);
        write_varint(buf, f.ranges.len() as u64);
        for (off, len) in &f.ranges {
            write_varint(buf, *off);
            write_varint(buf, *len);
        }
    }
}

pub fn decode_file_chunks_info<R: Read>(r: &mut R) -> Result<Vec<FileChunks>> {
    let num_files = read_varint(r)?;
    if num_files > MAX_CHUNKS_FILES {
        bail!(
            "chunks info enumerates {} files, limit {}",
            num_files,
            MAX_CHUNKS_FILES
        );
    }
    let mut files = Vec::with_capacity(num_files.min(1024) as usize);
    for _ in 0..num_files {
        let rel_path = read_string(r, MAX_PATH_LEN)?;
        let file_size = read_varint(r)?;
        let num_ranges = read_varint(r)?;
        if num_ranges > MAX_CHUNKS_RANGES {
            bail!(
                "chunks info has {} ranges for {}, limit {}",
                num_ranges,
                rel_path,
                MAX_CHUNKS_RANGES
            );
        }
        let mut ranges = Vec::with_capacity(num_ranges.min(1024) as usize);
        for _ in 0..num_ranges {
            let off = read_varint(r)?;
            let len = read_varint(r)?;
            ranges.push((off, len));
        }
        files.push(FileChunks {
            rel_path,
            file_size,
            ranges,
        });
    }
    Ok(files)
}

/// Pick the version both sides will speak, or None if the spans do not
/// intersect. Each side passes its own [min, max] span and the peer's offer.
pub fn negotiate_version(local_min: u32, local_max: u32, remote: u32) -> Option<u32> {
    let v = local_max.min(remote);
    if v >= local_min {
        Some(v)
    } else {
        None
    }
}
