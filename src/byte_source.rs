//! Byte sources: the unit of work a sender worker pulls off the queue.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use crate::options::DIRECT_IO_ALIGNMENT;

/// Immutable description of one source file, shared by all its blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Path relative to the transfer root, '/'-separated.
    pub rel_path: String,
    pub size: u64,
    /// Unix permission bits (low 12 bits).
    pub perms: u32,
    /// Assigned by the source queue on first emission; unique per transfer
    /// and monotonic in emission order.
    pub seq_id: u64,
}

/// One block: a bounded byte range of one file. A zero-length block denotes
/// an empty file.
#[derive(Debug, Clone)]
pub struct ByteSource {
    pub meta: Arc<FileMetadata>,
    pub offset: u64,
    pub length: u64,
}

impl ByteSource {
    /// Trim bytes the receiver already persisted off the front of the block.
    pub fn advance(&mut self, bytes: u64) {
        let n = bytes.min(self.length);
        self.offset += n;
        self.length -= n;
    }

    pub fn identifier(&self) -> String {
        format!("{}@{}+{}", self.meta.rel_path, self.offset, self.length)
    }
}

/// Heap buffer aligned for O_DIRECT. Plain `Vec` gives no alignment
/// guarantee, which O_DIRECT kernels reject with EINVAL.
pub struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
    len: usize,
}

// The buffer is exclusively owned; the raw pointer does not alias.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn new(len: usize, align: usize) -> AlignedBuf {
        let layout = std::alloc::Layout::from_size_align(len, align)
            .expect("invalid aligned buffer layout");
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(raw)
            .unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        AlignedBuf { ptr, layout, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Reader over one block of one file, yielding buffered chunks.
pub struct FileByteSource {
    source: ByteSource,
    file: File,
    buf: AlignedBuf,
    odirect: bool,
    consumed: u64,
}

impl FileByteSource {
    /// Open the backing file region. With O_DIRECT on, reads are issued at
    /// aligned offsets in aligned counts; the queue only produces
    /// alignment-sized blocks in that mode.
    pub fn open(
        root: &Path,
        source: ByteSource,
        buffer_size: usize,
        odirect: bool,
    ) -> Result<FileByteSource> {
        let path = root.join(&source.meta.rel_path);
        let mut open_opts = OpenOptions::new();
        open_opts.read(true);
        if odirect {
            open_opts.custom_flags(libc::O_DIRECT);
        }
        let file = open_opts
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let align = if odirect { DIRECT_IO_ALIGNMENT } else { 8 };
        let size = buffer_size.max(DIRECT_IO_ALIGNMENT);
        let size = size - (size % DIRECT_IO_ALIGNMENT);
        Ok(FileByteSource {
            source,
            file,
            buf: AlignedBuf::new(size, align),
            odirect,
            consumed: 0,
        })
    }

    pub fn source(&self) -> &ByteSource {
        &self.source
    }

    /// Next chunk of the block, or None once the block is fully consumed.
    pub fn read_chunk(&mut self) -> Result<Option<&[u8]>> {
        let remaining = self.source.length - self.consumed;
        if remaining == 0 {
            return Ok(None);
        }
        let want = if self.odirect {
            // count must stay aligned; short reads at EOF are fine
            self.buf.len()
        } else {
            self.buf.len().min(remaining as usize)
        };
        let at = self.source.offset + self.consumed;
        let n = self
            .file
            .read_at(&mut self.buf.as_mut_slice()[..want], at)
            .with_context(|| format!("read {} at {}", self.source.meta.rel_path, at))?;
        if n == 0 {
            bail!(
                "{} truncated mid-transfer: {} of {} block bytes read",
                self.source.meta.rel_path,
                self.consumed,
                self.source.length
            );
        }
        let take = (n as u64).min(remaining) as usize;
        self.consumed += take as u64;
        Ok(Some(&self.buf.as_slice()[..take]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn meta(rel: &str, size: u64) -> Arc<FileMetadata> {
        Arc::new(FileMetadata {
            rel_path: rel.into(),
            size,
            perms: 0o644,
            seq_id: 0,
        })
    }

    #[test]
    fn advance_trims_front() {
        let mut s = ByteSource {
            meta: meta("f", 100),
            offset: 10,
            length: 50,
        };
        s.advance(20);
        assert_eq!((s.offset, s.length), (30, 30));
        s.advance(1000);
        assert_eq!((s.offset, s.length), (60, 0));
    }

    #[test]
    fn reads_exact_block_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut f = File::create(&path).unwrap();
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        f.write_all(&payload).unwrap();
        drop(f);

        let src = ByteSource {
            meta: meta("data.bin", 200),
            offset: 50,
            length: 100,
        };
        let mut reader = FileByteSource::open(dir.path(), src, 64, false).unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = reader.read_chunk().unwrap() {
            got.extend_from_slice(chunk);
        }
        assert_eq!(got, &payload[50..150]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"12345").unwrap();
        let src = ByteSource {
            meta: meta("short.bin", 100),
            offset: 0,
            length: 100,
        };
        let mut reader = FileByteSource::open(dir.path(), src, 64, false).unwrap();
        let mut err = None;
        loop {
            match reader.read_chunk() {
                Ok(None) => break,
                Ok(Some(_)) => {}
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(err.is_some());
    }

    #[test]
    fn aligned_buf_is_aligned() {
        let buf = AlignedBuf::new(8192, DIRECT_IO_ALIGNMENT);
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
        assert_eq!(buf.len(), 8192);
    }
}
