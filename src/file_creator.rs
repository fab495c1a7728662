//! Destination file management on the receiver: first-touch creation with
//! optional pre-allocation, cached descriptors for concurrent block writers,
//! and completion tracking that finalises a file once its last byte lands.
//!
//! Completion is tracked as coalesced written ranges rather than a byte
//! count, so duplicate deliveries (a block re-sent after a partially
//! persisted first attempt) stay idempotent.

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::byte_source::AlignedBuf;
use crate::options::DIRECT_IO_ALIGNMENT;
use crate::protocol::BlockHeader;

pub struct OpenFile {
    pub file: File,
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub announced_size: u64,
    pub perms: u32,
    /// Persisted ranges, sorted and coalesced.
    written: Mutex<Vec<(u64, u64)>>,
}

impl OpenFile {
    pub fn bytes_written(&self) -> u64 {
        self.written.lock().iter().map(|(_, l)| l).sum()
    }

    fn mark_written(&self, offset: u64, length: u64) -> bool {
        let mut ranges = self.written.lock();
        add_range(&mut ranges, offset, length);
        self.announced_size == 0
            || (ranges.len() == 1 && ranges[0] == (0, self.announced_size))
    }
}

/// Insert a range into a sorted, coalesced set.
fn add_range(ranges: &mut Vec<(u64, u64)>, offset: u64, length: u64) {
    if length == 0 {
        return;
    }
    let idx = ranges.partition_point(|&(o, _)| o < offset);
    ranges.insert(idx, (offset, length));
    // merge neighbours around the insertion point
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(o, l) in ranges.iter() {
        if let Some(last) = merged.last_mut() {
            if o <= last.0 + last.1 {
                let end = (o + l).max(last.0 + last.1);
                last.1 = end - last.0;
                continue;
            }
        }
        merged.push((o, l));
    }
    *ranges = merged;
}

pub struct FileCreator {
    root: PathBuf,
    odirect: bool,
    preallocate: bool,
    files: RwLock<HashMap<String, Arc<OpenFile>>>,
    /// Ranges already on disk per path, from transfer-log resumption.
    resumed: RwLock<HashMap<String, Vec<(u64, u64)>>>,
}

#[cfg(target_os = "linux")]
fn preallocate_file(file: &File, size: u64) {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe {
        let r = libc::posix_fallocate(fd, 0, size as libc::off_t);
        if r != 0 {
            // fall back to sparse allocation
        }
    }
}
#[cfg(not(target_os = "linux"))]
fn preallocate_file(_file: &File, _size: u64) {}

#[cfg(target_os = "linux")]
fn sync_written_range(file: &File, offset: u64, len: u64) {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe {
        libc::sync_file_range(
            fd,
            offset as libc::off64_t,
            len as libc::off64_t,
            libc::SYNC_FILE_RANGE_WRITE,
        );
    }
}
#[cfg(not(target_os = "linux"))]
fn sync_written_range(_file: &File, _offset: u64, _len: u64) {}

impl FileCreator {
    pub fn new(root: &Path, odirect: bool, preallocate: bool) -> Arc<FileCreator> {
        Arc::new(FileCreator {
            root: root.to_path_buf(),
            odirect,
            preallocate,
            files: RwLock::new(HashMap::new()),
            resumed: RwLock::new(HashMap::new()),
        })
    }

    /// Seed ranges the transfer log proved are already on disk, so files
    /// complete without those ranges being re-sent.
    pub fn set_resumed_ranges(&self, per_file: HashMap<String, Vec<(u64, u64)>>) {
        *self.resumed.write() = per_file;
    }

    /// Reject path traversal before any byte touches the filesystem.
    fn safe_join(&self, rel_path: &str) -> Result<PathBuf> {
        if rel_path.is_empty() || rel_path.contains('\0') {
            bail!("bad relative path {:?}", rel_path);
        }
        let rel = Path::new(rel_path);
        let mut joined = self.root.clone();
        for comp in rel.components() {
            match comp {
                std::path::Component::Normal(c) => joined.push(c),
                std::path::Component::CurDir => {}
                other => bail!("path {:?} has disallowed component {:?}", rel_path, other),
            }
        }
        Ok(joined)
    }

    /// Descriptor for one block's destination, creating the file on first
    /// touch. Subsequent opens hit the cache under a shared lock.
    pub fn open_writer(self: &Arc<Self>, header: &BlockHeader) -> Result<FileWriter> {
        let entry = {
            let files = self.files.read();
            files.get(&header.rel_path).cloned()
        };
        let entry = match entry {
            Some(e) => e,
            None => self.create_entry(header)?,
        };
        if entry.announced_size != header.file_size {
            bail!(
                "{} size changed mid-transfer ({} then {})",
                header.rel_path,
                entry.announced_size,
                header.file_size
            );
        }
        Ok(FileWriter::new(
            Arc::clone(self),
            entry,
            header.offset,
            header.length,
            self.odirect,
        ))
    }

    fn create_entry(self: &Arc<Self>, header: &BlockHeader) -> Result<Arc<OpenFile>> {
        let mut files = self.files.write();
        if let Some(e) = files.get(&header.rel_path) {
            return Ok(Arc::clone(e));
        }
        let abs_path = self.safe_join(&header.rel_path)?;
        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let mut open_opts = OpenOptions::new();
        open_opts.write(true).create(true);
        if self.odirect {
            open_opts.custom_flags(libc::O_DIRECT);
        }
        let file = open_opts
            .open(&abs_path)
            .with_context(|| format!("create {}", abs_path.display()))?;
        let existing = file.metadata().map(|m| m.len()).unwrap_or(0);
        if existing > header.file_size {
            file.set_len(header.file_size)
                .with_context(|| format!("truncate {}", abs_path.display()))?;
        }
        if self.preallocate && header.file_size > 0 {
            preallocate_file(&file, header.file_size);
        }
        let resumed = self
            .resumed
            .read()
            .get(&header.rel_path)
            .cloned()
            .unwrap_or_default();
        let entry = Arc::new(OpenFile {
            file,
            abs_path,
            rel_path: header.rel_path.clone(),
            announced_size: header.file_size,
            perms: header.perms(),
            written: Mutex::new(resumed),
        });
        files.insert(header.rel_path.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Record a persisted range. Returns true if that made the file
    /// complete; the last writer finalises it.
    fn range_persisted(
        &self,
        entry: &Arc<OpenFile>,
        offset: u64,
        length: u64,
        sync: bool,
    ) -> Result<bool> {
        if sync {
            sync_written_range(&entry.file, offset, length);
        }
        if !entry.mark_written(offset, length) {
            return Ok(false);
        }
        self.finalize(entry)?;
        Ok(true)
    }

    fn finalize(&self, entry: &Arc<OpenFile>) -> Result<()> {
        if self.odirect {
            // undo tail padding
            entry
                .file
                .set_len(entry.announced_size)
                .with_context(|| format!("truncate {}", entry.abs_path.display()))?;
        }
        entry
            .file
            .sync_data()
            .with_context(|| format!("sync {}", entry.abs_path.display()))?;
        let perms = std::fs::Permissions::from_mode(entry.perms);
        std::fs::set_permissions(&entry.abs_path, perms)
            .with_context(|| format!("chmod {}", entry.abs_path.display()))?;
        self.files.write().remove(&entry.rel_path);
        Ok(())
    }

    /// Number of files opened but not yet complete.
    pub fn open_count(&self) -> usize {
        self.files.read().len()
    }
}

/// One (path, offset) write session covering a single block.
pub struct FileWriter {
    creator: Arc<FileCreator>,
    entry: Arc<OpenFile>,
    block_offset: u64,
    block_length: u64,
    written: u64,
    /// Aligned bytes flushed to disk; equals `written` without O_DIRECT.
    flushed: u64,
    stage: Option<AlignedBuf>,
    staged: usize,
}

impl FileWriter {
    fn new(
        creator: Arc<FileCreator>,
        entry: Arc<OpenFile>,
        block_offset: u64,
        block_length: u64,
        odirect: bool,
    ) -> FileWriter {
        let stage = if odirect {
            Some(AlignedBuf::new(
                DIRECT_IO_ALIGNMENT * 64,
                DIRECT_IO_ALIGNMENT,
            ))
        } else {
            None
        };
        FileWriter {
            creator,
            entry,
            block_offset,
            block_length,
            written: 0,
            flushed: 0,
            stage,
            staged: 0,
        }
    }

    pub fn entry(&self) -> &Arc<OpenFile> {
        &self.entry
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if self.written + data.len() as u64 > self.block_length {
            bail!(
                "{}: block overrun at offset {}",
                self.entry.rel_path,
                self.block_offset
            );
        }
        if self.stage.is_none() {
            let at = self.block_offset + self.written;
            self.entry
                .file
                .write_all_at(data, at)
                .with_context(|| format!("write {} at {}", self.entry.rel_path, at))?;
            self.written += data.len() as u64;
            self.flushed = self.written;
            return Ok(());
        }
        while !data.is_empty() {
            let cap = self.stage.as_ref().unwrap().len() - self.staged;
            let n = cap.min(data.len());
            self.stage.as_mut().unwrap().as_mut_slice()[self.staged..self.staged + n]
                .copy_from_slice(&data[..n]);
            self.staged += n;
            self.written += n as u64;
            data = &data[n..];
            if self.staged == self.stage.as_ref().unwrap().len() {
                self.flush_stage(false)?;
            }
        }
        Ok(())
    }

    /// Flush staged bytes. `pad_tail` rounds the final fragment up to the
    /// alignment with zeros; finalize() later truncates the padding away.
    fn flush_stage(&mut self, pad_tail: bool) -> Result<()> {
        let staged = self.staged;
        if staged == 0 {
            return Ok(());
        }
        let align = DIRECT_IO_ALIGNMENT;
        let to_write = if pad_tail {
            let padded = (staged + align - 1) / align * align;
            self.stage.as_mut().unwrap().as_mut_slice()[staged..padded].fill(0);
            padded
        } else {
            staged - (staged % align)
        };
        if to_write == 0 {
            return Ok(());
        }
        let at = self.block_offset + self.flushed;
        let stage = self.stage.as_mut().unwrap();
        self.entry
            .file
            .write_all_at(&stage.as_slice()[..to_write], at)
            .with_context(|| format!("write {} at {}", self.entry.rel_path, at))?;
        let logical = to_write.min(staged);
        self.flushed += logical as u64;
        // carry any unflushed tail to the buffer head
        let leftover = staged - logical;
        if leftover > 0 {
            let slice = stage.as_mut_slice();
            slice.copy_within(logical..staged, 0);
        }
        self.staged = leftover;
        Ok(())
    }

    /// Payload bytes guaranteed on disk; reported in reconnect checkpoints.
    pub fn persisted(&self) -> u64 {
        self.flushed
    }

    /// Abandon the block mid-way but credit what already hit the disk, so
    /// the trimmed re-send still completes the file. Returns the credited
    /// byte count.
    pub fn commit_partial(self) -> u64 {
        let flushed = self.flushed;
        if flushed > 0 {
            let creator = Arc::clone(&self.creator);
            let _ = creator.range_persisted(&self.entry, self.block_offset, flushed, false);
        }
        flushed
    }

    /// Complete the block. Returns true if the whole file is now complete.
    pub fn finish_block(mut self) -> Result<bool> {
        if self.written != self.block_length {
            bail!(
                "{}: block at {} incomplete ({} of {} bytes)",
                self.entry.rel_path,
                self.block_offset,
                self.written,
                self.block_length
            );
        }
        if self.stage.is_some() {
            self.flush_stage(true)?;
        }
        let creator = Arc::clone(&self.creator);
        creator.range_persisted(&self.entry, self.block_offset, self.block_length, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(rel: &str, file_size: u64, offset: u64, length: u64) -> BlockHeader {
        BlockHeader {
            seq_id: 1,
            file_size,
            offset,
            length,
            flags: 0o640,
            rel_path: rel.into(),
        }
    }

    #[test]
    fn add_range_coalesces() {
        let mut r = Vec::new();
        add_range(&mut r, 10, 10);
        add_range(&mut r, 30, 5);
        add_range(&mut r, 20, 10);
        assert_eq!(r, vec![(10, 25)]);
        add_range(&mut r, 0, 10);
        assert_eq!(r, vec![(0, 35)]);
        // duplicates are a no-op
        add_range(&mut r, 5, 10);
        assert_eq!(r, vec![(0, 35)]);
    }

    #[test]
    fn creates_parents_and_completes_file() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let h = header("sub/dir/x.bin", 6, 0, 6);
        let mut w = creator.open_writer(&h).unwrap();
        w.write(b"abc").unwrap();
        w.write(b"def").unwrap();
        assert!(w.finish_block().unwrap());
        let path = dir.path().join("sub/dir/x.bin");
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
        assert_eq!(creator.open_count(), 0);
    }

    #[test]
    fn two_blocks_same_file_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut w2 = creator.open_writer(&header("f", 8, 4, 4)).unwrap();
        let mut w1 = creator.open_writer(&header("f", 8, 0, 4)).unwrap();
        w2.write(b"5678").unwrap();
        w1.write(b"1234").unwrap();
        assert!(!w2.finish_block().unwrap());
        assert!(w1.finish_block().unwrap());
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"12345678");
    }

    #[test]
    fn duplicate_block_delivery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut w1 = creator.open_writer(&header("f", 8, 0, 4)).unwrap();
        w1.write(b"1234").unwrap();
        assert!(!w1.finish_block().unwrap());
        // same block again, then the remainder
        let mut w1b = creator.open_writer(&header("f", 8, 0, 4)).unwrap();
        w1b.write(b"1234").unwrap();
        assert!(!w1b.finish_block().unwrap());
        let mut w2 = creator.open_writer(&header("f", 8, 4, 4)).unwrap();
        w2.write(b"5678").unwrap();
        assert!(w2.finish_block().unwrap());
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"12345678");
    }

    #[test]
    fn partial_credit_plus_trimmed_resend_completes() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut w = creator.open_writer(&header("f", 8, 0, 8)).unwrap();
        w.write(b"1234").unwrap();
        assert_eq!(w.commit_partial(), 4);
        // sender trimmed the block to the un-persisted tail
        let mut w2 = creator.open_writer(&header("f", 8, 4, 4)).unwrap();
        w2.write(b"5678").unwrap();
        assert!(w2.finish_block().unwrap());
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"12345678");
    }

    #[test]
    fn rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        assert!(creator.open_writer(&header("../evil", 1, 0, 1)).is_err());
        assert!(creator.open_writer(&header("/abs", 1, 0, 1)).is_err());
    }

    #[test]
    fn rejects_size_change() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let w = creator.open_writer(&header("f", 10, 0, 5)).unwrap();
        drop(w);
        assert!(creator.open_writer(&header("f", 12, 5, 5)).is_err());
    }

    #[test]
    fn empty_file_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let w = creator.open_writer(&header("empty", 0, 0, 0)).unwrap();
        assert!(w.finish_block().unwrap());
        assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    }

    #[test]
    fn oversized_existing_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), vec![9u8; 100]).unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut w = creator.open_writer(&header("f", 4, 0, 4)).unwrap();
        w.write(b"wxyz").unwrap();
        assert!(w.finish_block().unwrap());
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"wxyz");
    }

    #[test]
    fn resumed_ranges_count_toward_completion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"1234....").unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut resumed = HashMap::new();
        resumed.insert("f".to_string(), vec![(0u64, 4u64)]);
        creator.set_resumed_ranges(resumed);
        let mut w = creator.open_writer(&header("f", 8, 4, 4)).unwrap();
        w.write(b"5678").unwrap();
        assert!(w.finish_block().unwrap());
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"12345678");
    }

    #[test]
    fn overrun_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let creator = FileCreator::new(dir.path(), false, false);
        let mut w = creator.open_writer(&header("f", 4, 0, 4)).unwrap();
        assert!(w.write(b"12345").is_err());
    }
}
