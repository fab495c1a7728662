//! Receiver runtime: one worker per bound port, each accepting a single
//! connection per session, parsing frames and writing blocks to disk.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::abort::{AbortChecker, AbortFlag};
use crate::error::{coded, ErrorCode};
use crate::file_creator::FileCreator;
use crate::logger::{Logger, NoopLogger};
use crate::options::WdtOptions;
use crate::progress::ProgressCounters;
use crate::protocol::{
    self, op, AbortInfo, BlockHeader, Checkpoint, DoneInfo, Settings,
};
use crate::request::{gen_transfer_id, TransferRequest};
use crate::socket;
use crate::stats::{TransferReport, TransferStats};
use crate::throttler::Throttler;
use crate::transfer_log::{self, TransferLogEntry, TransferLogManager};

/// How often a flushing receiver reassures the sender.
const WAIT_INTERVAL: Duration = Duration::from_millis(200);

pub struct Receiver {
    req: TransferRequest,
    opts: WdtOptions,
    abort: Arc<AbortFlag>,
    listeners: Vec<(u16, TcpListener)>,
    throttler: Option<Arc<Throttler>>,
    progress: Arc<ProgressCounters>,
    logger: Arc<dyn Logger>,
    receiver_id: String,
}

impl Receiver {
    /// Bind the port range, falling back to fewer ports when some are taken
    /// (fatal under `treat_fewer_port_as_error`).
    pub fn new(mut req: TransferRequest, opts: WdtOptions, abort: Arc<AbortFlag>) -> Result<Receiver> {
        if req.transfer_id.is_empty() {
            req.transfer_id = gen_transfer_id();
        }
        std::fs::create_dir_all(&req.directory)
            .with_context(|| format!("create {}", req.directory.display()))?;
        let wanted = req.port_list();
        let mut listeners = Vec::new();
        for port in &wanted {
            match TcpListener::bind(("0.0.0.0", *port)) {
                Ok(l) => {
                    l.set_nonblocking(true).context("listener nonblocking")?;
                    listeners.push((*port, l));
                }
                Err(e) => eprintln!("cannot bind port {}: {}", port, e),
            }
        }
        if listeners.is_empty() {
            return Err(coded(
                ErrorCode::ConnError,
                format!("no port of {}..+{} bindable", req.start_port, wanted.len()),
            ));
        }
        if listeners.len() < wanted.len() && opts.treat_fewer_port_as_error {
            return Err(coded(
                ErrorCode::FewerPorts,
                format!("bound {} of {} ports", listeners.len(), wanted.len()),
            ));
        }
        req.ports = listeners.iter().map(|(p, _)| *p).collect();
        let throttler = if opts.throttler_enabled() {
            Some(Throttler::new(opts.avg_mbytes_per_sec, opts.max_mbytes_per_sec))
        } else {
            None
        };
        let receiver_id = format!(
            "{}.{}",
            socket::hostname().unwrap_or_else(|| "receiver".into()),
            std::process::id()
        );
        Ok(Receiver {
            req,
            opts,
            abort,
            listeners,
            throttler,
            progress: ProgressCounters::new(),
            logger: Arc::new(NoopLogger),
            receiver_id,
        })
    }

    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.logger = logger;
    }

    pub fn progress_counters(&self) -> Arc<ProgressCounters> {
        Arc::clone(&self.progress)
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|(p, _)| *p).collect()
    }

    pub fn transfer_id(&self) -> &str {
        &self.req.transfer_id
    }

    /// The string a sender needs to reach this receiver.
    pub fn connection_url(&self) -> String {
        let host = socket::hostname().unwrap_or_else(|| "localhost".into());
        self.req.to_url(&host)
    }

    /// Serve one transfer session to completion.
    pub fn transfer(&self) -> Result<TransferReport> {
        let start = Instant::now();
        let session = self.new_session()?;
        self.logger
            .transfer_start("receiver", &self.req.directory, &self.req.transfer_id);

        let mut handles = Vec::new();
        for (idx, (port, listener)) in self.listeners.iter().enumerate() {
            let listener = listener.try_clone().context("clone listener")?;
            let session = Arc::clone(&session);
            let port = *port;
            let handle = thread::Builder::new()
                .name(format!("wdt-recv-{}", idx))
                .spawn(move || {
                    let mut worker = ReceiverThread {
                        port,
                        listener,
                        session,
                        stats: TransferStats::default(),
                    };
                    worker.run();
                    worker.stats
                })
                .context("spawn receiver worker")?;
            handles.push(handle);
        }
        let mut thread_stats = Vec::with_capacity(handles.len());
        for h in handles {
            thread_stats.push(h.join().unwrap_or_else(|_| {
                let mut s = TransferStats::default();
                s.record_error(ErrorCode::Error);
                s
            }));
        }
        let total = session.bytes_written.load(Ordering::SeqCst);
        let mut report = TransferReport::new(thread_stats, start.elapsed(), total);
        if self.abort.should_abort() {
            report.totals.record_error(ErrorCode::AbortedByApplication);
        }
        self.logger.transfer_done(
            &report.summary().to_string(),
            total,
            start.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    /// Daemon mode: serve sessions until aborted.
    pub fn run_forever(&self) -> Result<()> {
        loop {
            if self.abort.should_abort() {
                return Ok(());
            }
            let report = self.transfer()?;
            eprintln!("{}", report);
        }
    }

    fn new_session(&self) -> Result<Arc<Session>> {
        let root = &self.req.directory;
        let creator = FileCreator::new(root, self.opts.odirect, self.opts.enable_file_preallocation);
        let mut chunks = Vec::new();
        let mut log = None;
        if self.opts.enable_download_resumption {
            let log_path = TransferLogManager::log_path(root);
            let mut invalidated = Vec::new();
            if log_path.exists() {
                match transfer_log::parse_log(&log_path) {
                    Ok(parsed) if parsed.header.transfer_id == self.req.transfer_id => {
                        let resume = transfer_log::verify_log(&parsed, root);
                        eprintln!(
                            "resuming: {} files with usable ranges, {} invalidated",
                            resume.chunks.len(),
                            resume.invalidated.len()
                        );
                        chunks = resume.chunks;
                        creator.set_resumed_ranges(
                            chunks
                                .iter()
                                .map(|c| (c.rel_path.clone(), c.ranges.clone()))
                                .collect(),
                        );
                        invalidated = resume.invalidated;
                    }
                    Ok(parsed) => {
                        eprintln!(
                            "transfer log belongs to {}, starting fresh",
                            parsed.header.transfer_id
                        );
                        std::fs::remove_file(&log_path).ok();
                    }
                    Err(e) => {
                        eprintln!("unreadable transfer log ({}), starting fresh", e);
                        std::fs::remove_file(&log_path).ok();
                    }
                }
            }
            let manager = TransferLogManager::open(
                root,
                &self.req.transfer_id,
                self.opts.block_size_bytes(),
                self.opts.log_fsync_per_block,
            )?;
            for seq_id in invalidated {
                manager.append(TransferLogEntry::FileInvalidated { seq_id });
            }
            log = Some(manager);
        }
        Ok(Arc::new(Session {
            opts: self.opts.clone(),
            abort: Arc::clone(&self.abort),
            throttler: self.throttler.clone(),
            progress: Arc::clone(&self.progress),
            logger: Arc::clone(&self.logger),
            creator,
            log,
            chunks,
            transfer_id: self.req.transfer_id.clone(),
            receiver_id: self.receiver_id.clone(),
            blocks_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            expected_blocks: AtomicI64::new(-1),
            done: AtomicBool::new(false),
            logged_files: Mutex::new(HashSet::new()),
        }))
    }
}

struct Session {
    opts: WdtOptions,
    abort: Arc<AbortFlag>,
    throttler: Option<Arc<Throttler>>,
    progress: Arc<ProgressCounters>,
    logger: Arc<dyn Logger>,
    creator: Arc<FileCreator>,
    log: Option<TransferLogManager>,
    /// Owned ranges reported to a probing sender at handshake.
    chunks: Vec<protocol::FileChunks>,
    transfer_id: String,
    receiver_id: String,
    blocks_written: AtomicU64,
    bytes_written: AtomicU64,
    /// Total block count announced by the sender's DONE; -1 until known.
    expected_blocks: AtomicI64,
    done: AtomicBool,
    logged_files: Mutex<HashSet<String>>,
}

impl Session {
    fn log_entry(&self, entry: TransferLogEntry) {
        if let Some(log) = &self.log {
            log.append(entry);
        }
    }

    /// First writer of a path this session records its creation.
    fn log_file_created(&self, header: &BlockHeader, abs_path: &std::path::Path) {
        let mut set = self.logged_files.lock();
        if set.insert(header.rel_path.clone()) {
            let mtime = std::fs::metadata(abs_path)
                .ok()
                .and_then(|md| md.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            self.log_entry(TransferLogEntry::FileCreated {
                seq_id: header.seq_id,
                rel_path: header.rel_path.clone(),
                size: header.file_size,
                mtime,
            });
        }
    }
}

enum Outcome {
    /// Clean DONE handshake completed on this connection.
    Done,
    /// Connection lost. The checkpoint (None when the connection never got
    /// past its handshake) feeds the sender's reconnect.
    Dropped(Option<Checkpoint>),
    /// Abort observed (either side); stop accepting.
    Aborted,
}

struct ReceiverThread {
    port: u16,
    listener: TcpListener,
    session: Arc<Session>,
    stats: TransferStats,
}

impl ReceiverThread {
    fn run(&mut self) {
        let mut last_checkpoint: Option<Checkpoint> = None;
        loop {
            if self.session.abort.should_abort() || self.session.done.load(Ordering::SeqCst) {
                return;
            }
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    thread::sleep(Duration::from_millis(self.session.opts.accept_poll_millis));
                    continue;
                }
                Err(e) => {
                    eprintln!("accept error on port {}: {}", self.port, e);
                    thread::sleep(Duration::from_millis(self.session.opts.accept_poll_millis));
                    continue;
                }
            };
            socket::tune_socket(&stream);
            socket::apply_timeouts(&stream, &self.session.opts);
            let mut stream = stream;
            if let Some(cp) = last_checkpoint.take() {
                // reconnect within a session leads with the local checkpoint;
                // it is sent exactly once, so a stale one can never reach a
                // sender whose history no longer matches it
                let mut body = Vec::new();
                cp.encode(&mut body);
                if socket::send_frame(&mut stream, op::ACK, &body).is_err() {
                    continue;
                }
            }
            match self.handle_connection(stream) {
                Outcome::Done => {
                    self.session.done.store(true, Ordering::SeqCst);
                    return;
                }
                Outcome::Dropped(cp) => {
                    if let Some(cp) = cp {
                        last_checkpoint = Some(cp);
                    }
                    continue;
                }
                Outcome::Aborted => {
                    self.session.done.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn handle_connection(&mut self, mut stream: TcpStream) -> Outcome {
        let session = Arc::clone(&self.session);
        let mut reader = match stream.try_clone() {
            Ok(s) => std::io::BufReader::with_capacity(session.opts.buffer_size, s),
            Err(_) => return Outcome::Dropped(None),
        };

        // handshake
        let settings = match read_settings(&mut reader) {
            Ok(s) => s,
            Err(_) => return Outcome::Dropped(None),
        };
        if settings.transfer_id != session.transfer_id {
            eprintln!(
                "transfer id mismatch: got {}, serving {}",
                settings.transfer_id, session.transfer_id
            );
            self.stats.record_error(ErrorCode::ProtocolError);
            send_abort(&mut stream, ErrorCode::ProtocolError, 0);
            return Outcome::Aborted;
        }
        let negotiated = match protocol::negotiate_version(
            protocol::MIN_PROTOCOL_VERSION,
            protocol::PROTOCOL_VERSION,
            settings.protocol_version,
        ) {
            Some(v) => v,
            None => {
                eprintln!(
                    "cannot serve protocol version {} (speaking {}..={})",
                    settings.protocol_version,
                    protocol::MIN_PROTOCOL_VERSION,
                    protocol::PROTOCOL_VERSION
                );
                self.stats.record_error(ErrorCode::VersionMismatch);
                send_abort(&mut stream, ErrorCode::VersionMismatch, 0);
                return Outcome::Aborted;
            }
        };
        let reply = Settings {
            protocol_version: negotiated,
            sender_id: session.receiver_id.clone(),
            transfer_id: session.transfer_id.clone(),
            read_timeout_millis: session.opts.read_timeout_millis,
            write_timeout_millis: session.opts.write_timeout_millis,
            block_size: settings.block_size,
            enable_checksum: settings.enable_checksum,
            enable_download_resumption: session.opts.enable_download_resumption,
            request_chunks_info: false,
        };
        let mut body = Vec::new();
        reply.encode(&mut body);
        if socket::send_frame(&mut stream, op::SETTINGS, &body).is_err() {
            self.stats.record_error(ErrorCode::SocketWriteError);
            return Outcome::Dropped(None);
        }
        if settings.request_chunks_info {
            let mut body = Vec::new();
            protocol::encode_file_chunks_info(&mut body, &session.chunks);
            if socket::send_frame(&mut stream, op::FILE_CHUNKS_INFO, &body).is_err() {
                self.stats.record_error(ErrorCode::SocketWriteError);
                return Outcome::Dropped(None);
            }
            // sender acks the chunk list before blocks start
            let mut opcode = [0u8; 1];
            if reader.read_exact(&mut opcode).is_err()
                || opcode[0] != op::ACK
                || Checkpoint::decode(&mut reader).is_err()
            {
                self.stats.record_error(ErrorCode::ProtocolError);
                return Outcome::Dropped(None);
            }
        }

        self.parse_loop(&mut reader, &mut stream, settings.enable_checksum)
    }

    fn parse_loop(
        &mut self,
        reader: &mut std::io::BufReader<TcpStream>,
        stream: &mut TcpStream,
        checksum: bool,
    ) -> Outcome {
        let session = Arc::clone(&self.session);
        let mut blocks_received = 0u64;
        let mut body_buf = vec![0u8; session.opts.buffer_size];
        loop {
            let cp = Checkpoint {
                acked_blocks: blocks_received,
                partial_block_bytes: 0,
            };
            if session.abort.should_abort() {
                send_abort(stream, ErrorCode::AbortedByApplication, blocks_received);
                self.stats.record_error(ErrorCode::AbortedByApplication);
                return Outcome::Aborted;
            }
            let mut opcode = [0u8; 1];
            if let Err(e) = reader.read_exact(&mut opcode) {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    eprintln!("port {} read error: {}", self.port, e);
                    self.stats.record_error(ErrorCode::SocketReadError);
                }
                return Outcome::Dropped(Some(cp));
            }
            match opcode[0] {
                op::FILE_CHUNK => {
                    match self.receive_block(reader, checksum, &mut body_buf, blocks_received) {
                        Ok(()) => {
                            blocks_received += 1;
                            if blocks_received % session.opts.ack_interval_blocks == 0 {
                                let mut ack = Vec::new();
                                Checkpoint {
                                    acked_blocks: blocks_received,
                                    partial_block_bytes: 0,
                                }
                                .encode(&mut ack);
                                if socket::send_frame(stream, op::ACK, &ack).is_err() {
                                    self.stats.record_error(ErrorCode::SocketWriteError);
                                    return Outcome::Dropped(Some(Checkpoint {
                                        acked_blocks: blocks_received,
                                        partial_block_bytes: 0,
                                    }));
                                }
                            }
                        }
                        Err(drop_cp) => return Outcome::Dropped(Some(drop_cp)),
                    }
                }
                op::SIZE_CMD => match protocol::read_varint(reader) {
                    Ok(total) => session.progress.set_total(total),
                    Err(_) => {
                        self.stats.record_error(ErrorCode::ProtocolError);
                        return Outcome::Dropped(Some(cp));
                    }
                },
                op::DONE => {
                    let done = match DoneInfo::decode(reader) {
                        Ok(d) => d,
                        Err(_) => {
                            self.stats.record_error(ErrorCode::ProtocolError);
                            return Outcome::Dropped(Some(cp));
                        }
                    };
                    return self.finish_session(reader, stream, done, blocks_received);
                }
                op::ABORT => {
                    match AbortInfo::decode(reader) {
                        Ok(info) => {
                            eprintln!("sender aborted: {}", info.error);
                            self.stats.record_remote_error(info.error);
                        }
                        Err(_) => self.stats.record_error(ErrorCode::Abort),
                    }
                    return Outcome::Aborted;
                }
                op::WAIT => {}
                other => {
                    eprintln!("unexpected opcode {} on port {}", other, self.port);
                    self.stats.record_error(ErrorCode::ProtocolError);
                    return Outcome::Dropped(Some(cp));
                }
            }
        }
    }

    /// One FILE_CHUNK: header, body into the file writer, optional CRC
    /// verification, then the transfer-log entry. Errors return the
    /// checkpoint the sender should resume from.
    fn receive_block(
        &mut self,
        reader: &mut std::io::BufReader<TcpStream>,
        checksum: bool,
        body_buf: &mut [u8],
        blocks_received: u64,
    ) -> std::result::Result<(), Checkpoint> {
        let session = Arc::clone(&self.session);
        let cp = Checkpoint {
            acked_blocks: blocks_received,
            partial_block_bytes: 0,
        };
        let header = match BlockHeader::decode(reader) {
            Ok(h) => h,
            Err(e) => {
                eprintln!("bad block header: {}", e);
                self.stats.record_error(ErrorCode::ProtocolError);
                return Err(cp);
            }
        };
        self.stats.add_header_bytes(1);
        let mut writer = match session.creator.open_writer(&header) {
            Ok(w) => w,
            Err(e) => {
                eprintln!("cannot open {}: {}", header.rel_path, e);
                // a size conflict invalidates everything known about the file
                session.log_entry(TransferLogEntry::FileResized {
                    seq_id: header.seq_id,
                    new_size: header.file_size,
                });
                self.stats.record_error(ErrorCode::FileWriteError);
                return Err(cp);
            }
        };
        session.log_file_created(&header, &writer.entry().abs_path);

        let mut hasher = checksum.then(crc32fast::Hasher::new);
        let mut remaining = header.length;
        while remaining > 0 {
            let want = (body_buf.len() as u64).min(remaining) as usize;
            let n = match reader.read(&mut body_buf[..want]) {
                Ok(0) => {
                    self.stats.record_error(ErrorCode::SocketReadError);
                    return Err(abandon_block(cp, checksum, writer));
                }
                Ok(n) => n,
                Err(e) => {
                    eprintln!("body read error for {}: {}", header.rel_path, e);
                    self.stats.record_error(ErrorCode::SocketReadError);
                    return Err(abandon_block(cp, checksum, writer));
                }
            };
            if let Some(t) = &session.throttler {
                if !t.limit(n as u64, &*session.abort) {
                    return Err(abandon_block(cp, checksum, writer));
                }
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&body_buf[..n]);
            }
            if let Err(e) = writer.write(&body_buf[..n]) {
                eprintln!("write failed for {}: {}", header.rel_path, e);
                self.stats.record_error(ErrorCode::FileWriteError);
                return Err(abandon_block(cp, checksum, writer));
            }
            remaining -= n as u64;
        }
        if let Some(h) = hasher {
            let mut footer = [0u8; 4];
            if reader.read_exact(&mut footer).is_err() {
                self.stats.record_error(ErrorCode::SocketReadError);
                return Err(cp);
            }
            let got = u32::from_le_bytes(footer);
            let want = h.finalize();
            if got != want {
                eprintln!(
                    "checksum mismatch on {} [{}, +{}): {:08x} != {:08x}",
                    header.rel_path, header.offset, header.length, got, want
                );
                self.stats.record_error(ErrorCode::ChecksumMismatch);
                // drop the connection; the sender re-sends this block
                return Err(cp);
            }
        }
        let file_complete = match writer.finish_block() {
            Ok(done) => done,
            Err(e) => {
                eprintln!("finishing {} failed: {}", header.rel_path, e);
                self.stats.record_error(ErrorCode::FileWriteError);
                return Err(cp);
            }
        };
        session.log_entry(TransferLogEntry::BlockWritten {
            seq_id: header.seq_id,
            offset: header.offset,
            length: header.length,
        });
        self.stats.num_blocks += 1;
        self.stats.add_data_bytes(header.length);
        self.stats.add_effective(1, header.length);
        session.blocks_written.fetch_add(1, Ordering::SeqCst);
        session.bytes_written.fetch_add(header.length, Ordering::SeqCst);
        session.progress.add_done(header.length);
        if file_complete {
            session.progress.add_file();
            session.logger.file_done(&header.rel_path, header.file_size);
        }
        Ok(())
    }

    /// The sender drained its queue. Wait (with WAIT keep-alives) until the
    /// blocks routed through other connections landed too, then confirm.
    fn finish_session(
        &mut self,
        reader: &mut std::io::BufReader<TcpStream>,
        stream: &mut TcpStream,
        done: DoneInfo,
        blocks_received: u64,
    ) -> Outcome {
        let session = Arc::clone(&self.session);
        session
            .expected_blocks
            .store(done.num_blocks as i64, Ordering::SeqCst);
        let cp = Checkpoint {
            acked_blocks: blocks_received,
            partial_block_bytes: 0,
        };
        let patience = Duration::from_millis(
            session.opts.read_timeout_millis.max(session.opts.write_timeout_millis) * 2,
        );
        let start = Instant::now();
        loop {
            if session.abort.should_abort() {
                send_abort(stream, ErrorCode::AbortedByApplication, blocks_received);
                self.stats.record_error(ErrorCode::AbortedByApplication);
                return Outcome::Aborted;
            }
            let written = session.blocks_written.load(Ordering::SeqCst);
            if written >= done.num_blocks {
                break;
            }
            if start.elapsed() > patience {
                // stragglers never arrived; hand the sender a checkpoint so
                // it reconnects and re-sends what its siblings dropped
                eprintln!(
                    "still missing {} of {} blocks, asking sender to retry",
                    done.num_blocks - written,
                    done.num_blocks
                );
                let mut body = Vec::new();
                cp.encode(&mut body);
                let _ = socket::send_frame(stream, op::ERR_CMD, &body);
                return Outcome::Dropped(Some(cp));
            }
            if socket::send_frame(stream, op::WAIT, &[]).is_err() {
                self.stats.record_error(ErrorCode::SocketWriteError);
                return Outcome::Dropped(Some(cp));
            }
            thread::sleep(WAIT_INTERVAL);
        }
        // all blocks persisted: final ACK, then DONE
        let mut ack = Vec::new();
        cp.encode(&mut ack);
        if socket::send_frame(stream, op::ACK, &ack).is_err()
            || socket::send_frame(stream, op::DONE, &[]).is_err()
        {
            self.stats.record_error(ErrorCode::SocketWriteError);
            return Outcome::Dropped(Some(cp));
        }
        // sender's closing DONE; EOF is as good as a reply here
        let mut opcode = [0u8; 1];
        let _ = reader.read_exact(&mut opcode);
        Outcome::Done
    }
}

/// Abandon a block mid-body. Without checksums the flushed prefix is
/// credited to the file and reported so the sender trims its re-send; with
/// checksums on, unverified bytes are never credited.
fn abandon_block(
    cp: Checkpoint,
    checksum: bool,
    writer: crate::file_creator::FileWriter,
) -> Checkpoint {
    if checksum {
        cp
    } else {
        Checkpoint {
            acked_blocks: cp.acked_blocks,
            partial_block_bytes: writer.commit_partial(),
        }
    }
}

fn read_settings(reader: &mut impl Read) -> Result<Settings> {
    let mut opcode = [0u8; 1];
    reader.read_exact(&mut opcode).context("first frame")?;
    if opcode[0] != op::SETTINGS {
        anyhow::bail!("expected SETTINGS, got opcode {}", opcode[0]);
    }
    Settings::decode(reader)
}

fn send_abort(stream: &mut TcpStream, error: ErrorCode, checkpoint: u64) {
    let mut body = Vec::new();
    AbortInfo {
        protocol_version: protocol::PROTOCOL_VERSION,
        error,
        checkpoint,
    }
    .encode(&mut body);
    let _ = socket::send_frame(stream, op::ABORT, &body);
}
