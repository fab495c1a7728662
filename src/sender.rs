//! Sender runtime: N worker threads, each draining the shared source queue
//! onto its own TCP connection, with rewind-on-failure and reconnect.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::abort::{sleep_abortable, AbortChecker, AbortFlag};
use crate::byte_source::{ByteSource, FileByteSource};
use crate::error::{coded, ErrorCode};
use crate::history::ThreadTransferHistory;
use crate::options::WdtOptions;
use crate::progress::ProgressCounters;
use crate::protocol::{
    self, op, AbortInfo, BlockHeader, Checkpoint, DoneInfo, Settings,
};
use crate::request::{gen_transfer_id, TransferRequest};
use crate::socket;
use crate::source_queue::{DirectorySourceQueue, QueuePoll};
use crate::stats::{TransferReport, TransferStats};
use crate::throttler::Throttler;

/// Queue poll slice; keeps abort latency low while the walk is running.
const QUEUE_POLL: Duration = Duration::from_millis(100);

struct Shared {
    opts: WdtOptions,
    queue: Arc<DirectorySourceQueue>,
    throttler: Option<Arc<Throttler>>,
    abort: Arc<AbortFlag>,
    progress: Arc<ProgressCounters>,
    root: PathBuf,
    host: String,
    sender_id: String,
    transfer_id: String,
    /// [min, max] protocol span this sender will agree to.
    version_min: u32,
    version_max: u32,
}

pub struct Sender {
    req: TransferRequest,
    shared: Option<Arc<Shared>>,
    /// Ports that answered during init, probe first.
    live_ports: Vec<u16>,
    /// Connections opened during init, index-aligned with `live_ports`.
    /// Only the probe (index 0) has completed its settings exchange.
    pending_streams: Vec<Option<TcpStream>>,
    negotiated_version: u32,
    abort: Arc<AbortFlag>,
    opts: WdtOptions,
    progress: Arc<ProgressCounters>,
}

impl Sender {
    pub fn new(mut req: TransferRequest, opts: WdtOptions, abort: Arc<AbortFlag>) -> Sender {
        if req.transfer_id.is_empty() {
            req.transfer_id = gen_transfer_id();
        }
        Sender {
            req,
            shared: None,
            live_ports: Vec::new(),
            pending_streams: Vec::new(),
            negotiated_version: 0,
            abort,
            opts,
            progress: ProgressCounters::new(),
        }
    }

    pub fn progress_counters(&self) -> Arc<ProgressCounters> {
        Arc::clone(&self.progress)
    }

    pub fn transfer_id(&self) -> &str {
        &self.req.transfer_id
    }

    /// Validate the request, reach the receiver, negotiate settings over a
    /// probe connection on the first port, ingest resumption info, and start
    /// directory discovery.
    pub fn init(&mut self) -> Result<()> {
        if self.req.host.is_empty() {
            bail!("sender needs a destination host");
        }
        let md = std::fs::metadata(&self.req.directory)
            .with_context(|| format!("stat {}", self.req.directory.display()))?;
        if !md.is_dir() {
            bail!("{} is not a directory", self.req.directory.display());
        }

        // open every worker connection up front so a port shortfall is
        // known before any byte moves
        let ports = self.req.port_list();
        let mut streams: Vec<(u16, TcpStream)> = Vec::new();
        for port in &ports {
            match socket::connect(&self.req.host, *port, &self.opts) {
                Ok(s) => streams.push((*port, s)),
                Err(e) => eprintln!("port {} unreachable: {}", port, e),
            }
        }
        if streams.is_empty() {
            return Err(coded(
                ErrorCode::ConnError,
                format!("no receiver port reachable at {}", self.req.host),
            ));
        }
        if streams.len() < ports.len() && self.opts.treat_fewer_port_as_error {
            return Err(coded(
                ErrorCode::FewerPorts,
                format!("only {} of {} ports reachable", streams.len(), ports.len()),
            ));
        }

        let (version_min, version_max) = if self.req.version_pinned {
            (self.req.protocol_version, self.req.protocol_version)
        } else {
            (
                protocol::MIN_PROTOCOL_VERSION,
                self.req.protocol_version.min(protocol::PROTOCOL_VERSION),
            )
        };
        let sender_id = format!(
            "{}.{}",
            socket::hostname().unwrap_or_else(|| "sender".into()),
            std::process::id()
        );

        let queue = DirectorySourceQueue::new(&self.req.directory, self.opts.block_size_bytes());

        // probe handshake on the first live connection
        let (first_port, mut probe) = streams.remove(0);
        let settings = Settings {
            protocol_version: version_max,
            sender_id: sender_id.clone(),
            transfer_id: self.req.transfer_id.clone(),
            read_timeout_millis: self.opts.read_timeout_millis,
            write_timeout_millis: self.opts.write_timeout_millis,
            block_size: self.opts.block_size_bytes(),
            enable_checksum: self.opts.enable_checksum,
            enable_download_resumption: self.opts.enable_download_resumption,
            request_chunks_info: self.opts.enable_download_resumption,
        };
        let negotiated = handshake(&mut probe, &settings, version_min, version_max)?;
        if self.opts.enable_download_resumption {
            let chunks = read_chunks_info(&mut probe)?;
            if !chunks.is_empty() {
                eprintln!(
                    "receiver already owns ranges in {} files, skipping those",
                    chunks.len()
                );
            }
            queue.set_previously_received(chunks);
            let mut ack = Vec::new();
            Checkpoint::default().encode(&mut ack);
            socket::send_frame(&mut probe, op::ACK, &ack).context("ack chunks info")?;
        }
        self.negotiated_version = negotiated;

        queue.start_discovery(self.req.file_list.take());

        let throttler = if self.opts.throttler_enabled() {
            Some(Throttler::new(
                self.opts.avg_mbytes_per_sec,
                self.opts.max_mbytes_per_sec,
            ))
        } else {
            None
        };
        self.live_ports = std::iter::once(first_port)
            .chain(streams.iter().map(|(p, _)| *p))
            .collect();
        let mut worker_streams: Vec<Option<TcpStream>> = vec![Some(probe)];
        worker_streams.extend(streams.into_iter().map(|(_, s)| Some(s)));

        self.shared = Some(Arc::new(Shared {
            opts: self.opts.clone(),
            queue,
            throttler,
            abort: Arc::clone(&self.abort),
            progress: Arc::clone(&self.progress),
            root: self.req.directory.clone(),
            host: self.req.host.clone(),
            sender_id,
            transfer_id: self.req.transfer_id.clone(),
            version_min,
            version_max,
        }));
        self.pending_streams = worker_streams;
        Ok(())
    }

    /// Run the transfer to completion and fold the per-worker stats.
    pub fn transfer(&mut self) -> Result<TransferReport> {
        let shared = self
            .shared
            .take()
            .context("init() must succeed before transfer()")?;
        let start = Instant::now();
        let streams = std::mem::take(&mut self.pending_streams);
        let mut handles = Vec::new();
        for (idx, (port, stream)) in self
            .live_ports
            .iter()
            .copied()
            .zip(streams.into_iter())
            .enumerate()
        {
            let shared = Arc::clone(&shared);
            let negotiated = self.negotiated_version;
            let handle = thread::Builder::new()
                .name(format!("wdt-send-{}", idx))
                .spawn(move || {
                    // only the probe connection has exchanged settings
                    let handshake_done = idx == 0;
                    let mut worker =
                        SenderThread::new(idx, port, shared, negotiated, stream, handshake_done);
                    worker.run();
                    worker.stats
                })
                .context("spawn sender worker")?;
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
        let (_, total_bytes) = shared.queue.counts();
        let mut report = TransferReport::new(thread_stats, start.elapsed(), total_bytes);
        if shared.queue.num_failed_files() > 0 {
            report.totals.record_error(ErrorCode::FileReadError);
        }
        if self.abort.should_abort() {
            report.totals.record_error(ErrorCode::AbortedByApplication);
        }
        Ok(report)
    }
}

/// SETTINGS exchange on a fresh connection. Returns the negotiated version.
fn handshake(
    stream: &mut TcpStream,
    settings: &Settings,
    version_min: u32,
    version_max: u32,
) -> Result<u32> {
    let mut body = Vec::new();
    settings.encode(&mut body);
    socket::send_frame(stream, op::SETTINGS, &body)
        .map_err(|e| coded(ErrorCode::SocketWriteError, format!("send settings: {}", e)))?;

    let mut opcode = [0u8; 1];
    stream
        .read_exact(&mut opcode)
        .map_err(|e| coded(ErrorCode::SocketReadError, format!("settings reply: {}", e)))?;
    match opcode[0] {
        op::SETTINGS => {
            let reply = Settings::decode(stream)
                .map_err(|e| coded(ErrorCode::ProtocolError, e.to_string()))?;
            match protocol::negotiate_version(version_min, version_max, reply.protocol_version) {
                Some(v) => Ok(v),
                None => {
                    send_abort(stream, ErrorCode::VersionMismatch, version_max, 0);
                    Err(coded(
                        ErrorCode::VersionMismatch,
                        format!(
                            "receiver speaks {} but we need {}..={}",
                            reply.protocol_version, version_min, version_max
                        ),
                    ))
                }
            }
        }
        op::ABORT => {
            let info = AbortInfo::decode(stream)
                .map_err(|e| coded(ErrorCode::ProtocolError, e.to_string()))?;
            Err(coded(
                info.error,
                format!("receiver aborted handshake (their version {})", info.protocol_version),
            ))
        }
        other => Err(coded(
            ErrorCode::ProtocolError,
            format!("unexpected opcode {} in settings reply", other),
        )),
    }
}

fn read_chunks_info(stream: &mut TcpStream) -> Result<Vec<protocol::FileChunks>> {
    let mut opcode = [0u8; 1];
    stream
        .read_exact(&mut opcode)
        .map_err(|e| coded(ErrorCode::SocketReadError, format!("chunks info: {}", e)))?;
    if opcode[0] != op::FILE_CHUNKS_INFO {
        return Err(coded(
            ErrorCode::ProtocolError,
            format!("expected FILE_CHUNKS_INFO, got opcode {}", opcode[0]),
        ));
    }
    protocol::decode_file_chunks_info(stream).map_err(|e| coded(ErrorCode::ProtocolError, e.to_string()))
}

fn send_abort(stream: &mut TcpStream, error: ErrorCode, version: u32, checkpoint: u64) {
    let mut body = Vec::new();
    AbortInfo {
        protocol_version: version,
        error,
        checkpoint,
    }
    .encode(&mut body);
    let _ = socket::send_frame(stream, op::ABORT, &body);
}

enum LoopEnd {
    /// Clean DONE handshake; connection closed.
    Finished,
    /// Connection-level failure worth a reconnect.
    Retry(ErrorCode),
    /// Stop this worker; other workers may still finish the transfer.
    Fatal(ErrorCode),
}

struct SenderThread {
    idx: usize,
    port: u16,
    shared: Arc<Shared>,
    stream: Option<TcpStream>,
    history: ThreadTransferHistory,
    stats: TransferStats,
    negotiated_version: u32,
    size_sent: bool,
    handshake_done: bool,
    /// True once a connection on this port carried traffic and failed, so
    /// the next accept on the receiver leads with a local checkpoint.
    reconnecting: bool,
}

impl SenderThread {
    fn new(
        idx: usize,
        port: u16,
        shared: Arc<Shared>,
        negotiated_version: u32,
        stream: Option<TcpStream>,
        handshake_done: bool,
    ) -> SenderThread {
        let history = ThreadTransferHistory::new(Arc::clone(&shared.queue));
        SenderThread {
            idx,
            port,
            shared,
            stream,
            history,
            stats: TransferStats::default(),
            negotiated_version,
            size_sent: false,
            handshake_done,
            reconnecting: false,
        }
    }

    fn abort_checker(&self) -> &dyn AbortChecker {
        &*self.shared.abort
    }

    fn run(&mut self) {
        let max_retries = self.shared.opts.max_transfer_retries;
        let mut attempts = 0u32;
        loop {
            if self.abort_checker().should_abort() {
                if let Some(stream) = self.stream.as_mut() {
                    send_abort(
                        stream,
                        ErrorCode::AbortedByApplication,
                        self.negotiated_version,
                        0,
                    );
                }
                self.stats.record_error(ErrorCode::AbortedByApplication);
                self.history.rewind_all(&mut self.stats);
                return;
            }
            if self.stream.is_none() || !self.handshake_done {
                attempts += 1;
                if attempts > max_retries {
                    self.stats.record_error(ErrorCode::ConnError);
                    self.history.rewind_all(&mut self.stats);
                    return;
                }
                match self.connect() {
                    Ok(()) => {}
                    Err(code) => {
                        self.stats.record_error(code);
                        if code == ErrorCode::VersionMismatch || code == ErrorCode::Abort {
                            self.history.rewind_all(&mut self.stats);
                            return;
                        }
                        sleep_abortable(
                            self.abort_checker(),
                            Duration::from_millis(self.shared.opts.retry_sleep_millis),
                        );
                        continue;
                    }
                }
            }
            match self.send_loop() {
                LoopEnd::Finished => return,
                LoopEnd::Retry(code) => {
                    eprintln!("worker {} port {} connection lost: {}", self.idx, self.port, code);
                    self.stats.record_error(code);
                    self.stream = None;
                    self.handshake_done = false;
                    self.reconnecting = true;
                    // in-flight blocks stay in history; the reconnect
                    // checkpoint decides what to trim before the rewind
                }
                LoopEnd::Fatal(code) => {
                    self.stats.record_error(code);
                    self.history.rewind_all(&mut self.stats);
                    self.stream = None;
                    return;
                }
            }
        }
    }

    /// (Re)establish this worker's connection and redo the settings
    /// exchange. The receiver leads a re-accept with its local checkpoint,
    /// so the reply loop accepts an ACK frame ahead of SETTINGS; when no
    /// checkpoint arrives on a reconnect, everything un-acked is resent.
    fn connect(&mut self) -> std::result::Result<(), ErrorCode> {
        if self.stream.is_none() {
            let stream = socket::connect(&self.shared.host, self.port, &self.shared.opts)
                .map_err(|_| ErrorCode::ConnError)?;
            self.stream = Some(stream);
        }
        let settings = Settings {
            protocol_version: self.shared.version_max,
            sender_id: self.shared.sender_id.clone(),
            transfer_id: self.shared.transfer_id.clone(),
            read_timeout_millis: self.shared.opts.read_timeout_millis,
            write_timeout_millis: self.shared.opts.write_timeout_millis,
            block_size: self.shared.opts.block_size_bytes(),
            enable_checksum: self.shared.opts.enable_checksum,
            enable_download_resumption: self.shared.opts.enable_download_resumption,
            request_chunks_info: false,
        };
        match self.exchange_settings(&settings) {
            Ok(v) => {
                self.negotiated_version = v;
                self.handshake_done = true;
                self.reconnecting = false;
                self.history.reset_connection();
                Ok(())
            }
            Err(code) => {
                // the receiver may have observed this connection; the next
                // accept can lead with a checkpoint either way
                self.stream = None;
                self.reconnecting = true;
                Err(code)
            }
        }
    }

    fn exchange_settings(&mut self, settings: &Settings) -> std::result::Result<u32, ErrorCode> {
        let mut body = Vec::new();
        settings.encode(&mut body);
        {
            let stream = self.stream.as_mut().unwrap();
            if let Err(e) = socket::send_frame(stream, op::SETTINGS, &body) {
                eprintln!("send settings failed: {}", e);
                return Err(ErrorCode::SocketWriteError);
            }
        }
        let mut saw_checkpoint = false;
        loop {
            let mut opcode = [0u8; 1];
            let stream = self.stream.as_mut().unwrap();
            if stream.read_exact(&mut opcode).is_err() {
                return Err(ErrorCode::SocketReadError);
            }
            match opcode[0] {
                op::ACK => {
                    let cp = Checkpoint::decode(stream).map_err(|_| ErrorCode::ProtocolError)?;
                    if self.reconnecting && !saw_checkpoint {
                        self.history
                            .set_checkpoint_and_rewind(cp, &mut self.stats)
                            .map_err(|_| ErrorCode::ProtocolError)?;
                    }
                    saw_checkpoint = true;
                }
                op::SETTINGS => {
                    let reply =
                        Settings::decode(stream).map_err(|_| ErrorCode::ProtocolError)?;
                    let negotiated = match protocol::negotiate_version(
                        self.shared.version_min,
                        self.shared.version_max,
                        reply.protocol_version,
                    ) {
                        Some(v) => v,
                        None => {
                            send_abort(
                                stream,
                                ErrorCode::VersionMismatch,
                                self.shared.version_max,
                                0,
                            );
                            return Err(ErrorCode::VersionMismatch);
                        }
                    };
                    if self.reconnecting && !saw_checkpoint {
                        // receiver had nothing for us; resend it all
                        self.history.rewind_all(&mut self.stats);
                    }
                    return Ok(negotiated);
                }
                op::ABORT => {
                    let info =
                        AbortInfo::decode(stream).map_err(|_| ErrorCode::ProtocolError)?;
                    self.stats.record_remote_error(info.error);
                    return Err(if info.error == ErrorCode::VersionMismatch {
                        ErrorCode::VersionMismatch
                    } else {
                        ErrorCode::Abort
                    });
                }
                other => {
                    eprintln!("unexpected opcode {} in settings reply", other);
                    return Err(ErrorCode::ProtocolError);
                }
            }
        }
    }

    fn send_loop(&mut self) -> LoopEnd {
        loop {
            if self.abort_checker().should_abort() {
                if let Some(stream) = self.stream.as_mut() {
                    send_abort(
                        stream,
                        ErrorCode::AbortedByApplication,
                        self.negotiated_version,
                        0,
                    );
                }
                self.history.rewind_all(&mut self.stats);
                return LoopEnd::Fatal(ErrorCode::AbortedByApplication);
            }
            if let Err(end) = self.drain_acks() {
                return end;
            }
            if !self.size_sent && self.shared.queue.discovery_finished() {
                let (_, total) = self.shared.queue.counts();
                self.shared.progress.set_total(total);
                let mut body = Vec::new();
                protocol::write_varint(&mut body, total);
                if let Err(e) =
                    socket::send_frame(self.stream.as_mut().unwrap(), op::SIZE_CMD, &body)
                {
                    eprintln!("size announce failed: {}", e);
                    return LoopEnd::Retry(ErrorCode::SocketWriteError);
                }
                self.stats.add_header_bytes(1 + body.len() as u64);
                self.size_sent = true;
            }
            match self.shared.queue.get_next_source(QUEUE_POLL) {
                QueuePoll::Timeout => continue,
                QueuePoll::Finished => break,
                QueuePoll::Source(source) => {
                    if let Err(end) = self.send_block(source) {
                        return end;
                    }
                }
            }
        }
        self.finish_connection()
    }

    /// Stream one block: header, body chunks under the throttler, CRC
    /// footer. The block joins the history whether or not the write
    /// succeeded; a failed write is rewound via the reconnect checkpoint.
    fn send_block(&mut self, source: ByteSource) -> std::result::Result<(), LoopEnd> {
        let opts = &self.shared.opts;
        let header = BlockHeader {
            seq_id: source.meta.seq_id,
            file_size: source.meta.size,
            offset: source.offset,
            length: source.length,
            flags: source.meta.perms as u64,
            rel_path: source.meta.rel_path.clone(),
        };
        let mut head = Vec::new();
        header.encode(&mut head);

        let mut reader = match FileByteSource::open(
            &self.shared.root,
            source.clone(),
            opts.buffer_size,
            opts.odirect,
        ) {
            Ok(r) => r,
            Err(e) => {
                // per-file failure: take the block out of the discovered
                // totals so no receiver waits for it, and keep going
                eprintln!("cannot read {}: {}", source.identifier(), e);
                self.shared.queue.mark_source_failed(&source);
                self.stats.record_error(ErrorCode::FileReadError);
                self.stats.num_failed_attempts += 1;
                return Ok(());
            }
        };

        let result = self.write_block(&head, &mut reader);
        let header_bytes = 1 + head.len() as u64;
        self.stats.add_header_bytes(header_bytes);
        self.stats.num_blocks += 1;
        self.history.append(source, header_bytes);
        match result {
            Ok(data_bytes) => {
                self.stats.add_data_bytes(data_bytes);
                self.shared.progress.add_done(data_bytes);
                Ok(())
            }
            Err(code) => Err(LoopEnd::Retry(code)),
        }
    }

    fn write_block(
        &mut self,
        head: &[u8],
        reader: &mut FileByteSource,
    ) -> std::result::Result<u64, ErrorCode> {
        let stream = self.stream.as_mut().unwrap();
        if let Err(e) = socket::send_frame(stream, op::FILE_CHUNK, head) {
            eprintln!("block header write failed: {}", e);
            return Err(ErrorCode::SocketWriteError);
        }
        let mut hasher = self
            .shared
            .opts
            .enable_checksum
            .then(crc32fast::Hasher::new);
        let mut sent = 0u64;
        loop {
            let chunk = match reader.read_chunk() {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    // the stream is now desynchronised; drop the connection
                    eprintln!("read failed mid-block: {}", e);
                    self.stats.record_error(ErrorCode::FileReadError);
                    return Err(ErrorCode::FileReadError);
                }
            };
            if let Some(t) = &self.shared.throttler {
                if !t.limit(chunk.len() as u64, &*self.shared.abort) {
                    return Err(ErrorCode::Abort);
                }
            }
            if let Some(h) = hasher.as_mut() {
                h.update(chunk);
            }
            if let Err(e) = std::io::Write::write_all(stream, chunk) {
                eprintln!("block body write failed: {}", e);
                return Err(ErrorCode::SocketWriteError);
            }
            sent += chunk.len() as u64;
        }
        if let Some(h) = hasher {
            let crc = h.finalize();
            if let Err(e) = std::io::Write::write_all(stream, &crc.to_le_bytes()) {
                eprintln!("checksum write failed: {}", e);
                return Err(ErrorCode::SocketWriteError);
            }
        }
        Ok(sent)
    }

    /// Opportunistically consume control frames the receiver pushed while we
    /// were streaming blocks.
    fn drain_acks(&mut self) -> std::result::Result<(), LoopEnd> {
        loop {
            let ready = {
                let stream = self.stream.as_mut().unwrap();
                if stream.set_nonblocking(true).is_err() {
                    return Err(LoopEnd::Retry(ErrorCode::SocketReadError));
                }
                let mut peek = [0u8; 1];
                let ready = match stream.peek(&mut peek) {
                    Ok(0) => {
                        let _ = stream.set_nonblocking(false);
                        return Err(LoopEnd::Retry(ErrorCode::ConnError));
                    }
                    Ok(_) => true,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        false
                    }
                    Err(_) => {
                        let _ = stream.set_nonblocking(false);
                        return Err(LoopEnd::Retry(ErrorCode::SocketReadError));
                    }
                };
                if stream.set_nonblocking(false).is_err() {
                    return Err(LoopEnd::Retry(ErrorCode::SocketReadError));
                }
                ready
            };
            if !ready {
                return Ok(());
            }
            match self.read_control_frame() {
                Ok(end) => {
                    if let Some(end) = end {
                        return Err(end);
                    }
                }
                Err(end) => return Err(end),
            }
        }
    }

    /// Read one control frame (blocking). Returns Some(end) when the frame
    /// terminates the loop.
    fn read_control_frame(&mut self) -> std::result::Result<Option<LoopEnd>, LoopEnd> {
        let stream = self.stream.as_mut().unwrap();
        let mut opcode = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut opcode) {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                return Err(LoopEnd::Retry(ErrorCode::SocketReadError));
            }
            return Err(LoopEnd::Retry(ErrorCode::SocketReadError));
        }
        self.stats.add_header_bytes(1);
        match opcode[0] {
            op::ACK => {
                let cp = Checkpoint::decode(stream)
                    .map_err(|_| LoopEnd::Fatal(ErrorCode::ProtocolError))?;
                self.history
                    .ack_up_to(cp.acked_blocks, &mut self.stats)
                    .map_err(|_| LoopEnd::Fatal(ErrorCode::ProtocolError))?;
                Ok(None)
            }
            op::WAIT => Ok(None),
            op::ERR_CMD => {
                let cp = Checkpoint::decode(stream)
                    .map_err(|_| LoopEnd::Fatal(ErrorCode::ProtocolError))?;
                if self
                    .history
                    .set_checkpoint_and_rewind(cp, &mut self.stats)
                    .is_err()
                {
                    return Ok(Some(LoopEnd::Fatal(ErrorCode::ProtocolError)));
                }
                // receiver could not persist part of this connection's
                // stream; reconnect and resend the rewound blocks
                Ok(Some(LoopEnd::Retry(ErrorCode::SocketWriteError)))
            }
            op::DONE => {
                // receiver confirms everything is flushed; close out
                self.history.mark_all_acked(&mut self.stats);
                let stream = self.stream.as_mut().unwrap();
                let _ = socket::send_frame(stream, op::DONE, &[]);
                let _ = stream.shutdown(std::net::Shutdown::Write);
                let mut tail = [0u8; 1];
                let _ = stream.read(&mut tail);
                self.stream = None;
                Ok(Some(LoopEnd::Finished))
            }
            op::ABORT => {
                let info = AbortInfo::decode(stream)
                    .map_err(|_| LoopEnd::Fatal(ErrorCode::ProtocolError))?;
                self.stats.record_remote_error(info.error);
                Ok(Some(LoopEnd::Fatal(if info.error == ErrorCode::VersionMismatch {
                    ErrorCode::VersionMismatch
                } else {
                    ErrorCode::Abort
                })))
            }
            other => {
                eprintln!("unexpected opcode {} from receiver", other);
                Ok(Some(LoopEnd::Fatal(ErrorCode::ProtocolError)))
            }
        }
    }

    /// Queue drained: send DONE and wait for the receiver to flush and
    /// confirm. A WAIT with the queue re-populated (another worker failed)
    /// sends us back to the block loop.
    fn finish_connection(&mut self) -> LoopEnd {
        let (num_blocks, total_bytes) = self.shared.queue.counts();
        let mut body = Vec::new();
        DoneInfo {
            num_blocks,
            total_bytes,
        }
        .encode(&mut body);
        if let Err(e) = socket::send_frame(self.stream.as_mut().unwrap(), op::DONE, &body) {
            eprintln!("done send failed: {}", e);
            return LoopEnd::Retry(ErrorCode::SocketWriteError);
        }
        self.stats.add_header_bytes(1 + body.len() as u64);
        loop {
            if self.abort_checker().should_abort() {
                self.history.rewind_all(&mut self.stats);
                return LoopEnd::Fatal(ErrorCode::AbortedByApplication);
            }
            // a failed sibling may have returned work to the queue
            if let QueuePoll::Source(source) = self.shared.queue.get_next_source(Duration::ZERO) {
                if let Err(end) = self.send_block(source) {
                    return end;
                }
                return self.send_loop();
            }
            match self.read_control_frame() {
                Ok(None) => continue,
                Ok(Some(LoopEnd::Finished)) => return LoopEnd::Finished,
                Ok(Some(end)) => return end,
                Err(end) => return end,
            }
        }
    }

}
