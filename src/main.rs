//! wdt command line: one binary running as sender or receiver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use wdt::abort::{abort_after, AbortFlag};
use wdt::error::{code_of, ErrorCode};
use wdt::logger::{Logger, NoopLogger, TextLogger};
use wdt::options::WdtOptions;
use wdt::progress::ProgressReporter;
use wdt::receiver::Receiver;
use wdt::request::TransferRequest;
use wdt::sender::Sender;
use wdt::transfer_log;

/// High throughput peer-to-peer directory transfer.
#[derive(Parser, Debug)]
#[command(author, version, about, rename_all = "snake_case")]
struct Args {
    /// Directory to send from, or receive into.
    #[arg(long, default_value = ".")]
    directory: PathBuf,

    /// Destination hostname. Empty means run as receiver.
    #[arg(long, default_value = "")]
    destination: String,

    /// Receiver-emitted connection URL; overrides destination/ports/id.
    #[arg(long)]
    connection_url: Option<String>,

    /// File list to send instead of walking the directory; '-' reads stdin.
    /// One file per line: <relative_path>[TAB<size>].
    #[arg(long)]
    manifest: Option<String>,

    /// Identifier tying both sides of one transfer together.
    #[arg(long, default_value = "")]
    transfer_id: String,

    /// Recovery id for download resumption (an alias for the transfer id).
    #[arg(long, default_value = "")]
    recovery_id: String,

    /// Protocol version to insist on (testing aid).
    #[arg(long)]
    protocol_version: Option<u32>,

    /// Receiver: serve transfers forever.
    #[arg(long)]
    run_as_daemon: bool,

    /// Parse and print the transfer log under --directory, then exit.
    #[arg(long)]
    parse_transfer_log: bool,

    /// Abort the transfer after this many seconds.
    #[arg(long, default_value_t = 0)]
    abort_after_seconds: u64,

    /// Fail instead of continuing when not all ports are usable.
    #[arg(long)]
    treat_fewer_port_as_error: bool,

    /// Print the effective options as JSON and exit.
    #[arg(long)]
    print_options: bool,

    /// Show a progress line.
    #[arg(long)]
    progress: bool,

    /// Append transfer activity to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// First port of the range.
    #[arg(long, default_value_t = wdt::options::DEFAULT_START_PORT)]
    start_port: u16,

    /// Number of ports (and worker connections).
    #[arg(long, default_value_t = wdt::options::DEFAULT_NUM_PORTS)]
    num_ports: usize,

    /// Block size in mebibytes.
    #[arg(long, default_value_t = 16)]
    block_size_mbytes: u64,

    /// Socket read timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    read_timeout_millis: u64,

    /// Socket write timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    write_timeout_millis: u64,

    /// Connect timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    connect_timeout_millis: u64,

    /// Verify a CRC32 per block.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_checksum: bool,

    /// Keep a transfer log and resume interrupted downloads.
    #[arg(long)]
    enable_download_resumption: bool,

    /// Average throttle, mebibytes/sec (<=0 disables).
    #[arg(long, default_value_t = -1.0)]
    avg_mbytes_per_sec: f64,

    /// Peak throttle, mebibytes/sec (<=0 derives from average).
    #[arg(long, default_value_t = -1.0)]
    max_mbytes_per_sec: f64,

    /// Reconnect attempts per connection.
    #[arg(long, default_value_t = 3)]
    max_transfer_retries: u32,

    /// Use O_DIRECT for file I/O.
    #[arg(long)]
    odirect: bool,

    /// Pre-allocate destination files to their announced size.
    #[arg(long)]
    enable_file_preallocation: bool,

    /// fsync the transfer log after every block instead of every file.
    #[arg(long)]
    log_fsync_per_block: bool,
}

impl Args {
    fn to_options(&self) -> WdtOptions {
        WdtOptions {
            start_port: self.start_port,
            num_ports: self.num_ports,
            block_size_mbytes: self.block_size_mbytes,
            read_timeout_millis: self.read_timeout_millis,
            write_timeout_millis: self.write_timeout_millis,
            connect_timeout_millis: self.connect_timeout_millis,
            enable_checksum: self.enable_checksum,
            enable_download_resumption: self.enable_download_resumption,
            avg_mbytes_per_sec: self.avg_mbytes_per_sec,
            max_mbytes_per_sec: self.max_mbytes_per_sec,
            max_transfer_retries: self.max_transfer_retries,
            odirect: self.odirect,
            enable_file_preallocation: self.enable_file_preallocation,
            log_fsync_per_block: self.log_fsync_per_block,
            treat_fewer_port_as_error: self.treat_fewer_port_as_error,
            ..WdtOptions::default()
        }
    }
}

/// `SIGINT`/`SIGTERM` flip the abort flag; `SIGPIPE` is ignored so a dead
/// peer surfaces as a write error instead of killing the process.
fn install_signal_handlers(flag: Arc<AbortFlag>) {
    use std::sync::OnceLock;
    static FLAG: OnceLock<Arc<AbortFlag>> = OnceLock::new();
    let _ = FLAG.set(flag);

    extern "C" fn on_signal(_sig: libc::c_int) {
        if let Some(flag) = FLAG.get() {
            flag.abort();
        }
    }
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn read_manifest(source: &str) -> Result<Vec<(String, Option<u64>)>> {
    let text = if source == "-" {
        let mut buf = String::new();
        for line in std::io::stdin().lock().lines() {
            buf.push_str(&line?);
            buf.push('\n');
        }
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("read manifest {}", source))?
    };
    let mut list = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            bail!("manifest line {} is empty", lineno + 1);
        }
        match line.split_once('\t') {
            Some((path, size)) => {
                let size: u64 = size
                    .parse()
                    .with_context(|| format!("manifest line {}: bad size", lineno + 1))?;
                list.push((path.to_string(), Some(size)));
            }
            None => list.push((line.to_string(), None)),
        }
    }
    Ok(list)
}

fn build_request(args: &Args) -> Result<TransferRequest> {
    let mut req = match &args.connection_url {
        Some(url) => TransferRequest::from_url(url)?,
        None => TransferRequest {
            host: args.destination.clone(),
            start_port: args.start_port,
            num_ports: args.num_ports,
            ..Default::default()
        },
    };
    req.directory = args.directory.clone();
    if !args.transfer_id.is_empty() {
        req.transfer_id = args.transfer_id.clone();
    }
    if !args.recovery_id.is_empty() {
        req.transfer_id = args.recovery_id.clone();
    }
    if let Some(v) = args.protocol_version {
        req.protocol_version = v;
        req.version_pinned = true;
    }
    if let Some(manifest) = &args.manifest {
        req.file_list = Some(read_manifest(manifest)?);
    }
    Ok(req)
}

fn run(args: &Args) -> Result<ErrorCode> {
    if args.print_options {
        println!("{}", serde_json::to_string_pretty(&args.to_options())?);
        return Ok(ErrorCode::Ok);
    }
    if args.parse_transfer_log {
        let path = transfer_log::TransferLogManager::log_path(&args.directory);
        transfer_log::print_log(&path)?;
        return Ok(ErrorCode::Ok);
    }

    let abort = AbortFlag::new();
    install_signal_handlers(Arc::clone(&abort));
    if args.abort_after_seconds > 0 {
        abort_after(Arc::clone(&abort), args.abort_after_seconds);
    }
    let logger: Arc<dyn Logger> = match &args.log_file {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };
    let opts = args.to_options();
    let req = build_request(args)?;

    if req.is_receiver() {
        let mut receiver = Receiver::new(req, opts, Arc::clone(&abort))?;
        receiver.set_logger(logger);
        println!("{}", receiver.connection_url());
        let reporter = args
            .progress
            .then(|| ProgressReporter::start(receiver.progress_counters()));
        let code = if args.run_as_daemon {
            receiver.run_forever()?;
            ErrorCode::Ok
        } else {
            let report = receiver.transfer()?;
            eprintln!("{}", report);
            report.summary()
        };
        if let Some(r) = reporter {
            r.finish();
        }
        Ok(code)
    } else {
        let mut sender = Sender::new(req, opts, Arc::clone(&abort));
        logger.transfer_start("sender", &args.directory, sender.transfer_id());
        sender.init()?;
        let reporter = args
            .progress
            .then(|| ProgressReporter::start(sender.progress_counters()));
        let report = sender.transfer()?;
        if let Some(r) = reporter {
            r.finish();
        }
        eprintln!("{}", report);
        logger.transfer_done(
            &report.summary().to_string(),
            report.totals.effective_data_bytes,
            report.elapsed.as_secs_f64(),
        );
        Ok(report.summary())
    }
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => std::process::exit(code.exit_code()),
        Err(e) => {
            eprintln!("wdt: {:#}", e);
            std::process::exit(code_of(&e).exit_code());
        }
    }
}
