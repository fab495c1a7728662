use anyhow::Result;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wdt::abort::AbortFlag;
use wdt::error::{code_of, ErrorCode};
use wdt::options::WdtOptions;
use wdt::protocol::{self, op};
use wdt::receiver::Receiver;
use wdt::request::TransferRequest;
use wdt::sender::Sender;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    if size == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; 64 * 1024];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Find a base port with `n` consecutive free ports above it.
fn free_port_range(n: usize) -> u16 {
    for _ in 0..50 {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);
        if base as usize + n >= 65535 {
            continue;
        }
        let held: Vec<_> = (0..n as u16)
            .map(|i| TcpListener::bind(("127.0.0.1", base + i)))
            .collect();
        if held.iter().all(|r| r.is_ok()) {
            return base;
        }
    }
    panic!("no free port range found");
}

fn test_options(num_ports: usize, start_port: u16) -> WdtOptions {
    WdtOptions {
        start_port,
        num_ports,
        block_size_mbytes: 1,
        read_timeout_millis: 2000,
        write_timeout_millis: 2000,
        connect_timeout_millis: 1000,
        ..WdtOptions::default()
    }
}

fn assert_trees_equal(src: &Path, dst: &Path) {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).unwrap();
        let mirrored = dst.join(rel);
        assert!(mirrored.exists(), "{} missing on receiver", rel.display());
        let want = std::fs::read(entry.path()).unwrap();
        let got = std::fs::read(&mirrored).unwrap();
        assert_eq!(want.len(), got.len(), "size mismatch for {}", rel.display());
        assert_eq!(want, got, "content mismatch for {}", rel.display());
    }
}

struct TestPeers {
    receiver: Arc<Receiver>,
    sender: Sender,
    receiver_abort: Arc<AbortFlag>,
    sender_abort: Arc<AbortFlag>,
}

fn make_peers(
    src: &Path,
    dst: &Path,
    num_ports: usize,
    tweak: impl Fn(&mut WdtOptions),
) -> TestPeers {
    let start_port = free_port_range(num_ports);
    let mut opts = test_options(num_ports, start_port);
    tweak(&mut opts);

    let receiver_abort = AbortFlag::new();
    let recv_req = TransferRequest {
        directory: dst.to_path_buf(),
        start_port,
        num_ports,
        ..Default::default()
    };
    let receiver = Arc::new(
        Receiver::new(recv_req, opts.clone(), Arc::clone(&receiver_abort)).unwrap(),
    );

    let sender_abort = AbortFlag::new();
    let send_req = TransferRequest {
        host: "127.0.0.1".into(),
        directory: src.to_path_buf(),
        ports: receiver.bound_ports(),
        num_ports: receiver.bound_ports().len(),
        start_port,
        transfer_id: receiver.transfer_id().to_string(),
        ..Default::default()
    };
    let sender = Sender::new(send_req, opts, Arc::clone(&sender_abort));
    TestPeers {
        receiver,
        sender,
        receiver_abort,
        sender_abort,
    }
}

fn run_transfer(peers: &mut TestPeers) -> (wdt::stats::TransferReport, wdt::stats::TransferReport) {
    let receiver = Arc::clone(&peers.receiver);
    let recv_handle = thread::spawn(move || receiver.transfer().unwrap());
    // give the acceptor threads a moment to come up
    thread::sleep(Duration::from_millis(50));
    peers.sender.init().unwrap();
    let send_report = peers.sender.transfer().unwrap();
    let recv_report = recv_handle.join().unwrap();
    (send_report, recv_report)
}

#[test]
fn small_tree_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("a.txt"), b"hello\n").unwrap();
    write_file(&src.path().join("sub/b.bin"), 1024 * 1024).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 4, |_| {});
    let (send_report, recv_report) = run_transfer(&mut peers);
    assert_eq!(send_report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());
    assert_eq!(send_report.totals.effective_data_bytes, 1024 * 1024 + 6);
    assert_eq!(recv_report.totals.data_bytes, 1024 * 1024 + 6);
}

#[test]
fn multi_block_files_and_empty_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    // crosses several 1 MiB blocks, not block-aligned
    write_file(&src.path().join("big.bin"), 3 * 1024 * 1024 + 12345).unwrap();
    write_file(&src.path().join("deep/nested/dir/c.dat"), 70_000).unwrap();
    write_file(&src.path().join("empty.bin"), 0).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 2, |_| {});
    let (send_report, recv_report) = run_transfer(&mut peers);
    assert_eq!(send_report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());
    assert_eq!(
        std::fs::metadata(dst.path().join("empty.bin")).unwrap().len(),
        0
    );
}

#[test]
fn checksums_disabled_still_round_trips() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(&src.path().join("x.bin"), 2 * 1024 * 1024).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 2, |o| o.enable_checksum = false);
    let (send_report, recv_report) = run_transfer(&mut peers);
    assert_eq!(send_report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());
}

#[test]
fn port_shortfall_tolerated_when_not_strict() {
    let num_ports = 5;
    let start_port = free_port_range(num_ports);
    // squat on two ports in the middle of the range
    let _squat1 = TcpListener::bind(("0.0.0.0", start_port + 1)).unwrap();
    let _squat2 = TcpListener::bind(("0.0.0.0", start_port + 2)).unwrap();

    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(&src.path().join("f.bin"), 300_000).unwrap();

    let opts = test_options(num_ports, start_port);
    let receiver_abort = AbortFlag::new();
    let receiver = Arc::new(
        Receiver::new(
            TransferRequest {
                directory: dst.path().to_path_buf(),
                start_port,
                num_ports,
                ..Default::default()
            },
            opts.clone(),
            receiver_abort,
        )
        .unwrap(),
    );
    assert_eq!(receiver.bound_ports().len(), 3);

    let sender_abort = AbortFlag::new();
    let mut sender = Sender::new(
        TransferRequest {
            host: "127.0.0.1".into(),
            directory: src.path().to_path_buf(),
            ports: receiver.bound_ports(),
            num_ports: receiver.bound_ports().len(),
            start_port,
            transfer_id: receiver.transfer_id().to_string(),
            ..Default::default()
        },
        opts,
        sender_abort,
    );
    let recv = Arc::clone(&receiver);
    let handle = thread::spawn(move || recv.transfer().unwrap());
    thread::sleep(Duration::from_millis(50));
    sender.init().unwrap();
    let report = sender.transfer().unwrap();
    let recv_report = handle.join().unwrap();
    assert_eq!(report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());
}

#[test]
fn port_shortfall_fatal_when_strict() {
    let num_ports = 4;
    let start_port = free_port_range(num_ports);
    let _squat = TcpListener::bind(("0.0.0.0", start_port + 3)).unwrap();

    let mut opts = test_options(num_ports, start_port);
    opts.treat_fewer_port_as_error = true;
    let dst = tempfile::tempdir().unwrap();
    let err = Receiver::new(
        TransferRequest {
            directory: dst.path().to_path_buf(),
            start_port,
            num_ports,
            ..Default::default()
        },
        opts,
        AbortFlag::new(),
    )
    .err()
    .expect("strict receiver must fail");
    assert_eq!(code_of(&err), ErrorCode::FewerPorts);
}

#[test]
fn version_mismatch_fails_handshake() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(&src.path().join("f"), 1000).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 2, |_| {});
    peers.sender = {
        let req = TransferRequest {
            host: "127.0.0.1".into(),
            directory: src.path().to_path_buf(),
            ports: peers.receiver.bound_ports(),
            num_ports: peers.receiver.bound_ports().len(),
            start_port: peers.receiver.bound_ports()[0],
            transfer_id: peers.receiver.transfer_id().to_string(),
            protocol_version: 9999,
            version_pinned: true,
            ..Default::default()
        };
        Sender::new(
            req,
            test_options(2, peers.receiver.bound_ports()[0]),
            Arc::clone(&peers.sender_abort),
        )
    };
    let receiver = Arc::clone(&peers.receiver);
    let handle = thread::spawn(move || receiver.transfer().unwrap());
    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    let err = peers.sender.init().err().expect("handshake must fail");
    assert_eq!(code_of(&err), ErrorCode::VersionMismatch);
    let recv_report = handle.join().unwrap();
    assert_eq!(recv_report.summary(), ErrorCode::VersionMismatch);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn resumption_skips_already_received_files() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(&src.path().join("keep.bin"), 2 * 1024 * 1024).unwrap();
    write_file(&src.path().join("lost.bin"), 1024 * 1024).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 2, |o| {
        o.enable_download_resumption = true;
    });
    let (send_report, recv_report) = run_transfer(&mut peers);
    assert_eq!(send_report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());

    // lose one file; the log invalidates it on the next session
    std::fs::remove_file(dst.path().join("lost.bin")).unwrap();

    let mut opts = test_options(2, peers.receiver.bound_ports()[0]);
    opts.enable_download_resumption = true;
    let mut sender2 = Sender::new(
        TransferRequest {
            host: "127.0.0.1".into(),
            directory: src.path().to_path_buf(),
            ports: peers.receiver.bound_ports(),
            num_ports: peers.receiver.bound_ports().len(),
            start_port: peers.receiver.bound_ports()[0],
            transfer_id: peers.receiver.transfer_id().to_string(),
            ..Default::default()
        },
        opts,
        AbortFlag::new(),
    );
    let receiver = Arc::clone(&peers.receiver);
    let handle = thread::spawn(move || receiver.transfer().unwrap());
    thread::sleep(Duration::from_millis(50));
    sender2.init().unwrap();
    let report = sender2.transfer().unwrap();
    let recv_report = handle.join().unwrap();
    assert_eq!(report.summary(), ErrorCode::Ok);
    assert_eq!(recv_report.summary(), ErrorCode::Ok);
    assert_trees_equal(src.path(), dst.path());
    // only the lost file moved again
    assert_eq!(report.totals.effective_data_bytes, 1024 * 1024);
}

#[test]
fn abort_tears_down_quickly() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(&src.path().join("slow.bin"), 8 * 1024 * 1024).unwrap();

    let mut peers = make_peers(src.path(), dst.path(), 2, |o| {
        // ~1 MiB/s: the 8 MiB transfer cannot finish before the abort
        o.avg_mbytes_per_sec = 1.0;
        o.max_mbytes_per_sec = 1.0;
    });
    let receiver = Arc::clone(&peers.receiver);
    let recv_handle = thread::spawn(move || receiver.transfer().unwrap());
    thread::sleep(Duration::from_millis(50));
    peers.sender.init().unwrap();

    let sender_abort = Arc::clone(&peers.sender_abort);
    let receiver_abort = Arc::clone(&peers.receiver_abort);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        sender_abort.abort();
        receiver_abort.abort();
    });
    let start = Instant::now();
    let report = peers.sender.transfer().unwrap();
    let elapsed = start.elapsed();
    assert_eq!(report.summary(), ErrorCode::AbortedByApplication);
    // read/write timeouts are 2s; one timeout plus slack
    assert!(elapsed < Duration::from_secs(6), "teardown took {:?}", elapsed);
    recv_handle.join().unwrap();
}

/// Drives one receiver port with hand-rolled frames to exercise checksum
/// rejection and the reconnect checkpoint.
#[test]
fn corrupt_block_is_rejected_then_recovered() {
    let dst = tempfile::tempdir().unwrap();
    let start_port = free_port_range(1);
    let opts = test_options(1, start_port);
    let receiver = Arc::new(
        Receiver::new(
            TransferRequest {
                directory: dst.path().to_path_buf(),
                start_port,
                num_ports: 1,
                ..Default::default()
            },
            opts,
            AbortFlag::new(),
        )
        .unwrap(),
    );
    let transfer_id = receiver.transfer_id().to_string();
    let recv = Arc::clone(&receiver);
    let handle = thread::spawn(move || recv.transfer().unwrap());
    thread::sleep(Duration::from_millis(50));

    let payload = vec![0x5au8; 1000];
    let settings = protocol::Settings {
        protocol_version: protocol::PROTOCOL_VERSION,
        sender_id: "test-driver".into(),
        transfer_id: transfer_id.clone(),
        read_timeout_millis: 2000,
        write_timeout_millis: 2000,
        block_size: 1024 * 1024,
        enable_checksum: true,
        enable_download_resumption: false,
        request_chunks_info: false,
    };
    let header = protocol::BlockHeader {
        seq_id: 0,
        file_size: 1000,
        offset: 0,
        length: 1000,
        flags: 0o644,
        rel_path: "victim.bin".into(),
    };

    let handshake = |stream: &mut std::net::TcpStream| {
        let mut body = Vec::new();
        settings.encode(&mut body);
        let mut frame = vec![op::SETTINGS];
        frame.extend_from_slice(&body);
        stream.write_all(&frame).unwrap();
        let mut opcode = [0u8; 1];
        stream.read_exact(&mut opcode).unwrap();
        assert_eq!(opcode[0], op::SETTINGS);
        protocol::Settings::decode(stream).unwrap();
    };
    let send_block = |stream: &mut std::net::TcpStream, crc: u32| {
        let mut body = Vec::new();
        header.encode(&mut body);
        let mut frame = vec![op::FILE_CHUNK];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        stream.write_all(&frame).unwrap();
    };
    let good_crc = {
        let mut h = crc32fast::Hasher::new();
        h.update(&payload);
        h.finalize()
    };

    // first connection: corrupted checksum gets the connection dropped
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", start_port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    handshake(&mut stream);
    send_block(&mut stream, good_crc ^ 1);
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0, "expected drop");
    drop(stream);

    // reconnect: local checkpoint says nothing was persisted; resend
    let mut stream = std::net::TcpStream::connect(("127.0.0.1", start_port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut opcode = [0u8; 1];
    stream.read_exact(&mut opcode).unwrap();
    assert_eq!(opcode[0], op::ACK);
    let cp = protocol::Checkpoint::decode(&mut stream).unwrap();
    assert_eq!(cp.acked_blocks, 0);
    handshake(&mut stream);
    send_block(&mut stream, good_crc);
    let mut done_body = Vec::new();
    protocol::DoneInfo {
        num_blocks: 1,
        total_bytes: 1000,
    }
    .encode(&mut done_body);
    let mut frame = vec![op::DONE];
    frame.extend_from_slice(&done_body);
    stream.write_all(&frame).unwrap();
    // final ACK then DONE (skipping any WAIT keep-alives)
    loop {
        stream.read_exact(&mut opcode).unwrap();
        match opcode[0] {
            op::WAIT => continue,
            op::ACK => {
                let cp = protocol::Checkpoint::decode(&mut stream).unwrap();
                assert_eq!(cp.acked_blocks, 1);
            }
            op::DONE => break,
            other => panic!("unexpected opcode {}", other),
        }
    }
    let reply = [op::DONE];
    stream.write_all(&reply).unwrap();
    drop(stream);

    let report = handle.join().unwrap();
    assert_eq!(
        std::fs::read(dst.path().join("victim.bin")).unwrap(),
        payload
    );
    // the corrupt attempt is on the books
    assert_eq!(report.summary(), ErrorCode::ChecksumMismatch);
}
