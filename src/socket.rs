//! TCP socket plumbing shared by sender and receiver workers.

use anyhow::{Context, Result};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::options::WdtOptions;

/// Disable Nagle, enable keepalive, enlarge kernel buffers for throughput.
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        unsafe {
            let keepalive: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
            let sz: libc::c_int = 8 * 1024 * 1024;
            let p = &sz as *const _ as *const libc::c_void;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                p,
                std::mem::size_of_val(&sz) as libc::socklen_t,
            );
        }
    }
}

/// Apply the configured I/O deadlines so a wedged peer cannot stall a
/// worker indefinitely.
pub fn apply_timeouts(stream: &TcpStream, opts: &WdtOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(
        opts.read_timeout_millis.max(1),
    )));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(
        opts.write_timeout_millis.max(1),
    )));
}

/// Resolve and connect with the configured timeout, trying each address.
pub fn connect(host: &str, port: u16, opts: &WdtOptions) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", host, port))?
        .collect();
    let timeout = Duration::from_millis(opts.connect_timeout_millis.max(1));
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                tune_socket(&stream);
                apply_timeouts(&stream, opts);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "connect {}:{} failed: {}",
        host,
        port,
        last_err.map(|e| e.to_string()).unwrap_or_else(|| "no address".into())
    ))
}

/// Short host name of this machine, for ids and connection URLs.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let r = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if r != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// One frame: opcode byte plus its already-encoded body.
pub fn send_frame(stream: &mut TcpStream, opcode: u8, body: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(opcode);
    frame.extend_from_slice(body);
    stream.write_all(&frame)
}
