//! Transfer requests and the wdt:// connection URL.
//!
//! The receiver emits a connection URL on stdout at startup; that string is
//! the sender's sole input for reaching it.

use anyhow::{bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::PathBuf;

use crate::options::{DEFAULT_NUM_PORTS, DEFAULT_START_PORT};
use crate::protocol::PROTOCOL_VERSION;

pub const URL_SCHEME: &str = "wdt://";

/// Everything the engine needs to run one transfer. Built by the front-end,
/// consumed once by Sender or Receiver; `init()` fills in negotiated ports
/// and a generated transfer id, after which it is not mutated.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Peer hostname. Empty means this side is the receiver.
    pub host: String,
    pub start_port: u16,
    pub num_ports: usize,
    /// Concrete ports; filled during init (receiver: bound, sender: parsed).
    pub ports: Vec<u16>,
    /// Directory root to send from / receive into.
    pub directory: PathBuf,
    /// Identifies the transfer across both sides; generated if empty.
    pub transfer_id: String,
    /// Protocol version to propose. When `version_pinned` the sender will
    /// not adopt any counter-offer.
    pub protocol_version: u32,
    pub version_pinned: bool,
    /// Pre-enumerated file list (relative path, optional size) instead of a
    /// directory walk.
    pub file_list: Option<Vec<(String, Option<u64>)>>,
}

impl Default for TransferRequest {
    fn default() -> Self {
        TransferRequest {
            host: String::new(),
            start_port: DEFAULT_START_PORT,
            num_ports: DEFAULT_NUM_PORTS,
            ports: Vec::new(),
            directory: PathBuf::from("."),
            transfer_id: String::new(),
            protocol_version: PROTOCOL_VERSION,
            version_pinned: false,
            file_list: None,
        }
    }
}

impl TransferRequest {
    pub fn is_receiver(&self) -> bool {
        self.host.is_empty()
    }

    /// Ports this request addresses: the explicit list if present, else the
    /// consecutive range.
    pub fn port_list(&self) -> Vec<u16> {
        if !self.ports.is_empty() {
            return self.ports.clone();
        }
        (0..self.num_ports)
            .map(|i| self.start_port.wrapping_add(i as u16))
            .collect()
    }

    /// Serialise into the receiver-emitted connection URL.
    pub fn to_url(&self, host: &str) -> String {
        let ports: Vec<String> = self.port_list().iter().map(|p| p.to_string()).collect();
        format!(
            "{}{}?ports={}&id={}&num_ports={}&protocol_version={}",
            URL_SCHEME,
            host,
            ports.join(","),
            self.transfer_id,
            self.port_list().len(),
            self.protocol_version,
        )
    }

    /// Parse a connection URL back into host, ports, id and version.
    pub fn from_url(url: &str) -> Result<TransferRequest> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .with_context(|| format!("connection url must start with {}", URL_SCHEME))?;
        let (host, query) = rest.split_once('?').unwrap_or((rest, ""));
        if host.is_empty() {
            bail!("connection url has no host");
        }
        let mut req = TransferRequest {
            host: host.to_string(),
            ..Default::default()
        };
        for kv in query.split('&').filter(|s| !s.is_empty()) {
            let (k, v) = kv
                .split_once('=')
                .with_context(|| format!("malformed query fragment {:?}", kv))?;
            match k {
                "ports" => {
                    let mut ports = Vec::new();
                    for p in v.split(',').filter(|s| !s.is_empty()) {
                        ports.push(p.parse::<u16>().context("bad port in url")?);
                    }
                    if ports.is_empty() {
                        bail!("connection url has empty port list");
                    }
                    req.start_port = ports[0];
                    req.ports = ports;
                }
                "id" => req.transfer_id = v.to_string(),
                "num_ports" => req.num_ports = v.parse().context("bad num_ports in url")?,
                "protocol_version" => {
                    req.protocol_version = v.parse().context("bad protocol_version in url")?
                }
                // Unknown keys are ignored so newer receivers stay parsable.
                _ => {}
            }
        }
        if req.ports.is_empty() {
            bail!("connection url missing ports");
        }
        req.num_ports = req.ports.len();
        Ok(req)
    }
}

/// Random id tying the two sides of one transfer together.
pub fn gen_transfer_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let mut req = TransferRequest::default();
        req.transfer_id = "abc123".into();
        req.ports = vec![22356, 22357, 22358];
        let url = req.to_url("box1.example.com");
        let parsed = TransferRequest::from_url(&url).unwrap();
        assert_eq!(parsed.host, "box1.example.com");
        assert_eq!(parsed.ports, vec![22356, 22357, 22358]);
        assert_eq!(parsed.transfer_id, "abc123");
        assert_eq!(parsed.num_ports, 3);
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn url_rejects_garbage() {
        assert!(TransferRequest::from_url("http://x?ports=1").is_err());
        assert!(TransferRequest::from_url("wdt://?ports=1").is_err());
        assert!(TransferRequest::from_url("wdt://h?ports=").is_err());
        assert!(TransferRequest::from_url("wdt://h?ports=notaport").is_err());
        assert!(TransferRequest::from_url("wdt://h").is_err());
    }

    #[test]
    fn unknown_query_keys_ignored() {
        let req =
            TransferRequest::from_url("wdt://h?ports=9000&id=x&future_knob=1").unwrap();
        assert_eq!(req.ports, vec![9000]);
        assert_eq!(req.transfer_id, "x");
    }

    #[test]
    fn transfer_ids_are_distinct() {
        let a = gen_transfer_id();
        let b = gen_transfer_id();
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }
}
