//! Closed error code enumeration shared by both sides of a transfer.
//!
//! Every fallible operation in the engine resolves to one of these codes;
//! reports fold per-thread codes into a single summary using a fixed
//! severity order, and the process exit status is the summary code.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Error,
    Abort,
    ConnError,
    SocketReadError,
    SocketWriteError,
    FileReadError,
    FileWriteError,
    ProtocolError,
    VersionMismatch,
    FewerPorts,
    ChecksumMismatch,
    AbortedByApplication,
}

impl Default for ErrorCode {
    fn default() -> Self {
        ErrorCode::Ok
    }
}

impl ErrorCode {
    /// Small positive integer used as the process exit status.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Error => 1,
            ErrorCode::Abort => 2,
            ErrorCode::ConnError => 3,
            ErrorCode::SocketReadError => 4,
            ErrorCode::SocketWriteError => 5,
            ErrorCode::FileReadError => 6,
            ErrorCode::FileWriteError => 7,
            ErrorCode::ProtocolError => 8,
            ErrorCode::VersionMismatch => 9,
            ErrorCode::FewerPorts => 10,
            ErrorCode::ChecksumMismatch => 11,
            ErrorCode::AbortedByApplication => 12,
        }
    }

    /// Wire representation, one byte.
    pub fn to_wire(self) -> u8 {
        self.exit_code() as u8
    }

    pub fn from_wire(b: u8) -> ErrorCode {
        match b {
            0 => ErrorCode::Ok,
            2 => ErrorCode::Abort,
            3 => ErrorCode::ConnError,
            4 => ErrorCode::SocketReadError,
            5 => ErrorCode::SocketWriteError,
            6 => ErrorCode::FileReadError,
            7 => ErrorCode::FileWriteError,
            8 => ErrorCode::ProtocolError,
            9 => ErrorCode::VersionMismatch,
            10 => ErrorCode::FewerPorts,
            11 => ErrorCode::ChecksumMismatch,
            12 => ErrorCode::AbortedByApplication,
            _ => ErrorCode::Error,
        }
    }

    /// Position in the severity order. fatal > per-file > transient > ok.
    fn severity(self) -> u8 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::FewerPorts => 1,
            ErrorCode::SocketReadError => 2,
            ErrorCode::SocketWriteError => 3,
            ErrorCode::ConnError => 4,
            ErrorCode::FileReadError => 5,
            ErrorCode::FileWriteError => 6,
            ErrorCode::ChecksumMismatch => 7,
            ErrorCode::ProtocolError => 8,
            ErrorCode::VersionMismatch => 9,
            ErrorCode::Error => 10,
            ErrorCode::Abort => 11,
            ErrorCode::AbortedByApplication => 12,
        }
    }

    /// Combine two codes, keeping the more severe one.
    pub fn worst(self, other: ErrorCode) -> ErrorCode {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

/// An error that carries its exit code, so `main` can report the right
/// status without string matching.
#[derive(Debug)]
pub struct CodedError {
    pub code: ErrorCode,
    pub msg: String,
}

impl fmt::Display for CodedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.msg)
    }
}

impl std::error::Error for CodedError {}

pub fn coded(code: ErrorCode, msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(CodedError {
        code,
        msg: msg.into(),
    })
}

/// Exit code to use for an error bubbled all the way up.
pub fn code_of(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<CodedError>()
        .map(|e| e.code)
        .unwrap_or(ErrorCode::Error)
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Error => "ERROR",
            ErrorCode::Abort => "ABORT",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::SocketReadError => "SOCKET_READ_ERROR",
            ErrorCode::SocketWriteError => "SOCKET_WRITE_ERROR",
            ErrorCode::FileReadError => "FILE_READ_ERROR",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
            ErrorCode::FewerPorts => "FEWER_PORTS",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::AbortedByApplication => "ABORTED_BY_APPLICATION",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_prefers_more_severe() {
        assert_eq!(
            ErrorCode::Ok.worst(ErrorCode::SocketReadError),
            ErrorCode::SocketReadError
        );
        assert_eq!(
            ErrorCode::VersionMismatch.worst(ErrorCode::ConnError),
            ErrorCode::VersionMismatch
        );
        assert_eq!(
            ErrorCode::AbortedByApplication.worst(ErrorCode::Error),
            ErrorCode::AbortedByApplication
        );
        assert_eq!(ErrorCode::Ok.worst(ErrorCode::Ok), ErrorCode::Ok);
    }

    #[test]
    fn coded_errors_survive_anyhow() {
        let err = coded(ErrorCode::FewerPorts, "bound 5 of 8 ports");
        assert_eq!(code_of(&err), ErrorCode::FewerPorts);
        let plain = anyhow::anyhow!("something else");
        assert_eq!(code_of(&plain), ErrorCode::Error);
    }

    #[test]
    fn wire_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::Abort,
            ErrorCode::ConnError,
            ErrorCode::ChecksumMismatch,
            ErrorCode::VersionMismatch,
            ErrorCode::AbortedByApplication,
        ] {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), code);
        }
    }
}
