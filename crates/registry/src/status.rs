//! RPC status as reported by the registry. Numbering follows gRPC, which is
//! what the SPIRE server speaks.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

const ALL: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    pub fn from_i32(n: i32) -> Code {
        usize::try_from(n).ok().and_then(|i| ALL.get(i).copied()).unwrap_or(Code::Unknown)
    }

    /// Parse the name printed by gRPC status strings (`code = NotFound`).
    pub fn from_name(name: &str) -> Option<Code> {
        ALL.into_iter().find(|c| format!("{:?}", c) == name)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// A failed RPC as returned by a transport, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: Code,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self { Self { code, message: message.into() } }
    pub fn not_found(message: impl Into<String>) -> Self { Self::new(Code::NotFound, message) }
    pub fn unavailable(message: impl Into<String>) -> Self { Self::new(Code::Unavailable, message) }

    /// Pull `code = X desc = ...` out of a gRPC error line, as printed by
    /// the SPIRE CLI on stderr.
    pub fn parse_grpc_error(text: &str) -> Option<RpcStatus> {
        let (_, after) = text.split_once("code = ")?;
        let name: String = after.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
        let code = Code::from_name(&name)?;
        let message = after
            .split_once("desc = ")
            .map(|(_, d)| d.lines().next().unwrap_or("").trim().to_string())
            .unwrap_or_else(|| text.trim().to_string());
        Some(RpcStatus { code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_grpc() {
        assert_eq!(Code::from_i32(0), Code::Ok);
        assert_eq!(Code::from_i32(5), Code::NotFound);
        assert_eq!(Code::from_i32(6), Code::AlreadyExists);
        assert_eq!(Code::from_i32(9), Code::FailedPrecondition);
        assert_eq!(Code::from_i32(14), Code::Unavailable);
        assert_eq!(Code::from_i32(99), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn parses_cli_error_lines() {
        let s = RpcStatus::parse_grpc_error(
            "Error: rpc error: code = NotFound desc = entry not found\nmore noise",
        )
        .unwrap();
        assert_eq!(s.code, Code::NotFound);
        assert_eq!(s.message, "entry not found");
        assert!(RpcStatus::parse_grpc_error("Error: connection refused").is_none());
        assert!(RpcStatus::parse_grpc_error("code = Bogus desc = x").is_none());
    }
}
