use std::{io, time::Duration};

use thiserror::Error;

use crate::result::ErrorCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dispatch has no target nodes")]
    EmptyDispatch,
    #[error("fan-out width must be at least 1")]
    InvalidFanout,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("node {0} is addressed more than once in one dispatch")]
    DuplicateNode(String),
    #[error("could not allocate forward state for {0} nodes")]
    ResourceExhausted(usize),
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{addr} accepted the request but sent no reply: {source}")]
    NoReply {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the configured limit")]
    FrameTooLarge(usize),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("could not encode {0}")]
    Encode(String),
    #[error("could not decode {0}")]
    Decode(&'static str),
    #[error("subtree descriptor does not describe a valid tree")]
    MalformedDescriptor,
}

impl Error {
    /// The per-node code recorded for every node a failed branch was
    /// responsible for.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Connect { .. } | Error::Io(_) | Error::ResourceExhausted(_) => {
                ErrorCode::ConnectFailure
            }
            Error::NoReply { .. }
            | Error::FrameTooLarge(_)
            | Error::UnsupportedVersion(_)
            | Error::UnknownFrameType(_)
            | Error::Encode(_)
            | Error::Decode(_)
            | Error::MalformedDescriptor
            | Error::EmptyDispatch
            | Error::InvalidFanout
            | Error::InvalidConfig(_)
            | Error::DuplicateNode(_) => ErrorCode::ProtocolError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
