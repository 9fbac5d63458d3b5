use std::{error, fmt};

use crate::bytes;

/// Parse and decode errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A read ran past the end of the input buffer.
    OutOfRange,
    /// The version field of the file is not one this crate handles.
    UnsupportedVersion(u32),
    /// Section lengths are inconsistent or the file was not fully consumed.
    Parsing(String),
    /// An operation that requires a parsed file was called too early.
    NotParsed,
    /// A code in the stream maps to no opcode and is not the end sentinel.
    UnknownOpcode { ip: usize, code: u32 },
    /// An operand stack was empty where a value was required.
    StackUnderflow { ip: usize, stack: &'static str },
    /// An operand had the wrong shape for the opcode consuming it.
    TypeMismatch { ip: usize, expected: &'static str },
    /// The backward edge of a loop disagrees with the forward condition.
    LoopConditionMismatch { ip: usize },
    /// A construct the decoder refuses to guess at.
    NotImplemented(&'static str),
    /// A string-table offset with no string at or around it.
    BadStringOffset(u32),
    /// A float-table offset past the end of the table.
    BadFloatOffset(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => write!(f, "read past end of input"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported DSO version `{version}`")
            }
            Self::Parsing(msg) => write!(f, "parsing error: {msg}"),
            Self::NotParsed => write!(f, "file must be parsed first"),
            Self::UnknownOpcode { ip, code } => {
                write!(f, "unknown opcode `{code}` at byte {ip}")
            }
            Self::StackUnderflow { ip, stack } => {
                write!(f, "{stack} stack underflow at byte {ip}")
            }
            Self::TypeMismatch { ip, expected } => {
                write!(f, "expected {expected} at byte {ip}")
            }
            Self::LoopConditionMismatch { ip } => {
                write!(f, "loop condition mismatch at byte {ip}")
            }
            Self::NotImplemented(what) => write!(f, "not implemented: {what}"),
            Self::BadStringOffset(offset) => {
                write!(f, "no string at table offset {offset}")
            }
            Self::BadFloatOffset(offset) => {
                write!(f, "no float at table offset {offset}")
            }
        }
    }
}

impl error::Error for Error {}

impl From<bytes::Error> for Error {
    fn from(err: bytes::Error) -> Self {
        match err {
            bytes::Error::OutOfRange => Self::OutOfRange,
        }
    }
}
