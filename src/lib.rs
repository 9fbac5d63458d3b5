//! Torque Game Engine DSO (compiled TorqueScript) decompiler

/// Statement and expression trees
pub mod ast;
mod bytes;
/// Packed code stream
pub mod code;
/// Stack-machine decoder
pub mod decode;
/// DSO container parsing
pub mod dso;
mod error;
/// Source rendering
pub mod fmt;
/// Opcode tables
pub mod ops;
/// String, float and ident tables
pub mod tables;

pub use self::ast::{Expr, OpKind, Stmt, Tree};
pub use self::bytes::Cursor;
pub use self::code::ByteCode;
pub use self::decode::{DecodeFailure, Decoder, decompile};
pub use self::dso::{Dso, Format};
pub use self::error::Error;
pub use self::ops::{CallType, Opcode};
