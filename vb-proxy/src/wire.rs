//! Wire schema for the five-message proxy protocol (spec.md §4.3/§6).
//!
//! Every multi-byte field is little-endian and every header is a plain-old
//! `bytemuck::Pod` struct with explicit wrapper integers, the same idiom
//! `exp/nbd/orbblk/src/endian.rs` uses for its (big-endian) NBD header
//! fields. No struct is ever overlaid on a raw byte buffer without a length
//! check first (spec.md §9 "untyped wire buffers").

use bytemuck::{Pod, Zeroable};

pub const MSG_INFO: u64 = 1;
pub const MSG_READ: u64 = 2;
pub const MSG_WRITE: u64 = 3;
pub const MSG_CONNECT: u64 = 4;
pub const MSG_CLOSE: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct LeU64(u64);

impl LeU64 {
    pub fn new(value: u64) -> Self {
        Self(value.to_le())
    }

    pub fn get(self) -> u64 {
        u64::from_le(self.0)
    }
}

impl From<u64> for LeU64 {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<LeU64> for u64 {
    fn from(value: LeU64) -> Self {
        value.get()
    }
}

/// Every request starts with this 8-byte opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct MessageHeader {
    pub code: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct InfoResponse {
    pub file_size: LeU64,
    pub req_alignment: LeU64,
    pub flags: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReadRequestTail {
    pub offset: LeU64,
    pub length: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReadResponseHeader {
    pub errno: LeU64,
    pub length: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct WriteRequestTail {
    pub offset: LeU64,
    pub length: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct WriteResponseHeader {
    pub errno: LeU64,
    pub length: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ConnectRequestTail {
    pub flags: LeU64,
    pub length: LeU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ConnectResponseHeader {
    pub error_code: LeU64,
    pub object_ptr: LeU64,
}

/// Maximum alignment the client will accept from an `INFO` response
/// (spec.md §4.3 "Bounds & alignment": `req_alignment - 1` must be <= 511).
pub const MAX_ALIGNMENT_MASK: u64 = 511;
