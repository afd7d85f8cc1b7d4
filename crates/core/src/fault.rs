//! Faults raised by instruction handlers.
//!
//! A handler that hits a fault returns `Err` immediately. State committed
//! before the failing step (flags, index registers, sticky x87 bits) stays
//! committed; nothing is rolled back.

use thiserror::Error;

/// Result type returned by every handler and memory helper.
pub type Result<T> = std::result::Result<T, Fault>;

pub const VECTOR_DE: u8 = 0;
pub const VECTOR_DB: u8 = 1;
pub const VECTOR_BP: u8 = 3;
pub const VECTOR_OF: u8 = 4;
pub const VECTOR_BR: u8 = 5;
pub const VECTOR_UD: u8 = 6;
pub const VECTOR_NM: u8 = 7;
pub const VECTOR_DF: u8 = 8;
pub const VECTOR_TS: u8 = 10;
pub const VECTOR_NP: u8 = 11;
pub const VECTOR_SS: u8 = 12;
pub const VECTOR_GP: u8 = 13;
pub const VECTOR_PF: u8 = 14;
pub const VECTOR_MF: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("#DE divide error")]
    DivideError,

    #[error("#UD invalid opcode")]
    InvalidOpcode,

    #[error("#NM device not available")]
    DeviceNotAvailable,

    #[error("#TS invalid TSS (error code {0:#06X})")]
    InvalidTss(u16),

    #[error("#NP segment not present (error code {0:#06X})")]
    SegmentNotPresent(u16),

    #[error("#SS stack fault (error code {0:#06X})")]
    StackFault(u16),

    #[error("#GP general protection (error code {0:#06X})")]
    GeneralProtection(u16),

    #[error("#PF page fault at {linear:#010X} (error code {code:#X})")]
    PageFault { linear: u32, code: u32 },

    /// A path the interpreter does not implement. Not an architectural
    /// fault: the embedding loop must stop instead of delivering it.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

impl Fault {
    /// #GP with the selector's index/TI bits as the error code.
    pub fn gp_sel(selector: u16) -> Self {
        Fault::GeneralProtection(selector & 0xFFFC)
    }

    pub fn np_sel(selector: u16) -> Self {
        Fault::SegmentNotPresent(selector & 0xFFFC)
    }

    pub fn ss_sel(selector: u16) -> Self {
        Fault::StackFault(selector & 0xFFFC)
    }

    pub fn ts_sel(selector: u16) -> Self {
        Fault::InvalidTss(selector & 0xFFFC)
    }

    pub fn vector(&self) -> Option<u8> {
        match self {
            Fault::DivideError => Some(VECTOR_DE),
            Fault::InvalidOpcode => Some(VECTOR_UD),
            Fault::DeviceNotAvailable => Some(VECTOR_NM),
            Fault::InvalidTss(_) => Some(VECTOR_TS),
            Fault::SegmentNotPresent(_) => Some(VECTOR_NP),
            Fault::StackFault(_) => Some(VECTOR_SS),
            Fault::GeneralProtection(_) => Some(VECTOR_GP),
            Fault::PageFault { .. } => Some(VECTOR_PF),
            Fault::Unimplemented(_) => None,
        }
    }

    /// Error code pushed on delivery, for the vectors that carry one.
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Fault::InvalidTss(code)
            | Fault::SegmentNotPresent(code)
            | Fault::StackFault(code)
            | Fault::GeneralProtection(code) => Some(code as u32),
            Fault::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_architectural(&self) -> bool {
        !matches!(self, Fault::Unimplemented(_))
    }
}
