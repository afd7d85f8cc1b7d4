//! IA-32 protected-mode structures
//!
//! Descriptors as they sit in the GDT/LDT, the cached segment registers the
//! interpreter works with, and the task-register services the core needs:
//!
//! - Descriptor decoding (segments, call gates, task gates, TSS)
//! - Segment-register caches (base, byte bounds, access rights, privilege)
//! - GDT/LDT lookup with limit checking and the accessed bit
//! - Privilege-level stack lookup in a 32-bit TSS
//! - The I/O permission bitmap

use serde::{Deserialize, Serialize};

use crate::cpu_ia32::{CpuIa32, MemoryIa32};
use crate::fault::{Fault, Result};

pub const CR0_PE: u32 = 0x0000_0001; // Protection enable
pub const CR0_MP: u32 = 0x0000_0002; // Monitor coprocessor
pub const CR0_EM: u32 = 0x0000_0004; // Emulate coprocessor
pub const CR0_TS: u32 = 0x0000_0008; // Task switched
pub const CR0_ET: u32 = 0x0000_0010; // Extension type
pub const CR0_NE: u32 = 0x0000_0020; // Numeric error
pub const CR0_PG: u32 = 0x8000_0000; // Paging

/// Segment register slots, in ModRM/prefix encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl Seg {
    pub const ALL: [Seg; 6] = [Seg::ES, Seg::CS, Seg::SS, Seg::DS, Seg::FS, Seg::GS];

    pub fn name(self) -> &'static str {
        match self {
            Seg::ES => "ES",
            Seg::CS => "CS",
            Seg::SS => "SS",
            Seg::DS => "DS",
            Seg::FS => "FS",
            Seg::GS => "GS",
        }
    }
}

/// GDTR/IDTR contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u16,
}

/// An 8-byte descriptor, kept as the two little-endian dwords it was read as.
///
/// `low` holds limit 0..15 and base 0..15; `high` holds base 16..31, the
/// type/DPL/present byte, limit 16..19 and the AVL/B/G flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub low: u32,
    pub high: u32,
}

impl SegmentDescriptor {
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            low: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            high: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn base(&self) -> u32 {
        (self.low >> 16) | ((self.high << 16) & 0x00FF_0000) | (self.high & 0xFF00_0000)
    }

    /// Limit in bytes, with 4 KiB granularity applied.
    pub fn limit(&self) -> u32 {
        let raw = (self.high & 0x000F_0000) | (self.low & 0xFFFF);
        if self.is_granular() {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }

    /// S bit plus the 4-bit type.
    #[inline]
    pub fn stype(&self) -> u8 {
        ((self.high >> 8) & 0x1F) as u8
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.high & 0x8000 != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        ((self.high >> 13) & 0x3) as u8
    }

    #[inline]
    pub fn is_default_32(&self) -> bool {
        self.high & 0x0040_0000 != 0
    }

    #[inline]
    pub fn is_granular(&self) -> bool {
        self.high & 0x0080_0000 != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.stype() & 0x18 == 0x18
    }

    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.stype() & 0x04 != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        let t = self.stype();
        t & 0x18 == 0x10 || t & 0x1A == 0x1A
    }

    #[inline]
    pub fn is_writable_data(&self) -> bool {
        self.stype() & 0x1A == 0x12
    }

    #[inline]
    pub fn is_expand_down(&self) -> bool {
        self.stype() & 0x1C == 0x14
    }

    /// Data segment, or code segment that is not conforming.
    #[inline]
    pub fn is_data_or_nonconforming(&self) -> bool {
        let t = self.stype();
        t & 0x18 == 0x10 || t & 0x1C == 0x18
    }

    /// 16 or 32-bit call gate.
    #[inline]
    pub fn is_call_gate(&self) -> bool {
        self.stype() & 0x17 == 0x04
    }

    #[inline]
    pub fn is_call_gate_32(&self) -> bool {
        self.stype() == 0x0C
    }

    #[inline]
    pub fn is_task_gate(&self) -> bool {
        self.stype() & 0x1F == 0x05
    }

    /// Available or busy TSS, 16 or 32-bit.
    #[inline]
    pub fn is_tss(&self) -> bool {
        self.stype() & 0x15 == 0x01
    }

    #[inline]
    pub fn is_tss_32(&self) -> bool {
        self.stype() & 0x1D == 0x09
    }

    pub fn gate_selector(&self) -> u16 {
        (self.low >> 16) as u16
    }

    pub fn gate_offset(&self) -> u32 {
        (self.high & 0xFFFF_0000) | (self.low & 0xFFFF)
    }

    pub fn gate_param_count(&self) -> u8 {
        (self.high & 0x1F) as u8
    }
}

/// Cached state of one segment register.
///
/// `first_byte..=last_byte` is the valid offset range, which covers
/// expand-down segments as well as ordinary ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u32,
    pub first_byte: u32,
    pub last_byte: u32,
    pub is32: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub data_or_nonconforming: bool,
    pub is_null: bool,
    pub dpl: u8,
    /// RPL of the selector; for CS this is the CPL.
    pub pl: u8,
    pub tss_is32: bool,
}

impl SegmentRegister {
    /// A segment loaded in real or virtual-8086 mode.
    pub fn real_mode(selector: u16, vm86: bool) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            first_byte: 0,
            last_byte: 0xFFFF,
            is32: false,
            readable: true,
            writable: true,
            executable: true,
            data_or_nonconforming: false,
            is_null: false,
            dpl: if vm86 { 3 } else { 0 },
            pl: if vm86 { 3 } else { 0 },
            tss_is32: false,
        }
    }

    /// The cache produced by loading `selector` with descriptor `desc`.
    pub fn from_descriptor(selector: u16, desc: &SegmentDescriptor) -> Self {
        let limit = desc.limit();
        let (first_byte, last_byte) = if desc.is_expand_down() {
            let top = if desc.is_default_32() { 0xFFFF_FFFF } else { 0xFFFF };
            (limit.wrapping_add(1), top)
        } else {
            (0, limit)
        };
        Self {
            selector,
            base: desc.base(),
            first_byte,
            last_byte,
            is32: desc.is_default_32(),
            readable: desc.is_readable(),
            writable: desc.is_writable_data(),
            executable: desc.is_code(),
            data_or_nonconforming: desc.is_data_or_nonconforming(),
            is_null: false,
            dpl: desc.dpl(),
            pl: (selector & 3) as u8,
            tss_is32: desc.is_tss_32(),
        }
    }

    /// A data segment register loaded with a null selector.
    pub fn null(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            first_byte: 1,
            last_byte: 0,
            is32: false,
            readable: false,
            writable: false,
            executable: false,
            data_or_nonconforming: true,
            is_null: true,
            dpl: 0,
            pl: (selector & 3) as u8,
            tss_is32: false,
        }
    }

    /// Whether `len` bytes starting at `offset` lie inside the segment bounds.
    #[inline]
    pub fn contains(&self, offset: u32, len: u32) -> bool {
        let end = offset as u64 + len as u64 - 1;
        offset >= self.first_byte && end <= self.last_byte as u64
    }
}

impl Default for SegmentRegister {
    fn default() -> Self {
        Self::real_mode(0, false)
    }
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// Fetch the descriptor `selector` names from the GDT or LDT.
    ///
    /// The whole 8-byte entry must lie inside the table, otherwise #GP(selector).
    pub fn read_descriptor(&self, selector: u16) -> Result<SegmentDescriptor> {
        let offset = (selector & 0xFFF8) as u32;
        let (base, last) = if selector & 0x4 != 0 {
            if self.ldtr.is_null {
                return Err(Fault::gp_sel(selector));
            }
            (self.ldtr.base, self.ldtr.last_byte)
        } else {
            (self.gdtr.base, self.gdtr.limit as u32)
        };
        if offset + 7 > last {
            return Err(Fault::gp_sel(selector));
        }
        let addr = base.wrapping_add(offset);
        Ok(SegmentDescriptor {
            low: self.read_linear_u32(addr)?,
            high: self.read_linear_u32(addr.wrapping_add(4))?,
        })
    }

    /// Mark the descriptor of `selector` as accessed in its table.
    pub fn set_descriptor_accessed(&mut self, selector: u16) -> Result<()> {
        let mut desc = self.read_descriptor(selector)?;
        if desc.high & 0x100 == 0 {
            desc.high |= 0x100;
            let table_base = if selector & 0x4 != 0 {
                self.ldtr.base
            } else {
                self.gdtr.base
            };
            let addr = table_base.wrapping_add((selector & 0xFFF8) as u32 + 4);
            self.write_linear_u32(addr, desc.high)?;
        }
        Ok(())
    }

    /// SS:ESP for privilege level `dpl` from the current TSS.
    pub fn tss_stack_for_level(&self, dpl: u8) -> Result<(u16, u32)> {
        if !self.tr.tss_is32 {
            return Err(Fault::Unimplemented("stack switch through a 16-bit TSS"));
        }
        let offset = ((dpl as u32) << 3) + 4;
        if offset + 5 > self.tr.last_byte {
            return Err(Fault::ts_sel(self.tr.selector));
        }
        let esp = self.read_linear_u32(self.tr.base.wrapping_add(offset))?;
        let ss = self.read_linear_u16(self.tr.base.wrapping_add(offset + 4))?;
        Ok((ss, esp))
    }

    /// Whether the TSS I/O permission bitmap allows `nbytes` ports from `port`.
    ///
    /// A 16-bit TSS, a TSS too short to hold the map base, or a bit past the
    /// TSS limit all deny access.
    pub fn io_permitted(&self, port: u16, nbytes: u32) -> Result<bool> {
        if !self.tr.tss_is32 || self.tr.last_byte < 103 {
            return Ok(false);
        }
        let map_base = self.read_linear_u16(self.tr.base.wrapping_add(102))? as u32;
        for i in 0..nbytes {
            let bit = port as u32 + i;
            let offset = map_base + (bit >> 3);
            if offset > self.tr.last_byte {
                return Ok(false);
            }
            let byte = self.read_linear_u8(self.tr.base.wrapping_add(offset))?;
            if byte & (1 << (bit & 7)) != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
