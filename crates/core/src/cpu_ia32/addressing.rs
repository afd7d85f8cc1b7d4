//! ModR/M and SIB decoding

use super::{CpuIa32, MemoryIa32, REG_EBP, REG_EBX, REG_EDI, REG_ESI, REG_ESP};
use crate::cpu_ia32_protected::Seg;
use crate::fault::Result;
use crate::flags::Operand;

/// Where a ModR/M operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveAddress {
    /// Register number; its width comes from the instruction.
    Register(u8),
    Memory { seg: Seg, offset: u32 },
}

impl EffectiveAddress {
    pub fn is_memory(&self) -> bool {
        matches!(self, EffectiveAddress::Memory { .. })
    }
}

/// Split a ModR/M byte into (mod, reg, rm).
#[inline]
pub(crate) fn split_modrm(modrm: u8) -> (u8, u8, u8) {
    let modbits = (modrm >> 6) & 0x03; // Bits 7-6
    let reg = (modrm >> 3) & 0x07; // Bits 5-3
    let rm = modrm & 0x07; // Bits 2-0
    (modbits, reg, rm)
}

impl<M: MemoryIa32> CpuIa32<M> {
    /// Resolve a ModR/M byte, consuming any SIB byte and displacement.
    pub(crate) fn decode_modrm(&mut self, modrm: u8) -> Result<EffectiveAddress> {
        let (modbits, _, rm) = split_modrm(modrm);
        if modbits == 0b11 {
            return Ok(EffectiveAddress::Register(rm));
        }
        let (default_seg, offset) = if self.address32() {
            self.ea32(modbits, rm)?
        } else {
            self.ea16(modbits, rm)?
        };
        Ok(EffectiveAddress::Memory {
            seg: self.data_seg(default_seg),
            offset,
        })
    }

    fn ea16(&mut self, modbits: u8, rm: u8) -> Result<(Seg, u32)> {
        let disp: u16 = match modbits {
            0b00 if rm == 0b110 => {
                // Direct address
                return Ok((Seg::DS, self.fetch_u16()? as u32));
            }
            0b00 => 0,
            0b01 => self.fetch_u8()? as i8 as i16 as u16,
            _ => self.fetch_u16()?,
        };
        let bx = self.reg16(REG_EBX);
        let bp = self.reg16(REG_EBP);
        let si = self.reg16(REG_ESI);
        let di = self.reg16(REG_EDI);
        let (seg, base) = match rm {
            0b000 => (Seg::DS, bx.wrapping_add(si)), // [BX+SI]
            0b001 => (Seg::DS, bx.wrapping_add(di)), // [BX+DI]
            0b010 => (Seg::SS, bp.wrapping_add(si)), // [BP+SI]
            0b011 => (Seg::SS, bp.wrapping_add(di)), // [BP+DI]
            0b100 => (Seg::DS, si),                  // [SI]
            0b101 => (Seg::DS, di),                  // [DI]
            0b110 => (Seg::SS, bp),                  // [BP]
            _ => (Seg::DS, bx),                      // [BX]
        };
        Ok((seg, base.wrapping_add(disp) as u32))
    }

    fn ea32(&mut self, modbits: u8, rm: u8) -> Result<(Seg, u32)> {
        let (seg, base) = if rm == 0b100 {
            self.sib(modbits)?
        } else if rm == 0b101 && modbits == 0b00 {
            return Ok((Seg::DS, self.fetch_u32()?));
        } else {
            let seg = if rm == REG_EBP { Seg::SS } else { Seg::DS };
            (seg, self.reg32(rm))
        };
        let disp = match modbits {
            0b01 => self.fetch_u8()? as i8 as i32 as u32,
            0b10 => self.fetch_u32()?,
            _ => 0,
        };
        Ok((seg, base.wrapping_add(disp)))
    }

    /// Base + scaled index from a SIB byte.
    fn sib(&mut self, modbits: u8) -> Result<(Seg, u32)> {
        let sib = self.fetch_u8()?;
        let scale = sib >> 6;
        let index = (sib >> 3) & 7;
        let base = sib & 7;
        let (seg, base_val) = match base {
            // disp32, no base
            5 if modbits == 0b00 => (Seg::DS, self.fetch_u32()?),
            REG_ESP | REG_EBP => (Seg::SS, self.reg32(base)),
            _ => (Seg::DS, self.reg32(base)),
        };
        let index_val = if index == REG_ESP {
            0
        } else {
            self.reg32(index) << scale
        };
        Ok((seg, base_val.wrapping_add(index_val)))
    }

    pub(crate) fn read_ea<W: Operand>(&self, ea: EffectiveAddress) -> Result<u32> {
        match ea {
            EffectiveAddress::Register(r) => Ok(self.reg::<W>(r)),
            EffectiveAddress::Memory { seg, offset } => self.read_mem::<W>(seg, offset),
        }
    }

    pub(crate) fn write_ea<W: Operand>(&mut self, ea: EffectiveAddress, val: u32) -> Result<()> {
        match ea {
            EffectiveAddress::Register(r) => {
                self.set_reg::<W>(r, val);
                Ok(())
            }
            EffectiveAddress::Memory { seg, offset } => self.write_mem::<W>(seg, offset, val),
        }
    }

    /// Memory operand of an instruction that has no register form.
    pub(crate) fn memory_operand(&self, ea: EffectiveAddress) -> Result<(Seg, u32)> {
        match ea {
            EffectiveAddress::Memory { seg, offset } => Ok((seg, offset)),
            EffectiveAddress::Register(_) => Err(crate::fault::Fault::InvalidOpcode),
        }
    }
}
