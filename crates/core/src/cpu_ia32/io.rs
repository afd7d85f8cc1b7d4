//! IN/OUT and INS/OUTS.

use super::{CpuIa32, MemoryIa32, REG_EAX, REG_EDI, REG_EDX, REG_ESI};
use crate::cpu_ia32_protected::Seg;
use crate::fault::{Fault, Result};
use crate::flags::Operand;
use crate::logging::{log, LogCategory, LogLevel};

impl<M: MemoryIa32> CpuIa32<M> {
    /// #GP(0) unless the current privilege may touch `nbytes` ports at
    /// `port`. Above IOPL, or in virtual-8086 mode, the TSS bitmap decides.
    pub(crate) fn check_io(&self, port: u16, nbytes: u32) -> Result<()> {
        if self.protected_mode() && (self.cpl() > self.iopl() || self.vm86()) && !self.io_permitted(port, nbytes)? {
            log(LogCategory::Io, LogLevel::Debug, || {
                format!("port {:04X} denied at CPL {} IOPL {}", port, self.cpl(), self.iopl())
            });
            return Err(Fault::GeneralProtection(0));
        }
        Ok(())
    }

    fn port_read<W: Operand>(&mut self, port: u16) -> u32 {
        let val = match W::BITS {
            8 => self.memory.io_read_u8(port) as u32,
            16 => self.memory.io_read_u16(port) as u32,
            _ => self.memory.io_read_u32(port),
        };
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("IN  {:04X} -> {:0width$X}", port, val, width = W::BYTES as usize * 2)
        });
        val
    }

    fn port_write<W: Operand>(&mut self, port: u16, val: u32) {
        log(LogCategory::Io, LogLevel::Trace, || {
            format!("OUT {:04X} <- {:0width$X}", port, val, width = W::BYTES as usize * 2)
        });
        match W::BITS {
            8 => self.memory.io_write_u8(port, val as u8),
            16 => self.memory.io_write_u16(port, val as u16),
            _ => self.memory.io_write_u32(port, val),
        }
    }

    /// IN acc, imm8 (E4, E5)
    pub(crate) fn in_imm<W: Operand>(&mut self) -> Result<()> {
        let port = self.fetch_u8()? as u16;
        self.check_lock()?;
        self.check_io(port, W::BYTES)?;
        let val = self.port_read::<W>(port);
        self.set_reg::<W>(REG_EAX, val);
        Ok(())
    }

    /// IN acc, DX (EC, ED)
    pub(crate) fn in_dx<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let port = self.reg16(REG_EDX);
        self.check_io(port, W::BYTES)?;
        let val = self.port_read::<W>(port);
        self.set_reg::<W>(REG_EAX, val);
        Ok(())
    }

    /// OUT imm8, acc (E6, E7)
    pub(crate) fn out_imm<W: Operand>(&mut self) -> Result<()> {
        let port = self.fetch_u8()? as u16;
        self.check_lock()?;
        self.check_io(port, W::BYTES)?;
        let val = self.reg::<W>(REG_EAX);
        self.port_write::<W>(port, val);
        Ok(())
    }

    /// OUT DX, acc (EE, EF)
    pub(crate) fn out_dx<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let port = self.reg16(REG_EDX);
        self.check_io(port, W::BYTES)?;
        let val = self.reg::<W>(REG_EAX);
        self.port_write::<W>(port, val);
        Ok(())
    }

    /// INS (6C, 6D): port DX to ES:[E]DI.
    pub(crate) fn ins<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let port = self.reg16(REG_EDX);
        self.check_io(port, W::BYTES)?;
        if self.prefixes.rep.is_some() && self.counter() == 0 {
            return Ok(());
        }
        let di = self.index_reg(REG_EDI);
        self.check_access(self.seg(Seg::ES), false, di, W::BYTES, true)?;
        let val = self.port_read::<W>(port);
        self.write_mem::<W>(Seg::ES, di, val)?;
        self.advance_index(REG_EDI, W::BYTES);
        self.repeat();
        Ok(())
    }

    /// OUTS (6E, 6F): DS:[E]SI to port DX.
    pub(crate) fn outs<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        let port = self.reg16(REG_EDX);
        self.check_io(port, W::BYTES)?;
        if self.prefixes.rep.is_some() && self.counter() == 0 {
            return Ok(());
        }
        let seg = self.data_seg(Seg::DS);
        let val = self.read_mem::<W>(seg, self.index_reg(REG_ESI))?;
        self.port_write::<W>(port, val);
        self.advance_index(REG_ESI, W::BYTES);
        self.repeat();
        Ok(())
    }
}
