//! Far CALL/JMP/RET in real, virtual-8086 and protected mode.
//!
//! Every path validates the target, the stack and any gate first and only
//! then commits CS, EIP, SS and ESP. A fault leaves all four untouched.

use super::{CpuIa32, MemoryIa32, REG_ESP};
use crate::cpu_ia32_protected::{Seg, SegmentDescriptor, SegmentRegister};
use crate::fault::{Fault, Result};
use crate::flags::Operand;
use crate::logging::{log, LogCategory, LogLevel};

/// Largest parameter count a call gate can hold.
const MAX_GATE_PARAMS: usize = 31;

impl<M: MemoryIa32> CpuIa32<M> {
    /// CALL ptr16:16/32 (9A)
    pub(crate) fn call_far_imm<W: Operand>(&mut self) -> Result<()> {
        let offset = self.fetch_imm::<W>()?;
        let selector = self.fetch_u16()?;
        self.check_lock()?;
        self.call_far(selector, offset)
    }

    /// JMP ptr16:16/32 (EA)
    pub(crate) fn jmp_far_imm<W: Operand>(&mut self) -> Result<()> {
        let offset = self.fetch_imm::<W>()?;
        let selector = self.fetch_u16()?;
        self.check_lock()?;
        self.jmp_far(selector, offset)
    }

    pub(crate) fn call_far(&mut self, selector: u16, offset: u32) -> Result<()> {
        if self.protected_not_vm() {
            self.far_protected(selector, offset, true)
        } else {
            self.call_far_real(selector, offset)
        }
    }

    pub(crate) fn jmp_far(&mut self, selector: u16, offset: u32) -> Result<()> {
        if self.protected_not_vm() {
            self.far_protected(selector, offset, false)
        } else {
            if self.operand32() && offset > 0xFFFF {
                return Err(Fault::GeneralProtection(0));
            }
            self.load_segment_real(Seg::CS, selector);
            self.eip = offset;
            Ok(())
        }
    }

    /// RETF (CB)
    pub(crate) fn ret_far(&mut self) -> Result<()> {
        self.check_lock()?;
        self.ret_far_inner(0)
    }

    /// RETF imm16 (CA)
    pub(crate) fn ret_far_imm16(&mut self) -> Result<()> {
        let imm = self.fetch_u16()?;
        self.check_lock()?;
        self.ret_far_inner(imm)?;
        self.release_stack(imm);
        Ok(())
    }

    fn ret_far_inner(&mut self, imm: u16) -> Result<()> {
        if self.protected_not_vm() {
            self.ret_far_protected(imm)
        } else {
            self.ret_far_real()
        }
    }

    // Stack frame helpers

    /// Offset `delta` bytes above `sp`, wrapped to the stack width.
    #[inline]
    fn stack_at(&self, sp: u32, delta: u32) -> u32 {
        let off = sp.wrapping_add(delta);
        if self.stack32() {
            off
        } else {
            off & 0xFFFF
        }
    }

    /// New stack top for `n` more bytes, or #SS(0) when they do not fit.
    fn reserve_stack(&self, n: u32) -> Result<u32> {
        let top = self.sp_offset(-(n as i32));
        if !self.seg(Seg::SS).contains(top, n) {
            return Err(Fault::StackFault(0));
        }
        Ok(top)
    }

    /// Write a return frame (EIP below CS) at `top` of the current stack
    /// and move the stack pointer there.
    fn write_return_frame(&mut self, top: u32, cs: u16, eip: u32, op32: bool) -> Result<()> {
        if op32 {
            self.write_mem::<u32>(Seg::SS, top, eip)?;
            self.write_mem::<u32>(Seg::SS, self.stack_at(top, 4), cs as u32)?;
        } else {
            self.write_mem::<u16>(Seg::SS, top, eip & 0xFFFF)?;
            self.write_mem::<u16>(Seg::SS, self.stack_at(top, 2), cs as u32)?;
        }
        self.set_sp(top);
        Ok(())
    }

    /// Write through a segment cache that is not loaded yet.
    fn write_via<W: Operand>(&mut self, sreg: &SegmentRegister, offset: u32, val: u32) -> Result<()> {
        let linear = self.check_access(sreg, true, offset, W::BYTES, true)?;
        self.memory.check_write(linear, W::BYTES)?;
        for i in 0..W::BYTES {
            self.memory.write(linear.wrapping_add(i), (val >> (8 * i)) as u8)?;
        }
        Ok(())
    }

    // Real and virtual-8086 mode

    /// A 32-bit real-mode far call pushes CS as a dword, 8 bytes in all.
    fn call_far_real(&mut self, selector: u16, offset: u32) -> Result<()> {
        let op32 = self.operand32();
        let top = self.reserve_stack(if op32 { 8 } else { 4 })?;
        if op32 && offset > 0xFFFF {
            return Err(Fault::GeneralProtection(0));
        }
        let cs = self.seg(Seg::CS).selector;
        self.write_return_frame(top, cs, self.eip, op32)?;
        self.load_segment_real(Seg::CS, selector);
        self.eip = offset;
        Ok(())
    }

    fn ret_far_real(&mut self) -> Result<()> {
        let sp = self.sp();
        let (eip, selector, size) = if self.operand32() {
            let eip = self.read_mem::<u32>(Seg::SS, sp)?;
            let sel = self.read_mem::<u32>(Seg::SS, self.stack_at(sp, 4))?;
            (eip, sel as u16, 8)
        } else {
            let ip = self.read_mem::<u16>(Seg::SS, sp)?;
            let sel = self.read_mem::<u16>(Seg::SS, self.stack_at(sp, 2))?;
            (ip, sel as u16, 4)
        };
        self.set_sp(self.sp_offset(size));
        self.load_segment_real(Seg::CS, selector);
        self.eip = eip;
        Ok(())
    }

    // Protected mode

    fn far_protected(&mut self, selector: u16, offset: u32, is_call: bool) -> Result<()> {
        if selector & 0xFFFC == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let desc = self.read_descriptor(selector)?;
        if desc.is_code() {
            let cpl = self.cpl();
            let new_cpl = Self::direct_code_cpl(selector, &desc, cpl)?;
            if !desc.is_present() {
                return Err(Fault::np_sel(selector));
            }
            let push = if is_call { Some(self.operand32()) } else { None };
            self.enter_code(selector, &desc, new_cpl, offset, push)
        } else if desc.is_call_gate() {
            if is_call {
                self.call_gate(selector, &desc)
            } else {
                self.jmp_gate(selector, &desc)
            }
        } else if desc.is_task_gate() {
            Err(Fault::Unimplemented("task switch through a task gate"))
        } else if desc.is_tss() {
            Err(Fault::Unimplemented("task switch through a TSS descriptor"))
        } else {
            Err(Fault::gp_sel(selector))
        }
    }

    /// CPL after a direct far CALL/JMP to a code segment.
    fn direct_code_cpl(selector: u16, desc: &SegmentDescriptor, cpl: u8) -> Result<u8> {
        let rpl = (selector & 3) as u8;
        if desc.is_conforming() {
            if desc.dpl() > cpl {
                return Err(Fault::gp_sel(selector));
            }
            Ok(cpl)
        } else {
            if rpl > cpl || desc.dpl() != cpl {
                return Err(Fault::gp_sel(selector));
            }
            Ok(desc.dpl())
        }
    }

    /// Transfer to `offset` in code segment `selector` without a stack
    /// switch. `push` carries the return-frame width for calls.
    fn enter_code(
        &mut self,
        selector: u16,
        desc: &SegmentDescriptor,
        new_cpl: u8,
        offset: u32,
        push: Option<bool>,
    ) -> Result<()> {
        let top = match push {
            Some(op32) => Some(self.reserve_stack(if op32 { 8 } else { 4 })?),
            None => None,
        };
        let cs = SegmentRegister::from_descriptor((selector & 0xFFFC) | new_cpl as u16, desc);
        if !cs.contains(offset, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        self.set_descriptor_accessed(selector)?;
        if let (Some(top), Some(op32)) = (top, push) {
            let old_cs = self.seg(Seg::CS).selector;
            self.write_return_frame(top, old_cs, self.eip, op32)?;
        }
        self.segs[Seg::CS as usize] = cs;
        self.eip = offset;
        Ok(())
    }

    /// Common gate checks; returns the target selector and descriptor.
    fn gate_target(&self, gate_sel: u16, gate: &SegmentDescriptor) -> Result<(u16, SegmentDescriptor)> {
        let cpl = self.cpl();
        if gate.dpl() < cpl || (gate_sel & 3) as u8 > gate.dpl() {
            return Err(Fault::gp_sel(gate_sel));
        }
        if !gate.is_present() {
            return Err(Fault::np_sel(gate_sel));
        }
        let selector = gate.gate_selector();
        if selector & 0xFFFC == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_code() || desc.dpl() > cpl {
            return Err(Fault::gp_sel(selector));
        }
        Ok((selector, desc))
    }

    fn gate_offset(gate: &SegmentDescriptor) -> u32 {
        if gate.is_call_gate_32() {
            gate.gate_offset()
        } else {
            gate.gate_offset() & 0xFFFF
        }
    }

    fn call_gate(&mut self, gate_sel: u16, gate: &SegmentDescriptor) -> Result<()> {
        let (selector, desc) = self.gate_target(gate_sel, gate)?;
        if !desc.is_present() {
            return Err(Fault::np_sel(selector));
        }
        let gate32 = gate.is_call_gate_32();
        let offset = Self::gate_offset(gate);
        let cpl = self.cpl();
        if !desc.is_conforming() && desc.dpl() < cpl {
            self.call_gate_inner_level(selector, &desc, offset, gate32, gate.gate_param_count())
        } else {
            self.enter_code(selector, &desc, cpl, offset, Some(gate32))
        }
    }

    /// Call gate to a more privileged non-conforming segment: switch to the
    /// TSS stack of the target level and build the frame there.
    fn call_gate_inner_level(
        &mut self,
        selector: u16,
        desc: &SegmentDescriptor,
        offset: u32,
        gate32: bool,
        param_count: u8,
    ) -> Result<()> {
        let dpl = desc.dpl();
        let (ss_sel, new_esp) = self.tss_stack_for_level(dpl)?;
        if ss_sel & 0xFFFC == 0 {
            return Err(Fault::ts_sel(ss_sel));
        }
        let ss_desc = self.read_descriptor(ss_sel).map_err(|fault| match fault {
            Fault::GeneralProtection(_) => Fault::ts_sel(ss_sel),
            other => other,
        })?;
        if (ss_sel & 3) as u8 != dpl || ss_desc.dpl() != dpl || ss_desc.stype() & 0x1A != 0x12 {
            return Err(Fault::ts_sel(ss_sel));
        }
        if !ss_desc.is_present() {
            return Err(Fault::ss_sel(ss_sel));
        }
        let new_ss = SegmentRegister::from_descriptor(ss_sel, &ss_desc);
        let word: u32 = if gate32 { 4 } else { 2 };
        let params = (param_count as usize).min(MAX_GATE_PARAMS);
        let frame = word * (4 + params as u32);
        let top = if new_ss.is32 {
            new_esp.wrapping_sub(frame)
        } else {
            new_esp.wrapping_sub(frame) & 0xFFFF
        };
        if !new_ss.contains(top, frame) {
            return Err(Fault::ss_sel(ss_sel));
        }
        let new_cs = SegmentRegister::from_descriptor((selector & 0xFFFC) | dpl as u16, desc);
        if !new_cs.contains(offset, 1) {
            return Err(Fault::GeneralProtection(0));
        }

        // Parameters from the caller's stack, before anything changes.
        let old_sp = self.sp();
        let mut values = [0u32; MAX_GATE_PARAMS];
        for (i, value) in values.iter_mut().enumerate().take(params) {
            let at = self.stack_at(old_sp, i as u32 * word);
            *value = if gate32 {
                self.read_mem::<u32>(Seg::SS, at)?
            } else {
                self.read_mem::<u16>(Seg::SS, at)?
            };
        }

        self.set_descriptor_accessed(selector)?;
        self.set_descriptor_accessed(ss_sel)?;

        let old_ss = self.seg(Seg::SS).selector as u32;
        let old_esp = self.regs[REG_ESP as usize];
        let old_cs = self.seg(Seg::CS).selector as u32;
        let eip = self.eip;
        let slot = |k: u32| {
            let off = top.wrapping_add(k * word);
            if new_ss.is32 {
                off
            } else {
                off & 0xFFFF
            }
        };
        let p = params as u32;
        if gate32 {
            self.write_via::<u32>(&new_ss, slot(3 + p), old_ss)?;
            self.write_via::<u32>(&new_ss, slot(2 + p), old_esp)?;
            for (i, &value) in values.iter().enumerate().take(params) {
                self.write_via::<u32>(&new_ss, slot(2 + i as u32), value)?;
            }
            self.write_via::<u32>(&new_ss, slot(1), old_cs)?;
            self.write_via::<u32>(&new_ss, slot(0), eip)?;
        } else {
            self.write_via::<u16>(&new_ss, slot(3 + p), old_ss)?;
            self.write_via::<u16>(&new_ss, slot(2 + p), old_esp & 0xFFFF)?;
            for (i, &value) in values.iter().enumerate().take(params) {
                self.write_via::<u16>(&new_ss, slot(2 + i as u32), value)?;
            }
            self.write_via::<u16>(&new_ss, slot(1), old_cs)?;
            self.write_via::<u16>(&new_ss, slot(0), eip & 0xFFFF)?;
        }

        log(LogCategory::CPU, LogLevel::Debug, || {
            format!(
                "call gate: CPL {} -> {}, stack {:04X}:{:08X}",
                self.cpl(),
                dpl,
                ss_sel,
                top
            )
        });
        self.segs[Seg::SS as usize] = new_ss;
        self.regs[REG_ESP as usize] = new_esp;
        self.set_sp(top);
        self.segs[Seg::CS as usize] = new_cs;
        self.eip = offset;
        Ok(())
    }

    /// JMP through a call gate: never changes privilege.
    fn jmp_gate(&mut self, gate_sel: u16, gate: &SegmentDescriptor) -> Result<()> {
        let (selector, desc) = self.gate_target(gate_sel, gate)?;
        let cpl = self.cpl();
        if !desc.is_conforming() && desc.dpl() != cpl {
            return Err(Fault::gp_sel(selector));
        }
        if !desc.is_present() {
            return Err(Fault::np_sel(selector));
        }
        self.enter_code(selector, &desc, cpl, Self::gate_offset(gate), None)
    }

    /// Protected-mode far return. The caller releases `imm` bytes after
    /// this returns.
    fn ret_far_protected(&mut self, imm: u16) -> Result<()> {
        let op32 = self.operand32();
        let word: u32 = if op32 { 4 } else { 2 };
        let sp = self.sp();
        if !self.seg(Seg::SS).contains(sp, 2 * word) {
            return Err(Fault::StackFault(0));
        }
        let selector = self.read_stack_word(op32, self.stack_at(sp, word))? as u16;
        if selector & 0xFFFC == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_code() {
            return Err(Fault::gp_sel(selector));
        }
        let cpl = self.cpl();
        let rpl = (selector & 3) as u8;
        if rpl < cpl {
            return Err(Fault::gp_sel(selector));
        }
        if desc.is_conforming() {
            if desc.dpl() > rpl {
                return Err(Fault::gp_sel(selector));
            }
        } else if desc.dpl() != rpl {
            return Err(Fault::gp_sel(selector));
        }
        if !desc.is_present() {
            return Err(Fault::np_sel(selector));
        }

        if rpl > cpl {
            return self.ret_far_outer(selector, &desc, imm);
        }

        let eip = self.read_stack_word(op32, sp)?;
        let cs = SegmentRegister::from_descriptor(selector, &desc);
        if !cs.contains(eip, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        self.set_descriptor_accessed(selector)?;
        self.set_sp(self.sp_offset(2 * word as i32));
        self.segs[Seg::CS as usize] = cs;
        self.eip = eip;
        Ok(())
    }

    fn read_stack_word(&self, op32: bool, offset: u32) -> Result<u32> {
        if op32 {
            self.read_mem::<u32>(Seg::SS, offset)
        } else {
            self.read_mem::<u16>(Seg::SS, offset)
        }
    }

    /// Return to an outer privilege level: reload SS:ESP from the frame
    /// and null data segments the new level may not use.
    fn ret_far_outer(&mut self, selector: u16, desc: &SegmentDescriptor, imm: u16) -> Result<()> {
        let op32 = self.operand32();
        let word: u32 = if op32 { 4 } else { 2 };
        let sp = self.sp();
        let imm = imm as u32;
        if !self.seg(Seg::SS).contains(sp, 4 * word + imm) {
            return Err(Fault::StackFault(0));
        }
        let eip = self.read_stack_word(op32, sp)?;
        let new_esp = self.read_stack_word(op32, self.stack_at(sp, 2 * word + imm))?;
        let ss_sel = self.read_stack_word(op32, self.stack_at(sp, 3 * word + imm))? as u16;
        if ss_sel & 0xFFFC == 0 {
            return Err(Fault::GeneralProtection(0));
        }
        let ss_desc = self.read_descriptor(ss_sel)?;
        let rpl = (selector & 3) as u8;
        if (ss_sel & 3) as u8 != rpl || ss_desc.dpl() != rpl || !ss_desc.is_writable_data() {
            return Err(Fault::gp_sel(ss_sel));
        }
        if !ss_desc.is_present() {
            return Err(Fault::ss_sel(ss_sel));
        }
        let cs = SegmentRegister::from_descriptor(selector, desc);
        if !cs.contains(eip, 1) {
            return Err(Fault::GeneralProtection(0));
        }
        self.set_descriptor_accessed(selector)?;
        self.set_descriptor_accessed(ss_sel)?;

        self.segs[Seg::CS as usize] = cs;
        self.eip = eip;
        if op32 {
            self.regs[REG_ESP as usize] = new_esp;
        } else {
            self.set_reg16(REG_ESP, new_esp as u16);
        }
        self.segs[Seg::SS as usize] = SegmentRegister::from_descriptor(ss_sel, &ss_desc);

        let new_cpl = cs.pl;
        for seg in [Seg::ES, Seg::FS, Seg::GS, Seg::DS] {
            let sreg = &mut self.segs[seg as usize];
            if sreg.dpl < new_cpl && sreg.data_or_nonconforming {
                sreg.is_null = true;
                sreg.selector &= 3;
            }
        }
        Ok(())
    }
}
