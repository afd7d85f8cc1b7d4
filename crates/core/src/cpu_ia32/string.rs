//! CMPS and SCAS with REPE/REPNE.
//!
//! One iteration per `step()`. A repeat re-executes the instruction by
//! rewinding EIP, so an interrupt can be taken between iterations; with
//! the counter already at zero the instruction does nothing.

use super::{CpuIa32, MemoryIa32, REG_EAX, REG_EDI, REG_ESI};
use crate::cpu_ia32_protected::Seg;
use crate::fault::Result;
use crate::flags::Operand;
use super::alu::AluOp;

impl<M: MemoryIa32> CpuIa32<M> {
    /// CMPS (A6, A7): compare DS:[E]SI with ES:[E]DI.
    pub(crate) fn cmps<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        if self.prefixes.rep.is_some() && self.counter() == 0 {
            return Ok(());
        }
        let src_seg = self.data_seg(Seg::DS);
        let src = self.read_mem::<W>(src_seg, self.index_reg(REG_ESI))?;
        let dst = self.read_mem::<W>(Seg::ES, self.index_reg(REG_EDI))?;
        self.alu::<W>(AluOp::Cmp, src, dst);
        self.advance_index(REG_ESI, W::BYTES);
        self.advance_index(REG_EDI, W::BYTES);
        self.repeat_while_zf();
        Ok(())
    }

    /// SCAS (AE, AF): compare the accumulator with ES:[E]DI.
    pub(crate) fn scas<W: Operand>(&mut self) -> Result<()> {
        self.check_lock()?;
        if self.prefixes.rep.is_some() && self.counter() == 0 {
            return Ok(());
        }
        let dst = self.read_mem::<W>(Seg::ES, self.index_reg(REG_EDI))?;
        let acc = self.reg::<W>(REG_EAX);
        self.alu::<W>(AluOp::Cmp, acc, dst);
        self.advance_index(REG_EDI, W::BYTES);
        self.repeat_while_zf();
        Ok(())
    }
}
