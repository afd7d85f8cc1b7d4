//! Tests for x87 instructions, stack handling and exception reporting

use super::{flat_cpu, real_cpu, run, TestCpu};
use crate::cpu_ia32_protected::{CR0_MP, CR0_TS};
use crate::fault::Fault;
use crate::fpu::{
    F80, FPU_STATUS_C0, FPU_STATUS_C1, FPU_STATUS_C2, FPU_STATUS_C3, FPU_STATUS_ES, FPU_STATUS_IE,
    FPU_STATUS_PE, FPU_STATUS_SF, FPU_STATUS_ZE, TAG_EMPTY,
};

const CONDITIONS: u16 = FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C1 | FPU_STATUS_C0;

/// Real-mode machine with BX = 0x2000 and SI = 0x2100 as operand pointers.
fn fpu_cpu(program: &[u8]) -> TestCpu {
    let mut cpu = real_cpu(program);
    cpu.set_reg16(3, 0x2000);
    cpu.set_reg16(6, 0x2100);
    cpu
}

fn write_f64(cpu: &mut TestCpu, addr: u32, value: f64) {
    cpu.memory.load_program(addr, &value.to_bits().to_le_bytes());
}

fn read_f64(cpu: &TestCpu, addr: u32) -> f64 {
    let lo = cpu.memory.read_u32(addr) as u64;
    let hi = cpu.memory.read_u32(addr + 4) as u64;
    f64::from_bits(hi << 32 | lo)
}

fn st(cpu: &TestCpu, i: u8) -> f64 {
    cpu.fpu.st(i).to_f64()
}

#[test]
fn test_fdiv_by_zero_masked() {
    // FLDZ; FLD1; FDIV ST(0), ST(1)
    let mut cpu = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xE8, 0xD8, 0xF1]);
    run(&mut cpu, 3).unwrap();
    assert!(cpu.fpu.st(0).is_infinite());
    assert!(!cpu.fpu.st(0).sign);
    assert_ne!(cpu.fpu.status & FPU_STATUS_ZE, 0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_ES, 0);
}

#[test]
fn test_fdiv_zero_by_zero_is_invalid() {
    // FLDZ; FLDZ; FDIV ST(0), ST(1)
    let mut cpu = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xEE, 0xD8, 0xF1]);
    run(&mut cpu, 3).unwrap();
    assert!(cpu.fpu.st(0).is_nan());
    assert_ne!(cpu.fpu.status & FPU_STATUS_IE, 0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_ZE, 0);
}

#[test]
fn test_fdiv_any_zero_divisor_raises_ze_when_configured() {
    // FLDZ; FLDZ; FDIV ST(0), ST(1)
    let mut cpu = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xEE, 0xD8, 0xF1]);
    cpu.config.fdiv_any_zero_divisor_raises_ze = true;
    run(&mut cpu, 3).unwrap();
    assert!(cpu.fpu.st(0).is_nan());
    assert_ne!(cpu.fpu.status & FPU_STATUS_ZE, 0);
    assert_ne!(cpu.fpu.status & FPU_STATUS_IE, 0);

    // unmasked ZE stops before the division
    let mut cpu = fpu_cpu(&[0xD9, 0x2F, 0xD9, 0xEE, 0xD9, 0xEE, 0xD8, 0xF1]);
    cpu.config.fdiv_any_zero_divisor_raises_ze = true;
    cpu.memory.write_u16(0x2000, 0x037B);
    run(&mut cpu, 4).unwrap();
    assert!(cpu.fpu.st(0).is_zero());
    assert_ne!(cpu.fpu.status & FPU_STATUS_ES, 0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_IE, 0);
}

#[test]
fn test_fdiv_by_zero_unmasked_defers_to_next_wait() {
    // FLDCW [BX]; FLDZ; FLD1; FDIV ST(0), ST(1); FWAIT
    let mut cpu = fpu_cpu(&[0xD9, 0x2F, 0xD9, 0xEE, 0xD9, 0xE8, 0xD8, 0xF1, 0x9B]);
    cpu.memory.write_u16(0x2000, 0x037B);
    run(&mut cpu, 4).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
    assert_ne!(cpu.fpu.status & FPU_STATUS_ZE, 0);
    assert_ne!(cpu.fpu.status & FPU_STATUS_ES, 0);

    assert!(matches!(cpu.step(), Err(Fault::Unimplemented(_))));
    assert_eq!(cpu.eip, 0x1008);
}

#[test]
fn test_fadd_m32_and_fstp_m64() {
    // FLD1; FADD DWORD [BX]; FSTP QWORD [SI]
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xD8, 0x07, 0xDD, 0x1C]);
    cpu.memory.write_u32(0x2000, 2.5f32.to_bits());
    run(&mut cpu, 3).unwrap();
    assert_eq!(read_f64(&cpu, 0x2100), 3.5);
    assert_eq!(cpu.fpu.top, 0);
    assert_eq!(cpu.fpu.tag_word, 0xFFFF);
}

#[test]
fn test_fiadd_m32int() {
    // FLD1; FIADD DWORD [BX]
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xDA, 0x07]);
    cpu.memory.write_u32(0x2000, 5);
    run(&mut cpu, 2).unwrap();
    assert_eq!(st(&cpu, 0), 6.0);
}

#[test]
fn test_fsubp_register_form() {
    // FILD WORD [BX] (5); FLD1; FSUBP ST(1), ST(0)
    let mut cpu = fpu_cpu(&[0xDF, 0x07, 0xD9, 0xE8, 0xDE, 0xE9]);
    cpu.memory.write_u16(0x2000, 5);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), 4.0);
    assert_eq!(cpu.fpu.top, 7);
    assert_eq!(cpu.fpu.tag(1), TAG_EMPTY);
}

#[test]
fn test_fcom_and_fcompp() {
    // FLD1; FLDZ; FCOM ST(1); FNSTSW AX; FCOMPP
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xD9, 0xEE, 0xD8, 0xD1, 0xDF, 0xE0, 0xDE, 0xD9]);
    run(&mut cpu, 4).unwrap();
    assert_eq!(cpu.reg16(0) & (FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0), FPU_STATUS_C0);
    assert_eq!((cpu.reg16(0) >> 11) & 7, 6);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.top, 0);
    assert_eq!(cpu.fpu.tag_word, 0xFFFF);
}

#[test]
fn test_fcom_unordered_sets_all_conditions() {
    // FLD DWORD [BX] (quiet NaN); FLD1; FCOM ST(1)
    let mut cpu = fpu_cpu(&[0xD9, 0x07, 0xD9, 0xE8, 0xD8, 0xD1]);
    cpu.memory.write_u32(0x2000, 0x7FC0_0000);
    run(&mut cpu, 3).unwrap();
    let cc = cpu.fpu.status & (FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0);
    assert_eq!(cc, FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0);
    assert_ne!(cpu.fpu.status & FPU_STATUS_IE, 0);
}

#[test]
fn test_stack_underflow_masked() {
    // FADD ST(0), ST(1) on an empty stack
    let mut cpu = fpu_cpu(&[0xD8, 0xC1]);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.status & (FPU_STATUS_IE | FPU_STATUS_SF), FPU_STATUS_IE | FPU_STATUS_SF);
    assert_eq!(cpu.fpu.status & FPU_STATUS_C1, 0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_ES, 0);
    assert!(cpu.fpu.st(0).is_nan());
}

#[test]
fn test_stack_underflow_unmasked_leaves_stack() {
    // FLDCW [BX] with IM clear; FCHS on an empty stack
    let mut cpu = fpu_cpu(&[0xD9, 0x2F, 0xD9, 0xE0]);
    cpu.memory.write_u16(0x2000, 0x037E);
    run(&mut cpu, 2).unwrap();
    assert_ne!(cpu.fpu.status & FPU_STATUS_ES, 0);
    assert_eq!(cpu.fpu.tag(0), TAG_EMPTY);
}

#[test]
fn test_stack_overflow_sets_c1() {
    let program: Vec<u8> = [0xD9, 0xE8].iter().copied().cycle().take(18).collect();
    let mut cpu = fpu_cpu(&program);
    run(&mut cpu, 8).unwrap();
    assert_eq!(cpu.fpu.status & FPU_STATUS_IE, 0);
    run(&mut cpu, 1).unwrap();
    let fault_bits = FPU_STATUS_IE | FPU_STATUS_SF | FPU_STATUS_C1;
    assert_eq!(cpu.fpu.status & fault_bits, fault_bits);
}

#[test]
fn test_fistp_out_of_range_stores_indefinite() {
    // FLD QWORD [SI]; FISTP WORD [BX]
    let mut cpu = fpu_cpu(&[0xDD, 0x04, 0xDF, 0x1F]);
    write_f64(&mut cpu, 0x2100, 1e10);
    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.memory.read_u16(0x2000), 0x8000);
    assert_ne!(cpu.fpu.status & FPU_STATUS_IE, 0);
    assert_eq!(cpu.fpu.tag(0), TAG_EMPTY);
}

#[test]
fn test_fistp_rounds_to_even() {
    // FLD QWORD [SI]; FISTP DWORD [BX]
    let mut cpu = fpu_cpu(&[0xDD, 0x04, 0xDB, 0x1F]);
    write_f64(&mut cpu, 0x2100, 2.5);
    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.memory.read_u32(0x2000), 2);
    assert_ne!(cpu.fpu.status & FPU_STATUS_PE, 0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_C1, 0);
}

#[test]
fn test_fbstp_packs_bcd() {
    // FILD DWORD [BX]; FBSTP [SI]
    let mut cpu = fpu_cpu(&[0xDB, 0x07, 0xDF, 0x34]);
    cpu.memory.write_u32(0x2000, (-1234i32) as u32);
    run(&mut cpu, 2).unwrap();
    let mut bcd = [0u8; 10];
    for (i, byte) in bcd.iter_mut().enumerate() {
        *byte = cpu.memory.read_u8(0x2100 + i as u32);
    }
    assert_eq!(bcd, [0x34, 0x12, 0, 0, 0, 0, 0, 0, 0, 0x80]);
    assert_eq!(cpu.fpu.tag(0), TAG_EMPTY);
}

#[test]
fn test_fld_fstp_m80_preserves_bits() {
    // FLD TBYTE [BX]; FSTP TBYTE [SI]
    let mut cpu = fpu_cpu(&[0xDB, 0x2F, 0xDB, 0x3C]);
    let bytes = [0x35, 0xC2, 0x68, 0x21, 0xA2, 0xDA, 0x0F, 0xC9, 0x00, 0xC0];
    cpu.memory.load_program(0x2000, &bytes);
    run(&mut cpu, 2).unwrap();
    for (i, &b) in bytes.iter().enumerate() {
        assert_eq!(cpu.memory.read_u8(0x2100 + i as u32), b);
    }
}

#[test]
fn test_fld_m32_signaling_nan_raises_invalid() {
    let mut cpu = fpu_cpu(&[0xD9, 0x07]);
    cpu.memory.write_u32(0x2000, 0x7F80_0001);
    run(&mut cpu, 1).unwrap();
    assert_ne!(cpu.fpu.status & FPU_STATUS_IE, 0);
    assert!(cpu.fpu.st(0).is_nan());
    assert!(!cpu.fpu.st(0).is_signaling());
}

#[test]
fn test_fsave_frstor_round_trip() {
    // FLD1; FLDPI; FNSAVE [EBX]; FRSTOR [EBX]
    let mut cpu = flat_cpu(0, &[0xD9, 0xE8, 0xD9, 0xEB, 0xDD, 0x33, 0xDD, 0x23]);
    cpu.set_reg32(3, 0x40000);
    run(&mut cpu, 3).unwrap();
    assert_eq!(cpu.fpu.top, 0);
    assert_eq!(cpu.fpu.tag_word, 0xFFFF);
    assert_eq!(cpu.memory.read_u16(0x40000), 0x037F);
    assert_eq!(cpu.memory.read_u16(0x40004), 6 << 11);
    assert_eq!(cpu.memory.read_u16(0x40008), 0x0FFF);

    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.top, 6);
    assert_eq!(st(&cpu, 0), std::f64::consts::PI);
    assert_eq!(st(&cpu, 1), 1.0);
    assert_eq!(cpu.fpu.tag(2), TAG_EMPTY);
}

#[test]
fn test_fsave_in_real_mode_is_unimplemented() {
    let mut cpu = fpu_cpu(&[0xDD, 0x37]);
    assert!(matches!(cpu.step(), Err(Fault::Unimplemented(_))));
}

#[test]
fn test_device_not_available() {
    let mut cpu = fpu_cpu(&[0xD9, 0xE8]);
    cpu.cr0 |= CR0_TS;
    assert_eq!(cpu.step(), Err(Fault::DeviceNotAvailable));

    // FWAIT only traps when MP is set as well
    let mut cpu = fpu_cpu(&[0x9B, 0x9B]);
    cpu.cr0 |= CR0_TS;
    run(&mut cpu, 1).unwrap();
    cpu.cr0 |= CR0_MP;
    assert_eq!(cpu.step(), Err(Fault::DeviceNotAvailable));
}

#[test]
fn test_lock_prefix_on_fpu_is_invalid() {
    let mut cpu = fpu_cpu(&[0xF0, 0xD9, 0xE8]);
    assert_eq!(cpu.step(), Err(Fault::InvalidOpcode));
}

#[test]
fn test_pending_exception_and_fnclex() {
    // FLD1; FNCLEX; FLD1
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xDB, 0xE2, 0xD9, 0xE8]);
    cpu.fpu.status |= FPU_STATUS_ES | FPU_STATUS_ZE;
    assert!(matches!(cpu.step(), Err(Fault::Unimplemented(_))));
    assert_eq!(cpu.eip, 0x1000);

    cpu.eip = 0x1002;
    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.fpu.status & (FPU_STATUS_ES | FPU_STATUS_ZE), 0);
    assert_eq!(st(&cpu, 0), 1.0);
}

#[test]
fn test_fninit_resets_state() {
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xDB, 0xE3]);
    run(&mut cpu, 2).unwrap();
    assert_eq!(cpu.fpu.top, 0);
    assert_eq!(cpu.fpu.tag_word, 0xFFFF);
    assert_eq!(cpu.fpu.control, 0x037F);
}

#[test]
fn test_fxam_classes() {
    // FXAM on empty; FLD1; FCHS; FXAM
    let mut cpu = fpu_cpu(&[0xD9, 0xE5, 0xD9, 0xE8, 0xD9, 0xE0, 0xD9, 0xE5]);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.status & (FPU_STATUS_C3 | FPU_STATUS_C2 | FPU_STATUS_C0), FPU_STATUS_C3 | FPU_STATUS_C0);
    run(&mut cpu, 3).unwrap();
    assert_eq!(cpu.fpu.status & CONDITIONS, FPU_STATUS_C2 | FPU_STATUS_C1);
}

#[test]
fn test_fchs_fabs() {
    // FLD1; FCHS; FABS
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xD9, 0xE0, 0xD9, 0xE1]);
    run(&mut cpu, 2).unwrap();
    assert_eq!(st(&cpu, 0), -1.0);
    run(&mut cpu, 1).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
}

#[test]
fn test_fxch_fstp_ffree() {
    // FLD1; FLDZ; FXCH ST(1); FSTP ST(1); FFREE ST(0)
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xD9, 0xEE, 0xD9, 0xC9, 0xDD, 0xD9, 0xDD, 0xC0]);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
    assert_eq!(st(&cpu, 1), 0.0);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.top, 7);
    assert_eq!(st(&cpu, 0), 1.0);
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.tag(0), TAG_EMPTY);
    assert_eq!(cpu.fpu.top, 7);
}

#[test]
fn test_fsqrt() {
    // FILD WORD [BX]; FSQRT
    let mut cpu = fpu_cpu(&[0xDF, 0x07, 0xD9, 0xFA]);
    cpu.memory.write_u16(0x2000, 2);
    run(&mut cpu, 2).unwrap();
    assert!((st(&cpu, 0) - std::f64::consts::SQRT_2).abs() < 1e-15);
    assert_ne!(cpu.fpu.status & FPU_STATUS_PE, 0);
}

#[test]
fn test_fprem_quotient_bits() {
    // FILD WORD [BX] (3); FILD WORD [BX+2] (7); FPREM
    let mut cpu = fpu_cpu(&[0xDF, 0x07, 0xDF, 0x47, 0x02, 0xD9, 0xF8]);
    cpu.memory.write_u16(0x2000, 3);
    cpu.memory.write_u16(0x2002, 7);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
    assert_eq!(cpu.fpu.status & CONDITIONS, FPU_STATUS_C3);
}

#[test]
fn test_frndint_follows_rounding_control() {
    // FLDCW [BX] (round down); FLD QWORD [SI]; FRNDINT
    let mut cpu = fpu_cpu(&[0xD9, 0x2F, 0xDD, 0x04, 0xD9, 0xFC]);
    cpu.memory.write_u16(0x2000, 0x077F);
    write_f64(&mut cpu, 0x2100, -2.5);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), -3.0);
    assert_ne!(cpu.fpu.status & FPU_STATUS_PE, 0);
}

#[test]
fn test_fscale() {
    // FILD WORD [BX] (3); FLD1; FSCALE
    let mut cpu = fpu_cpu(&[0xDF, 0x07, 0xD9, 0xE8, 0xD9, 0xFD]);
    cpu.memory.write_u16(0x2000, 3);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), 8.0);
    assert_eq!(st(&cpu, 1), 3.0);
}

#[test]
fn test_transcendentals() {
    // FLDZ; FSIN; FCOS
    let mut cpu = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xFE, 0xD9, 0xFF]);
    run(&mut cpu, 2).unwrap();
    assert!(cpu.fpu.st(0).is_zero());
    run(&mut cpu, 1).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
    assert_eq!(cpu.fpu.status & FPU_STATUS_PE, 0);

    // FLDZ; FPTAN pushes 1.0
    let mut cpu = fpu_cpu(&[0xD9, 0xEE, 0xD9, 0xF2]);
    run(&mut cpu, 2).unwrap();
    assert_eq!(st(&cpu, 0), 1.0);
    assert!(cpu.fpu.st(1).is_zero());
    assert_eq!(cpu.fpu.top, 6);
    assert_eq!(cpu.fpu.status & FPU_STATUS_C2, 0);

    // FLD1; FLD1; FPATAN
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xD9, 0xE8, 0xD9, 0xF3]);
    run(&mut cpu, 3).unwrap();
    assert!((st(&cpu, 0) - std::f64::consts::FRAC_PI_4).abs() < 1e-15);
    assert_eq!(cpu.fpu.top, 7);
}

#[test]
fn test_fyl2x_and_f2xm1() {
    // FILD WORD [BX] (3); FILD WORD [BX+2] (8); FYL2X
    let mut cpu = fpu_cpu(&[0xDF, 0x07, 0xDF, 0x47, 0x02, 0xD9, 0xF1]);
    cpu.memory.write_u16(0x2000, 3);
    cpu.memory.write_u16(0x2002, 8);
    run(&mut cpu, 3).unwrap();
    assert_eq!(st(&cpu, 0), 9.0);
    assert_eq!(cpu.fpu.top, 7);

    // FLD QWORD [SI] (0.5); F2XM1
    let mut cpu = fpu_cpu(&[0xDD, 0x04, 0xD9, 0xF0]);
    write_f64(&mut cpu, 0x2100, 0.5);
    run(&mut cpu, 2).unwrap();
    assert!((st(&cpu, 0) - (std::f64::consts::SQRT_2 - 1.0)).abs() < 1e-15);
}

#[test]
fn test_fnstsw_and_fnstcw_memory() {
    // FLD1; FNSTSW [BX]; FNSTCW [SI]
    let mut cpu = fpu_cpu(&[0xD9, 0xE8, 0xDD, 0x3F, 0xD9, 0x3C]);
    run(&mut cpu, 3).unwrap();
    assert_eq!(cpu.memory.read_u16(0x2000), 7 << 11);
    assert_eq!(cpu.memory.read_u16(0x2100), 0x037F);
}

#[test]
fn test_last_instruction_pointer_recorded() {
    let mut cpu = fpu_cpu(&[0x90, 0xD9, 0xE8]);
    cpu.eip = 0x1001;
    run(&mut cpu, 1).unwrap();
    assert_eq!(cpu.fpu.ip_offset, 0x1001);
    assert_eq!(cpu.fpu.opcode, 0x1E8);
}

#[test]
fn test_constant_loads() {
    assert_eq!(F80::ONE.to_f64(), 1.0);
    // FLDL2E; FLDLN2
    let mut cpu = fpu_cpu(&[0xD9, 0xEA, 0xD9, 0xED]);
    run(&mut cpu, 2).unwrap();
    assert_eq!(st(&cpu, 0), std::f64::consts::LN_2);
    assert_eq!(st(&cpu, 1), std::f64::consts::LOG2_E);
}
