/*
    Guest instruction translation
*/

use tracing::trace;

use crate::Bus;
use crate::Error;
use crate::bus::{RAM_MASK, SCRATCHPAD_END};
use crate::r3000a::interpreter::{div_signed, div_unsigned};
use crate::r3000a::jit::Helper;
use crate::r3000a::jit::branch::Exit;
use crate::r3000a::jit::cache::CodeCache;
use crate::r3000a::jit::emitter::{self, Alu, Emitter, RETVAL, Shift, Width};
use crate::r3000a::jit::regalloc::{Allocator, Special};
use crate::r3000a::opcodes::{Instruction, Op};
use crate::r3000a::{MAX_BLOCK_INSNS, REG_HI, REG_LO, Registers};

// I/O registers whose word accesses go straight to the hardware page
const DIRECT_READS: [u32; 25] = [
    0x1F80_1070, 0x1F80_1074, 0x1F80_1080, 0x1F80_1084, 0x1F80_1088, 0x1F80_1090, 0x1F80_1094,
    0x1F80_1098, 0x1F80_10A0, 0x1F80_10A4, 0x1F80_10A8, 0x1F80_10B0, 0x1F80_10B4, 0x1F80_10B8,
    0x1F80_10C0, 0x1F80_10C4, 0x1F80_10C8, 0x1F80_10D0, 0x1F80_10D4, 0x1F80_10D8, 0x1F80_10E0,
    0x1F80_10E4, 0x1F80_10E8, 0x1F80_10F0, 0x1F80_10F4,
];

const DIRECT_WRITES: [u32; 16] = [
    0x1F80_1080, 0x1F80_1084, 0x1F80_1090, 0x1F80_1094, 0x1F80_10A0, 0x1F80_10A4, 0x1F80_10B0,
    0x1F80_10B4, 0x1F80_10C0, 0x1F80_10C4, 0x1F80_10D0, 0x1F80_10D4, 0x1F80_10E0, 0x1F80_10E4,
    0x1F80_1074, 0x1F80_10F0,
];

const ARGS: [Special; 3] = [Special::Arg1, Special::Arg2, Special::Arg3];

/// Whether the path being translated goes on after an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The instruction emitted a block exit.
    Ended,
}

pub struct Translator<'a, 't> {
    pub(super) asm: Emitter<'t>,
    pub(super) alloc: Allocator,
    pub(super) bus: &'a Bus,
    cache: &'a CodeCache,
    pub(super) start: u32,
    /// Address of the next instruction to translate
    pub(super) pc: u32,
    pub(super) count: u32,
    pub(super) in_delay_slot: bool,
}

/// Result of `op` on two known operands, as the guest computes it.
pub fn fold(op: Alu, a: u32, b: u32) -> u32 {
    match op {
        Alu::Add => a.wrapping_add(b),
        Alu::Sub => a.wrapping_sub(b),
        Alu::And => a & b,
        Alu::Or => a | b,
        Alu::Xor => a ^ b,
        Alu::Nor => !(a | b),
        Alu::Sllv => b << (a & 0x1F),
        Alu::Srlv => b >> (a & 0x1F),
        Alu::Srav => ((b as i32) >> (a & 0x1F)) as u32,
        Alu::Slt => ((a as i32) < (b as i32)) as u32,
        Alu::Sltu => (a < b) as u32,
    }
}

fn fold_shift(op: Shift, value: u32, sa: u32) -> u32 {
    match op {
        Shift::Sll => value << sa,
        Shift::Srl => value >> sa,
        Shift::Sra => ((value as i32) >> sa) as u32,
    }
}

/// Picks the addressed byte or half out of an aligned little-endian word.
fn extract(word: u32, addr: u32, width: Width, signed: bool) -> u32 {
    let value = word >> ((addr & 3) * 8);
    match (width, signed) {
        (Width::Byte, true) => value as u8 as i8 as u32,
        (Width::Byte, false) => value & 0xFF,
        (Width::Half, true) => value as u16 as i16 as u32,
        (Width::Half, false) => value & 0xFFFF,
        (Width::Word, _) => word,
    }
}

fn width_mask(width: Width) -> u32 {
    match width {
        Width::Byte => 0xFF,
        Width::Half => 0xFFFF,
        Width::Word => 0xFFFF_FFFF,
    }
}

fn is_ram_page(page: u32) -> bool {
    (page & 0x1FE0) == 0 && (page & 0x1FFF) != 0
}

impl<'a, 't> Translator<'a, 't> {
    pub fn new(asm: Emitter<'t>, bus: &'a Bus, cache: &'a CodeCache, pc: u32) -> Self {
        Translator {
            asm,
            alloc: Allocator::new(),
            bus,
            cache,
            start: pc,
            pc,
            count: 0,
            in_delay_slot: false,
        }
    }

    /// Translates the block starting at the entry address and seals the
    /// function. Returns the number of guest instructions on the last path
    /// translated.
    pub fn translate(mut self) -> Result<u32, Error> {
        loop {
            if self.count >= MAX_BLOCK_INSNS {
                self.epilogue(Exit::Const(self.pc))?;
                break;
            }

            let code = match self.bus.fetch(self.pc) {
                Some(code) => code,
                None if self.count > 0 => {
                    self.epilogue(Exit::Const(self.pc))?;
                    break;
                }
                None => return Err(Error::UnmappedCode(self.pc)),
            };

            self.pc = self.pc.wrapping_add(4);
            self.count += 1;

            if self.instruction(code)? == Step::Ended {
                break;
            }
        }

        let count = self.count;
        self.asm.finish();
        Ok(count)
    }

    /// Translates one instruction word. `self.pc` already points past it.
    pub(super) fn instruction(&mut self, code: u32) -> Result<Step, Error> {
        let insn = Instruction(code);
        let op = Op::decode(insn);
        trace!("0x{:08X}: {:08X} {:?}", self.pc.wrapping_sub(4), code, op);

        let (rs, rt, rd) = (insn.rs(), insn.rt(), insn.rd());

        match op {
            Op::Sll => self.shift_imm(Shift::Sll, rd, rt, insn.sa())?,
            Op::Srl => self.shift_imm(Shift::Srl, rd, rt, insn.sa())?,
            Op::Sra => self.shift_imm(Shift::Sra, rd, rt, insn.sa())?,
            Op::Sllv => self.alu_reg(Alu::Sllv, rd, rs, rt)?,
            Op::Srlv => self.alu_reg(Alu::Srlv, rd, rs, rt)?,
            Op::Srav => self.alu_reg(Alu::Srav, rd, rs, rt)?,
            Op::Add | Op::Addu => self.alu_reg(Alu::Add, rd, rs, rt)?,
            Op::Sub | Op::Subu => self.alu_reg(Alu::Sub, rd, rs, rt)?,
            Op::And => self.alu_reg(Alu::And, rd, rs, rt)?,
            Op::Or => self.alu_reg(Alu::Or, rd, rs, rt)?,
            Op::Xor => self.alu_reg(Alu::Xor, rd, rs, rt)?,
            Op::Nor => self.alu_reg(Alu::Nor, rd, rs, rt)?,
            Op::Slt => self.alu_reg(Alu::Slt, rd, rs, rt)?,
            Op::Sltu => self.alu_reg(Alu::Sltu, rd, rs, rt)?,

            Op::Addi | Op::Addiu => self.alu_imm(Alu::Add, rt, rs, insn.imm())?,
            Op::Slti => self.alu_imm(Alu::Slt, rt, rs, insn.imm())?,
            Op::Sltiu => self.alu_imm(Alu::Sltu, rt, rs, insn.imm())?,
            Op::Andi => self.alu_imm(Alu::And, rt, rs, insn.imm_u())?,
            Op::Ori => self.alu_imm(Alu::Or, rt, rs, insn.imm_u())?,
            Op::Xori => self.alu_imm(Alu::Xor, rt, rs, insn.imm_u())?,
            Op::Lui => self.alloc.bind_constant(&mut self.asm, rt, insn.imm_u() << 16)?,

            Op::Mfhi => self.move_from(rd, REG_HI)?,
            Op::Mflo => self.move_from(rd, REG_LO)?,
            Op::Mthi => self.move_to(REG_HI, rs)?,
            Op::Mtlo => self.move_to(REG_LO, rs)?,
            Op::Mult => self.mult(true, rs, rt)?,
            Op::Multu => self.mult(false, rs, rt)?,
            Op::Div => self.div(true, rs, rt)?,
            Op::Divu => self.div(false, rs, rt)?,

            Op::J | Op::Jal => return self.jump(op, insn),
            Op::Jr | Op::Jalr => return self.jump_register(op, insn),
            Op::Beq | Op::Bne | Op::Blez | Op::Bgtz | Op::Bltz | Op::Bgez | Op::Bltzal | Op::Bgezal => {
                return self.branch(op, insn);
            }

            Op::Syscall => return self.exception(0x20),
            Op::Break => return self.exception(0x24),
            Op::Hle => return self.hle(code),
            Op::Gte(_) => return self.gte(code),

            Op::Mfc0 | Op::Cfc0 => {
                if rt != 0 {
                    let dst = self.alloc.put(&mut self.asm, rt)?;
                    self.asm.load_state(dst, Registers::cp0_offset(rd));
                }
            }
            Op::Mtc0 | Op::Ctc0 => {
                let src = self.alloc.get(&mut self.asm, rt)?;
                self.asm.store_state(src, Registers::cp0_offset(rd));
            }
            Op::Rfe => {
                self.asm.rfe();
                if !self.in_delay_slot {
                    self.epilogue(Exit::Const(self.pc))?;
                    return Ok(Step::Ended);
                }
            }

            Op::Lb => self.load(insn, Width::Byte, true)?,
            Op::Lbu => self.load(insn, Width::Byte, false)?,
            Op::Lh => self.load(insn, Width::Half, true)?,
            Op::Lhu => self.load(insn, Width::Half, false)?,
            Op::Lw => self.load(insn, Width::Word, false)?,
            Op::Sb => self.store(insn, Width::Byte)?,
            Op::Sh => self.store(insn, Width::Half)?,
            Op::Sw => self.store(insn, Width::Word)?,

            Op::Lwl | Op::Lwr | Op::Swl | Op::Swr => self.interpret(code)?,
            Op::Mfc2 | Op::Cfc2 | Op::Mtc2 | Op::Ctc2 | Op::Lwc2 | Op::Swc2 => self.interpret(code)?,

            Op::Null => trace!("Skipping unknown opcode 0x{:08X}", code),
        }

        Ok(Step::Continue)
    }

    /// Writes every guest register back, constants included, and frees every
    /// host register that is not wired.
    pub(super) fn flush_all(&mut self) -> Result<(), Error> {
        self.alloc.flush_guest_regs(&mut self.asm)?;
        self.alloc.flush_all(&mut self.asm)
    }

    fn alu_reg(&mut self, op: Alu, rd: usize, rs: usize, rt: usize) -> Result<(), Error> {
        if rd == 0 {
            return Ok(());
        }

        let shift = matches!(op, Alu::Sllv | Alu::Srlv | Alu::Srav);
        match (self.alloc.constant(rs), self.alloc.constant(rt)) {
            (Some(a), Some(b)) => self.alloc.bind_constant(&mut self.asm, rd, fold(op, a, b)),
            (Some(a), None) => {
                let identity = if shift {
                    a & 0x1F == 0
                } else {
                    a == 0 && matches!(op, Alu::Add | Alu::Or | Alu::Xor)
                };
                if identity {
                    return self.alloc.copy(&mut self.asm, rd, rt);
                }
                if a == 0 && op == Alu::And {
                    return self.alloc.bind_constant(&mut self.asm, rd, 0);
                }

                let b = self.alloc.get(&mut self.asm, rt)?;
                let dst = self.alloc.put(&mut self.asm, rd)?;
                self.asm.alu_imm_rev(op, dst, a, b);
                Ok(())
            }
            (None, Some(b)) => {
                if b == 0 && matches!(op, Alu::Add | Alu::Sub | Alu::Or | Alu::Xor) {
                    return self.alloc.copy(&mut self.asm, rd, rs);
                }
                if b == 0 && (op == Alu::And || shift) {
                    return self.alloc.bind_constant(&mut self.asm, rd, 0);
                }

                let a = self.alloc.get(&mut self.asm, rs)?;
                let dst = self.alloc.put(&mut self.asm, rd)?;
                self.asm.alu_imm(op, dst, a, b);
                Ok(())
            }
            (None, None) => {
                let a = self.alloc.get(&mut self.asm, rs)?;
                let b = self.alloc.get(&mut self.asm, rt)?;
                let dst = self.alloc.put(&mut self.asm, rd)?;
                self.asm.alu(op, dst, a, b);
                Ok(())
            }
        }
    }

    fn alu_imm(&mut self, op: Alu, rt: usize, rs: usize, k: u32) -> Result<(), Error> {
        if rt == 0 {
            return Ok(());
        }

        if let Some(a) = self.alloc.constant(rs) {
            return self.alloc.bind_constant(&mut self.asm, rt, fold(op, a, k));
        }
        if k == 0 {
            match op {
                Alu::Add | Alu::Or | Alu::Xor => return self.alloc.copy(&mut self.asm, rt, rs),
                Alu::And => return self.alloc.bind_constant(&mut self.asm, rt, 0),
                _ => {}
            }
        }

        let a = self.alloc.get(&mut self.asm, rs)?;
        let dst = self.alloc.put(&mut self.asm, rt)?;
        self.asm.alu_imm(op, dst, a, k);
        Ok(())
    }

    fn shift_imm(&mut self, op: Shift, rd: usize, rt: usize, sa: u32) -> Result<(), Error> {
        if rd == 0 {
            return Ok(());
        }

        if let Some(value) = self.alloc.constant(rt) {
            return self.alloc.bind_constant(&mut self.asm, rd, fold_shift(op, value, sa));
        }
        if sa == 0 {
            return self.alloc.copy(&mut self.asm, rd, rt);
        }

        let src = self.alloc.get(&mut self.asm, rt)?;
        let dst = self.alloc.put(&mut self.asm, rd)?;
        self.asm.shift(op, dst, src, sa);
        Ok(())
    }

    fn move_from(&mut self, rd: usize, src: usize) -> Result<(), Error> {
        if rd == 0 {
            return Ok(());
        }
        match self.alloc.constant(src) {
            Some(k) => self.alloc.bind_constant(&mut self.asm, rd, k),
            None => self.alloc.copy(&mut self.asm, rd, src),
        }
    }

    fn move_to(&mut self, dst: usize, rs: usize) -> Result<(), Error> {
        match self.alloc.constant(rs) {
            Some(k) => self.alloc.bind_constant(&mut self.asm, dst, k),
            None => self.alloc.copy(&mut self.asm, dst, rs),
        }
    }

    fn bind_lo_hi(&mut self, lo: u32, hi: u32) -> Result<(), Error> {
        self.alloc.bind_constant(&mut self.asm, REG_LO, lo)?;
        self.alloc.bind_constant(&mut self.asm, REG_HI, hi)
    }

    fn mult(&mut self, signed: bool, rs: usize, rt: usize) -> Result<(), Error> {
        let pow2 = |k: u32| k.is_power_of_two() && (!signed || k < 0x8000_0000);

        match (self.alloc.constant(rs), self.alloc.constant(rt)) {
            (Some(a), Some(b)) => {
                let product = if signed {
                    (a as i32 as i64 * b as i32 as i64) as u64
                } else {
                    a as u64 * b as u64
                };
                self.bind_lo_hi(product as u32, (product >> 32) as u32)
            }
            (Some(0), _) | (_, Some(0)) => self.bind_lo_hi(0, 0),
            (Some(k), None) if pow2(k) => self.mult_pow2(signed, rt, k),
            (None, Some(k)) if pow2(k) => self.mult_pow2(signed, rs, k),
            _ => {
                let a = self.alloc.get(&mut self.asm, rs)?;
                let b = self.alloc.get(&mut self.asm, rt)?;
                let lo = self.alloc.put(&mut self.asm, REG_LO)?;
                let hi = self.alloc.put(&mut self.asm, REG_HI)?;
                self.asm.mul(signed, lo, hi, a, b);
                Ok(())
            }
        }
    }

    fn mult_pow2(&mut self, signed: bool, reg: usize, k: u32) -> Result<(), Error> {
        let src = self.alloc.get(&mut self.asm, reg)?;
        let lo = self.alloc.put(&mut self.asm, REG_LO)?;
        let hi = self.alloc.put(&mut self.asm, REG_HI)?;
        self.asm.mul_pow2(signed, lo, hi, src, k.trailing_zeros());
        Ok(())
    }

    fn div(&mut self, signed: bool, rs: usize, rt: usize) -> Result<(), Error> {
        let divisor = self.alloc.constant(rt);

        if let (Some(n), Some(d)) = (self.alloc.constant(rs), divisor) {
            let (lo, hi) = if signed { div_signed(n, d) } else { div_unsigned(n, d) };
            return self.bind_lo_hi(lo, hi);
        }

        let src = self.alloc.get(&mut self.asm, rs)?;
        match divisor {
            Some(d) if d.is_power_of_two() && (!signed || (2..=0x4000_0000).contains(&d)) => {
                let lo = self.alloc.put(&mut self.asm, REG_LO)?;
                let hi = self.alloc.put(&mut self.asm, REG_HI)?;
                self.asm.div_pow2(signed, lo, hi, src, d.trailing_zeros());
            }
            Some(3) => {
                let lo = self.alloc.put(&mut self.asm, REG_LO)?;
                let hi = self.alloc.put(&mut self.asm, REG_HI)?;
                self.asm.div3(signed, lo, hi, src);
            }
            _ => {
                let d = self.alloc.get(&mut self.asm, rt)?;
                let lo = self.alloc.put(&mut self.asm, REG_LO)?;
                let hi = self.alloc.put(&mut self.asm, REG_HI)?;
                self.asm.div(signed, lo, hi, src, d);
            }
        }
        Ok(())
    }

    fn load(&mut self, insn: Instruction, width: Width, signed: bool) -> Result<(), Error> {
        let (rs, rt, imm) = (insn.rs(), insn.rt(), insn.imm());

        if let Some(base) = self.alloc.constant(rs) {
            if self.direct_load(base.wrapping_add(imm), rt, width, signed)? {
                return Ok(());
            }
        }

        let helper = match width {
            Width::Byte => Helper::Read8,
            Width::Half => Helper::Read16,
            Width::Word => Helper::Read32,
        };

        self.alloc.reserve_args(1)?;
        if rs != rt {
            self.alloc.dispose(&mut self.asm, rt)?;
        }
        self.address_arg(rs, imm)?;
        if rs == rt {
            self.alloc.dispose(&mut self.asm, rt)?;
        }
        self.alloc.invalidate_volatile(&mut self.asm)?;
        self.asm.call(helper.address(), helper.args(), helper.returns());
        self.alloc.release_args(&mut self.asm)?;

        if rt == 0 {
            return Ok(());
        }

        if signed {
            let ret = self.alloc.get_special(&mut self.asm, Special::RetVal)?;
            let dst = self.alloc.put(&mut self.asm, rt)?;
            self.asm.extend(dst, ret, width, true);
            self.alloc.dispose_special(&mut self.asm, Special::RetVal)?;
        } else {
            self.alloc.set_dst(RETVAL);
            self.alloc.put(&mut self.asm, rt)?;
        }
        Ok(())
    }

    /// Emits a load from a known address when it hits ROM, RAM or the fast
    /// part of the hardware page.
    fn direct_load(&mut self, addr: u32, rt: usize, width: Width, signed: bool) -> Result<bool, Error> {
        if addr & (width.bytes() - 1) != 0 {
            return Ok(false);
        }

        let page = addr >> 16;
        if page & 0xFFF0 == 0xBFC0 {
            let Some(word) = self.bus.rom32(addr) else {
                return Ok(false);
            };
            let value = extract(word, addr, width, signed);
            trace!("Folded ROM read 0x{:08X} = 0x{:08X}", addr, value);
            self.alloc.bind_constant(&mut self.asm, rt, value)?;
            return Ok(true);
        }

        let (base, offset) = if is_ram_page(page) {
            (emitter::MEM, addr & RAM_MASK)
        } else if page == 0x1F80
            && (addr < SCRATCHPAD_END || (width == Width::Word && DIRECT_READS.contains(&addr)))
        {
            (emitter::HW, addr & 0xFFFF)
        } else {
            return Ok(false);
        };

        if rt != 0 {
            let dst = self.alloc.put(&mut self.asm, rt)?;
            self.asm.load_mem(dst, base, offset, width, signed);
        }
        Ok(true)
    }

    fn store(&mut self, insn: Instruction, width: Width) -> Result<(), Error> {
        let (rs, rt, imm) = (insn.rs(), insn.rt(), insn.imm());

        if let Some(base) = self.alloc.constant(rs) {
            if self.direct_store(base.wrapping_add(imm), rt, width)? {
                return Ok(());
            }
        }

        let helper = match width {
            Width::Byte => Helper::Write8,
            Width::Half => Helper::Write16,
            Width::Word => Helper::Write32,
        };

        self.alloc.reserve_args(2)?;
        self.address_arg(rs, imm)?;

        let arg = self.alloc.put_special(&mut self.asm, Special::Arg2)?;
        let mask = width_mask(width);
        match self.alloc.constant(rt) {
            Some(k) => self.asm.li(arg, k & mask),
            None => {
                let src = self.alloc.get(&mut self.asm, rt)?;
                if width == Width::Word {
                    self.asm.mr(arg, src);
                } else {
                    self.asm.alu_imm(Alu::And, arg, src, mask);
                }
            }
        }

        self.alloc.invalidate_volatile(&mut self.asm)?;
        self.asm.call(helper.address(), helper.args(), helper.returns());
        self.alloc.release_args(&mut self.asm)
    }

    fn direct_store(&mut self, addr: u32, rt: usize, width: Width) -> Result<bool, Error> {
        if addr & (width.bytes() - 1) != 0 {
            return Ok(false);
        }

        let page = addr >> 16;
        let (base, offset, slot) = if is_ram_page(page) {
            let offset = addr & RAM_MASK;
            let slot = self.cache.slot_ptr(0x8000_0000 | offset).unwrap_or(0);
            (emitter::MEM, offset, slot)
        } else if page == 0x1F80
            && (addr < SCRATCHPAD_END || (width == Width::Word && DIRECT_WRITES.contains(&addr)))
        {
            (emitter::HW, addr & 0xFFFF, 0)
        } else {
            return Ok(false);
        };

        let src = self.alloc.get(&mut self.asm, rt)?;
        self.asm.store_mem(src, base, offset, width, slot);
        Ok(true)
    }

    /// Computes `rs + imm` into the first argument register.
    fn address_arg(&mut self, rs: usize, imm: u32) -> Result<(), Error> {
        let arg = self.alloc.put_special(&mut self.asm, Special::Arg1)?;
        match self.alloc.constant(rs) {
            Some(base) => self.asm.li(arg, base.wrapping_add(imm)),
            None => {
                let base = self.alloc.get(&mut self.asm, rs)?;
                self.asm.alu_imm(Alu::Add, arg, base, imm);
            }
        }
        Ok(())
    }

    /// Hands control to a runtime helper that may look at or change the
    /// whole register file. The guest pc is stored first.
    pub(super) fn call_out(&mut self, helper: Helper, pc: u32, args: &[u32]) -> Result<(), Error> {
        let dst = self.alloc.put_special(&mut self.asm, Special::Pc)?;
        self.asm.li(dst, pc);
        self.flush_all()?;

        self.alloc.reserve_args(args.len())?;
        for (n, &value) in args.iter().enumerate() {
            let arg = self.alloc.put_special(&mut self.asm, ARGS[n])?;
            self.asm.li(arg, value);
        }

        self.alloc.invalidate_volatile(&mut self.asm)?;
        self.asm.call(helper.address(), helper.args(), helper.returns());
        self.alloc.release_args(&mut self.asm)
    }

    fn exception(&mut self, cause: u32) -> Result<Step, Error> {
        let in_delay_slot = self.in_delay_slot as u32;
        self.call_out(Helper::Exception, self.pc.wrapping_sub(4), &[cause, in_delay_slot])?;
        self.epilogue(Exit::Keep)?;
        Ok(Step::Ended)
    }

    fn hle(&mut self, code: u32) -> Result<Step, Error> {
        self.call_out(Helper::Hle, self.pc, &[code])?;
        self.epilogue(Exit::Keep)?;
        Ok(Step::Ended)
    }

    fn gte(&mut self, code: u32) -> Result<Step, Error> {
        self.call_out(Helper::Gte, self.pc, &[code])?;
        if self.in_delay_slot {
            return Ok(Step::Continue);
        }
        self.epilogue(Exit::Const(self.pc))?;
        Ok(Step::Ended)
    }

    fn interpret(&mut self, code: u32) -> Result<(), Error> {
        self.call_out(Helper::Interpret, self.pc, &[code])
    }
}
