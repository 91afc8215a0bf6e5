use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Error;
use crate::cpu::{CPU, EmulationBackend};
use crate::r3000a::opcodes::{Instruction, Op};
use crate::r3000a::{MAX_BLOCK_INSNS, R3000A, REG_HI, REG_LO};
use tracing::{info, trace, warn};

/// What the caller has to do after an instruction executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Next,
    /// Run the delay slot, then continue at the given address.
    Branch(u32),
    /// An exception or BIOS call redirected the pc.
    Trap,
    /// The instruction ends the block.
    End,
}

const LWL_MASK: [u32; 4] = [0x00FF_FFFF, 0x0000_FFFF, 0x0000_00FF, 0x0000_0000];
const LWL_SHIFT: [u32; 4] = [24, 16, 8, 0];
const LWR_MASK: [u32; 4] = [0x0000_0000, 0xFF00_0000, 0xFFFF_0000, 0xFFFF_FF00];
const LWR_SHIFT: [u32; 4] = [0, 8, 16, 24];
const SWL_MASK: [u32; 4] = [0xFFFF_FF00, 0xFFFF_0000, 0xFF00_0000, 0x0000_0000];
const SWL_SHIFT: [u32; 4] = [24, 16, 8, 0];
const SWR_MASK: [u32; 4] = [0x0000_0000, 0x0000_00FF, 0x0000_FFFF, 0x00FF_FFFF];
const SWR_SHIFT: [u32; 4] = [0, 8, 16, 24];

/// R3000A signed division, returning (LO, HI).
pub(crate) fn div_signed(n: u32, d: u32) -> (u32, u32) {
    let (n, d) = (n as i32, d as i32);
    if d == 0 {
        (if n >= 0 { 0xFFFF_FFFF } else { 1 }, n as u32)
    } else if n == i32::MIN && d == -1 {
        (i32::MIN as u32, 0)
    } else {
        ((n / d) as u32, (n % d) as u32)
    }
}

/// R3000A unsigned division, returning (LO, HI).
pub(crate) fn div_unsigned(n: u32, d: u32) -> (u32, u32) {
    if d == 0 {
        (0xFFFF_FFFF, n)
    } else {
        (n / d, n % d)
    }
}

impl R3000A {
    #[inline(always)]
    fn set(&mut self, reg: usize, value: u32) {
        if reg != 0 {
            self.regs.gpr[reg] = value;
        }
    }

    /// Executes one instruction word. `regs.pc` already points past it.
    pub fn execute(&mut self, code: u32) -> Flow {
        let insn = Instruction(code);
        let op = Op::decode(insn);
        let rs = self.regs.gpr[insn.rs()];
        let rt = self.regs.gpr[insn.rt()];
        let pc = self.regs.pc;
        let branch_pc = pc.wrapping_sub(4);
        let addr = rs.wrapping_add(insn.imm());
        let in_delay_slot = self.regs.delay_slot != 0;

        let taken = |cond: bool| {
            if cond {
                Flow::Branch(insn.branch_target(branch_pc))
            } else {
                Flow::Branch(pc.wrapping_add(4))
            }
        };

        match op {
            Op::Sll => self.set(insn.rd(), rt << insn.sa()),
            Op::Srl => self.set(insn.rd(), rt >> insn.sa()),
            Op::Sra => self.set(insn.rd(), ((rt as i32) >> insn.sa()) as u32),
            Op::Sllv => self.set(insn.rd(), rt << (rs & 0x1F)),
            Op::Srlv => self.set(insn.rd(), rt >> (rs & 0x1F)),
            Op::Srav => self.set(insn.rd(), ((rt as i32) >> (rs & 0x1F)) as u32),
            Op::Jr => return Flow::Branch(rs),
            Op::Jalr => {
                self.set(insn.rd(), pc.wrapping_add(4));
                return Flow::Branch(rs);
            }
            Op::Syscall | Op::Break => {
                let cause = if op == Op::Syscall { 0x20 } else { 0x24 };
                self.regs.pc = branch_pc;
                self.regs.exception(cause, in_delay_slot);
                return Flow::Trap;
            }
            Op::Mfhi => self.set(insn.rd(), self.regs.gpr[REG_HI]),
            Op::Mthi => self.regs.gpr[REG_HI] = rs,
            Op::Mflo => self.set(insn.rd(), self.regs.gpr[REG_LO]),
            Op::Mtlo => self.regs.gpr[REG_LO] = rs,
            Op::Mult => {
                let product = (rs as i32 as i64) * (rt as i32 as i64);
                self.regs.gpr[REG_LO] = product as u32;
                self.regs.gpr[REG_HI] = (product >> 32) as u32;
            }
            Op::Multu => {
                let product = (rs as u64) * (rt as u64);
                self.regs.gpr[REG_LO] = product as u32;
                self.regs.gpr[REG_HI] = (product >> 32) as u32;
            }
            Op::Div => {
                let (lo, hi) = div_signed(rs, rt);
                self.regs.gpr[REG_LO] = lo;
                self.regs.gpr[REG_HI] = hi;
            }
            Op::Divu => {
                let (lo, hi) = div_unsigned(rs, rt);
                self.regs.gpr[REG_LO] = lo;
                self.regs.gpr[REG_HI] = hi;
            }
            Op::Add | Op::Addu => self.set(insn.rd(), rs.wrapping_add(rt)),
            Op::Sub | Op::Subu => self.set(insn.rd(), rs.wrapping_sub(rt)),
            Op::And => self.set(insn.rd(), rs & rt),
            Op::Or => self.set(insn.rd(), rs | rt),
            Op::Xor => self.set(insn.rd(), rs ^ rt),
            Op::Nor => self.set(insn.rd(), !(rs | rt)),
            Op::Slt => self.set(insn.rd(), ((rs as i32) < (rt as i32)) as u32),
            Op::Sltu => self.set(insn.rd(), (rs < rt) as u32),

            Op::Bltz => return taken((rs as i32) < 0),
            Op::Bgez => return taken((rs as i32) >= 0),
            Op::Bltzal | Op::Bgezal => {
                let cond = if op == Op::Bltzal { (rs as i32) < 0 } else { (rs as i32) >= 0 };
                if cond {
                    self.regs.gpr[31] = pc.wrapping_add(4);
                }
                return taken(cond);
            }
            Op::J => return Flow::Branch(insn.jump_target(branch_pc)),
            Op::Jal => {
                self.regs.gpr[31] = pc.wrapping_add(4);
                return Flow::Branch(insn.jump_target(branch_pc));
            }
            Op::Beq => return taken(rs == rt),
            Op::Bne => return taken(rs != rt),
            Op::Blez => return taken((rs as i32) <= 0),
            Op::Bgtz => return taken((rs as i32) > 0),

            Op::Addi | Op::Addiu => self.set(insn.rt(), rs.wrapping_add(insn.imm())),
            Op::Slti => self.set(insn.rt(), ((rs as i32) < (insn.imm() as i32)) as u32),
            Op::Sltiu => self.set(insn.rt(), (rs < insn.imm()) as u32),
            Op::Andi => self.set(insn.rt(), rs & insn.imm_u()),
            Op::Ori => self.set(insn.rt(), rs | insn.imm_u()),
            Op::Xori => self.set(insn.rt(), rs ^ insn.imm_u()),
            Op::Lui => self.set(insn.rt(), insn.imm_u() << 16),

            Op::Mfc0 | Op::Cfc0 => self.set(insn.rt(), self.regs.cp0[insn.rd()]),
            Op::Mtc0 | Op::Ctc0 => self.regs.cp0[insn.rd()] = rt,
            Op::Rfe => {
                self.regs.rfe();
                if !in_delay_slot {
                    return Flow::End;
                }
            }

            Op::Mfc2 => self.set(insn.rt(), self.regs.cp2d[insn.rd()]),
            Op::Cfc2 => self.set(insn.rt(), self.regs.cp2c[insn.rd()]),
            Op::Mtc2 => self.regs.cp2d[insn.rd()] = rt,
            Op::Ctc2 => self.regs.cp2c[insn.rd()] = rt,
            Op::Gte(_) => {
                self.hooks.gte(code, &mut self.regs);
                if !in_delay_slot {
                    return Flow::End;
                }
            }

            Op::Hle => {
                self.hooks.hle(code & 0xFFFF, &mut self.regs, &mut self.bus);
                return Flow::Trap;
            }

            Op::Lb => {
                let value = self.read8(addr) as i8 as u32;
                self.set(insn.rt(), value);
            }
            Op::Lh => {
                let value = self.read16(addr) as i16 as u32;
                self.set(insn.rt(), value);
            }
            Op::Lw => {
                let value = self.read32(addr);
                self.set(insn.rt(), value);
            }
            Op::Lbu => {
                let value = self.read8(addr) as u32;
                self.set(insn.rt(), value);
            }
            Op::Lhu => {
                let value = self.read16(addr) as u32;
                self.set(insn.rt(), value);
            }
            Op::Lwl => {
                let shift = (addr & 3) as usize;
                let mem = self.read32(addr & !3);
                self.set(insn.rt(), (rt & LWL_MASK[shift]) | (mem << LWL_SHIFT[shift]));
            }
            Op::Lwr => {
                let shift = (addr & 3) as usize;
                let mem = self.read32(addr & !3);
                self.set(insn.rt(), (rt & LWR_MASK[shift]) | (mem >> LWR_SHIFT[shift]));
            }
            Op::Sb => self.write8(addr, rt as u8),
            Op::Sh => self.write16(addr, rt as u16),
            Op::Sw => self.write32(addr, rt),
            Op::Swl => {
                let shift = (addr & 3) as usize;
                let mem = self.read32(addr & !3);
                self.write32(addr & !3, (mem & SWL_MASK[shift]) | (rt >> SWL_SHIFT[shift]));
            }
            Op::Swr => {
                let shift = (addr & 3) as usize;
                let mem = self.read32(addr & !3);
                self.write32(addr & !3, (mem & SWR_MASK[shift]) | (rt << SWR_SHIFT[shift]));
            }
            Op::Lwc2 => self.regs.cp2d[insn.rt()] = self.read32(addr),
            Op::Swc2 => self.write32(addr, self.regs.cp2d[insn.rt()]),

            Op::Null => trace!("Skipping unknown opcode 0x{:08X} at 0x{:08X}", code, branch_pc),
        }

        Flow::Next
    }

    fn fetch_next(&mut self) -> Result<u32, Error> {
        let pc = self.regs.pc;
        let code = self.fetch_at(pc).ok_or(Error::UnmappedCode(pc))?;
        self.regs.code = code;
        self.regs.pc = pc.wrapping_add(4);
        self.regs.evt_cycle_countdown -= 1;
        Ok(code)
    }

    pub fn step_instruction(&mut self) -> Result<Flow, Error> {
        let code = self.fetch_next()?;
        Ok(self.execute(code))
    }

    /// Executes the delay slot of a branch, resolves the branch and runs the
    /// block boundary test.
    pub fn run_delay_slot(&mut self, target: u32) -> Result<(), Error> {
        let code = self.fetch_next()?;

        self.regs.delay_slot = 1;
        let flow = if Op::decode(Instruction(code)).is_branch() {
            warn!("Ignoring branch 0x{:08X} in a delay slot", code);
            Flow::Next
        } else {
            self.execute(code)
        };
        self.regs.delay_slot = 0;

        if flow != Flow::Trap {
            self.regs.pc = target;
        }
        self.branch_test();
        Ok(())
    }

    /// Resolves a branch whose delay slot loads one of the branch inputs.
    /// `regs.code` holds the delay slot word.
    pub fn delay_test(&mut self, reg: u32, target: u32) {
        trace!("Delay test on r{} towards 0x{:08X}", reg, target);
        self.regs.delay_slot = 1;
        let flow = self.execute(self.regs.code);
        self.regs.delay_slot = 0;

        if flow != Flow::Trap {
            self.regs.pc = target;
        }
        self.branch_test();
    }
}

pub struct Interpreter {
    pub cpu: R3000A,
    stop: Arc<AtomicBool>,
}

impl Interpreter {
    pub fn new(cpu: R3000A) -> Self {
        Interpreter {
            cpu,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }
}

impl EmulationBackend<R3000A> for Interpreter {
    fn cpu(&mut self) -> &mut R3000A {
        &mut self.cpu
    }

    fn reset(&mut self) {
        self.cpu.reset();
    }

    fn step(&mut self) -> Result<(), Error> {
        for _ in 0..MAX_BLOCK_INSNS {
            match self.cpu.step_instruction()? {
                Flow::Next => {}
                Flow::Branch(target) => return self.cpu.run_delay_slot(target),
                Flow::Trap | Flow::End => {
                    self.cpu.branch_test();
                    return Ok(());
                }
            }
        }

        self.cpu.branch_test();
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        while !self.stop.load(Ordering::Relaxed) {
            self.step()?;
        }
        Ok(())
    }

    fn run_for_cycles(&mut self, cycles: u64) -> Result<(), Error> {
        let end = self.cpu.elapsed_cycles() + cycles;
        while self.cpu.elapsed_cycles() < end && !self.stop.load(Ordering::Relaxed) {
            self.step()?;
        }
        Ok(())
    }

    fn clear(&mut self, _addr: u32, _size: u32) {}

    fn shutdown(&mut self) {
        info!("Interpreter shut down at pc 0x{:08X}", self.cpu.pc());
        self.stop.store(true, Ordering::Relaxed);
    }
}
