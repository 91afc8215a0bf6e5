/*
    Branch, jump and delay slot resolution
*/

use tracing::{trace, warn};

use crate::Error;
use crate::r3000a::jit::Helper;
use crate::r3000a::jit::emitter::{self, Alu, Cond, HostFile};
use crate::r3000a::jit::regalloc::{Allocator, Special};
use crate::r3000a::jit::translate::{Step, Translator};
use crate::r3000a::opcodes::{Instruction, Op};

/// How a block exit sets the guest pc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Const(u32),
    /// The target was saved in the `Target` special.
    Dynamic,
    /// A helper already stored the pc.
    Keep,
}

/// Where a branch goes once it is taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dest {
    Const(u32),
    Target,
}

/// Translation state both sides of a conditional branch start from.
struct PathState {
    alloc: Allocator,
    regs: HostFile,
    pc: u32,
    count: u32,
}

fn evaluate(cond: Cond, a: u32, b: u32) -> bool {
    let a_signed = a as i32;
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Ltz => a_signed < 0,
        Cond::Gez => a_signed >= 0,
        Cond::Lez => a_signed <= 0,
        Cond::Gtz => a_signed > 0,
    }
}

impl Translator<'_, '_> {
    /// Flushes the guest state, charges the block's cycles and returns the
    /// next compiled block, if the interrupt test leaves one to run.
    pub(super) fn epilogue(&mut self, exit: Exit) -> Result<(), Error> {
        match exit {
            Exit::Const(target) => {
                let pc = self.alloc.put_special(&mut self.asm, Special::Pc)?;
                self.asm.li(pc, target);
            }
            Exit::Dynamic => {
                let target = self.alloc.get_special(&mut self.asm, Special::Target)?;
                let pc = self.alloc.put_special(&mut self.asm, Special::Pc)?;
                self.asm.mr(pc, target);
            }
            Exit::Keep => {}
        }

        self.charge_cycles()?;
        self.flush_all()?;
        self.ret_link(Helper::BranchTest)
    }

    fn charge_cycles(&mut self) -> Result<(), Error> {
        let count = self.alloc.get_special(&mut self.asm, Special::CycleCount)?;
        let dst = self.alloc.put_special(&mut self.asm, Special::CycleCount)?;
        self.asm.alu_imm(Alu::Sub, dst, count, self.count);
        Ok(())
    }

    fn ret_link(&mut self, helper: Helper) -> Result<(), Error> {
        let next = self
            .asm
            .call(helper.address(), helper.args(), helper.returns())
            .ok_or_else(|| Error::Codegen(format!("{:?} returns nothing to link", helper)))?;
        self.asm.ret(next);
        Ok(())
    }

    fn save(&self) -> PathState {
        PathState {
            alloc: self.alloc.snapshot(),
            regs: self.asm.regs(),
            pc: self.pc,
            count: self.count,
        }
    }

    fn restore(&mut self, state: PathState) {
        self.alloc.restore(state.alloc);
        self.asm.restore_regs(state.regs);
        self.pc = state.pc;
        self.count = state.count;
    }

    /// Reads the delay slot word and the register it loads, if any.
    fn peek_delay_slot(&self) -> Result<(u32, Option<usize>), Error> {
        let code = self.bus.fetch(self.pc).ok_or(Error::UnmappedCode(self.pc))?;
        let insn = Instruction(code);
        Ok((code, Op::decode(insn).load_target(insn)))
    }

    fn delay_slot(&mut self) -> Result<Step, Error> {
        let pc = self.pc;
        let code = self.bus.fetch(pc).ok_or(Error::UnmappedCode(pc))?;
        self.pc = pc.wrapping_add(4);
        self.count += 1;

        if Op::decode(Instruction(code)).is_branch() {
            warn!("Ignoring branch 0x{:08X} in the delay slot at 0x{:08X}", code, pc);
            return Ok(Step::Continue);
        }

        self.in_delay_slot = true;
        let step = self.instruction(code);
        self.in_delay_slot = false;
        step
    }

    /// Runs the delay slot and leaves the block towards `dest`. A delay slot
    /// that loads one of the branch inputs is handed to the interpreter.
    fn resolve(&mut self, dest: Dest, hazard: Option<(u32, usize)>) -> Result<(), Error> {
        if let Some((code, reg)) = hazard {
            return self.delay_test_exit(code, reg, dest);
        }

        if self.delay_slot()? == Step::Ended {
            return Ok(());
        }

        match dest {
            Dest::Const(target) => self.epilogue(Exit::Const(target)),
            Dest::Target => self.epilogue(Exit::Dynamic),
        }
    }

    fn delay_test_exit(&mut self, code: u32, reg: usize, dest: Dest) -> Result<(), Error> {
        trace!("Load delay on r{} in the delay slot at 0x{:08X}", reg, self.pc);
        self.pc = self.pc.wrapping_add(4);
        self.count += 1;
        self.charge_cycles()?;

        let pc = self.alloc.put_special(&mut self.asm, Special::Pc)?;
        self.asm.li(pc, self.pc);

        self.alloc.reserve_args(3)?;
        let arg = self.alloc.put_special(&mut self.asm, Special::Arg1)?;
        self.asm.li(arg, code);
        let arg = self.alloc.put_special(&mut self.asm, Special::Arg2)?;
        self.asm.li(arg, reg as u32);
        match dest {
            Dest::Const(target) => {
                let arg = self.alloc.put_special(&mut self.asm, Special::Arg3)?;
                self.asm.li(arg, target);
            }
            Dest::Target => {
                let target = self.alloc.get_special(&mut self.asm, Special::Target)?;
                let arg = self.alloc.put_special(&mut self.asm, Special::Arg3)?;
                self.asm.mr(arg, target);
            }
        }

        self.flush_all()?;
        self.ret_link(Helper::DelayTest)
    }

    pub(super) fn jump(&mut self, op: Op, insn: Instruction) -> Result<Step, Error> {
        let branch_pc = self.pc.wrapping_sub(4);
        if op == Op::Jal {
            self.alloc.bind_constant(&mut self.asm, 31, branch_pc.wrapping_add(8))?;
        }
        self.resolve(Dest::Const(insn.jump_target(branch_pc)), None)?;
        Ok(Step::Ended)
    }

    pub(super) fn jump_register(&mut self, op: Op, insn: Instruction) -> Result<Step, Error> {
        let branch_pc = self.pc.wrapping_sub(4);
        let rs = insn.rs();
        let (code, load) = self.peek_delay_slot()?;
        let hazard = load.filter(|&reg| reg == rs).map(|reg| (code, reg));

        let dest = match self.alloc.constant(rs) {
            Some(target) => Dest::Const(target),
            None => {
                let src = self.alloc.get(&mut self.asm, rs)?;
                let dst = self.alloc.put_special(&mut self.asm, Special::Target)?;
                self.asm.mr(dst, src);
                Dest::Target
            }
        };

        if op == Op::Jalr && insn.rd() != 0 {
            self.alloc.bind_constant(&mut self.asm, insn.rd(), branch_pc.wrapping_add(8))?;
        }

        self.resolve(dest, hazard)?;
        Ok(Step::Ended)
    }

    pub(super) fn branch(&mut self, op: Op, insn: Instruction) -> Result<Step, Error> {
        let (cond, link) = match op {
            Op::Beq => (Cond::Eq, false),
            Op::Bne => (Cond::Ne, false),
            Op::Blez => (Cond::Lez, false),
            Op::Bgtz => (Cond::Gtz, false),
            Op::Bltz => (Cond::Ltz, false),
            Op::Bgez => (Cond::Gez, false),
            Op::Bltzal => (Cond::Ltz, true),
            Op::Bgezal => (Cond::Gez, true),
            _ => return Err(Error::Codegen(format!("{:?} is not a conditional branch", op))),
        };

        let branch_pc = self.pc.wrapping_sub(4);
        let taken_pc = insn.branch_target(branch_pc);
        let next_pc = branch_pc.wrapping_add(8);

        let (rs, rt) = (insn.rs(), insn.rt());
        let two_operands = matches!(cond, Cond::Eq | Cond::Ne);

        let (code, load) = self.peek_delay_slot()?;
        let hazard = load
            .filter(|&reg| reg == rs || (two_operands && reg == rt))
            .map(|reg| (code, reg));

        let a = self.alloc.constant(rs);
        let b = if two_operands { self.alloc.constant(rt) } else { Some(0) };
        if let (Some(a), Some(b)) = (a, b) {
            let taken = evaluate(cond, a, b);
            trace!("Branch at 0x{:08X} folded, taken: {}", branch_pc, taken);
            if taken && link {
                self.alloc.bind_constant(&mut self.asm, 31, next_pc)?;
            }
            let target = if taken { taken_pc } else { next_pc };
            self.resolve(Dest::Const(target), hazard)?;
            return Ok(Step::Ended);
        }

        let a = self.alloc.get(&mut self.asm, rs)?;
        let b = if two_operands {
            self.alloc.get(&mut self.asm, rt)?
        } else {
            emitter::ZERO
        };

        let (taken, not_taken) = self.asm.fork(cond, a, b);
        let state = self.save();

        self.asm.switch_to(taken);
        if link {
            self.alloc.bind_constant(&mut self.asm, 31, next_pc)?;
        }
        self.resolve(Dest::Const(taken_pc), hazard)?;

        self.restore(state);
        self.asm.switch_to(not_taken);
        self.resolve(Dest::Const(next_pc), hazard)?;

        Ok(Step::Ended)
    }
}
