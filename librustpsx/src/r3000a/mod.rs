/*
    MIPS R3000A PlayStation CPU
*/

use std::mem::offset_of;

use crate::Bus;
use crate::bus::{I_MASK, I_STAT};
use crate::cpu::CPU;

pub mod opcodes;
pub mod interpreter;
pub mod jit;

#[cfg(test)]
mod test;

pub use interpreter::Interpreter;
pub use jit::JIT;

use tracing::{info, trace, warn};

pub const RESET_VECTOR: u32 = 0xBFC0_0000;

pub const REG_LO: usize = 32;
pub const REG_HI: usize = 33;

// System control (COP0) register indices
pub const STATUS: usize = 12;
pub const CAUSE: usize = 13;
pub const EPC: usize = 14;
pub const PRID: usize = 15;

pub const STATUS_ISC: u32 = 1 << 16;
pub const STATUS_BEV: u32 = 1 << 22;

// Cycles between two scheduler events when nothing else is pending
pub const EVENT_CYCLES: i32 = 0x1000;

// Upper bound on the instructions making up one block
pub const MAX_BLOCK_INSNS: u32 = 500;

// Extra cycles charged for half-word reads of the SPU and root counter registers
pub const IO_STALL_CYCLES: i32 = 4;

/// The guest register file. Compiled blocks address the fields directly, so the
/// layout is fixed.
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registers {
    pub gpr: [u32; 34],
    pub cp0: [u32; 32],
    pub cp2d: [u32; 32],
    pub cp2c: [u32; 32],
    pub pc: u32,
    pub code: u32,
    pub delay_slot: u32,
    pub evt_cycle_duration: i32,
    pub evt_cycle_countdown: i32,
    pub target: u32,
    pub cycle: u64,
}

impl Registers {
    pub fn new() -> Self {
        Registers {
            gpr: [0; 34],
            cp0: [0; 32],
            cp2d: [0; 32],
            cp2c: [0; 32],
            pc: RESET_VECTOR,
            code: 0,
            delay_slot: 0,
            evt_cycle_duration: EVENT_CYCLES,
            evt_cycle_countdown: EVENT_CYCLES,
            target: 0,
            cycle: 0,
        }
    }

    pub const fn gpr_offset(reg: usize) -> i32 {
        (offset_of!(Registers, gpr) + reg * 4) as i32
    }

    pub const fn cp0_offset(reg: usize) -> i32 {
        (offset_of!(Registers, cp0) + reg * 4) as i32
    }

    pub const fn pc_offset() -> i32 {
        offset_of!(Registers, pc) as i32
    }

    pub const fn countdown_offset() -> i32 {
        offset_of!(Registers, evt_cycle_countdown) as i32
    }

    pub const fn target_offset() -> i32 {
        offset_of!(Registers, target) as i32
    }

    /// Enters the exception vector. `pc` must hold the address of the
    /// faulting instruction.
    pub fn exception(&mut self, cause: u32, in_delay_slot: bool) {
        self.cp0[CAUSE] = cause;

        if in_delay_slot {
            self.cp0[CAUSE] |= 0x8000_0000;
            self.cp0[EPC] = self.pc.wrapping_sub(4);
        } else {
            self.cp0[EPC] = self.pc;
        }

        self.pc = if self.cp0[STATUS] & STATUS_BEV != 0 {
            0xBFC0_0180
        } else {
            0x8000_0080
        };

        // Push the KU/IE stack
        let status = self.cp0[STATUS];
        self.cp0[STATUS] = (status & !0x3F) | ((status & 0xF) << 2);
        trace!("Exception 0x{:08X} taken, EPC 0x{:08X}", cause, self.cp0[EPC]);
    }

    pub fn rfe(&mut self) {
        let status = self.cp0[STATUS];
        self.cp0[STATUS] = (status & !0xF) | ((status & 0x3C) >> 2);
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new()
    }
}

/// Collaborators outside the CPU core: the interrupt controller test run at
/// every block boundary, the BIOS call stubs and the geometry coprocessor.
pub trait Hooks {
    fn branch_test(&mut self, regs: &mut Registers, bus: &mut Bus) {
        let pending = bus.read32(I_STAT) & bus.read32(I_MASK);
        if pending != 0 && regs.cp0[STATUS] & 0x401 == 0x401 {
            trace!("Interrupt pending 0x{:03X}", pending);
            regs.exception(0x400, false);
        }
    }

    fn hle(&mut self, index: u32, regs: &mut Registers, _bus: &mut Bus) {
        warn!("Unhandled HLE call {} at 0x{:08X}", index, regs.pc);
        regs.pc = regs.gpr[31];
    }

    fn gte(&mut self, code: u32, _regs: &mut Registers) {
        trace!("Unhandled GTE op 0x{:08X}", code);
    }
}

pub struct DefaultHooks;

impl Hooks for DefaultHooks {}

pub struct R3000A {
    pub regs: Registers,
    pub bus: Bus,
    pub hooks: Box<dyn Hooks>,
}

impl R3000A {
    pub fn new(bus: Bus) -> Self {
        R3000A::with_hooks(bus, Box::new(DefaultHooks))
    }

    pub fn with_hooks(bus: Bus, hooks: Box<dyn Hooks>) -> Self {
        let mut cpu = R3000A {
            regs: Registers::new(),
            bus,
            hooks,
        };
        cpu.reset();
        cpu
    }

    pub fn reset(&mut self) {
        info!("Resetting R3000A");
        self.bus.reset();
        self.regs = Registers::new();
        self.regs.cp0[STATUS] = 0x1090_0000;
        self.regs.cp0[PRID] = 0x0000_0002;
    }

    pub fn read8(&self, addr: u32) -> u8 {
        self.bus.read8(addr)
    }

    pub fn read16(&mut self, addr: u32) -> u16 {
        if io_stalls(addr) {
            self.regs.evt_cycle_countdown -= IO_STALL_CYCLES;
        }
        self.bus.read16(addr)
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        if self.regs.cp0[STATUS] & STATUS_ISC == 0 {
            self.bus.write8(addr, value);
        }
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        if self.regs.cp0[STATUS] & STATUS_ISC == 0 {
            self.bus.write16(addr, value);
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        if self.regs.cp0[STATUS] & STATUS_ISC == 0 {
            self.bus.write32(addr, value);
        }
    }

    /// Reloads the event countdown once it expires and lets the interrupt
    /// controller raise a pending interrupt.
    pub fn branch_test(&mut self) {
        if self.regs.evt_cycle_countdown <= 0 {
            let elapsed = self.regs.evt_cycle_duration - self.regs.evt_cycle_countdown;
            self.regs.cycle += elapsed as u64;
            self.regs.evt_cycle_countdown = self.regs.evt_cycle_duration;
        }
        self.hooks.branch_test(&mut self.regs, &mut self.bus);
    }

    pub fn elapsed_cycles(&self) -> u64 {
        let pending = self.regs.evt_cycle_duration - self.regs.evt_cycle_countdown;
        (self.regs.cycle as i64 + pending as i64) as u64
    }
}

pub(crate) fn io_stalls(addr: u32) -> bool {
    let phys = addr & 0x1FFF_FFFF;
    (0x1F80_1C00..0x1F80_1E00).contains(&phys) || (0x1F80_1100..0x1F80_1130).contains(&phys)
}

impl CPU for R3000A {
    type RegisterType = u32;

    fn pc(&self) -> u32 {
        self.regs.pc
    }

    fn set_pc(&mut self, value: u32) {
        self.regs.pc = value;
    }

    fn read_register(&self, index: usize) -> Self::RegisterType {
        self.regs.gpr[index]
    }

    fn write_register(&mut self, index: usize, value: Self::RegisterType) {
        if index != 0 {
            self.regs.gpr[index] = value;
        }
    }

    fn read_cop0_register(&self, index: usize) -> u32 {
        self.regs.cp0[index]
    }

    fn write_cop0_register(&mut self, index: usize, value: u32) {
        self.regs.cp0[index] = value;
    }

    fn read32(&self, addr: u32) -> u32 {
        self.bus.read32(addr)
    }

    #[inline(always)]
    fn fetch(&self) -> Option<u32> {
        self.fetch_at(self.regs.pc)
    }

    fn fetch_at(&self, addr: u32) -> Option<u32> {
        self.bus.fetch(addr)
    }
}
