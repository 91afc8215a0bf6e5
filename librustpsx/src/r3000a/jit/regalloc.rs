/*
    Host register allocation for the recompiler
*/

use bitflags::bitflags;
use tracing::trace;

use crate::Error;
use crate::r3000a::Registers;
use crate::r3000a::jit::emitter::{self, ARG_BASE, CALLER_SAVED_LIMIT, Emitter, RETVAL};

pub const NUM_GUEST_REGS: usize = 34;

// Allocation order. Codes 3 and up are volatile across helper calls
pub const HOST_CODES: [usize; 28] = [
    31, 30, 29, 28, 27, 26, 25, 24, 23, 22, 21, 20, 19, 18, 17, 16, 15, 14,
    12, 11, 10, 9, 8, 7, 6, 5, 4, 3,
];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Usage: u32 {
        const READ      = 0x001;
        const WRITE     = 0x002;
        const CONST     = 0x004;
        /// Holds an argument of the next helper call
        const ARG       = 0x008;
        /// Never picked for a new mapping
        const RESERVED  = 0x010;
        const SPECIAL   = 0x020;
        /// Keeps its mapping across flushes
        const HARDWIRED = 0x040;
        const INITED    = 0x080;
        const PSXREG    = 0x100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Special {
    Arg1,
    Arg2,
    Arg3,
    Regs,
    Mem,
    Hw,
    Runtime,
    CycleCount,
    Pc,
    Target,
    RetVal,
    ReadZero,
    WriteZero,
}

impl Special {
    fn arg_index(self) -> Option<usize> {
        match self {
            Special::Arg1 => Some(0),
            Special::Arg2 => Some(1),
            Special::Arg3 => Some(2),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Free,
    Guest(usize),
    Special(Special),
}

/// Write-back performed when a host register is flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flush {
    Guest,
    Special,
}

#[derive(Clone, Copy, Debug)]
pub struct HostReg {
    pub code: usize,
    pub usage: Usage,
    pub last_used: u64,
    pub binding: Binding,
    pub flush: Option<Flush>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestReg {
    pub constant: Option<u32>,
    pub host: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Allocator {
    host: [HostReg; HOST_CODES.len()],
    guest: [GuestReg; NUM_GUEST_REGS],
    clock: u64,
    hint: Option<usize>,
}

fn invariant(message: String) -> Error {
    Error::Allocator(message)
}

impl Allocator {
    pub fn new() -> Self {
        let mut host = HOST_CODES.map(|code| HostReg {
            code,
            usage: Usage::empty(),
            last_used: 0,
            binding: Binding::Free,
            flush: None,
        });

        let wired = [
            (emitter::REGS, Special::Regs),
            (emitter::MEM, Special::Mem),
            (emitter::HW, Special::Hw),
            (emitter::RUNTIME, Special::Runtime),
            (emitter::ZERO, Special::ReadZero),
        ];
        for (code, which) in wired {
            if let Some(reg) = host.iter_mut().find(|reg| reg.code == code) {
                reg.usage = Usage::SPECIAL | Usage::RESERVED | Usage::HARDWIRED;
                reg.binding = Binding::Special(which);
            }
        }

        let mut guest = [GuestReg::default(); NUM_GUEST_REGS];
        guest[0].constant = Some(0);

        Allocator {
            host,
            guest,
            clock: 0,
            hint: None,
        }
    }

    pub fn snapshot(&self) -> Allocator {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: Allocator) {
        *self = snapshot;
    }

    pub fn constant(&self, reg: usize) -> Option<u32> {
        self.guest[reg].constant
    }

    pub fn is_mapped(&self, reg: usize) -> bool {
        self.guest[reg].host.is_some()
    }

    /// Requests a specific host code for the next new mapping.
    pub fn set_dst(&mut self, code: usize) {
        self.hint = Some(code);
    }

    fn index_of_code(&self, code: usize) -> Result<usize, Error> {
        self.host
            .iter()
            .position(|reg| reg.code == code)
            .ok_or_else(|| invariant(format!("no host register has code {}", code)))
    }

    fn special_index(&self, which: Special) -> Option<usize> {
        self.host.iter().position(|reg| {
            reg.usage.contains(Usage::SPECIAL) && reg.binding == Binding::Special(which)
        })
    }

    fn touch(&mut self, index: usize, usage: Usage) -> usize {
        self.clock += 1;
        let reg = &mut self.host[index];
        reg.last_used = self.clock;
        if usage.contains(Usage::WRITE) {
            reg.usage.remove(Usage::CONST);
        }
        if !usage.contains(Usage::INITED) {
            reg.usage.remove(Usage::INITED);
        }
        reg.usage |= usage;
        reg.code
    }

    fn pick_victim(&self) -> Result<usize, Error> {
        let blocked = Usage::RESERVED | Usage::HARDWIRED | Usage::ARG;
        let candidates = || {
            self.host
                .iter()
                .enumerate()
                .filter(move |(_, reg)| !reg.usage.intersects(blocked))
        };

        candidates()
            .filter(|(_, reg)| reg.usage.is_empty() && reg.code >= CALLER_SAVED_LIMIT)
            .min_by_key(|(_, reg)| reg.last_used)
            .or_else(|| {
                candidates()
                    .filter(|(_, reg)| reg.usage.is_empty())
                    .min_by_key(|(_, reg)| reg.last_used)
            })
            .or_else(|| candidates().min_by_key(|(_, reg)| reg.last_used))
            .map(|(index, _)| index)
            .ok_or_else(|| invariant("every host register is reserved".to_string()))
    }

    fn get_free(&mut self, asm: &mut Emitter) -> Result<usize, Error> {
        let index = match self.hint.take() {
            Some(code) => {
                let index = self.index_of_code(code)?;
                let usage = self.host[index].usage;
                if usage.intersects(Usage::RESERVED | Usage::HARDWIRED) {
                    return Err(invariant(format!(
                        "destination hint r{} is reserved ({:?})",
                        code, usage
                    )));
                }
                index
            }
            None => self.pick_victim()?,
        };

        self.flush_host(asm, index)?;
        let reg = &mut self.host[index];
        reg.usage = Usage::empty();
        reg.flush = None;
        reg.binding = Binding::Free;
        Ok(index)
    }

    fn flush_host(&mut self, asm: &mut Emitter, index: usize) -> Result<(), Error> {
        if self.host[index].usage.is_empty() {
            return Ok(());
        }

        if let Some(flush) = self.host[index].flush {
            self.host[index].usage |= Usage::RESERVED;
            match flush {
                Flush::Guest => self.write_back_guest(asm, index)?,
                Flush::Special => self.write_back_special(asm, index),
            }
            self.host[index].flush = None;
        }

        let reg = &mut self.host[index];
        if reg.usage.contains(Usage::HARDWIRED) {
            reg.usage.remove(Usage::READ | Usage::WRITE);
        } else {
            reg.usage = Usage::empty();
            reg.binding = Binding::Free;
        }
        Ok(())
    }

    fn write_back_guest(&mut self, asm: &mut Emitter, index: usize) -> Result<(), Error> {
        let reg = match self.host[index].binding {
            Binding::Guest(reg) => reg,
            other => {
                return Err(invariant(format!(
                    "guest flush on r{} bound to {:?}",
                    self.host[index].code, other
                )));
            }
        };

        if self.guest[reg].host != Some(index) {
            return Err(invariant(format!("flushing unmapped guest register {}", reg)));
        }

        if self.host[index].usage.contains(Usage::WRITE) {
            asm.store_state(self.host[index].code, Registers::gpr_offset(reg));
        }
        self.guest[reg] = GuestReg::default();
        Ok(())
    }

    fn write_back_special(&mut self, asm: &mut Emitter, index: usize) {
        let reg = self.host[index];
        if !reg.usage.contains(Usage::WRITE) {
            return;
        }

        let offset = match reg.binding {
            Binding::Special(Special::CycleCount) => Registers::countdown_offset(),
            Binding::Special(Special::Pc) => Registers::pc_offset(),
            Binding::Special(Special::Target) => Registers::target_offset(),
            _ => return,
        };
        asm.store_state(reg.code, offset);
    }

    /// Drops a host register without writing it back.
    pub fn dispose_host(&mut self, asm: &mut Emitter, index: usize) -> Result<(), Error> {
        if self.host[index].usage.is_empty() {
            return Ok(());
        }

        self.host[index].usage.remove(Usage::READ | Usage::WRITE);
        if self.host[index].usage.is_empty() {
            return Err(invariant(format!(
                "disposing r{} which has no binding",
                self.host[index].code
            )));
        }
        self.flush_host(asm, index)
    }

    pub fn dispose(&mut self, asm: &mut Emitter, reg: usize) -> Result<(), Error> {
        match self.guest[reg].host {
            Some(index) => self.dispose_host(asm, index),
            None => Ok(()),
        }
    }

    pub fn dispose_special(&mut self, asm: &mut Emitter, which: Special) -> Result<(), Error> {
        match self.special_index(which) {
            Some(index) => self.dispose_host(asm, index),
            None => Ok(()),
        }
    }

    /// Flushes every host register whose code lies in `[start, end]`.
    pub fn flush_range(&mut self, asm: &mut Emitter, start: usize, end: usize) -> Result<(), Error> {
        for index in 0..self.host.len() {
            let reg = self.host[index];
            if (start..=end).contains(&reg.code) && reg.flush.is_some() {
                self.flush_host(asm, index)?;
            }
        }

        for index in 0..self.host.len() {
            if (start..=end).contains(&self.host[index].code) {
                self.flush_host(asm, index)?;
            }
        }
        Ok(())
    }

    pub fn flush_all(&mut self, asm: &mut Emitter) -> Result<(), Error> {
        self.flush_range(asm, 0, 31)
    }

    /// Releases the registers a helper call clobbers.
    pub fn invalidate_volatile(&mut self, asm: &mut Emitter) -> Result<(), Error> {
        self.flush_range(asm, 0, CALLER_SAVED_LIMIT - 1)
    }

    fn move_to_code(&mut self, asm: &mut Emitter, code: usize, index: usize) -> Result<(), Error> {
        let from = self.host[index].code;
        if from == code {
            return Ok(());
        }

        let dst = self.index_of_code(code)?;
        self.host[dst]
            .usage
            .remove(Usage::RESERVED | Usage::HARDWIRED | Usage::ARG);

        let live = Usage::READ | Usage::WRITE;
        if self.host[index].usage.intersects(live) {
            self.flush_host(asm, dst)?;
            asm.mr(code, from);
        } else if self.host[dst].usage.intersects(live) {
            asm.mr(from, code);
        } else if !self.host[dst].usage.is_empty() {
            self.flush_host(asm, dst)?;
        }

        self.host[dst].code = from;
        self.host[index].code = code;
        Ok(())
    }

    fn map_guest(&mut self, asm: &mut Emitter, reg: usize) -> Result<usize, Error> {
        if self.guest[reg].host.is_some() {
            return Err(invariant(format!("guest register {} is already mapped", reg)));
        }

        let index = self.get_free(asm)?;
        self.host[index].flush = Some(Flush::Guest);
        self.host[index].binding = Binding::Guest(reg);
        self.guest[reg].host = Some(index);
        Ok(index)
    }

    /// Returns a host code holding the value of guest register `reg`.
    pub fn get(&mut self, asm: &mut Emitter, reg: usize) -> Result<usize, Error> {
        if reg == 0 {
            return self.get_special(asm, Special::ReadZero);
        }

        let mut usage = Usage::PSXREG | Usage::READ;
        let index = match self.guest[reg].host {
            None => {
                usage |= Usage::INITED;
                let index = self.map_guest(asm, reg)?;

                self.host[index].usage |= Usage::RESERVED;
                let code = self.host[index].code;
                match self.guest[reg].constant {
                    Some(k) => {
                        asm.li(code, k);
                        usage |= Usage::WRITE | Usage::CONST;
                    }
                    None => asm.load_state(code, Registers::gpr_offset(reg)),
                }
                self.host[index].usage.remove(Usage::RESERVED);
                index
            }
            Some(index) => {
                if let Some(dst) = self.hint.take() {
                    self.move_to_code(asm, dst, index)?;
                }
                index
            }
        };

        self.hint = None;
        Ok(self.touch(index, usage))
    }

    /// Returns a host code that will receive a new value for guest register
    /// `reg`.
    pub fn put(&mut self, asm: &mut Emitter, reg: usize) -> Result<usize, Error> {
        if reg == 0 {
            return self.put_special(asm, Special::WriteZero);
        }

        let mut usage = Usage::PSXREG | Usage::WRITE;
        if let (Some(dst), Some(index)) = (self.hint, self.guest[reg].host) {
            if self.host[index].code != dst {
                let hint = self.hint.take();
                self.dispose_host(asm, index)?;
                self.hint = hint;
            }
        }

        let index = match self.guest[reg].host {
            Some(index) => index,
            None => {
                usage |= Usage::INITED;
                self.map_guest(asm, reg)?
            }
        };

        self.hint = None;
        self.guest[reg].constant = None;
        Ok(self.touch(index, usage))
    }

    fn map_special(&mut self, asm: &mut Emitter, which: Special) -> Result<usize, Error> {
        let index = self.get_free(asm)?;
        self.host[index].flush = Some(Flush::Special);
        self.host[index].binding = Binding::Special(which);
        Ok(index)
    }

    pub fn get_special(&mut self, asm: &mut Emitter, which: Special) -> Result<usize, Error> {
        let mut usage = Usage::READ | Usage::SPECIAL;

        let index = match self.special_index(which) {
            Some(index) => {
                if let Some(dst) = self.hint.take() {
                    self.move_to_code(asm, dst, index)?;
                }
                index
            }
            None => {
                usage |= Usage::INITED;
                let index = self.map_special(asm, which)?;

                self.host[index].usage |= Usage::RESERVED;
                let code = self.host[index].code;
                match which {
                    Special::CycleCount => asm.load_state(code, Registers::countdown_offset()),
                    Special::Pc => asm.load_state(code, Registers::pc_offset()),
                    Special::Target => asm.load_state(code, Registers::target_offset()),
                    Special::RetVal => {
                        self.move_to_code(asm, RETVAL, index)?;
                        self.host[index].flush = None;
                        usage |= Usage::RESERVED;
                    }
                    _ => {
                        return Err(invariant(format!("{:?} cannot be read here", which)));
                    }
                }
                self.host[index].usage.remove(Usage::RESERVED);
                index
            }
        };

        self.hint = None;
        Ok(self.touch(index, usage))
    }

    pub fn put_special(&mut self, asm: &mut Emitter, which: Special) -> Result<usize, Error> {
        let mut usage = Usage::WRITE | Usage::SPECIAL;
        let mut index = self.special_index(which);

        if let (Some(dst), Some(current)) = (self.hint, index) {
            if self.host[current].code != dst {
                let hint = self.hint.take();
                self.dispose_host(asm, current)?;
                self.hint = hint;
                index = self.special_index(which);
            }
        }

        let index = match which {
            Special::Regs | Special::Mem | Special::Hw | Special::Runtime | Special::ReadZero => {
                return Err(invariant(format!("{:?} is read-only", which)));
            }
            Special::WriteZero => match index {
                Some(index) if self.host[index].usage.contains(Usage::WRITE) => index,
                _ => {
                    let index = self.map_special(asm, which)?;
                    self.host[index].flush = None;
                    index
                }
            },
            _ => match index {
                Some(index) => index,
                None => {
                    usage |= Usage::INITED;
                    let index = self.map_special(asm, which)?;

                    self.host[index].usage |= Usage::RESERVED;
                    if let Some(n) = which.arg_index() {
                        self.move_to_code(asm, ARG_BASE + n, index)?;
                        self.host[index].flush = None;
                        usage |= Usage::RESERVED | Usage::HARDWIRED | Usage::ARG;
                    } else if which == Special::RetVal {
                        self.host[index].flush = None;
                    }
                    self.host[index].usage.remove(Usage::RESERVED);
                    index
                }
            },
        };

        self.hint = None;
        Ok(self.touch(index, usage))
    }

    /// Marks a guest register as holding a known value. No code is emitted.
    pub fn bind_constant(&mut self, asm: &mut Emitter, reg: usize, k: u32) -> Result<(), Error> {
        if reg == 0 || self.guest[reg].constant == Some(k) {
            return Ok(());
        }

        self.dispose(asm, reg)?;
        self.guest[reg].constant = Some(k);
        trace!("r{} = 0x{:08X} (constant)", reg, k);
        Ok(())
    }

    pub fn copy(&mut self, asm: &mut Emitter, dst: usize, src: usize) -> Result<(), Error> {
        let from = self.get(asm, src)?;
        let to = self.put(asm, dst)?;
        asm.mr(to, from);
        Ok(())
    }

    /// Writes guest register `reg` back to the register file, materializing
    /// a pending constant first.
    pub fn flush(&mut self, asm: &mut Emitter, reg: usize) -> Result<(), Error> {
        if !self.is_mapped(reg) && self.guest[reg].constant.is_some() {
            self.get(asm, reg)?;
        }
        match self.guest[reg].host {
            Some(index) => self.flush_host(asm, index),
            None => Ok(()),
        }
    }

    pub fn flush_guest_regs(&mut self, asm: &mut Emitter) -> Result<(), Error> {
        for reg in 1..NUM_GUEST_REGS {
            self.flush(asm, reg)?;
        }
        Ok(())
    }

    pub fn reserve_args(&mut self, count: usize) -> Result<(), Error> {
        for n in 0..count {
            let index = self.index_of_code(ARG_BASE + n)?;
            self.host[index].usage |= Usage::RESERVED | Usage::HARDWIRED | Usage::ARG;
        }
        Ok(())
    }

    pub fn release_args(&mut self, asm: &mut Emitter) -> Result<(), Error> {
        for index in 0..self.host.len() {
            if self.host[index].usage.contains(Usage::ARG) {
                self.host[index]
                    .usage
                    .remove(Usage::RESERVED | Usage::HARDWIRED | Usage::ARG);
                self.flush_host(asm, index)?;
            }
        }
        Ok(())
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new()
    }
}
