/*
    R3000A dynamic recompiler
*/

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cranelift_codegen::Context;
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_control::ControlPlane;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use target_lexicon::Architecture;
use tracing::{debug, error, info};

use crate::Bus;
use crate::Error;
use crate::cpu::{CPU, EmulationBackend};
use crate::r3000a::opcodes::{Instruction, Op};
use crate::r3000a::{R3000A, Registers};

pub mod branch;
pub mod cache;
pub mod disasm;
pub mod emitter;
pub mod regalloc;
pub mod translate;

use cache::CodeCache;
use disasm::Disassembler;
use emitter::{Emitter, Returns};
use translate::Translator;

/// What compiled code needs to reach the session from inside a helper.
#[repr(C)]
pub struct Runtime {
    cpu: *mut R3000A,
    cache: *const CodeCache,
}

type BlockFn = unsafe extern "C" fn(*mut Registers, *mut u8, *mut u8, *mut Runtime) -> *const u8;

unsafe fn session<'r>(runtime: *mut Runtime) -> (&'r mut R3000A, &'r CodeCache) {
    unsafe { (&mut *(*runtime).cpu, &*(*runtime).cache) }
}

fn next_block(cpu: &R3000A, cache: &CodeCache) -> *const u8 {
    cache.lookup(cpu.regs.pc).unwrap_or(ptr::null())
}

unsafe extern "C" fn __rec_read8(runtime: *mut Runtime, addr: u32) -> u32 {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.read8(addr) as u32
}

unsafe extern "C" fn __rec_read16(runtime: *mut Runtime, addr: u32) -> u32 {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.read16(addr) as u32
}

unsafe extern "C" fn __rec_read32(runtime: *mut Runtime, addr: u32) -> u32 {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.read32(addr)
}

unsafe extern "C" fn __rec_write8(runtime: *mut Runtime, addr: u32, value: u32) {
    let (cpu, cache) = unsafe { session(runtime) };
    cpu.write8(addr, value as u8);
    cache.invalidate(addr, 1);
}

unsafe extern "C" fn __rec_write16(runtime: *mut Runtime, addr: u32, value: u32) {
    let (cpu, cache) = unsafe { session(runtime) };
    cpu.write16(addr, value as u16);
    cache.invalidate(addr, 2);
}

unsafe extern "C" fn __rec_write32(runtime: *mut Runtime, addr: u32, value: u32) {
    let (cpu, cache) = unsafe { session(runtime) };
    cpu.write32(addr, value);
    cache.invalidate(addr, 4);
}

unsafe extern "C" fn __rec_exception(runtime: *mut Runtime, cause: u32, in_delay_slot: u32) {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.regs.exception(cause, in_delay_slot != 0);
}

unsafe extern "C" fn __rec_branch_test(runtime: *mut Runtime) -> *const u8 {
    let (cpu, cache) = unsafe { session(runtime) };
    cpu.branch_test();
    next_block(cpu, cache)
}

unsafe extern "C" fn __rec_delay_test(
    runtime: *mut Runtime,
    code: u32,
    reg: u32,
    target: u32,
) -> *const u8 {
    let (cpu, cache) = unsafe { session(runtime) };
    cpu.regs.code = code;
    cpu.delay_test(reg, target);
    next_block(cpu, cache)
}

unsafe extern "C" fn __rec_hle(runtime: *mut Runtime, code: u32) {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.regs.code = code;
    cpu.hooks.hle(code & 0xFFFF, &mut cpu.regs, &mut cpu.bus);
}

unsafe extern "C" fn __rec_gte(runtime: *mut Runtime, code: u32) {
    let (cpu, _) = unsafe { session(runtime) };
    cpu.regs.code = code;
    cpu.hooks.gte(code, &mut cpu.regs);
}

unsafe extern "C" fn __rec_interpret(runtime: *mut Runtime, code: u32) {
    let (cpu, cache) = unsafe { session(runtime) };
    let insn = Instruction(code);
    let addr = cpu.regs.gpr[insn.rs()].wrapping_add(insn.imm());

    cpu.regs.code = code;
    cpu.execute(code);

    if matches!(Op::decode(insn), Op::Swl | Op::Swr | Op::Swc2) {
        cache.invalidate(addr & !3, 4);
    }
}

/// Runtime routines compiled code calls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Helper {
    Read8,
    Read16,
    Read32,
    Write8,
    Write16,
    Write32,
    Exception,
    BranchTest,
    DelayTest,
    Hle,
    Gte,
    Interpret,
}

impl Helper {
    pub fn address(self) -> usize {
        match self {
            Helper::Read8 => __rec_read8 as *const () as usize,
            Helper::Read16 => __rec_read16 as *const () as usize,
            Helper::Read32 => __rec_read32 as *const () as usize,
            Helper::Write8 => __rec_write8 as *const () as usize,
            Helper::Write16 => __rec_write16 as *const () as usize,
            Helper::Write32 => __rec_write32 as *const () as usize,
            Helper::Exception => __rec_exception as *const () as usize,
            Helper::BranchTest => __rec_branch_test as *const () as usize,
            Helper::DelayTest => __rec_delay_test as *const () as usize,
            Helper::Hle => __rec_hle as *const () as usize,
            Helper::Gte => __rec_gte as *const () as usize,
            Helper::Interpret => __rec_interpret as *const () as usize,
        }
    }

    /// Number of word arguments after the runtime pointer.
    pub fn args(self) -> usize {
        match self {
            Helper::BranchTest => 0,
            Helper::Read8 | Helper::Read16 | Helper::Read32 => 1,
            Helper::Hle | Helper::Gte | Helper::Interpret => 1,
            Helper::Write8 | Helper::Write16 | Helper::Write32 | Helper::Exception => 2,
            Helper::DelayTest => 3,
        }
    }

    pub fn returns(self) -> Returns {
        match self {
            Helper::Read8 | Helper::Read16 | Helper::Read32 => Returns::Word,
            Helper::BranchTest | Helper::DelayTest => Returns::Pointer,
            _ => Returns::Nothing,
        }
    }
}

/// Turns guest blocks into host machine code.
pub struct Compiler {
    isa: OwnedTargetIsa,
    ctx: Context,
    fctx: FunctionBuilderContext,
}

impl Compiler {
    pub fn new() -> Result<Self, Error> {
        let mut flags = settings::builder();
        flags.set("opt_level", "speed").map_err(|e| Error::Isa(e.to_string()))?;
        flags.set("is_pic", "false").map_err(|e| Error::Isa(e.to_string()))?;

        let isa = cranelift_native::builder()
            .map_err(|e| Error::Isa(e.to_string()))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| Error::Isa(e.to_string()))?;
        match isa.triple().architecture {
            Architecture::X86_64 | Architecture::Aarch64(_) => {}
            other => return Err(Error::Isa(format!("unsupported host architecture {}", other))),
        }
        info!("Recompiling for {}", isa.triple());

        Ok(Compiler {
            isa,
            ctx: Context::new(),
            fctx: FunctionBuilderContext::new(),
        })
    }

    /// Compiles the block starting at `pc` into position-independent bytes.
    pub fn compile(&mut self, pc: u32, bus: &Bus, cache: &CodeCache) -> Result<Vec<u8>, Error> {
        let ptr_ty = self.isa.pointer_type();
        let call_conv = self.isa.default_call_conv();

        self.ctx.clear();
        self.ctx.func.signature = Emitter::block_signature(ptr_ty, call_conv);

        let builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.fctx);
        let asm = Emitter::new(builder, ptr_ty, call_conv);
        let insns = match Translator::new(asm, bus, cache, pc).translate() {
            Ok(insns) => insns,
            Err(e) => {
                self.fctx = FunctionBuilderContext::new();
                return Err(e);
            }
        };

        let compiled = self
            .ctx
            .compile(&*self.isa, &mut ControlPlane::default())
            .map_err(|e| Error::Codegen(e.inner.to_string()))?;

        if !compiled.buffer.relocs().is_empty() {
            return Err(Error::Codegen(format!(
                "block 0x{:08X} needs relocations",
                pc
            )));
        }

        let code = compiled.code_buffer().to_vec();
        debug!(
            "Compiled block 0x{:08X}: {} instructions, {} bytes",
            pc,
            insns,
            code.len()
        );
        Ok(code)
    }
}

pub struct JIT<'a> {
    pub cpu: &'a mut R3000A,
    cache: CodeCache,
    compiler: Compiler,
    disasm: Option<Disassembler>,
    stop: Arc<AtomicBool>,
    shut_down: bool,
}

impl<'a> JIT<'a> {
    pub fn new(cpu: &'a mut R3000A) -> Result<Self, Error> {
        JIT::with_cache(cpu, CodeCache::new()?)
    }

    pub fn with_cache(cpu: &'a mut R3000A, cache: CodeCache) -> Result<Self, Error> {
        info!("Initializing R3000A recompiler");
        Ok(JIT {
            cpu,
            cache,
            compiler: Compiler::new()?,
            disasm: None,
            stop: Arc::new(AtomicBool::new(false)),
            shut_down: false,
        })
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Logs the host code of every block compiled from now on.
    pub fn set_disassembly(&mut self, enabled: bool) -> Result<(), Error> {
        self.disasm = if enabled { Some(Disassembler::new()?) } else { None };
        Ok(())
    }

    /// Looks up the block at `pc`, translating it on a miss.
    fn block_for(&mut self, pc: u32) -> Result<*const u8, Error> {
        if let Some(entry) = self.cache.lookup(pc) {
            return Ok(entry);
        }
        if !self.cache.is_mapped(pc) {
            return Err(Error::UnmappedCode(pc));
        }

        self.cache.reset_if_full();
        let code = self.compiler.compile(pc, &self.cpu.bus, &self.cache)?;
        let entry = self.cache.install(pc, &code)?;

        if let Some(disasm) = &self.disasm {
            disasm.log_block(pc, &code, entry as u64);
        }
        Ok(entry)
    }

    fn dispatch(&mut self, entry: *const u8) -> *const u8 {
        let cpu: *mut R3000A = &mut *self.cpu;
        let mut runtime = Runtime {
            cpu,
            cache: &self.cache,
        };

        unsafe {
            let block: BlockFn = std::mem::transmute(entry);
            block(
                &raw mut (*cpu).regs,
                (*cpu).bus.ram.as_mut_ptr(),
                (*cpu).bus.hw.as_mut_ptr(),
                &mut runtime,
            )
        }
    }

    /// Chains blocks until `done` holds, following the links blocks return.
    fn run_until(&mut self, done: impl Fn(&JIT<'_>) -> bool) -> Result<(), Error> {
        let mut next: *const u8 = ptr::null();
        while !done(self) {
            let entry = if next.is_null() {
                self.block_for(self.cpu.regs.pc)?
            } else {
                next
            };
            next = self.dispatch(entry);
        }
        Ok(())
    }

    fn check<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            error!("Recompiler stopped at 0x{:08X}: {}", self.cpu.regs.pc, e);
            self.cpu.reset();
            self.cache.reset();
        }
        result
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.shut_down { Err(Error::Shutdown) } else { Ok(()) }
    }
}

impl EmulationBackend<R3000A> for JIT<'_> {
    fn cpu(&mut self) -> &mut R3000A {
        self.cpu
    }

    fn reset(&mut self) {
        self.cpu.reset();
        self.cache.reset();
    }

    fn step(&mut self) -> Result<(), Error> {
        self.ensure_running()?;
        let result = self.block_for(self.cpu.regs.pc).map(|entry| {
            self.dispatch(entry);
        });
        self.check(result)
    }

    fn run(&mut self) -> Result<(), Error> {
        self.ensure_running()?;
        let result = self.run_until(|jit| jit.stop.load(Ordering::Relaxed));
        self.check(result)
    }

    fn run_for_cycles(&mut self, cycles: u64) -> Result<(), Error> {
        self.ensure_running()?;
        let end = self.cpu.elapsed_cycles() + cycles;
        let result = self.run_until(|jit| {
            jit.stop.load(Ordering::Relaxed) || jit.cpu.elapsed_cycles() >= end
        });
        self.check(result)
    }

    fn clear(&mut self, addr: u32, size: u32) {
        debug!("Invalidating 0x{:08X}..0x{:08X}", addr, addr.wrapping_add(size));
        self.cache.invalidate(addr, size);
    }

    fn shutdown(&mut self) {
        info!("Recompiler shut down at pc 0x{:08X}", self.cpu.pc());
        self.stop.store(true, Ordering::Relaxed);
        self.shut_down = true;
    }
}
