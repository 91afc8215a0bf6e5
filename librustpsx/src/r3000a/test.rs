use crate::cpu::{CPU, EmulationBackend};
use crate::r3000a::jit::cache::CodeCache;
use crate::r3000a::{CAUSE, EPC, Interpreter, JIT, PRID, R3000A, REG_HI, REG_LO, STATUS, STATUS_ISC};
use crate::{BIOS, Bus, Error};
use tracing_subscriber::EnvFilter;

const START: u32 = 0xBFC0_0000;
const END: u32 = 0xBFC0_1000;
const MAX_STEPS: usize = 256;

const AT: usize = 1;
const V0: usize = 2;
const V1: usize = 3;
const A0: usize = 4;
const A1: usize = 5;
const A2: usize = 6;
const T0: usize = 8;
const T1: usize = 9;
const T2: usize = 10;
const T3: usize = 11;
const T4: usize = 12;
const T5: usize = 13;
const S0: usize = 16;
const RA: usize = 31;

/// Minimal R3000A encoder for test programs.
mod asm {
    fn special(funct: u32, rs: usize, rt: usize, rd: usize, sa: u32) -> u32 {
        ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | ((sa & 0x1F) << 6) | funct
    }

    fn itype(op: u32, rs: usize, rt: usize, imm: i32) -> u32 {
        (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | (imm as u32 & 0xFFFF)
    }

    pub fn nop() -> u32 { 0 }
    pub fn sll(rd: usize, rt: usize, sa: u32) -> u32 { special(0x00, 0, rt, rd, sa) }
    pub fn srl(rd: usize, rt: usize, sa: u32) -> u32 { special(0x02, 0, rt, rd, sa) }
    pub fn sra(rd: usize, rt: usize, sa: u32) -> u32 { special(0x03, 0, rt, rd, sa) }
    pub fn sllv(rd: usize, rt: usize, rs: usize) -> u32 { special(0x04, rs, rt, rd, 0) }
    pub fn srlv(rd: usize, rt: usize, rs: usize) -> u32 { special(0x06, rs, rt, rd, 0) }
    pub fn srav(rd: usize, rt: usize, rs: usize) -> u32 { special(0x07, rs, rt, rd, 0) }
    pub fn jr(rs: usize) -> u32 { special(0x08, rs, 0, 0, 0) }
    pub fn jalr(rd: usize, rs: usize) -> u32 { special(0x09, rs, 0, rd, 0) }
    pub fn syscall() -> u32 { special(0x0C, 0, 0, 0, 0) }
    pub fn brk() -> u32 { special(0x0D, 0, 0, 0, 0) }
    pub fn mfhi(rd: usize) -> u32 { special(0x10, 0, 0, rd, 0) }
    pub fn mthi(rs: usize) -> u32 { special(0x11, rs, 0, 0, 0) }
    pub fn mflo(rd: usize) -> u32 { special(0x12, 0, 0, rd, 0) }
    pub fn mtlo(rs: usize) -> u32 { special(0x13, rs, 0, 0, 0) }
    pub fn mult(rs: usize, rt: usize) -> u32 { special(0x18, rs, rt, 0, 0) }
    pub fn multu(rs: usize, rt: usize) -> u32 { special(0x19, rs, rt, 0, 0) }
    pub fn div(rs: usize, rt: usize) -> u32 { special(0x1A, rs, rt, 0, 0) }
    pub fn divu(rs: usize, rt: usize) -> u32 { special(0x1B, rs, rt, 0, 0) }
    pub fn addu(rd: usize, rs: usize, rt: usize) -> u32 { special(0x21, rs, rt, rd, 0) }
    pub fn subu(rd: usize, rs: usize, rt: usize) -> u32 { special(0x23, rs, rt, rd, 0) }
    pub fn and(rd: usize, rs: usize, rt: usize) -> u32 { special(0x24, rs, rt, rd, 0) }
    pub fn or(rd: usize, rs: usize, rt: usize) -> u32 { special(0x25, rs, rt, rd, 0) }
    pub fn xor(rd: usize, rs: usize, rt: usize) -> u32 { special(0x26, rs, rt, rd, 0) }
    pub fn nor(rd: usize, rs: usize, rt: usize) -> u32 { special(0x27, rs, rt, rd, 0) }
    pub fn slt(rd: usize, rs: usize, rt: usize) -> u32 { special(0x2A, rs, rt, rd, 0) }
    pub fn sltu(rd: usize, rs: usize, rt: usize) -> u32 { special(0x2B, rs, rt, rd, 0) }

    pub fn bltz(rs: usize, offset: i32) -> u32 { itype(0x01, rs, 0x00, offset) }
    pub fn bgez(rs: usize, offset: i32) -> u32 { itype(0x01, rs, 0x01, offset) }
    pub fn bltzal(rs: usize, offset: i32) -> u32 { itype(0x01, rs, 0x10, offset) }
    pub fn bgezal(rs: usize, offset: i32) -> u32 { itype(0x01, rs, 0x11, offset) }
    pub fn j(target: u32) -> u32 { (0x02 << 26) | ((target >> 2) & 0x03FF_FFFF) }
    pub fn jal(target: u32) -> u32 { (0x03 << 26) | ((target >> 2) & 0x03FF_FFFF) }
    pub fn beq(rs: usize, rt: usize, offset: i32) -> u32 { itype(0x04, rs, rt, offset) }
    pub fn bne(rs: usize, rt: usize, offset: i32) -> u32 { itype(0x05, rs, rt, offset) }
    pub fn blez(rs: usize, offset: i32) -> u32 { itype(0x06, rs, 0, offset) }
    pub fn bgtz(rs: usize, offset: i32) -> u32 { itype(0x07, rs, 0, offset) }
    pub fn addiu(rt: usize, rs: usize, imm: i32) -> u32 { itype(0x09, rs, rt, imm) }
    pub fn slti(rt: usize, rs: usize, imm: i32) -> u32 { itype(0x0A, rs, rt, imm) }
    pub fn sltiu(rt: usize, rs: usize, imm: i32) -> u32 { itype(0x0B, rs, rt, imm) }
    pub fn andi(rt: usize, rs: usize, imm: u16) -> u32 { itype(0x0C, rs, rt, imm as i32) }
    pub fn ori(rt: usize, rs: usize, imm: u16) -> u32 { itype(0x0D, rs, rt, imm as i32) }
    pub fn xori(rt: usize, rs: usize, imm: u16) -> u32 { itype(0x0E, rs, rt, imm as i32) }
    pub fn lui(rt: usize, imm: u16) -> u32 { itype(0x0F, 0, rt, imm as i32) }

    pub fn mfc0(rt: usize, rd: usize) -> u32 { (0x10 << 26) | ((rt as u32) << 16) | ((rd as u32) << 11) }
    pub fn mtc0(rt: usize, rd: usize) -> u32 { (0x10 << 26) | (0x04 << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) }
    pub fn rfe() -> u32 { 0x4200_0010 }
    pub fn rtps() -> u32 { 0x4A18_0001 }
    pub fn hle(index: u16) -> u32 { 0xEC00_0000 | index as u32 }

    pub fn lb(rt: usize, offset: i32, base: usize) -> u32 { itype(0x20, base, rt, offset) }
    pub fn lh(rt: usize, offset: i32, base: usize) -> u32 { itype(0x21, base, rt, offset) }
    pub fn lwl(rt: usize, offset: i32, base: usize) -> u32 { itype(0x22, base, rt, offset) }
    pub fn lw(rt: usize, offset: i32, base: usize) -> u32 { itype(0x23, base, rt, offset) }
    pub fn lbu(rt: usize, offset: i32, base: usize) -> u32 { itype(0x24, base, rt, offset) }
    pub fn lhu(rt: usize, offset: i32, base: usize) -> u32 { itype(0x25, base, rt, offset) }
    pub fn lwr(rt: usize, offset: i32, base: usize) -> u32 { itype(0x26, base, rt, offset) }
    pub fn sb(rt: usize, offset: i32, base: usize) -> u32 { itype(0x28, base, rt, offset) }
    pub fn sh(rt: usize, offset: i32, base: usize) -> u32 { itype(0x29, base, rt, offset) }
    pub fn sw(rt: usize, offset: i32, base: usize) -> u32 { itype(0x2B, base, rt, offset) }
    pub fn swr(rt: usize, offset: i32, base: usize) -> u32 { itype(0x2E, base, rt, offset) }
}

use asm::*;

#[derive(Debug)]
struct GoldenState {
    pc: u32,
    gpr: [u32; 32],
    cop0: [u32; 32],
    lo: u32,
    hi: u32,
    memory_checks: Vec<(u32, u32)>,
}

impl Default for GoldenState {
    fn default() -> Self {
        let mut cop0 = [0; 32];
        cop0[STATUS] = 0x1090_0000;
        cop0[PRID] = 0x0000_0002;
        GoldenState {
            pc: END,
            gpr: [0; 32],
            cop0,
            lo: 0,
            hi: 0,
            memory_checks: Vec::new(),
        }
    }
}

struct TestCase {
    name: &'static str,
    program: Vec<u32>,
    setup: fn(&mut R3000A),
    golden: GoldenState,
}

/// Appends the jump every test program leaves through.
fn program(body: &[u32]) -> Vec<u32> {
    let mut words = body.to_vec();
    words.extend([j(END), nop()]);
    words
}

fn create_mock_bios(words: &[u32]) -> BIOS {
    BIOS::from_words(words)
}

// RUST_LOG=trace shows the compiled blocks of a failing case
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn machine(words: &[u32], setup: &dyn Fn(&mut R3000A)) -> R3000A {
    init_tracing();
    let mut cpu = R3000A::new(Bus::new(create_mock_bios(words)));
    setup(&mut cpu);
    cpu
}

fn run_until<B: EmulationBackend<R3000A>>(backend: &mut B, stop: u32) {
    for _ in 0..MAX_STEPS {
        if backend.cpu().pc() == stop {
            return;
        }
        backend.step().expect("backend failed");
    }
    panic!("pc never reached 0x{:08X}, stuck at 0x{:08X}", stop, backend.cpu().pc());
}

fn run_interpreter(words: &[u32], setup: &dyn Fn(&mut R3000A), stop: u32) -> R3000A {
    let mut interp = Interpreter::new(machine(words, setup));
    run_until(&mut interp, stop);
    interp.cpu
}

fn run_jit(words: &[u32], setup: &dyn Fn(&mut R3000A), stop: u32) -> R3000A {
    let mut cpu = machine(words, setup);
    {
        let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");
        run_until(&mut jit, stop);
    }
    cpu
}

const NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3",
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

fn compare_states(interp: &R3000A, jit: &R3000A, golden: Option<&GoldenState>) {
    assert_eq!(
        interp.pc(), jit.pc(),
        "PC mismatch: interp=0x{:08X}, jit=0x{:08X}",
        interp.pc(), jit.pc(),
    );

    for i in 0..32 {
        assert_eq!(
            interp.read_register(i),
            jit.read_register(i),
            "GPR ${} mismatch: interp=0x{:X}, jit=0x{:X}",
            NAMES[i], interp.read_register(i), jit.read_register(i),
        );
    }

    for (name, reg) in [("LO", REG_LO), ("HI", REG_HI)] {
        assert_eq!(
            interp.regs.gpr[reg], jit.regs.gpr[reg],
            "{} mismatch: interp=0x{:X}, jit=0x{:X}",
            name, interp.regs.gpr[reg], jit.regs.gpr[reg],
        );
    }

    for i in 0..32 {
        assert_eq!(
            interp.read_cop0_register(i),
            jit.read_cop0_register(i),
            "COP0[{}] mismatch: interp=0x{:X}, jit=0x{:X}",
            i, interp.read_cop0_register(i), jit.read_cop0_register(i),
        );
    }

    assert_eq!(
        interp.elapsed_cycles(), jit.elapsed_cycles(),
        "Cycle mismatch: interp={}, jit={}",
        interp.elapsed_cycles(), jit.elapsed_cycles(),
    );

    let Some(g) = golden else {
        return;
    };

    assert_eq!(interp.pc(), g.pc, "PC != golden (0x{:08X} != 0x{:08X})", interp.pc(), g.pc);

    for i in 0..32 {
        let value = interp.read_register(i);
        assert_eq!(
            value, g.gpr[i],
            "GPR ${} != golden (0x{:X} != 0x{:X})",
            NAMES[i], value, g.gpr[i],
        );
    }

    for i in 0..32 {
        let value = interp.read_cop0_register(i);
        assert_eq!(value, g.cop0[i], "COP0[{}] != golden (0x{:X} != 0x{:X})", i, value, g.cop0[i]);
    }

    assert_eq!(interp.regs.gpr[REG_LO], g.lo, "LO != golden (0x{:X} != 0x{:X})", interp.regs.gpr[REG_LO], g.lo);
    assert_eq!(interp.regs.gpr[REG_HI], g.hi, "HI != golden (0x{:X} != 0x{:X})", interp.regs.gpr[REG_HI], g.hi);

    for &(addr, expected) in &g.memory_checks {
        let interp_val = interp.read32(addr);
        let jit_val = jit.read32(addr);
        assert_eq!(
            interp_val, expected,
            "Memory at 0x{:08X} mismatch for interpreter: expected 0x{:08X}, got 0x{:08X}",
            addr, expected, interp_val,
        );
        assert_eq!(
            jit_val, expected,
            "Memory at 0x{:08X} mismatch for JIT: expected 0x{:08X}, got 0x{:08X}",
            addr, expected, jit_val,
        );
    }
}

fn run_test(tc: &TestCase) {
    println!("Running test `{}`", tc.name);

    let interp = run_interpreter(&tc.program, &tc.setup, tc.golden.pc);
    let jit = run_jit(&tc.program, &tc.setup, tc.golden.pc);
    compare_states(&interp, &jit, Some(&tc.golden));

    println!("Test `{}` passed", tc.name);
}

fn golden(regs: &[(usize, u32)]) -> GoldenState {
    let mut g = GoldenState::default();
    for &(reg, value) in regs {
        g.gpr[reg] = value;
    }
    g
}

#[test]
fn test_alu() {
    let tests = vec![
        TestCase {
            name: "addu_registers",
            program: program(&[addu(V0, A0, A1)]),
            setup: |cpu| {
                cpu.write_register(A0, 5);
                cpu.write_register(A1, 7);
            },
            golden: golden(&[(V0, 12), (A0, 5), (A1, 7)]),
        },
        TestCase {
            name: "constant_chain",
            program: program(&[
                lui(T0, 0x1234),
                ori(T0, T0, 0x5678),
                addiu(T1, T0, -8),
                xor(T2, T0, T1),
                nor(T3, 0, 0),
                slt(V0, T3, 0),
                sltu(V1, T3, 0),
            ]),
            setup: |_| {},
            golden: golden(&[
                (T0, 0x1234_5678),
                (T1, 0x1234_5670),
                (T2, 0x0000_0008),
                (T3, 0xFFFF_FFFF),
                (V0, 1),
                (V1, 0),
            ]),
        },
        TestCase {
            name: "mixed_constant_and_register",
            program: program(&[
                ori(T0, 0, 0x00F0),
                subu(V0, T0, A0),
                subu(V1, A0, T0),
                and(T1, A0, T0),
                slt(T2, T0, A0),
                sltu(T3, T0, A0),
            ]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FF0F),
            golden: golden(&[
                (A0, 0xFFFF_FF0F),
                (T0, 0xF0),
                (V0, 0x0000_01E1),
                (V1, 0xFFFF_FE1F),
                (T1, 0x0000_0000),
                (T2, 0),
                (T3, 1),
            ]),
        },
        TestCase {
            name: "sltiu_sign_extends",
            program: program(&[sltiu(V0, A0, -1), sltiu(V1, A0, 5), slti(T0, A0, 5)]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FFF0),
            golden: golden(&[(A0, 0xFFFF_FFF0), (V0, 1), (V1, 0), (T0, 1)]),
        },
        TestCase {
            name: "zero_register_sink",
            program: program(&[addiu(0, 0, 5), lui(0, 1), or(V0, 0, 0), addu(0, A0, A0)]),
            setup: |cpu| {
                cpu.write_register(V0, 3);
                cpu.write_register(A0, 9);
            },
            golden: golden(&[(A0, 9)]),
        },
        TestCase {
            name: "identity_shortcuts",
            program: program(&[
                addu(V0, 0, A0),
                or(V1, A0, 0),
                and(T0, 0, A0),
                sll(T1, A0, 0),
                sllv(T2, A0, 0),
                xori(T3, A0, 0),
                andi(T4, A0, 0),
            ]),
            setup: |cpu| {
                cpu.write_register(A0, 0x1234);
                cpu.write_register(T0, 0x55);
                cpu.write_register(T4, 0x66);
            },
            golden: golden(&[
                (A0, 0x1234),
                (V0, 0x1234),
                (V1, 0x1234),
                (T0, 0),
                (T1, 0x1234),
                (T2, 0x1234),
                (T3, 0x1234),
                (T4, 0),
            ]),
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

#[test]
fn test_shifts() {
    let tests = vec![
        TestCase {
            name: "shift_by_immediate_and_register",
            program: program(&[
                sll(V0, A0, 4),
                srl(V1, A0, 4),
                sra(T0, A0, 4),
                sllv(T1, A0, A1),
                srlv(T2, A0, A1),
                srav(T3, A0, A1),
            ]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8000_00F0);
                cpu.write_register(A1, 4);
            },
            golden: golden(&[
                (A0, 0x8000_00F0),
                (A1, 4),
                (V0, 0x0000_0F00),
                (V1, 0x0800_000F),
                (T0, 0xF800_000F),
                (T1, 0x0000_0F00),
                (T2, 0x0800_000F),
                (T3, 0xF800_000F),
            ]),
        },
        TestCase {
            name: "shift_amount_is_masked",
            program: program(&[ori(T4, 0, 36), srav(T5, A0, T4), sllv(V0, T4, T4)]),
            setup: |cpu| cpu.write_register(A0, 0x8000_00F0),
            golden: golden(&[(A0, 0x8000_00F0), (T4, 36), (T5, 0xF800_000F), (V0, 36 << 4)]),
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

#[test]
fn test_mult_div() {
    let lo_hi = |regs: &[(usize, u32)], lo: u32, hi: u32| {
        let mut g = golden(regs);
        g.lo = lo;
        g.hi = hi;
        g
    };

    let tests = vec![
        TestCase {
            name: "mult_signed",
            program: program(&[mult(A0, A1), mflo(V0), mfhi(V1)]),
            setup: |cpu| {
                cpu.write_register(A0, -3i32 as u32);
                cpu.write_register(A1, 7);
            },
            golden: lo_hi(
                &[(A0, -3i32 as u32), (A1, 7), (V0, 0xFFFF_FFEB), (V1, 0xFFFF_FFFF)],
                0xFFFF_FFEB,
                0xFFFF_FFFF,
            ),
        },
        TestCase {
            name: "multu_full_width",
            program: program(&[multu(A0, A1), mflo(V0), mfhi(V1)]),
            setup: |cpu| {
                cpu.write_register(A0, 0xFFFF_FFFF);
                cpu.write_register(A1, 0xFFFF_FFFF);
            },
            golden: lo_hi(
                &[(A0, 0xFFFF_FFFF), (A1, 0xFFFF_FFFF), (V0, 1), (V1, 0xFFFF_FFFE)],
                1,
                0xFFFF_FFFE,
            ),
        },
        TestCase {
            name: "mult_by_power_of_two",
            program: program(&[ori(T0, 0, 8), mult(A0, T0)]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FFFF),
            golden: lo_hi(&[(A0, 0xFFFF_FFFF), (T0, 8)], 0xFFFF_FFF8, 0xFFFF_FFFF),
        },
        TestCase {
            name: "multu_by_power_of_two",
            program: program(&[ori(T0, 0, 8), multu(T0, A0)]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FFFF),
            golden: lo_hi(&[(A0, 0xFFFF_FFFF), (T0, 8)], 0xFFFF_FFF8, 7),
        },
        TestCase {
            name: "mult_by_zero_constant",
            program: program(&[mult(A0, 0)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x1234);
                cpu.regs.gpr[REG_LO] = 0x55;
                cpu.regs.gpr[REG_HI] = 0x66;
            },
            golden: lo_hi(&[(A0, 0x1234)], 0, 0),
        },
        TestCase {
            name: "divu_by_three",
            program: program(&[ori(T0, 0, 3), divu(A0, T0), mflo(V0), mfhi(V1)]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FFFF),
            golden: lo_hi(
                &[(A0, 0xFFFF_FFFF), (T0, 3), (V0, 0x5555_5555), (V1, 0)],
                0x5555_5555,
                0,
            ),
        },
        TestCase {
            name: "div_by_three_negative",
            program: program(&[ori(T0, 0, 3), div(A0, T0)]),
            setup: |cpu| cpu.write_register(A0, -7i32 as u32),
            golden: lo_hi(&[(A0, -7i32 as u32), (T0, 3)], -2i32 as u32, -1i32 as u32),
        },
        TestCase {
            name: "div_by_power_of_two_truncates",
            program: program(&[ori(T0, 0, 4), div(A0, T0)]),
            setup: |cpu| cpu.write_register(A0, -7i32 as u32),
            golden: lo_hi(&[(A0, -7i32 as u32), (T0, 4)], -1i32 as u32, -3i32 as u32),
        },
        TestCase {
            name: "divu_by_sign_bit",
            program: program(&[lui(T0, 0x8000), divu(A0, T0)]),
            setup: |cpu| cpu.write_register(A0, 0x8000_0007),
            golden: lo_hi(&[(A0, 0x8000_0007), (T0, 0x8000_0000)], 1, 7),
        },
        TestCase {
            name: "div_by_zero",
            program: program(&[div(A0, 0), mflo(V0), mfhi(V1), divu(A1, A2)]),
            setup: |cpu| {
                cpu.write_register(A0, -7i32 as u32);
                cpu.write_register(A1, 5);
            },
            golden: lo_hi(
                &[(A0, -7i32 as u32), (A1, 5), (V0, 1), (V1, -7i32 as u32)],
                0xFFFF_FFFF,
                5,
            ),
        },
        TestCase {
            name: "div_overflow",
            program: program(&[div(A0, A1)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8000_0000);
                cpu.write_register(A1, 0xFFFF_FFFF);
            },
            golden: lo_hi(&[(A0, 0x8000_0000), (A1, 0xFFFF_FFFF)], 0x8000_0000, 0),
        },
        TestCase {
            name: "div_folded",
            program: program(&[lui(T0, 0x8000), addiu(T1, 0, -1), div(T0, T1)]),
            setup: |_| {},
            golden: lo_hi(&[(T0, 0x8000_0000), (T1, 0xFFFF_FFFF)], 0x8000_0000, 0),
        },
        TestCase {
            name: "move_to_lo_hi",
            program: program(&[mtlo(A0), ori(T0, 0, 9), mthi(T0), mflo(V0), mfhi(V1)]),
            setup: |cpu| cpu.write_register(A0, 0xABCD),
            golden: lo_hi(&[(A0, 0xABCD), (T0, 9), (V0, 0xABCD), (V1, 9)], 0xABCD, 9),
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

#[test]
fn test_loads_stores() {
    let tests = vec![
        TestCase {
            name: "ram_through_known_address",
            program: program(&[
                lui(T0, 0x8001),
                lui(T1, 0xDEAD),
                ori(T1, T1, 0xBEEF),
                sw(T1, 0x10, T0),
                lw(V0, 0x10, T0),
                lb(V1, 0x13, T0),
                lhu(A2, 0x10, T0),
            ]),
            setup: |_| {},
            golden: {
                let mut g = golden(&[
                    (T0, 0x8001_0000),
                    (T1, 0xDEAD_BEEF),
                    (V0, 0xDEAD_BEEF),
                    (V1, 0xFFFF_FFDE),
                    (A2, 0xBEEF),
                ]);
                g.memory_checks = vec![(0x8001_0010, 0xDEAD_BEEF), (0xA001_0010, 0xDEAD_BEEF)];
                g
            },
        },
        TestCase {
            name: "ram_through_helpers",
            program: program(&[sh(A1, 2, A0), sb(A1, 1, A0), lw(V0, 0, A0), lh(V1, 2, A0), lbu(T0, 1, A0)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8001_0000);
                cpu.write_register(A1, 0x1234_5678);
            },
            golden: {
                let mut g = golden(&[
                    (A0, 0x8001_0000),
                    (A1, 0x1234_5678),
                    (V0, 0x5678_7800),
                    (V1, 0x5678),
                    (T0, 0x78),
                ]);
                g.memory_checks = vec![(0x0001_0000, 0x5678_7800)];
                g
            },
        },
        TestCase {
            name: "load_into_base_register",
            program: program(&[lw(A0, 4, A0)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8002_0000);
                cpu.bus.write32(0x8002_0004, 0xCAFE_F00D);
            },
            golden: golden(&[(A0, 0xCAFE_F00D)]),
        },
        TestCase {
            name: "scratchpad",
            program: program(&[
                lui(T0, 0x1F80),
                addiu(T1, 0, -2),
                sw(T1, 0x100, T0),
                lh(V0, 0x100, T0),
                lbu(V1, 0x103, T0),
            ]),
            setup: |_| {},
            golden: {
                let mut g = golden(&[(T0, 0x1F80_0000), (T1, 0xFFFF_FFFE), (V0, 0xFFFF_FFFE), (V1, 0xFF)]);
                g.memory_checks = vec![(0x1F80_0100, 0xFFFF_FFFE)];
                g
            },
        },
        TestCase {
            name: "rom_reads_fold",
            program: vec![
                lui(T0, 0xBFC0),
                lw(V0, 0x20, T0),
                lb(V1, 0x23, T0),
                lhu(T1, 0x20, T0),
                j(END),
                nop(),
                nop(),
                nop(),
                0x8081_F2F3,
            ],
            setup: |_| {},
            golden: golden(&[(T0, 0xBFC0_0000), (V0, 0x8081_F2F3), (V1, 0xFFFF_FF80), (T1, 0xF2F3)]),
        },
        TestCase {
            name: "isolated_cache_drops_writes",
            program: program(&[lui(T0, 0x8001), ori(T1, 0, 0x55), sw(T1, 0, T0), sw(T1, 4, A0)]),
            setup: |cpu| {
                cpu.regs.cp0[STATUS] |= STATUS_ISC;
                cpu.write_register(A0, 0x8001_0000);
            },
            golden: {
                let mut g = golden(&[(T0, 0x8001_0000), (T1, 0x55), (A0, 0x8001_0000)]);
                g.cop0[STATUS] |= STATUS_ISC;
                g.memory_checks = vec![(0x8001_0000, 0), (0x8001_0004, 0)];
                g
            },
        },
        TestCase {
            name: "unaligned_word_access",
            program: program(&[lwr(V0, 1, A0), lwl(V0, 4, A0), swr(A1, 8, A0)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8001_0000);
                cpu.write_register(A1, 0xAABB_CCDD);
                cpu.bus.write32(0x8001_0000, 0x4433_2211);
                cpu.bus.write32(0x8001_0004, 0x8877_6655);
            },
            golden: {
                let mut g = golden(&[(A0, 0x8001_0000), (A1, 0xAABB_CCDD), (V0, 0x5544_3322)]);
                g.memory_checks = vec![(0x8001_0008, 0xAABB_CCDD)];
                g
            },
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

#[test]
fn test_io_stall_is_charged_once() {
    let words = program(&[lhu(V0, 0, A0)]);
    let setup = |cpu: &mut R3000A| cpu.write_register(A0, 0x1F80_1C00);

    let interp = run_interpreter(&words, &setup, END);
    let jit = run_jit(&words, &setup, END);
    compare_states(&interp, &jit, None);
    assert_eq!(jit.elapsed_cycles(), 3 + 4);
}

#[test]
fn test_branches() {
    let tests = vec![
        TestCase {
            name: "beq_taken",
            program: program(&[beq(A0, A1, 2), addiu(V0, 0, 1), addiu(V1, 0, 2), addiu(T0, 0, 3)]),
            setup: |cpu| {
                cpu.write_register(A0, 1);
                cpu.write_register(A1, 1);
            },
            golden: golden(&[(A0, 1), (A1, 1), (V0, 1), (T0, 3)]),
        },
        TestCase {
            name: "bne_not_taken",
            program: program(&[bne(A0, A1, 2), addiu(V0, 0, 1), addiu(V1, 0, 2), addiu(T0, 0, 3)]),
            setup: |cpu| {
                cpu.write_register(A0, 1);
                cpu.write_register(A1, 1);
            },
            golden: golden(&[(A0, 1), (A1, 1), (V0, 1), (V1, 2), (T0, 3)]),
        },
        TestCase {
            name: "folded_branch",
            program: program(&[ori(T0, 0, 5), blez(T0, 2), addiu(V0, 0, 1), addiu(V1, 0, 2), addiu(T1, 0, 3)]),
            setup: |_| {},
            golden: golden(&[(T0, 5), (V0, 1), (V1, 2), (T1, 3)]),
        },
        TestCase {
            name: "signed_conditions",
            program: program(&[
                bltz(A0, 2),
                nop(),
                addiu(V1, 0, 2),
                bgtz(A0, 2),
                nop(),
                addiu(V0, 0, 1),
                bgez(A0, 2),
                nop(),
                addiu(T0, 0, 3),
            ]),
            setup: |cpu| cpu.write_register(A0, 0xFFFF_FFFF),
            golden: golden(&[(A0, 0xFFFF_FFFF), (V0, 1), (T0, 3)]),
        },
        TestCase {
            name: "bgezal_links_when_taken",
            program: program(&[bgezal(A0, 2), nop(), addiu(V1, 0, 2), addiu(V0, 0, 1)]),
            setup: |_| {},
            golden: golden(&[(RA, 0xBFC0_0008), (V0, 1)]),
        },
        TestCase {
            name: "bltzal_keeps_ra_when_not_taken",
            program: program(&[bltzal(A0, 2), nop(), addiu(V1, 0, 2), addiu(V0, 0, 1)]),
            setup: |cpu| cpu.write_register(RA, 0x1234),
            golden: golden(&[(RA, 0x1234), (V1, 2), (V0, 1)]),
        },
        TestCase {
            name: "self_branch_runs_delay_slot_once_per_pass",
            program: program(&[addiu(T0, 0, 3), bgtz(T0, -1), addiu(T0, T0, -1)]),
            setup: |_| {},
            golden: golden(&[(T0, 0xFFFF_FFFF)]),
        },
        TestCase {
            name: "delay_slot_writes_branch_input",
            program: program(&[beq(A0, 0, 2), addiu(A0, A0, 1), addiu(V1, 0, 2), addiu(V0, 0, 1)]),
            setup: |_| {},
            golden: golden(&[(A0, 1), (V0, 1)]),
        },
        TestCase {
            name: "jal_jr_return",
            program: vec![
                jal(0xBFC0_0020),
                addiu(A0, 0, 1),
                addiu(V0, A0, 10),
                j(END),
                nop(),
                nop(),
                nop(),
                nop(),
                jr(RA),
                addiu(A0, A0, 1),
            ],
            setup: |_| {},
            golden: golden(&[(RA, 0xBFC0_0008), (A0, 2), (V0, 12)]),
        },
        TestCase {
            name: "jalr_links_rd",
            program: vec![
                jalr(S0, T0),
                nop(),
                addiu(V1, 0, 7),
                j(END),
                nop(),
                nop(),
                nop(),
                nop(),
                jr(S0),
                addiu(V0, 0, 5),
            ],
            setup: |cpu| cpu.write_register(T0, 0xBFC0_0020),
            golden: golden(&[(S0, 0xBFC0_0008), (T0, 0xBFC0_0020), (V0, 5), (V1, 7)]),
        },
        TestCase {
            name: "jr_reads_target_before_delay_slot",
            program: vec![jr(T0), addiu(T0, T0, 8), nop(), nop(), addiu(V0, 0, 1), j(END), nop()],
            setup: |cpu| cpu.write_register(T0, 0xBFC0_0010),
            golden: golden(&[(T0, 0xBFC0_0018), (V0, 1)]),
        },
        TestCase {
            name: "jr_delay_slot_loads_target",
            program: vec![
                jr(T0),
                lw(T0, 0, A0),
                nop(),
                nop(),
                addiu(V0, 0, 1),
                j(END),
                nop(),
                nop(),
                addiu(V1, 0, 1),
                j(END),
                nop(),
            ],
            setup: |cpu| {
                cpu.write_register(T0, 0xBFC0_0010);
                cpu.write_register(A0, 0x8001_0000);
                cpu.bus.write32(0x8001_0000, 0xBFC0_0020);
            },
            golden: golden(&[(T0, 0xBFC0_0020), (A0, 0x8001_0000), (V0, 1)]),
        },
        TestCase {
            name: "branch_delay_slot_loads_input",
            program: program(&[bne(A1, 0, 3), lw(A1, 0, A0), addiu(V1, 0, 2), nop(), addiu(V0, 0, 1)]),
            setup: |cpu| {
                cpu.write_register(A0, 0x8001_0000);
                cpu.write_register(A1, 5);
            },
            golden: golden(&[(A0, 0x8001_0000), (V0, 1)]),
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

#[test]
fn test_system_control() {
    let vector = 0x8000_0080;
    let tests = vec![
        TestCase {
            name: "syscall",
            program: program(&[addiu(V0, 0, 1), syscall()]),
            setup: |_| {},
            golden: {
                let mut g = golden(&[(V0, 1)]);
                g.pc = vector;
                g.cop0[CAUSE] = 0x20;
                g.cop0[EPC] = 0xBFC0_0004;
                g
            },
        },
        TestCase {
            name: "break_in_delay_slot",
            program: vec![j(END), brk()],
            setup: |_| {},
            golden: {
                let mut g = GoldenState::default();
                g.pc = vector;
                g.cop0[CAUSE] = 0x8000_0024;
                g.cop0[EPC] = 0xBFC0_0000;
                g
            },
        },
        TestCase {
            name: "rfe_pops_mode_stack",
            program: program(&[rfe()]),
            setup: |cpu| cpu.regs.cp0[STATUS] |= 0x3C,
            golden: {
                let mut g = GoldenState::default();
                g.cop0[STATUS] = 0x1090_003F;
                g
            },
        },
        TestCase {
            name: "cop0_moves",
            program: program(&[mtc0(A0, 3), mfc0(V0, 3)]),
            setup: |cpu| cpu.write_register(A0, 0x1234),
            golden: {
                let mut g = golden(&[(A0, 0x1234), (V0, 0x1234)]);
                g.cop0[3] = 0x1234;
                g
            },
        },
        TestCase {
            name: "hle_returns_through_ra",
            program: vec![hle(0), nop(), nop(), nop(), addiu(V0, 0, 1), j(END), nop()],
            setup: |cpu| cpu.write_register(RA, 0xBFC0_0010),
            golden: golden(&[(RA, 0xBFC0_0010), (V0, 1)]),
        },
        TestCase {
            name: "gte_ends_block",
            program: program(&[rtps(), addiu(V0, 0, 1)]),
            setup: |_| {},
            golden: golden(&[(V0, 1)]),
        },
    ];

    for test in tests {
        run_test(&test);
    }
}

/// xorshift32, enough to spread register values and opcodes.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn reg(&mut self) -> usize {
        (self.next() % 16) as usize
    }

    fn dst(&mut self) -> usize {
        1 + (self.next() % 15) as usize
    }
}

fn random_program(rng: &mut Rng) -> Vec<u32> {
    const DIVISORS: [u32; 7] = [0, 1, 3, 4, 0x4000_0000, 0x8000_0000, 0xFFFF_FFFF];
    let mut body = Vec::new();

    for _ in 0..24 {
        let (d, s, t) = (rng.dst(), rng.reg(), rng.reg());
        let imm = rng.next() as i32 as i16 as i32;
        let word = match rng.next() % 26 {
            0 => addu(d, s, t),
            1 => subu(d, s, t),
            2 => and(d, s, t),
            3 => or(d, s, t),
            4 => xor(d, s, t),
            5 => nor(d, s, t),
            6 => slt(d, s, t),
            7 => sltu(d, s, t),
            8 => sllv(d, s, t),
            9 => srlv(d, s, t),
            10 => srav(d, s, t),
            11 => sll(d, t, rng.next()),
            12 => srl(d, t, rng.next()),
            13 => sra(d, t, rng.next()),
            14 => addiu(d, s, imm),
            15 => slti(d, s, imm),
            16 => sltiu(d, s, imm),
            17 => andi(d, s, imm as u16),
            18 => ori(d, s, imm as u16),
            19 => xori(d, s, imm as u16),
            20 => lui(d, imm as u16),
            21 => mult(s, t),
            22 => multu(s, t),
            23 | 24 => {
                let divisor = DIVISORS[(rng.next() % DIVISORS.len() as u32) as usize];
                body.push(lui(t.max(1), (divisor >> 16) as u16));
                body.push(ori(t.max(1), t.max(1), divisor as u16));
                if rng.next() & 1 == 0 { div(s, t.max(1)) } else { divu(s, t.max(1)) }
            }
            _ => {
                if rng.next() & 1 == 0 { mflo(d) } else { mfhi(d) }
            }
        };
        body.push(word);
    }

    program(&body)
}

#[test]
fn test_folding_matches_interpreter() {
    let mut rng = Rng(0x2545_F491);

    for round in 0..200 {
        let words = random_program(&mut rng);
        let seed = rng.next();
        let setup = move |cpu: &mut R3000A| {
            let mut rng = Rng(seed | 1);
            for reg in 1..16 {
                cpu.write_register(reg, rng.next());
            }
            cpu.regs.gpr[REG_LO] = rng.next();
            cpu.regs.gpr[REG_HI] = rng.next();
        };

        println!("Running random program {}", round);
        let interp = run_interpreter(&words, &setup, END);
        let jit = run_jit(&words, &setup, END);
        compare_states(&interp, &jit, None);
    }
}

fn ram_loop(body: &[u32], at: u32) -> Vec<u8> {
    let mut words = body.to_vec();
    words.extend([j(at), nop()]);
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

#[test]
fn test_code_patched_from_host_is_retranslated() {
    let entry = 0x8001_0000;
    let mut cpu = machine(&[], &|cpu: &mut R3000A| {
        cpu.bus.load_ram(entry, &ram_loop(&[addiu(V0, 0, 1)], entry));
        cpu.set_pc(entry);
    });

    let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");
    jit.step().expect("first run failed");
    assert_eq!(jit.cpu.read_register(V0), 1);
    assert!(jit.cache().is_translated(entry));

    jit.cpu.bus.load_ram(entry, &addiu(V0, 0, 2).to_le_bytes());
    jit.clear(entry, 4);
    assert!(!jit.cache().is_translated(entry));

    jit.step().expect("second run failed");
    assert_eq!(jit.cpu.read_register(V0), 2);
}

#[test]
fn test_guest_stores_invalidate_code() {
    let patched = addiu(V0, 0, 2);

    // Direct store through a known address, then a store through the write helper
    let stores = [
        vec![lui(T0, 0x8001), sw(T1, 0x100, T0)],
        vec![sw(T1, 0x100, A0)],
    ];

    for store in stores {
        let writer = 0x8001_0000;
        let target = 0x8001_0100;

        let mut body = vec![lui(T1, (patched >> 16) as u16), ori(T1, T1, patched as u16)];
        body.extend(store);

        let mut cpu = machine(&[], &|cpu: &mut R3000A| {
            cpu.bus.load_ram(target, &ram_loop(&[addiu(V0, 0, 1)], writer));
            cpu.bus.load_ram(writer, &ram_loop(&body, target));
            cpu.write_register(A0, writer);
            cpu.set_pc(target);
        });

        let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");
        jit.step().expect("target block failed");
        assert_eq!(jit.cpu.read_register(V0), 1);
        assert!(jit.cache().is_translated(target));

        jit.step().expect("writer block failed");
        assert_eq!(jit.cpu.pc(), target);
        assert!(!jit.cache().is_translated(target));

        jit.step().expect("patched block failed");
        assert_eq!(jit.cpu.read_register(V0), 2);
    }
}

#[test]
fn test_cache_exhaustion_resets() {
    const BLOCKS: u32 = 256;
    let mut words = Vec::new();
    for n in 0..BLOCKS {
        words.extend([addiu(V0, V0, 1), j(START + (n + 1) * 12), nop()]);
    }

    let mut cpu = machine(&words, &|_| {});
    let cache = CodeCache::with_capacity(0x20000, 0x1F000).expect("cache setup failed");
    let mut jit = JIT::with_cache(&mut cpu, cache).expect("JIT setup failed");
    let generation = jit.cache().generation();

    for _ in 0..BLOCKS {
        jit.step().expect("block failed");
    }

    assert_eq!(jit.cpu.read_register(V0), BLOCKS);
    assert!(jit.cache().generation() > generation);
    assert!(!jit.cache().is_translated(START));
    assert!(jit.cache().used() <= 0x1000 + 0x1000);
}

#[test]
fn test_run_for_cycles_trampolines() {
    let mut cpu = machine(&[addiu(V0, V0, 1), j(START), nop()], &|_| {});
    let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");

    jit.run_for_cycles(30_000).expect("run failed");

    let cycles = jit.cpu.elapsed_cycles();
    assert!(cycles >= 30_000, "only {} cycles elapsed", cycles);
    assert_eq!(u64::from(jit.cpu.read_register(V0)) * 3, cycles);
}

#[test]
fn test_run_stops_on_flag() {
    let mut cpu = machine(&[j(START), nop()], &|_| {});
    let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");

    let stop = jit.stop_flag();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
    });

    jit.run().expect("run failed");
    stopper.join().expect("stopper panicked");
    assert!(jit.cpu.elapsed_cycles() > 0);
}

#[test]
fn test_unmapped_code_is_fatal() {
    let mut cpu = machine(&[], &|cpu: &mut R3000A| cpu.set_pc(0x1F00_0000));
    let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");

    let result = jit.step();
    assert!(matches!(result, Err(Error::UnmappedCode(0x1F00_0000))));
    assert_eq!(jit.cpu.pc(), START);
}

fn load_ram_program(cpu: &mut R3000A, pc: u32) {
    let words = [addiu(V0, 0, 1), lui(AT, (END >> 16) as u16), ori(AT, AT, END as u16), jr(AT), nop()];
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    cpu.bus.load_ram(0, &bytes);
    cpu.set_pc(pc);
}

#[test]
fn test_backends_agree_on_unmapped_segments() {
    for pc in [0x2000_0000, 0x6000_0000, 0xC000_0000, 0xE000_0000] {
        let setup = move |cpu: &mut R3000A| load_ram_program(cpu, pc);

        let mut interp = Interpreter::new(machine(&[], &setup));
        let result = interp.step();
        assert!(
            matches!(result, Err(Error::UnmappedCode(addr)) if addr == pc),
            "interpreter ran code at 0x{:08X}",
            pc
        );
        assert_eq!(interp.cpu.read_register(V0), 0);

        let mut cpu = machine(&[], &setup);
        let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");
        let result = jit.step();
        assert!(
            matches!(result, Err(Error::UnmappedCode(addr)) if addr == pc),
            "recompiler ran code at 0x{:08X}",
            pc
        );
        assert_eq!(jit.cpu.read_register(V0), 0);
    }

    // The same words run on both backends through the KUSEG and KSEG0 views
    for pc in [0x0000_0000, 0x8000_0000] {
        let setup = move |cpu: &mut R3000A| load_ram_program(cpu, pc);
        let interp = run_interpreter(&[], &setup, END);
        let jit = run_jit(&[], &setup, END);
        compare_states(&interp, &jit, None);
        assert_eq!(jit.read_register(V0), 1);
        assert_eq!(jit.read_register(AT), END);
    }
}

#[test]
fn test_step_after_shutdown() {
    let mut cpu = machine(&program(&[]), &|_| {});
    let mut jit = JIT::new(&mut cpu).expect("JIT setup failed");

    jit.shutdown();
    assert!(matches!(jit.step(), Err(Error::Shutdown)));
    assert!(matches!(jit.run(), Err(Error::Shutdown)));
}

#[test]
fn test_interrupt_taken_at_block_boundary() {
    let words = program(&[addiu(V0, 0, 1)]);
    let setup = |cpu: &mut R3000A| {
        cpu.regs.cp0[STATUS] |= 0x401;
        cpu.bus.write32(crate::bus::I_MASK, 1);
        cpu.bus.raise_irq(1);
    };

    let interp = run_interpreter(&words, &setup, 0x8000_0080);
    let jit = run_jit(&words, &setup, 0x8000_0080);
    compare_states(&interp, &jit, None);
    assert_eq!(jit.regs.cp0[CAUSE], 0x400);
    assert_eq!(jit.regs.cp0[EPC], END);
    assert_eq!(jit.read_register(V0), 1);
}

#[test]
fn test_at_is_an_ordinary_register() {
    run_test(&TestCase {
        name: "at_register",
        program: program(&[lui(AT, 0x8001), addiu(AT, AT, 4), sw(AT, 0, AT), lw(V0, 0, AT)]),
        setup: |_| {},
        golden: {
            let mut g = golden(&[(AT, 0x8001_0004), (V0, 0x8001_0004)]);
            g.memory_checks = vec![(0x8001_0004, 0x8001_0004)];
            g
        },
    });
}
