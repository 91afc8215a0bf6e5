/*
    Host code emission on top of Cranelift
*/

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, Block, InstBuilder, MemFlags, Signature, Type, Value};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::FunctionBuilder;
use tracing::trace;

use crate::r3000a::{Registers, STATUS, STATUS_ISC};

pub const NUM_CODES: usize = 32;

// Codes below this one are clobbered by helper calls
pub const CALLER_SAVED_LIMIT: usize = 13;

pub const ARG_BASE: usize = 3;
pub const RETVAL: usize = 3;

// Hardwired codes, bound to the block function's parameters
pub const REGS: usize = 31;
pub const MEM: usize = 30;
pub const HW: usize = 29;
pub const RUNTIME: usize = 28;
pub const ZERO: usize = 27;

/// Current value of every host register code.
pub type HostFile = [Option<Value>; NUM_CODES];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Half,
    Word,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
        }
    }

    fn ty(self) -> Type {
        match self {
            Width::Byte => types::I8,
            Width::Half => types::I16,
            Width::Word => types::I32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alu {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Sllv,
    Srlv,
    Srav,
    Slt,
    Sltu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shift {
    Sll,
    Srl,
    Sra,
}

/// Branch conditions. The sign tests only look at the first operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Ltz,
    Gez,
    Lez,
    Gtz,
}

/// Shape of a runtime helper as seen from compiled code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Returns {
    Nothing,
    Word,
    Pointer,
}

pub struct Emitter<'t> {
    b: FunctionBuilder<'t>,
    regs: HostFile,
    ptr_ty: Type,
    call_conv: CallConv,
}

impl<'t> Emitter<'t> {
    pub fn new(mut b: FunctionBuilder<'t>, ptr_ty: Type, call_conv: CallConv) -> Self {
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        b.seal_block(entry);

        let params = b.block_params(entry).to_vec();
        let mut regs: HostFile = [None; NUM_CODES];
        regs[REGS] = Some(params[0]);
        regs[MEM] = Some(params[1]);
        regs[HW] = Some(params[2]);
        regs[RUNTIME] = Some(params[3]);
        regs[ZERO] = Some(b.ins().iconst(types::I32, 0));

        Emitter {
            b,
            regs,
            ptr_ty,
            call_conv,
        }
    }

    /// Signature shared by every compiled block.
    pub fn block_signature(ptr_ty: Type, call_conv: CallConv) -> Signature {
        let mut sig = Signature::new(call_conv);
        for _ in 0..4 {
            sig.params.push(AbiParam::new(ptr_ty));
        }
        sig.returns.push(AbiParam::new(ptr_ty));
        sig
    }

    pub fn finish(mut self) {
        self.b.seal_all_blocks();
        self.b.finalize();
    }

    fn get(&mut self, code: usize) -> Value {
        match self.regs[code] {
            Some(value) => value,
            None => {
                trace!("Host register {} read before being defined", code);
                let value = self.b.ins().iconst(types::I32, 0);
                self.regs[code] = Some(value);
                value
            }
        }
    }

    #[inline(always)]
    fn def(&mut self, code: usize, value: Value) {
        self.regs[code] = Some(value);
    }

    // Narrow constants must be zero-extended into the immediate
    fn k(&mut self, k: u32) -> Value {
        self.b.ins().iconst(types::I32, i64::from(k))
    }

    pub fn regs(&self) -> HostFile {
        self.regs
    }

    pub fn restore_regs(&mut self, regs: HostFile) {
        self.regs = regs;
    }

    pub fn li(&mut self, dst: usize, k: u32) {
        let value = self.k(k);
        self.def(dst, value);
    }

    pub fn mr(&mut self, dst: usize, src: usize) {
        let value = self.get(src);
        self.def(dst, value);
    }

    /// Sign or zero extends the low `width` bits of `src`.
    pub fn extend(&mut self, dst: usize, src: usize, width: Width, signed: bool) {
        let value = self.get(src);
        let value = match width {
            Width::Word => value,
            _ => {
                let narrow = self.b.ins().ireduce(width.ty(), value);
                if signed {
                    self.b.ins().sextend(types::I32, narrow)
                } else {
                    self.b.ins().uextend(types::I32, narrow)
                }
            }
        };
        self.def(dst, value);
    }

    pub fn load_state(&mut self, dst: usize, offset: i32) {
        let base = self.get(REGS);
        let value = self.b.ins().load(types::I32, MemFlags::trusted(), base, offset);
        self.def(dst, value);
    }

    pub fn store_state(&mut self, src: usize, offset: i32) {
        let base = self.get(REGS);
        let value = self.get(src);
        self.b.ins().store(MemFlags::trusted(), value, base, offset);
    }

    pub fn alu(&mut self, op: Alu, dst: usize, a: usize, b: usize) {
        let (a, b) = (self.get(a), self.get(b));
        let value = self.alu_value(op, a, b);
        self.def(dst, value);
    }

    pub fn alu_imm(&mut self, op: Alu, dst: usize, a: usize, k: u32) {
        let a = self.get(a);
        let b = self.k(k);
        let value = self.alu_value(op, a, b);
        self.def(dst, value);
    }

    /// `k op b`, for the non-commutative forms with a constant left operand.
    pub fn alu_imm_rev(&mut self, op: Alu, dst: usize, k: u32, b: usize) {
        let a = self.k(k);
        let b = self.get(b);
        let value = self.alu_value(op, a, b);
        self.def(dst, value);
    }

    fn alu_value(&mut self, op: Alu, a: Value, b: Value) -> Value {
        let ins = self.b.ins();
        match op {
            Alu::Add => ins.iadd(a, b),
            Alu::Sub => ins.isub(a, b),
            Alu::And => ins.band(a, b),
            Alu::Or => ins.bor(a, b),
            Alu::Xor => ins.bxor(a, b),
            Alu::Nor => {
                let or = ins.bor(a, b);
                self.b.ins().bnot(or)
            }
            // Cranelift masks the amount to the type width like the guest does
            Alu::Sllv => ins.ishl(b, a),
            Alu::Srlv => ins.ushr(b, a),
            Alu::Srav => ins.sshr(b, a),
            Alu::Slt => {
                let cmp = ins.icmp(IntCC::SignedLessThan, a, b);
                self.b.ins().uextend(types::I32, cmp)
            }
            Alu::Sltu => {
                let cmp = ins.icmp(IntCC::UnsignedLessThan, a, b);
                self.b.ins().uextend(types::I32, cmp)
            }
        }
    }

    pub fn shift(&mut self, op: Shift, dst: usize, a: usize, sa: u32) {
        let a = self.get(a);
        let sa = self.k(sa & 0x1F);
        let value = match op {
            Shift::Sll => self.b.ins().ishl(a, sa),
            Shift::Srl => self.b.ins().ushr(a, sa),
            Shift::Sra => self.b.ins().sshr(a, sa),
        };
        self.def(dst, value);
    }

    /// Full 64-bit product split into LO and HI.
    pub fn mul(&mut self, signed: bool, lo: usize, hi: usize, a: usize, b: usize) {
        let (a, b) = (self.get(a), self.get(b));
        let low = self.b.ins().imul(a, b);
        let high = if signed {
            self.b.ins().smulhi(a, b)
        } else {
            self.b.ins().umulhi(a, b)
        };
        self.def(lo, low);
        self.def(hi, high);
    }

    /// Product with a constant `1 << k`.
    pub fn mul_pow2(&mut self, signed: bool, lo: usize, hi: usize, a: usize, k: u32) {
        let a = self.get(a);
        let (low, high) = if k == 0 {
            let high = if signed {
                let sa = self.k(31);
                self.b.ins().sshr(a, sa)
            } else {
                self.k(0)
            };
            (a, high)
        } else {
            let left = self.k(k);
            let right = self.k(32 - k);
            let low = self.b.ins().ishl(a, left);
            let high = if signed {
                self.b.ins().sshr(a, right)
            } else {
                self.b.ins().ushr(a, right)
            };
            (low, high)
        };
        self.def(lo, low);
        self.def(hi, high);
    }

    /// Division with the R3000A results for a zero divisor and for
    /// `i32::MIN / -1`, neither of which may reach a host divide.
    pub fn div(&mut self, signed: bool, lo: usize, hi: usize, a: usize, b: usize) {
        let (a, b) = (self.get(a), self.get(b));
        let zero = self.k(0);
        let one = self.k(1);
        let by_zero = self.b.ins().icmp(IntCC::Equal, b, zero);

        let (quotient, remainder) = if signed {
            let min = self.k(i32::MIN as u32);
            let minus_one = self.k(u32::MAX);
            let a_min = self.b.ins().icmp(IntCC::Equal, a, min);
            let b_minus_one = self.b.ins().icmp(IntCC::Equal, b, minus_one);
            let overflow = self.b.ins().band(a_min, b_minus_one);
            let unsafe_divisor = self.b.ins().bor(by_zero, overflow);
            let divisor = self.b.ins().select(unsafe_divisor, one, b);
            let q = self.b.ins().sdiv(a, divisor);
            let r = self.b.ins().srem(a, divisor);

            let negative = self.b.ins().icmp(IntCC::SignedLessThan, a, zero);
            let by_zero_q = self.b.ins().select(negative, one, minus_one);
            (
                self.b.ins().select(by_zero, by_zero_q, q),
                self.b.ins().select(by_zero, a, r),
            )
        } else {
            let all_ones = self.k(u32::MAX);
            let divisor = self.b.ins().select(by_zero, one, b);
            let q = self.b.ins().udiv(a, divisor);
            let r = self.b.ins().urem(a, divisor);
            (
                self.b.ins().select(by_zero, all_ones, q),
                self.b.ins().select(by_zero, a, r),
            )
        };

        self.def(lo, quotient);
        self.def(hi, remainder);
    }

    /// Division by a constant `1 << k`, with `1 <= k <= 30` when signed.
    pub fn div_pow2(&mut self, signed: bool, lo: usize, hi: usize, a: usize, k: u32) {
        let a = self.get(a);
        let sa = self.k(k);
        let (quotient, remainder) = if signed {
            // Bias negative dividends so the shift truncates towards zero
            let sign_sa = self.k(31);
            let sign = self.b.ins().sshr(a, sign_sa);
            let bias_sa = self.k(32 - k);
            let bias = self.b.ins().ushr(sign, bias_sa);
            let biased = self.b.ins().iadd(a, bias);
            let q = self.b.ins().sshr(biased, sa);
            let back = self.b.ins().ishl(q, sa);
            (q, self.b.ins().isub(a, back))
        } else {
            let mask = self.k((1u32 << k) - 1);
            let q = self.b.ins().ushr(a, sa);
            (q, self.b.ins().band(a, mask))
        };
        self.def(lo, quotient);
        self.def(hi, remainder);
    }

    /// Division by 3 through a reciprocal multiply.
    pub fn div3(&mut self, signed: bool, lo: usize, hi: usize, a: usize) {
        let a = self.get(a);
        let quotient = if signed {
            let magic = self.k(0x5555_5556);
            let high = self.b.ins().smulhi(a, magic);
            let sa = self.k(31);
            let sign = self.b.ins().ushr(a, sa);
            self.b.ins().iadd(high, sign)
        } else {
            let magic = self.k(0xAAAA_AAAB);
            let high = self.b.ins().umulhi(a, magic);
            let sa = self.k(1);
            self.b.ins().ushr(high, sa)
        };
        let three = self.k(3);
        let product = self.b.ins().imul(quotient, three);
        let remainder = self.b.ins().isub(a, product);
        self.def(lo, quotient);
        self.def(hi, remainder);
    }

    fn mem_addr(&mut self, base: usize, offset: u32) -> Value {
        let base = self.get(base);
        let offset = self.b.ins().iconst(self.ptr_ty, i64::from(offset));
        self.b.ins().iadd(base, offset)
    }

    /// Loads from guest memory at a fixed offset from the RAM or hardware
    /// page base.
    pub fn load_mem(&mut self, dst: usize, base: usize, offset: u32, width: Width, signed: bool) {
        let addr = self.mem_addr(base, offset);
        let flags = MemFlags::new().with_notrap();
        let value = self.b.ins().load(width.ty(), flags, addr, 0);
        let value = match (width, signed) {
            (Width::Word, _) => value,
            (_, true) => self.b.ins().sextend(types::I32, value),
            (_, false) => self.b.ins().uextend(types::I32, value),
        };
        self.def(dst, value);
    }

    /// Stores into guest memory unless the cache is isolated. A non-zero
    /// `slot` is the address of the lookup slot covering the word, which gets
    /// cleared so the code there is translated again.
    pub fn store_mem(&mut self, src: usize, base: usize, offset: u32, width: Width, slot: usize) {
        let value = self.get(src);
        let value = match width {
            Width::Word => value,
            _ => self.b.ins().ireduce(width.ty(), value),
        };

        if slot != 0 {
            let slot_addr = self.b.ins().iconst(self.ptr_ty, slot as i64);
            let null = self.b.ins().iconst(types::I64, 0);
            self.b.ins().store(MemFlags::trusted(), null, slot_addr, 0);
        }

        let regs = self.get(REGS);
        let status = self
            .b
            .ins()
            .load(types::I32, MemFlags::trusted(), regs, Registers::cp0_offset(STATUS));
        let isc = self.k(STATUS_ISC);
        let isolated = self.b.ins().band(status, isc);

        let store_block = self.b.create_block();
        let done = self.b.create_block();
        self.b.ins().brif(isolated, done, &[], store_block, &[]);
        self.b.seal_block(store_block);

        self.b.switch_to_block(store_block);
        let addr = self.mem_addr(base, offset);
        self.b.ins().store(MemFlags::new().with_notrap(), value, addr, 0);
        self.b.ins().jump(done, &[]);
        self.b.seal_block(done);

        self.b.switch_to_block(done);
    }

    /// Pops the KU/IE stack of the Status register.
    pub fn rfe(&mut self) {
        let regs = self.get(REGS);
        let offset = Registers::cp0_offset(STATUS);
        let status = self.b.ins().load(types::I32, MemFlags::trusted(), regs, offset);
        let keep_mask = self.k(!0xF);
        let keep = self.b.ins().band(status, keep_mask);
        let stack_mask = self.k(0x3C);
        let stack = self.b.ins().band(status, stack_mask);
        let sa = self.k(2);
        let popped = self.b.ins().ushr(stack, sa);
        let status = self.b.ins().bor(keep, popped);
        self.b.ins().store(MemFlags::trusted(), status, regs, offset);
    }

    /// Calls a runtime helper at an absolute address. The runtime pointer is
    /// passed first, followed by `args` argument codes starting at
    /// `ARG_BASE`. A word result lands in `RETVAL`.
    pub fn call(&mut self, helper: usize, args: usize, returns: Returns) -> Option<Value> {
        let mut sig = Signature::new(self.call_conv);
        sig.params.push(AbiParam::new(self.ptr_ty));
        for _ in 0..args {
            sig.params.push(AbiParam::new(types::I32));
        }
        match returns {
            Returns::Nothing => {}
            Returns::Word => sig.returns.push(AbiParam::new(types::I32)),
            Returns::Pointer => sig.returns.push(AbiParam::new(self.ptr_ty)),
        }
        let sig_ref = self.b.import_signature(sig);

        let mut values = vec![self.get(RUNTIME)];
        for n in 0..args {
            values.push(self.get(ARG_BASE + n));
        }

        let callee = self.b.ins().iconst(self.ptr_ty, helper as i64);
        let call = self.b.ins().call_indirect(sig_ref, callee, &values);
        let result = self.b.inst_results(call).first().copied();

        if returns == Returns::Word {
            if let Some(value) = result {
                self.def(RETVAL, value);
            }
        }
        result
    }

    /// Splits control flow on `cond`, returning the (taken, not taken) blocks.
    pub fn fork(&mut self, cond: Cond, a: usize, b: usize) -> (Block, Block) {
        let a = self.get(a);
        let zero = self.k(0);
        let test = match cond {
            Cond::Eq => {
                let b = self.get(b);
                self.b.ins().icmp(IntCC::Equal, a, b)
            }
            Cond::Ne => {
                let b = self.get(b);
                self.b.ins().icmp(IntCC::NotEqual, a, b)
            }
            Cond::Ltz => self.b.ins().icmp(IntCC::SignedLessThan, a, zero),
            Cond::Gez => self.b.ins().icmp(IntCC::SignedGreaterThanOrEqual, a, zero),
            Cond::Lez => self.b.ins().icmp(IntCC::SignedLessThanOrEqual, a, zero),
            Cond::Gtz => self.b.ins().icmp(IntCC::SignedGreaterThan, a, zero),
        };

        let taken = self.b.create_block();
        let not_taken = self.b.create_block();
        self.b.ins().brif(test, taken, &[], not_taken, &[]);
        self.b.seal_block(taken);
        self.b.seal_block(not_taken);
        (taken, not_taken)
    }

    pub fn switch_to(&mut self, block: Block) {
        self.b.switch_to_block(block);
    }

    pub fn ret(&mut self, value: Value) {
        self.b.ins().return_(&[value]);
    }
}
