/*
    R3000A instruction decoding
*/

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline(always)]
    pub fn op(self) -> u32 {
        self.0 >> 26
    }

    #[inline(always)]
    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1F) as usize
    }

    #[inline(always)]
    pub fn sa(self) -> u32 {
        (self.0 >> 6) & 0x1F
    }

    #[inline(always)]
    pub fn funct(self) -> u32 {
        self.0 & 0x3F
    }

    /// Sign-extended 16-bit immediate.
    #[inline(always)]
    pub fn imm(self) -> u32 {
        self.0 as i16 as i32 as u32
    }

    /// Zero-extended 16-bit immediate.
    #[inline(always)]
    pub fn imm_u(self) -> u32 {
        self.0 & 0xFFFF
    }

    #[inline(always)]
    pub fn target(self) -> u32 {
        self.0 & 0x03FF_FFFF
    }

    /// Destination of a relative branch located at `pc`.
    pub fn branch_target(self, pc: u32) -> u32 {
        pc.wrapping_add(4).wrapping_add(self.imm() << 2)
    }

    /// Destination of an absolute jump located at `pc`.
    pub fn jump_target(self, pc: u32) -> u32 {
        (pc.wrapping_add(4) & 0xF000_0000) | (self.target() << 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GteOp {
    Rtps,
    Nclip,
    Op,
    Dpcs,
    Intpl,
    Mvmva,
    Ncds,
    Cdp,
    Ncdt,
    Nccs,
    Cc,
    Ncs,
    Nct,
    Sqr,
    Dcpl,
    Dpct,
    Avsz3,
    Avsz4,
    Rtpt,
    Gpf,
    Gpl,
    Ncct,
}

impl GteOp {
    fn decode(funct: u32) -> Option<GteOp> {
        let op = match funct {
            0x01 => GteOp::Rtps,
            0x06 => GteOp::Nclip,
            0x0C => GteOp::Op,
            0x10 => GteOp::Dpcs,
            0x11 => GteOp::Intpl,
            0x12 => GteOp::Mvmva,
            0x13 => GteOp::Ncds,
            0x14 => GteOp::Cdp,
            0x16 => GteOp::Ncdt,
            0x1B => GteOp::Nccs,
            0x1C => GteOp::Cc,
            0x1E => GteOp::Ncs,
            0x20 => GteOp::Nct,
            0x28 => GteOp::Sqr,
            0x29 => GteOp::Dcpl,
            0x2A => GteOp::Dpct,
            0x2D => GteOp::Avsz3,
            0x2E => GteOp::Avsz4,
            0x30 => GteOp::Rtpt,
            0x3D => GteOp::Gpf,
            0x3E => GteOp::Gpl,
            0x3F => GteOp::Ncct,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    // SPECIAL
    Sll,
    Srl,
    Sra,
    Sllv,
    Srlv,
    Srav,
    Jr,
    Jalr,
    Syscall,
    Break,
    Mfhi,
    Mthi,
    Mflo,
    Mtlo,
    Mult,
    Multu,
    Div,
    Divu,
    Add,
    Addu,
    Sub,
    Subu,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,

    // REGIMM
    Bltz,
    Bgez,
    Bltzal,
    Bgezal,

    J,
    Jal,
    Beq,
    Bne,
    Blez,
    Bgtz,
    Addi,
    Addiu,
    Slti,
    Sltiu,
    Andi,
    Ori,
    Xori,
    Lui,

    // COP0
    Mfc0,
    Cfc0,
    Mtc0,
    Ctc0,
    Rfe,

    // COP2
    Mfc2,
    Cfc2,
    Mtc2,
    Ctc2,
    Gte(GteOp),

    Hle,

    Lb,
    Lh,
    Lwl,
    Lw,
    Lbu,
    Lhu,
    Lwr,
    Sb,
    Sh,
    Swl,
    Sw,
    Swr,
    Lwc2,
    Swc2,

    Null,
}

impl Op {
    pub fn decode(insn: Instruction) -> Op {
        match insn.op() {
            0x00 => Op::special(insn),
            0x01 => match insn.rt() {
                0x00 => Op::Bltz,
                0x01 => Op::Bgez,
                0x10 => Op::Bltzal,
                0x11 => Op::Bgezal,
                _ => Op::Null,
            },
            0x02 => Op::J,
            0x03 => Op::Jal,
            0x04 => Op::Beq,
            0x05 => Op::Bne,
            0x06 => Op::Blez,
            0x07 => Op::Bgtz,
            0x08 => Op::Addi,
            0x09 => Op::Addiu,
            0x0A => Op::Slti,
            0x0B => Op::Sltiu,
            0x0C => Op::Andi,
            0x0D => Op::Ori,
            0x0E => Op::Xori,
            0x0F => Op::Lui,
            0x10 => match insn.rs() {
                0x00 => Op::Mfc0,
                0x02 => Op::Cfc0,
                0x04 => Op::Mtc0,
                0x06 => Op::Ctc0,
                0x10 if insn.funct() == 0x10 => Op::Rfe,
                _ => Op::Null,
            },
            0x12 => match insn.funct() {
                0x00 => match insn.rs() {
                    0x00 => Op::Mfc2,
                    0x02 => Op::Cfc2,
                    0x04 => Op::Mtc2,
                    0x06 => Op::Ctc2,
                    _ => Op::Null,
                },
                funct => GteOp::decode(funct).map_or(Op::Null, Op::Gte),
            },
            0x20 => Op::Lb,
            0x21 => Op::Lh,
            0x22 => Op::Lwl,
            0x23 => Op::Lw,
            0x24 => Op::Lbu,
            0x25 => Op::Lhu,
            0x26 => Op::Lwr,
            0x28 => Op::Sb,
            0x29 => Op::Sh,
            0x2A => Op::Swl,
            0x2B => Op::Sw,
            0x2E => Op::Swr,
            0x32 => Op::Lwc2,
            0x3A => Op::Swc2,
            0x3B => Op::Hle,
            _ => Op::Null,
        }
    }

    fn special(insn: Instruction) -> Op {
        match insn.funct() {
            0x00 => Op::Sll,
            0x02 => Op::Srl,
            0x03 => Op::Sra,
            0x04 => Op::Sllv,
            0x06 => Op::Srlv,
            0x07 => Op::Srav,
            0x08 => Op::Jr,
            0x09 => Op::Jalr,
            0x0C => Op::Syscall,
            0x0D => Op::Break,
            0x10 => Op::Mfhi,
            0x11 => Op::Mthi,
            0x12 => Op::Mflo,
            0x13 => Op::Mtlo,
            0x18 => Op::Mult,
            0x19 => Op::Multu,
            0x1A => Op::Div,
            0x1B => Op::Divu,
            0x20 => Op::Add,
            0x21 => Op::Addu,
            0x22 => Op::Sub,
            0x23 => Op::Subu,
            0x24 => Op::And,
            0x25 => Op::Or,
            0x26 => Op::Xor,
            0x27 => Op::Nor,
            0x2A => Op::Slt,
            0x2B => Op::Sltu,
            _ => Op::Null,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Jr
                | Op::Jalr
                | Op::Bltz
                | Op::Bgez
                | Op::Bltzal
                | Op::Bgezal
                | Op::J
                | Op::Jal
                | Op::Beq
                | Op::Bne
                | Op::Blez
                | Op::Bgtz
        )
    }

    /// General purpose register written by a load whose result the hardware
    /// delivers one instruction late.
    pub fn load_target(self, insn: Instruction) -> Option<usize> {
        match self {
            Op::Mfc0
            | Op::Cfc0
            | Op::Mfc2
            | Op::Cfc2
            | Op::Lb
            | Op::Lh
            | Op::Lwl
            | Op::Lw
            | Op::Lbu
            | Op::Lhu
            | Op::Lwr => Some(insn.rt()).filter(|&rt| rt != 0),
            _ => None,
        }
    }
}
