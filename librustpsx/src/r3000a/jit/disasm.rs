use capstone::Capstone;
use capstone::arch::BuildsCapstone;
use tracing::trace;

use crate::Error;

/// Host disassembler for compiled blocks.
pub struct Disassembler {
    cs: Capstone,
}

#[cfg(target_arch = "x86_64")]
fn create_disassembler() -> Result<Capstone, capstone::Error> {
    use capstone::arch::x86::ArchMode;
    Capstone::new().x86().mode(ArchMode::Mode64).build()
}

#[cfg(target_arch = "aarch64")]
fn create_disassembler() -> Result<Capstone, capstone::Error> {
    use capstone::arch::arm64::ArchMode;
    Capstone::new().arm64().mode(ArchMode::Arm).build()
}

impl Disassembler {
    pub fn new() -> Result<Self, Error> {
        let cs = create_disassembler().map_err(|e| Error::Isa(e.to_string()))?;
        Ok(Disassembler { cs })
    }

    pub fn log_block(&self, pc: u32, code: &[u8], host: u64) {
        let insns = match self.cs.disasm_all(code, host) {
            Ok(insns) => insns,
            Err(e) => {
                trace!("Block 0x{:08X} could not be disassembled: {}", pc, e);
                return;
            }
        };

        trace!("Block 0x{:08X} ({} bytes at 0x{:X}):", pc, code.len(), host);
        for insn in insns.iter() {
            trace!(
                "  {:016X}: {} {}",
                insn.address(),
                insn.mnemonic().unwrap_or("?"),
                insn.op_str().unwrap_or("")
            );
        }
    }
}
