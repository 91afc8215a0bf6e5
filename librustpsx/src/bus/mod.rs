pub mod bios;

use bios::BIOS;
use tracing::{debug, trace};

pub mod map {
    #[derive(Clone, Copy)]
    pub struct Range(pub u32, pub u32);

    impl Range {
        pub fn contains(self, addr: u32) -> Option<u32> {
            let Range(start, length) = self;
            if addr >= start && addr < start + length {
                Some(addr - start)
            } else {
                None
            }
        }
    }

    // Physical address ranges
    pub const RAM:       Range = Range(0x0000_0000, 8 * 1024 * 1024);
    pub const EXPANSION: Range = Range(0x1F00_0000, 8 * 1024 * 1024);
    pub const HW:        Range = Range(0x1F80_0000, 64 * 1024);
    pub const BIOS:      Range = Range(0x1FC0_0000, 512 * 1024);

    pub const CACHE_CONTROL: u32 = 0xFFFE_0130;
}

pub const RAM_SIZE: usize = 2 * 1024 * 1024;
pub const RAM_MASK: u32 = RAM_SIZE as u32 - 1;
pub const HW_SIZE: usize = 64 * 1024;

// Scratchpad and I/O register window inside the hardware page
pub const SCRATCHPAD_END: u32 = 0x1F80_1000;
pub const I_STAT: u32 = 0x1F80_1070;
pub const I_MASK: u32 = 0x1F80_1074;

enum Target {
    Ram(usize),
    Hw(usize),
    Bios(usize),
    Expansion,
    CacheControl,
    Unmapped,
}

/// Guest physical memory: main RAM, the hardware page (scratchpad plus latched
/// I/O registers) and the boot ROM.
pub struct Bus {
    pub(crate) bios: BIOS,
    pub(crate) ram: Vec<u8>,
    pub(crate) hw: Vec<u8>,
}

impl Bus {
    pub fn new(bios: BIOS) -> Bus {
        Bus {
            bios,
            ram: vec![0; RAM_SIZE],
            hw: vec![0; HW_SIZE],
        }
    }

    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.hw.fill(0);
    }

    fn decode(addr: u32) -> Target {
        if addr == map::CACHE_CONTROL {
            return Target::CacheControl;
        }

        // KUSEG, KSEG0 and KSEG1 fold onto the physical map; KSEG2 holds
        // nothing but the cache control register
        let phys = match addr >> 29 {
            0 | 4 | 5 => addr & 0x1FFF_FFFF,
            _ => return Target::Unmapped,
        };
        if let Some(offset) = map::RAM.contains(phys) {
            Target::Ram((offset & RAM_MASK) as usize)
        } else if let Some(offset) = map::HW.contains(phys) {
            Target::Hw(offset as usize)
        } else if let Some(offset) = map::BIOS.contains(phys) {
            Target::Bios(offset as usize)
        } else if map::EXPANSION.contains(phys).is_some() {
            Target::Expansion
        } else {
            Target::Unmapped
        }
    }

    /// Reads an instruction word. Only RAM and ROM hold executable code.
    pub fn fetch(&self, addr: u32) -> Option<u32> {
        match Bus::decode(addr & !3) {
            Target::Ram(offset) => Some(load32(&self.ram, offset)),
            Target::Bios(offset) => Some(load32(&self.bios.bytes, offset)),
            _ => None,
        }
    }

    /// Side-effect free boot ROM read, used to fold constant loads.
    pub fn rom32(&self, addr: u32) -> Option<u32> {
        match Bus::decode(addr & !3) {
            Target::Bios(offset) => Some(load32(&self.bios.bytes, offset)),
            _ => None,
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        match Bus::decode(addr) {
            Target::Ram(offset) => self.ram[offset],
            Target::Hw(offset) => {
                trace!("Hardware read8 0x{:08X}", addr);
                self.hw[offset]
            }
            Target::Bios(offset) => self.bios.bytes[offset],
            Target::Expansion => 0xFF,
            _ => {
                debug!("Unmapped read8 from 0x{:08X}", addr);
                0
            }
        }
    }

    pub fn read16(&self, addr: u32) -> u16 {
        let addr = addr & !1;
        match Bus::decode(addr) {
            Target::Ram(offset) => load16(&self.ram, offset),
            Target::Hw(offset) => {
                trace!("Hardware read16 0x{:08X}", addr);
                load16(&self.hw, offset)
            }
            Target::Bios(offset) => load16(&self.bios.bytes, offset),
            Target::Expansion => 0xFFFF,
            _ => {
                debug!("Unmapped read16 from 0x{:08X}", addr);
                0
            }
        }
    }

    pub fn read32(&self, addr: u32) -> u32 {
        let addr = addr & !3;
        match Bus::decode(addr) {
            Target::Ram(offset) => load32(&self.ram, offset),
            Target::Hw(offset) => {
                trace!("Hardware read32 0x{:08X}", addr);
                load32(&self.hw, offset)
            }
            Target::Bios(offset) => load32(&self.bios.bytes, offset),
            Target::Expansion => 0xFFFF_FFFF,
            _ => {
                debug!("Unmapped read32 from 0x{:08X}", addr);
                0
            }
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        match Bus::decode(addr) {
            Target::Ram(offset) => self.ram[offset] = value,
            Target::Hw(offset) => {
                trace!("Hardware write8 0x{:08X} = 0x{:02X}", addr, value);
                self.hw[offset] = value;
            }
            _ => debug!("Dropped write8 to 0x{:08X}", addr),
        }
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        let addr = addr & !1;
        match Bus::decode(addr) {
            Target::Ram(offset) => store16(&mut self.ram, offset, value),
            Target::Hw(offset) => {
                trace!("Hardware write16 0x{:08X} = 0x{:04X}", addr, value);
                let value = if addr == I_STAT {
                    load16(&self.hw, offset) & value
                } else {
                    value
                };
                store16(&mut self.hw, offset, value);
            }
            _ => debug!("Dropped write16 to 0x{:08X}", addr),
        }
    }

    pub fn write32(&mut self, addr: u32, value: u32) {
        let addr = addr & !3;
        match Bus::decode(addr) {
            Target::Ram(offset) => store32(&mut self.ram, offset, value),
            Target::Hw(offset) => {
                trace!("Hardware write32 0x{:08X} = 0x{:08X}", addr, value);
                // Writing I_STAT acknowledges the bits that are written as zero
                let value = if addr == I_STAT {
                    load32(&self.hw, offset) & value
                } else {
                    value
                };
                store32(&mut self.hw, offset, value);
            }
            Target::CacheControl => trace!("Cache control write 0x{:08X}", value),
            _ => debug!("Dropped write32 to 0x{:08X}", addr),
        }
    }

    /// Copies `bytes` into RAM starting at `addr`, bypassing the write path.
    pub fn load_ram(&mut self, addr: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let offset = (addr.wrapping_add(i as u32) & RAM_MASK) as usize;
            self.ram[offset] = *byte;
        }
    }

    /// Raises interrupt request lines in I_STAT, as a peripheral would.
    pub fn raise_irq(&mut self, mask: u32) {
        let offset = (I_STAT - map::HW.0) as usize;
        let pending = load32(&self.hw, offset) | mask;
        store32(&mut self.hw, offset, pending);
    }
}

fn load16(mem: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([mem[offset], mem[offset + 1]])
}

fn load32(mem: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([mem[offset], mem[offset + 1], mem[offset + 2], mem[offset + 3]])
}

fn store16(mem: &mut [u8], offset: usize, value: u16) {
    mem[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn store32(mem: &mut [u8], offset: usize, value: u32) {
    mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Bus {
        Bus::new(BIOS::from_words(&[0x3C08_1234, 0x3508_5678]))
    }

    #[test]
    fn ram_is_mirrored_across_segments() {
        let mut bus = bus();
        bus.write32(0x8001_0000, 0xDEAD_BEEF);
        assert_eq!(bus.read32(0x0001_0000), 0xDEAD_BEEF);
        assert_eq!(bus.read32(0xA001_0000), 0xDEAD_BEEF);
        assert_eq!(bus.read32(0x0021_0000), 0xDEAD_BEEF);
    }

    #[test]
    fn bios_is_read_only() {
        let mut bus = bus();
        bus.write32(0xBFC0_0000, 0);
        assert_eq!(bus.read32(0xBFC0_0000), 0x3C08_1234);
        assert_eq!(bus.fetch(0x9FC0_0004), Some(0x3508_5678));
    }

    #[test]
    fn fetch_rejects_unmapped_code() {
        let bus = bus();
        assert_eq!(bus.fetch(0x1F80_0000), None);
        assert_eq!(bus.fetch(0x6000_0000), None);
        assert_eq!(bus.fetch(0xC000_0000), None);
        assert_eq!(bus.fetch(0xFFFE_0130), None);
    }

    #[test]
    fn only_the_three_low_segments_alias_ram() {
        let mut bus = bus();
        bus.write32(0x0000_0100, 0x1234_5678);
        assert_eq!(bus.read32(0x2000_0100), 0);
        assert_eq!(bus.read32(0x6000_0100), 0);
        assert_eq!(bus.read32(0xC000_0100), 0);
        bus.write32(0xE000_0100, 0xFFFF_FFFF);
        assert_eq!(bus.read32(0x8000_0100), 0x1234_5678);
    }

    #[test]
    fn i_stat_writes_acknowledge() {
        let mut bus = bus();
        bus.raise_irq(0b101);
        bus.write32(I_STAT, !0b001);
        assert_eq!(bus.read32(I_STAT), 0b100);
        bus.write32(I_MASK, 0xFF);
        assert_eq!(bus.read32(I_MASK), 0xFF);
    }
}
