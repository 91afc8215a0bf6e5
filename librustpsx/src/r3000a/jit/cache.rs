/*
    Translated code cache: the executable arena and the per-word lookup table
*/

use std::sync::atomic::{fence, AtomicU64, Ordering};

use region::{Allocation, Protection};
use tracing::{debug, info};

use crate::Error;

pub const RECMEM_SIZE: usize = 8 * 1024 * 1024;
pub const RESET_MARGIN: usize = 0x10000;

const CODE_ALIGN: usize = 16;

const RAM_SIZE: usize = 0x20_0000;
const ROM_SIZE: usize = 0x8_0000;
const PAGE_SIZE: usize = 0x1_0000;
const LUT_PAGES: usize = 0x1_0000;

/// Position of a block inside the arena, tagged with the arena generation it
/// was written in. Packed into a lookup slot, where 0 means untranslated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    pub generation: u32,
    pub offset: u32,
}

impl BlockHandle {
    fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.offset)
    }

    fn unpack(raw: u64) -> Option<BlockHandle> {
        if raw == 0 {
            None
        } else {
            Some(BlockHandle {
                generation: (raw >> 32) as u32,
                offset: raw as u32,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Table {
    Ram,
    Rom,
}

/// One 64 KiB guest page of lookup slots.
#[derive(Clone, Copy, Debug)]
struct SlotPage {
    table: Table,
    first: usize,
}

/// Makes freshly written code visible to instruction fetch.
pub fn publish(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        use std::arch::asm;

        let ctr: u64;
        asm!("mrs {}, ctr_el0", out(reg) ctr);
        let dline = 4usize << ((ctr >> 16) & 0xF);
        let iline = 4usize << (ctr & 0xF);

        let start = ptr as usize;
        let end = start + len;

        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr);
            addr += dline;
        }
        asm!("dsb ish");

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr);
            addr += iline;
        }
        asm!("dsb ish", "isb");
    }

    #[cfg(not(target_arch = "aarch64"))]
    let _ = (ptr, len);

    fence(Ordering::SeqCst);
}

struct CodeArena {
    region: Allocation,
    capacity: usize,
    cursor: usize,
}

impl CodeArena {
    fn new(capacity: usize) -> Result<Self, Error> {
        let region = region::alloc(capacity, Protection::READ_EXECUTE)?;
        Ok(CodeArena {
            capacity: region.len(),
            region,
            cursor: 0,
        })
    }

    fn base(&self) -> *const u8 {
        self.region.as_ptr::<u8>()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<u32, Error> {
        let offset = self.cursor.next_multiple_of(CODE_ALIGN);
        if offset + bytes.len() > self.capacity {
            return Err(Error::BlockTooLarge {
                size: bytes.len(),
                capacity: self.capacity - offset.min(self.capacity),
            });
        }

        unsafe {
            let dst = self.region.as_mut_ptr::<u8>().add(offset);
            region::protect(dst, bytes.len(), Protection::READ_WRITE)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            region::protect(dst, bytes.len(), Protection::READ_EXECUTE)?;
            publish(dst, bytes.len());
        }

        self.cursor = offset + bytes.len();
        Ok(offset as u32)
    }
}

pub struct CodeCache {
    arena: CodeArena,
    margin: usize,
    generation: u32,
    ram: Box<[AtomicU64]>,
    rom: Box<[AtomicU64]>,
    lut: Box<[Option<SlotPage>]>,
}

fn slots(count: usize) -> Box<[AtomicU64]> {
    (0..count).map(|_| AtomicU64::new(0)).collect()
}

impl CodeCache {
    pub fn new() -> Result<Self, Error> {
        CodeCache::with_capacity(RECMEM_SIZE, RESET_MARGIN)
    }

    pub fn with_capacity(capacity: usize, margin: usize) -> Result<Self, Error> {
        let mut lut = vec![None; LUT_PAGES].into_boxed_slice();

        // KUSEG, KSEG0 and KSEG1 views of RAM and its mirrors
        for page in 0..0x80 {
            let first = (page & 0x1F) * PAGE_SIZE / 4;
            for base in [0x0000, 0x8000, 0xA000] {
                lut[base + page] = Some(SlotPage { table: Table::Ram, first });
            }
        }
        for page in 0..ROM_SIZE / PAGE_SIZE {
            let first = page * PAGE_SIZE / 4;
            for base in [0x1FC0, 0x9FC0, 0xBFC0] {
                lut[base + page] = Some(SlotPage { table: Table::Rom, first });
            }
        }

        let arena = CodeArena::new(capacity)?;
        info!("Code cache ready, {} KiB", arena.capacity / 1024);

        Ok(CodeCache {
            arena,
            margin,
            generation: 1,
            ram: slots(RAM_SIZE / 4),
            rom: slots(ROM_SIZE / 4),
            lut,
        })
    }

    fn slot(&self, addr: u32) -> Option<&AtomicU64> {
        let page = self.lut[(addr >> 16) as usize]?;
        let index = page.first + ((addr & 0xFFFF) >> 2) as usize;
        match page.table {
            Table::Ram => self.ram.get(index),
            Table::Rom => self.rom.get(index),
        }
    }

    /// Whether code at `addr` can be translated at all.
    pub fn is_mapped(&self, addr: u32) -> bool {
        self.slot(addr).is_some()
    }

    /// Entry point of the block translated at `addr`, if there is a live one.
    pub fn lookup(&self, addr: u32) -> Option<*const u8> {
        let handle = BlockHandle::unpack(self.slot(addr)?.load(Ordering::Acquire))?;
        if handle.generation != self.generation || handle.offset as usize >= self.arena.cursor {
            return None;
        }
        Some(unsafe { self.arena.base().add(handle.offset as usize) })
    }

    pub fn is_translated(&self, addr: u32) -> bool {
        self.lookup(addr).is_some()
    }

    /// Host address of the lookup slot for `addr`, for compiled stores that
    /// clear it.
    pub fn slot_ptr(&self, addr: u32) -> Option<usize> {
        self.slot(addr).map(|slot| slot.as_ptr() as usize)
    }

    /// Copies a compiled block into the arena and records it for `addr`.
    pub fn install(&mut self, addr: u32, code: &[u8]) -> Result<*const u8, Error> {
        if !self.is_mapped(addr) {
            return Err(Error::UnmappedCode(addr));
        }

        let offset = match self.arena.write(code) {
            Ok(offset) => offset,
            Err(Error::BlockTooLarge { .. }) if self.arena.cursor > 0 => {
                self.reset();
                self.arena.write(code)?
            }
            Err(e) => return Err(e),
        };

        let handle = BlockHandle {
            generation: self.generation,
            offset,
        };
        if let Some(slot) = self.slot(addr) {
            slot.store(handle.pack(), Ordering::Release);
        }
        debug!("Installed block 0x{:08X} at +0x{:X} ({} bytes)", addr, offset, code.len());

        Ok(unsafe { self.arena.base().add(offset as usize) })
    }

    /// Forgets every translation covering `[addr, addr + size)`.
    pub fn invalidate(&self, addr: u32, size: u32) {
        let start = u64::from(addr & !3);
        let end = (u64::from(addr) + u64::from(size)).min(1 << 32);
        let mut word = start;
        while word < end {
            if let Some(slot) = self.slot(word as u32) {
                slot.store(0, Ordering::Release);
            }
            word += 4;
        }
    }

    /// Flushes the whole cache once the arena is about to run out.
    pub fn reset_if_full(&mut self) -> bool {
        if self.arena.cursor + self.margin >= self.arena.capacity {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        info!(
            "Resetting code cache ({} of {} bytes used)",
            self.arena.cursor, self.arena.capacity
        );
        self.generation = self.generation.wrapping_add(1).max(1);
        self.arena.cursor = 0;
        for slot in self.ram.iter().chain(self.rom.iter()) {
            slot.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn used(&self) -> usize {
        self.arena.cursor
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity
    }
}
