use crate::Error;

pub trait CPU {
    type RegisterType;

    fn pc(&self) -> u32;
    fn set_pc(&mut self, value: u32);

    fn read_register(&self, index: usize) -> Self::RegisterType;
    fn write_register(&mut self, index: usize, value: Self::RegisterType);

    fn read_cop0_register(&self, index: usize) -> u32;
    fn write_cop0_register(&mut self, index: usize, value: u32);

    fn read32(&self, addr: u32) -> u32;

    fn fetch(&self) -> Option<u32>;
    fn fetch_at(&self, addr: u32) -> Option<u32>;
}

/// The operation set an execution engine exposes to the outer emulator, so
/// the recompiler and the interpreter can be swapped for one another.
pub trait EmulationBackend<C> {
    fn cpu(&mut self) -> &mut C;

    fn reset(&mut self);

    /// Runs one block.
    fn step(&mut self) -> Result<(), Error>;

    /// Runs blocks until the stop flag is raised.
    fn run(&mut self) -> Result<(), Error>;

    /// Runs whole blocks until at least `cycles` guest cycles have elapsed.
    fn run_for_cycles(&mut self, cycles: u64) -> Result<(), Error>;

    /// Notifies the backend that guest memory in `[addr, addr + size)` changed.
    fn clear(&mut self, addr: u32, size: u32);

    fn shutdown(&mut self);
}
