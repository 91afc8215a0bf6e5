use thiserror::Error;

/// Fatal conditions raised by the recompiler and the backends that drive it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("code region allocation failed: {0}")]
    Region(#[from] region::Error),

    #[error("no code is mapped at guest address 0x{0:08X}")]
    UnmappedCode(u32),

    #[error("register allocator invariant violated: {0}")]
    Allocator(String),

    #[error("code generation failed: {0}")]
    Codegen(String),

    #[error("host ISA unavailable: {0}")]
    Isa(String),

    #[error("a {size} byte block does not fit in a {capacity} byte code region")]
    BlockTooLarge { size: usize, capacity: usize },

    #[error("the recompiler has been shut down")]
    Shutdown,
}
