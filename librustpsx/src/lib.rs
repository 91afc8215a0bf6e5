/* PlayStation R3000A dynamic recompiler */
pub mod cpu;
pub mod bus;
pub mod error;
pub mod r3000a;

pub use bus::Bus;
pub use bus::bios::BIOS;
pub use error::Error;
pub use r3000a::R3000A;
