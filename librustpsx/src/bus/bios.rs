/*
    PSX BIOS Structure
*/

use std::path::Path;
use std::fs;

// BIOS Size is 512KiB
pub const BIOS_SIZE: usize = 512 * 1024;

#[derive(Clone)]
pub struct BIOS {
    // BIOS bytes loaded off from a storage device
    pub bytes: Vec<u8>
}

impl BIOS {
    pub fn new(path: &Path) -> Result<BIOS, std::io::Error> {
        let data: Vec<u8> = fs::read(path)?;

        if data.len() == BIOS_SIZE {
            Ok(BIOS {bytes: data})
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("BIOS image is {} bytes, expected {}", data.len(), BIOS_SIZE),
            ))
        }
    }

    /// Builds a BIOS image out of raw little-endian words, zero-padded to size.
    pub fn from_words(words: &[u32]) -> BIOS {
        let mut bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        bytes.resize(BIOS_SIZE, 0);
        BIOS { bytes }
    }
}
