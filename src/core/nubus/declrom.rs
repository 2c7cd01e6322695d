// busmap-rs/src/core/nubus/declrom.rs

//! NuBus declaration ROM byte lanes.
//!
//! A card's declaration ROM may be wired to any subset of the four byte
//! lanes of the 32-bit bus. The last ROM byte (the format block's
//! `byteLanes` field) says which: its low nibble is the lane mask and the
//! high nibble its complement. A second-to-last byte of 0xFF marks a ROM
//! stored with every bit inverted.
//!
//! Expanded images are kept in bus address order, so lane `n` of group `i`
//! lives at offset `i * 4 + n`.

use crate::core::memory::{MemoryError, MemoryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteLanes {
    /// 0x0F: all four lanes.
    All,
    /// 0xE1
    Lane0,
    /// 0xD2
    Lane1,
    /// 0xB4
    Lane2,
    /// 0x78
    Lane3,
    /// 0xC3: lanes 0 and 1.
    Lanes01,
    /// 0x3C: lanes 2 and 3.
    Lanes23,
}

impl ByteLanes {
    pub const ALL: [ByteLanes; 7] = [
        ByteLanes::All,
        ByteLanes::Lane0,
        ByteLanes::Lane1,
        ByteLanes::Lane2,
        ByteLanes::Lane3,
        ByteLanes::Lanes01,
        ByteLanes::Lanes23,
    ];

    pub fn from_code(code: u8) -> MemoryResult<Self> {
        match code {
            0x0F => Ok(ByteLanes::All),
            0xE1 => Ok(ByteLanes::Lane0),
            0xD2 => Ok(ByteLanes::Lane1),
            0xB4 => Ok(ByteLanes::Lane2),
            0x78 => Ok(ByteLanes::Lane3),
            0xC3 => Ok(ByteLanes::Lanes01),
            0x3C => Ok(ByteLanes::Lanes23),
            other => Err(MemoryError::BadByteLanes(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ByteLanes::All => 0x0F,
            ByteLanes::Lane0 => 0xE1,
            ByteLanes::Lane1 => 0xD2,
            ByteLanes::Lane2 => 0xB4,
            ByteLanes::Lane3 => 0x78,
            ByteLanes::Lanes01 => 0xC3,
            ByteLanes::Lanes23 => 0x3C,
        }
    }

    /// Lanes carrying data, lowest first.
    pub fn lanes(self) -> &'static [usize] {
        match self {
            ByteLanes::All => &[0, 1, 2, 3],
            ByteLanes::Lane0 => &[0],
            ByteLanes::Lane1 => &[1],
            ByteLanes::Lane2 => &[2],
            ByteLanes::Lane3 => &[3],
            ByteLanes::Lanes01 => &[0, 1],
            ByteLanes::Lanes23 => &[2, 3],
        }
    }

    /// Growth factor from ROM bytes to bus bytes.
    pub fn expansion(self) -> usize {
        4 / self.lanes().len()
    }
}

/// A declaration ROM laid out for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclRom {
    pub lanes: ByteLanes,
    pub inverted: bool,
    pub image: Vec<u8>,
}

/// Decodes the trailing format bytes and spreads `rom` over its lanes.
pub fn expand(tag: &str, rom: &[u8]) -> MemoryResult<DeclRom> {
    let len = rom.len();
    if len < 2 {
        return Err(MemoryError::DeclRomTooSmall {
            region: tag.to_owned(),
            len,
        });
    }

    let mut code = rom[len - 1];
    let inverted = rom[len - 2] == 0xFF;
    if inverted {
        code ^= 0xFF;
    }
    let lanes = ByteLanes::from_code(code)?;

    let mut image = spread(rom, lanes);
    if inverted {
        for byte in &mut image {
            *byte ^= 0xFF;
        }
    }

    Ok(DeclRom {
        lanes,
        inverted,
        image,
    })
}

/// Places `rom` bytes on the wired lanes of consecutive 4-byte groups.
fn spread(rom: &[u8], lanes: ByteLanes) -> Vec<u8> {
    if lanes == ByteLanes::All {
        return rom.to_vec();
    }
    let wired = lanes.lanes();
    let mut image = vec![0u8; rom.len() * lanes.expansion()];
    // a trailing partial group is dropped
    for (group, bytes) in rom.chunks_exact(wired.len()).enumerate() {
        for (&lane, &byte) in wired.iter().zip(bytes) {
            image[group * 4 + lane] = byte;
        }
    }
    image
}

/// Reads the populated lanes of `image` back in order.
pub fn collapse(image: &[u8], lanes: ByteLanes) -> Vec<u8> {
    match lanes {
        ByteLanes::All => image.to_vec(),
        _ => image
            .chunks(4)
            .flat_map(|group| lanes.lanes().iter().filter_map(move |&lane| group.get(lane).copied()))
            .collect(),
    }
}
