// busmap-rs/src/core/bankswitch/avigo.rs

//! TI Avigo 10 banking.
//!
//! The Z80 program space is split into four 16 KiB windows:
//!
//! | window | contents                                            |
//! |--------|-----------------------------------------------------|
//! | 0x0000 | flash 0, block 0                                    |
//! | 0x4000 | flash selected by `rom_bank_h`, block `rom_bank_l`  |
//! | 0x8000 | RAM, screen buffer or flash, chosen by `ram_bank_h` |
//! | 0xC000 | RAM block 0                                         |
//!
//! The four bank registers sit at I/O ports 0x05..=0x08 and read back.

use log::{debug, warn};

use crate::core::memory::{
    shared, Access, AddressSpace, FlashWindow, MapEditor, MemoryResult, RegionId, SharedFlash,
    SharedHandler,
};

use super::BankSwitch;

/// Size of one Avigo window and of one flash/RAM block.
pub const BLOCK_SIZE: u32 = 0x4000;

/// 128 KiB of RAM.
pub const RAM_SIZE: usize = 0x2_0000;

/// First bank-select port in I/O space.
pub const PORT_BASE: u32 = 0x05;
pub const PORT_END: u32 = 0x08;

const ROM_BANK_L: u32 = 0;
const ROM_BANK_H: u32 = 1;
const RAM_BANK_L: u32 = 2;
const RAM_BANK_H: u32 = 3;

const RAM_BANK: &str = "bank3";
const RAM_BANK_TOP: &str = "bank4";

/// Resource visible in the 0x8000 window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window8000 {
    Ram { offset: usize },
    Flash { chip: usize, base: u32 },
    Screen,
}

pub struct AvigoBanking {
    flashes: [SharedFlash; 3],
    ram: RegionId,
    screen: SharedHandler,
    rom_bank_l: u8,
    rom_bank_h: u8,
    ram_bank_l: u8,
    ram_bank_h: u8,
    // what the target space currently shows, to skip redundant installs
    mapped_rom: Option<(usize, u32)>,
    mapped_8000: Option<Window8000>,
}

impl AvigoBanking {
    /// `ram` must hold at least [`RAM_SIZE`] bytes; `screen` is the video
    /// device paged in when `ram_bank_h` is 0x06.
    pub fn new(flashes: [SharedFlash; 3], ram: RegionId, screen: SharedHandler) -> Self {
        Self {
            flashes,
            ram,
            screen,
            rom_bank_l: 0,
            rom_bank_h: 0,
            ram_bank_l: 0,
            ram_bank_h: 0,
            mapped_rom: None,
            mapped_8000: None,
        }
    }

    /// Flash chip paged at 0x4000.
    ///
    /// 000 = flash 0, 011 = flash 1, 101 = flash 2; the remaining codes
    /// leave flash 0 in place.
    pub fn flash_at_4000(&self) -> usize {
        match self.rom_bank_h {
            0x03 => 1,
            0x05 => 2,
            _ => 0,
        }
    }

    /// Decodes `ram_bank_h`/`ram_bank_l` for the 0x8000 window.
    pub fn window_8000(&self) -> Window8000 {
        let block = u32::from(self.ram_bank_l) * BLOCK_SIZE;
        match self.ram_bank_h {
            0x01 => self.ram_window(),
            0x03 => Window8000::Flash { chip: 1, base: block },
            0x06 => Window8000::Screen,
            0x07 => Window8000::Flash { chip: 0, base: block },
            _ => self.ram_window(),
        }
    }

    fn ram_window(&self) -> Window8000 {
        Window8000::Ram {
            offset: usize::from(self.ram_bank_l & 0x07) * BLOCK_SIZE as usize,
        }
    }

    fn rom_window(&self) -> (usize, u32) {
        (self.flash_at_4000(), u32::from(self.rom_bank_l) * BLOCK_SIZE)
    }
}

/// True when a write moves `ram_bank_h` to an encoding with no decode.
fn newly_undefined(old: u8, new: u8) -> bool {
    new != old && !matches!(new, 0x01 | 0x03 | 0x06 | 0x07)
}

impl BankSwitch for AvigoBanking {
    fn name(&self) -> &str {
        "avigo"
    }

    fn install(&mut self, space: &mut AddressSpace) -> MemoryResult<()> {
        space.install_device(
            0x0000,
            0x3FFF,
            shared(FlashWindow::new(self.flashes[0].clone(), 0)),
            Access::READ_WRITE,
        )?;
        space.install_bank(0xC000, 0xFFFF, RAM_BANK_TOP, self.ram, 0)?;
        self.mapped_rom = None;
        self.mapped_8000 = None;
        self.refresh_memory(space)
    }

    fn write_control(&mut self, offset: u32, data: u8) -> bool {
        debug!("avigo: bank port {:#04x} <- {:#04x}", PORT_BASE + offset, data);
        match offset {
            ROM_BANK_L => self.rom_bank_l = data & 0x3F,
            ROM_BANK_H => self.rom_bank_h = data,
            RAM_BANK_L => self.ram_bank_l = data & 0x3F,
            RAM_BANK_H => {
                if newly_undefined(self.ram_bank_h, data) {
                    warn!("avigo: undefined ram_bank_h {:#04x}, using RAM", data);
                }
                self.ram_bank_h = data;
            }
            _ => return false,
        }
        true
    }

    fn read_control(&self, offset: u32) -> u8 {
        match offset {
            ROM_BANK_L => self.rom_bank_l,
            ROM_BANK_H => self.rom_bank_h,
            RAM_BANK_L => self.ram_bank_l,
            RAM_BANK_H => self.ram_bank_h,
            _ => 0xFF,
        }
    }

    fn refresh_memory(&mut self, editor: &mut dyn MapEditor) -> MemoryResult<()> {
        let rom = self.rom_window();
        if self.mapped_rom != Some(rom) {
            let (chip, base) = rom;
            debug!("avigo: 0x4000 <- flash{} block {:#x}", chip, base);
            editor.map_device(
                0x4000,
                0x7FFF,
                shared(FlashWindow::new(self.flashes[chip].clone(), base)),
                Access::READ_WRITE,
            )?;
            self.mapped_rom = Some(rom);
        }

        let window = self.window_8000();
        if self.mapped_8000 == Some(window) {
            return Ok(());
        }
        debug!("avigo: 0x8000 <- {:?}", window);
        match window {
            Window8000::Ram { offset } => {
                if matches!(self.mapped_8000, Some(Window8000::Ram { .. })) {
                    editor.set_bank_pointer(RAM_BANK, self.ram, offset)?;
                } else {
                    editor.map_bank(0x8000, 0xBFFF, RAM_BANK, Some((self.ram, offset)), Access::READ_WRITE)?;
                }
            }
            Window8000::Flash { chip, base } => {
                // write strobe is not wired in this window
                editor.map_device(
                    0x8000,
                    0xBFFF,
                    shared(FlashWindow::read_only(self.flashes[chip].clone(), base)),
                    Access::READ_WRITE,
                )?;
            }
            Window8000::Screen => {
                editor.map_device(0x8000, 0xBFFF, self.screen.clone(), Access::READ_WRITE)?;
            }
        }
        self.mapped_8000 = Some(window);
        Ok(())
    }

    fn reset(&mut self) {
        self.rom_bank_l = 0;
        self.rom_bank_h = 0;
        self.ram_bank_l = 0;
        self.ram_bank_h = 0;
    }

    fn save_state(&self) -> Vec<u8> {
        vec![self.rom_bank_l, self.rom_bank_h, self.ram_bank_l, self.ram_bank_h]
    }

    fn load_state(&mut self, data: &[u8]) -> bool {
        let [rom_l, rom_h, ram_l, ram_h] = match data {
            [a, b, c, d, ..] => [*a, *b, *c, *d],
            _ => return false,
        };
        self.rom_bank_l = rom_l & 0x3F;
        self.rom_bank_h = rom_h;
        self.ram_bank_l = ram_l & 0x3F;
        self.ram_bank_h = ram_h;
        true
    }
}
