// busmap-rs/src/core/bankswitch/superpet.rs

//! Commodore SuperPET (SP9000/MMF9000) expansion RAM banking.
//!
//! 64 KiB of extra RAM is seen by the 6809 through a 4 KiB window at
//! 0x9000-0x9FFF. Two latches in the 0xEFF8-0xEFFF block control it:
//!
//! * system latch (0xEFF8): bit 0 selects the 6502 (1) or 6809 (0), bit 1
//!   write-enables the window, bit 3 is the diagnostic sense line;
//! * bank select (0xEFFC): bits 0-3 pick the 4 KiB bank, bit 7 enables
//!   writes to the system latch.

use log::{debug, info};

use crate::core::memory::{Access, AddressSpace, MapEditor, MemoryResult, RegionId};

use super::BankSwitch;

pub const WINDOW_START: u32 = 0x9000;
pub const WINDOW_END: u32 = 0x9FFF;
pub const WINDOW_SIZE: usize = 0x1000;
pub const BANK_COUNT: usize = 16;
pub const EXPANSION_RAM_SIZE: usize = WINDOW_SIZE * BANK_COUNT;

/// Latch block in the program space.
pub const PORT_BASE: u32 = 0xEFF8;
pub const PORT_END: u32 = 0xEFFF;

const BANK_NAME: &str = "spet";

const LATCH_6502: u8 = 0x01;
const LATCH_WRITE_ENABLE: u8 = 0x02;
const LATCH_DIAG_SENSE: u8 = 0x08;
const SELECT_LATCH_ENABLE: u8 = 0x80;

pub struct SuperPetBanking {
    ram: RegionId,
    system_latch: u8,
    bank_select: u8,
    mapped_access: Option<Access>,
}

impl SuperPetBanking {
    /// `ram` must hold [`EXPANSION_RAM_SIZE`] bytes.
    pub fn new(ram: RegionId) -> Self {
        Self {
            ram,
            system_latch: 0,
            bank_select: SELECT_LATCH_ENABLE,
            mapped_access: None,
        }
    }

    pub fn bank(&self) -> usize {
        usize::from(self.bank_select & 0x0F)
    }

    pub fn write_enabled(&self) -> bool {
        self.system_latch & LATCH_WRITE_ENABLE != 0
    }

    /// True when the 6502 should run instead of the 6809.
    pub fn cpu_6502_selected(&self) -> bool {
        self.system_latch & LATCH_6502 != 0
    }

    pub fn diagnostic_sense(&self) -> bool {
        self.system_latch & LATCH_DIAG_SENSE != 0
    }

    fn window_access(&self) -> Access {
        if self.write_enabled() {
            Access::READ_WRITE
        } else {
            Access::READ
        }
    }
}

impl BankSwitch for SuperPetBanking {
    fn name(&self) -> &str {
        "superpet"
    }

    fn install(&mut self, space: &mut AddressSpace) -> MemoryResult<()> {
        let access = self.window_access();
        space.install_bank_mirrored(
            WINDOW_START,
            WINDOW_END,
            0,
            0,
            BANK_NAME,
            None,
            access,
        )?;
        space.configure_bank(BANK_NAME, self.ram, 0, BANK_COUNT, WINDOW_SIZE)?;
        info!("superpet: {} banks of {:#x} bytes at {:#x}", BANK_COUNT, WINDOW_SIZE, WINDOW_START);
        self.mapped_access = Some(access);
        self.refresh_memory(space)
    }

    fn write_control(&mut self, offset: u32, data: u8) -> bool {
        match offset {
            0..=3 => {
                if self.bank_select & SELECT_LATCH_ENABLE == 0 {
                    debug!("superpet: system latch write {:#04x} while disabled", data);
                    return false;
                }
                self.system_latch = data;
            }
            _ => self.bank_select = data,
        }
        true
    }

    fn read_control(&self, offset: u32) -> u8 {
        match offset {
            0..=3 => self.system_latch,
            _ => self.bank_select,
        }
    }

    fn refresh_memory(&mut self, editor: &mut dyn MapEditor) -> MemoryResult<()> {
        let access = self.window_access();
        if self.mapped_access != Some(access) {
            debug!("superpet: window access {:?}", access);
            editor.map_bank(WINDOW_START, WINDOW_END, BANK_NAME, None, access)?;
            self.mapped_access = Some(access);
        }
        debug!("superpet: bank {}", self.bank());
        editor.set_bank_entry(BANK_NAME, self.bank())
    }

    fn reset(&mut self) {
        self.system_latch = 0;
        self.bank_select = SELECT_LATCH_ENABLE;
    }

    fn save_state(&self) -> Vec<u8> {
        vec![self.system_latch, self.bank_select]
    }

    fn load_state(&mut self, data: &[u8]) -> bool {
        match data {
            [latch, select, ..] => {
                self.system_latch = *latch;
                self.bank_select = *select;
                true
            }
            _ => false,
        }
    }
}
