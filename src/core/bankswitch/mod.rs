// busmap-rs/src/core/bankswitch/mod.rs

//! Per-machine bank-switch controllers.
//!
//! A controller owns a machine's banking registers and its decode table.
//! The registers are reached through a [`ControlPort`] installed in some
//! address space; a write that changes the decoded layout is turned into map
//! edits queued on the target space, so the new layout is visible from the
//! next access on.

pub mod avigo;
pub mod superpet;

pub use avigo::AvigoBanking;
pub use superpet::SuperPetBanking;

use std::cell::RefCell;
use std::rc::Rc;

use log::error;

use crate::core::memory::{shared, AddressSpace, MapEditor, MemoryHandler, MemoryResult, Remapper};

/// Trait for all bank-switch controllers (unified interface)
pub trait BankSwitch {
    /// Short machine name used in logs
    fn name(&self) -> &str;

    /// Lays out the static part of the map and applies the current registers.
    fn install(&mut self, space: &mut AddressSpace) -> MemoryResult<()> {
        self.refresh_memory(space)
    }

    /// Latches a control register. Returns true when the decoded layout
    /// may have changed.
    fn write_control(&mut self, offset: u32, data: u8) -> bool;

    /// Reads a control register back.
    fn read_control(&self, offset: u32) -> u8;

    /// Re-derives the windows from the registers and pushes them to `editor`.
    fn refresh_memory(&mut self, editor: &mut dyn MapEditor) -> MemoryResult<()>;

    /// Power-on register values.
    fn reset(&mut self);

    /// Reset followed by a refresh.
    fn restart(&mut self, editor: &mut dyn MapEditor) -> MemoryResult<()> {
        self.reset();
        self.refresh_memory(editor)
    }

    /// Save controller registers
    fn save_state(&self) -> Vec<u8>;

    /// Load controller registers; call `refresh_memory` afterwards
    fn load_state(&mut self, data: &[u8]) -> bool;
}

/// Shared controller handle.
pub type SharedBankSwitch<C> = Rc<RefCell<C>>;

/// Device adapter exposing a controller's registers on a bus.
pub struct ControlPort<C: BankSwitch> {
    controller: SharedBankSwitch<C>,
    target: Remapper,
}

impl<C: BankSwitch> ControlPort<C> {
    /// `target` is the remapper of the space the controller switches.
    pub fn new(controller: SharedBankSwitch<C>, target: Remapper) -> Self {
        Self { controller, target }
    }

    pub fn controller(&self) -> &SharedBankSwitch<C> {
        &self.controller
    }
}

impl<C: BankSwitch> MemoryHandler for ControlPort<C> {
    fn read(&mut self, offset: u32) -> u64 {
        u64::from(self.controller.borrow().read_control(offset))
    }

    fn write(&mut self, offset: u32, data: u64, _mem_mask: u64) {
        let mut controller = self.controller.borrow_mut();
        if controller.write_control(offset, data as u8) {
            if let Err(err) = controller.refresh_memory(&mut self.target) {
                error!("{}: bank refresh failed: {}", controller.name(), err);
            }
        }
    }
}

/// Installs `controller` into `target` and its registers at
/// `[start, end]` of `ports`. `ports` may be `None` when the registers
/// live inside `target` itself.
pub fn attach<C: BankSwitch + 'static>(
    controller: &SharedBankSwitch<C>,
    target: &mut AddressSpace,
    ports: Option<&mut AddressSpace>,
    start: u32,
    end: u32,
) -> MemoryResult<()> {
    controller.borrow_mut().install(target)?;
    let port = shared(ControlPort::new(Rc::clone(controller), target.remapper()));
    match ports {
        Some(space) => space.install_handler(start, end, port),
        None => target.install_handler(start, end, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{
        Access, AccessWidth, Endianness, MemoryRegion, RegionArena, RegionId, SpaceConfig,
    };

    /// One 16 KiB window over four blocks, selected by register 0.
    struct Toy {
        select: u8,
        region: RegionId,
    }

    impl BankSwitch for Toy {
        fn name(&self) -> &str {
            "toy"
        }

        fn write_control(&mut self, _offset: u32, data: u8) -> bool {
            let changed = self.select != data & 3;
            self.select = data & 3;
            changed
        }

        fn read_control(&self, _offset: u32) -> u8 {
            self.select
        }

        fn refresh_memory(&mut self, editor: &mut dyn MapEditor) -> MemoryResult<()> {
            let offset = usize::from(self.select) * 0x4000;
            editor.map_bank(0x4000, 0x7FFF, "bank1", Some((self.region, offset)), Access::READ)
        }

        fn reset(&mut self) {
            self.select = 0;
        }

        fn save_state(&self) -> Vec<u8> {
            vec![self.select]
        }

        fn load_state(&mut self, data: &[u8]) -> bool {
            match data.first() {
                Some(&select) => {
                    self.select = select & 3;
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn test_switch_visible_on_next_access() {
        let regions = RegionArena::shared();
        let mut rom = vec![0u8; 0x10000];
        for (block, chunk) in rom.chunks_mut(0x4000).enumerate() {
            chunk.fill(block as u8);
        }
        let region = regions
            .borrow_mut()
            .add(MemoryRegion::from_bytes("rom", rom, AccessWidth::Byte, Endianness::Little))
            .unwrap();
        let mut space = AddressSpace::new(SpaceConfig::z80_program(), regions).unwrap();
        let toy = Rc::new(RefCell::new(Toy { select: 0, region }));
        attach(&toy, &mut space, None, 0xFFFF, 0xFFFF).unwrap();

        assert_eq!(space.read_byte(0x4000), 0);
        space.write_byte(0xFFFF, 2);
        assert_eq!(space.read_byte(0xFFFF), 2);
        assert_eq!(space.read_byte(0x4000), 2);

        let saved = toy.borrow().save_state();
        space.write_byte(0xFFFF, 3);
        assert_eq!(space.read_byte(0x4000), 3);
        assert!(toy.borrow_mut().load_state(&saved));
        toy.borrow_mut().refresh_memory(&mut space).unwrap();
        assert_eq!(space.read_byte(0x4000), 2);

        toy.borrow_mut().restart(&mut space).unwrap();
        assert_eq!(space.read_byte(0x4000), 0);
    }
}
