// busmap-rs/src/core/nubus/mod.rs

//! Apple NuBus slot controller.
//!
//! Cards sit in slots 0x9..=0xE. Each slot owns the 16 MiB standard slot
//! space at `0xFs00_0000`; a card claims windows there through the
//! [`CardContext`] it receives at start-up, and the bus refuses anything that
//! would leave the slot. Every slot has its own interrupt line, forwarded to
//! whatever callback the CPU side registered.

pub mod declrom;

pub use declrom::{ByteLanes, DeclRom};

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::core::memory::{
    Access, AccessWidth, AddressSpace, BankId, MemoryError, MemoryRegion, MemoryResult, RegionId,
    SharedHandler, SharedRegions,
};

/// Lowest populated slot.
pub const SLOT_MIN: u8 = 0x9;
/// Highest populated slot.
pub const SLOT_MAX: u8 = 0xE;
/// Size of one standard slot space.
pub const SLOT_SPACE_SIZE: u32 = 0x0100_0000;

const SLOT_COUNT: usize = (SLOT_MAX - SLOT_MIN + 1) as usize;

/// Start of the standard slot space of `slot`.
pub const fn slot_base(slot: u8) -> u32 {
    0xF000_0000 | ((slot as u32) << 24)
}

/// Slot tag ("nb9".."nbe"), used to keep bank names unique.
pub fn slot_tag(slot: u8) -> String {
    format!("nb{:x}", slot)
}

fn check_slot(slot: u8) -> MemoryResult<usize> {
    if (SLOT_MIN..=SLOT_MAX).contains(&slot) {
        Ok(usize::from(slot - SLOT_MIN))
    } else {
        Err(MemoryError::SlotOutOfRange(slot))
    }
}

/// CPU-side interrupt sink.
pub type IrqCallback = Box<dyn FnMut(bool)>;

#[derive(Default)]
struct IrqLines {
    callbacks: [Option<IrqCallback>; SLOT_COUNT],
    state: [bool; SLOT_COUNT],
    // callback taken out while it runs
    running: [bool; SLOT_COUNT],
}

/// Records the new state of line `index` and forwards it. No borrow of
/// `lines` is held while the callback runs, so it may drive other lines or
/// install callbacks.
fn drive_line(lines: &RefCell<IrqLines>, index: usize, state: bool) {
    let slot = index as u8 + SLOT_MIN;
    let callback = {
        let mut lines = lines.borrow_mut();
        lines.state[index] = state;
        if lines.running[index] {
            debug!("NuBus: IRQ {:x} driven from its own callback", slot);
            return;
        }
        let callback = lines.callbacks[index].take();
        lines.running[index] = callback.is_some();
        callback
    };
    match callback {
        Some(mut callback) => {
            callback(state);
            let mut lines = lines.borrow_mut();
            lines.running[index] = false;
            // a callback installed meanwhile replaces this one
            if lines.callbacks[index].is_none() {
                lines.callbacks[index] = Some(callback);
            }
        }
        None if state => warn!("NuBus: IRQ {:x} asserted with no callback", slot),
        None => {}
    }
}

/// Handle a card keeps to drive its slot's interrupt line.
#[derive(Clone)]
pub struct IrqLine {
    index: usize,
    lines: Rc<RefCell<IrqLines>>,
}

impl IrqLine {
    pub fn slot(&self) -> u8 {
        self.index as u8 + SLOT_MIN
    }

    pub fn set(&self, state: bool) {
        drive_line(&self.lines, self.index, state);
    }

    pub fn raise(&self) {
        self.set(true);
    }

    pub fn lower(&self) {
        self.set(false);
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IrqLine({:x})", self.slot())
    }
}

/// An expansion card.
pub trait NubusCard {
    /// Slot the card is plugged into.
    fn slot(&self) -> u8;

    fn name(&self) -> &str;

    /// Claims the card's windows and grabs its IRQ line.
    fn device_start(&mut self, ctx: &mut CardContext<'_>) -> MemoryResult<()>;

    fn device_reset(&mut self) {}
}

/// What a card may touch while starting: its own slot and its IRQ line.
pub struct CardContext<'a> {
    space: &'a mut AddressSpace,
    card: &'a str,
    slot: u8,
    irq: IrqLine,
}

impl CardContext<'_> {
    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn slot_base(&self) -> u32 {
        slot_base(self.slot)
    }

    pub fn slot_tag(&self) -> String {
        slot_tag(self.slot)
    }

    pub fn regions(&self) -> &SharedRegions {
        self.space.regions()
    }

    pub fn irq_line(&self) -> IrqLine {
        self.irq.clone()
    }

    /// Maps a bank at slot-relative `[start, end]`. The bank is named
    /// `<tag>_<slottag>`.
    #[allow(clippy::too_many_arguments)]
    pub fn install_bank(
        &mut self,
        start: u32,
        end: u32,
        mask: u32,
        mirror: u32,
        tag: &str,
        region: RegionId,
        offset: usize,
    ) -> MemoryResult<BankId> {
        let (start, end) = self.window(start, end, mirror)?;
        let name = format!("{}_{}", tag, self.slot_tag());
        debug!("NuBus: {} bank '{}' at {:#x}-{:#x}", self.card, name, start, end);
        self.space
            .install_bank_mirrored(start, end, mask, mirror, &name, Some((region, offset)), Access::READ_WRITE)
    }

    /// Maps a device at slot-relative `[start, end]`.
    pub fn install_device(&mut self, start: u32, end: u32, handler: SharedHandler) -> MemoryResult<()> {
        let (start, end) = self.window(start, end, 0)?;
        debug!("NuBus: {} device at {:#x}-{:#x}", self.card, start, end);
        self.space.install_handler(start, end, handler)
    }

    /// Expands the card's declaration ROM and maps it, read-only, at the top
    /// of the slot space as bank `rom_<slottag>`.
    pub fn install_declaration_rom(&mut self, rom: RegionId) -> MemoryResult<ByteLanes> {
        let (tag, bytes) = {
            let regions = self.space.regions().borrow();
            let region = regions.region(rom)?;
            (region.tag().to_owned(), region.as_slice().to_vec())
        };
        let decl = declrom::expand(&tag, &bytes)?;
        let len = decl.image.len();
        let len32 = u32::try_from(len)
            .ok()
            .filter(|&len| len <= SLOT_SPACE_SIZE)
            .ok_or_else(|| MemoryError::OutsideSlot {
                card: self.card.to_owned(),
                slot: self.slot,
                start: self.slot_base(),
                end: self.slot_base().saturating_add(len.min(u32::MAX as usize) as u32),
            })?;

        let bank = format!("rom_{}", self.slot_tag());
        let image = MemoryRegion::from_bytes(bank.clone(), decl.image, AccessWidth::Dword, self.space.endianness());
        let region = self.space.regions().borrow_mut().add(image)?;

        let end = self.slot_base() + (SLOT_SPACE_SIZE - 1);
        let start = end - (len32 - 1);
        self.space
            .install_bank_mirrored(start, end, 0, 0, &bank, Some((region, 0)), Access::READ)?;
        info!(
            "NuBus: {} declaration ROM '{}' {:?}{} at {:#x}-{:#x}",
            self.card,
            tag,
            decl.lanes,
            if decl.inverted { " inverted" } else { "" },
            start,
            end
        );
        Ok(decl.lanes)
    }

    /// Turns a slot-relative range into bus addresses, refusing anything
    /// that leaves the slot.
    fn window(&self, start: u32, end: u32, mirror: u32) -> MemoryResult<(u32, u32)> {
        let base = self.slot_base();
        let limit = SLOT_SPACE_SIZE - 1;
        if end > limit || start > limit || mirror & !limit != 0 {
            return Err(MemoryError::OutsideSlot {
                card: self.card.to_owned(),
                slot: self.slot,
                start: base.wrapping_add(start),
                end: base.wrapping_add(end),
            });
        }
        Ok((base + start, base + end))
    }
}

/// The bus: cards plus their interrupt lines.
pub struct Nubus {
    cards: Vec<Box<dyn NubusCard>>,
    irq: Rc<RefCell<IrqLines>>,
    started: bool,
}

impl Nubus {
    /// NuBus needs a 32-bit address space with a 32- or 64-bit data bus.
    pub fn new(space: &AddressSpace) -> MemoryResult<Self> {
        let config = space.config();
        if !matches!(config.data_width, AccessWidth::Dword | AccessWidth::Qword) {
            return Err(MemoryError::UnsupportedBusWidth(config.data_width.bits()));
        }
        if config.addr_bits != 32 {
            return Err(MemoryError::UnsupportedAddressBits {
                space: config.name.clone(),
                bits: config.addr_bits,
            });
        }
        info!("NuBus: attached to '{}' ({} data bus)", config.name, config.data_width);
        Ok(Self {
            cards: Vec::new(),
            irq: Rc::default(),
            started: false,
        })
    }

    /// Registers a card. Its slot must be legal and free.
    pub fn add_card(&mut self, card: Box<dyn NubusCard>) -> MemoryResult<()> {
        let slot = card.slot();
        check_slot(slot)?;
        if let Some(occupant) = self.card(slot) {
            return Err(MemoryError::SlotOccupied {
                slot,
                occupant: occupant.name().to_owned(),
                card: card.name().to_owned(),
            });
        }
        info!("NuBus: card '{}' in slot {:x}", card.name(), slot);
        self.cards.push(card);
        Ok(())
    }

    pub fn card(&self, slot: u8) -> Option<&dyn NubusCard> {
        self.cards
            .iter()
            .find(|card| card.slot() == slot)
            .map(|card| card.as_ref())
    }

    pub fn cards(&self) -> impl Iterator<Item = &dyn NubusCard> {
        self.cards.iter().map(|card| card.as_ref())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Runs every card's `device_start` against `space`.
    pub fn start(&mut self, space: &mut AddressSpace) -> MemoryResult<()> {
        if self.started {
            warn!("NuBus: already started");
            return Ok(());
        }
        for card in &mut self.cards {
            let slot = card.slot();
            let name = card.name().to_owned();
            let mut ctx = CardContext {
                space: &mut *space,
                card: &name,
                slot,
                irq: IrqLine {
                    index: check_slot(slot)?,
                    lines: Rc::clone(&self.irq),
                },
            };
            card.device_start(&mut ctx)?;
        }
        self.started = true;
        Ok(())
    }

    pub fn reset(&mut self) {
        for card in &mut self.cards {
            card.device_reset();
        }
    }

    /// Connects slot `slot`'s interrupt line to the CPU side.
    pub fn set_irq_callback(&mut self, slot: u8, callback: impl FnMut(bool) + 'static) -> MemoryResult<()> {
        let index = check_slot(slot)?;
        self.irq.borrow_mut().callbacks[index] = Some(Box::new(callback));
        Ok(())
    }

    /// Handle for driving `slot`'s line from outside a card.
    pub fn irq_line(&self, slot: u8) -> MemoryResult<IrqLine> {
        Ok(IrqLine {
            index: check_slot(slot)?,
            lines: Rc::clone(&self.irq),
        })
    }

    /// Last state driven on `slot`'s line.
    pub fn irq_state(&self, slot: u8) -> bool {
        check_slot(slot)
            .map(|index| self.irq.borrow().state[index])
            .unwrap_or(false)
    }

    /// Drives a slot's IRQ. Slots outside 9..=E are ignored.
    pub fn set_irq_line(&self, slot: u8, state: bool) {
        match check_slot(slot) {
            Ok(index) => drive_line(&self.irq, index, state),
            Err(_) => debug!("NuBus: IRQ for slot {:x} ignored", slot),
        }
    }

    pub fn irq9_w(&self, state: bool) {
        self.set_irq_line(0x9, state);
    }

    pub fn irqa_w(&self, state: bool) {
        self.set_irq_line(0xA, state);
    }

    pub fn irqb_w(&self, state: bool) {
        self.set_irq_line(0xB, state);
    }

    pub fn irqc_w(&self, state: bool) {
        self.set_irq_line(0xC, state);
    }

    pub fn irqd_w(&self, state: bool) {
        self.set_irq_line(0xD, state);
    }

    pub fn irqe_w(&self, state: bool) {
        self.set_irq_line(0xE, state);
    }
}

impl std::fmt::Debug for Nubus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots: Vec<String> = self
            .cards
            .iter()
            .map(|card| format!("{:x}:{}", card.slot(), card.name()))
            .collect();
        f.debug_struct("Nubus")
            .field("cards", &slots)
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{Endianness, RegionArena, SpaceConfig};
    use std::cell::Cell;

    #[derive(Default)]
    struct TestCard {
        slot: u8,
        name: String,
        ram: Option<RegionId>,
        rom: Option<RegionId>,
        // slot-relative window start, to provoke out-of-slot installs
        ram_at: u32,
        irq: Option<IrqLine>,
        resets: Rc<Cell<usize>>,
    }

    impl TestCard {
        fn new(slot: u8, name: &str) -> Self {
            Self {
                slot,
                name: name.into(),
                ..Self::default()
            }
        }
    }

    impl NubusCard for TestCard {
        fn slot(&self) -> u8 {
            self.slot
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn device_start(&mut self, ctx: &mut CardContext<'_>) -> MemoryResult<()> {
            if let Some(ram) = self.ram {
                ctx.install_bank(self.ram_at, self.ram_at.wrapping_add(0xFFF), 0, 0, "vram", ram, 0)?;
            }
            if let Some(rom) = self.rom {
                ctx.install_declaration_rom(rom)?;
            }
            self.irq = Some(ctx.irq_line());
            Ok(())
        }

        fn device_reset(&mut self) {
            self.resets.set(self.resets.get() + 1);
            if let Some(irq) = &self.irq {
                irq.lower();
            }
        }
    }

    fn mac_space() -> AddressSpace {
        AddressSpace::new(SpaceConfig::m68020_program().with_name("maincpu"), RegionArena::shared()).unwrap()
    }

    fn add(space: &AddressSpace, tag: &str, bytes: Vec<u8>) -> RegionId {
        space
            .regions()
            .borrow_mut()
            .add(MemoryRegion::from_bytes(tag, bytes, AccessWidth::Byte, Endianness::Big))
            .unwrap()
    }

    #[test]
    fn test_slot_addresses() {
        assert_eq!(slot_base(0x9), 0xF900_0000);
        assert_eq!(slot_base(0xE), 0xFE00_0000);
        assert_eq!(slot_tag(0xA), "nba");
        assert_eq!(slot_tag(0x9), "nb9");
    }

    #[test]
    fn test_bus_width_checks() {
        let narrow = AddressSpace::new(
            SpaceConfig::m68020_program().with_data_width(AccessWidth::Word),
            RegionArena::shared(),
        )
        .unwrap();
        assert_eq!(Nubus::new(&narrow).unwrap_err(), MemoryError::UnsupportedBusWidth(16));

        let short = AddressSpace::new(
            SpaceConfig::m68020_program().with_addr_bits(24),
            RegionArena::shared(),
        )
        .unwrap();
        assert!(matches!(
            Nubus::new(&short),
            Err(MemoryError::UnsupportedAddressBits { bits: 24, .. })
        ));

        let wide = AddressSpace::new(
            SpaceConfig::m68020_program().with_data_width(AccessWidth::Qword),
            RegionArena::shared(),
        )
        .unwrap();
        assert!(Nubus::new(&wide).is_ok());
    }

    #[test]
    fn test_add_card_validates_slot() {
        let space = mac_space();
        let mut bus = Nubus::new(&space).unwrap();
        assert_eq!(
            bus.add_card(Box::new(TestCard::new(0x8, "early"))),
            Err(MemoryError::SlotOutOfRange(0x8))
        );
        assert_eq!(
            bus.add_card(Box::new(TestCard::new(0xF, "late"))),
            Err(MemoryError::SlotOutOfRange(0xF))
        );
        bus.add_card(Box::new(TestCard::new(0xA, "video"))).unwrap();
        assert!(matches!(
            bus.add_card(Box::new(TestCard::new(0xA, "ethernet"))),
            Err(MemoryError::SlotOccupied { slot: 0xA, ref occupant, .. }) if occupant == "video"
        ));
        assert_eq!(bus.cards().count(), 1);
    }

    #[test]
    fn test_card_bank_in_slot_space() {
        let mut space = mac_space();
        let ram = add(&space, "vram", (0..0x1000).map(|i| i as u8).collect());
        let mut bus = Nubus::new(&space).unwrap();
        let mut card = TestCard::new(0xB, "video");
        card.ram = Some(ram);
        card.ram_at = 0x10_0000;
        bus.add_card(Box::new(card)).unwrap();
        bus.start(&mut space).unwrap();

        assert!(space.bank("vram_nbb").is_some());
        assert_eq!(space.read_dword(0xFB10_0000), 0x0001_0203);
        space.write_byte(0xFB10_0004, 0xEE);
        assert_eq!(space.regions().borrow().get(ram).unwrap().as_slice()[4], 0xEE);
    }

    #[test]
    fn test_card_cannot_leave_its_slot() {
        let mut space = mac_space();
        let ram = add(&space, "vram", vec![0; 0x1000]);
        let mut bus = Nubus::new(&space).unwrap();
        let mut card = TestCard::new(0xB, "rogue");
        card.ram = Some(ram);
        // wraps into slot 9 if added blindly
        card.ram_at = 0xFE00_0000;
        bus.add_card(Box::new(card)).unwrap();
        assert!(matches!(
            bus.start(&mut space),
            Err(MemoryError::OutsideSlot { slot: 0xB, .. })
        ));
        assert_eq!(space.read_byte(0xF900_0000), 0xFF);
        assert!(space.bank("vram_nbb").is_none());
    }

    #[test]
    fn test_declaration_rom_at_top_of_slot() {
        let mut space = mac_space();
        let rom = add(&space, "declrom", vec![0x11, 0x22, 0x00, ByteLanes::Lane3.code()]);
        let mut bus = Nubus::new(&space).unwrap();
        let mut card = TestCard::new(0xC, "display");
        card.rom = Some(rom);
        bus.add_card(Box::new(card)).unwrap();
        bus.start(&mut space).unwrap();

        assert!(space.bank("rom_nbc").is_some());
        assert_eq!(space.read_dword(0xFCFF_FFF0), 0x0000_0011);
        assert_eq!(space.read_dword(0xFCFF_FFF4), 0x0000_0022);
        assert_eq!(space.read_byte(0xFCFF_FFFF), 0x78);
        assert_eq!(space.read_byte(0xFCFF_FFEF), 0xFF);

        // read-only
        space.write_byte(0xFCFF_FFF3, 0x00);
        assert_eq!(space.read_byte(0xFCFF_FFF3), 0x11);
    }

    #[test]
    fn test_bad_declaration_rom_aborts_start() {
        let mut space = mac_space();
        let rom = add(&space, "declrom", vec![0x11, 0x22, 0x00, 0x5A]);
        let mut bus = Nubus::new(&space).unwrap();
        let mut card = TestCard::new(0x9, "broken");
        card.rom = Some(rom);
        bus.add_card(Box::new(card)).unwrap();
        assert_eq!(bus.start(&mut space), Err(MemoryError::BadByteLanes(0x5A)));
        assert!(!bus.is_started());
    }

    #[test]
    fn test_irq_lines() {
        let mut space = mac_space();
        let mut bus = Nubus::new(&space).unwrap();
        let resets = Rc::new(Cell::new(0));
        let mut card = TestCard::new(0xD, "serial");
        card.resets = Rc::clone(&resets);
        bus.add_card(Box::new(card)).unwrap();
        bus.start(&mut space).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.set_irq_callback(0xD, move |state| sink.borrow_mut().push(state)).unwrap();
        assert!(bus.set_irq_callback(0x3, |_| {}).is_err());

        bus.irq_line(0xD).unwrap().raise();
        assert!(bus.irq_state(0xD));
        bus.irqd_w(false);
        bus.set_irq_line(0xD, true);
        // no callback on slot 9; other slots are ignored
        bus.irq9_w(true);
        bus.set_irq_line(0x2, true);
        assert!(bus.irq_state(0x9));

        bus.reset();
        assert_eq!(resets.get(), 1);
        assert_eq!(*seen.borrow(), vec![true, false, true, false]);
        assert!(!bus.irq_state(0xD));
    }

    #[test]
    fn test_irq_callback_can_drive_lines() {
        let space = mac_space();
        let mut bus = Nubus::new(&space).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        // slot 9 forwards to slot A, slot B flips its own line
        let line_a = bus.irq_line(0xA).unwrap();
        let sink = Rc::clone(&seen);
        bus.set_irq_callback(0x9, move |state| {
            sink.borrow_mut().push((0x9, state));
            line_a.set(state);
        })
        .unwrap();
        let sink = Rc::clone(&seen);
        bus.set_irq_callback(0xA, move |state| sink.borrow_mut().push((0xA, state))).unwrap();
        let line_b = bus.irq_line(0xB).unwrap();
        let sink = Rc::clone(&seen);
        bus.set_irq_callback(0xB, move |state| {
            sink.borrow_mut().push((0xB, state));
            line_b.set(!state);
        })
        .unwrap();

        bus.irq9_w(true);
        assert!(bus.irq_state(0x9));
        assert!(bus.irq_state(0xA));
        bus.irqb_w(true);
        assert!(!bus.irq_state(0xB));
        bus.irqb_w(true);
        assert_eq!(
            *seen.borrow(),
            vec![(0x9, true), (0xA, true), (0xB, true), (0xB, true)]
        );
    }
}
