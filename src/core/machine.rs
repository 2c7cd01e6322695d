// busmap-rs/src/core/machine.rs

//! Machine context.
//!
//! A [`Machine`] owns everything a driver configures: the region arena, the
//! program space, an optional I/O space and an optional NuBus. Nothing in
//! the crate is global, so several machines can live side by side.

use std::rc::Rc;

use log::info;

use crate::core::bankswitch::{self, BankSwitch, SharedBankSwitch};
use crate::core::memory::{
    AddressSpace, MemoryError, MemoryRegion, MemoryResult, RegionArena, RegionId, SharedRegions, SpaceConfig,
};
use crate::core::nubus::{Nubus, NubusCard};

/// Which of a machine's spaces to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Program,
    Io,
}

impl std::fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceKind::Program => write!(f, "program"),
            SpaceKind::Io => write!(f, "I/O"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub name: String,
    pub program: SpaceConfig,
    pub io: Option<SpaceConfig>,
    pub nubus: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "machine".into(),
            program: SpaceConfig::z80_program(),
            io: None,
            nubus: false,
        }
    }
}

impl MachineConfig {
    /// Z80 machine: 64 KiB program space plus the 8-bit I/O space.
    pub fn z80(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            io: Some(SpaceConfig::z80_io()),
            ..Self::default()
        }
    }

    /// 68020 machine with NuBus slots.
    pub fn mac_ii(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: SpaceConfig::m68020_program().with_name("maincpu"),
            io: None,
            nubus: true,
        }
    }

    pub fn with_program(mut self, program: SpaceConfig) -> Self {
        self.program = program;
        self
    }

    pub fn with_io(mut self, io: SpaceConfig) -> Self {
        self.io = Some(io);
        self
    }

    pub fn with_nubus(mut self, enabled: bool) -> Self {
        self.nubus = enabled;
        self
    }
}

pub struct Machine {
    name: String,
    regions: SharedRegions,
    program: AddressSpace,
    io: Option<AddressSpace>,
    nubus: Option<Nubus>,
    started: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> MemoryResult<Self> {
        let regions = RegionArena::shared();
        let program = AddressSpace::new(config.program, Rc::clone(&regions))?;
        let io = config
            .io
            .map(|io| AddressSpace::new(io, Rc::clone(&regions)))
            .transpose()?;
        let nubus = if config.nubus { Some(Nubus::new(&program)?) } else { None };
        info!(
            "{}: machine created (io: {}, nubus: {})",
            config.name,
            io.is_some(),
            nubus.is_some()
        );
        Ok(Self {
            name: config.name,
            regions,
            program,
            io,
            nubus,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn regions(&self) -> &SharedRegions {
        &self.regions
    }

    pub fn add_region(&mut self, region: MemoryRegion) -> MemoryResult<RegionId> {
        self.regions.borrow_mut().add(region)
    }

    pub fn program(&mut self) -> &mut AddressSpace {
        &mut self.program
    }

    pub fn io(&mut self) -> Option<&mut AddressSpace> {
        self.io.as_mut()
    }

    pub fn space(&mut self, kind: SpaceKind) -> MemoryResult<&mut AddressSpace> {
        match kind {
            SpaceKind::Program => Ok(&mut self.program),
            SpaceKind::Io => self.io.as_mut().ok_or_else(|| MemoryError::MissingSpace {
                machine: self.name.clone(),
                space: kind.to_string(),
            }),
        }
    }

    pub fn nubus(&mut self) -> Option<&mut Nubus> {
        self.nubus.as_mut()
    }

    /// Plugs a card into the machine's NuBus.
    pub fn add_card(&mut self, card: Box<dyn NubusCard>) -> MemoryResult<()> {
        match self.nubus.as_mut() {
            Some(bus) => bus.add_card(card),
            None => Err(MemoryError::MissingSpace {
                machine: self.name.clone(),
                space: "NuBus".into(),
            }),
        }
    }

    /// Installs a bank-switch controller over the program space, with its
    /// registers at `[start, end]` of `ports`.
    pub fn attach_controller<C: BankSwitch + 'static>(
        &mut self,
        controller: &SharedBankSwitch<C>,
        ports: SpaceKind,
        start: u32,
        end: u32,
    ) -> MemoryResult<()> {
        let ports = match ports {
            SpaceKind::Program => None,
            SpaceKind::Io => Some(self.io.as_mut().ok_or_else(|| MemoryError::MissingSpace {
                machine: self.name.clone(),
                space: ports.to_string(),
            })?),
        };
        bankswitch::attach(controller, &mut self.program, ports, start, end)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Starts the cards and settles any queued remaps.
    pub fn start(&mut self) -> MemoryResult<()> {
        if let Some(bus) = self.nubus.as_mut() {
            bus.start(&mut self.program)?;
        }
        self.program.sync();
        if let Some(io) = self.io.as_mut() {
            io.sync();
        }
        self.started = true;
        info!("{}: started", self.name);
        Ok(())
    }

    pub fn reset(&mut self) {
        if let Some(bus) = self.nubus.as_mut() {
            bus.reset();
        }
        info!("{}: reset", self.name);
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("program", &self.program.name())
            .field("io", &self.io.as_ref().map(|io| io.name().to_owned()))
            .field("nubus", &self.nubus)
            .field("started", &self.started)
            .finish()
    }
}
