//! busmap-rs
//!
//! Address-space, bank-switching and NuBus slot core shared by the machine
//! drivers of a multi-system emulator. Drivers describe a machine's memory
//! map through an [`AddressSpace`]; CPU cores read and write through it.

pub mod core;

pub use crate::core::bankswitch::{attach, BankSwitch, ControlPort, SharedBankSwitch};
pub use crate::core::machine::{Machine, MachineConfig, SpaceKind};
pub use crate::core::memory::{
    Access, AccessWidth, AddressSpace, Endianness, MapEditor, MemoryError, MemoryHandler, MemoryRegion,
    MemoryResult, RegionArena, RegionId, SharedRegions, SpaceConfig,
};
pub use crate::core::nubus::{CardContext, IrqLine, Nubus, NubusCard};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creates a space with its own, fresh region arena.
pub fn standalone_space(config: SpaceConfig) -> MemoryResult<AddressSpace> {
    AddressSpace::new(config, RegionArena::shared())
}
