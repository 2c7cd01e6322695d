//! Edições de mapa adiadas.
//!
//! Os registradores de controle de banco costumam ficar no mesmo espaço que
//! eles chaveiam, então um handler não pode emprestar esse espaço durante o
//! acesso. Ele registra a mudança num [`Remapper`]; o [`AddressSpace`] dono
//! aplica a fila antes do próximo acesso.
//!
//! [`AddressSpace`]: super::AddressSpace

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use super::handler::SharedHandler;
use super::region::RegionId;
use super::{Access, MemoryResult};

/// Operações comuns a espaços vivos e filas adiadas.
pub trait MapEditor {
    fn map_memory(&mut self, start: u32, end: u32, region: RegionId, offset: usize, access: Access) -> MemoryResult<()>;

    fn map_bank(
        &mut self,
        start: u32,
        end: u32,
        name: &str,
        pointer: Option<(RegionId, usize)>,
        access: Access,
    ) -> MemoryResult<()>;

    fn map_device(&mut self, start: u32, end: u32, handler: SharedHandler, access: Access) -> MemoryResult<()>;

    fn set_bank_pointer(&mut self, name: &str, region: RegionId, offset: usize) -> MemoryResult<()>;

    fn set_bank_entry(&mut self, name: &str, entry: usize) -> MemoryResult<()>;

    fn unmap(&mut self, start: u32, end: u32) -> MemoryResult<()>;
}

/// Uma edição enfileirada.
#[derive(Debug)]
pub enum MapCommand {
    Memory {
        start: u32,
        end: u32,
        region: RegionId,
        offset: usize,
        access: Access,
    },
    Bank {
        start: u32,
        end: u32,
        name: String,
        pointer: Option<(RegionId, usize)>,
        access: Access,
    },
    Device {
        start: u32,
        end: u32,
        handler: SharedHandler,
        access: Access,
    },
    BankPointer {
        name: String,
        region: RegionId,
        offset: usize,
    },
    BankEntry {
        name: String,
        entry: usize,
    },
    Unmap {
        start: u32,
        end: u32,
    },
}

/// Handle clonável para a fila de edições de um espaço.
#[derive(Debug, Clone)]
pub struct Remapper {
    space: Rc<str>,
    queue: Rc<RefCell<Vec<MapCommand>>>,
    pending: Rc<Cell<bool>>,
}

impl Remapper {
    pub(crate) fn new(space: &str) -> Self {
        Self {
            space: Rc::from(space),
            queue: Rc::default(),
            pending: Rc::default(),
        }
    }

    /// Nome do espaço que esta fila alimenta.
    pub fn space(&self) -> &str {
        &self.space
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    /// Esvazia a fila na ordem de envio.
    pub(crate) fn take(&self) -> Vec<MapCommand> {
        self.pending.set(false);
        std::mem::take(&mut *self.queue.borrow_mut())
    }

    fn push(&self, command: MapCommand) -> MemoryResult<()> {
        debug!("{}: enfileirado {:?}", self.space, command);
        self.queue.borrow_mut().push(command);
        self.pending.set(true);
        Ok(())
    }
}

impl MapEditor for Remapper {
    fn map_memory(&mut self, start: u32, end: u32, region: RegionId, offset: usize, access: Access) -> MemoryResult<()> {
        self.push(MapCommand::Memory { start, end, region, offset, access })
    }

    fn map_bank(
        &mut self,
        start: u32,
        end: u32,
        name: &str,
        pointer: Option<(RegionId, usize)>,
        access: Access,
    ) -> MemoryResult<()> {
        self.push(MapCommand::Bank {
            start,
            end,
            name: name.to_owned(),
            pointer,
            access,
        })
    }

    fn map_device(&mut self, start: u32, end: u32, handler: SharedHandler, access: Access) -> MemoryResult<()> {
        self.push(MapCommand::Device { start, end, handler, access })
    }

    fn set_bank_pointer(&mut self, name: &str, region: RegionId, offset: usize) -> MemoryResult<()> {
        self.push(MapCommand::BankPointer {
            name: name.to_owned(),
            region,
            offset,
        })
    }

    fn set_bank_entry(&mut self, name: &str, entry: usize) -> MemoryResult<()> {
        self.push(MapCommand::BankEntry {
            name: name.to_owned(),
            entry,
        })
    }

    fn unmap(&mut self, start: u32, end: u32) -> MemoryResult<()> {
        self.push(MapCommand::Unmap { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drains_in_order() {
        let mut remap = Remapper::new("program");
        let mut other = remap.clone();
        assert!(!remap.is_pending());

        remap.unmap(0x8000, 0xBFFF).unwrap();
        other.set_bank_entry("bank1", 3).unwrap();
        assert!(remap.is_pending());

        let commands = remap.take();
        assert!(!other.is_pending());
        assert!(matches!(commands[0], MapCommand::Unmap { start: 0x8000, end: 0xBFFF }));
        assert!(matches!(&commands[1], MapCommand::BankEntry { name, entry: 3 } if name == "bank1"));
        assert!(remap.take().is_empty());
    }
}
