//! Chips de flash no estilo AMD (Am29F080 e compatíveis).
//!
//! O chip responde à sequência de comandos JEDEC: dois ciclos de desbloqueio
//! em 0x555/0x2AA, depois um byte de comando. A programação só zera bits; um
//! apagamento volta um setor inteiro (ou o chip todo) para 0xFF.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info, warn};

use super::handler::MemoryHandler;
use super::{MemoryError, MemoryResult};

/// Chip compartilhado entre várias janelas.
pub type SharedFlash = Rc<RefCell<FlashChip>>;

const UNLOCK_ADDR1: u32 = 0x555;
const UNLOCK_ADDR2: u32 = 0x2AA;
const COMMAND_MASK: u32 = 0xFFF;

/// Máquina de estados de comandos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    ReadArray,
    Unlock1,
    Unlock2,
    ReadId,
    Program,
    EraseSetup,
    EraseUnlock1,
    EraseUnlock2,
}

#[derive(Debug, Clone)]
pub struct FlashChip {
    tag: String,
    data: Vec<u8>,
    sector_size: usize,
    maker_id: u8,
    device_id: u8,
    mode: FlashMode,
    dirty: bool,
}

impl FlashChip {
    pub const AM29F080_SIZE: usize = 0x10_0000;
    pub const AM29F080_SECTOR: usize = 0x1_0000;

    /// Cria um chip apagado.
    pub fn new(tag: impl Into<String>, size: usize, sector_size: usize, maker_id: u8, device_id: u8) -> Self {
        Self {
            tag: tag.into(),
            data: vec![0xFF; size],
            sector_size: sector_size.max(1),
            maker_id,
            device_id,
            mode: FlashMode::ReadArray,
            dirty: false,
        }
    }

    /// 1 MiB, dezesseis setores de 64 KiB, fabricante AMD.
    pub fn am29f080(tag: impl Into<String>) -> Self {
        Self::new(tag, Self::AM29F080_SIZE, Self::AM29F080_SECTOR, 0x01, 0xD5)
    }

    pub fn shared(self) -> SharedFlash {
        Rc::new(RefCell::new(self))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mode(&self) -> FlashMode {
        self.mode
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copia um dump para o chip (partida a frio). Bytes além da imagem ficam apagados.
    pub fn load(&mut self, image: &[u8]) -> MemoryResult<()> {
        if image.len() > self.data.len() {
            return Err(MemoryError::ImageSize {
                region: self.tag.clone(),
                expected: self.data.len(),
                actual: image.len(),
            });
        }
        self.data[..image.len()].copy_from_slice(image);
        self.data[image.len()..].fill(0xFF);
        info!("flash '{}': carregados {:#x} bytes", self.tag, image.len());
        Ok(())
    }

    /// Devolve e limpa a flag "conteúdo alterado" (para salvar a NVRAM).
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Volta ao modo de leitura.
    pub fn reset(&mut self) {
        self.mode = FlashMode::ReadArray;
    }

    pub fn read(&self, offset: u32) -> u8 {
        match self.mode {
            FlashMode::ReadId => match offset & 0xFF {
                0 => self.maker_id,
                1 => self.device_id,
                // proteção de setor: desprotegido
                _ => 0x00,
            },
            _ => self.byte(offset),
        }
    }

    pub fn write(&mut self, offset: u32, data: u8) {
        let command_addr = offset & COMMAND_MASK;
        self.mode = match (self.mode, data) {
            (FlashMode::Program, _) => {
                self.program(offset, data);
                FlashMode::ReadArray
            }
            (_, 0xF0) => FlashMode::ReadArray,
            (FlashMode::ReadArray | FlashMode::ReadId, 0xAA) if command_addr == UNLOCK_ADDR1 => {
                FlashMode::Unlock1
            }
            (FlashMode::ReadId, _) => FlashMode::ReadId,
            (FlashMode::Unlock1, 0x55) if command_addr == UNLOCK_ADDR2 => FlashMode::Unlock2,
            (FlashMode::Unlock2, 0x90) if command_addr == UNLOCK_ADDR1 => FlashMode::ReadId,
            (FlashMode::Unlock2, 0xA0) if command_addr == UNLOCK_ADDR1 => FlashMode::Program,
            (FlashMode::Unlock2, 0x80) if command_addr == UNLOCK_ADDR1 => FlashMode::EraseSetup,
            (FlashMode::EraseSetup, 0xAA) if command_addr == UNLOCK_ADDR1 => FlashMode::EraseUnlock1,
            (FlashMode::EraseUnlock1, 0x55) if command_addr == UNLOCK_ADDR2 => FlashMode::EraseUnlock2,
            (FlashMode::EraseUnlock2, 0x10) if command_addr == UNLOCK_ADDR1 => {
                self.erase_chip();
                FlashMode::ReadArray
            }
            (FlashMode::EraseUnlock2, 0x30) => {
                self.erase_sector(offset);
                FlashMode::ReadArray
            }
            (mode, data) => {
                if mode != FlashMode::ReadArray {
                    debug!(
                        "flash '{}': sequência abortada por {:#04x} em {:#x}",
                        self.tag, data, offset
                    );
                }
                FlashMode::ReadArray
            }
        };
    }

    fn byte(&self, offset: u32) -> u8 {
        self.data.get(offset as usize).copied().unwrap_or(0xFF)
    }

    fn program(&mut self, offset: u32, data: u8) {
        if let Some(byte) = self.data.get_mut(offset as usize) {
            *byte &= data;
            self.dirty = true;
        }
    }

    fn erase_chip(&mut self) {
        debug!("flash '{}': apagamento do chip", self.tag);
        self.data.fill(0xFF);
        self.dirty = true;
    }

    fn erase_sector(&mut self, offset: u32) {
        let start = (offset as usize / self.sector_size) * self.sector_size;
        let end = (start + self.sector_size).min(self.data.len());
        if start < end {
            debug!("flash '{}': apagamento de setor {:#x}-{:#x}", self.tag, start, end - 1);
            self.data[start..end].fill(0xFF);
            self.dirty = true;
        }
    }
}

/// Janela sobre parte de um chip de flash, instalável como dispositivo.
///
/// Os offsets da janela são somados a `base`; os endereços de comando saem
/// do offset resultante no chip, como nas linhas de endereço reais.
#[derive(Debug, Clone)]
pub struct FlashWindow {
    chip: SharedFlash,
    base: u32,
    writable: bool,
}

impl FlashWindow {
    pub fn new(chip: SharedFlash, base: u32) -> Self {
        Self {
            chip,
            base,
            writable: true,
        }
    }

    /// Janela sem o sinal de escrita ligado.
    pub fn read_only(chip: SharedFlash, base: u32) -> Self {
        Self {
            chip,
            base,
            writable: false,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }
}

impl MemoryHandler for FlashWindow {
    fn read(&mut self, offset: u32) -> u64 {
        u64::from(self.chip.borrow().read(self.base.wrapping_add(offset)))
    }

    fn write(&mut self, offset: u32, data: u64, _mem_mask: u64) {
        if self.writable {
            self.chip.borrow_mut().write(self.base.wrapping_add(offset), data as u8);
        } else {
            warn!(
                "flash '{}': escrita {:#04x} em janela somente leitura em {:#x} ignorada",
                self.chip.borrow().tag(),
                data as u8,
                self.base.wrapping_add(offset)
            );
        }
    }
}
