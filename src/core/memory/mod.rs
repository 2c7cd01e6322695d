//! Sistema de memória: regiões, espaços de endereçamento, bancos e despacho
//! para dispositivos.
//!
//! Um núcleo de CPU enxerga um [`AddressSpace`] por barramento. Todo endereço
//! desse espaço resolve para exatamente um mapeamento instalado (memória,
//! banco ou dispositivo); os buracos leem barramento aberto e ignoram escritas.

pub mod bank;
pub mod bus;
pub mod flash;
pub mod handler;
pub mod map;
pub mod region;
pub mod remap;

// Re-exportações para facilitar o uso
pub use bank::{Bank, BankId};
pub use bus::{AddressSpace, SpaceConfig};
pub use flash::{FlashChip, FlashMode, FlashWindow, SharedFlash};
pub use handler::{shared, CallbackHandler, MemoryHandler, RamHandler, SharedHandler};
pub use map::{Mapping, MemoryMap, Target};
pub use region::{LoadFlags, MemoryRegion, RegionArena, RegionId, SharedRegions};
pub use remap::{MapCommand, MapEditor, Remapper};

use bitflags::bitflags;
use num_traits::PrimInt;
use thiserror::Error;

/// Valor de barramento aberto para espaços "unmap high".
pub const UNMAP_HIGH: u8 = 0xFF;

/// Valor de barramento aberto para espaços "unmap low".
pub const UNMAP_LOW: u8 = 0x00;

/// Número máximo de cópias de uma instalação espelhada.
pub const MAX_MIRROR_COPIES: u32 = 4096;

/// Largura de um acesso da CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    /// Bytes movidos por um acesso.
    #[inline]
    pub const fn bytes(self) -> u32 {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }

    /// Largura em bits (8/16/32/64).
    #[inline]
    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// Máscara que cobre um valor desta largura.
    #[inline]
    pub const fn value_mask(self) -> u64 {
        match self {
            AccessWidth::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    /// Largura para 1/2/4/8 bytes.
    pub const fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Word),
            4 => Some(AccessWidth::Dword),
            8 => Some(AccessWidth::Qword),
            _ => None,
        }
    }

    /// Largura para um barramento de 8/16/32/64 bits.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Self::from_bytes(bits / 8)
    }
}

impl std::fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Ordem de bytes de um barramento ou região.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Deslocamento do campo de `width` bytes que começa no byte `lane` de
    /// uma palavra de `unit` bytes.
    #[inline]
    pub const fn lane_shift(self, lane: u32, width: u32, unit: u32) -> u32 {
        match self {
            Endianness::Little => lane * 8,
            Endianness::Big => (unit - lane - width) * 8,
        }
    }

    /// Monta um valor a partir de `bytes` (em ordem de endereço).
    #[inline]
    pub fn assemble(self, bytes: &[u8]) -> u64 {
        match self {
            Endianness::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            Endianness::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }

    /// Divide `value` em `out.len()` bytes na ordem de endereço.
    #[inline]
    pub fn scatter(self, value: u64, out: &mut [u8]) {
        let n = out.len() as u32;
        for (i, byte) in out.iter_mut().enumerate() {
            let shift = self.lane_shift(i as u32, 1, n);
            *byte = (value >> shift) as u8;
        }
    }
}

impl std::fmt::Display for Endianness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endianness::Little => write!(f, "little-endian"),
            Endianness::Big => write!(f, "big-endian"),
        }
    }
}

bitflags! {
    /// Direções ocupadas por uma instalação.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Inteiros que uma CPU move pelo barramento num único acesso.
pub trait BusValue: PrimInt + 'static {
    const WIDTH: AccessWidth;
}

impl BusValue for u8 {
    const WIDTH: AccessWidth = AccessWidth::Byte;
}

impl BusValue for u16 {
    const WIDTH: AccessWidth = AccessWidth::Word;
}

impl BusValue for u32 {
    const WIDTH: AccessWidth = AccessWidth::Dword;
}

impl BusValue for u64 {
    const WIDTH: AccessWidth = AccessWidth::Qword;
}

/// Erros do sistema de memória.
///
/// Todos são erros de configuração: um driver ou placa pediu um layout que o
/// hardware não pode ter. Acessos em tempo de execução nunca geram erro.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("{space}: faixa inválida {start:#x}-{end:#x} (início depois do fim)")]
    InvertedRange { space: String, start: u32, end: u32 },

    #[error("{space}: faixa {start:#x}-{end:#x} não cabe num barramento de {bits} bits")]
    OutOfBus {
        space: String,
        start: u32,
        end: u32,
        bits: u32,
    },

    #[error(
        "região '{region}' tem {len:#x} bytes, mas foi pedida uma janela de {window:#x} bytes no offset {offset:#x}"
    )]
    RegionBounds {
        region: String,
        len: usize,
        offset: usize,
        window: usize,
    },

    #[error("região de memória desconhecida {0}")]
    UnknownRegion(String),

    #[error("região de memória '{0}' já existe")]
    DuplicateRegion(String),

    #[error("{space}: banco '{bank}' desconhecido")]
    UnknownBank { space: String, bank: String },

    #[error("{space}: banco '{bank}' não tem a entrada {entry} ({count} configuradas)")]
    UnknownBankEntry {
        space: String,
        bank: String,
        entry: usize,
        count: usize,
    },

    #[error("{space}: espelho {mirror:#x} sobrepõe a faixa {start:#x}-{end:#x}")]
    MirrorOverlap {
        space: String,
        start: u32,
        end: u32,
        mirror: u32,
    },

    #[error("{space}: espelho {mirror:#x} criaria {copies} cópias da janela")]
    MirrorTooLarge {
        space: String,
        mirror: u32,
        copies: u64,
    },

    #[error("região '{region}' é {region_order}, mas {space} é {space_order}")]
    EndiannessMismatch {
        region: String,
        region_order: Endianness,
        space: String,
        space_order: Endianness,
    },

    #[error("{space}: barramento de endereços de {bits} bits não suportado")]
    UnsupportedAddressBits { space: String, bits: u32 },

    #[error("imagem de {actual:#x} bytes não preenche a região '{region}' ({expected:#x} bytes)")]
    ImageSize {
        region: String,
        expected: usize,
        actual: usize,
    },

    #[error("NuBus: slot {0:#x} fora da faixa do Apple NuBus")]
    SlotOutOfRange(u8),

    #[error("NuBus: slot {slot:#x} já tem a placa '{occupant}', impossível adicionar '{card}'")]
    SlotOccupied {
        slot: u8,
        occupant: String,
        card: String,
    },

    #[error("NuBus: placa '{card}' no slot {slot:#x} tentou ocupar {start:#x}-{end:#x} fora da janela do slot")]
    OutsideSlot {
        card: String,
        slot: u8,
        start: u32,
        end: u32,
    },

    #[error("NuBus: valor de byteLanes não tratado {0:#04x}")]
    BadByteLanes(u8),

    #[error("NuBus: ROM de declaração '{region}' pequena demais ({len} bytes)")]
    DeclRomTooSmall { region: String, len: usize },

    #[error("NuBus: largura de barramento {0} não suportada")]
    UnsupportedBusWidth(u32),

    #[error("máquina '{machine}' não tem espaço {space}")]
    MissingSpace { machine: String, space: String },

    #[error("arena cheia, região '{0}' não cabe")]
    TooManyRegions(String),
}

/// Tipo de resultado para operações de memória
pub type MemoryResult<T> = Result<T, MemoryError>;
