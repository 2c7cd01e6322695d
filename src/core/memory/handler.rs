//! Handlers para dispositivos mapeados em memória.
//!
//! Um dispositivo ocupa uma janela do espaço implementando
//! [`MemoryHandler`]. O espaço entrega offsets relativos à janela na largura
//! nativa do dispositivo; acessos da CPU mais estreitos ou mais largos são
//! divididos ou combinados aqui, na ordem de bytes do espaço.

use std::cell::RefCell;
use std::rc::Rc;

use super::{AccessWidth, Endianness};

/// Interface de todo dispositivo mapeado em memória.
pub trait MemoryHandler {
    /// Largura nativa do dispositivo. Os offsets passados a `read`/`write`
    /// são alinhados a ela.
    fn native_width(&self) -> AccessWidth {
        AccessWidth::Byte
    }

    /// Lê uma unidade nativa em `offset`.
    fn read(&mut self, offset: u32) -> u64;

    /// Escreve os bits de `data` selecionados por `mem_mask` na unidade
    /// nativa em `offset`.
    fn write(&mut self, offset: u32, data: u64, mem_mask: u64);
}

impl std::fmt::Debug for dyn MemoryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryHandler({})", self.native_width())
    }
}

/// Referência a handler guardada pelos mapeamentos.
pub type SharedHandler = Rc<RefCell<dyn MemoryHandler>>;

/// Embrulha um dispositivo para instalação.
pub fn shared<H: MemoryHandler + 'static>(handler: H) -> SharedHandler {
    Rc::new(RefCell::new(handler))
}

/// Dispositivo feito de um par de closures.
pub struct CallbackHandler<R, W>
where
    R: FnMut(u32) -> u64,
    W: FnMut(u32, u64, u64),
{
    width: AccessWidth,
    read: R,
    write: W,
}

impl<R, W> CallbackHandler<R, W>
where
    R: FnMut(u32) -> u64,
    W: FnMut(u32, u64, u64),
{
    pub fn new(width: AccessWidth, read: R, write: W) -> Self {
        Self { width, read, write }
    }
}

impl<R, W> MemoryHandler for CallbackHandler<R, W>
where
    R: FnMut(u32) -> u64,
    W: FnMut(u32, u64, u64),
{
    fn native_width(&self) -> AccessWidth {
        self.width
    }

    fn read(&mut self, offset: u32) -> u64 {
        (self.read)(offset)
    }

    fn write(&mut self, offset: u32, data: u64, mem_mask: u64) {
        (self.write)(offset, data, mem_mask)
    }
}

/// RAM de 8 bits de um dispositivo (buffers de vídeo, RAM local de placa).
#[derive(Debug, Clone)]
pub struct RamHandler {
    data: Vec<u8>,
    dirty: bool,
}

impl RamHandler {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
            dirty: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Devolve e limpa a flag "escrito desde a última consulta".
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl MemoryHandler for RamHandler {
    fn read(&mut self, offset: u32) -> u64 {
        let len = self.data.len();
        if len == 0 {
            return 0;
        }
        u64::from(self.data[offset as usize % len])
    }

    fn write(&mut self, offset: u32, data: u64, _mem_mask: u64) {
        let len = self.data.len();
        if len == 0 {
            return;
        }
        self.data[offset as usize % len] = data as u8;
        self.dirty = true;
    }
}

/// Lê `width` no offset `offset` da janela de um dispositivo, dividindo ou
/// combinando unidades nativas em `order`. Cada unidade tocada passa pela
/// máscara `mask` da janela.
pub(crate) fn device_read(
    handler: &mut dyn MemoryHandler,
    order: Endianness,
    offset: u32,
    mask: u32,
    width: AccessWidth,
) -> u64 {
    let offset = offset & mask;
    let native = handler.native_width();
    let unit = native.bytes();
    let size = width.bytes();
    let lane = offset % unit;

    if size <= unit && lane + size <= unit {
        let value = handler.read(offset - lane);
        let shift = order.lane_shift(lane, size, unit);
        return (value >> shift) & width.value_mask();
    }

    let mut bytes = [0u8; 8];
    if lane == 0 {
        // unidades nativas inteiras
        let mut pos = 0;
        while pos < size {
            let value = handler.read(offset.wrapping_add(pos) & mask);
            order.scatter(value, &mut bytes[pos as usize..(pos + unit) as usize]);
            pos += unit;
        }
    } else {
        for i in 0..size {
            bytes[i as usize] = device_read(handler, order, offset.wrapping_add(i), mask, AccessWidth::Byte) as u8;
        }
    }
    order.assemble(&bytes[..size as usize])
}

/// Escrita correspondente a [`device_read`].
pub(crate) fn device_write(
    handler: &mut dyn MemoryHandler,
    order: Endianness,
    offset: u32,
    mask: u32,
    width: AccessWidth,
    value: u64,
) {
    let offset = offset & mask;
    let native = handler.native_width();
    let unit = native.bytes();
    let size = width.bytes();
    let lane = offset % unit;

    if size <= unit && lane + size <= unit {
        let shift = order.lane_shift(lane, size, unit);
        let mask = width.value_mask() << shift;
        handler.write(offset - lane, (value & width.value_mask()) << shift, mask);
        return;
    }

    let mut bytes = [0u8; 8];
    order.scatter(value, &mut bytes[..size as usize]);
    if lane == 0 {
        let mut pos = 0;
        while pos < size {
            let chunk = order.assemble(&bytes[pos as usize..(pos + unit) as usize]);
            handler.write(offset.wrapping_add(pos) & mask, chunk, native.value_mask());
            pos += unit;
        }
    } else {
        for i in 0..size {
            device_write(
                handler,
                order,
                offset.wrapping_add(i),
                mask,
                AccessWidth::Byte,
                u64::from(bytes[i as usize]),
            );
        }
    }
}
