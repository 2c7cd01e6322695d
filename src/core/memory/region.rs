//! Regiões de memória: buffers de tamanho fixo com o conteúdo de ROM/RAM.
//!
//! As regiões são criadas na configuração e vivem numa [`RegionArena`] durante
//! toda a vida da máquina, sem nunca mudar de tamanho. Mapeamentos e bancos
//! referem-se a elas por [`RegionId`] mais um offset, verificado quando o
//! mapeamento é instalado ou o banco redirecionado.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use log::{debug, info};

use super::{AccessWidth, Endianness, MemoryError, MemoryResult};

/// Arena compartilhada por todos os espaços de uma máquina.
pub type SharedRegions = Rc<RefCell<RegionArena>>;

/// Índice de uma região dentro da arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub(crate) u16);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Como uma imagem é carregada numa região.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoadFlags: u8 {
        /// A imagem deve ter exatamente o tamanho da região.
        const FULL_SIZE = 0x01;
        /// Repete a imagem até encher a região.
        const MIRROR = 0x02;
        /// Limpa o resto com 0xFF em vez de 0x00.
        const FILL_FF = 0x04;
        /// Não mexe no resto da região.
        const NO_CLEAR = 0x08;
        /// Inverte cada grupo da largura de dados depois da carga.
        const BYTESWAP = 0x10;
    }
}

/// Um bloco de memória (ROM ou RAM) com tag simbólica.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    tag: String,
    data: Box<[u8]>,
    width: AccessWidth,
    endianness: Endianness,
}

impl MemoryRegion {
    /// Cria uma região zerada.
    pub fn new(tag: impl Into<String>, len: usize, width: AccessWidth, endianness: Endianness) -> Self {
        Self {
            tag: tag.into(),
            data: vec![0; len].into_boxed_slice(),
            width,
            endianness,
        }
    }

    /// Cria uma região de 8 bits preenchida com `value`.
    pub fn filled(tag: impl Into<String>, len: usize, value: u8) -> Self {
        Self {
            tag: tag.into(),
            data: vec![value; len].into_boxed_slice(),
            width: AccessWidth::Byte,
            endianness: Endianness::Little,
        }
    }

    /// Usa um conteúdo existente; o tamanho fica fixo a partir daqui.
    pub fn from_bytes(
        tag: impl Into<String>,
        bytes: Vec<u8>,
        width: AccessWidth,
        endianness: Endianness,
    ) -> Self {
        Self {
            tag: tag.into(),
            data: bytes.into_boxed_slice(),
            width,
            endianness,
        }
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

    pub fn width(&self) -> AccessWidth {
        self.width
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Verifica se `[offset, offset + window)` cabe na região.
    pub fn check_window(&self, offset: usize, window: usize) -> MemoryResult<()> {
        match offset.checked_add(window) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(MemoryError::RegionBounds {
                region: self.tag.clone(),
                len: self.data.len(),
                offset,
                window,
            }),
        }
    }

    /// Carrega uma imagem no início da região.
    ///
    /// Retorna quantos bytes de `image` foram usados. O que passar do
    /// tamanho da região é ignorado.
    pub fn load_image(&mut self, image: &[u8], flags: LoadFlags) -> MemoryResult<usize> {
        let len = self.data.len();
        if flags.contains(LoadFlags::FULL_SIZE) && image.len() != len {
            return Err(MemoryError::ImageSize {
                region: self.tag.clone(),
                expected: len,
                actual: image.len(),
            });
        }

        let read = image.len().min(len);
        self.data[..read].copy_from_slice(&image[..read]);
        let mut pos = read;

        if flags.contains(LoadFlags::MIRROR) && read > 0 {
            while pos < len {
                let chunk = read.min(len - pos);
                self.data.copy_within(0..chunk, pos);
                pos += chunk;
            }
        }

        if flags.contains(LoadFlags::BYTESWAP) {
            let group = self.width.bytes() as usize;
            if group > 1 {
                for chunk in self.data[..pos - pos % group].chunks_exact_mut(group) {
                    chunk.reverse();
                }
            }
        }

        if !flags.contains(LoadFlags::NO_CLEAR) {
            let fill = if flags.contains(LoadFlags::FILL_FF) { 0xFF } else { 0x00 };
            self.data[pos..].fill(fill);
        }

        debug!("região '{}': carregados {:#x} de {:#x} bytes", self.tag, read, len);
        Ok(read)
    }
}

/// Dona de todas as regiões de uma máquina.
#[derive(Debug, Default)]
pub struct RegionArena {
    regions: Vec<MemoryRegion>,
    by_tag: HashMap<String, RegionId>,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cria uma arena nova para compartilhar entre espaços.
    pub fn shared() -> SharedRegions {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Adiciona uma região; as tags são únicas por máquina.
    pub fn add(&mut self, region: MemoryRegion) -> MemoryResult<RegionId> {
        if self.by_tag.contains_key(region.tag()) {
            return Err(MemoryError::DuplicateRegion(region.tag.clone()));
        }
        let index = u16::try_from(self.regions.len())
            .map_err(|_| MemoryError::TooManyRegions(region.tag.clone()))?;
        let id = RegionId(index);
        info!(
            "região '{}' {}: {:#x} bytes, {} {}",
            region.tag,
            id,
            region.len(),
            region.width,
            region.endianness
        );
        self.by_tag.insert(region.tag.clone(), id);
        self.regions.push(region);
        Ok(id)
    }

    pub fn find(&self, tag: &str) -> Option<RegionId> {
        self.by_tag.get(tag).copied()
    }

    pub fn get(&self, id: RegionId) -> Option<&MemoryRegion> {
        self.regions.get(id.index())
    }

    /// Conteúdo mutável de uma região. Tag, tamanho e formato continuam
    /// fixos.
    pub fn data_mut(&mut self, id: RegionId) -> Option<&mut [u8]> {
        self.regions.get_mut(id.index()).map(|region| &mut region.data[..])
    }

    /// Carrega uma imagem numa região já adicionada.
    pub fn load_image(&mut self, id: RegionId, image: &[u8], flags: LoadFlags) -> MemoryResult<usize> {
        match self.regions.get_mut(id.index()) {
            Some(region) => region.load_image(image, flags),
            None => Err(MemoryError::UnknownRegion(id.to_string())),
        }
    }

    /// Como [`get`](Self::get), mas um id ausente é erro de configuração.
    pub fn region(&self, id: RegionId) -> MemoryResult<&MemoryRegion> {
        self.get(id).ok_or_else(|| MemoryError::UnknownRegion(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_rejects_duplicate_tag() {
        let mut arena = RegionArena::new();
        let id = arena.add(MemoryRegion::filled("maincpu", 0x100, 0)).unwrap();
        assert_eq!(arena.find("maincpu"), Some(id));
        let err = arena.add(MemoryRegion::filled("maincpu", 0x10, 0)).unwrap_err();
        assert_eq!(err, MemoryError::DuplicateRegion("maincpu".into()));
    }

    #[test]
    fn test_check_window() {
        let region = MemoryRegion::filled("bios", 0x4000, 0);
        assert!(region.check_window(0, 0x4000).is_ok());
        assert!(region.check_window(0x2000, 0x2000).is_ok());
        assert!(matches!(
            region.check_window(0x2001, 0x2000),
            Err(MemoryError::RegionBounds { .. })
        ));
        assert!(region.check_window(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_load_image_mirror_and_fill() {
        let mut region = MemoryRegion::filled("cart", 8, 0x55);
        let read = region.load_image(&[1, 2, 3], LoadFlags::MIRROR).unwrap();
        assert_eq!(read, 3);
        assert_eq!(region.as_slice(), &[1, 2, 3, 1, 2, 3, 1, 2]);

        let read = region.load_image(&[9, 8], LoadFlags::FILL_FF).unwrap();
        assert_eq!(read, 2);
        assert_eq!(region.as_slice(), &[9, 8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        region.load_image(&[7], LoadFlags::NO_CLEAR).unwrap();
        assert_eq!(region.as_slice()[..3], [7, 8, 0xFF]);
    }

    #[test]
    fn test_arena_contents_stay_fixed() {
        let mut arena = RegionArena::new();
        let id = arena.add(MemoryRegion::new("vram", 4, AccessWidth::Word, Endianness::Big)).unwrap();
        arena.data_mut(id).unwrap()[1] = 0x42;
        assert_eq!(arena.get(id).unwrap().as_slice(), &[0, 0x42, 0, 0]);

        assert_eq!(arena.load_image(id, &[1, 2, 3, 4], LoadFlags::BYTESWAP).unwrap(), 4);
        let region = arena.get(id).unwrap();
        assert_eq!(region.as_slice(), &[2, 1, 4, 3]);
        assert_eq!(region.tag(), "vram");
        assert_eq!(region.width(), AccessWidth::Word);

        let missing = RegionId(7);
        assert!(arena.data_mut(missing).is_none());
        assert_eq!(
            arena.load_image(missing, &[0], LoadFlags::empty()),
            Err(MemoryError::UnknownRegion("#7".into()))
        );
    }

    #[test]
    fn test_arena_refuses_more_ids_than_it_can_name() {
        let mut arena = RegionArena::new();
        for i in 0..=u16::MAX as usize {
            arena.add(MemoryRegion::filled(format!("r{i}"), 0, 0)).unwrap();
        }
        assert_eq!(
            arena.add(MemoryRegion::filled("overflow", 1, 0)),
            Err(MemoryError::TooManyRegions("overflow".into()))
        );
        assert_eq!(arena.len(), u16::MAX as usize + 1);
        assert_eq!(arena.find("overflow"), None);
    }

    #[test]
    fn test_load_image_full_size_and_byteswap() {
        let mut region = MemoryRegion::new("maincpu", 4, AccessWidth::Word, Endianness::Big);
        assert!(matches!(
            region.load_image(&[1, 2], LoadFlags::FULL_SIZE),
            Err(MemoryError::ImageSize { expected: 4, actual: 2, .. })
        ));
        region
            .load_image(&[0x12, 0x34, 0x56, 0x78], LoadFlags::BYTESWAP)
            .unwrap();
        assert_eq!(region.as_slice(), &[0x34, 0x12, 0x78, 0x56]);
    }
}
