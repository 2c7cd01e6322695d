//! Bancos redirecionáveis.
//!
//! Um banco é um par (região, offset) com nome, lido por um ou mais
//! mapeamentos. Reapontar um banco é O(1) e não mexe na tabela de
//! mapeamento. Todo redirecionamento é validado contra os limites da região
//! para a maior janela em que o banco está instalado.

use std::collections::HashMap;

use super::region::{RegionArena, RegionId};
use super::{MemoryError, MemoryResult};

/// Handle de um banco dentro do seu espaço de endereçamento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankId(pub(crate) u16);

/// Um banco redirecionável.
#[derive(Debug, Clone)]
pub struct Bank {
    name: String,
    target: Option<(RegionId, usize)>,
    window: usize,
    entries: Vec<(RegionId, usize)>,
    current_entry: Option<usize>,
}

impl Bank {
    fn new(name: String) -> Self {
        Self {
            name,
            target: None,
            window: 0,
            entries: Vec::new(),
            current_entry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Região e offset atuais, se o banco já foi apontado.
    pub fn target(&self) -> Option<(RegionId, usize)> {
        self.target
    }

    /// Tamanho da maior janela viva em que o banco está instalado.
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn current_entry(&self) -> Option<usize> {
        self.current_entry
    }
}

/// Tabela de bancos de um espaço.
#[derive(Debug, Default)]
pub struct BankTable {
    banks: Vec<Bank>,
    by_name: HashMap<String, BankId>,
}

impl BankTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, name: &str) -> Option<BankId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: BankId) -> &Bank {
        &self.banks[id.0 as usize]
    }

    /// Devolve o banco `name`, criando um sem ponteiro se preciso.
    pub fn find_or_create(&mut self, name: &str) -> BankId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let id = BankId(self.banks.len() as u16);
        self.banks.push(Bank::new(name.to_owned()));
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Prepara o banco para uma nova instalação de janela `window` (já
    /// incluindo as outras janelas que continuam vivas). O ponteiro novo,
    /// ou o atual, precisa caber; em erro nada muda.
    pub fn claim_window(
        &mut self,
        id: BankId,
        window: usize,
        pointer: Option<(RegionId, usize)>,
        regions: &RegionArena,
    ) -> MemoryResult<()> {
        let bank = &mut self.banks[id.0 as usize];
        if let Some((region, offset)) = pointer.or(bank.target) {
            regions.region(region)?.check_window(offset, window)?;
        }
        bank.window = window;
        if pointer.is_some() {
            bank.target = pointer;
            bank.current_entry = None;
        }
        Ok(())
    }

    /// Ajusta as janelas aos mapeamentos vivos; `windows` é indexado por
    /// banco. Só encolhe ou mantém, então os ponteiros continuam válidos.
    pub fn fit_windows(&mut self, windows: &[usize]) {
        for (bank, &window) in self.banks.iter_mut().zip(windows) {
            bank.window = window;
        }
    }

    /// Reaponta um banco. Em erro o ponteiro anterior é mantido.
    pub fn set_pointer(
        &mut self,
        id: BankId,
        region: RegionId,
        offset: usize,
        regions: &RegionArena,
    ) -> MemoryResult<()> {
        let bank = &mut self.banks[id.0 as usize];
        regions.region(region)?.check_window(offset, bank.window)?;
        bank.target = Some((region, offset));
        bank.current_entry = None;
        Ok(())
    }

    /// Registra `count` entradas selecionáveis, espaçadas de `stride` bytes.
    pub fn configure_entries(
        &mut self,
        id: BankId,
        region: RegionId,
        base: usize,
        count: usize,
        stride: usize,
        regions: &RegionArena,
    ) -> MemoryResult<()> {
        let source = regions.region(region)?;
        let bank = &mut self.banks[id.0 as usize];
        let need = if bank.window > 0 { bank.window } else { stride };
        let mut entries = Vec::with_capacity(count);
        for index in 0..count {
            let offset = base + index * stride;
            source.check_window(offset, need)?;
            entries.push((region, offset));
        }
        bank.entries = entries;
        Ok(())
    }

    /// Seleciona uma das entradas configuradas.
    pub fn select_entry(
        &mut self,
        id: BankId,
        entry: usize,
        space: &str,
        regions: &RegionArena,
    ) -> MemoryResult<()> {
        let bank = &self.banks[id.0 as usize];
        let Some(&(region, offset)) = bank.entries.get(entry) else {
            return Err(MemoryError::UnknownBankEntry {
                space: space.to_owned(),
                bank: bank.name.clone(),
                entry,
                count: bank.entries.len(),
            });
        };
        self.set_pointer(id, region, offset, regions)?;
        self.banks[id.0 as usize].current_entry = Some(entry);
        Ok(())
    }

    /// Resolve um offset relativo à janela em (região, índice do byte).
    #[inline]
    pub fn resolve(&self, id: BankId, rel: u32) -> Option<(RegionId, usize)> {
        self.banks[id.0 as usize]
            .target
            .map(|(region, offset)| (region, offset + rel as usize))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bank> {
        self.banks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::region::MemoryRegion;

    fn arena() -> (RegionArena, RegionId) {
        let mut arena = RegionArena::new();
        let id = arena.add(MemoryRegion::filled("ram", 0x10000, 0)).unwrap();
        (arena, id)
    }

    #[test]
    fn test_set_pointer_is_bounds_checked() {
        let (arena, ram) = arena();
        let mut banks = BankTable::new();
        let bank = banks.find_or_create("bank1");
        banks.claim_window(bank, 0x4000, None, &arena).unwrap();

        banks.set_pointer(bank, ram, 0xC000, &arena).unwrap();
        assert!(banks.set_pointer(bank, ram, 0xC001, &arena).is_err());
        // o ponteiro anterior sobrevive a um redirecionamento que falhou
        assert_eq!(banks.get(bank).target(), Some((ram, 0xC000)));
    }

    #[test]
    fn test_claim_window_rechecks_pointer() {
        let (arena, ram) = arena();
        let mut banks = BankTable::new();
        let bank = banks.find_or_create("bank1");
        banks.claim_window(bank, 0x1000, None, &arena).unwrap();
        banks.set_pointer(bank, ram, 0xF000, &arena).unwrap();
        assert!(banks.claim_window(bank, 0x2000, None, &arena).is_err());
        assert_eq!(banks.get(bank).window(), 0x1000);
        // um ponteiro novo que caiba é aceito junto com a janela maior
        banks.claim_window(bank, 0x2000, Some((ram, 0xE000)), &arena).unwrap();
        assert_eq!(banks.get(bank).target(), Some((ram, 0xE000)));

        banks.fit_windows(&[0x800]);
        banks.set_pointer(bank, ram, 0xF800, &arena).unwrap();
    }

    #[test]
    fn test_entries() {
        let (arena, ram) = arena();
        let mut banks = BankTable::new();
        let bank = banks.find_or_create("spet");
        banks.claim_window(bank, 0x1000, None, &arena).unwrap();
        banks.configure_entries(bank, ram, 0, 16, 0x1000, &arena).unwrap();
        banks.select_entry(bank, 5, "test", &arena).unwrap();
        assert_eq!(banks.resolve(bank, 0x10), Some((ram, 0x5010)));
        assert_eq!(banks.get(bank).current_entry(), Some(5));
        assert!(matches!(
            banks.select_entry(bank, 16, "test", &arena),
            Err(MemoryError::UnknownBankEntry { count: 16, .. })
        ));
    }
}
