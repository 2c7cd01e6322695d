//! Tabelas de mapeamento e handlers de memória.
//!
//! O mapa guarda uma lista ordenada de spans sem sobreposição que cobre todo
//! o espaço de endereços. Cada span aponta para um [`Mapping`] instalado; a
//! entrada 0 é o open bus. Um cache por página resolve o caso comum (página
//! inteira dentro de um único span) com um índice; páginas divididas entre
//! spans caem na busca binária.

use super::bank::BankId;
use super::handler::SharedHandler;
use super::region::RegionId;

/// Índice da entrada de open bus.
pub const UNMAPPED_ENTRY: u32 = 0;

/// Destino de uma direção (leitura ou escrita) de um mapeamento.
#[derive(Clone, Default)]
pub enum Target {
    /// Open bus: leituras devolvem o valor de unmap, escritas são ignoradas.
    #[default]
    Unmapped,
    /// Bytes de uma região; `offset` corresponde ao primeiro byte da janela.
    Memory { region: RegionId, offset: usize },
    /// Aquilo para onde o banco aponta no momento.
    Bank(BankId),
    /// Um handler de dispositivo.
    Device(SharedHandler),
}

impl Target {
    pub fn is_unmapped(&self) -> bool {
        matches!(self, Target::Unmapped)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Unmapped => write!(f, "Unmapped"),
            Target::Memory { region, offset } => write!(f, "Memory({region} + {offset:#x})"),
            Target::Bank(id) => write!(f, "Bank({})", id.0),
            Target::Device(_) => write!(f, "Device"),
        }
    }
}

/// Associação instalada entre uma faixa de endereços e o que a atende.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub tag: String,
    pub start: u32,
    pub end: u32,
    /// Máscara dos offsets relativos à janela; `u32::MAX` sem máscara.
    pub mask: u32,
    pub mirror: u32,
    pub read: Target,
    pub write: Target,
}

impl Mapping {
    fn unmapped() -> Self {
        Self {
            tag: "unmapped".into(),
            start: 0,
            end: 0,
            mask: u32::MAX,
            mirror: 0,
            read: Target::Unmapped,
            write: Target::Unmapped,
        }
    }

    /// Bytes acessíveis por uma cópia da janela.
    pub fn window_len(&self) -> usize {
        let len = u64::from(self.end - self.start) + 1;
        let masked = u64::from(self.mask) + 1;
        len.min(masked) as usize
    }

    /// Banco lido ou escrito por este mapeamento.
    pub fn bank(&self) -> Option<BankId> {
        match (&self.read, &self.write) {
            (Target::Bank(id), _) | (_, Target::Bank(id)) => Some(*id),
            _ => None,
        }
    }
}

/// Trecho contíguo de endereços pertencente a uma única entrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    /// Endereço que corresponde ao offset 0 da janela nesta cópia.
    pub base: u32,
    pub entry: u32,
}

impl Span {
    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    /// Dois spans vizinhos podem ser fundidos quando atendem a mesma cópia
    /// da mesma entrada.
    #[inline]
    fn continues(&self, entry: u32, base: u32) -> bool {
        self.entry == entry && self.base == base
    }
}

/// Tabela de mapeamento indexada por página.
#[derive(Debug)]
pub struct MemoryMap {
    entries: Vec<Option<Mapping>>,
    free: Vec<u32>,
    spans: Vec<Span>,
    pages: Vec<Option<Span>>,
    page_bits: u32,
    addr_mask: u32,
}

impl MemoryMap {
    /// Cria um novo mapa de memória vazio
    pub fn new(addr_mask: u32, page_bits: u32) -> Self {
        let whole = Span {
            start: 0,
            end: addr_mask,
            base: 0,
            entry: UNMAPPED_ENTRY,
        };
        let page_count = (addr_mask >> page_bits) as usize + 1;
        Self {
            entries: vec![Some(Mapping::unmapped())],
            free: Vec::new(),
            spans: vec![whole],
            pages: vec![Some(whole); page_count],
            page_bits,
            addr_mask,
        }
    }

    /// Instala `mapping` em cada cópia `(start, end)`. A última instalação
    /// vence; devolve o índice da nova entrada.
    pub fn insert(&mut self, mapping: Mapping, copies: &[(u32, u32)]) -> u32 {
        let entry = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(mapping);
                slot
            }
            None => {
                self.entries.push(Some(mapping));
                (self.entries.len() - 1) as u32
            }
        };

        let mut displaced = Vec::new();
        for &(start, end) in copies {
            self.carve(start, end, entry, start, &mut displaced);
        }
        self.collect(displaced);
        entry
    }

    /// Devolve `[start, end]` ao open bus.
    pub fn unmap(&mut self, start: u32, end: u32) {
        let mut displaced = Vec::new();
        self.carve(start, end, UNMAPPED_ENTRY, 0, &mut displaced);
        self.collect(displaced);
    }

    /// Obtém o span que cobre um endereço.
    #[inline]
    pub fn lookup(&self, address: u32) -> Span {
        let address = address & self.addr_mask;
        if let Some(span) = self.pages[(address >> self.page_bits) as usize] {
            return span;
        }
        let index = self.spans.partition_point(|span| span.end < address);
        self.spans[index]
    }

    #[inline]
    pub fn entry(&self, index: u32) -> &Mapping {
        // cada span referencia uma entrada viva
        match &self.entries[index as usize] {
            Some(mapping) => mapping,
            None => unreachable!("span referencia entrada liberada {index}"),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Janela de cada mapeamento de banco vivo.
    pub fn bank_windows(&self) -> impl Iterator<Item = (BankId, usize)> + '_ {
        self.entries
            .iter()
            .flatten()
            .filter_map(|mapping| mapping.bank().map(|id| (id, mapping.window_len())))
    }

    /// Como [`bank_windows`](Self::bank_windows), mas só dos mapeamentos que
    /// ainda teriam algum span fora de `covered`.
    pub fn surviving_bank_windows<'a>(
        &'a self,
        covered: &'a [(u32, u32)],
    ) -> impl Iterator<Item = (BankId, usize)> + 'a {
        self.spans
            .iter()
            .filter(move |span| {
                !covered
                    .iter()
                    .any(|&(start, end)| start <= span.start && span.end <= end)
            })
            .filter_map(move |span| {
                let mapping = self.entry(span.entry);
                mapping.bank().map(|id| (id, mapping.window_len()))
            })
    }

    /// Número de entradas ainda referenciadas por algum span.
    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    /// Substitui os spans que tocam `[start, end]` e funde o resultado com
    /// vizinhos da mesma cópia.
    fn carve(&mut self, start: u32, end: u32, entry: u32, base: u32, displaced: &mut Vec<u32>) {
        let mut first = self.spans.partition_point(|span| span.end < start);
        let mut last = self.spans.partition_point(|span| span.start <= end) - 1;

        let head = self.spans[first];
        let tail = self.spans[last];
        let mut middle = Span {
            start,
            end,
            base,
            entry,
        };

        let mut head_rest = None;
        if head.start < start {
            if head.continues(entry, base) {
                middle.start = head.start;
            } else {
                head_rest = Some(Span { end: start - 1, ..head });
            }
        } else if first > 0 && self.spans[first - 1].continues(entry, base) {
            first -= 1;
            middle.start = self.spans[first].start;
        }

        let mut tail_rest = None;
        if tail.end > end {
            if tail.continues(entry, base) {
                middle.end = tail.end;
            } else {
                tail_rest = Some(Span {
                    start: end + 1,
                    ..tail
                });
            }
        } else if last + 1 < self.spans.len() && self.spans[last + 1].continues(entry, base) {
            last += 1;
            middle.end = self.spans[last].end;
        }

        // páginas dos restos também guardavam o span antigo
        let touched = (self.spans[first].start, self.spans[last].end);
        displaced.extend(self.spans[first..=last].iter().map(|span| span.entry));
        let replacement = head_rest.into_iter().chain(Some(middle)).chain(tail_rest);
        self.spans.splice(first..=last, replacement);
        self.refresh_pages(touched.0, touched.1);
    }

    fn refresh_pages(&mut self, start: u32, end: u32) {
        let page_size_mask = (1u32 << self.page_bits).wrapping_sub(1);
        for page in (start >> self.page_bits)..=(end >> self.page_bits) {
            let page_start = page << self.page_bits;
            let page_end = page_start | page_size_mask;
            let index = self.spans.partition_point(|span| span.end < page_start);
            let span = self.spans[index];
            self.pages[page as usize] = (span.end >= page_end).then_some(span);
        }
    }

    fn collect(&mut self, mut displaced: Vec<u32>) {
        displaced.sort_unstable();
        displaced.dedup();
        for entry in displaced {
            if entry == UNMAPPED_ENTRY || self.entries[entry as usize].is_none() {
                continue;
            }
            if !self.spans.iter().any(|span| span.entry == entry) {
                self.entries[entry as usize] = None;
                self.free.push(entry);
            }
        }
    }
}
