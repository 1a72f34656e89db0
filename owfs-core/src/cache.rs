//! Page cache keyed by device, page and address space.

use std::collections::{HashMap, VecDeque};

use crate::device::{MemoryKind, PageNumber, RomId};

/// A cached page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedPage {
    /// Decoded page contents.
    Data(Vec<u8>),
    /// The page is redirected to another page.
    Redirect(PageNumber),
}

type Key = (RomId, PageNumber, MemoryKind);

/// Bounded page cache. The oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct PageCache {
    capacity: usize,
    entries: HashMap<Key, CachedPage>,
    order: VecDeque<Key>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn find(&self, rom: &RomId, page: PageNumber, kind: MemoryKind) -> Option<&CachedPage> {
        self.entries.get(&(*rom, page, kind))
    }

    pub fn add(&mut self, rom: &RomId, page: PageNumber, kind: MemoryKind, data: Vec<u8>) {
        self.insert((*rom, page, kind), CachedPage::Data(data));
    }

    pub fn add_redirect(&mut self, rom: &RomId, page: PageNumber, target: PageNumber) {
        self.insert((*rom, page, MemoryKind::Data), CachedPage::Redirect(target));
    }

    pub fn invalidate(&mut self, rom: &RomId, page: PageNumber, kind: MemoryKind) {
        let key = (*rom, page, kind);
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: Key, page: CachedPage) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key, page).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(64)
    }
}
