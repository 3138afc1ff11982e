use std::collections::VecDeque;

use crate::storage::page::PageId;
use crate::storage::wal::LSN;

/// Dirty pages ordered by the LSN at which each was first modified.
///
/// New entries go to the back, so the front is always the page with the
/// oldest unflushed modification.
#[derive(Debug, Default)]
pub struct FlushList {
    entries: VecDeque<(LSN, PageId)>,
}

impl FlushList {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a page that just became dirty at `lsn`.
    pub fn insert(&mut self, page_id: PageId, lsn: LSN) {
        if let Some(&(last_lsn, last_page)) = self.entries.back() {
            debug_assert!(
                last_lsn <= lsn,
                "flush list out of LSN order: {} at {} after {} at {}",
                page_id,
                lsn,
                last_page,
                last_lsn
            );
        }
        self.entries.push_back((lsn, page_id));
    }

    /// Remove a page. Returns false if it was not on the list.
    pub fn remove(&mut self, page_id: PageId) -> bool {
        match self.entries.iter().position(|&(_, id)| id == page_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn oldest(&self) -> Option<(LSN, PageId)> {
        self.entries.front().copied()
    }

    pub fn pages(&self) -> Vec<(PageId, LSN)> {
        self.entries.iter().map(|&(lsn, id)| (id, lsn)).collect()
    }

    pub fn is_ordered(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| a.0 <= b.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut list = FlushList::new();
        assert!(list.is_empty());

        list.insert(PageId(3), LSN(100));
        list.insert(PageId(1), LSN(100));
        list.insert(PageId(2), LSN(150));

        assert_eq!(list.len(), 3);
        assert_eq!(list.oldest(), Some((LSN(100), PageId(3))));
        assert!(list.is_ordered());

        assert!(list.remove(PageId(1)));
        assert!(!list.remove(PageId(1)));
        assert_eq!(list.pages(), vec![(PageId(3), LSN(100)), (PageId(2), LSN(150))]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "flush list out of LSN order")]
    fn test_out_of_order_insert() {
        let mut list = FlushList::new();
        list.insert(PageId(1), LSN(200));
        list.insert(PageId(2), LSN(100));
    }
}
