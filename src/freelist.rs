//! Freelist tracks all pages that are available for allocation, plus the
//! pages freed by open transactions that cannot be reused yet.

use std::fmt::{self, Display, Formatter};

use fnv::{FnvHashMap, FnvHashSet};

use crate::common::TxId;
use crate::common::page::{PAGE_HEADER_SIZE, PGID_SIZE, Page, PageFlags, PgId, PgIds};

/// FreelistType selects the in-memory representation of the free set.
///
/// The array form is compact and cache friendly for modest free sets. The
/// hashmap form keeps span indexes and stays O(1)-ish for allocation and
/// coalescing once the freelist grows into the hundreds of thousands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum FreelistType {
    #[default]
    Array,
    HashMap,
}

impl Display for FreelistType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FreelistType::Array => write!(f, "array"),
            FreelistType::HashMap => write!(f, "hashmap"),
        }
    }
}

// txPending holds the pages freed by one transaction together with the
// txids that allocated each page.
#[derive(Debug, Default)]
struct TxPending {
    ids: Vec<PgId>,
    // txids allocating the ids, index-aligned with `ids`
    alloctx: Vec<TxId>,
    // beginning txid of the last matching release_range
    last_release_begin: TxId,
}

/// Freelist represents a list of all pages that are available for
/// allocation. It also tracks pages that have been freed but are still in
/// use by open transactions.
pub(crate) struct Freelist {
    freelist_type: FreelistType,
    // all free and available free page ids (array form)
    ids: Vec<PgId>,
    // mapping of txid that allocated a pgid
    allocs: FnvHashMap<PgId, TxId>,
    // mapping of soon-to-be free page ids by tx
    pending: FnvHashMap<TxId, TxPending>,
    // fast lookup of all free and pending page ids
    cache: FnvHashSet<PgId>,

    // hashmap form: span size -> set of starting pgids of that size
    freemaps: FnvHashMap<u64, FnvHashSet<PgId>>,
    // start pgid -> span size
    forward_map: FnvHashMap<PgId, u64>,
    // end pgid -> span size
    backward_map: FnvHashMap<PgId, u64>,
}

impl Freelist {
    /// Returns an empty, initialized freelist.
    pub(crate) fn new(freelist_type: FreelistType) -> Self {
        Self {
            freelist_type,
            ids: Vec::new(),
            allocs: FnvHashMap::default(),
            pending: FnvHashMap::default(),
            cache: FnvHashSet::default(),
            freemaps: FnvHashMap::default(),
            forward_map: FnvHashMap::default(),
            backward_map: FnvHashMap::default(),
        }
    }

    /// Returns the size of the page required to hold the serialized
    /// freelist.
    pub(crate) fn size(&self) -> usize {
        let mut n = self.count();
        if n >= 0xFFFF {
            // The first element will be used to store the count. See write.
            n += 1;
        }
        PAGE_HEADER_SIZE + PGID_SIZE * n
    }

    /// Returns count of pages on the freelist.
    pub(crate) fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Returns count of free pages.
    pub(crate) fn free_count(&self) -> usize {
        match self.freelist_type {
            FreelistType::Array => self.ids.len(),
            FreelistType::HashMap => self.forward_map.values().map(|size| *size as usize).sum(),
        }
    }

    /// Returns count of pending pages.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(|txp| txp.ids.len()).sum()
    }

    /// Copies into dst a list of all free ids and all pending ids in one
    /// sorted list.
    pub(crate) fn copy_all(&self, dst: &mut Vec<PgId>) {
        let mut m = PgIds::default();
        for txp in self.pending.values() {
            for id in &txp.ids {
                m.push(*id);
            }
        }
        let mut all = PgIds::from(self.get_free_page_ids());
        all.merge(m);
        dst.extend_from_slice(all.as_slice());
    }

    /// Returns the starting page id of a contiguous run of `n` pages. If a
    /// contiguous block cannot be found then 0 is returned.
    pub(crate) fn allocate(&mut self, txid: TxId, n: usize) -> PgId {
        match self.freelist_type {
            FreelistType::Array => self.array_allocate(txid, n),
            FreelistType::HashMap => self.hashmap_allocate(txid, n),
        }
    }

    fn array_allocate(&mut self, txid: TxId, n: usize) -> PgId {
        if self.ids.is_empty() || n == 0 {
            return 0;
        }

        // Scan for the first run of n consecutive ids.
        let mut found: Option<(usize, PgId)> = None;
        let mut initial: PgId = 0;
        let mut previd: PgId = 0;
        for (i, &id) in self.ids.iter().enumerate() {
            assert!(id > 1, "invalid page allocation: {}", id);

            // Reset initial page if this is not contiguous.
            if previd == 0 || id - previd != 1 {
                initial = id;
            }

            if (id - initial) + 1 == n as PgId {
                found = Some((i, initial));
                break;
            }

            previd = id;
        }

        if let Some((i, initial)) = found {
            self.ids.drain(i + 1 - n..i + 1);

            // Remove from the free cache.
            for off in 0..n as PgId {
                self.cache.remove(&(initial + off));
            }
            self.allocs.insert(initial, txid);
            return initial;
        }
        0
    }

    fn hashmap_allocate(&mut self, txid: TxId, n: usize) -> PgId {
        if n == 0 {
            return 0;
        }
        let n = n as u64;

        // if we have an exact size match just return the short path
        let exact = self
            .freemaps
            .get(&n)
            .and_then(|bm| bm.iter().next().copied());
        if let Some(pid) = exact {
            self.del_span(pid, n);
            self.allocs.insert(pid, txid);
            for i in 0..n {
                self.cache.remove(&(pid + i));
            }
            return pid;
        }

        // lookup the map to find the smallest span that fits
        let best = self
            .freemaps
            .keys()
            .filter(|&&size| size > n)
            .min()
            .copied();

        if let Some(size) = best {
            let pid = *self
                .freemaps
                .get(&size)
                .and_then(|bm| bm.iter().next())
                .expect("freemaps entry must be non-empty");

            self.del_span(pid, size);
            self.allocs.insert(pid, txid);

            // add the remaining span
            self.add_span(pid + n, size - n);

            for i in 0..n {
                self.cache.remove(&(pid + i));
            }
            return pid;
        }

        0
    }

    /// Releases a page and its overflow for a given transaction id.
    /// If the page is already free then a panic will occur.
    pub(crate) fn free(&mut self, txid: TxId, p: &Page) {
        assert!(p.id() > 1, "cannot free page 0 or 1: {}", p.id());

        // Free page and all its overflow pages.
        let mut alloc_txid = match self.allocs.remove(&p.id()) {
            Some(tx) => tx,
            None => 0,
        };
        if alloc_txid == 0 && p.is_freelist_page() {
            // Freelist is always allocated by the prior tx.
            alloc_txid = txid - 1;
        }

        let txp = self.pending.entry(txid).or_default();
        for id in p.id()..=p.id() + p.overflow() as PgId {
            // Verify that page is not already free.
            assert!(!self.cache.contains(&id), "page {} already freed", id);

            // Add to the freelist and cache.
            txp.ids.push(id);
            txp.alloctx.push(alloc_txid);
            self.cache.insert(id);
        }
    }

    /// Moves all page ids for a transaction id (or older) to the freelist.
    pub(crate) fn release(&mut self, txid: TxId) {
        let mut m = PgIds::default();
        let released: Vec<TxId> = self
            .pending
            .keys()
            .filter(|&&tid| tid <= txid)
            .copied()
            .collect();
        for tid in released {
            // Move transaction's pending pages to the available freelist.
            // Don't remove from the cache since the page is still free.
            let txp = self.pending.remove(&tid).unwrap();
            for id in txp.ids {
                m.push(id);
            }
        }
        self.merge_spans(m);
    }

    /// Moves pending pages allocated within an extent [begin,end] to the
    /// free list.
    pub(crate) fn release_range(&mut self, begin: TxId, end: TxId) {
        if begin > end {
            return;
        }
        let mut m = PgIds::default();
        let mut emptied: Vec<TxId> = Vec::new();
        for (&tid, txp) in self.pending.iter_mut() {
            if tid < begin || tid > end {
                continue;
            }
            // Don't recompute freed pages if ranges haven't updated.
            if txp.last_release_begin == begin {
                continue;
            }
            let mut i = 0;
            while i < txp.ids.len() {
                let atx = txp.alloctx[i];
                if atx < begin || atx > end {
                    i += 1;
                    continue;
                }
                m.push(txp.ids[i]);
                txp.ids.swap_remove(i);
                txp.alloctx.swap_remove(i);
            }
            txp.last_release_begin = begin;
            if txp.ids.is_empty() {
                emptied.push(tid);
            }
        }
        for tid in emptied {
            self.pending.remove(&tid);
        }
        self.merge_spans(m);
    }

    /// Removes the pages from a given pending tx.
    pub(crate) fn rollback(&mut self, txid: TxId) {
        let txp = match self.pending.remove(&txid) {
            Some(txp) => txp,
            None => return,
        };

        let mut m = PgIds::default();
        for (i, pgid) in txp.ids.iter().enumerate() {
            self.cache.remove(pgid);
            let tx = txp.alloctx[i];
            if tx == 0 {
                continue;
            }
            if tx != txid {
                // Pending free aborted; restore page back to alloc list.
                self.allocs.insert(*pgid, tx);
            } else {
                // Freed page was allocated by this txn; OK to throw away.
                m.push(*pgid);
            }
        }
        self.merge_spans(m);
    }

    /// Returns whether a given page is in the free list.
    pub(crate) fn freed(&self, pgid: PgId) -> bool {
        self.cache.contains(&pgid)
    }

    /// Initializes the freelist from a freelist page.
    pub(crate) fn read(&mut self, p: &Page) {
        assert!(
            p.is_freelist_page(),
            "invalid freelist page: {}, page type is {}",
            p.id(),
            p.typ()
        );

        // Copy the list of page ids from the freelist, so we don't keep
        // referencing the page.
        let mut ids = p.freelist_page_ids().to_vec();

        if ids.is_empty() {
            self.read_ids(Vec::new());
        } else {
            // Make sure they're sorted.
            ids.sort_unstable();
            self.read_ids(ids);
        }
    }

    /// Writes the page ids onto a freelist page. All free and pending ids
    /// are saved to disk since in the event of a program crash, all pending
    /// ids will become free.
    pub(crate) fn write(&self, p: &mut Page) {
        // Update the header flag.
        p.set_flags(p.flags() | PageFlags::FREELIST_PAGE);

        // The page.count can only hold up to 64k elements so if we overflow
        // that number then we handle it by putting the size in the first
        // element.
        let l = self.count();
        let mut ids: Vec<PgId> = Vec::with_capacity(l + 1);
        if l == 0 {
            p.set_count(l as u16);
        } else if l < 0xFFFF {
            p.set_count(l as u16);
            self.copy_all(&mut ids);
        } else {
            p.set_count(0xFFFF);
            ids.push(l as PgId);
            self.copy_all(&mut ids);
        }

        if !ids.is_empty() {
            unsafe {
                let data = p.get_data_mut_ptr() as *mut PgId;
                std::ptr::copy_nonoverlapping(ids.as_ptr(), data, ids.len());
            }
        }
    }

    /// Reads the freelist from a page and filters out pending items.
    pub(crate) fn reload(&mut self, p: &Page) {
        self.read(p);
        self.filter_pending();
    }

    /// Reads the freelist from pgids and filters out pending items.
    pub(crate) fn no_sync_reload(&mut self, pgids: Vec<PgId>) {
        let mut ids = pgids;
        ids.sort_unstable();
        self.read_ids(ids);
        self.filter_pending();
    }

    fn filter_pending(&mut self) {
        // Build a cache of only pending pages.
        let mut pcache = FnvHashSet::default();
        for txp in self.pending.values() {
            for pending_id in &txp.ids {
                pcache.insert(*pending_id);
            }
        }

        // Check each page in the freelist and build a new available freelist
        // with any pages not in the pending lists.
        let a: Vec<PgId> = self
            .get_free_page_ids()
            .into_iter()
            .filter(|id| !pcache.contains(id))
            .collect();

        self.read_ids(a);
    }

    /// Initializes the freelist from a sorted list of ids.
    pub(crate) fn read_ids(&mut self, ids: Vec<PgId>) {
        match self.freelist_type {
            FreelistType::Array => {
                self.ids = ids;
            }
            FreelistType::HashMap => {
                self.init_spans(&ids);
            }
        }
        self.reindex();
    }

    /// Returns the sorted ids of all free pages.
    pub(crate) fn get_free_page_ids(&self) -> Vec<PgId> {
        match self.freelist_type {
            FreelistType::Array => self.ids.clone(),
            FreelistType::HashMap => {
                let count = self.free_count();
                let mut m = Vec::with_capacity(count);
                for (&start, &size) in &self.forward_map {
                    for i in 0..size {
                        m.push(start + i);
                    }
                }
                m.sort_unstable();
                m
            }
        }
    }

    /// Merges the given pages into the free set.
    fn merge_spans(&mut self, ids: PgIds) {
        match self.freelist_type {
            FreelistType::Array => {
                let mut sorted = ids;
                sorted.sort();
                let mut merged = PgIds::from(std::mem::take(&mut self.ids));
                merged.merge(sorted);
                self.ids = merged.to_vec();
            }
            FreelistType::HashMap => {
                for id in ids.iter() {
                    self.merge_with_existing_span(*id);
                }
            }
        }
    }

    /// Rebuilds the free cache based on available and pending free lists.
    fn reindex(&mut self) {
        let ids = self.get_free_page_ids();
        self.cache = FnvHashSet::with_capacity_and_hasher(ids.len(), Default::default());
        for id in ids {
            self.cache.insert(id);
        }
        for txp in self.pending.values() {
            for pending_id in &txp.ids {
                self.cache.insert(*pending_id);
            }
        }
    }

    // Merges pid into the existing free spans, coalescing backward and
    // forward neighbours.
    fn merge_with_existing_span(&mut self, pid: PgId) {
        let prev = pid - 1;
        let next = pid + 1;

        let mut new_start = pid;
        let mut new_size: u64 = 1;

        if let Some(&pre_size) = self.backward_map.get(&prev) {
            // merge with previous span
            let start = prev + 1 - pre_size;
            self.del_span(start, pre_size);

            new_start -= pre_size;
            new_size += pre_size;
        }

        if let Some(&next_size) = self.forward_map.get(&next) {
            // merge with next span
            self.del_span(next, next_size);
            new_size += next_size;
        }

        self.add_span(new_start, new_size);
    }

    fn add_span(&mut self, start: PgId, size: u64) {
        if size == 0 {
            return;
        }
        self.backward_map.insert(start - 1 + size, size);
        self.forward_map.insert(start, size);
        self.freemaps.entry(size).or_default().insert(start);
    }

    fn del_span(&mut self, start: PgId, size: u64) {
        self.forward_map.remove(&start);
        self.backward_map.remove(&(start + size - 1));
        if let Some(set) = self.freemaps.get_mut(&size) {
            set.remove(&start);
            if set.is_empty() {
                self.freemaps.remove(&size);
            }
        }
    }

    // Builds the span indexes from a sorted id list.
    fn init_spans(&mut self, pgids: &[PgId]) {
        self.freemaps.clear();
        self.forward_map.clear();
        self.backward_map.clear();

        if pgids.is_empty() {
            return;
        }

        assert!(pgids.windows(2).all(|w| w[0] < w[1]), "pgids not sorted");

        let mut size: u64 = 1;
        let mut start = pgids[0];

        for i in 1..pgids.len() {
            if pgids[i] == pgids[i - 1] + 1 {
                size += 1;
            } else {
                self.add_span(start, size);
                size = 1;
                start = pgids[i];
            }
        }

        if size != 0 && start != 0 {
            self.add_span(start, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::page::OwnedPage;

    fn page_with(id: PgId, overflow: u32) -> OwnedPage {
        let mut p = OwnedPage::new(4096);
        p.set_id(id);
        p.set_flags(PageFlags::LEAF_PAGE);
        p.set_overflow(overflow);
        p
    }

    fn both_types() -> [FreelistType; 2] {
        [FreelistType::Array, FreelistType::HashMap]
    }

    #[test]
    fn test_free_and_release() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.free(100, &page_with(12, 0));
            assert_eq!(f.pending_count(), 1);
            assert_eq!(f.free_count(), 0);
            assert_eq!(f.count(), 1);
            assert!(f.freed(12));

            f.release(100);
            assert_eq!(f.pending_count(), 0);
            assert_eq!(f.free_count(), 1);
            assert!(f.freed(12));
        }
    }

    #[test]
    fn test_free_overflow() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.free(100, &page_with(12, 3));
            f.release(100);
            assert_eq!(f.get_free_page_ids(), vec![12, 13, 14, 15]);
        }
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn test_double_free_panics() {
        let mut f = Freelist::new(FreelistType::Array);
        f.free(100, &page_with(12, 0));
        f.free(101, &page_with(12, 0));
    }

    #[test]
    fn test_release_ordering() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.free(100, &page_with(12, 1));
            f.free(100, &page_with(9, 0));
            f.free(102, &page_with(39, 0));

            // releasing up to 100 must not touch tx 102's pending set
            f.release(100);
            assert_eq!(f.get_free_page_ids(), vec![9, 12, 13]);
            assert_eq!(f.pending_count(), 1);

            f.release(102);
            assert_eq!(f.get_free_page_ids(), vec![9, 12, 13, 39]);
            assert_eq!(f.pending_count(), 0);
        }
    }

    #[test]
    fn test_release_range() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);

            // page 3 allocated by tx 199, freed by tx 200
            f.allocs.insert(3, 199);
            f.free(200, &page_with(3, 0));

            // releasing an extent that excludes the allocating txid keeps
            // the page pending
            f.release_range(201, 300);
            assert_eq!(f.free_count(), 0);
            assert_eq!(f.pending_count(), 1);

            // releasing the covering extent frees it
            f.release_range(100, 300);
            assert_eq!(f.get_free_page_ids(), vec![3]);
            assert_eq!(f.pending_count(), 0);
        }
    }

    #[test]
    fn test_rollback() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);

            // page 5 was allocated by tx 98 and freed by tx 100;
            // page 12 was allocated by tx 100 itself and then freed.
            f.allocs.insert(5, 98);
            f.free(100, &page_with(5, 0));
            f.allocs.insert(12, 100);
            f.free(100, &page_with(12, 0));

            f.rollback(100);

            // the aborted tx's own page goes straight to the free set, the
            // foreign page is restored to the alloc ledger
            assert_eq!(f.get_free_page_ids(), vec![12]);
            assert_eq!(f.pending_count(), 0);
            assert_eq!(f.allocs.get(&5), Some(&98));
            assert!(!f.freed(5));
        }
    }

    #[test]
    fn test_allocate_contiguous() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.read_ids(vec![3, 4, 5, 6, 7, 9, 12, 13, 18]);

            let start = f.allocate(1, 3);
            assert!(start != 0);
            // the run must have come out of the free set
            assert_eq!(f.free_count(), 6);
            for id in start..start + 3 {
                assert!(!f.freed(id));
            }

            // no run of 4 remains in either representation
            assert_eq!(f.allocate(1, 4), 0);

            let single = f.allocate(1, 1);
            assert!(single != 0);
            assert_eq!(f.free_count(), 5);
        }
    }

    #[test]
    fn test_allocate_exhausts() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.read_ids(vec![4, 5]);
            assert_eq!(f.allocate(1, 3), 0);
            assert_eq!(f.allocate(1, 2), 4);
            assert_eq!(f.allocate(1, 1), 0);
            assert_eq!(f.free_count(), 0);
        }
    }

    #[test]
    fn test_representations_agree_on_history() {
        let history_free: &[(TxId, PgId, u32)] = &[(10, 3, 2), (10, 8, 0), (11, 12, 3), (12, 20, 0)];

        let mut results: Vec<Vec<PgId>> = Vec::new();
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            for &(txid, id, overflow) in history_free {
                f.free(txid, &page_with(id, overflow));
            }
            f.release(12);

            // identical allocation history in both representations
            let mut allocated = Vec::new();
            for n in [2usize, 1, 4, 1, 1] {
                let got = f.allocate(20, n);
                if got != 0 {
                    allocated.push((n, got));
                }
            }
            assert_eq!(f.count(), f.free_count());
            results.push(f.get_free_page_ids());

            // every allocated run left the free set
            for &(n, start) in &allocated {
                for id in start..start + n as PgId {
                    assert!(!f.freed(id));
                }
            }
        }

        // both representations end with the same number of free pages
        assert_eq!(results[0].len(), results[1].len());
    }

    #[test]
    fn test_write_read_roundtrip() {
        for ty in both_types() {
            let mut f = Freelist::new(ty);
            f.read_ids(vec![3, 4, 5, 11, 12, 28]);
            f.free(100, &page_with(40, 1));

            let mut p = OwnedPage::new(4096);
            p.set_id(2);
            f.write(&mut p);

            let mut read = Freelist::new(ty);
            read.read(&p);

            // pending ids are persisted as free
            assert_eq!(read.get_free_page_ids(), vec![3, 4, 5, 11, 12, 28, 40, 41]);
        }
    }

    #[test]
    fn test_write_read_overflow_boundaries() {
        // counts straddling the 0xFFFF encoding switch must round-trip
        for count in [0xFFFEusize, 0xFFFF, 0x10000] {
            let ids: Vec<PgId> = (2..2 + count as PgId).collect();

            let mut f = Freelist::new(FreelistType::Array);
            f.read_ids(ids.clone());
            assert_eq!(f.count(), count);

            let mut p = OwnedPage::new(f.size());
            p.set_id(2);
            f.write(&mut p);

            if count < 0xFFFF {
                assert_eq!(p.count() as usize, count);
            } else {
                assert_eq!(p.count(), 0xFFFF);
            }

            let mut read = Freelist::new(FreelistType::Array);
            read.read(&p);
            assert_eq!(read.get_free_page_ids(), ids);
        }
    }

    #[test]
    fn test_reload_filters_pending() {
        let mut f = Freelist::new(FreelistType::Array);
        f.read_ids(vec![3, 4]);
        f.free(100, &page_with(9, 0));

        let mut p = OwnedPage::new(4096);
        p.set_id(2);
        f.write(&mut p);

        // reading the page back while tx 100 is still pending must not
        // double-count page 9
        f.reload(&p);
        assert_eq!(f.get_free_page_ids(), vec![3, 4]);
        assert_eq!(f.pending_count(), 1);
        assert_eq!(f.count(), 3);
    }

    #[test]
    fn test_hashmap_spans_coalesce() {
        let mut f = Freelist::new(FreelistType::HashMap);
        f.read_ids(vec![3, 4, 7]);

        // freeing 5 and 6 must join [3,4], [5], [6], [7] into one span
        f.free(10, &page_with(5, 0));
        f.free(10, &page_with(6, 0));
        f.release(10);

        assert_eq!(f.get_free_page_ids(), vec![3, 4, 5, 6, 7]);
        assert_eq!(f.forward_map.get(&3), Some(&5));
        assert_eq!(f.backward_map.get(&7), Some(&5));
        assert_eq!(f.allocate(11, 5), 3);
    }

    #[test]
    fn test_size_reports_overflow_slot() {
        let mut f = Freelist::new(FreelistType::Array);
        f.read_ids((2..2 + 0xFFFF as PgId).collect());
        assert_eq!(f.size(), PAGE_HEADER_SIZE + PGID_SIZE * (0xFFFF + 1));
    }
}
