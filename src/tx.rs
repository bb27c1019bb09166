//! Tx represents a read-only or read/write transaction on the database.
//! Read-only transactions can be used for retrieving values for keys and
//! creating cursors. Read/write transactions can create and remove buckets
//! and create and remove keys.
//!
//! IMPORTANT: You must commit or rollback transactions when you are done
//! with them. Pages can not be reclaimed by the writer until no more
//! transactions are using them. A long running read transaction can cause
//! the database to quickly grow.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI64, Ordering};

use fnv::FnvHashSet;
use once_cell::unsync::OnceCell;

use crate::bucket::Bucket;
use crate::common::TxId;
use crate::common::bucket::InBucket;
use crate::common::meta::Meta;
use crate::common::page::{OwnedPage, Page, PgId};
use crate::common::types::{IGNORE_NO_SYNC, MAX_ALLOC_SIZE, PGID_NO_FREELIST};
use crate::db::DB;
use crate::errors::{Error, Result};
use crate::node::Node;

pub(crate) struct RawTx {
    writable: bool,
    /// Strong handle back to the database; cleared when the tx closes. The
    /// handle keeps the mapping alive while pages are borrowed from it.
    db: RefCell<Option<DB>>,
    /// transaction meta
    meta: RefCell<Meta>,
    /// root bucket, boxed so node back-pointers stay stable
    root: OnceCell<Box<Bucket>>,
    /// dirty page cache, only populated by writers
    pages: RefCell<HashMap<PgId, OwnedPage>>,
    /// transaction stats
    stats: TxStats,
}

impl RawTx {
    fn txid(&self) -> TxId {
        self.meta.borrow().txid()
    }

    // Core of rollback, shared with the drop guard so an abandoned writer
    // can never leave pending freelist state behind.
    pub(crate) fn rollback_raw(&self) {
        let db = match &*self.db.borrow() {
            Some(db) => db.clone(),
            None => return,
        };

        if self.writable {
            db.freelist_rollback(self.txid());

            // Restore the in-memory freelist to the committed on-disk state
            // so any mutation from this tx disappears.
            if db.has_synced_freelist() {
                let meta = db.meta_copy();
                let p = db.page(meta.freelist());
                db.freelist_reload(unsafe { &*p });
            } else {
                let ids = db.free_page_ids_by_scan();
                db.freelist_no_sync_reload(ids);
            }
        }

        self.close_raw(&db);
    }

    fn close_raw(&self, db: &DB) {
        if self.writable {
            db.remove_writer(&self.stats);
        } else {
            db.remove_reader(self.txid(), &self.stats);
        }
        *self.db.borrow_mut() = None;
        self.pages.borrow_mut().clear();
    }
}

impl Drop for RawTx {
    fn drop(&mut self) {
        // A transaction dropped without an explicit commit rolls back.
        if self.db.borrow().is_some() {
            self.rollback_raw();
        }
    }
}

pub struct Tx(pub(crate) Rc<RawTx>);

#[derive(Debug, Clone)]
pub(crate) struct WeakTx(Weak<RawTx>);

impl WeakTx {
    pub(crate) fn upgrade(&self) -> Option<Tx> {
        self.0.upgrade().map(Tx)
    }

    pub(crate) fn from(tx: &Tx) -> Self {
        Self(Rc::downgrade(&tx.0))
    }
}

impl Tx {
    pub(crate) fn build(db: &DB, writable: bool) -> Tx {
        let mut meta = db.meta_copy();
        if writable {
            meta.inc_txid();
        }
        let root_header = *meta.root_bucket();

        let tx = Tx(Rc::new(RawTx {
            writable,
            db: RefCell::new(Some(db.clone())),
            meta: RefCell::new(meta),
            root: OnceCell::new(),
            pages: RefCell::new(HashMap::new()),
            stats: TxStats::default(),
        }));

        let root = Bucket::new(WeakTx::from(&tx));
        root.in_bucket.set(root_header);
        let _ = tx.0.root.set(Box::new(root));

        tx
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TxId {
        self.0.txid()
    }

    /// Returns whether the transaction can mutate the database.
    pub fn writable(&self) -> bool {
        self.0.writable
    }

    /// Returns current database size in bytes as seen by this transaction.
    pub fn size(&self) -> u64 {
        self.0.meta.borrow().pgid() * self.page_size() as u64
    }

    pub(crate) fn db(&self) -> Result<DB> {
        self.0.db.borrow().clone().ok_or(Error::TxClosed)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.0.meta.borrow().page_size() as usize
    }

    /// High water mark of the transaction's meta.
    pub(crate) fn pgid(&self) -> PgId {
        self.0.meta.borrow().pgid()
    }

    pub fn stats(&self) -> &TxStats {
        &self.0.stats
    }

    /// Returns the root bucket of the transaction.
    pub fn root(&self) -> &Bucket {
        self.0.root.get().expect("tx root bucket not initialized")
    }

    /// Retrieves a top-level bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.root().bucket(name)
    }

    /// Creates a new top-level bucket.
    pub fn create_bucket(&self, name: &[u8]) -> Result<&Bucket> {
        self.root().create_bucket(name)
    }

    /// Creates a new top-level bucket if it doesn't already exist.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<&Bucket> {
        self.root().create_bucket_if_not_exists(name)
    }

    /// Deletes a top-level bucket.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root().delete_bucket(name)
    }

    /// Creates a cursor over the top-level buckets of the transaction.
    pub fn cursor(&self) -> crate::cursor::Cursor<'_> {
        self.root().cursor()
    }

    /// Resolves a page id, preferring this transaction's dirty pages over
    /// the mapped file.
    pub(crate) fn page(&self, id: PgId) -> *const Page {
        {
            let pages = self.0.pages.borrow();
            if let Some(p) = pages.get(&id) {
                let pg: &Page = p;
                return pg as *const Page;
            }
        }
        self.0
            .db
            .borrow()
            .as_ref()
            .expect("page access on closed tx")
            .page(id)
    }

    /// Walks every page of the tree rooted at pgid.
    pub(crate) fn for_each_page<F: FnMut(&Page, usize)>(&self, pgid: PgId, f: &mut F) {
        self.for_each_page_rec(pgid, 0, f);
    }

    fn for_each_page_rec<F: FnMut(&Page, usize)>(&self, pgid: PgId, depth: usize, f: &mut F) {
        let p = unsafe { &*self.page(pgid) };
        f(p, depth);

        if p.is_branch_page() {
            for i in 0..p.count() as usize {
                let elem = p.branch_page_element(i);
                self.for_each_page_rec(elem.pgid(), depth + 1, f);
            }
        }
    }

    /// Returns a contiguous block of `count` pages, registering the dirty
    /// page buffer with the transaction. Grows the database file when the
    /// freelist has no suitable run.
    pub(crate) fn allocate(&self, count: usize) -> Result<PgId> {
        let db = self.db()?;
        let txid = self.id();

        assert!(
            (count * self.page_size()) as u64 <= MAX_ALLOC_SIZE,
            "allocation of {} pages exceeds the maximum buffer size",
            count
        );

        let mut pgid = db.freelist_allocate(txid, count);
        if pgid == 0 {
            // Append past the high water mark, growing the mapping first if
            // it is too small.
            pgid = self.0.meta.borrow().pgid();
            let minsz = (pgid as usize + count + 1) * self.page_size();
            if minsz >= db.datasz() {
                // Cached nodes must not alias the old region once it is
                // unmapped.
                self.root().dereference();
                db.grow_mmap(minsz)?;
            }
            self.0.meta.borrow_mut().set_pgid(pgid + count as PgId);
        }

        let mut page = OwnedPage::new(count * self.page_size());
        page.set_id(pgid);
        page.set_overflow(count as u32 - 1);
        self.0.pages.borrow_mut().insert(pgid, page);

        self.0.stats.inc_page_count();
        self.0
            .stats
            .add_page_alloc((count * self.page_size()) as i64);

        Ok(pgid)
    }

    /// Serializes a spilled node into its allocated dirty page.
    pub(crate) fn write_node(&self, node: &Node) {
        let mut pages = self.0.pages.borrow_mut();
        let page = pages
            .get_mut(&node.pgid())
            .expect("spilled node has no allocated page");
        node.write(page);
    }

    /// Moves a page (and its overflow) into the freelist's pending set for
    /// this transaction.
    pub(crate) fn free_page(&self, id: PgId) {
        let db = self.db().expect("free on closed tx");
        let p = self.page(id);
        db.freelist_free(self.id(), unsafe { &*p });
    }

    /// Commit writes all changes to disk and updates the meta page.
    /// Returns an error if a disk write error occurs, or if commit is
    /// called on a read-only transaction.
    pub fn commit(self) -> Result<()> {
        let db = self.db()?;
        if !self.0.writable {
            return Err(Error::TxNotWritable);
        }

        log::debug!("committing tx {}", self.id());

        // Rebalance nodes which have had deletions.
        self.root().rebalance();

        // Spill data onto dirty pages.
        if let Err(e) = self.root().spill() {
            self.0.rollback_raw();
            return Err(e);
        }

        // The root bucket header (root pgid and sequence) moves into the
        // meta we are about to commit.
        self.0
            .meta
            .borrow_mut()
            .set_root_bucket(self.root().in_bucket.get());

        let opgid = db.meta_copy().pgid();

        // Free the old freelist because commit writes out a fresh freelist.
        let (old_freelist, persisted) = {
            let meta = self.0.meta.borrow();
            (meta.freelist(), meta.is_freelist_persisted())
        };
        if persisted {
            self.free_page(old_freelist);
        }

        if db.no_freelist_sync() {
            self.0.meta.borrow_mut().set_freelist(PGID_NO_FREELIST);
        } else if let Err(e) = self.commit_freelist(&db) {
            self.0.rollback_raw();
            return Err(e);
        }

        // If the high water mark has moved up then attempt to grow the
        // database file.
        let new_pgid = self.0.meta.borrow().pgid();
        if new_pgid > opgid {
            if let Err(e) = db.grow_file((new_pgid as usize + 1) * self.page_size()) {
                self.0.rollback_raw();
                return Err(e);
            }
        }

        // Write dirty pages to disk.
        if let Err(e) = self.write_pages(&db) {
            self.0.rollback_raw();
            return Err(e);
        }

        // Write meta to disk.
        if let Err(e) = self.write_meta(&db) {
            self.0.rollback_raw();
            return Err(e);
        }

        // Release the pages freed by committed transactions that no open
        // reader can observe anymore.
        db.release_pending_pages();

        self.0.close_raw(&db);
        Ok(())
    }

    /// Rollback closes the transaction and ignores all previous updates.
    /// Read-only transactions must be rolled back and not committed.
    pub fn rollback(self) -> Result<()> {
        if self.0.db.borrow().is_none() {
            return Err(Error::TxClosed);
        }
        self.0.rollback_raw();
        Ok(())
    }

    // Writes the freelist into freshly allocated pages and points the meta
    // at them.
    fn commit_freelist(&self, db: &DB) -> Result<()> {
        // The allocation itself shrinks the freelist, so the size computed
        // here never underestimates.
        let count = db.freelist_size() / self.page_size() + 1;
        let pgid = self.allocate(count)?;

        {
            let mut pages = self.0.pages.borrow_mut();
            let page = pages.get_mut(&pgid).expect("freelist page not allocated");
            db.freelist_write(page);
        }
        self.0.meta.borrow_mut().set_freelist(pgid);

        Ok(())
    }

    // Writes any dirty pages to disk in ascending id order.
    fn write_pages(&self, db: &DB) -> Result<()> {
        let mut pages: Vec<(PgId, OwnedPage)> = self.0.pages.borrow_mut().drain().collect();
        pages.sort_by_key(|(id, _)| *id);

        let page_size = self.page_size() as u64;
        for (id, p) in &pages {
            db.write_at(p.buf(), *id * page_size)?;
            self.0.stats.inc_write();
        }

        if !db.no_sync() || IGNORE_NO_SYNC {
            db.sync_data()?;
        }

        Ok(())
    }

    // Writes the meta to its alternating page slot.
    fn write_meta(&self, db: &DB) -> Result<()> {
        let mut buf = OwnedPage::new(self.page_size());
        {
            let mut meta = self.0.meta.borrow_mut();
            meta.write(&mut buf);
        }

        db.write_at(buf.buf(), buf.id() * self.page_size() as u64)?;
        if !db.no_sync() || IGNORE_NO_SYNC {
            db.sync_data()?;
        }
        self.0.stats.inc_write();

        Ok(())
    }

    /// Verifies that no page is referenced by the tree while sitting on the
    /// freelist and that every referenced page id is below the high water
    /// mark. Intended for tests and debugging.
    pub fn check(&self) -> Result<()> {
        let db = self.db()?;

        let mut reachable: FnvHashSet<PgId> = FnvHashSet::default();
        reachable.insert(0);
        reachable.insert(1);

        let (freelist_pgid, persisted) = {
            let meta = self.0.meta.borrow();
            (meta.freelist(), meta.is_freelist_persisted())
        };
        if persisted {
            let p = unsafe { &*self.page(freelist_pgid) };
            for id in freelist_pgid..=freelist_pgid + p.overflow() as PgId {
                reachable.insert(id);
            }
        }

        let root = self.0.meta.borrow().root_bucket().root_page();
        self.collect_reachable(root, &mut reachable)?;

        let high = self.pgid();
        for id in &reachable {
            if *id >= high {
                return Err(Error::Invalid);
            }
        }

        for id in db.freelist_free_ids() {
            if reachable.contains(&id) {
                return Err(Error::Invalid);
            }
        }

        Ok(())
    }

    fn collect_reachable(&self, pgid: PgId, reachable: &mut FnvHashSet<PgId>) -> Result<()> {
        // Inline bucket, nothing on disk to visit.
        if pgid == 0 {
            return Ok(());
        }

        let p = unsafe { &*self.page(pgid) };
        for id in pgid..=pgid + p.overflow() as PgId {
            if !reachable.insert(id) {
                // a page can only be referenced once
                return Err(Error::Invalid);
            }
        }

        if p.is_branch_page() {
            for i in 0..p.count() as usize {
                self.collect_reachable(p.branch_page_element(i).pgid(), reachable)?;
            }
        } else if p.is_leaf_page() {
            for i in 0..p.count() as usize {
                let elem = p.leaf_page_element(i);
                if elem.is_bucket_entry() {
                    let child = InBucket::from_value(elem.value());
                    self.collect_reachable(child.root_page(), reachable)?;
                }
            }
        }

        Ok(())
    }
}

/// TxStats represents statistics about the actions performed by the
/// transaction.
#[derive(Debug, Default)]
pub struct TxStats {
    // number of page allocations
    page_count: AtomicI64,
    // total bytes allocated
    page_alloc: AtomicI64,
    // number of cursors created
    cursor_count: AtomicI64,
    // number of node allocations
    node_count: AtomicI64,
    // number of node dereferences
    node_deref: AtomicI64,
    // number of node rebalances
    rebalance: AtomicI64,
    // number of nodes split
    split: AtomicI64,
    // number of nodes spilled
    spill: AtomicI64,
    // number of writes performed
    write: AtomicI64,
}

impl TxStats {
    pub fn page_count(&self) -> i64 {
        self.page_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_page_count(&self) {
        self.page_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_alloc(&self) -> i64 {
        self.page_alloc.load(Ordering::Acquire)
    }

    pub(crate) fn add_page_alloc(&self, n: i64) {
        self.page_alloc.fetch_add(n, Ordering::Relaxed);
    }

    pub fn cursor_count(&self) -> i64 {
        self.cursor_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_cursor_count(&self) {
        self.cursor_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_count(&self) -> i64 {
        self.node_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_node_count(&self) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_deref(&self) -> i64 {
        self.node_deref.load(Ordering::Acquire)
    }

    pub(crate) fn inc_node_deref(&self) {
        self.node_deref.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rebalance(&self) -> i64 {
        self.rebalance.load(Ordering::Acquire)
    }

    pub(crate) fn inc_rebalance(&self) {
        self.rebalance.fetch_add(1, Ordering::Relaxed);
    }

    pub fn split(&self) -> i64 {
        self.split.load(Ordering::Acquire)
    }

    pub(crate) fn inc_split(&self) {
        self.split.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spill(&self) -> i64 {
        self.spill.load(Ordering::Acquire)
    }

    pub(crate) fn inc_spill(&self) {
        self.spill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write(&self) -> i64 {
        self.write.load(Ordering::Acquire)
    }

    pub(crate) fn inc_write(&self) {
        self.write.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulates another stats block into this one.
    pub(crate) fn add(&self, other: &TxStats) {
        self.page_count
            .fetch_add(other.page_count(), Ordering::Relaxed);
        self.page_alloc
            .fetch_add(other.page_alloc(), Ordering::Relaxed);
        self.cursor_count
            .fetch_add(other.cursor_count(), Ordering::Relaxed);
        self.node_count
            .fetch_add(other.node_count(), Ordering::Relaxed);
        self.node_deref
            .fetch_add(other.node_deref(), Ordering::Relaxed);
        self.rebalance
            .fetch_add(other.rebalance(), Ordering::Relaxed);
        self.split.fetch_add(other.split(), Ordering::Relaxed);
        self.spill.fetch_add(other.spill(), Ordering::Relaxed);
        self.write.fetch_add(other.write(), Ordering::Relaxed);
    }
}

impl Clone for TxStats {
    fn clone(&self) -> Self {
        let stats = TxStats::default();
        stats.add(self);
        stats
    }
}
