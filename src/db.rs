use std::cell::UnsafeCell;
use std::fmt::{self, Display, Formatter};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashSet;
use fs4::fs_std::FileExt;
use log::{debug, info};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use parking_lot::lock_api::{RawMutex as RawMutexApi, RawRwLock as RawRwLockApi};
use parking_lot::{RawMutex, RawRwLock};
use std::os::unix::fs::FileExt as UnixFileExt;

use crate::common::TxId;
use crate::common::bucket::InBucket;
use crate::common::meta::Meta;
use crate::common::page::{OwnedPage, Page, PageFlags, PgId};
use crate::common::types::{
    DEFAULT_LOCK_TIMEOUT, DEFAULT_PAGE_SIZE, MAGIC, MAX_MAP_SIZE, MAX_MMAP_STEP, VERSION,
};
use crate::errors::{Error, Result};
use crate::freelist::{Freelist, FreelistType};
use crate::tx::{Tx, TxStats};

/// DB represents a collection of buckets persisted to a file on disk.
/// All data access is performed through transactions which can be obtained
/// through the DB. All the functions on DB will return DatabaseNotOpen if
/// accessed before open or after close.
pub(crate) struct RawDB {
    stats: Mutex<Stats>,

    path: PathBuf,
    file: Mutex<File>,

    // The read mapping shared by every transaction. Only replaced while
    // `mmaplock` is held exclusively.
    data: UnsafeCell<Option<Mmap>>,
    datasz: AtomicUsize,
    filesz: AtomicUsize,

    page_size: usize,
    opened: AtomicBool,

    freelist: Mutex<Freelist>,

    // Allows only one writer at a time; held for the writer's whole life.
    rwlock: RawMutex,
    // Protects meta page access during transaction begin.
    metalock: Mutex<()>,
    // Held shared by every reader, exclusively during remapping. Growth is
    // therefore a rare stop-the-world event against readers.
    mmaplock: RawRwLock,

    // Open read-only transaction ids, for pending page release.
    txs: Mutex<Vec<TxId>>,

    // Setting the no_sync flag will cause the database to skip fsync()
    // calls after each commit. THIS IS UNSAFE. PLEASE USE WITH CAUTION.
    no_sync: bool,
    // When true, skips the fsync after growing the database file.
    no_grow_sync: bool,
    // When true, skips syncing the freelist to disk. This improves write
    // performance but requires a full database re-scan during open.
    no_freelist_sync: bool,
    read_only: bool,
    // Pin the mapped region into physical memory.
    mlock: bool,
}

unsafe impl Send for RawDB {}
unsafe impl Sync for RawDB {}

#[derive(Clone)]
pub struct DB(pub(crate) Arc<RawDB>);

impl DB {
    /// Open creates and opens a database at the given path with default
    /// options. If the file does not exist then it will be created
    /// automatically.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DB> {
        DB::open_with(path, Options::default())
    }

    /// Open creates and opens a database at the given path.
    /// If the file does not exist then it will be created automatically
    /// (unless the read-only option is set).
    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> Result<DB> {
        let path = path.as_ref().to_path_buf();

        let mut open_options = OpenOptions::new();
        open_options.read(true);
        if !options.read_only {
            open_options.write(true).create(true);
        }
        let file = open_options.open(&path)?;

        // Lock file so that other processes using the database in
        // read-write mode cannot use the database at the same time.
        // Read-only opens take a shared lock instead.
        lock_file(&file, options.read_only, options.timeout)?;

        let mut page_size = options.page_size;
        if page_size == 0 {
            page_size = *DEFAULT_PAGE_SIZE;
        }

        let filesz = file.metadata()?.len() as usize;

        if filesz == 0 {
            // Initialize the database if it doesn't exist.
            init_file(&file, page_size)?;
        } else {
            if filesz < crate::common::PAGE_HEADER_SIZE + crate::common::meta::META_PAGE_SIZE {
                return Err(Error::FileTooSmall);
            }

            // Read the first meta page to determine the page size the file
            // was created with.
            let mut probe = OwnedPage::new(1024.min(filesz));
            file.read_exact_at(probe.buf_mut(), 0)?;
            let meta = probe.meta();
            if meta.validate().is_ok() {
                page_size = meta.page_size() as usize;
            }

            if filesz < page_size * 2 {
                return Err(Error::FileTooSmall);
            }
        }

        let db = DB(Arc::new(RawDB {
            stats: Mutex::new(Stats::default()),
            path,
            file: Mutex::new(file),
            data: UnsafeCell::new(None),
            datasz: AtomicUsize::new(0),
            filesz: AtomicUsize::new(0),
            page_size,
            opened: AtomicBool::new(false),
            freelist: Mutex::new(Freelist::new(options.freelist_type)),
            rwlock: RawMutex::INIT,
            metalock: Mutex::new(()),
            mmaplock: RawRwLock::INIT,
            txs: Mutex::new(Vec::new()),
            no_sync: options.no_sync,
            no_grow_sync: options.no_grow_sync,
            no_freelist_sync: options.no_freelist_sync,
            read_only: options.read_only,
            mlock: options.mlock,
        }));

        // Memory map the data file.
        db.mmap(options.initial_mmap_size)?;

        // Both metas are validated inside; open fails if neither is usable.
        let meta = db.meta_copy_checked()?;

        // Load the freelist, either from its page or by scanning the tree
        // when the freelist was never persisted.
        if meta.is_freelist_persisted() {
            let p = db.page(meta.freelist());
            db.0.freelist.lock().read(unsafe { &*p });
        } else {
            let ids = db.free_page_ids_by_scan();
            db.0.freelist.lock().read_ids(ids);
        }

        db.0.opened.store(true, Ordering::Release);
        info!(
            "opened database {:?} (page_size={}, txid={})",
            db.0.path,
            page_size,
            meta.txid()
        );
        Ok(db)
    }

    /// Path returns the path to the currently open database file.
    pub fn path(&self) -> PathBuf {
        self.0.path.clone()
    }

    /// Begin starts a new transaction. Multiple read-only transactions can
    /// be used concurrently but only one write transaction can be used at
    /// a time.
    ///
    /// IMPORTANT: You must close read-only transactions after you are
    /// finished or else the database will not reclaim old pages.
    pub fn begin(&self, writable: bool) -> Result<Tx> {
        if writable {
            self.begin_rwtx()
        } else {
            self.begin_tx()
        }
    }

    fn begin_tx(&self) -> Result<Tx> {
        // Lock the meta pages while we initialize the transaction. We obtain
        // the meta lock before the mmap lock because that's the order the
        // write transaction will obtain them.
        let meta_guard = self.0.metalock.lock();

        // Obtain a read-only lock on the mmap. When the mmap is remapped it
        // will obtain a write lock so all transactions must finish before it
        // can be remapped.
        self.0.mmaplock.lock_shared();

        if !self.0.opened.load(Ordering::Acquire) {
            unsafe { self.0.mmaplock.unlock_shared() };
            return Err(Error::DatabaseNotOpen);
        }

        let tx = Tx::build(self, false);
        self.0.txs.lock().push(tx.id());
        drop(meta_guard);

        let mut stats = self.0.stats.lock();
        stats.tx_n += 1;
        stats.open_tx_n += 1;

        Ok(tx)
    }

    fn begin_rwtx(&self) -> Result<Tx> {
        if self.0.read_only {
            return Err(Error::DatabaseReadOnly);
        }

        // Obtain writer lock. This is released by the transaction close.
        self.0.rwlock.lock();

        let _meta_guard = self.0.metalock.lock();

        if !self.0.opened.load(Ordering::Acquire) {
            unsafe { self.0.rwlock.unlock() };
            return Err(Error::DatabaseNotOpen);
        }

        Ok(Tx::build(self, true))
    }

    /// View executes a function within the context of a managed read-only
    /// transaction. Any error that is returned from the function is
    /// returned from view.
    pub fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Tx) -> Result<()>,
    {
        let tx = self.begin(false)?;
        match f(&tx) {
            Ok(()) => tx.rollback(),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Update executes a function within the context of a managed
    /// read-write transaction. If no error is returned from the function
    /// then the transaction is committed, otherwise it is rolled back.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Tx) -> Result<()>,
    {
        let tx = self.begin(true)?;
        match f(&tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Sync executes fdatasync() against the database file handle.
    ///
    /// This is not necessary under normal operation, however, if you use
    /// the no-sync option then it allows you to force the database file to
    /// sync against the disk.
    pub fn sync(&self) -> Result<()> {
        self.sync_data()
    }

    /// Stats retrieves ongoing performance stats for the database.
    /// This is only updated when a transaction closes.
    pub fn stats(&self) -> Stats {
        self.0.stats.lock().clone()
    }

    /// Close releases all database resources. It blocks until every open
    /// transaction finishes.
    pub fn close(&self) -> Result<()> {
        self.0.rwlock.lock();
        let meta_guard = self.0.metalock.lock();
        self.0.mmaplock.lock_exclusive();

        self.0.opened.store(false, Ordering::Release);
        unsafe { *self.0.data.get() = None };

        {
            let file = self.0.file.lock();
            let _ = FileExt::unlock(&*file);
        }

        unsafe {
            self.0.mmaplock.unlock_exclusive();
            self.0.rwlock.unlock();
        }
        drop(meta_guard);

        debug!("closed database {:?}", self.0.path);
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Page and meta access
    ///////////////////////////////////////////////////////////////////////////

    /// Returns a raw pointer to the page at `id` inside the mapped region.
    /// The pointer stays valid while the mapping does; callers hold either
    /// the shared mmap lock or the writer lock.
    pub(crate) fn page(&self, id: PgId) -> *const Page {
        let pos = id as usize * self.0.page_size;
        unsafe {
            let data = (*self.0.data.get()).as_ref().expect("database not mapped");
            assert!(
                pos + self.0.page_size <= data.len(),
                "page {} out of mapped range",
                id
            );
            crate::common::load_page(&data[pos..]) as *const Page
        }
    }

    /// Returns the meta with the highest txid that passes validation.
    pub(crate) fn meta_copy_checked(&self) -> Result<Meta> {
        // We have to return the meta with the highest txid which doesn't
        // fail validation. Otherwise, we can cause errors when in fact the
        // database is in a consistent state. meta_a is the one with the
        // higher txid.
        let meta0 = unsafe { (*self.page(0)).meta().clone() };
        let meta1 = unsafe { (*self.page(1)).meta().clone() };

        let (meta_a, meta_b) = if meta1.txid() > meta0.txid() {
            (meta1, meta0)
        } else {
            (meta0, meta1)
        };

        if meta_a.validate().is_ok() {
            return Ok(meta_a);
        }
        if meta_b.validate().is_ok() {
            return Ok(meta_b);
        }

        // This should never be reached, because both meta1 and meta0 were
        // validated on mmap and we do fsync before writing them.
        Err(Error::Invalid)
    }

    pub(crate) fn meta_copy(&self) -> Meta {
        self.meta_copy_checked().expect("both meta pages invalid")
    }

    ///////////////////////////////////////////////////////////////////////////
    // Mapping and file growth
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn datasz(&self) -> usize {
        self.0.datasz.load(Ordering::Acquire)
    }

    /// Grows the mapping to hold at least `min_size` bytes. Blocks until
    /// every open reader finishes.
    pub(crate) fn grow_mmap(&self, min_size: usize) -> Result<()> {
        debug!("remapping database to >= {} bytes", min_size);
        self.mmap(min_size)
    }

    // Opens (or reopens) the memory map, sized by the doubling schedule.
    fn mmap(&self, min_size: usize) -> Result<()> {
        self.0.mmaplock.lock_exclusive();
        let result = self.mmap_locked(min_size);
        unsafe { self.0.mmaplock.unlock_exclusive() };
        result
    }

    fn mmap_locked(&self, min_size: usize) -> Result<()> {
        let file = self.0.file.lock();
        let filesz = file.metadata()?.len() as usize;
        if filesz < self.0.page_size * 2 {
            return Err(Error::FileTooSmall);
        }

        let size = self.mmap_size(filesz.max(min_size))?;

        // Unmap the old region first.
        unsafe { *self.0.data.get() = None };

        let mmap = unsafe { MmapOptions::new().len(size).map(&*file)? };

        #[cfg(unix)]
        if self.0.mlock {
            mmap.lock()?;
        }

        unsafe { *self.0.data.get() = Some(mmap) };
        self.0.datasz.store(size, Ordering::Release);
        self.0.filesz.store(filesz, Ordering::Release);
        drop(file);

        // Revalidate the meta pages against the fresh mapping.
        self.meta_copy_checked()?;
        Ok(())
    }

    // Determines the appropriate size for the mmap given the current size
    // of the database: double from 32KB until 1GB, then grow in 1GB steps,
    // aligned to the page size.
    fn mmap_size(&self, size: usize) -> Result<usize> {
        for i in 15..=30u32 {
            if size <= 1 << i {
                return Ok(1 << i);
            }
        }

        if size as u64 > MAX_MAP_SIZE {
            return Err(Error::Io(String::from("mmap too large")));
        }

        // If larger than 1GB then grow by 1GB at a time.
        let step = MAX_MMAP_STEP as u64;
        let mut sz = size as u64;
        let remainder = sz % step;
        if remainder > 0 {
            sz += step - remainder;
        }

        // Ensure that the mmap size is a multiple of the page size.
        let ps = self.0.page_size as u64;
        if sz % ps != 0 {
            sz = ((sz / ps) + 1) * ps;
        }

        if sz > MAX_MAP_SIZE {
            sz = MAX_MAP_SIZE;
        }

        Ok(sz as usize)
    }

    /// Grows the database file to at least `size` bytes.
    pub(crate) fn grow_file(&self, size: usize) -> Result<()> {
        if size <= self.0.filesz.load(Ordering::Acquire) {
            return Ok(());
        }

        let file = self.0.file.lock();
        file.set_len(size as u64)?;
        if !self.0.no_grow_sync && !self.0.read_only {
            file.sync_all()?;
        }
        self.0.filesz.store(size, Ordering::Release);

        debug!("grew database file to {} bytes", size);
        Ok(())
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.0.file.lock();
        file.write_all_at(buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        let file = self.0.file.lock();
        file.sync_data()?;
        Ok(())
    }

    pub(crate) fn no_sync(&self) -> bool {
        self.0.no_sync
    }

    pub(crate) fn no_freelist_sync(&self) -> bool {
        self.0.no_freelist_sync
    }

    pub(crate) fn page_size(&self) -> usize {
        self.0.page_size
    }

    ///////////////////////////////////////////////////////////////////////////
    // Freelist plumbing
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn freelist_allocate(&self, txid: TxId, count: usize) -> PgId {
        self.0.freelist.lock().allocate(txid, count)
    }

    pub(crate) fn freelist_free(&self, txid: TxId, p: &Page) {
        self.0.freelist.lock().free(txid, p);
    }

    pub(crate) fn freelist_rollback(&self, txid: TxId) {
        self.0.freelist.lock().rollback(txid);
    }

    pub(crate) fn freelist_reload(&self, p: &Page) {
        self.0.freelist.lock().reload(p);
    }

    pub(crate) fn freelist_no_sync_reload(&self, ids: Vec<PgId>) {
        self.0.freelist.lock().no_sync_reload(ids);
    }

    pub(crate) fn freelist_size(&self) -> usize {
        self.0.freelist.lock().size()
    }

    pub(crate) fn freelist_write(&self, p: &mut Page) {
        self.0.freelist.lock().write(p);
    }

    pub(crate) fn freelist_free_ids(&self) -> Vec<PgId> {
        self.0.freelist.lock().get_free_page_ids()
    }

    pub(crate) fn has_synced_freelist(&self) -> bool {
        self.meta_copy().is_freelist_persisted()
    }

    /// Promotes every pending page that no open reader can still observe.
    /// Called at the end of every successful commit.
    pub(crate) fn release_pending_pages(&self) {
        let mut sorted: Vec<TxId> = self.0.txs.lock().clone();
        sorted.sort_unstable();

        let mut freelist = self.0.freelist.lock();
        let mut minid = sorted.first().copied().unwrap_or(TxId::MAX);
        if minid > 0 {
            freelist.release(minid - 1);
        }
        for reader in sorted {
            freelist.release_range(minid, reader.saturating_sub(1));
            minid = reader + 1;
        }
        freelist.release_range(minid, TxId::MAX);
    }

    /// Reconstructs the set of free page ids by walking every reachable
    /// page of the committed tree. Used when the freelist is not persisted.
    pub(crate) fn free_page_ids_by_scan(&self) -> Vec<PgId> {
        let meta = self.meta_copy();

        let mut reachable: FnvHashSet<PgId> = FnvHashSet::default();
        reachable.insert(0);
        reachable.insert(1);

        if meta.is_freelist_persisted() {
            let p = unsafe { &*self.page(meta.freelist()) };
            for id in meta.freelist()..=meta.freelist() + p.overflow() as PgId {
                reachable.insert(id);
            }
        }

        self.collect_reachable(meta.root_bucket().root_page(), &mut reachable);

        (2..meta.pgid())
            .filter(|id| !reachable.contains(id))
            .collect()
    }

    fn collect_reachable(&self, pgid: PgId, reachable: &mut FnvHashSet<PgId>) {
        if pgid == 0 {
            // inline bucket, no pages of its own
            return;
        }

        let p = unsafe { &*self.page(pgid) };
        for id in pgid..=pgid + p.overflow() as PgId {
            reachable.insert(id);
        }

        if p.is_branch_page() {
            for i in 0..p.count() as usize {
                self.collect_reachable(p.branch_page_element(i).pgid(), reachable);
            }
        } else if p.is_leaf_page() {
            for i in 0..p.count() as usize {
                let elem = p.leaf_page_element(i);
                if elem.is_bucket_entry() {
                    let child = InBucket::from_value(elem.value());
                    self.collect_reachable(child.root_page(), reachable);
                }
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Transaction close hooks
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn remove_writer(&self, tx_stats: &TxStats) {
        {
            let freelist = self.0.freelist.lock();
            let mut stats = self.0.stats.lock();
            stats.free_page_n = freelist.free_count() as i64;
            stats.pending_page_n = freelist.pending_count() as i64;
            stats.free_alloc =
                ((freelist.free_count() + freelist.pending_count()) * self.0.page_size) as i64;
            stats.freelist_inuse = freelist.size() as i64;
            stats.tx_stats.add(tx_stats);
        }

        unsafe { self.0.rwlock.unlock() };
    }

    pub(crate) fn remove_reader(&self, txid: TxId, tx_stats: &TxStats) {
        {
            let mut txs = self.0.txs.lock();
            if let Some(pos) = txs.iter().position(|&t| t == txid) {
                txs.remove(pos);
            }
        }

        unsafe { self.0.mmaplock.unlock_shared() };

        let mut stats = self.0.stats.lock();
        stats.open_tx_n -= 1;
        stats.tx_stats.add(tx_stats);
    }
}

// Acquires the advisory file lock, polling until the timeout elapses.
// A zero timeout waits indefinitely.
fn lock_file(file: &File, read_only: bool, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        // Qualified calls: std gained inherent lock methods with different
        // signatures, the advisory lock here must come from fs4.
        let acquired = if read_only {
            FileExt::try_lock_shared(file)?
        } else {
            FileExt::try_lock_exclusive(file)?
        };
        if acquired {
            return Ok(());
        }
        if timeout != Duration::ZERO && start.elapsed() > timeout {
            return Err(Error::Timeout);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

// Writes the initial four pages of an empty database: two metas, an empty
// freelist, and an empty leaf serving as the root bucket.
fn init_file(file: &File, page_size: usize) -> Result<()> {
    for i in 0..2u64 {
        let mut p = OwnedPage::new(page_size);

        let mut meta = Meta::default();
        meta.set_magic(MAGIC);
        meta.set_version(VERSION);
        meta.set_page_size(page_size as u32);
        meta.set_root_bucket(InBucket::new(3, 0));
        meta.set_freelist(2);
        meta.set_pgid(4);
        meta.set_txid(i);
        // write() stamps the page id, the meta flag and the checksum
        meta.write(&mut p);

        file.write_all_at(p.buf(), i * page_size as u64)?;
    }

    let mut p = OwnedPage::new(page_size);
    p.set_id(2);
    p.set_flags(PageFlags::FREELIST_PAGE);
    file.write_all_at(p.buf(), 2 * page_size as u64)?;

    let mut p = OwnedPage::new(page_size);
    p.set_id(3);
    p.set_flags(PageFlags::LEAF_PAGE);
    file.write_all_at(p.buf(), 3 * page_size as u64)?;

    file.sync_all()?;
    Ok(())
}

/// Options represents the options that can be set when opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// The amount of time to wait to obtain the file lock. When set to
    /// zero it will wait indefinitely.
    pub timeout: Duration,

    /// Skip the fsync after growing the database file. Setting this is
    /// only safe on non-ext3/ext4 systems.
    pub no_grow_sync: bool,

    /// Do not sync the freelist to disk. This improves write performance
    /// but requires a full database scan on open.
    pub no_freelist_sync: bool,

    /// The backend freelist representation. Array is compact; hashmap is
    /// faster once the freelist grows large.
    pub freelist_type: FreelistType,

    /// Open database in read-only mode (shared file lock, no writers).
    pub read_only: bool,

    /// Initial length of the memory map. Read transactions won't block the
    /// write transaction while the mmap stays below this size.
    pub initial_mmap_size: usize,

    /// Overrides the default OS page size. Zero keeps the OS page size.
    pub page_size: usize,

    /// Skip fsync after every commit (risking durability for throughput).
    pub no_sync: bool,

    /// Lock the mapped region into memory (mlock).
    pub mlock: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            timeout: DEFAULT_LOCK_TIMEOUT,
            no_grow_sync: false,
            no_freelist_sync: false,
            freelist_type: FreelistType::Array,
            read_only: false,
            initial_mmap_size: 0,
            page_size: 0,
            no_sync: false,
            mlock: false,
        }
    }
}

impl Display for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{timeout: {:?}, no_grow_sync: {}, no_freelist_sync: {}, freelist_type: {}, read_only: {}, initial_mmap_size: {}, page_size: {}, no_sync: {}, mlock: {}}}",
            self.timeout,
            self.no_grow_sync,
            self.no_freelist_sync,
            self.freelist_type,
            self.read_only,
            self.initial_mmap_size,
            self.page_size,
            self.no_sync,
            self.mlock
        )
    }
}

/// Stats represents statistics about the database.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    // Freelist stats
    free_page_n: i64,    // total number of free pages on the freelist
    pending_page_n: i64, // total number of pending pages on the freelist
    free_alloc: i64,     // total bytes allocated in free pages
    freelist_inuse: i64, // total bytes used by the freelist

    // Transaction stats
    tx_n: i64,      // total number of started read transactions
    open_tx_n: i64, // number of currently open read transactions

    // Global, ongoing transaction counters.
    tx_stats: TxStats,
}

impl Stats {
    pub fn free_page_n(&self) -> i64 {
        self.free_page_n
    }

    pub fn pending_page_n(&self) -> i64 {
        self.pending_page_n
    }

    pub fn free_alloc(&self) -> i64 {
        self.free_alloc
    }

    pub fn freelist_inuse(&self) -> i64 {
        self.freelist_inuse
    }

    pub fn tx_n(&self) -> i64 {
        self.tx_n
    }

    pub fn open_tx_n(&self) -> i64 {
        self.open_tx_n
    }

    pub fn tx_stats(&self) -> &TxStats {
        &self.tx_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;

    #[test]
    fn test_open_and_close() -> Result<()> {
        let db = TestDb::new()?;
        assert!(db.path().exists());
        db.close()?;

        // a closed database rejects new transactions
        assert_eq!(db.begin(false).err(), Some(Error::DatabaseNotOpen));
        Ok(())
    }

    #[test]
    fn test_view_error_propagates() -> Result<()> {
        let db = TestDb::new()?;
        let result = db.view(|_tx| Err(Error::Invalid));
        assert_eq!(result, Err(Error::Invalid));
        Ok(())
    }

    #[test]
    fn test_begin_writable_on_read_only() -> Result<()> {
        let db = TestDb::new()?;
        db.update(|tx| {
            tx.create_bucket(b"b")?;
            Ok(())
        })?;
        let path = db.path();
        db.close()?;

        let ro = DB::open_with(
            &path,
            Options {
                read_only: true,
                ..Default::default()
            },
        )?;
        assert_eq!(ro.begin(true).err(), Some(Error::DatabaseReadOnly));
        ro.view(|tx| {
            assert!(tx.bucket(b"b").is_some());
            Ok(())
        })?;
        ro.close()?;
        Ok(())
    }

    #[test]
    fn test_stale_meta_corruption_falls_back() -> Result<()> {
        let db = TestDb::new()?;
        db.update(|tx| {
            let b = tx.create_bucket(b"widgets")?;
            b.put(b"foo", b"bar")
        })?;
        let path = db.path();
        let page_size = db.db().page_size();
        db.close()?;

        // Flip one byte inside the stale meta's payload. The other meta has
        // the higher txid and still validates, so open must succeed.
        let stale_page = {
            let data = std::fs::read(&path).unwrap();
            if meta_txid(&data, 0, page_size) < meta_txid(&data, 1, page_size) {
                0
            } else {
                1
            }
        };
        corrupt_byte(
            &path,
            stale_page * page_size + crate::common::PAGE_HEADER_SIZE + 20,
        );

        let reopened = DB::open(&path)?;
        reopened.view(|tx| {
            let b = tx.bucket(b"widgets").expect("bucket lost");
            assert_eq!(b.get(b"foo"), Some(b"bar".to_vec()));
            Ok(())
        })?;
        reopened.close()?;
        Ok(())
    }

    #[test]
    fn test_both_metas_corrupt_fails_open() -> Result<()> {
        let db = TestDb::new()?;
        db.update(|tx| {
            tx.create_bucket(b"b")?;
            Ok(())
        })?;
        let path = db.path();
        let page_size = db.db().page_size();
        db.close()?;

        corrupt_byte(&path, crate::common::PAGE_HEADER_SIZE + 20);
        corrupt_byte(&path, page_size + crate::common::PAGE_HEADER_SIZE + 20);

        let result = DB::open(&path);
        assert!(result.is_err());
        Ok(())
    }

    fn corrupt_byte(path: &Path, offset: usize) {
        let mut data = std::fs::read(path).unwrap();
        data[offset] ^= 0xFF;
        std::fs::write(path, data).unwrap();
    }

    // txid sits 48 bytes into the meta payload.
    fn meta_txid(data: &[u8], page: usize, page_size: usize) -> u64 {
        let off = page * page_size + crate::common::PAGE_HEADER_SIZE + 48;
        u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn test_mmap_size_schedule() -> Result<()> {
        let db = TestDb::new()?;
        let raw = db.db();

        // below 1GB the schedule doubles
        let small = raw.mmap_size(1)?;
        assert_eq!(small, 1 << 15);
        assert_eq!(raw.mmap_size((1 << 15) + 1)?, 1 << 16);
        assert_eq!(raw.mmap_size(1 << 30)?, 1 << 30);

        // above 1GB it advances in 1GB steps
        let big = raw.mmap_size((1 << 30) + 1)?;
        assert_eq!(big, 2 << 30);
        Ok(())
    }
}
