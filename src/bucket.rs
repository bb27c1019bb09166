use crate::common::bucket::{BUCKET_HEADER_SIZE, InBucket};
use crate::common::inode::Key;
use crate::common::page::{
    BRANCH_PAGE_ELEMENT_SIZE, BUCKET_LEAF_FLAG, LEAF_PAGE_ELEMENT_SIZE, OwnedPage,
    PAGE_HEADER_SIZE, Page, PageFlags, PgId,
};
use crate::cursor::{Cursor, PageNode};
use crate::errors::{Error, Result};
use crate::node::{Node, WeakNode};
use crate::tx::{Tx, WeakTx};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::AddAssign;

// MAX_KEY_SIZE is the maximum length of a key, in bytes.
pub(crate) const MAX_KEY_SIZE: usize = 32768;

// MAX_VALUE_SIZE is the maximum length of a value, in bytes.
pub(crate) const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;

/// DEFAULT_FILL_PERCENT is the percentage that split pages are filled.
/// This value can be changed by calling set_fill_percent.
pub(crate) const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Bucket represents a collection of key/value pairs inside the database.
/// Buckets nest: a bucket small enough is stored inline inside its parent
/// leaf element.
pub struct Bucket {
    pub(crate) in_bucket: Cell<InBucket>,
    // the associated transaction
    pub(crate) tx: WeakTx,
    // subbucket cache; boxed so node back-pointers survive rehashes
    buckets: RefCell<HashMap<Key, Box<Bucket>>>,
    // inline page image copied out of the parent leaf value
    page: RefCell<Option<OwnedPage>>,
    // materialized node for the root page
    root_node: RefCell<Option<Node>>,
    // node cache, keyed by pgid (0 for the inline root)
    nodes: RefCell<HashMap<PgId, Node>>,
    // Sets the threshold for filling nodes when they split. By default,
    // the bucket will fill to 50% but it can be useful to increase this
    // amount if you know that your write workloads are mostly append-only.
    //
    // This is non-persisted across transactions so it must be set in every
    // Tx.
    fill_percent: Cell<f64>,
}

impl Bucket {
    pub(crate) fn new(tx: WeakTx) -> Bucket {
        Bucket {
            in_bucket: Cell::new(InBucket::default()),
            tx,
            buckets: RefCell::new(HashMap::new()),
            page: RefCell::new(None),
            root_node: RefCell::new(None),
            nodes: RefCell::new(HashMap::new()),
            fill_percent: Cell::new(DEFAULT_FILL_PERCENT),
        }
    }

    // Tx returns the tx of the bucket.
    pub(crate) fn tx(&self) -> Result<Tx> {
        self.tx.upgrade().ok_or(Error::TxClosed)
    }

    // Root returns the root pgid of the bucket.
    pub fn root_page(&self) -> PgId {
        self.in_bucket.get().root_page()
    }

    /// Returns whether the bucket is writable.
    pub fn writable(&self) -> bool {
        self.tx().map(|tx| tx.writable()).unwrap_or(false)
    }

    pub fn fill_percent(&self) -> f64 {
        self.fill_percent.get()
    }

    pub fn set_fill_percent(&self, fill_percent: f64) {
        self.fill_percent.set(fill_percent);
    }

    /// Creates a cursor associated with the bucket. The cursor is only
    /// valid as long as the transaction is open.
    pub fn cursor(&self) -> Cursor<'_> {
        if let Ok(tx) = self.tx() {
            tx.stats().inc_cursor_count();
        }
        Cursor::new(self)
    }

    /// Retrieves the value for a key in the bucket, copied out of the
    /// mapped region. Returns None if the key does not exist or if the key
    /// is a nested bucket.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut c = self.cursor();
        let (k, v, flags) = c.seek_to(key)?;

        // Return None if this is a bucket.
        if flags & BUCKET_LEAF_FLAG != 0 {
            return None;
        }

        // If our target node isn't the same key as what's passed in then
        // return None.
        if k != key {
            return None;
        }
        Some(v)
    }

    /// Sets the value for a key in the bucket. If the key exists then its
    /// previous value will be overwritten. Returns an error if the bucket
    /// was created from a read-only transaction, if the key is blank, if
    /// the key is too large, or if the value is too large.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        if key.is_empty() {
            return Err(Error::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        drop(tx);

        // Move cursor to correct position.
        let mut c = self.cursor();
        let item = c.seek_to(key);

        // Return an error if there is an existing key with a bucket value.
        if let Some((k, _, flags)) = item {
            if k == key && flags & BUCKET_LEAF_FLAG != 0 {
                return Err(Error::IncompatibleValue);
            }
        }

        // Insert into node.
        c.node().put(key, key, value, 0, 0);
        Ok(())
    }

    /// Removes a key from the bucket. If the key does not exist then
    /// nothing is done. Returns an error if the key is a nested bucket or
    /// the transaction is read-only.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        drop(tx);

        let mut c = self.cursor();
        match c.seek_to(key) {
            Some((k, _, flags)) if k == key => {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::IncompatibleValue);
                }
                c.node().del(key);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Retrieves a nested bucket by name. Returns None if the bucket does
    /// not exist or the key holds a plain value.
    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        if let Some(child) = self.buckets.borrow().get(name) {
            let ptr = &**child as *const Bucket;
            // cache entries are boxed, the pointee survives map rehashes
            return Some(unsafe { &*ptr });
        }

        // Move cursor to key.
        let mut c = self.cursor();
        let (k, v, flags) = c.seek_to(name)?;

        // Return None if the key doesn't exist or it is not a bucket.
        if k != name || flags & BUCKET_LEAF_FLAG == 0 {
            return None;
        }

        // Otherwise create a bucket and cache it.
        let child = self.open_bucket(&v);
        let ptr = &*child as *const Bucket;
        self.buckets.borrow_mut().insert(name.to_vec(), child);

        Some(unsafe { &*ptr })
    }

    // Helper method that re-interprets a sub-bucket value from a parent
    // into a Bucket.
    fn open_bucket(&self, value: &[u8]) -> Box<Bucket> {
        let child = Bucket::new(self.tx.clone());
        child.in_bucket.set(InBucket::from_value(value));

        // An inline bucket embeds its root page right after the header.
        // Copy the image out so it stays aligned and owned by the bucket.
        if child.in_bucket.get().root_page() == 0 {
            let image = value[BUCKET_HEADER_SIZE..].to_vec();
            *child.page.borrow_mut() = Some(OwnedPage::from_vec(image));
        }

        Box::new(child)
    }

    /// Creates a new bucket at the given key and returns it. Returns an
    /// error if the key already exists, if the bucket name is blank, or if
    /// the bucket name is too long.
    pub fn create_bucket(&self, key: &[u8]) -> Result<&Bucket> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        if key.is_empty() {
            return Err(Error::BucketNameRequired);
        }
        drop(tx);

        // Move cursor to correct position.
        let mut c = self.cursor();
        let item = c.seek_to(key);

        // Return an error if there is an existing key.
        if let Some((k, _, flags)) = item {
            if k == key {
                if flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::BucketExists);
                }
                return Err(Error::IncompatibleValue);
            }
        }

        // Create an empty inline bucket and write it as the value.
        let value = Bucket::empty_inline_value();
        c.node().put(key, key, &value, 0, BUCKET_LEAF_FLAG);

        // Since subbuckets are not allowed on inline buckets, we need to
        // dereference the inline page, if it exists. This will cause the
        // bucket to be treated as a regular, non-inline bucket for the rest
        // of the tx.
        *self.page.borrow_mut() = None;

        self.bucket(key).ok_or(Error::BucketNotFound)
    }

    /// Creates a new bucket if it doesn't already exist and returns it.
    pub fn create_bucket_if_not_exists(&self, key: &[u8]) -> Result<&Bucket> {
        match self.create_bucket(key) {
            Ok(child) => Ok(child),
            Err(Error::BucketExists) => self.bucket(key).ok_or(Error::BucketNotFound),
            Err(e) => Err(e),
        }
    }

    /// Deletes a bucket at the given key, reclaiming every page of its
    /// tree and of all nested buckets.
    pub fn delete_bucket(&self, key: &[u8]) -> Result<()> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        drop(tx);

        // Move cursor to correct position.
        let mut c = self.cursor();
        match c.seek_to(key) {
            Some((k, _, flags)) if k == key => {
                if flags & BUCKET_LEAF_FLAG == 0 {
                    return Err(Error::IncompatibleValue);
                }
            }
            _ => return Err(Error::BucketNotFound),
        }

        {
            let child = self.bucket(key).ok_or(Error::BucketNotFound)?;

            // Recursively delete all child buckets. The names are collected
            // up front so the recursion doesn't mutate the tree under a live
            // cursor.
            let mut names: Vec<Key> = Vec::new();
            child.for_each_bucket(|k| {
                names.push(k.to_vec());
                Ok(())
            })?;
            for name in names {
                child.delete_bucket(&name)?;
            }

            // Release all bucket pages to the freelist.
            child.nodes.borrow_mut().clear();
            *child.root_node.borrow_mut() = None;
            child.free();
        }

        // Remove cached copy.
        self.buckets.borrow_mut().remove(key);

        // Delete the node if we have a matching key.
        c.node().del(key);

        Ok(())
    }

    /// Executes a function for each nested bucket key in this bucket,
    /// skipping plain keys. An error returned from the function stops the
    /// iteration and is returned to the caller.
    pub fn for_each_bucket<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let _tx = self.tx()?;
        let mut c = self.cursor();
        let mut item = c.first_with_flags();
        while let Some((k, _, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                f(&k)?;
            }
            item = c.next_with_flags();
        }
        Ok(())
    }

    /// Executes a function for each key/value pair in the bucket. Nested
    /// buckets are reported with a None value. An error returned from the
    /// function stops the iteration and is returned to the caller.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        let _tx = self.tx()?;
        let mut c = self.cursor();
        let mut item = c.first_with_flags();
        while let Some((k, v, flags)) = item {
            if flags & BUCKET_LEAF_FLAG != 0 {
                f(&k, None)?;
            } else {
                f(&k, Some(&v))?;
            }
            item = c.next_with_flags();
        }
        Ok(())
    }

    /// Returns the current integer for the bucket without incrementing it.
    pub fn sequence(&self) -> u64 {
        self.in_bucket.get().in_sequence()
    }

    /// Updates the sequence number for the bucket.
    pub fn set_sequence(&self, v: u64) -> Result<()> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        drop(tx);

        self.materialize_root();

        let mut in_bucket = self.in_bucket.get();
        in_bucket.set_in_sequence(v);
        self.in_bucket.set(in_bucket);
        Ok(())
    }

    /// Returns an autoincrementing integer for the bucket.
    pub fn next_sequence(&self) -> Result<u64> {
        let tx = self.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        drop(tx);

        self.materialize_root();

        let mut in_bucket = self.in_bucket.get();
        in_bucket.inc_sequence();
        self.in_bucket.set(in_bucket);
        Ok(in_bucket.in_sequence())
    }

    // Materialize the root node so the bucket header is rewritten at
    // commit even without key mutations.
    fn materialize_root(&self) {
        if self.root_node.borrow().is_none() {
            let _ = self.node(self.in_bucket.get().root_page(), WeakNode::new());
        }
    }

    /// Returns stats on a bucket and its nested buckets.
    pub fn stats(&self) -> BucketStats {
        let mut s = BucketStats::default();
        let mut sub_stats = BucketStats::default();
        let page_size = self.tx_page_size();

        s.bucket_n += 1;
        if self.root_page() == 0 {
            s.inline_bucket_n += 1;
        }

        let mut sub_values: Vec<Vec<u8>> = Vec::new();
        let is_inline = self.root_page() == 0;

        self.for_each_page(&mut |p: &Page, depth: usize| {
            if p.is_leaf_page() {
                s.key_n += p.count() as i32;

                // used totals the encoded size of the leaf page.
                let mut used = PAGE_HEADER_SIZE;
                if p.count() != 0 {
                    let last = p.leaf_page_element(p.count() as usize - 1);
                    used += LEAF_PAGE_ELEMENT_SIZE * (p.count() as usize - 1);
                    used += (last.pos() + last.ksize() + last.vsize()) as usize;
                }

                if is_inline {
                    s.inline_bucket_inuse += used as i32;
                } else {
                    s.leaf_page_n += 1;
                    s.leaf_inuse += used as i32;
                    s.leaf_overflow_n += p.overflow() as i32;
                }

                // Collect sub-bucket values for a recursive walk afterwards.
                for i in 0..p.count() as usize {
                    let elem = p.leaf_page_element(i);
                    if elem.is_bucket_entry() {
                        sub_values.push(elem.value().to_vec());
                    }
                }
            } else if p.is_branch_page() {
                s.branch_page_n += 1;
                let last = p.branch_page_element(p.count() as usize - 1);
                let mut used = PAGE_HEADER_SIZE + BRANCH_PAGE_ELEMENT_SIZE * (p.count() as usize - 1);
                used += (last.pos() + last.ksize()) as usize;
                s.branch_inuse += used as i32;
                s.branch_overflow_n += p.overflow() as i32;
            }

            if depth as i32 + 1 > s.depth {
                s.depth = depth as i32 + 1;
            }
        });

        for value in sub_values {
            let child = self.open_bucket(&value);
            sub_stats.add(child.stats());
        }

        // Alloc stats can be computed from page counts and the page size.
        s.branch_alloc = (s.branch_page_n + s.branch_overflow_n) * page_size as i32;
        s.leaf_alloc = (s.leaf_page_n + s.leaf_overflow_n) * page_size as i32;

        // Add the max depth of sub-buckets to get total nested depth.
        s.depth += sub_stats.depth;
        s.add(sub_stats);
        s
    }

    // Iterates over every page in this bucket's own tree, including the
    // inline page when the bucket is inline.
    fn for_each_page<F: FnMut(&Page, usize)>(&self, f: &mut F) {
        // If we have an inline page then just use that.
        let inline_ptr: Option<*const Page> = {
            let page = self.page.borrow();
            page.as_ref().map(|p| {
                let pg: &Page = p;
                pg as *const Page
            })
        };
        if let Some(p) = inline_ptr {
            f(unsafe { &*p }, 0);
            return;
        }

        // Otherwise traverse the page hierarchy.
        let tx = self.tx().expect("bucket walk on closed tx");
        tx.for_each_page(self.root_page(), f);
    }

    ///////////////////////////////////////////////////////////////////////////
    // Write-path plumbing: node cache, spill, rebalance.
    ///////////////////////////////////////////////////////////////////////////

    // node creates a node from a page and associates it with a given parent.
    pub(crate) fn node(&self, pgid: PgId, parent: WeakNode) -> Node {
        // Retrieve node if it's already been created.
        if let Some(n) = self.nodes.borrow().get(&pgid) {
            return n.clone();
        }

        // Otherwise create a node and cache it.
        let n = Node::new(self as *const Bucket, false);
        match parent.upgrade() {
            Some(p) => {
                n.set_parent(parent.clone());
                p.add_child(n.clone());
            }
            None => {
                *self.root_node.borrow_mut() = Some(n.clone());
            }
        }

        // Use the inline page if this is an inline bucket.
        let page_ptr: *const Page = {
            let page = self.page.borrow();
            match page.as_ref() {
                Some(p) => {
                    let pg: &Page = p;
                    pg as *const Page
                }
                None => self.tx().expect("node on closed tx").page(pgid),
            }
        };

        // Read the page into the node and cache it.
        n.read(unsafe { &*page_ptr });
        self.nodes.borrow_mut().insert(pgid, n.clone());

        if let Ok(tx) = self.tx() {
            tx.stats().inc_node_count();
        }

        n
    }

    pub(crate) fn cached_node(&self, pgid: PgId) -> Option<Node> {
        self.nodes.borrow().get(&pgid).cloned()
    }

    pub(crate) fn remove_node(&self, pgid: PgId) {
        self.nodes.borrow_mut().remove(&pgid);
    }

    pub(crate) fn set_root_node(&self, node: Node) {
        *self.root_node.borrow_mut() = Some(node);
    }

    // page_node resolves a page id to either a raw page or a materialized
    // node, without forcing materialization on the read path.
    pub(crate) fn page_node(&self, id: PgId) -> PageNode {
        // Inline buckets have a fake page embedded in their value so treat
        // them differently. We'll return the root node (if available) or
        // the fake page.
        if self.root_page() == 0 {
            assert!(id == 0, "inline bucket non-zero page access(2): {} != 0", id);
            if let Some(root) = self.root_node.borrow().clone() {
                return PageNode::Node(root);
            }
            let page_ptr: *const Page = {
                let page = self.page.borrow();
                let p: &Page = page.as_ref().expect("inline bucket missing page image");
                p as *const Page
            };
            return PageNode::Page(page_ptr);
        }

        // Check the node cache for non-inline buckets.
        if let Some(n) = self.nodes.borrow().get(&id) {
            return PageNode::Node(n.clone());
        }

        // Finally lookup the page from the transaction if no node is
        // materialized.
        PageNode::Page(self.tx().expect("page_node on closed tx").page(id))
    }

    pub(crate) fn tx_pgid(&self) -> PgId {
        self.tx().expect("bucket on closed tx").pgid()
    }

    pub(crate) fn tx_page_size(&self) -> usize {
        self.tx().expect("bucket on closed tx").page_size()
    }

    // Serialized value for a brand new, empty inline bucket: a zeroed
    // header followed by an empty leaf page image.
    fn empty_inline_value() -> Vec<u8> {
        let header = InBucket::new(0, 0);
        let mut page = OwnedPage::new(PAGE_HEADER_SIZE);
        page.set_flags(PageFlags::LEAF_PAGE);

        let mut value = Vec::with_capacity(BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE);
        value.extend_from_slice(header.as_bytes());
        value.extend_from_slice(page.buf());
        value
    }

    // Returns true if a bucket is small enough to be written inline and it
    // contains no nested buckets.
    fn inlineable(&self) -> bool {
        let n = match &*self.root_node.borrow() {
            Some(n) => n.clone(),
            None => return false,
        };

        // Bucket must only contain a single leaf node.
        n.is_leaf() && n.fits_inline(self.max_inline_bucket_size())
    }

    // The maximum total size of a bucket to make it a candidate for
    // inlining.
    fn max_inline_bucket_size(&self) -> usize {
        self.tx_page_size() / 4
    }

    // write_inline allocates and writes the bucket header and its inline
    // root page into a byte value.
    fn write_inline(&self) -> Vec<u8> {
        let n = self
            .root_node
            .borrow()
            .clone()
            .expect("inline bucket without root node");

        let size = n.size();
        let mut page = OwnedPage::new(size);
        page.set_flags(if n.is_leaf() {
            PageFlags::LEAF_PAGE
        } else {
            PageFlags::BRANCH_PAGE
        });
        n.write(&mut page);

        let mut value = Vec::with_capacity(BUCKET_HEADER_SIZE + size);
        value.extend_from_slice(self.in_bucket.get().as_bytes());
        value.extend_from_slice(page.buf());
        value
    }

    // free recursively frees all pages in the bucket's tree. The walk goes
    // through materialized nodes where they exist: a node whose page was
    // already released by a rebalance merge has pgid 0 and must not be
    // freed again.
    pub(crate) fn free(&self) {
        if self.root_page() == 0 {
            return;
        }

        let tx = self.tx().expect("bucket free on closed tx");
        self.for_each_page_node_rec(self.root_page(), &mut |pn: &PageNode| match pn {
            PageNode::Page(p) => tx.free_page(unsafe { (**p).id() }),
            PageNode::Node(n) => n.free(),
        });

        let mut in_bucket = self.in_bucket.get();
        in_bucket.set_root_page(0);
        self.in_bucket.set(in_bucket);
    }

    // Walks the tree under pgid, resolving each id to a cached node when
    // one exists and to the raw page otherwise.
    fn for_each_page_node_rec<F: FnMut(&PageNode)>(&self, pgid: PgId, f: &mut F) {
        let pn = self.page_node(pgid);
        f(&pn);

        match &pn {
            PageNode::Page(p) => {
                let p = unsafe { &**p };
                if p.is_branch_page() {
                    for i in 0..p.count() as usize {
                        self.for_each_page_node_rec(p.branch_page_element(i).pgid(), f);
                    }
                }
            }
            PageNode::Node(n) => {
                if !n.is_leaf() {
                    for i in 0..n.num_inodes() {
                        self.for_each_page_node_rec(n.pgid_at(i), f);
                    }
                }
            }
        }
    }

    // spill writes all the nodes of this bucket and of every cached child
    // bucket to dirty pages, rewriting the bucket headers in the parent
    // values on the way.
    pub(crate) fn spill(&self) -> Result<()> {
        // Spill all child buckets first.
        let names: Vec<Key> = self.buckets.borrow().keys().cloned().collect();
        for name in names {
            let child_ptr: *const Bucket = {
                let buckets = self.buckets.borrow();
                &**buckets.get(&name).expect("bucket cache entry vanished") as *const Bucket
            };
            let child = unsafe { &*child_ptr };

            // If the child bucket is small enough and it has no child
            // buckets then write it inline into the parent bucket's page.
            // Otherwise spill it like a normal bucket and make the parent
            // value a pointer to the page.
            let value: Vec<u8> = if child.inlineable() {
                child.free();
                child.write_inline()
            } else {
                child.spill()?;

                // Update the child bucket header in this bucket.
                child.in_bucket.get().as_bytes().to_vec()
            };

            // Skip writing the bucket if there are no materialized nodes.
            if child.root_node.borrow().is_none() {
                continue;
            }

            // Update parent node.
            let mut c = self.cursor();
            match c.seek_to(&name) {
                Some((k, _, flags)) if k == name => {
                    assert!(
                        flags & BUCKET_LEAF_FLAG != 0,
                        "unexpected bucket header flag: {:x}",
                        flags
                    );
                }
                _ => panic!("misplaced bucket header: {:?}", name),
            }
            c.node().put(&name, &name, &value, 0, BUCKET_LEAF_FLAG);
        }

        // Ignore if there's not a materialized root node.
        if self.root_node.borrow().is_none() {
            return Ok(());
        }

        // Spill nodes.
        let root = self
            .root_node
            .borrow()
            .clone()
            .expect("root node vanished");
        root.spill()?;
        let new_root = root.root();
        *self.root_node.borrow_mut() = Some(new_root.clone());

        // Update the root node for this bucket.
        let pgid = new_root.pgid();
        let hwm = self.tx_pgid();
        assert!(
            pgid < hwm,
            "pgid ({}) above high water mark ({})",
            pgid,
            hwm
        );
        let mut in_bucket = self.in_bucket.get();
        in_bucket.set_root_page(pgid);
        self.in_bucket.set(in_bucket);

        Ok(())
    }

    // rebalance attempts to balance all nodes that recorded deletions.
    pub(crate) fn rebalance(&self) {
        let nodes: Vec<Node> = self.nodes.borrow().values().cloned().collect();
        for node in nodes {
            node.rebalance();
        }

        let names: Vec<Key> = self.buckets.borrow().keys().cloned().collect();
        for name in names {
            let child_ptr: *const Bucket = {
                let buckets = self.buckets.borrow();
                &**buckets.get(&name).expect("bucket cache entry vanished") as *const Bucket
            };
            unsafe { &*child_ptr }.rebalance();
        }
    }

    // dereference copies every cached node's byte references into owned
    // memory. Called before the mmap is remapped.
    pub(crate) fn dereference(&self) {
        if let Some(root) = self.root_node.borrow().clone() {
            root.root().dereference();
        }

        let names: Vec<Key> = self.buckets.borrow().keys().cloned().collect();
        for name in names {
            let child_ptr: *const Bucket = {
                let buckets = self.buckets.borrow();
                &**buckets.get(&name).expect("bucket cache entry vanished") as *const Bucket
            };
            unsafe { &*child_ptr }.dereference();
        }
    }
}

/// BucketStats records statistics about resources used by a bucket.
#[derive(Debug, Default, Clone, Copy)]
pub struct BucketStats {
    // Page count statistics.
    pub branch_page_n: i32, // number of logical branch pages
    pub branch_overflow_n: i32, // number of physical branch overflow pages
    pub leaf_page_n: i32,   // number of logical leaf pages
    pub leaf_overflow_n: i32, // number of physical leaf overflow pages

    // Tree statistics.
    pub key_n: i32, // number of keys/value pairs
    pub depth: i32, // number of levels in B+tree

    // Page size utilization.
    pub branch_alloc: i32, // bytes allocated for physical branch pages
    pub branch_inuse: i32, // bytes actually used for branch data
    pub leaf_alloc: i32,   // bytes allocated for physical leaf pages
    pub leaf_inuse: i32,   // bytes actually used for leaf data

    // Bucket statistics
    pub bucket_n: i32,            // total number of buckets including the top bucket
    pub inline_bucket_n: i32,     // total number on inlined buckets
    pub inline_bucket_inuse: i32, // bytes used for inlined buckets
}

impl BucketStats {
    /// add adds the statistics from another BucketStats to this one.
    pub fn add(&mut self, other: BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        if self.depth < other.depth {
            self.depth = other.depth;
        }
        self.branch_alloc += other.branch_alloc;
        self.branch_inuse += other.branch_inuse;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_inuse += other.leaf_inuse;

        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_inuse += other.inline_bucket_inuse;
    }
}

impl AddAssign for BucketStats {
    fn add_assign(&mut self, other: Self) {
        self.add(other);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_bucket_defaults() {
        let in_bucket = InBucket::new(1, 1);
        assert_eq!(in_bucket.root_page(), 1);
        assert_eq!(in_bucket.in_sequence(), 1);
    }

    #[test]
    fn test_limits() {
        assert_eq!(MAX_KEY_SIZE, 32768);
        assert!(MAX_VALUE_SIZE > MAX_KEY_SIZE);
    }

    #[test]
    fn test_empty_inline_value_layout() {
        let value = Bucket::empty_inline_value();
        assert_eq!(value.len(), BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE);

        let header = InBucket::from_value(&value);
        assert_eq!(header.root_page(), 0);
        assert_eq!(header.in_sequence(), 0);

        let page = OwnedPage::from_vec(value[BUCKET_HEADER_SIZE..].to_vec());
        assert!(page.is_leaf_page());
        assert_eq!(page.count(), 0);
    }

    #[test]
    fn test_bucket_stats_add() {
        let mut stats = BucketStats {
            bucket_n: 5,
            key_n: 2,
            depth: 1,
            ..Default::default()
        };

        let other = BucketStats {
            key_n: 4,
            bucket_n: 3,
            depth: 2,
            ..Default::default()
        };

        stats.add(other);
        assert_eq!(stats.bucket_n, 8);
        assert_eq!(stats.key_n, 6);
        assert_eq!(stats.depth, 2);

        stats += other;
        assert_eq!(stats.bucket_n, 11);
        assert_eq!(stats.key_n, 10);
    }
}
