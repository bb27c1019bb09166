use crate::bucket::{Bucket, MAX_FILL_PERCENT, MIN_FILL_PERCENT};
use crate::common::inode::{self, Inode, Inodes, Key};
use crate::common::page::{
    BRANCH_PAGE_ELEMENT_SIZE, BUCKET_LEAF_FLAG, LEAF_PAGE_ELEMENT_SIZE, MIN_KEYS_PER_PAGE,
    PAGE_HEADER_SIZE, Page, PageFlags, PgId,
};
use crate::errors::Result;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// RawNode is an in-memory, deserialized page. It only exists inside a
/// write transaction; readers traverse raw pages instead.
#[derive(Debug)]
pub(crate) struct RawNode {
    // the bucket owning this node; the bucket cache is what keeps nodes
    // alive, so the back pointer stays raw
    bucket: *const Bucket,
    is_leaf: Cell<bool>,
    unbalanced: Cell<bool>,
    spilled: Cell<bool>,
    // first key snapshot, used to locate this node in the parent on spill
    key: RefCell<Key>,
    pgid: Cell<PgId>,
    parent: RefCell<WeakNode>,
    children: RefCell<Vec<Node>>,
    inodes: RefCell<Inodes>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct WeakNode(Weak<RawNode>);

impl WeakNode {
    pub(crate) fn new() -> Self {
        WeakNode::default()
    }

    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }

    pub(crate) fn from(node: &Node) -> Self {
        WeakNode(Rc::downgrade(&node.0))
    }
}

/// Node handle. Parents are held weakly, children strongly, so the node
/// graph never forms an Rc cycle.
#[derive(Clone, Debug)]
pub(crate) struct Node(pub(crate) Rc<RawNode>);

impl Node {
    pub(crate) fn new(bucket: *const Bucket, is_leaf: bool) -> Node {
        Node(Rc::new(RawNode {
            bucket,
            is_leaf: Cell::new(is_leaf),
            unbalanced: Cell::new(false),
            spilled: Cell::new(false),
            key: RefCell::new(Key::new()),
            pgid: Cell::new(0),
            parent: RefCell::new(WeakNode::new()),
            children: RefCell::new(Vec::new()),
            inodes: RefCell::new(Inodes::default()),
        }))
    }

    pub(super) fn bucket<'a>(&self) -> &'a Bucket {
        assert!(!self.0.bucket.is_null(), "node without a bucket");
        unsafe { &*self.0.bucket }
    }

    // Returns the top-level node this node is attached to.
    pub(crate) fn root(&self) -> Node {
        match self.parent() {
            Some(ref p) => p.root(),
            None => self.clone(),
        }
    }

    pub(crate) fn parent(&self) -> Option<Node> {
        self.0.parent.borrow().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: WeakNode) {
        *self.0.parent.borrow_mut() = parent;
    }

    // Returns the minimum number of inodes this node should have.
    pub(crate) fn min_keys(&self) -> usize {
        if self.is_leaf() { 1 } else { 2 }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.0.is_leaf.get()
    }

    pub(crate) fn pgid(&self) -> PgId {
        self.0.pgid.get()
    }

    pub(crate) fn num_inodes(&self) -> usize {
        self.0.inodes.borrow().len()
    }

    pub(crate) fn add_child(&self, child: Node) {
        self.0.children.borrow_mut().push(child);
    }

    pub(crate) fn pgid_at(&self, index: usize) -> PgId {
        self.0.inodes.borrow().get(index).pgid()
    }

    /// Returns true when every inode is a plain value and the serialized
    /// size stays under `max_size`. Used to decide whether a bucket can be
    /// embedded in its parent leaf.
    pub(crate) fn fits_inline(&self, max_size: usize) -> bool {
        let mut size = PAGE_HEADER_SIZE;
        let inodes = self.0.inodes.borrow();
        for inode in inodes.iter() {
            size += LEAF_PAGE_ELEMENT_SIZE + inode.key().len() + inode.value().len();
            if inode.flags() & BUCKET_LEAF_FLAG != 0 {
                return false;
            }
            if size > max_size {
                return false;
            }
        }
        true
    }

    pub(crate) fn first_key(&self) -> Key {
        self.0
            .inodes
            .borrow()
            .first()
            .map(|inode| inode.key().clone())
            .unwrap_or_default()
    }

    /// Key/value/flags triple at a leaf index, copied out.
    pub(crate) fn inode_at(&self, index: usize) -> (Key, Key, u32, PgId) {
        let inodes = self.0.inodes.borrow();
        let inode = inodes.get(index);
        (
            inode.key().clone(),
            inode.value().clone(),
            inode.flags(),
            inode.pgid(),
        )
    }

    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.0.inodes.borrow().binary_search_by(key)
    }

    // size returns the size of the node after serialization.
    pub(crate) fn size(&self) -> usize {
        let mut sz = PAGE_HEADER_SIZE;
        let elsz = self.page_element_size();

        let inodes = self.0.inodes.borrow();
        for inode in inodes.iter() {
            sz += elsz + inode.key().len() + inode.value().len();
        }
        sz
    }

    // size_less_than returns true if the node is less than a given size.
    // This is an optimization to avoid calculating a large node when we only
    // need to know if it fits inside a certain page size.
    pub(crate) fn size_less_than(&self, size: usize) -> bool {
        let (mut sz, elsz) = (PAGE_HEADER_SIZE, self.page_element_size());

        let inodes = self.0.inodes.borrow();
        for inode in inodes.iter() {
            sz += elsz + inode.key().len() + inode.value().len();
            if sz >= size {
                return false;
            }
        }
        true
    }

    // Returns the size of each page element based on type of node.
    fn page_element_size(&self) -> usize {
        if self.is_leaf() {
            LEAF_PAGE_ELEMENT_SIZE
        } else {
            BRANCH_PAGE_ELEMENT_SIZE
        }
    }

    // child_at returns the child node at a given index.
    pub(crate) fn child_at(&self, index: usize) -> Node {
        assert!(
            !self.is_leaf(),
            "invalid child_at({}) on a leaf node",
            index
        );

        let child_pgid = self.0.inodes.borrow().get(index).pgid();
        self.bucket().node(child_pgid, WeakNode::from(self))
    }

    // child_index returns the index of a given child node.
    pub(crate) fn child_index(&self, child: &Node) -> usize {
        let key = child.0.key.borrow();
        match self.0.inodes.borrow().binary_search_by(key.as_slice()) {
            Ok(index) | Err(index) => index,
        }
    }

    // num_children returns the number of children.
    pub(crate) fn num_children(&self) -> usize {
        self.0.inodes.borrow().len()
    }

    // next_sibling returns the next node with the same parent.
    pub(crate) fn next_sibling(&self) -> Option<Node> {
        let parent = self.parent()?;
        let index = parent.child_index(self);
        if index >= parent.num_children() - 1 {
            return None;
        }
        Some(parent.child_at(index + 1))
    }

    // prev_sibling returns the previous node with the same parent.
    pub(crate) fn prev_sibling(&self) -> Option<Node> {
        let parent = self.parent()?;
        let index = parent.child_index(self);
        if index == 0 {
            return None;
        }
        Some(parent.child_at(index - 1))
    }

    /// put inserts a key/value.
    ///
    /// `old_key` differs from `new_key` when a branch inode is rekeyed
    /// after a child's minimum key changed.
    pub(crate) fn put(&self, old_key: &[u8], new_key: &[u8], value: &[u8], pgid: PgId, flags: u32) {
        let hwm = self.bucket().tx_pgid();
        assert!(
            pgid < hwm,
            "pgid ({}) above high water mark ({})",
            pgid,
            hwm
        );
        assert!(!old_key.is_empty(), "put: zero-length old key");
        assert!(!new_key.is_empty(), "put: zero-length new key");

        let mut inodes = self.0.inodes.borrow_mut();

        // Find insertion index, shift nodes if we don't have an exact match.
        let index = match inodes.binary_search_by(old_key) {
            Ok(index) => index,
            Err(index) => {
                inodes.insert(index, Inode::default());
                index
            }
        };

        let inode = inodes.get_mut(index);
        inode.set_flags(flags);
        inode.set_key(new_key.to_vec());
        inode.set_value(value.to_vec());
        inode.set_pgid(pgid);

        assert!(!inode.key().is_empty(), "put: zero-length inode key");
    }

    /// del removes a key from the node.
    pub(crate) fn del(&self, key: &[u8]) {
        let index = {
            let inodes = self.0.inodes.borrow();
            match inodes.binary_search_by(key) {
                Ok(index) => index,
                // Exit if the key isn't found.
                Err(_) => return,
            }
        };

        // Delete inode from the node.
        self.0.inodes.borrow_mut().remove(index);

        // Mark the node as needing rebalancing.
        self.0.unbalanced.set(true);
    }

    /// read initializes the node from a page.
    pub(crate) fn read(&self, page: &Page) {
        self.0.pgid.set(page.id());
        self.0.is_leaf.set(page.is_leaf_page());

        let inodes = inode::read_inodes_from_page(page);

        // Save the first key, if any, for parent lookup on spill.
        let key = inodes.first().map(|inode| inode.key().clone());
        *self.0.inodes.borrow_mut() = inodes;

        match key {
            Some(key) => {
                assert!(!key.is_empty(), "read: zero-length node key");
                *self.0.key.borrow_mut() = key;
            }
            None => self.0.key.borrow_mut().clear(),
        }
    }

    /// write writes the items onto one or more pages.
    pub(crate) fn write(&self, page: &mut Page) {
        if self.is_leaf() {
            page.set_flags(page.flags() | PageFlags::LEAF_PAGE);
        } else {
            page.set_flags(page.flags() | PageFlags::BRANCH_PAGE);
        }

        let inodes = self.0.inodes.borrow();
        inode::write_inodes_to_page(&inodes, page);
    }

    /// split breaks up a node into multiple smaller nodes, if appropriate.
    /// This should only be called from the spill() function.
    fn split(&self, page_size: usize) -> Vec<Node> {
        let mut nodes = Vec::new();

        let mut node = self.clone();
        loop {
            // Split node into two. The first returned node stays `node`, the
            // remainder gets split again on the next iteration.
            let next = node.split_two(page_size);
            nodes.push(node.clone());

            match next {
                Some(next) => node = next,
                None => break,
            }
        }

        nodes
    }

    /// split_two breaks up a node into two smaller nodes, if appropriate.
    /// This should only be called from the split() function.
    fn split_two(&self, page_size: usize) -> Option<Node> {
        // Ignore the split if the page doesn't have at least enough nodes for
        // two pages or if the inodes can fit in a single page.
        if self.0.inodes.borrow().len() <= MIN_KEYS_PER_PAGE * 2 || self.size_less_than(page_size)
        {
            return None;
        }

        let bucket = self.bucket();

        // Determine the threshold before starting a new node.
        let fill_percent = bucket
            .fill_percent()
            .clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        let threshold = (page_size as f64 * fill_percent) as usize;

        // Determine split position.
        let (split_index, _) = self.split_index(threshold);

        // Split node into two separate nodes.
        // If there's no parent then we'll need to create one.
        let parent = match self.parent() {
            Some(parent) => parent,
            None => {
                let parent = Node::new(self.0.bucket, false);
                parent.0.children.borrow_mut().push(self.clone());
                self.set_parent(WeakNode::from(&parent));
                // A synthesized root must be owned by the bucket or it would
                // be dropped as soon as this scope ends.
                bucket.set_root_node(parent.clone());
                parent
            }
        };

        // Create a new node and add it to the parent.
        let next = Node::new(self.0.bucket, self.is_leaf());
        next.set_parent(WeakNode::from(&parent));
        parent.0.children.borrow_mut().push(next.clone());

        // Split inodes across two nodes.
        let tail = self.0.inodes.borrow_mut().split_off(split_index);
        *next.0.inodes.borrow_mut() = tail;

        if let Ok(tx) = bucket.tx() {
            tx.stats().inc_split();
        }

        Some(next)
    }

    /// split_index finds the position where a page will fill a given
    /// threshold. It returns the index as well as the size of the first page.
    /// This is only called from split_two().
    fn split_index(&self, threshold: usize) -> (usize, usize) {
        let mut sz = PAGE_HEADER_SIZE;
        let mut index = 0;

        let inodes = self.0.inodes.borrow();

        // Loop until we only have the minimum number of keys required for
        // the second page.
        for i in 0..inodes.len() - MIN_KEYS_PER_PAGE {
            index = i;
            let inode = inodes.get(i);
            let elsize = self.page_element_size() + inode.key().len() + inode.value().len();

            // If we have at least the minimum number of keys and adding
            // another node would put us over the threshold then exit and
            // return.
            if i >= MIN_KEYS_PER_PAGE && sz + elsize > threshold {
                break;
            }

            sz += elsize;
        }

        (index, sz)
    }

    /// spill writes the node to dirty pages and splits the node as it goes.
    /// Returns an error if dirty pages cannot be allocated.
    pub(crate) fn spill(&self) -> Result<()> {
        if self.0.spilled.get() {
            return Ok(());
        }

        let bucket = self.bucket();
        let tx = bucket.tx()?;

        // Spill child nodes first. Child nodes can materialize sibling nodes
        // in the case of split-merge so we cannot use a snapshot of the list;
        // the length has to be rechecked every iteration.
        self.0
            .children
            .borrow_mut()
            .sort_by(|a, b| a.first_key().cmp(&b.first_key()));
        let mut i = 0;
        loop {
            let child = {
                let children = self.0.children.borrow();
                if i >= children.len() {
                    break;
                }
                children[i].clone()
            };
            child.spill()?;
            i += 1;
        }

        // We no longer need the child list because it's only used for spill
        // tracking.
        self.0.children.borrow_mut().clear();

        // Split nodes into appropriate sizes. The first node will always be
        // self.
        let page_size = tx.page_size();
        let nodes = self.split(page_size);

        for node in &nodes {
            // Add node's page to the freelist if it's not new.
            if node.pgid() > 0 {
                node.free();
            }

            // Allocate contiguous space for the node.
            let count = node.size().div_ceil(page_size);
            let pgid = tx.allocate(count)?;

            assert!(
                pgid < tx.pgid(),
                "pgid ({}) above high water mark ({})",
                pgid,
                tx.pgid()
            );
            node.0.pgid.set(pgid);
            tx.write_node(node);
            node.0.spilled.set(true);

            // Insert into parent inodes.
            if let Some(parent) = node.parent() {
                let mut key = node.0.key.borrow().clone();
                if key.is_empty() {
                    key = node.first_key();
                }
                let first = node.first_key();

                parent.put(&key, &first, &[], node.pgid(), 0);
                *node.0.key.borrow_mut() = first;
                assert!(
                    !node.0.key.borrow().is_empty(),
                    "spill: zero-length node key"
                );
            }

            tx.stats().inc_spill();
        }

        // If the root node split and created a new root then we need to spill
        // that as well. We'll clear out the children to make sure it doesn't
        // try to respill.
        if let Some(parent) = self.parent() {
            if parent.pgid() == 0 {
                self.0.children.borrow_mut().clear();
                return parent.spill();
            }
        }

        Ok(())
    }

    /// rebalance attempts to combine the node with sibling nodes if the node
    /// fill size is below a threshold or if there are not enough keys.
    pub(crate) fn rebalance(&self) {
        if !self.0.unbalanced.get() {
            return;
        }
        self.0.unbalanced.set(false);

        let bucket = self.bucket();
        if let Ok(tx) = bucket.tx() {
            tx.stats().inc_rebalance();
        }

        // Ignore if node is above threshold (25%) and has enough keys.
        let threshold = bucket.tx_page_size() / 4;
        if self.size() > threshold && self.num_inodes() > self.min_keys() {
            return;
        }

        let parent = match self.parent() {
            None => {
                // Root node has special handling: if the root is a branch
                // with a single child then collapse it.
                if !self.is_leaf() && self.num_inodes() == 1 {
                    let child_pgid = self.0.inodes.borrow().get(0).pgid();
                    let child = bucket.node(child_pgid, WeakNode::from(self));

                    // Move the child's content up.
                    self.0.is_leaf.set(child.is_leaf());
                    *self.0.inodes.borrow_mut() =
                        std::mem::take(&mut *child.0.inodes.borrow_mut());
                    *self.0.children.borrow_mut() =
                        std::mem::take(&mut *child.0.children.borrow_mut());

                    // Reparent all child nodes being moved.
                    let moved: Vec<PgId> =
                        self.0.inodes.borrow().iter().map(|i| i.pgid()).collect();
                    for pgid in moved {
                        if let Some(grandchild) = bucket.cached_node(pgid) {
                            grandchild.set_parent(WeakNode::from(self));
                        }
                    }

                    // Remove old child.
                    child.set_parent(WeakNode::new());
                    child.0.unbalanced.set(false);
                    bucket.remove_node(child.pgid());
                    child.free();
                }
                return;
            }
            Some(parent) => parent,
        };

        // If node has no keys then just remove it.
        if self.num_children() == 0 {
            let key = self.0.key.borrow().clone();
            parent.del(&key);
            parent.remove_child(self);
            bucket.remove_node(self.pgid());
            self.free();
            parent.rebalance();
            return;
        }

        assert!(
            parent.num_children() > 1,
            "parent must have at least 2 children"
        );

        // Destination node is right sibling if idx == 0, otherwise left
        // sibling.
        let use_next_sibling = parent.child_index(self) == 0;
        let target = if use_next_sibling {
            self.next_sibling().expect("missing right sibling")
        } else {
            self.prev_sibling().expect("missing left sibling")
        };

        if use_next_sibling {
            // Reparent all child nodes being moved.
            let moved: Vec<PgId> = target.0.inodes.borrow().iter().map(|i| i.pgid()).collect();
            for pgid in moved {
                if let Some(child) = bucket.cached_node(pgid) {
                    if let Some(old_parent) = child.parent() {
                        old_parent.remove_child(&child);
                    }
                    child.set_parent(WeakNode::from(self));
                    self.0.children.borrow_mut().push(child.clone());
                }
            }

            // Copy over inodes from target and remove target.
            {
                let mut target_inodes = std::mem::take(&mut *target.0.inodes.borrow_mut());
                self.0.inodes.borrow_mut().append(&mut target_inodes);
            }
            let target_key = target.0.key.borrow().clone();
            parent.del(&target_key);
            parent.remove_child(&target);
            bucket.remove_node(target.pgid());
            // An absorbed node must never be revisited by the rebalance
            // sweep over the node cache.
            target.0.unbalanced.set(false);
            target.set_parent(WeakNode::new());
            target.free();
        } else {
            // Reparent all child nodes being moved.
            let moved: Vec<PgId> = self.0.inodes.borrow().iter().map(|i| i.pgid()).collect();
            for pgid in moved {
                if let Some(child) = bucket.cached_node(pgid) {
                    if let Some(old_parent) = child.parent() {
                        old_parent.remove_child(&child);
                    }
                    child.set_parent(WeakNode::from(&target));
                    target.0.children.borrow_mut().push(child.clone());
                }
            }

            // Copy over inodes to target and remove node.
            {
                let mut self_inodes = std::mem::take(&mut *self.0.inodes.borrow_mut());
                target.0.inodes.borrow_mut().append(&mut self_inodes);
            }
            let self_key = self.0.key.borrow().clone();
            parent.del(&self_key);
            parent.remove_child(self);
            bucket.remove_node(self.pgid());
            self.set_parent(WeakNode::new());
            self.free();
        }

        // Either this node or the target node was deleted from the parent so
        // rebalance it.
        parent.rebalance();
    }

    /// dereference causes the node to copy all its inode key/value
    /// references into owned memory. This is required before the mmap is
    /// reallocated so inodes are not pointing at stale data.
    pub(crate) fn dereference(&self) {
        {
            let mut key = self.0.key.borrow_mut();
            if !key.is_empty() {
                let owned = key.to_vec();
                *key = owned;
            }
        }

        {
            let mut inodes = self.0.inodes.borrow_mut();
            for i in 0..inodes.len() {
                let inode = inodes.get_mut(i);
                let key = inode.key().to_vec();
                assert!(!key.is_empty(), "dereference: zero-length inode key");
                inode.set_key(key);
                let value = inode.value().to_vec();
                inode.set_value(value);
            }
        }

        // Recursively dereference children.
        let children = self.0.children.borrow().clone();
        for child in children {
            child.dereference();
        }

        if let Ok(tx) = self.bucket().tx() {
            tx.stats().inc_node_deref();
        }
    }

    /// free adds the node's underlying page to the freelist.
    pub(crate) fn free(&self) {
        if self.pgid() != 0 {
            let tx = self.bucket().tx().expect("node free on closed tx");
            tx.free_page(self.pgid());
            self.0.pgid.set(0);
        }
    }

    // removes a node from the list of in-memory children.
    // This does not affect the inodes.
    pub(crate) fn remove_child(&self, target: &Node) {
        let mut children = self.0.children.borrow_mut();
        if let Some(index) = children.iter().position(|c| Rc::ptr_eq(&c.0, &target.0)) {
            children.remove(index);
        }
    }
}
