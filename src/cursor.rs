//! Cursor represents an iterator that can traverse over all key/value pairs
//! in a bucket in lexicographical order.
//!
//! Cursors see nested buckets with value == None.
//! Cursors can be obtained from a transaction and are valid as long as the
//! transaction is open.
//!
//! Changing data while traversing with a cursor may cause it to be
//! invalidated and return unexpected keys and/or values. You must
//! reposition your cursor after mutating data.

use crate::bucket::Bucket;
use crate::common::inode::{Key, Value};
use crate::common::page::{BUCKET_LEAF_FLAG, Page, PgId};
use crate::errors::{Error, Result};
use crate::node::{Node, WeakNode};

/// One side of a cursor frame: a raw page straight out of the map, or a
/// materialized node when the write transaction already touched it.
pub(crate) enum PageNode {
    Page(*const Page),
    Node(Node),
}

// elemRef represents a reference to an element on a given page/node.
// This is used to track the current position of the cursor during iteration.
pub(crate) struct ElemRef {
    upper: PageNode,
    index: usize,
}

impl ElemRef {
    // is_leaf returns whether the ref is pointing at a leaf page/node.
    fn is_leaf(&self) -> bool {
        match &self.upper {
            PageNode::Node(n) => n.is_leaf(),
            PageNode::Page(p) => unsafe { (**p).is_leaf_page() },
        }
    }

    // count returns the number of inodes or page elements.
    fn count(&self) -> usize {
        match &self.upper {
            PageNode::Node(n) => n.num_inodes(),
            PageNode::Page(p) => unsafe { (**p).count() as usize },
        }
    }
}

pub struct Cursor<'b> {
    bucket: &'b Bucket,
    stack: Vec<ElemRef>,
}

impl<'b> Cursor<'b> {
    pub(crate) fn new(bucket: &'b Bucket) -> Cursor<'b> {
        Cursor {
            bucket,
            stack: Vec::new(),
        }
    }

    // Bucket returns the bucket that this cursor was created from.
    pub fn bucket(&self) -> &'b Bucket {
        self.bucket
    }

    /// First moves the cursor to the first item in the bucket and returns
    /// its key and value. If the bucket is empty then None is returned.
    pub fn first(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.first_with_flags().map(Self::to_pair)
    }

    /// Last moves the cursor to the last item in the bucket and returns its
    /// key and value. If the bucket is empty then None is returned.
    pub fn last(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.stack.clear();
        let upper = self.bucket.page_node(self.bucket.root_page());
        let mut elem = ElemRef { upper, index: 0 };
        elem.index = elem.count().saturating_sub(1);
        self.stack.push(elem);
        self.go_last();

        // An empty rightmost leaf is a legal transient state after deletes,
        // retreat one step when we land on one.
        let item = if self.stack.last().unwrap().count() == 0 && self.stack.len() > 1 {
            self.prev_kv()
        } else {
            self.key_value()
        };
        item.map(Self::to_pair)
    }

    /// Next moves the cursor to the next item in the bucket and returns its
    /// key and value. If the cursor is at the end of the bucket then None is
    /// returned.
    pub fn next(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.next_kv().map(Self::to_pair)
    }

    /// Prev moves the cursor to the previous item in the bucket and returns
    /// its key and value. If the cursor is at the beginning of the bucket
    /// then None is returned.
    pub fn prev(&mut self) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        self.prev_kv().map(Self::to_pair)
    }

    /// Seek moves the cursor to a given key and returns it. If the key does
    /// not exist then the next key is used. If no keys follow, None is
    /// returned.
    pub fn seek(&mut self, key: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let mut item = self.seek_to(key);

        // If we ended up after the last element of a page then move to the
        // next one.
        let past_end = {
            let elem = self.stack.last().expect("empty cursor stack");
            elem.index >= elem.count()
        };
        if past_end {
            item = self.next_kv();
        }

        item.map(Self::to_pair)
    }

    /// Delete removes the current key/value under the cursor from the
    /// bucket. Delete fails if the current key/value is a bucket or if the
    /// transaction is not writable.
    pub fn delete(&mut self) -> Result<()> {
        let tx = self.bucket.tx()?;
        if !tx.writable() {
            return Err(Error::TxNotWritable);
        }
        drop(tx);

        let (key, _, flags) = match self.key_value() {
            Some(item) => item,
            None => return Ok(()),
        };

        // Return an error if current value is a bucket.
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue);
        }
        self.node().del(&key);

        Ok(())
    }

    fn to_pair((key, value, flags): (Key, Value, u32)) -> (Vec<u8>, Option<Vec<u8>>) {
        // Sub-buckets must be opened, never read as blobs.
        if flags & BUCKET_LEAF_FLAG != 0 {
            (key, None)
        } else {
            (key, Some(value))
        }
    }

    /// Positions the cursor at the first item and returns the raw triple.
    pub(crate) fn first_with_flags(&mut self) -> Option<(Key, Value, u32)> {
        self.stack.clear();
        let upper = self.bucket.page_node(self.bucket.root_page());
        self.stack.push(ElemRef { upper, index: 0 });
        self.go_first();

        // If we land on an empty page then move to the next value.
        if self.stack.last().unwrap().count() == 0 {
            return self.next_kv();
        }

        self.key_value()
    }

    /// Advances the cursor and returns the raw triple.
    pub(crate) fn next_with_flags(&mut self) -> Option<(Key, Value, u32)> {
        self.next_kv()
    }

    /// seek_to moves the cursor to a given key and returns the raw triple at
    /// the resulting position. If the key does not exist then the next key
    /// is used.
    pub(crate) fn seek_to(&mut self, key: &[u8]) -> Option<(Key, Value, u32)> {
        self.stack.clear();
        self.search(key, self.bucket.root_page());

        self.key_value()
    }

    // first moves the cursor to the first leaf element under the last page
    // in the stack.
    fn go_first(&mut self) {
        loop {
            // Exit when we hit a leaf page.
            if self.stack.last().expect("empty cursor stack").is_leaf() {
                break;
            }

            // Keep adding pages pointing to the first element to the stack.
            let pgid = self.top_child_pgid();
            let upper = self.bucket.page_node(pgid);
            self.stack.push(ElemRef { upper, index: 0 });
        }
    }

    // last moves the cursor to the last leaf element under the last page in
    // the stack.
    fn go_last(&mut self) {
        loop {
            // Exit when we hit a leaf page.
            if self.stack.last().expect("empty cursor stack").is_leaf() {
                break;
            }

            // Keep adding pages pointing to the last element in the stack.
            let pgid = self.top_child_pgid();
            let upper = self.bucket.page_node(pgid);
            let mut elem = ElemRef { upper, index: 0 };
            elem.index = elem.count().saturating_sub(1);
            self.stack.push(elem);
        }
    }

    // Child pgid under the top frame's current index.
    fn top_child_pgid(&self) -> PgId {
        let elem = self.stack.last().expect("empty cursor stack");
        match &elem.upper {
            PageNode::Node(n) => n.pgid_at(elem.index),
            PageNode::Page(p) => unsafe { (**p).branch_page_element(elem.index).pgid() },
        }
    }

    // next moves to the next leaf element and returns the key and value.
    // If the cursor is at the last leaf element then it stays there and
    // returns None.
    fn next_kv(&mut self) -> Option<(Key, Value, u32)> {
        loop {
            // Attempt to move over one element until we're successful.
            // Move up the stack as we hit the end of each page in our stack.
            let mut i = self.stack.len() as i64 - 1;
            while i >= 0 {
                let elem = &mut self.stack[i as usize];
                if elem.index + 1 < elem.count() {
                    elem.index += 1;
                    break;
                }
                i -= 1;
            }

            // If we've hit the root page then stop and return. This will
            // leave the cursor on the last element of the last page.
            if i == -1 {
                return None;
            }

            // Otherwise start from where we left off in the stack and find
            // the first element of the first leaf page.
            self.stack.truncate(i as usize + 1);
            self.go_first();

            // If this is an empty page then restart and move back up the
            // stack.
            if self.stack.last().unwrap().count() == 0 {
                continue;
            }

            return self.key_value();
        }
    }

    // prev moves the cursor to the previous leaf element.
    fn prev_kv(&mut self) -> Option<(Key, Value, u32)> {
        loop {
            // Attempt to move back one element until we're successful.
            // Move up the stack as we hit the beginning of each page in our
            // stack.
            let mut i = self.stack.len() as i64 - 1;
            while i >= 0 {
                let elem = &mut self.stack[i as usize];
                if elem.index > 0 {
                    elem.index -= 1;
                    break;
                }
                i -= 1;
            }

            // If we've hit the beginning, return None.
            if i == -1 {
                return None;
            }

            // Move down the stack to find the last element of the last leaf
            // under this branch.
            self.stack.truncate(i as usize + 1);
            self.go_last();

            if self.stack.last().unwrap().count() == 0 {
                continue;
            }

            return self.key_value();
        }
    }

    // search recursively performs a binary search against a given page/node
    // until it finds a given key.
    fn search(&mut self, key: &[u8], pgid: PgId) {
        let upper = self.bucket.page_node(pgid);
        if let PageNode::Page(p) = &upper {
            let p = unsafe { &**p };
            assert!(
                p.is_branch_page() || p.is_leaf_page(),
                "invalid page type: {}: {:x}",
                p.id(),
                p.flags().bits()
            );
        }

        let elem = ElemRef { upper, index: 0 };
        let is_leaf = elem.is_leaf();
        self.stack.push(elem);

        // If we're on a leaf page/node then find the specific node.
        if is_leaf {
            self.nsearch(key);
            return;
        }

        // Binary search the branch for the greatest key <= the target, then
        // recurse into that child.
        let (index, child_pgid) = {
            let elem = self.stack.last().expect("empty cursor stack");
            match &elem.upper {
                PageNode::Node(n) => {
                    let index = match n.search(key) {
                        Ok(index) => index,
                        Err(0) => 0,
                        Err(index) => index - 1,
                    };
                    (index, n.pgid_at(index))
                }
                PageNode::Page(p) => {
                    let p = unsafe { &**p };
                    let elements = p.branch_page_elements();
                    let index = match elements.binary_search_by(|e| e.key().cmp(key)) {
                        Ok(index) => index,
                        Err(0) => 0,
                        Err(index) => index - 1,
                    };
                    (index, elements[index].pgid())
                }
            }
        };

        self.stack.last_mut().unwrap().index = index;
        self.search(key, child_pgid);
    }

    // nsearch searches the leaf node on the top of the stack for a key,
    // leaving the index at the lowest element >= key (possibly past the
    // end).
    fn nsearch(&mut self, key: &[u8]) {
        let elem = self.stack.last_mut().expect("empty cursor stack");
        let index = match &elem.upper {
            PageNode::Node(n) => match n.search(key) {
                Ok(index) | Err(index) => index,
            },
            PageNode::Page(p) => {
                let p = unsafe { &**p };
                let elements = p.leaf_page_elements();
                match elements.binary_search_by(|e| e.key().cmp(key)) {
                    Ok(index) | Err(index) => index,
                }
            }
        };
        elem.index = index;
    }

    // key_value returns the key and value of the current leaf element.
    fn key_value(&self) -> Option<(Key, Value, u32)> {
        let elem = self.stack.last().expect("empty cursor stack");

        // Nothing under the cursor when the page is empty or the index is
        // past the end.
        if elem.count() == 0 || elem.index >= elem.count() {
            return None;
        }

        match &elem.upper {
            PageNode::Node(n) => {
                let (key, value, flags, _) = n.inode_at(elem.index);
                Some((key, value, flags))
            }
            PageNode::Page(p) => unsafe {
                let el = (**p).leaf_page_element(elem.index);
                Some((el.key().to_vec(), el.value().to_vec(), el.flags()))
            },
        }
    }

    // node returns the node that the cursor is currently positioned on,
    // materializing the path from the root if needed.
    pub(crate) fn node(&mut self) -> Node {
        assert!(
            !self.stack.is_empty(),
            "accessing a node with a zero-length cursor stack"
        );

        // If the top of the stack is a leaf node then just return it.
        if let Some(elem) = self.stack.last() {
            if elem.is_leaf() {
                if let PageNode::Node(n) = &elem.upper {
                    return n.clone();
                }
            }
        }

        // Start from root and traverse down the hierarchy.
        let mut n = match &self.stack[0].upper {
            PageNode::Node(n) => n.clone(),
            PageNode::Page(p) => {
                let pgid = unsafe { (**p).id() };
                self.bucket.node(pgid, WeakNode::new())
            }
        };
        for elem in &self.stack[..self.stack.len() - 1] {
            assert!(!n.is_leaf(), "expected branch node");
            n = n.child_at(elem.index);
        }
        assert!(n.is_leaf(), "expected leaf node");
        n
    }
}
