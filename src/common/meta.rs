use crate::common::bucket::InBucket;
use crate::common::page::PgId;
use crate::common::types::{MAGIC, TxId, VERSION};
use crate::errors::Error;
use crate::errors::Result;
use fnv::FnvHasher;
use std::hash::Hasher;
use std::slice;
use std::{fmt, mem};

use super::page::{Page, PageFlags};
use super::types::PGID_NO_FREELIST;

///Meta Page Size
pub(crate) const META_PAGE_SIZE: usize = mem::size_of::<Meta>();

#[derive(Debug, Default, Clone)]
#[repr(C)]
pub(crate) struct Meta {
    /// database mime header
    magic: u32,
    /// database version
    version: u32,
    /// defined page size.
    /// u32 to be platform independent
    page_size: u32,
    flags: u32,
    /// root bucket of the whole tree
    root: InBucket,
    /// free list page id
    freelist: PgId,
    /// pg_id high watermark
    pgid: PgId,
    /// transaction id
    txid: TxId,
    /// meta check_sum
    checksum: u64,
}

impl Meta {
    // Validate checks the marker bytes and version of the meta page to ensure it matches this binary.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Invalid);
        } else if self.version != VERSION {
            return Err(Error::VersionMismatch);
        } else if self.checksum != 0 && self.checksum != self.sum64() {
            return Err(Error::Checksum);
        }
        Ok(())
    }

    // Write writes the meta onto a page.
    pub(crate) fn write(&mut self, p: &mut Page) {
        if self.root.root_page() >= self.pgid {
            panic!(
                "root bucket pgid ({}) above high water mark ({})",
                self.root.root_page(),
                self.pgid
            );
        } else if self.freelist >= self.pgid && self.freelist != PGID_NO_FREELIST {
            panic!(
                "freelist pgid ({}) above high water mark ({})",
                self.freelist, self.pgid
            );
        }

        // Page id is either going to be 0 or 1 which we can determine by the transaction ID.
        p.set_id(self.txid % 2);
        p.set_flags(PageFlags::META_PAGE);

        // Calculate the checksum.
        self.checksum = self.sum64();

        self.copy(p.meta_mut());
    }

    // Sum64 generates the checksum for the meta.
    pub(crate) fn sum64(&self) -> u64 {
        let mut h = FnvHasher::default();
        h.write(self.as_slice_no_checksum());
        h.finish()
    }

    #[inline]
    pub(crate) fn as_slice_no_checksum(&self) -> &[u8] {
        let ptr = self as *const Meta as *const u8;
        unsafe { slice::from_raw_parts(ptr, memoffset::offset_of!(Meta, checksum)) }
    }

    // Getter
    pub(crate) fn magic(&self) -> u32 {
        self.magic
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn root_bucket(&self) -> &InBucket {
        &self.root
    }

    pub(crate) fn freelist(&self) -> PgId {
        self.freelist
    }

    pub(crate) fn pgid(&self) -> PgId {
        self.pgid
    }

    pub(crate) fn txid(&self) -> TxId {
        self.txid
    }

    pub(crate) fn checksum(&self) -> u64 {
        self.checksum
    }

    // Setter
    pub(crate) fn set_magic(&mut self, v: u32) {
        self.magic = v;
    }

    pub(crate) fn set_version(&mut self, v: u32) {
        self.version = v;
    }

    pub(crate) fn set_page_size(&mut self, v: u32) {
        self.page_size = v;
    }

    pub(crate) fn set_root_bucket(&mut self, b: InBucket) {
        self.root = b;
    }

    pub(crate) fn set_freelist(&mut self, v: PgId) {
        self.freelist = v;
    }

    pub(crate) fn set_pgid(&mut self, id: PgId) {
        self.pgid = id;
    }

    pub(crate) fn set_txid(&mut self, id: TxId) {
        self.txid = id;
    }

    pub(crate) fn inc_txid(&mut self) {
        self.txid += 1;
    }

    pub(crate) fn set_checksum(&mut self, v: u64) {
        self.checksum = v;
    }

    // Copy copies one meta object to another.
    pub(crate) fn copy(&self, dest: &mut Meta) {
        *dest = self.clone();
    }

    pub(crate) fn is_freelist_persisted(&self) -> bool {
        self.freelist != PGID_NO_FREELIST
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta {{ version: {}, page_size: {}, root: <pgid={}>, freelist: <pgid={}>, hwm: <pgid={}>, txid: {}, checksum: 0x{:016x} }}",
            self.version,
            self.page_size,
            self.root.root_page(),
            self.freelist,
            self.pgid,
            self.txid,
            self.checksum
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::common::types::DEFAULT_PAGE_SIZE;

    use super::*;

    fn sample_meta() -> Meta {
        Meta {
            magic: MAGIC,
            version: VERSION,
            page_size: *DEFAULT_PAGE_SIZE as u32,
            flags: 0,
            root: InBucket::new(3, 0),
            freelist: 2,
            pgid: 10,
            txid: 4,
            checksum: 0,
        }
    }

    #[test]
    fn test_meta_write_and_validate() {
        let mut buf = vec![0u8; 1024];
        let page = Page::from_slice_mut(&mut buf);

        let mut meta = sample_meta();
        meta.write(page);

        assert!(page.is_meta_page());
        assert_eq!(page.id(), 4 % 2);
        assert!(page.meta().validate().is_ok());
        assert_eq!(page.meta().pgid(), 10);
        assert_eq!(page.meta().txid(), 4);
    }

    #[test]
    fn test_meta_checksum_detects_corruption() {
        let mut buf = vec![0u8; 1024];
        let page = Page::from_slice_mut(&mut buf);

        let mut meta = sample_meta();
        meta.write(page);
        assert!(page.meta().validate().is_ok());

        // flip one byte inside the meta image
        buf[crate::common::PAGE_HEADER_SIZE + 21] ^= 0xFF;
        let page = Page::from_slice(&buf);
        assert!(page.meta().validate().is_err());
    }

    #[test]
    fn test_meta_bad_magic() {
        let mut meta = sample_meta();
        meta.set_magic(0xDEADBEEF);
        assert_eq!(meta.validate(), Err(Error::Invalid));

        let mut meta = sample_meta();
        meta.set_version(99);
        assert_eq!(meta.validate(), Err(Error::VersionMismatch));
    }
}
