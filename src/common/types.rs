//!
//!  burrowdb default type declare
//!
use crate::common::page::PgId;
use once_cell::sync::Lazy;
use std::time::Duration;

// MAX_MMAP_STEP is the largest step that can be taken when remapping the mmap.
pub(crate) const MAX_MMAP_STEP: usize = 1 << 30; // 1GB

// MAX_MAP_SIZE caps the mmap length on 64-bit targets.
#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "powerpc64",
    target_arch = "mips64",
    target_arch = "loongarch64"
))]
pub(crate) const MAX_MAP_SIZE: u64 = 0xFFFFFFFFFFFF; // 256TB

// 32-bit targets can't address more than 2GB of mapped file.
#[cfg(any(
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "mips",
    target_arch = "powerpc"
))]
pub(crate) const MAX_MAP_SIZE: u64 = 0x7FFFFFFF; // 2GB

// MAX_ALLOC_SIZE bounds a single page-buffer allocation.
pub(crate) const MAX_ALLOC_SIZE: u64 = 0x7FFFFFFF;

// VERSION represents the data file format version.
pub(crate) const VERSION: u32 = 2;

// MAGIC represents a marker value to indicate that a file is a burrowdb file.
pub(crate) const MAGIC: u32 = 0xED0CDAED;

// Sentinel freelist pgid stored in the meta when the freelist is not synced.
pub(crate) const PGID_NO_FREELIST: PgId = 0xFFFFFFFFFFFFFFFF;

// IGNORE_NO_SYNC specifies whether the NoSync field of a DB is ignored when
// syncing changes to a file. This is required as some operating systems,
// such as OpenBSD, do not have a unified buffer cache (UBC) and writes
// must be synchronized using the msync(2) syscall.
pub(crate) const IGNORE_NO_SYNC: bool = cfg!(target_os = "openbsd");

// Default timeout used by open when acquiring the file lock.
pub(crate) const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

// DEFAULT_PAGE_SIZE is the default page size for db which is set to the OS page size.
pub(crate) static DEFAULT_PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

// TxId represents the internal transaction identifier.
pub(crate) type TxId = u64;

// Byte alias kept for the key/value type declarations.
pub type Byte = u8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        let page_size = *DEFAULT_PAGE_SIZE;
        // every platform we run on uses power-of-two pages
        assert!(page_size.is_power_of_two());
        assert!(page_size >= 4096);
    }

    #[test]
    fn test_magic_is_stable() {
        assert_eq!(0xED0CDAED, MAGIC);
        assert_eq!(2, VERSION);
    }
}
