//! Guest RAM blocks and the per-page state machine.
//!
//! A [`RamBlock`] is one contiguous named region of guest-visible memory,
//! registered by the VM before a save or load begins. The loader tracks
//! every page-sized chunk of every block with a [`Page`] whose `state`
//! field is the only piece of shared mutable state in the whole pipeline.
//! All transitions go through compare-and-swap; there is no lock around
//! the state machine.
//!
//! # Ownership of the transient buffer
//! A page's just-read (possibly still compressed) bytes live in a mutex'd
//! slot, but the mutex is never contended: the CAS protocol guarantees a
//! single owner between a `Empty -> Reading` win and the matching
//! `Filling -> Filled` completion, so every lock acquisition is
//! uncontended and the slot exists only to keep that invariant inside
//! safe Rust.

pub mod loader;
pub mod saver;

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

/// Host-virtual base address of a guest memory region.
///
/// Carried across threads by the loader pipeline; the VM guarantees the
/// mapping outlives any snapshot operation that references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(pub *mut u8);

// SAFETY: HostPtr is an address, not a borrow. All dereferences go
// through RamBlock::page_slice_mut, whose exclusivity is enforced by the
// page state machine.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

/// One contiguous named region of guest memory. Immutable for the
/// duration of a save or load.
#[derive(Debug, Clone)]
pub struct RamBlock {
    pub id: String,
    pub host_ptr: HostPtr,
    pub size: usize,
    pub page_size: usize,
}

impl RamBlock {
    pub fn new(id: impl Into<String>, host_ptr: *mut u8, size: usize, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be nonzero");
        Self {
            id: id.into(),
            host_ptr: HostPtr(host_ptr),
            size,
            page_size,
        }
    }

    /// Number of pages covering the block; the last page may be short.
    pub fn page_count(&self) -> usize {
        self.size.div_ceil(self.page_size)
    }

    /// Logical byte length of page `index` within this block.
    pub fn page_len(&self, index: usize) -> usize {
        let start = index * self.page_size;
        debug_assert!(start < self.size);
        (self.size - start).min(self.page_size)
    }

    /// Whether `addr` falls inside this block's host range.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.host_ptr.0 as usize;
        addr >= base && addr < base + self.size
    }

    /// Page index within this block for a host address.
    pub fn page_index_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.host_ptr.0 as usize) / self.page_size
    }

    pub fn page_base(&self, index: usize) -> *mut u8 {
        // Block sizes are bounded by the guest address space; this cannot wrap.
        self.host_ptr.0.wrapping_add(index * self.page_size)
    }

    /// Guest memory backing page `index`.
    ///
    /// # Safety
    /// The caller must hold exclusive fill rights for this page (a won
    /// `Reading` or `Filling` CAS), and the VM mapping must still be live.
    pub unsafe fn page_slice_mut(&self, index: usize) -> &'static mut [u8] {
        // SAFETY: per the function contract, exactly one thread reaches
        // this for a given page at a time and the mapping is live.
        unsafe { std::slice::from_raw_parts_mut(self.page_base(index), self.page_len(index)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Not yet read from disk.
    Empty = 0,
    /// One thread owns the disk read (and decompression hand-off).
    Reading = 1,
    /// Bytes are resident in the page's buffer slot (or the page is a
    /// zero page and has no bytes at all), waiting to be copied out.
    Read = 2,
    /// One thread owns the copy into guest memory.
    Filling = 3,
    /// Guest memory holds the page's contents. Terminal on success.
    Filled = 4,
    /// Disk read or decompression failed. Terminal.
    Error = 5,
}

impl PageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::Empty,
            1 => PageState::Reading,
            2 => PageState::Read,
            3 => PageState::Filling,
            4 => PageState::Filled,
            _ => PageState::Error,
        }
    }
}

/// Tracking entry for one page-sized chunk of a registered block.
#[derive(Debug)]
pub struct Page {
    state: AtomicU8,
    /// Index into the loader's block table.
    pub block_index: u32,
    /// Bytes occupied in `ram.bin`; 0 means "all zero, never stored".
    pub size_on_disk: u32,
    /// Absolute offset of the page's bytes in `ram.bin`.
    pub file_pos: u64,
    /// Transient read buffer; see the module docs for the ownership rule.
    data: Mutex<Option<Box<[u8]>>>,
}

impl Page {
    pub fn new(block_index: u32, size_on_disk: u32, file_pos: u64) -> Self {
        // Zero pages have nothing to read; they are born ready to fill.
        let state = if size_on_disk == 0 {
            PageState::Read
        } else {
            PageState::Empty
        };
        Self {
            state: AtomicU8::new(state as u8),
            block_index,
            size_on_disk,
            file_pos,
            data: Mutex::new(None),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.size_on_disk == 0
    }

    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Single-winner transition; the loser observes the current state and
    /// must not touch the page's buffer.
    pub fn transition(&self, from: PageState, to: PageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Parks freshly read (or decompressed) bytes for the fill side.
    /// Caller must own the `Reading` state.
    pub fn put_data(&self, bytes: Box<[u8]>) {
        *self.data.lock() = Some(bytes);
    }

    /// Takes the parked bytes. Caller must own the `Filling` state.
    pub fn take_data(&self) -> Option<Box<[u8]>> {
        self.data.lock().take()
    }

    /// Marks the page failed. `Error` is terminal, so a plain store by
    /// the state's current owner cannot race a CAS winner.
    pub fn set_error(&self) {
        self.state.store(PageState::Error as u8, Ordering::Release);
    }
}
