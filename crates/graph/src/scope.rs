//! The safety scope bracketing each tick's parallel execution window.
//!
//! While the window is open, arena memory belongs to the scheduled workers:
//! output fields are write-exclusive and input fields read-only. The host
//! gets back in only after the fence. Everything the host is handed while
//! the window is closed carries the epoch it was minted under; the moment a
//! later window opens, those views fail deterministically instead of
//! reading memory the engine may have repatched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

pub struct ScopeManager {
    epoch: AtomicU64,
    open: AtomicBool,
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    /// Open the execution window. Fails if a window is already open:
    /// overlapping scheduled work without a completion dependency is
    /// rejected, not silently racy.
    pub(crate) fn open(&self) -> Result<u64> {
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::UnfencedAccess);
        }
        Ok(self.epoch.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Close the window after the fence.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Epoch of the last completed window; 0 before the first tick.
    pub fn last_closed(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::Acquire);
        if self.is_open() {
            epoch.saturating_sub(1)
        } else {
            epoch
        }
    }
}

/// A fenced, read-only host view of arena memory, valid only until the next
/// execution window opens.
pub struct ArenaView {
    ptr: *const u8,
    bytes: usize,
    epoch: u64,
    scope: Arc<ScopeManager>,
}

impl ArenaView {
    pub(crate) fn new(ptr: *const u8, bytes: usize, epoch: u64, scope: Arc<ScopeManager>) -> Self {
        Self {
            ptr,
            bytes,
            epoch,
            scope,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// The viewed bytes. Fails with [Error::StaleView] once the window that
    /// produced them has been superseded.
    pub fn bytes(&self) -> Result<&[u8]> {
        if self.scope.is_open() || self.scope.last_closed() != self.epoch {
            return Err(Error::StaleView);
        }
        if self.bytes == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { std::slice::from_raw_parts(self.ptr, self.bytes) })
    }

    /// Read the view as a single `T`.
    pub fn read<T: Copy>(&self) -> Result<T> {
        let bytes = self.bytes()?;
        if bytes.len() != size_of::<T>() {
            return Err(Error::KindMismatch);
        }
        Ok(unsafe { bytes.as_ptr().cast::<T>().read_unaligned() })
    }

    /// Read element `index` of the viewed buffer.
    pub fn read_at<T: Copy>(&self, index: usize) -> Result<T> {
        let bytes = self.bytes()?;
        let offset = index
            .checked_mul(size_of::<T>())
            .ok_or(Error::PortIndexOutOfRange)?;
        if offset + size_of::<T>() > bytes.len() {
            return Err(Error::PortIndexOutOfRange);
        }
        Ok(unsafe { bytes.as_ptr().add(offset).cast::<T>().read_unaligned() })
    }
}
