//! Guest physical memory collaborators used by the texture cache.
//!
//! The emulator provides the real implementations; the cache only needs raw reads for uploads
//! and write-watch registration for invalidation. [`VecGuestMemory`] implements both on top of a
//! flat byte vector for tests and tools.

use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("guest memory access out of bounds: gpa=0x{gpa:x}, len=0x{len:x}")]
pub struct GuestMemoryError {
    pub gpa: u64,
    pub len: usize,
}

/// Raw read access to guest physical memory.
pub trait GuestMemory: Send + Sync {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
}

/// Token identifying one registered write watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

/// Invoked whenever the guest writes inside a watched range. May run on any thread.
pub type WatchCallback = Box<dyn Fn() + Send + Sync>;

/// Write-watch registration on guest physical memory.
pub trait MemoryWatcher: Send + Sync {
    fn watch(&self, range: Range<u64>, callback: WatchCallback) -> WatchHandle;
    fn unwatch(&self, handle: WatchHandle);
}

struct Watch {
    handle: WatchHandle,
    range: Range<u64>,
    callback: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct WatchList {
    next_handle: u64,
    entries: Vec<Watch>,
}

/// Simple contiguous guest RAM with write watches.
pub struct VecGuestMemory {
    mem: RwLock<Vec<u8>>,
    watches: Mutex<WatchList>,
}

impl VecGuestMemory {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            mem: RwLock::new(vec![0u8; size_bytes]),
            watches: Mutex::new(WatchList::default()),
        }
    }

    fn span(gpa: u64, len: usize, mem_len: usize) -> Result<Range<usize>, GuestMemoryError> {
        let err = GuestMemoryError { gpa, len };
        let start = usize::try_from(gpa).map_err(|_| err.clone())?;
        let end = start.checked_add(len).ok_or_else(|| err.clone())?;
        if end > mem_len {
            return Err(err);
        }
        Ok(start..end)
    }

    /// Write `data` at `gpa` and fire every watch overlapping the written range.
    ///
    /// Callbacks run on the calling thread after all internal locks are released.
    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        {
            let mut mem = self.mem.write().unwrap_or_else(PoisonError::into_inner);
            let span = Self::span(gpa, data.len(), mem.len())?;
            mem[span].copy_from_slice(data);
        }
        if data.is_empty() {
            return Ok(());
        }

        let written = gpa..gpa + data.len() as u64;
        let fired: Vec<_> = {
            let watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
            watches
                .entries
                .iter()
                .filter(|w| w.range.start < written.end && written.start < w.range.end)
                .map(|w| Arc::clone(&w.callback))
                .collect()
        };
        for callback in fired {
            callback();
        }
        Ok(())
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl GuestMemory for VecGuestMemory {
    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let mem = self.mem.read().unwrap_or_else(PoisonError::into_inner);
        let span = Self::span(gpa, dst.len(), mem.len())?;
        dst.copy_from_slice(&mem[span]);
        Ok(())
    }
}

impl MemoryWatcher for VecGuestMemory {
    fn watch(&self, range: Range<u64>, callback: WatchCallback) -> WatchHandle {
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.next_handle += 1;
        let handle = WatchHandle(watches.next_handle);
        watches.entries.push(Watch {
            handle,
            range,
            callback: Arc::from(callback),
        });
        handle
    }

    fn unwatch(&self, handle: WatchHandle) {
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.entries.retain(|w| w.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mem = VecGuestMemory::new(16);
        let mut buf = [0u8; 4];
        assert_eq!(
            mem.read(14, &mut buf),
            Err(GuestMemoryError { gpa: 14, len: 4 })
        );
        assert!(mem.write(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn writes_fire_only_overlapping_watches() {
        let mem = VecGuestMemory::new(0x100);
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = mem.watch(
            0x40..0x80,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        mem.write(0x00, &[0; 0x40]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        mem.write(0x7F, &[1, 2]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        mem.unwatch(handle);
        mem.write(0x40, &[3]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(mem.watch_count(), 0);

        let mut buf = [0u8; 2];
        mem.read(0x7F, &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
    }
}
