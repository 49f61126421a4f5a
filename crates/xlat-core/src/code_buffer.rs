//! Executable memory for generated blocks.
//!
//! A [`CodeBuffer`] is one anonymous mapping that blocks are bump-allocated from. The
//! [`CodeCache`] owns the buffer currently being filled plus every buffer that was retired by a
//! cache clear but may still be executing on some thread.

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CodeBufferError;
use crate::thread_state::ThreadState;
use crate::unwind::{build_eh_frame, HostAbi, UnwindRegistry};

const BLOCK_ALIGN: usize = 16;

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

fn flush_icache(start: *mut u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: the range lies inside a live mapping owned by the caller.
    unsafe {
        __clear_cache(start.cast(), start.add(len).cast())
    };
    #[cfg(not(target_arch = "aarch64"))]
    let _ = (start, len);
}

pub struct CodeBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    used: usize,
    sealed: bool,
    eh_frame: Box<[u8]>,
    registry: Arc<dyn UnwindRegistry>,
}

// SAFETY: the mapping is owned exclusively by this value; mutation goes through `&mut self`.
unsafe impl Send for CodeBuffer {}
// SAFETY: shared access only reads the address range.
unsafe impl Sync for CodeBuffer {}

impl std::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl CodeBuffer {
    /// Maps a writable and executable region of at least `size` bytes and registers its unwind
    /// descriptor.
    pub fn new(
        size: usize,
        abi: &HostAbi,
        registry: Arc<dyn UnwindRegistry>,
    ) -> Result<Self, CodeBufferError> {
        let page = page_size();
        let capacity = size.max(page).div_ceil(page) * page;
        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(CodeBufferError::Map {
                size: capacity,
                source: std::io::Error::last_os_error(),
            });
        }
        let Some(ptr) = NonNull::new(raw.cast::<u8>()) else {
            return Err(CodeBufferError::Map {
                size: capacity,
                source: std::io::Error::other("mmap returned null"),
            });
        };

        let eh_frame = build_eh_frame(abi, ptr.as_ptr() as u64, capacity as u64).into_boxed_slice();
        registry.register(&eh_frame);
        tracing::debug!(start = ptr.as_ptr() as u64, capacity, "mapped code buffer");

        Ok(Self {
            ptr,
            capacity,
            used: 0,
            sealed: false,
            eh_frame,
            registry,
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn eh_frame(&self) -> &[u8] {
        &self.eh_frame
    }

    #[inline]
    pub fn contains(&self, host: usize) -> bool {
        host >= self.start() && host < self.start() + self.capacity
    }

    /// Copies `code` into the buffer and returns its host address, or `None` when it does not
    /// fit or the buffer is sealed.
    pub fn append(&mut self, code: &[u8]) -> Option<usize> {
        if self.sealed || code.is_empty() {
            return None;
        }
        let offset = self.used.next_multiple_of(BLOCK_ALIGN);
        let end = offset.checked_add(code.len())?;
        if end > self.capacity {
            return None;
        }
        // SAFETY: `offset..end` lies within the mapping and no block has been placed there.
        unsafe {
            let dst = self.ptr.as_ptr().add(offset);
            ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            flush_icache(dst, code.len());
        }
        self.used = end;
        Some(self.start() + offset)
    }

    /// Drops write access. No further blocks can be appended.
    pub fn seal(&mut self) -> Result<(), CodeBufferError> {
        if self.sealed {
            return Ok(());
        }
        // SAFETY: the whole mapping belongs to this buffer.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast(),
                self.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(CodeBufferError::Protect(std::io::Error::last_os_error()));
        }
        self.sealed = true;
        Ok(())
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        self.registry.deregister(&self.eh_frame);
        // SAFETY: the mapping was created in `new` with this exact length.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.capacity) };
        if rc != 0 {
            tracing::warn!(
                start = self.start(),
                error = %std::io::Error::last_os_error(),
                "munmap of code buffer failed"
            );
        }
    }
}

#[derive(Debug, Default)]
struct CodeCacheInner {
    current: Option<CodeBuffer>,
    /// Sealed buffers whose blocks are still mapped.
    full: Vec<CodeBuffer>,
    /// Buffers with no mappings left, waiting for every thread to leave them.
    retired: Vec<CodeBuffer>,
}

/// All executable memory of an engine.
pub struct CodeCache {
    buffer_size: usize,
    abi: HostAbi,
    registry: Arc<dyn UnwindRegistry>,
    inner: Mutex<CodeCacheInner>,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("buffer_size", &self.buffer_size)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl CodeCache {
    pub fn new(buffer_size: usize, abi: HostAbi, registry: Arc<dyn UnwindRegistry>) -> Self {
        Self {
            buffer_size,
            abi,
            registry,
            inner: Mutex::new(CodeCacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CodeCacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Places `code` in the current buffer, rolling over to a fresh one when it is full. Full
    /// buffers are sealed and kept, since blocks in them stay reachable.
    pub fn install(&self, code: &[u8]) -> Result<usize, CodeBufferError> {
        let mut inner = self.lock();
        if let Some(host) = inner.current.as_mut().and_then(|buf| buf.append(code)) {
            return Ok(host);
        }

        let size = self.buffer_size.max(code.len() + BLOCK_ALIGN);
        let mut fresh = CodeBuffer::new(size, &self.abi, Arc::clone(&self.registry))?;
        let Some(host) = fresh.append(code) else {
            return Err(CodeBufferError::BlockTooLarge {
                requested: code.len(),
                capacity: fresh.capacity(),
            });
        };
        if let Some(mut full) = inner.current.replace(fresh) {
            full.seal()?;
            inner.full.push(full);
        }
        Ok(host)
    }

    /// Whether `host` lies in any buffer this cache still owns.
    pub fn contains(&self, host: usize) -> bool {
        let inner = self.lock();
        inner.current.as_ref().is_some_and(|b| b.contains(host))
            || inner.full.iter().any(|b| b.contains(host))
            || inner.retired.iter().any(|b| b.contains(host))
    }

    /// Moves every buffer to the pending free list. The caller must already have removed every
    /// lookup mapping into them.
    pub fn retire_all(&self) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.retired.append(&mut inner.full);
        if let Some(current) = inner.current.take() {
            inner.retired.push(current);
        }
        tracing::debug!(pending = inner.retired.len(), "retired code buffers");
    }

    pub fn pending_free(&self) -> usize {
        self.lock().retired.len()
    }

    /// Frees retired buffers if no thread in `threads` could still be executing or unwinding
    /// through them. Returns the number freed.
    pub fn free_retired<'a>(&self, threads: impl IntoIterator<Item = &'a ThreadState>) -> usize {
        let mut inner = self.lock();
        if inner.retired.is_empty() {
            return 0;
        }
        if threads.into_iter().any(ThreadState::may_reference_code) {
            return 0;
        }
        std::sync::atomic::fence(Ordering::SeqCst);
        let freed = inner.retired.len();
        inner.retired.clear();
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unwind::NullUnwindRegistry;

    fn cache(size: usize) -> (CodeCache, Arc<NullUnwindRegistry>) {
        let registry = Arc::new(NullUnwindRegistry::default());
        let cache = CodeCache::new(size, HostAbi::host(), registry.clone());
        (cache, registry)
    }

    #[test]
    fn blocks_are_aligned_and_readable() {
        let registry: Arc<dyn UnwindRegistry> = Arc::new(NullUnwindRegistry::default());
        let mut buf = CodeBuffer::new(4096, &HostAbi::host(), registry).unwrap();
        let a = buf.append(&[1, 2, 3]).unwrap();
        let b = buf.append(&[4, 5]).unwrap();
        assert_eq!(a % BLOCK_ALIGN, 0);
        assert_eq!(b - a, BLOCK_ALIGN);
        assert!(buf.contains(a) && buf.contains(b));
        // SAFETY: both blocks live inside the mapping.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(a as *const u8, 3), &[1, 2, 3]);
            assert_eq!(std::slice::from_raw_parts(b as *const u8, 2), &[4, 5]);
        }
        buf.seal().unwrap();
        assert!(buf.append(&[6]).is_none());
    }

    #[test]
    fn full_buffer_rolls_over() {
        let page = page_size();
        let (cache, registry) = cache(page);
        let block = vec![0x90u8; page / 4];
        let first = cache.install(&block).unwrap();
        for _ in 0..3 {
            cache.install(&block).unwrap();
        }
        let spill = cache.install(&block).unwrap();
        assert_eq!(registry.live(), 2);
        assert!(cache.contains(first));
        assert!(cache.contains(spill));
        assert_eq!(cache.pending_free(), 0, "sealed buffer stays live");
        cache.retire_all();
        assert_eq!(cache.pending_free(), 2);
    }

    #[test]
    fn oversized_block_gets_its_own_buffer() {
        let (cache, _) = cache(4096);
        let big = vec![0u8; 3 * page_size()];
        assert!(cache.install(&big).is_ok());
    }

    #[test]
    fn retired_buffers_wait_for_quiescence() {
        let (cache, registry) = cache(4096);
        let host = cache.install(&[0xc3]).unwrap();
        cache.retire_all();

        let thread = ThreadState::new(1, Arc::default());
        thread.dispatcher_in_block.store(1, Ordering::Release);
        assert_eq!(cache.free_retired([&*thread]), 0);
        assert!(cache.contains(host));

        thread.dispatcher_in_block.store(0, Ordering::Release);
        thread.signal_handler_refcount.store(2, Ordering::Release);
        assert_eq!(cache.free_retired([&*thread]), 0);

        thread.signal_handler_refcount.store(0, Ordering::Release);
        assert_eq!(cache.free_retired([&*thread]), 1);
        assert!(!cache.contains(host));
        assert_eq!(registry.live(), 0);
        assert_eq!(registry.registered(), 1);
    }
}
