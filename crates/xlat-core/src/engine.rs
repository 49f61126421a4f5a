//! Process-wide translation state shared by every guest thread.

use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use xlat_aot::{AotCache, AotError, FileIdFlags};

use crate::code_buffer::CodeCache;
use crate::compiler::{CodeGenerator, Compiler, Frontend};
use crate::config::EngineConfig;
use crate::error::CompileError;
use crate::lookup_cache::LookupCache;
use crate::signal::IdleCounter;
use crate::thread_state::ThreadState;
use crate::unwind::{HostAbi, UnwindRegistry};

/// A registered guest thread. The owning dispatcher removes it before freeing the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadPtr(pub(crate) NonNull<ThreadState>);

// SAFETY: only the atomic fields are read through this pointer from other threads.
unsafe impl Send for ThreadPtr {}

pub struct Engine {
    config: EngineConfig,
    lookup: LookupCache,
    code: CodeCache,
    compiler: Compiler,
    threads: Mutex<Vec<ThreadPtr>>,
    /// Held shared from translation to install, and exclusively by invalidation, so a block
    /// translated from memory that is being invalidated is installed before the erase.
    invalidation: RwLock<()>,
    idle: Arc<IdleCounter>,
    next_thread_id: AtomicU32,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("lookup", &self.lookup.len())
            .field("code", &self.code)
            .field("compiler", &self.compiler)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        frontend: Arc<dyn Frontend>,
        codegen: Arc<dyn CodeGenerator>,
        unwind: Arc<dyn UnwindRegistry>,
    ) -> Self {
        let aot = config.aot_config().map(|c| Arc::new(AotCache::new(c)));
        Self {
            lookup: LookupCache::new(config.l2_address_bits),
            code: CodeCache::new(config.code_buffer_size, HostAbi::host(), unwind),
            compiler: Compiler::new(&config, frontend, codegen, aot),
            threads: Mutex::new(Vec::new()),
            invalidation: RwLock::new(()),
            idle: Arc::default(),
            next_thread_id: AtomicU32::new(1),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lookup_cache(&self) -> &LookupCache {
        &self.lookup
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn idle(&self) -> &Arc<IdleCounter> {
        &self.idle
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<ThreadPtr>> {
        match self.threads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_install(&self) -> RwLockReadGuard<'_, ()> {
        match self.invalidation.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin_invalidation(&self) -> RwLockWriteGuard<'_, ()> {
        match self.invalidation.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn register_thread(&self) -> NonNull<ThreadState> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let state = ThreadState::new(id, Arc::clone(&self.idle));
        let ptr = NonNull::from(Box::leak(state));
        self.lock_threads().push(ThreadPtr(ptr));
        self.idle.enter();
        ptr
    }

    /// # Safety
    ///
    /// `ptr` must come from `register_thread` on this engine and not be used afterwards.
    pub(crate) unsafe fn unregister_thread(&self, ptr: NonNull<ThreadState>) {
        self.lock_threads().retain(|t| t.0 != ptr);
        // SAFETY: the pointer was leaked from a Box in `register_thread` and is no longer
        // reachable from the registry.
        let state = unsafe { Box::from_raw(ptr.as_ptr()) };
        if !state.is_sleeping() {
            self.idle.leave();
        }
    }

    pub fn thread_count(&self) -> usize {
        self.lock_threads().len()
    }

    /// Compiles `guest` and installs the result. Reentrant across threads; when two threads
    /// compile the same address the later install wins.
    ///
    /// An invalidation that overlaps the translation waits for the install and then erases it.
    pub fn compile(&self, guest: u64) -> Result<usize, CompileError> {
        let (translation, host) = {
            let _install = self.begin_install();
            let translation = self.compiler.translate(guest)?;
            let host = self.code.install(&translation.code)?;
            self.lookup.insert(guest, host);
            for &(start, len) in &translation.code_ranges {
                self.lookup.add_block_executable_range(&[guest], start, len);
            }
            (translation, host)
        };
        self.compiler.persist(&translation);
        if self.code.pending_free() > 0 {
            self.free_retired();
        }
        Ok(host)
    }

    /// Forgets every block with code in `[start, start + len)`.
    pub fn invalidate_range(&self, start: u64, len: u64) -> usize {
        let _invalidation = self.begin_invalidation();
        self.lookup.invalidate_range(start, len).len()
    }

    /// Drops every translation. Code memory is freed once no thread can still be using it.
    pub fn clear_code_cache(&self) {
        {
            let _invalidation = self.begin_invalidation();
            self.lookup.clear();
            self.code.retire_all();
        }
        self.free_retired();
    }

    /// Frees retired code buffers if no registered thread may be in a block or a pause handler.
    pub fn free_retired(&self) -> usize {
        // Pairs with the fence a dispatcher issues between raising `dispatcher_in_block` and
        // looking up a block: either it saw the cleared caches or we see its flag.
        fence(Ordering::SeqCst);
        let threads = self.lock_threads();
        // SAFETY: registered pointers stay valid until removed under this lock, and only atomic
        // fields are read.
        let states = threads.iter().map(|t| unsafe { t.0.as_ref() });
        self.code.free_retired(states)
    }

    /// Tells the AOT cache about a guest mapping of `path`. Returns the module's file id.
    pub fn add_mapped_region(
        &self,
        path: &Path,
        flags: FileIdFlags,
        start: u64,
        end: u64,
        offset: u64,
    ) -> Option<String> {
        let aot = self.compiler.aot()?;
        Some(aot.add_mapped_region(path, flags, start, end, offset))
    }

    pub fn remove_mapped_region(&self, start: u64) -> bool {
        self.compiler
            .aot()
            .is_some_and(|aot| aot.remove_mapped_region(start))
    }

    /// Flushes and merges pending AOT writes.
    pub fn shutdown(&self) -> Result<Vec<PathBuf>, AotError> {
        match self.compiler.aot() {
            Some(aot) => aot.shutdown(),
            None => Ok(Vec::new()),
        }
    }
}
