//! Per-thread execution loop.
//!
//! A [`Dispatcher`] owns one guest thread's [`ThreadState`] and repeatedly resolves the guest
//! RIP through its L1 cache and the engine's shared lookup cache, compiling on a miss, then runs
//! the block through an [`Executor`].
//!
//! Pause and stop requests are honoured at safe points: on every lookup miss, and after every
//! block when single-step mode is enabled. A stop is also seen after any block. Requests
//! delivered by signal while a block runs are handled by the signal layer instead.
//!
//! `dispatcher_in_block` is raised before the host pointer is looked up and stays raised until
//! the block returns, so a thread clearing the caches either sees the flag or this thread sees
//! the cleared caches. It is lowered while compiling.

use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use xlat_ir::GuestCpuState;

use crate::engine::Engine;
use crate::error::CompileError;
use crate::lookup_cache::L1Cache;
use crate::signal::{self, RunState};
use crate::thread_state::ThreadState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// The block wrote the next guest RIP and returned.
    Continue,
    /// The guest asked to terminate the thread.
    Exit,
    /// A stop request unwound the block.
    Stopped,
}

/// Runs installed host code.
pub trait Executor: Send + Sync {
    /// Runs the block at `host` for `thread`. The pointer is valid for the duration of the call
    /// and the caller holds no references into the state.
    fn execute(&self, host: usize, thread: NonNull<ThreadState>) -> BlockExit;
}

/// Runs blocks as `extern "C" fn(*mut ThreadState) -> u32`: 0 continues, 2 means a stop
/// request unwound the block, anything else exits.
///
/// On Linux x86-64 and AArch64 blocks are entered through [`crate::entry::enter_block`], which
/// also sets up the state register and the returning stack location the signal layer needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeExecutor;

impl NativeExecutor {
    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn call(host: usize, thread: NonNull<ThreadState>) -> u32 {
        // SAFETY: `host` came from the code cache, where the code generator placed a block
        // following the generated-code ABI. The dispatcher holds no borrow into the state.
        unsafe { crate::entry::enter_block(thread.as_ptr(), host) }
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    fn call(host: usize, thread: NonNull<ThreadState>) -> u32 {
        type Entry = unsafe extern "C" fn(*mut ThreadState) -> u32;
        // SAFETY: `host` came from the code cache, where the code generator placed a function
        // with this signature.
        let entry = unsafe { std::mem::transmute::<usize, Entry>(host) };
        // SAFETY: see above; the thread state is live for the call.
        unsafe { entry(thread.as_ptr()) }
    }
}

impl Executor for NativeExecutor {
    fn execute(&self, host: usize, thread: NonNull<ThreadState>) -> BlockExit {
        match Self::call(host, thread) {
            0 => BlockExit::Continue,
            2 => BlockExit::Stopped,
            _ => BlockExit::Exit,
        }
    }
}

#[derive(Debug)]
pub enum ExitReason {
    /// No code could be produced for the address; the guest should see a fault there.
    Unexecutable(u64),
    CompileFailed(CompileError),
    Stopped,
    Paused,
    Exited,
}

#[derive(Debug)]
pub enum StepOutcome {
    Block {
        entry_rip: u64,
        next_rip: u64,
        host: usize,
        /// Whether this step compiled the block.
        compiled: bool,
    },
    Exit(ExitReason),
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    executor: Arc<dyn Executor>,
    state: NonNull<ThreadState>,
    l1: L1Cache,
    single_step: bool,
}

// SAFETY: the thread state is owned by this value; other threads only read its atomics.
unsafe impl Send for Dispatcher {}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("thread", &self.thread().thread_id())
            .field("rip", &format_args!("{:#x}", self.cpu().rip))
            .field("single_step", &self.single_step)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, executor: Arc<dyn Executor>) -> Self {
        let state = engine.register_thread();
        let l1 = L1Cache::new(engine.config().l1_entries);
        let single_step = engine.config().single_step;
        Self {
            engine,
            executor,
            state,
            l1,
            single_step,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn thread(&self) -> &ThreadState {
        // SAFETY: the state lives until drop; mutable access is confined to `cpu_mut`.
        unsafe { self.state.as_ref() }
    }

    pub fn thread_ptr(&self) -> NonNull<ThreadState> {
        self.state
    }

    pub fn cpu(&self) -> &GuestCpuState {
        &self.thread().cpu
    }

    pub fn cpu_mut(&mut self) -> &mut GuestCpuState {
        // SAFETY: only this dispatcher writes the register file, and no block is running.
        unsafe { &mut *std::ptr::addr_of_mut!((*self.state.as_ptr()).cpu) }
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    /// Makes this dispatcher the target of pause signals sent to the calling host thread.
    pub fn attach_current_thread(&self) {
        self.thread().attach_current_thread();
        // SAFETY: cleared in `Drop` before the state is freed.
        unsafe { signal::set_current_thread(self.state.as_ptr()) };
    }

    /// Picks up a pending pause or stop request.
    fn check_run_state(&self) -> Option<ExitReason> {
        let thread = self.thread();
        match thread.run_state() {
            RunState::Running => None,
            RunState::Stopped => Some(ExitReason::Stopped),
            RunState::PauseRequested | RunState::Pausing => {
                thread.transition(RunState::PauseRequested, RunState::Pausing);
                signal::enter_pause(thread);
                Some(ExitReason::Paused)
            }
        }
    }

    /// Leaves a cooperative pause.
    pub fn resume(&self) {
        signal::resume_from_pause(self.thread());
    }

    pub fn step(&mut self) -> StepOutcome {
        let entry_rip = self.cpu().rip;
        let mut compiled = false;
        let host = loop {
            self.thread().dispatcher_in_block.store(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            if let Some(host) = self.l1.find(self.engine.lookup_cache(), entry_rip) {
                break host;
            }
            self.thread().dispatcher_in_block.store(0, Ordering::Release);

            if let Some(reason) = self.check_run_state() {
                return StepOutcome::Exit(reason);
            }
            // The block is looked up again: a concurrent clear may already have dropped it.
            match self.engine.compile(entry_rip) {
                Ok(host) => {
                    self.l1.fill(self.engine.lookup_cache(), entry_rip, host);
                    compiled = true;
                }
                Err(CompileError::Frontend { addr, reason }) => {
                    tracing::debug!(addr, %reason, "guest address is unexecutable");
                    return StepOutcome::Exit(ExitReason::Unexecutable(addr));
                }
                Err(err) => {
                    tracing::warn!(rip = entry_rip, %err, "compilation failed");
                    return StepOutcome::Exit(ExitReason::CompileFailed(err));
                }
            }
        };

        let exit = self.executor.execute(host, self.state);
        self.thread().dispatcher_in_block.store(0, Ordering::Release);

        match exit {
            BlockExit::Continue => {}
            BlockExit::Exit => return StepOutcome::Exit(ExitReason::Exited),
            BlockExit::Stopped => return StepOutcome::Exit(ExitReason::Stopped),
        }
        if self.single_step || self.thread().run_state() == RunState::Stopped {
            if let Some(reason) = self.check_run_state() {
                return StepOutcome::Exit(reason);
            }
        }
        StepOutcome::Block {
            entry_rip,
            next_rip: self.cpu().rip,
            host,
            compiled,
        }
    }

    /// Runs blocks until the thread leaves the loop.
    pub fn run(&mut self) -> ExitReason {
        if let Some(reason) = self.check_run_state() {
            return reason;
        }
        loop {
            if let StepOutcome::Exit(reason) = self.step() {
                return reason;
            }
        }
    }

    /// Runs at most `blocks` blocks. Returns the exit reason if the loop ended early.
    pub fn run_blocks(&mut self, mut blocks: u64) -> Option<ExitReason> {
        while blocks > 0 {
            match self.step() {
                StepOutcome::Block { .. } => blocks -= 1,
                StepOutcome::Exit(reason) => return Some(reason),
            }
        }
        None
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let thread = self.thread();
        thread.detach();
        if signal::current_thread() == self.state.as_ptr() {
            // SAFETY: clearing the pointer is always valid.
            unsafe { signal::set_current_thread(std::ptr::null_mut()) };
        }
        // SAFETY: the pointer came from `register_thread` and is not used after this.
        unsafe { self.engine.unregister_thread(self.state) };
    }
}
