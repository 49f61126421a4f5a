//! Per guest thread state shared with generated code.
//!
//! Generated code reaches every field here through the state register, so the `#[repr(C)]`
//! prefix up to and including `dispatcher_in_block` is a binary contract. The `*_OFFSET`
//! constants are what code generators and unwind descriptors use; tests pin them against the
//! Rust layout.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use xlat_ir::context::GUEST_STATE_SIZE;
use xlat_ir::GuestCpuState;

use crate::signal::{BackupStack, IdleCounter, RunState, SignalReason};

#[derive(Debug)]
#[repr(C)]
pub struct ThreadState {
    pub cpu: GuestCpuState,
    /// Host stack location published by the block-entry trampoline, holding the return address
    /// into its epilogue. Zero outside generated code. A stop request unwinds to it, and
    /// unwinders find the caller's frame through it.
    pub returning_stack_location: u64,
    signal_reason: AtomicU32,
    /// Pause handlers currently running on this thread. Code buffers are only freed while this
    /// is zero on every thread.
    pub signal_handler_refcount: AtomicU32,
    run_state: AtomicU32,
    /// Non-zero while the dispatcher is executing a block.
    pub dispatcher_in_block: AtomicU32,

    thread_id: u32,
    sleeping: AtomicBool,
    host_thread: AtomicU64,
    attached: AtomicBool,
    pub(crate) backups: BackupStack,
    idle: Arc<IdleCounter>,
}

impl ThreadState {
    pub const CPU_OFFSET: usize = 0;
    pub const RETURNING_STACK_LOCATION_OFFSET: usize = GUEST_STATE_SIZE as usize;
    pub const SIGNAL_REASON_OFFSET: usize = Self::RETURNING_STACK_LOCATION_OFFSET + 8;
    pub const SIGNAL_HANDLER_REFCOUNT_OFFSET: usize = Self::SIGNAL_REASON_OFFSET + 4;
    pub const RUN_STATE_OFFSET: usize = Self::SIGNAL_HANDLER_REFCOUNT_OFFSET + 4;
    pub const DISPATCHER_IN_BLOCK_OFFSET: usize = Self::RUN_STATE_OFFSET + 4;

    pub fn new(thread_id: u32, idle: Arc<IdleCounter>) -> Box<Self> {
        Box::new(Self {
            cpu: GuestCpuState::default(),
            returning_stack_location: 0,
            signal_reason: AtomicU32::new(SignalReason::None as u32),
            signal_handler_refcount: AtomicU32::new(0),
            run_state: AtomicU32::new(RunState::Running as u32),
            dispatcher_in_block: AtomicU32::new(0),
            thread_id,
            sleeping: AtomicBool::new(false),
            host_thread: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            backups: BackupStack::new(),
            idle,
        })
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn idle(&self) -> &Arc<IdleCounter> {
        &self.idle
    }

    #[inline]
    pub fn signal_reason(&self) -> SignalReason {
        SignalReason::from_u32(self.signal_reason.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_signal_reason(&self, reason: SignalReason) {
        self.signal_reason.store(reason as u32, Ordering::Release);
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        RunState::from_u32(self.run_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u32, Ordering::Release);
    }

    /// Moves `from` to `to` if the thread is still in `from`.
    pub fn transition(&self, from: RunState, to: RunState) -> bool {
        self.run_state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    pub fn nested_signals(&self) -> usize {
        self.backups.len()
    }

    /// Records the calling host thread as the target of pause/stop/return signals.
    pub fn attach_current_thread(&self) {
        // SAFETY: pthread_self has no preconditions.
        let me = unsafe { libc::pthread_self() };
        self.host_thread.store(me as u64, Ordering::Release);
        self.attached.store(true, Ordering::Release);
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub(crate) fn host_thread(&self) -> Option<libc::pthread_t> {
        self.attached
            .load(Ordering::Acquire)
            .then(|| self.host_thread.load(Ordering::Acquire) as libc::pthread_t)
    }

    /// Whether this thread could still be running code from a retired buffer.
    pub fn may_reference_code(&self) -> bool {
        self.signal_handler_refcount.load(Ordering::Acquire) != 0
            || self.dispatcher_in_block.load(Ordering::Acquire) != 0
    }
}
