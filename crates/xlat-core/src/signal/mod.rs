//! Pause/stop/return handling for threads running translated code.
//!
//! A request is a [`SignalReason`] written into the target's [`ThreadState`] followed by the
//! pause signal. The handler ([`handle_signal_pause`]) is the only place that moves a thread
//! between [`RunState`]s while it runs generated code: it rewrites the interrupted context so
//! that returning from the signal lands in one of the dispatcher's fixed entry points.

mod host;

use std::sync::atomic::{AtomicU32, Ordering};

use xlat_ir::GuestCpuState;

use crate::thread_state::ThreadState;

pub use host::{
    current_thread, install_pause_handler, request_pause, request_return, request_stop,
    set_current_thread, Delivery, PAUSE_SIGNAL,
};
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use host::install_native_pause_handler;

/// Maximum depth of pause signals interrupting pause handlers.
pub const MAX_NESTED_SIGNALS: usize = 16;

pub const CONTEXT_BACKUP_COOKIE: u64 = 0x5854_4c41_4243_4b50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalReason {
    None = 0,
    Pause = 1,
    Stop = 2,
    Return = 3,
}

impl SignalReason {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => SignalReason::Pause,
            2 => SignalReason::Stop,
            3 => SignalReason::Return,
            _ => SignalReason::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    Running = 0,
    PauseRequested = 1,
    Pausing = 2,
    Stopped = 3,
}

impl RunState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => RunState::PauseRequested,
            2 => RunState::Pausing,
            3 => RunState::Stopped,
            _ => RunState::Running,
        }
    }
}

/// Host machine state captured from a signal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRegisterFile {
    pub gpr: [u64; 32],
    pub pc: u64,
    pub sp: u64,
    pub flags: u64,
    /// AArch64 FPSR in the low half and FPCR in the high half.
    pub fp_control: u64,
    pub vector: [[u64; 2]; 32],
    /// Blocked signal set active when the signal arrived.
    pub sigmask: [u64; 16],
}

impl Default for HostRegisterFile {
    fn default() -> Self {
        Self {
            gpr: [0; 32],
            pc: 0,
            sp: 0,
            flags: 0,
            fp_control: 0,
            vector: [[0; 2]; 32],
            sigmask: [0; 16],
        }
    }
}

/// Access to the machine context the kernel hands a signal handler.
pub trait HostContext {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, sp: u64);
    fn state(&self) -> u64;
    fn set_state(&mut self, state: u64);
    fn save(&self) -> HostRegisterFile;
    fn restore(&mut self, regs: &HostRegisterFile);
}

/// Fixed host addresses in the dispatcher that a handler may redirect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherEntries {
    pub loop_top: u64,
    pub pause_handler: u64,
    pub stop_handler: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBackup {
    cookie: u64,
    pub signal: i32,
    pub host: HostRegisterFile,
    pub guest: GuestCpuState,
}

impl ContextBackup {
    pub fn new(signal: i32, host: HostRegisterFile, guest: GuestCpuState) -> Self {
        Self {
            cookie: CONTEXT_BACKUP_COOKIE,
            signal,
            host,
            guest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupError {
    Overflow,
    Empty,
    CookieMismatch { found: u64 },
}

impl BackupError {
    pub fn message(&self) -> &'static str {
        match self {
            BackupError::Overflow => "too many nested pause signals",
            BackupError::Empty => "return requested with no saved context",
            BackupError::CookieMismatch { .. } => "saved signal context is corrupt",
        }
    }
}

/// Saved contexts of nested pause signals, innermost last.
///
/// Capacity is reserved up front so pushing from a signal handler never allocates.
#[derive(Debug)]
pub struct BackupStack {
    frames: Vec<ContextBackup>,
}

impl BackupStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(MAX_NESTED_SIGNALS),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, backup: ContextBackup) -> Result<(), BackupError> {
        if self.frames.len() >= MAX_NESTED_SIGNALS {
            return Err(BackupError::Overflow);
        }
        self.frames.push(backup);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<ContextBackup, BackupError> {
        let backup = self.frames.pop().ok_or(BackupError::Empty)?;
        if backup.cookie != CONTEXT_BACKUP_COOKIE {
            return Err(BackupError::CookieMismatch {
                found: backup.cookie,
            });
        }
        Ok(backup)
    }

    /// Drops every saved context. Used when the thread stops and will not return into them.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    #[cfg(test)]
    fn top_mut(&mut self) -> Option<&mut ContextBackup> {
        self.frames.last_mut()
    }
}

impl Default for BackupStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of attached guest threads that are not parked in a pause.
#[derive(Debug, Default)]
pub struct IdleCounter {
    running: AtomicU32,
}

impl IdleCounter {
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    pub fn enter(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn all_idle(&self) -> bool {
        self.running() == 0
    }
}

/// Parks `thread` at a pause point. The thread stops counting as running until
/// [`resume_from_pause`] is called.
pub fn enter_pause(thread: &ThreadState) {
    if !thread.is_sleeping() {
        thread.set_sleeping(true);
        thread.idle().leave();
    }
}

pub fn resume_from_pause(thread: &ThreadState) {
    if thread.is_sleeping() {
        thread.set_sleeping(false);
        thread.idle().enter();
    }
    thread.transition(RunState::Pausing, RunState::Running);
}

/// Handles the pause signal for `thread`. Returns `Ok(false)` when no request was pending and
/// the signal is not ours.
///
/// The context is only redirected while the thread is inside generated code, which is when its
/// `returning_stack_location` is set. Elsewhere a pause stays pending for the dispatcher's next
/// check and a stop only marks the thread stopped.
///
/// Errors mean the saved context stack is unusable; the caller must not return into guest code.
pub fn handle_signal_pause<C: HostContext>(
    thread: &mut ThreadState,
    signal: i32,
    ctx: &mut C,
    entries: &DispatcherEntries,
) -> Result<bool, BackupError> {
    let state_ptr = thread as *mut ThreadState as u64;
    let in_generated_code = thread.returning_stack_location != 0;
    match thread.signal_reason() {
        SignalReason::None => Ok(false),
        SignalReason::Pause if !in_generated_code => {
            thread.set_signal_reason(SignalReason::None);
            Ok(true)
        }
        SignalReason::Stop if !in_generated_code => {
            thread.backups.clear();
            thread.signal_handler_refcount.store(0, Ordering::Release);
            if thread.is_sleeping() {
                thread.set_sleeping(false);
                thread.idle().enter();
            }
            thread.set_run_state(RunState::Stopped);
            thread.set_signal_reason(SignalReason::None);
            Ok(true)
        }
        SignalReason::Pause => {
            thread
                .backups
                .push(ContextBackup::new(signal, ctx.save(), thread.cpu))?;
            ctx.set_pc(entries.pause_handler);
            ctx.set_state(state_ptr);
            thread
                .signal_handler_refcount
                .fetch_add(1, Ordering::AcqRel);
            if !thread.transition(RunState::PauseRequested, RunState::Pausing) {
                thread.set_run_state(RunState::Pausing);
            }
            thread.set_signal_reason(SignalReason::None);
            Ok(true)
        }
        SignalReason::Stop => {
            ctx.set_sp(thread.returning_stack_location);
            ctx.set_pc(entries.stop_handler);
            ctx.set_state(state_ptr);
            thread.backups.clear();
            thread.signal_handler_refcount.store(0, Ordering::Release);
            // A sleeping thread already left the running count; the stop path leaves it again.
            if thread.is_sleeping() {
                thread.set_sleeping(false);
                thread.idle().enter();
            }
            thread.set_run_state(RunState::Stopped);
            thread.set_signal_reason(SignalReason::None);
            Ok(true)
        }
        SignalReason::Return => {
            let backup = thread.backups.pop()?;
            thread.cpu = backup.guest;
            ctx.restore(&backup.host);
            let _ = thread.signal_handler_refcount.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |n| n.checked_sub(1),
            );
            if thread.backups.is_empty() {
                resume_from_pause(thread);
            }
            thread.set_signal_reason(SignalReason::None);
            Ok(true)
        }
    }
}
