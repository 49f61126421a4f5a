//! Host signal plumbing: handler installation, request delivery, and `ucontext_t` access.

use std::cell::Cell;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::error::SignalError;
use crate::thread_state::ThreadState;

use super::{handle_signal_pause, DispatcherEntries, HostContext, HostRegisterFile, RunState, SignalReason};

/// Signal number of the installed pause handler, or 0.
pub static PAUSE_SIGNAL: AtomicI32 = AtomicI32::new(0);

static LOOP_TOP: AtomicU64 = AtomicU64::new(0);
static PAUSE_HANDLER: AtomicU64 = AtomicU64::new(0);
static STOP_HANDLER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<*mut ThreadState> = const { Cell::new(ptr::null_mut()) };
}

/// Makes `thread` the target of pause signals arriving on the calling host thread. Pass null to
/// clear.
///
/// # Safety
///
/// `thread` must stay valid until it is cleared again, and must not be accessed by other threads
/// while a signal may be handled on this one.
pub unsafe fn set_current_thread(thread: *mut ThreadState) {
    CURRENT.with(|c| c.set(thread));
}

pub fn current_thread() -> *mut ThreadState {
    CURRENT.with(|c| c.get())
}

fn entries() -> DispatcherEntries {
    DispatcherEntries {
        loop_top: LOOP_TOP.load(Ordering::Acquire),
        pause_handler: PAUSE_HANDLER.load(Ordering::Acquire),
        stop_handler: STOP_HANDLER.load(Ordering::Acquire),
    }
}

/// Installs the process-wide pause handler on `signal`.
pub fn install_pause_handler(signal: i32, entries: DispatcherEntries) -> Result<(), SignalError> {
    LOOP_TOP.store(entries.loop_top, Ordering::Release);
    PAUSE_HANDLER.store(entries.pause_handler, Ordering::Release);
    STOP_HANDLER.store(entries.stop_handler, Ordering::Release);

    // SAFETY: a zeroed sigaction is a valid starting value; every field we rely on is set below.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = pause_trampoline as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
    // SAFETY: `action.sa_mask` is a valid sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    // SAFETY: `action` is fully initialized and the handler is async-signal-safe.
    let rc = unsafe { libc::sigaction(signal, &action, ptr::null_mut()) };
    if rc != 0 {
        return Err(SignalError::Install {
            signal,
            source: io::Error::last_os_error(),
        });
    }
    PAUSE_SIGNAL.store(signal, Ordering::Release);
    tracing::debug!(signal, "installed pause handler");
    Ok(())
}

/// Installs the pause handler on `signal` with the trampolines in [`crate::entry`] as its
/// redirect targets.
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn install_native_pause_handler(signal: i32) -> Result<(), SignalError> {
    install_pause_handler(signal, DispatcherEntries::native())
}

extern "C" fn pause_trampoline(signal: libc::c_int, _info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    let thread = current_thread();
    if thread.is_null() || uctx.is_null() {
        return;
    }
    // SAFETY: the dispatcher registered `thread` for this host thread and the kernel passes a
    // valid ucontext_t.
    let (thread, ctx) = unsafe { (&mut *thread, &mut *(uctx as *mut libc::ucontext_t)) };
    let mut ctx = UContext(ctx);
    if let Err(err) = handle_signal_pause(thread, signal, &mut ctx, &entries()) {
        fatal(err.message());
    }
}

/// Writes `msg` to stderr and aborts without touching the allocator.
fn fatal(msg: &str) -> ! {
    const PREFIX: &[u8] = b"xlat: fatal: ";
    // SAFETY: write(2) and abort(3) are async-signal-safe; the buffers outlive the calls.
    unsafe {
        libc::write(2, PREFIX.as_ptr().cast(), PREFIX.len());
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::abort();
    }
}

/// How a request reached its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The pause signal was sent.
    Signal,
    /// No handler or host thread is attached; the dispatcher picks the request up at its next
    /// check.
    Cooperative,
}

fn deliver(thread: &ThreadState) -> Result<Delivery, SignalError> {
    let signal = PAUSE_SIGNAL.load(Ordering::Acquire);
    let Some(target) = thread.host_thread() else {
        return Ok(Delivery::Cooperative);
    };
    if signal == 0 {
        return Ok(Delivery::Cooperative);
    }
    // SAFETY: `target` was recorded by attach_current_thread and is detached before exit.
    let rc = unsafe { libc::pthread_kill(target, signal) };
    if rc != 0 {
        return Err(SignalError::Deliver(io::Error::from_raw_os_error(rc)));
    }
    Ok(Delivery::Signal)
}

pub fn request_pause(thread: &ThreadState) -> Result<Delivery, SignalError> {
    if !thread.transition(RunState::Running, RunState::PauseRequested) {
        return Ok(Delivery::Cooperative);
    }
    thread.set_signal_reason(SignalReason::Pause);
    deliver(thread)
}

/// Stops `thread`. Without signal delivery the dispatcher sees the stop at its next safe point.
pub fn request_stop(thread: &ThreadState) -> Result<Delivery, SignalError> {
    thread.set_signal_reason(SignalReason::Stop);
    let delivery = deliver(thread)?;
    if delivery == Delivery::Cooperative {
        thread.set_signal_reason(SignalReason::None);
        thread.set_run_state(RunState::Stopped);
    }
    Ok(delivery)
}

/// Resumes a paused thread at the context saved when it paused.
pub fn request_return(thread: &ThreadState) -> Result<Delivery, SignalError> {
    if thread.nested_signals() == 0 {
        super::resume_from_pause(thread);
        return Ok(Delivery::Cooperative);
    }
    thread.set_signal_reason(SignalReason::Return);
    deliver(thread)
}

struct UContext<'a>(&'a mut libc::ucontext_t);

fn save_sigmask(uc: &libc::ucontext_t, out: &mut [u64; 16]) {
    let len = std::mem::size_of::<libc::sigset_t>().min(std::mem::size_of_val(out));
    // SAFETY: both regions are at least `len` bytes and do not overlap.
    unsafe {
        ptr::copy_nonoverlapping(
            (&uc.uc_sigmask as *const libc::sigset_t).cast::<u8>(),
            out.as_mut_ptr().cast::<u8>(),
            len,
        )
    };
}

fn restore_sigmask(uc: &mut libc::ucontext_t, mask: &[u64; 16]) {
    let len = std::mem::size_of::<libc::sigset_t>().min(std::mem::size_of_val(mask));
    // SAFETY: both regions are at least `len` bytes and do not overlap.
    unsafe {
        ptr::copy_nonoverlapping(
            mask.as_ptr().cast::<u8>(),
            (&mut uc.uc_sigmask as *mut libc::sigset_t).cast::<u8>(),
            len,
        )
    };
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl HostContext for UContext<'_> {
    fn pc(&self) -> u64 {
        self.0.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }
    fn set_pc(&mut self, pc: u64) {
        self.0.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as i64;
    }
    fn sp(&self) -> u64 {
        self.0.uc_mcontext.gregs[libc::REG_RSP as usize] as u64
    }
    fn set_sp(&mut self, sp: u64) {
        self.0.uc_mcontext.gregs[libc::REG_RSP as usize] = sp as i64;
    }
    fn state(&self) -> u64 {
        self.0.uc_mcontext.gregs[libc::REG_R14 as usize] as u64
    }
    fn set_state(&mut self, state: u64) {
        self.0.uc_mcontext.gregs[libc::REG_R14 as usize] = state as i64;
    }

    fn save(&self) -> HostRegisterFile {
        let mut regs = HostRegisterFile::default();
        let gregs = &self.0.uc_mcontext.gregs;
        for (dst, src) in regs.gpr.iter_mut().zip(gregs.iter()) {
            *dst = *src as u64;
        }
        regs.pc = self.pc();
        regs.sp = self.sp();
        regs.flags = gregs[libc::REG_EFL as usize] as u64;
        let fp = self.0.uc_mcontext.fpregs;
        if !fp.is_null() {
            // SAFETY: the kernel points fpregs at the fxsave area of this signal frame.
            let xmm = unsafe { &(*fp)._xmm };
            for (dst, src) in regs.vector.iter_mut().zip(xmm.iter()) {
                let e = src.element;
                dst[0] = u64::from(e[0]) | (u64::from(e[1]) << 32);
                dst[1] = u64::from(e[2]) | (u64::from(e[3]) << 32);
            }
        }
        save_sigmask(self.0, &mut regs.sigmask);
        regs
    }

    fn restore(&mut self, regs: &HostRegisterFile) {
        let gregs = &mut self.0.uc_mcontext.gregs;
        for (dst, src) in gregs.iter_mut().zip(regs.gpr.iter()) {
            *dst = *src as i64;
        }
        gregs[libc::REG_RIP as usize] = regs.pc as i64;
        gregs[libc::REG_RSP as usize] = regs.sp as i64;
        gregs[libc::REG_EFL as usize] = regs.flags as i64;
        let fp = self.0.uc_mcontext.fpregs;
        if !fp.is_null() {
            // SAFETY: as in `save`.
            let xmm = unsafe { &mut (*fp)._xmm };
            for (dst, src) in xmm.iter_mut().zip(regs.vector.iter()) {
                dst.element = [
                    src[0] as u32,
                    (src[0] >> 32) as u32,
                    src[1] as u32,
                    (src[1] >> 32) as u32,
                ];
            }
        }
        restore_sigmask(self.0, &regs.sigmask);
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
impl HostContext for UContext<'_> {
    fn pc(&self) -> u64 {
        self.0.uc_mcontext.pc
    }
    fn set_pc(&mut self, pc: u64) {
        self.0.uc_mcontext.pc = pc;
    }
    fn sp(&self) -> u64 {
        self.0.uc_mcontext.sp
    }
    fn set_sp(&mut self, sp: u64) {
        self.0.uc_mcontext.sp = sp;
    }
    fn state(&self) -> u64 {
        self.0.uc_mcontext.regs[28]
    }
    fn set_state(&mut self, state: u64) {
        self.0.uc_mcontext.regs[28] = state;
    }

    fn save(&self) -> HostRegisterFile {
        let mut regs = HostRegisterFile::default();
        regs.gpr[..31].copy_from_slice(&self.0.uc_mcontext.regs);
        regs.pc = self.pc();
        regs.sp = self.sp();
        regs.flags = self.0.uc_mcontext.pstate;
        if !fpsimd::save(self.reserved(), &mut regs) {
            tracing::trace!("signal frame has no fpsimd record");
        }
        save_sigmask(self.0, &mut regs.sigmask);
        regs
    }

    fn restore(&mut self, regs: &HostRegisterFile) {
        self.0.uc_mcontext.regs.copy_from_slice(&regs.gpr[..31]);
        self.0.uc_mcontext.pc = regs.pc;
        self.0.uc_mcontext.sp = regs.sp;
        self.0.uc_mcontext.pstate = regs.flags;
        fpsimd::restore(self.reserved_mut(), regs);
        restore_sigmask(self.0, &regs.sigmask);
    }
}

/// Where the kernel's `sigcontext.__reserved` starts inside `mcontext_t`. The area is 16 byte
/// aligned, after `fault_address`, 31 GPRs, `sp`, `pc` and `pstate`.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const RESERVED_OFFSET: usize = 288;
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
const RESERVED_SIZE: usize = 4096;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
impl UContext<'_> {
    fn reserved(&self) -> &[u8] {
        let base = (&self.0.uc_mcontext as *const libc::mcontext_t).cast::<u8>();
        // SAFETY: the kernel's mcontext_t ends in a RESERVED_SIZE byte record area at
        // RESERVED_OFFSET, and the borrow of the context covers it.
        unsafe { std::slice::from_raw_parts(base.add(RESERVED_OFFSET), RESERVED_SIZE) }
    }

    fn reserved_mut(&mut self) -> &mut [u8] {
        let base = (&mut self.0.uc_mcontext as *mut libc::mcontext_t).cast::<u8>();
        // SAFETY: as in `reserved`; the mutable borrow of the context is exclusive.
        unsafe { std::slice::from_raw_parts_mut(base.add(RESERVED_OFFSET), RESERVED_SIZE) }
    }
}

/// The `fpsimd_context` record in an AArch64 signal frame.
///
/// The reserved area is a list of records, each starting with a `{magic: u32, size: u32}`
/// header and ending with an all-zero header. The FP/SIMD record holds FPSR, FPCR and the 32
/// 128-bit vector registers.
#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
mod fpsimd {
    use std::ops::Range;

    use super::HostRegisterFile;

    pub(super) const FPSIMD_MAGIC: u32 = 0x4650_8001;
    const HEADER_SIZE: usize = 8;
    const VREGS_OFFSET: usize = 16;
    pub(super) const RECORD_SIZE: usize = VREGS_OFFSET + 32 * 16;

    fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
        Some(u32::from_ne_bytes(buf.get(at..at + 4)?.try_into().ok()?))
    }

    fn read_u64(buf: &[u8], at: usize) -> u64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&buf[at..at + 8]);
        u64::from_ne_bytes(bytes)
    }

    /// Byte range of the first record tagged `magic`.
    pub(super) fn find_record(reserved: &[u8], magic: u32) -> Option<Range<usize>> {
        let mut at = 0usize;
        loop {
            let tag = read_u32(reserved, at)?;
            let size = read_u32(reserved, at + 4)? as usize;
            if tag == 0 || size < HEADER_SIZE {
                return None;
            }
            let end = at.checked_add(size)?;
            if end > reserved.len() {
                return None;
            }
            if tag == magic {
                return Some(at..end);
            }
            at = end;
        }
    }

    fn record(reserved: &[u8]) -> Option<Range<usize>> {
        find_record(reserved, FPSIMD_MAGIC).filter(|r| r.len() >= RECORD_SIZE)
    }

    pub(super) fn save(reserved: &[u8], regs: &mut HostRegisterFile) -> bool {
        let Some(range) = record(reserved) else {
            return false;
        };
        let rec = &reserved[range];
        let fpsr = read_u32(rec, HEADER_SIZE).unwrap_or(0);
        let fpcr = read_u32(rec, HEADER_SIZE + 4).unwrap_or(0);
        regs.fp_control = u64::from(fpsr) | (u64::from(fpcr) << 32);
        for (i, v) in regs.vector.iter_mut().enumerate() {
            let at = VREGS_OFFSET + i * 16;
            *v = [read_u64(rec, at), read_u64(rec, at + 8)];
        }
        true
    }

    pub(super) fn restore(reserved: &mut [u8], regs: &HostRegisterFile) -> bool {
        let Some(range) = record(reserved) else {
            return false;
        };
        let rec = &mut reserved[range];
        rec[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&(regs.fp_control as u32).to_ne_bytes());
        rec[HEADER_SIZE + 4..VREGS_OFFSET]
            .copy_from_slice(&((regs.fp_control >> 32) as u32).to_ne_bytes());
        for (i, v) in regs.vector.iter().enumerate() {
            let at = VREGS_OFFSET + i * 16;
            rec[at..at + 8].copy_from_slice(&v[0].to_ne_bytes());
            rec[at + 8..at + 16].copy_from_slice(&v[1].to_ne_bytes());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn requests_without_a_host_thread_are_cooperative() {
        let thread = ThreadState::new(3, Arc::default());
        assert_eq!(request_pause(&thread).unwrap(), Delivery::Cooperative);
        assert_eq!(thread.run_state(), RunState::PauseRequested);
        assert_eq!(thread.signal_reason(), SignalReason::Pause);

        // A second pause while one is pending changes nothing.
        thread.set_signal_reason(SignalReason::None);
        request_pause(&thread).unwrap();
        assert_eq!(thread.signal_reason(), SignalReason::None);

        thread.set_run_state(RunState::Pausing);
        assert_eq!(request_return(&thread).unwrap(), Delivery::Cooperative);
        assert_eq!(thread.run_state(), RunState::Running);

        request_stop(&thread).unwrap();
        assert_eq!(thread.signal_reason(), SignalReason::None);
        assert_eq!(thread.run_state(), RunState::Stopped);
    }

    fn push_record(buf: &mut Vec<u8>, magic: u32, size: usize) -> usize {
        let at = buf.len();
        buf.extend_from_slice(&magic.to_ne_bytes());
        buf.extend_from_slice(&(size as u32).to_ne_bytes());
        buf.resize(at + size, 0);
        at
    }

    fn frame_with_fpsimd() -> (Vec<u8>, usize) {
        let mut buf = Vec::new();
        // An unrelated record ahead of the FP/SIMD one.
        push_record(&mut buf, 0x4553_5201, 32);
        let at = push_record(&mut buf, fpsimd::FPSIMD_MAGIC, fpsimd::RECORD_SIZE);
        buf[at + 8..at + 12].copy_from_slice(&0x11u32.to_ne_bytes());
        buf[at + 12..at + 16].copy_from_slice(&0x22u32.to_ne_bytes());
        for i in 0..32u64 {
            let v = at + 16 + i as usize * 16;
            buf[v..v + 8].copy_from_slice(&i.to_ne_bytes());
            buf[v + 8..v + 16].copy_from_slice(&(!i).to_ne_bytes());
        }
        buf.resize(buf.len() + 8, 0);
        buf.resize(4096, 0xee);
        (buf, at)
    }

    #[test]
    fn fpsimd_record_is_found_past_other_records() {
        let (mut buf, at) = frame_with_fpsimd();
        let mut regs = HostRegisterFile::default();
        assert!(fpsimd::save(&buf, &mut regs));
        assert_eq!(regs.fp_control, 0x22_0000_0011);
        assert_eq!(regs.vector[0], [0, !0]);
        assert_eq!(regs.vector[31], [31, !31]);

        regs.vector[5] = [0xaaaa, 0xbbbb];
        regs.fp_control = 0x33_0000_0044;
        assert!(fpsimd::restore(&mut buf, &regs));
        let v5 = at + 16 + 5 * 16;
        assert_eq!(&buf[v5..v5 + 8], &0xaaaau64.to_ne_bytes());
        assert_eq!(&buf[v5 + 8..v5 + 16], &0xbbbbu64.to_ne_bytes());
        assert_eq!(&buf[at + 8..at + 12], &0x44u32.to_ne_bytes());
        assert_eq!(&buf[at + 12..at + 16], &0x33u32.to_ne_bytes());
        assert_eq!(&buf[..4], &0x4553_5201u32.to_ne_bytes(), "other records untouched");
    }

    #[test]
    fn walk_stops_at_the_terminator_and_bad_sizes() {
        let mut buf = Vec::new();
        push_record(&mut buf, 0x4553_5201, 32);
        buf.resize(64, 0);
        push_record(&mut buf, fpsimd::FPSIMD_MAGIC, fpsimd::RECORD_SIZE);
        assert_eq!(fpsimd::find_record(&buf, fpsimd::FPSIMD_MAGIC), None);

        let mut regs = HostRegisterFile::default();
        assert!(!fpsimd::save(&buf, &mut regs));
        assert_eq!(regs, HostRegisterFile::default());

        let mut overrun = Vec::new();
        push_record(&mut overrun, fpsimd::FPSIMD_MAGIC, 16);
        overrun[4..8].copy_from_slice(&4096u32.to_ne_bytes());
        assert_eq!(fpsimd::find_record(&overrun, fpsimd::FPSIMD_MAGIC), None);

        let mut short = Vec::new();
        push_record(&mut short, fpsimd::FPSIMD_MAGIC, 16);
        short.resize(64, 0);
        assert_eq!(fpsimd::find_record(&short, fpsimd::FPSIMD_MAGIC), Some(0..16));
        assert!(!fpsimd::save(&short, &mut regs), "record too small for the registers");
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn reserved_area_fits_in_mcontext() {
        assert!(std::mem::size_of::<libc::mcontext_t>() >= RESERVED_OFFSET + RESERVED_SIZE);
    }

    #[test]
    fn current_thread_is_per_host_thread() {
        let mut thread = ThreadState::new(4, Arc::default());
        let ptr: *mut ThreadState = &mut *thread;
        unsafe { set_current_thread(ptr) };
        assert_eq!(current_thread(), ptr);
        std::thread::spawn(|| assert!(current_thread().is_null()))
            .join()
            .unwrap();
        unsafe { set_current_thread(ptr::null_mut()) };
    }
}
