//! Unwind descriptors for generated code.
//!
//! Every code buffer gets one `.eh_frame` blob: a CIE, a single FDE covering the whole buffer,
//! and the zero terminator. The CIE's initial rules say the canonical frame address is the value
//! stored at `state + RETURNING_STACK_LOCATION_OFFSET`, the return address sits at offset 0 from
//! it, and every callee-saved register is undefined. No per-block rules are emitted.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::thread_state::ThreadState;

const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_OP_DEREF: u8 = 0x06;
const DW_OP_BREG0: u8 = 0x70;
const DW_EH_PE_ABSPTR: u8 = 0x00;

/// DWARF register numbering and conventions of a host architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAbi {
    /// DWARF number of the register reserved for the thread state pointer.
    pub state_register: u8,
    pub return_address_column: u8,
    pub callee_saved: &'static [u8],
    pub code_alignment: u8,
    pub data_alignment: i8,
}

impl HostAbi {
    /// r14 holds the state pointer; column 16 is the return address.
    pub const X86_64: Self = Self {
        state_register: 14,
        return_address_column: 16,
        callee_saved: &[3, 6, 12, 13, 15],
        code_alignment: 1,
        data_alignment: -8,
    };

    /// x28 holds the state pointer; x30 is the link register.
    pub const AARCH64: Self = Self {
        state_register: 28,
        return_address_column: 30,
        callee_saved: &[19, 20, 21, 22, 23, 24, 25, 26, 27, 29],
        code_alignment: 4,
        data_alignment: -8,
    };

    #[cfg(target_arch = "aarch64")]
    pub const fn host() -> Self {
        Self::AARCH64
    }

    #[cfg(not(target_arch = "aarch64"))]
    pub const fn host() -> Self {
        Self::X86_64
    }
}

fn write_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Appends a length-prefixed record whose body is produced by `body`, padded with `DW_CFA_nop`
/// to pointer alignment. `body` receives the whole buffer and the record's start offset.
fn write_record(out: &mut Vec<u8>, body: impl FnOnce(&mut Vec<u8>, usize)) {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    body(out, start);
    while (out.len() - start) % 8 != 0 {
        out.push(DW_CFA_NOP);
    }
    let len = (out.len() - start - 4) as u32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

/// Builds the `.eh_frame` contents for a code buffer at `[code_start, code_start + code_len)`.
pub fn build_eh_frame(abi: &HostAbi, code_start: u64, code_len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);

    write_record(&mut out, |out, _| {
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(1);
        out.extend_from_slice(b"zR\0");
        write_uleb(out, u64::from(abi.code_alignment));
        write_sleb(out, i64::from(abi.data_alignment));
        out.push(abi.return_address_column);
        write_uleb(out, 1);
        out.push(DW_EH_PE_ABSPTR);

        let mut expr = Vec::with_capacity(8);
        expr.push(DW_OP_BREG0 + abi.state_register);
        write_sleb(&mut expr, ThreadState::RETURNING_STACK_LOCATION_OFFSET as i64);
        expr.push(DW_OP_DEREF);
        out.push(DW_CFA_DEF_CFA_EXPRESSION);
        write_uleb(out, expr.len() as u64);
        out.extend_from_slice(&expr);

        out.push(DW_CFA_OFFSET | abi.return_address_column);
        write_uleb(out, 0);

        for &reg in abi.callee_saved {
            out.push(DW_CFA_UNDEFINED);
            write_uleb(out, u64::from(reg));
        }
    });

    write_record(&mut out, |out, start| {
        // CIE pointer: distance from this field back to the CIE.
        let cie_pointer = (start + 4) as u32;
        out.extend_from_slice(&cie_pointer.to_le_bytes());
        out.extend_from_slice(&code_start.to_le_bytes());
        out.extend_from_slice(&code_len.to_le_bytes());
        write_uleb(out, 0);
    });

    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Where unwind descriptors are announced.
pub trait UnwindRegistry: Send + Sync {
    /// `frame` stays alive and unmoved until the matching `deregister`.
    fn register(&self, frame: &[u8]);
    fn deregister(&self, frame: &[u8]);
}

/// Counts registrations without telling anyone.
#[derive(Debug, Default)]
pub struct NullUnwindRegistry {
    registered: AtomicUsize,
    deregistered: AtomicUsize,
}

impl NullUnwindRegistry {
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    pub fn deregistered(&self) -> usize {
        self.deregistered.load(Ordering::Acquire)
    }

    pub fn live(&self) -> usize {
        self.registered().saturating_sub(self.deregistered())
    }
}

impl UnwindRegistry for NullUnwindRegistry {
    fn register(&self, _frame: &[u8]) {
        self.registered.fetch_add(1, Ordering::AcqRel);
    }

    fn deregister(&self, _frame: &[u8]) {
        self.deregistered.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    fn __register_frame(begin: *const u8);
    fn __deregister_frame(begin: *const u8);
}

/// Registers descriptors with the unwinder of the host C runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostUnwindRegistry;

impl UnwindRegistry for HostUnwindRegistry {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn register(&self, frame: &[u8]) {
        // SAFETY: `frame` is a terminated .eh_frame section that outlives the registration.
        unsafe { __register_frame(frame.as_ptr()) }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn deregister(&self, frame: &[u8]) {
        // SAFETY: `frame` was passed to `register` and has not moved.
        unsafe { __deregister_frame(frame.as_ptr()) }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn register(&self, _frame: &[u8]) {
        tracing::debug!("no host unwinder registration on this target");
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn deregister(&self, _frame: &[u8]) {}
}
