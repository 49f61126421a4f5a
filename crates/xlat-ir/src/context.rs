//! Guest register file layout.
//!
//! Context loads and stores address the guest register file by byte offset. The offsets here are a
//! binary contract with every generated code buffer, so they are pinned with compile-time
//! assertions and checked against the Rust layout in tests.

pub const GPR_COUNT: usize = 16;
pub const XMM_COUNT: usize = 16;
pub const FLAG_COUNT: usize = 32;

pub const RIP_OFFSET: u32 = 0;
pub const GPR_OFFSET: u32 = 8;
pub const FS_BASE_OFFSET: u32 = GPR_OFFSET + (GPR_COUNT as u32) * 8;
pub const XMM_OFFSET: u32 = FS_BASE_OFFSET + 8;
pub const FLAGS_OFFSET: u32 = XMM_OFFSET + (XMM_COUNT as u32) * 16;
pub const GUEST_STATE_SIZE: u32 = FLAGS_OFFSET + FLAG_COUNT as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct GuestCpuState {
    pub rip: u64,
    pub gregs: [u64; GPR_COUNT],
    pub fs_base: u64,
    pub xmm: [[u64; 2]; XMM_COUNT],
    pub flags: [u8; FLAG_COUNT],
}

impl Default for GuestCpuState {
    fn default() -> Self {
        Self {
            rip: 0,
            gregs: [0; GPR_COUNT],
            fs_base: 0,
            xmm: [[0; 2]; XMM_COUNT],
            flags: [0; FLAG_COUNT],
        }
    }
}

const _: () = {
    assert!(XMM_OFFSET % 16 == 0);
    assert!(core::mem::size_of::<GuestCpuState>() == GUEST_STATE_SIZE as usize);
    assert!(core::mem::size_of::<GuestCpuState>() % 16 == 0);
};

#[inline]
pub const fn gpr_offset(reg: usize) -> u32 {
    GPR_OFFSET + (reg as u32) * 8
}

#[inline]
pub const fn xmm_offset(reg: usize) -> u32 {
    XMM_OFFSET + (reg as u32) * 16
}

/// A named, fixed-size slice of the guest register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextMember {
    pub offset: u32,
    pub size: u8,
}

/// Locates the register file member containing `offset`.
///
/// Flags are not covered here: they are accessed through `LoadFlag`/`StoreFlag` by index.
pub fn member_at(offset: u32) -> Option<(usize, ContextMember)> {
    if offset < GPR_OFFSET {
        return Some((
            0,
            ContextMember {
                offset: RIP_OFFSET,
                size: 8,
            },
        ));
    }
    if offset < FS_BASE_OFFSET {
        let reg = ((offset - GPR_OFFSET) / 8) as usize;
        return Some((
            1 + reg,
            ContextMember {
                offset: gpr_offset(reg),
                size: 8,
            },
        ));
    }
    if offset < XMM_OFFSET {
        return Some((
            1 + GPR_COUNT,
            ContextMember {
                offset: FS_BASE_OFFSET,
                size: 8,
            },
        ));
    }
    if offset < FLAGS_OFFSET {
        let reg = ((offset - XMM_OFFSET) / 16) as usize;
        return Some((
            2 + GPR_COUNT + reg,
            ContextMember {
                offset: xmm_offset(reg),
                size: 16,
            },
        ));
    }
    None
}

/// Number of distinct members [`member_at`] can return.
pub const MEMBER_COUNT: usize = 2 + GPR_COUNT + XMM_COUNT;

/// Indices of every member that `[offset, offset + size)` touches, in offset order.
pub fn members_overlapping(offset: u32, size: u8) -> impl Iterator<Item = usize> {
    let end = offset.saturating_add(u32::from(size.max(1)));
    let mut pos = offset;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let (idx, member) = member_at(pos)?;
        pos = member.offset + u32::from(member.size);
        Some(idx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn guest_state_offsets_match_layout() {
        assert_eq!(offset_of!(GuestCpuState, rip), RIP_OFFSET as usize);
        assert_eq!(offset_of!(GuestCpuState, gregs), GPR_OFFSET as usize);
        assert_eq!(offset_of!(GuestCpuState, fs_base), FS_BASE_OFFSET as usize);
        assert_eq!(offset_of!(GuestCpuState, xmm), XMM_OFFSET as usize);
        assert_eq!(offset_of!(GuestCpuState, flags), FLAGS_OFFSET as usize);
    }

    #[test]
    fn member_lookup_covers_every_register() {
        for reg in 0..GPR_COUNT {
            let (idx, member) = member_at(gpr_offset(reg) + 3).unwrap();
            assert_eq!(idx, 1 + reg);
            assert_eq!(member.offset, gpr_offset(reg));
        }
        for reg in 0..XMM_COUNT {
            let (idx, member) = member_at(xmm_offset(reg) + 8).unwrap();
            assert_eq!(idx, 2 + GPR_COUNT + reg);
            assert_eq!(member.size, 16);
        }
        assert!(member_at(FLAGS_OFFSET).is_none());
    }

    #[test]
    fn wide_access_touches_every_member_it_spans() {
        let touched: Vec<usize> = members_overlapping(gpr_offset(0), 16).collect();
        assert_eq!(touched, vec![1, 2]);
        let touched: Vec<usize> = members_overlapping(gpr_offset(3) + 4, 8).collect();
        assert_eq!(touched, vec![4, 5]);
        let touched: Vec<usize> = members_overlapping(gpr_offset(15), 16).collect();
        assert_eq!(touched, vec![16, 1 + GPR_COUNT]);
        assert_eq!(members_overlapping(xmm_offset(2), 16).count(), 1);
        assert_eq!(members_overlapping(FLAGS_OFFSET, 4).count(), 0);
    }
}
