//! Arena-backed IR storage.
//!
//! An [`IrContainer`] owns two arenas:
//! - the *list* arena: one fixed-size [`ListNode`] per node, carrying program-order links and the
//!   use count;
//! - the *data* arena: a byte buffer of variable-size op payloads, addressed by [`DataOffset`].
//!
//! Node 0 is always the [`Opcode::IrHeader`]. Blocks are [`Opcode::CodeBlock`] nodes chained from
//! the header; each block's code is a doubly linked run from its `BeginBlock` to its `EndBlock`.
//! Removing a node unlinks it but leaves its arena slots behind; compaction rebuilds dense arenas.

use std::ops::Deref;

use crate::error::{IrError, Result};
use crate::node::{DataOffset, NodeId, Opcode, RegisterClass, OP_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListNode {
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub data: DataOffset,
    pub uses: u32,
}

/// Byte size of one serialized list node (`prev`, `next`, `data`, `uses`).
pub const LIST_NODE_STRIDE: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrContainer {
    pub(crate) list: Vec<ListNode>,
    pub(crate) data: Vec<u8>,
}

/// Decoded view of a node's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub first_block: Option<NodeId>,
    pub guest_rip: u64,
    pub block_count: u32,
}

/// Decoded view of a `CodeBlock` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub begin: Option<NodeId>,
    pub last: Option<NodeId>,
    pub next: Option<NodeId>,
}

/// Borrowed payload of one op.
#[derive(Clone, Copy)]
pub struct OpRef<'a> {
    opcode: Opcode,
    bytes: &'a [u8],
}

impl<'a> OpRef<'a> {
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Result size in bytes.
    #[inline]
    pub fn size(&self) -> u8 {
        self.bytes[1]
    }

    #[inline]
    pub fn elem_size(&self) -> u8 {
        self.bytes[2]
    }

    #[inline]
    pub fn has_dest(&self) -> bool {
        self.opcode.has_dest()
    }

    #[inline]
    pub fn has_side_effects(&self) -> bool {
        self.opcode.has_side_effects()
    }

    #[inline]
    pub fn num_args(&self) -> usize {
        self.opcode.info().args as usize
    }

    pub fn arg(&self, idx: usize) -> NodeId {
        debug_assert!(idx < self.num_args());
        let at = OP_HEADER_LEN + idx * 4;
        NodeId(read_u32(self.bytes, at))
    }

    pub fn args(&self) -> impl Iterator<Item = NodeId> + 'a {
        let this = *self;
        (0..this.num_args()).map(move |i| this.arg(i))
    }

    pub fn num_imms(&self) -> usize {
        self.opcode.info().imms as usize
    }

    pub fn imm(&self, idx: usize) -> u64 {
        debug_assert!(idx < self.num_imms());
        let at = OP_HEADER_LEN + self.num_args() * 4 + idx * 8;
        read_u64(self.bytes, at)
    }

    /// Register class of the value this op defines, if any.
    pub fn dest_class(&self) -> Option<RegisterClass> {
        if !self.has_dest() {
            return None;
        }
        Some(match self.opcode {
            Opcode::LoadContext | Opcode::LoadMem => {
                RegisterClass::from_u8(self.imm(self.num_imms() - 1) as u8)
                    .unwrap_or(RegisterClass::General)
            }
            Opcode::LoadContextIndexed => {
                RegisterClass::from_u8(self.imm(2) as u8).unwrap_or(RegisterClass::General)
            }
            Opcode::VAdd | Opcode::VXor => RegisterClass::Float,
            Opcode::CreateElementPair | Opcode::CasPair => RegisterClass::GeneralPair,
            _ => RegisterClass::General,
        })
    }

    /// Context offset accessed by `LoadContext`/`StoreContext`.
    pub fn context_offset(&self) -> Option<u32> {
        match self.opcode {
            Opcode::LoadContext | Opcode::StoreContext => Some(self.imm(0) as u32),
            _ => None,
        }
    }

    /// Flag index accessed by `LoadFlag`/`StoreFlag`.
    pub fn flag(&self) -> Option<u32> {
        match self.opcode {
            Opcode::LoadFlag | Opcode::StoreFlag => Some(self.imm(0) as u32),
            _ => None,
        }
    }
}

impl std::fmt::Debug for OpRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct(self.opcode.name());
        s.field("size", &self.size());
        if self.num_args() > 0 {
            s.field("args", &self.args().collect::<Vec<_>>());
        }
        if self.num_imms() > 0 {
            s.field(
                "imms",
                &(0..self.num_imms()).map(|i| self.imm(i)).collect::<Vec<_>>(),
            );
        }
        s.finish()
    }
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl IrContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes ever allocated, including removed ones.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.list.len()
    }

    pub fn op(&self, node: NodeId) -> OpRef<'_> {
        let off = self.list[node.index()].data.0 as usize;
        let Some(opcode) = Opcode::from_u8(self.data[off]) else {
            panic!("corrupt data arena: bad opcode byte {:#x} for {node}", self.data[off]);
        };
        OpRef {
            opcode,
            bytes: &self.data[off..off + opcode.encoded_len()],
        }
    }

    #[inline]
    pub fn uses(&self, node: NodeId) -> u32 {
        self.list[node.index()].uses
    }

    #[inline]
    pub fn next(&self, node: NodeId) -> Option<NodeId> {
        self.list[node.index()].next
    }

    #[inline]
    pub fn prev(&self, node: NodeId) -> Option<NodeId> {
        self.list[node.index()].prev
    }

    pub fn header(&self) -> Result<Header> {
        if self.list.is_empty() {
            return Err(IrError::Corrupt("container has no header"));
        }
        let op = self.op(NodeId::HEADER);
        if op.opcode() != Opcode::IrHeader {
            return Err(IrError::UnexpectedNode {
                node: NodeId::HEADER,
                expected: "IrHeader",
            });
        }
        Ok(Header {
            first_block: NodeId::from_raw(op.imm(0) as u32),
            guest_rip: op.imm(1),
            block_count: op.imm(2) as u32,
        })
    }

    pub fn block(&self, block: NodeId) -> Result<BlockInfo> {
        let op = self.op(block);
        if op.opcode() != Opcode::CodeBlock {
            return Err(IrError::UnexpectedNode {
                node: block,
                expected: "CodeBlock",
            });
        }
        Ok(BlockInfo {
            begin: NodeId::from_raw(op.imm(0) as u32),
            last: NodeId::from_raw(op.imm(1) as u32),
            next: NodeId::from_raw(op.imm(2) as u32),
        })
    }

    /// Block nodes in layout order.
    pub fn blocks(&self) -> Blocks<'_> {
        let next = self.header().ok().and_then(|h| h.first_block);
        Blocks { ir: self, next }
    }

    /// Code nodes of `block`, from `BeginBlock` to `EndBlock` inclusive.
    pub fn code(&self, block: NodeId) -> Code<'_> {
        let (next, last) = match self.block(block) {
            Ok(info) => (info.begin, info.last),
            Err(_) => (None, None),
        };
        Code {
            ir: self,
            next,
            last,
        }
    }

    /// Every code node paired with its block, in layout order.
    pub fn all_code(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.blocks()
            .flat_map(move |block| self.code(block).map(move |node| (block, node)))
    }

    /// Number of nodes still reachable from the header.
    pub fn live_node_count(&self) -> usize {
        1 + self.blocks().count() + self.all_code().count()
    }

    /// Read-only view handed to passes and consumers.
    #[inline]
    pub fn view(&self) -> IrView<'_> {
        IrView { ir: self }
    }

    // ---- Mutation ---------------------------------------------------------------------------

    /// Appends an unlinked node. Operand use counts are bumped when `count_uses` is set.
    pub(crate) fn push_node(
        &mut self,
        opcode: Opcode,
        size: u8,
        elem_size: u8,
        args: &[NodeId],
        imms: &[u64],
        count_uses: bool,
    ) -> NodeId {
        let info = opcode.info();
        debug_assert_eq!(args.len(), info.args as usize, "{} operand count", info.name);
        debug_assert_eq!(imms.len(), info.imms as usize, "{} immediate count", info.name);

        let id = NodeId(self.list.len() as u32);
        let off = DataOffset(self.data.len() as u32);
        self.data.reserve(opcode.encoded_len());
        self.data.extend_from_slice(&[opcode as u8, size, elem_size, 0]);
        for arg in args {
            self.data.extend_from_slice(&arg.0.to_le_bytes());
        }
        for imm in imms {
            self.data.extend_from_slice(&imm.to_le_bytes());
        }
        self.list.push(ListNode {
            prev: None,
            next: None,
            data: off,
            uses: 0,
        });
        if count_uses {
            for arg in args {
                if let Some(node) = self.list.get_mut(arg.index()) {
                    node.uses += 1;
                }
            }
        }
        id
    }

    fn imm_slot(&self, node: NodeId, idx: usize) -> usize {
        let op = self.op(node);
        self.list[node.index()].data.0 as usize + OP_HEADER_LEN + op.num_args() * 4 + idx * 8
    }

    pub(crate) fn set_imm(&mut self, node: NodeId, idx: usize, value: u64) {
        let at = self.imm_slot(node, idx);
        self.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn set_imm_node(&mut self, node: NodeId, idx: usize, value: Option<NodeId>) {
        let raw = value.map_or(NodeId::NONE_RAW, |n| n.0);
        self.set_imm(node, idx, u64::from(raw));
    }

    pub(crate) fn set_header(&mut self, header: Header) {
        self.set_imm_node(NodeId::HEADER, 0, header.first_block);
        self.set_imm(NodeId::HEADER, 1, header.guest_rip);
        self.set_imm(NodeId::HEADER, 2, u64::from(header.block_count));
    }

    pub(crate) fn set_block(&mut self, block: NodeId, info: BlockInfo) {
        self.set_imm_node(block, 0, info.begin);
        self.set_imm_node(block, 1, info.last);
        self.set_imm_node(block, 2, info.next);
    }

    /// Rewrites operand `idx` of `node`, keeping use counts consistent.
    pub fn set_arg(&mut self, node: NodeId, idx: usize, new: NodeId) {
        let old = self.op(node).arg(idx);
        if old == new {
            return;
        }
        let at = self.list[node.index()].data.0 as usize + OP_HEADER_LEN + idx * 4;
        self.data[at..at + 4].copy_from_slice(&new.0.to_le_bytes());
        if let Some(n) = self.list.get_mut(old.index()) {
            n.uses = n.uses.saturating_sub(1);
        }
        if let Some(n) = self.list.get_mut(new.index()) {
            n.uses += 1;
        }
    }

    /// Links `node` directly after `after` in program order.
    pub(crate) fn link_after(&mut self, after: NodeId, node: NodeId) {
        let next = self.list[after.index()].next;
        self.list[node.index()].prev = Some(after);
        self.list[node.index()].next = next;
        self.list[after.index()].next = Some(node);
        if let Some(next) = next {
            self.list[next.index()].prev = Some(node);
        }
    }

    /// Unlinks `node` from its block and releases its operand uses.
    ///
    /// The node's arena slots stay allocated until the next compaction. Removing a node that still
    /// has uses leaves dangling references behind, which compaction reports as an error.
    pub fn remove(&mut self, block: NodeId, node: NodeId) -> Result<()> {
        let mut info = self.block(block)?;
        let ListNode { prev, next, .. } = self.list[node.index()];
        if let Some(prev) = prev {
            self.list[prev.index()].next = next;
        }
        if let Some(next) = next {
            self.list[next.index()].prev = prev;
        }
        if info.begin == Some(node) {
            info.begin = next;
        }
        if info.last == Some(node) {
            info.last = prev;
        }
        self.set_block(block, info);

        self.list[node.index()].prev = None;
        self.list[node.index()].next = None;
        let args: Vec<NodeId> = self.op(node).args().collect();
        for arg in args {
            if let Some(n) = self.list.get_mut(arg.index()) {
                n.uses = n.uses.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Points every linked operand that references `old` at `new` instead.
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) {
        if self.uses(old) == 0 {
            return;
        }
        let users: Vec<NodeId> = self
            .all_code()
            .map(|(_, node)| node)
            .filter(|&node| self.op(node).args().any(|a| a == old))
            .collect();
        for user in users {
            let n = self.op(user).num_args();
            for idx in 0..n {
                if self.op(user).arg(idx) == old {
                    self.set_arg(user, idx, new);
                }
            }
        }
    }

    /// Recomputes use counts from the operands of every linked node.
    pub(crate) fn recompute_uses(&mut self) {
        for node in &mut self.list {
            node.uses = 0;
        }
        let refs: Vec<NodeId> = self
            .all_code()
            .flat_map(|(_, node)| self.op(node).args().collect::<Vec<_>>())
            .collect();
        for arg in refs {
            if let Some(n) = self.list.get_mut(arg.index()) {
                n.uses += 1;
            }
        }
    }
}

/// Read-only borrow of an [`IrContainer`].
#[derive(Clone, Copy)]
pub struct IrView<'a> {
    ir: &'a IrContainer,
}

impl<'a> IrView<'a> {
    pub fn container(&self) -> &'a IrContainer {
        self.ir
    }
}

impl Deref for IrView<'_> {
    type Target = IrContainer;

    fn deref(&self) -> &IrContainer {
        self.ir
    }
}

pub struct Blocks<'a> {
    ir: &'a IrContainer,
    next: Option<NodeId>,
}

impl Iterator for Blocks<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.ir.block(cur).ok().and_then(|b| b.next);
        Some(cur)
    }
}

pub struct Code<'a> {
    ir: &'a IrContainer,
    next: Option<NodeId>,
    last: Option<NodeId>,
}

impl Iterator for Code<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = if Some(cur) == self.last {
            None
        } else {
            self.ir.next(cur)
        };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IrBuilder;

    #[test]
    fn remove_releases_operand_uses() {
        let mut b = IrBuilder::new(0x1000);
        let c = b.constant(8, 7);
        let store = b.store_context(8, RegisterClass::General, 8, c);
        b.exit_function(c);
        b.end_block(4);
        let entry = b.entry_block();
        let mut ir = b.finish();

        assert_eq!(ir.uses(c), 2);
        ir.remove(entry, store).unwrap();
        assert_eq!(ir.uses(c), 1);
        assert!(ir.code(entry).all(|n| n != store));
    }

    #[test]
    fn replace_all_uses_moves_counts() {
        let mut b = IrBuilder::new(0);
        let a = b.constant(8, 1);
        let c = b.constant(8, 1);
        let sum = b.add(8, c, c);
        b.exit_function(sum);
        b.end_block(1);
        let mut ir = b.finish();

        ir.replace_all_uses_with(c, a);
        assert_eq!(ir.uses(c), 0);
        assert_eq!(ir.uses(a), 2);
        assert_eq!(ir.op(sum).arg(0), a);
        assert_eq!(ir.op(sum).arg(1), a);
    }
}
