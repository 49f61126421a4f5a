//! Flat byte encoding of an [`IrContainer`], used by the AOT cache.
//!
//! Layout (little endian):
//! `node_count:u32, data_len:u32, {prev:u32, next:u32, data:u32, uses:u32}*node_count, data`.
//! Missing links are encoded as `u32::MAX`.

use crate::container::{IrContainer, ListNode, LIST_NODE_STRIDE};
use crate::error::{IrError, Result};
use crate::node::{DataOffset, NodeId, Opcode};

impl IrContainer {
    /// Number of bytes [`IrContainer::serialize_into`] appends.
    pub fn serialized_len(&self) -> usize {
        8 + self.list.len() * LIST_NODE_STRIDE + self.data.len()
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_len());
        out.extend_from_slice(&(self.list.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        for node in &self.list {
            let prev = node.prev.map_or(NodeId::NONE_RAW, |n| n.0);
            let next = node.next.map_or(NodeId::NONE_RAW, |n| n.0);
            out.extend_from_slice(&prev.to_le_bytes());
            out.extend_from_slice(&next.to_le_bytes());
            out.extend_from_slice(&node.data.0.to_le_bytes());
            out.extend_from_slice(&node.uses.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    /// Decodes a container, returning it with the number of bytes consumed.
    ///
    /// Every payload and link is bounds-checked so a damaged cache file cannot make later
    /// traversal panic or loop.
    pub fn deserialize(bytes: &[u8]) -> Result<(IrContainer, usize)> {
        let node_count = read_u32(bytes, 0)? as usize;
        let data_len = read_u32(bytes, 4)? as usize;
        let list_len = node_count
            .checked_mul(LIST_NODE_STRIDE)
            .ok_or(IrError::Corrupt("node count overflows"))?;
        let total = 8usize
            .checked_add(list_len)
            .and_then(|n| n.checked_add(data_len))
            .ok_or(IrError::Corrupt("length overflows"))?;
        if bytes.len() < total {
            return Err(IrError::Corrupt("truncated IR"));
        }
        if node_count == 0 {
            return Err(IrError::Corrupt("container has no header"));
        }

        let link = |raw: u32| -> Result<Option<NodeId>> {
            match NodeId::from_raw(raw) {
                Some(n) if n.index() >= node_count => Err(IrError::Corrupt("link out of range")),
                other => Ok(other),
            }
        };

        let mut list = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let at = 8 + i * LIST_NODE_STRIDE;
            list.push(ListNode {
                prev: link(read_u32(bytes, at)?)?,
                next: link(read_u32(bytes, at + 4)?)?,
                data: DataOffset(read_u32(bytes, at + 8)?),
                uses: read_u32(bytes, at + 12)?,
            });
        }
        let data = bytes[8 + list_len..total].to_vec();

        for node in &list {
            let off = node.data.0 as usize;
            let opcode = data
                .get(off)
                .and_then(|&raw| Opcode::from_u8(raw))
                .ok_or(IrError::Corrupt("invalid opcode"))?;
            if off + opcode.encoded_len() > data.len() {
                return Err(IrError::Corrupt("op payload out of range"));
            }
        }

        let ir = IrContainer { list, data };
        ir.check_references(node_count)?;
        Ok((ir, total))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<IrContainer> {
        Self::deserialize(bytes).map(|(ir, _)| ir)
    }

    fn check_references(&self, node_count: usize) -> Result<()> {
        let in_range = |n: NodeId| n.index() < node_count;
        for idx in 0..node_count {
            let op = self.op(NodeId(idx as u32));
            if !op.args().all(in_range) {
                return Err(IrError::Corrupt("operand out of range"));
            }
            let structural_imms: &[usize] = match op.opcode() {
                Opcode::IrHeader => &[0],
                Opcode::CodeBlock => &[0, 1, 2],
                Opcode::BeginBlock => &[0],
                _ => &[],
            };
            for &imm in structural_imms {
                if let Some(n) = NodeId::from_raw(op.imm(imm) as u32) {
                    if !in_range(n) {
                        return Err(IrError::Corrupt("structural link out of range"));
                    }
                }
            }
        }

        self.header()?;
        let mut steps = 0usize;
        for block in self.blocks() {
            self.block(block)?;
            for _ in self.code(block) {
                steps += 1;
                if steps > node_count {
                    return Err(IrError::Corrupt("cyclic code list"));
                }
            }
            steps += 1;
            if steps > node_count {
                return Err(IrError::Corrupt("cyclic block list"));
            }
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let raw = bytes
        .get(at..at + 4)
        .ok_or(IrError::Corrupt("truncated IR"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
