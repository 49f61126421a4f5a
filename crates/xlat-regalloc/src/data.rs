//! Allocation results and their flat encoding.
//!
//! Layout (little endian):
//! `node_count:u32, {class:u8, index:u8}*node_count, temp_count:u32, {node:u32, class:u8, index:u8}*temp_count`.
//! Nodes without a register use class `0xff`.

use xlat_ir::{AllocationView, NodeId, RegisterClass};

use crate::error::{RaDataError, Result};
use crate::inventory::PhysicalRegister;

const NO_CLASS: u8 = 0xff;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterAllocationData {
    regs: Vec<Option<PhysicalRegister>>,
    /// Instruction-local scratch registers, keyed by the node that needs them.
    temps: Vec<(NodeId, PhysicalRegister)>,
}

impl RegisterAllocationData {
    pub fn with_node_count(count: usize) -> Self {
        Self {
            regs: vec![None; count],
            temps: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.regs.len()
    }

    #[inline]
    pub fn get(&self, node: NodeId) -> Option<PhysicalRegister> {
        self.regs.get(node.index()).copied().flatten()
    }

    pub fn set(&mut self, node: NodeId, reg: PhysicalRegister) {
        if node.index() >= self.regs.len() {
            self.regs.resize(node.index() + 1, None);
        }
        self.regs[node.index()] = Some(reg);
    }

    pub fn temp(&self, node: NodeId) -> Option<PhysicalRegister> {
        self.temps
            .iter()
            .find(|(owner, _)| *owner == node)
            .map(|&(_, reg)| reg)
    }

    pub fn set_temp(&mut self, node: NodeId, reg: PhysicalRegister) {
        match self.temps.iter_mut().find(|(owner, _)| *owner == node) {
            Some(slot) => slot.1 = reg,
            None => self.temps.push((node, reg)),
        }
    }

    pub fn assignments(&self) -> impl Iterator<Item = (NodeId, PhysicalRegister)> + '_ {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(i, reg)| reg.map(|r| (NodeId(i as u32), r)))
    }

    pub fn temps(&self) -> &[(NodeId, PhysicalRegister)] {
        &self.temps
    }

    /// Highest used index + 1 for `class`, over values and temporaries.
    pub fn pressure(&self, class: RegisterClass) -> u32 {
        self.assignments()
            .map(|(_, r)| r)
            .chain(self.temps.iter().map(|&(_, r)| r))
            .filter(|r| r.class == class)
            .map(|r| u32::from(r.index) + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn serialized_len(&self) -> usize {
        4 + self.regs.len() * 2 + 4 + self.temps.len() * 6
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_len());
        out.extend_from_slice(&(self.regs.len() as u32).to_le_bytes());
        for reg in &self.regs {
            match reg {
                Some(r) => out.extend_from_slice(&[r.class as u8, r.index]),
                None => out.extend_from_slice(&[NO_CLASS, 0]),
            }
        }
        out.extend_from_slice(&(self.temps.len() as u32).to_le_bytes());
        for &(node, reg) in &self.temps {
            out.extend_from_slice(&node.0.to_le_bytes());
            out.extend_from_slice(&[reg.class as u8, reg.index]);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    /// Decodes allocation data, returning it with the number of bytes consumed.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut at = 0usize;
        let count = read_u32(bytes, &mut at)?;
        let regs_len = (count as usize)
            .checked_mul(2)
            .ok_or(RaDataError::Truncated)?;
        let raw = take(bytes, &mut at, regs_len)?;
        let regs = raw
            .chunks_exact(2)
            .map(|pair| decode_reg(pair[0], pair[1]))
            .collect::<Result<Vec<_>>>()?;

        let temp_count = read_u32(bytes, &mut at)?;
        let mut temps = Vec::new();
        for _ in 0..temp_count {
            let node = read_u32(bytes, &mut at)?;
            let raw = take(bytes, &mut at, 2)?;
            if node >= count {
                return Err(RaDataError::TempOutOfRange { node, count });
            }
            let reg = decode_reg(raw[0], raw[1])?.ok_or(RaDataError::InvalidClass(raw[0]))?;
            temps.push((NodeId(node), reg));
        }

        Ok((Self { regs, temps }, at))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::deserialize(bytes).map(|(data, _)| data)
    }
}

impl AllocationView for RegisterAllocationData {
    fn is_assigned(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }
}

fn decode_reg(class: u8, index: u8) -> Result<Option<PhysicalRegister>> {
    if class == NO_CLASS {
        return Ok(None);
    }
    let class = RegisterClass::from_u8(class).ok_or(RaDataError::InvalidClass(class))?;
    Ok(Some(PhysicalRegister::new(class, index)))
}

fn take<'a>(bytes: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = at.checked_add(len).ok_or(RaDataError::Truncated)?;
    let out = bytes.get(*at..end).ok_or(RaDataError::Truncated)?;
    *at = end;
    Ok(out)
}

fn read_u32(bytes: &[u8], at: &mut usize) -> Result<u32> {
    let raw = take(bytes, at, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_data_decodes_back() {
        let mut data = RegisterAllocationData::with_node_count(6);
        data.set(NodeId(3), PhysicalRegister::gpr(2));
        data.set(NodeId(5), PhysicalRegister::new(RegisterClass::Float, 7));
        data.set_temp(NodeId(5), PhysicalRegister::gpr(9));

        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), data.serialized_len());
        let (decoded, used) = RegisterAllocationData::deserialize(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, data);
        assert_eq!(decoded.pressure(RegisterClass::General), 10);
        assert_eq!(decoded.pressure(RegisterClass::GeneralPair), 0);
    }

    #[test]
    fn bad_class_and_truncation_are_rejected() {
        let mut data = RegisterAllocationData::with_node_count(2);
        data.set(NodeId(1), PhysicalRegister::gpr(0));
        let mut bytes = data.to_bytes();

        assert_eq!(
            RegisterAllocationData::from_bytes(&bytes[..bytes.len() - 1]),
            Err(RaDataError::Truncated)
        );
        bytes[6] = 9;
        assert_eq!(
            RegisterAllocationData::from_bytes(&bytes),
            Err(RaDataError::InvalidClass(9))
        );
    }
}
