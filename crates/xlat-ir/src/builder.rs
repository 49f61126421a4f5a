use crate::container::{BlockInfo, Header, IrContainer, IrView};
use crate::node::{CondCode, NodeId, Opcode, RegisterClass};

/// Typed emitter for one translation unit.
///
/// The builder starts with an entry block already selected. Front-ends are expected to create
/// every block of the region up front (block nodes then get lower IDs than any jump referencing
/// them, which keeps the forward-reference invariant intact without compaction).
#[derive(Debug)]
pub struct IrBuilder {
    ir: IrContainer,
    blocks: Vec<NodeId>,
    current: NodeId,
}

impl IrBuilder {
    #[must_use]
    pub fn new(guest_rip: u64) -> Self {
        let mut ir = IrContainer::new();
        let header = ir.push_node(Opcode::IrHeader, 0, 0, &[], &[0; 3], false);
        debug_assert_eq!(header, NodeId::HEADER);
        ir.set_header(Header {
            first_block: None,
            guest_rip,
            block_count: 0,
        });

        let mut this = Self {
            ir,
            blocks: Vec::new(),
            current: NodeId::HEADER,
        };
        let entry = this.create_block();
        this.set_current_block(entry);
        this
    }

    pub fn entry_block(&self) -> NodeId {
        self.blocks[0]
    }

    pub fn current_block(&self) -> NodeId {
        self.current
    }

    pub fn blocks(&self) -> &[NodeId] {
        &self.blocks
    }

    /// Appends a new, empty block to the block list.
    pub fn create_block(&mut self) -> NodeId {
        let none = u64::from(u32::MAX);
        let block = self
            .ir
            .push_node(Opcode::CodeBlock, 0, 0, &[], &[none, none, none], false);

        if let Some(&prev) = self.blocks.last() {
            if let Ok(mut info) = self.ir.block(prev) {
                info.next = Some(block);
                self.ir.set_block(prev, info);
            }
        }
        self.blocks.push(block);

        if let Ok(mut header) = self.ir.header() {
            header.first_block = Some(self.blocks[0]);
            header.block_count = self.blocks.len() as u32;
            self.ir.set_header(header);
        }
        block
    }

    /// Selects the block subsequent ops are appended to, opening it if it is still empty.
    pub fn set_current_block(&mut self, block: NodeId) {
        self.current = block;
        let is_empty = self.ir.block(block).map_or(false, |b| b.begin.is_none());
        if is_empty {
            let begin = self.ir.push_node(
                Opcode::BeginBlock,
                0,
                0,
                &[],
                &[u64::from(block.0)],
                false,
            );
            self.ir.set_block(
                block,
                BlockInfo {
                    begin: Some(begin),
                    last: Some(begin),
                    next: self.ir.block(block).ok().and_then(|b| b.next),
                },
            );
        }
    }

    fn emit(
        &mut self,
        opcode: Opcode,
        size: u8,
        elem_size: u8,
        args: &[NodeId],
        imms: &[u64],
    ) -> NodeId {
        let node = self.ir.push_node(opcode, size, elem_size, args, imms, true);
        if let Ok(mut info) = self.ir.block(self.current) {
            if let Some(last) = info.last {
                self.ir.link_after(last, node);
            } else {
                info.begin = Some(node);
            }
            info.last = Some(node);
            self.ir.set_block(self.current, info);
        }
        node
    }

    pub fn constant(&mut self, size: u8, value: u64) -> NodeId {
        self.emit(Opcode::Constant, size, size, &[], &[value])
    }

    pub fn load_context(&mut self, size: u8, class: RegisterClass, offset: u32) -> NodeId {
        self.emit(
            Opcode::LoadContext,
            size,
            size,
            &[],
            &[u64::from(offset), class as u64],
        )
    }

    pub fn store_context(
        &mut self,
        size: u8,
        class: RegisterClass,
        offset: u32,
        value: NodeId,
    ) -> NodeId {
        self.emit(
            Opcode::StoreContext,
            size,
            size,
            &[value],
            &[u64::from(offset), class as u64],
        )
    }

    pub fn load_context_indexed(
        &mut self,
        size: u8,
        class: RegisterClass,
        base: u32,
        stride: u32,
        index: NodeId,
    ) -> NodeId {
        self.emit(
            Opcode::LoadContextIndexed,
            size,
            size,
            &[index],
            &[u64::from(base), u64::from(stride), class as u64],
        )
    }

    pub fn store_context_indexed(
        &mut self,
        size: u8,
        class: RegisterClass,
        base: u32,
        stride: u32,
        value: NodeId,
        index: NodeId,
    ) -> NodeId {
        self.emit(
            Opcode::StoreContextIndexed,
            size,
            size,
            &[value, index],
            &[u64::from(base), u64::from(stride), class as u64],
        )
    }

    pub fn load_flag(&mut self, flag: u32) -> NodeId {
        self.emit(Opcode::LoadFlag, 1, 1, &[], &[u64::from(flag)])
    }

    pub fn store_flag(&mut self, flag: u32, value: NodeId) -> NodeId {
        self.emit(Opcode::StoreFlag, 1, 1, &[value], &[u64::from(flag)])
    }

    pub fn invalidate_flags(&mut self, mask: u64) -> NodeId {
        self.emit(Opcode::InvalidateFlags, 0, 0, &[], &[mask])
    }

    pub fn load_mem(&mut self, size: u8, class: RegisterClass, addr: NodeId) -> NodeId {
        self.emit(Opcode::LoadMem, size, size, &[addr], &[class as u64])
    }

    pub fn store_mem(
        &mut self,
        size: u8,
        class: RegisterClass,
        addr: NodeId,
        value: NodeId,
    ) -> NodeId {
        self.emit(Opcode::StoreMem, size, size, &[addr, value], &[class as u64])
    }

    pub fn alu(&mut self, opcode: Opcode, size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        debug_assert!(matches!(
            opcode,
            Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Mul
                | Opcode::Lshl
                | Opcode::Lshr
        ));
        self.emit(opcode, size, size, &[lhs, rhs], &[])
    }

    pub fn add(&mut self, size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.alu(Opcode::Add, size, lhs, rhs)
    }

    pub fn sub(&mut self, size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.alu(Opcode::Sub, size, lhs, rhs)
    }

    pub fn xor(&mut self, size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.alu(Opcode::Xor, size, lhs, rhs)
    }

    pub fn lshl(&mut self, size: u8, value: NodeId, shift: NodeId) -> NodeId {
        self.alu(Opcode::Lshl, size, value, shift)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &mut self,
        size: u8,
        cond: CondCode,
        lhs: NodeId,
        rhs: NodeId,
        if_true: NodeId,
        if_false: NodeId,
    ) -> NodeId {
        self.emit(
            Opcode::Select,
            size,
            size,
            &[lhs, rhs, if_true, if_false],
            &[cond as u64],
        )
    }

    pub fn vadd(&mut self, size: u8, elem_size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.emit(Opcode::VAdd, size, elem_size, &[lhs, rhs], &[])
    }

    pub fn vxor(&mut self, size: u8, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.emit(Opcode::VXor, size, size, &[lhs, rhs], &[])
    }

    pub fn create_element_pair(&mut self, size: u8, lo: NodeId, hi: NodeId) -> NodeId {
        self.emit(Opcode::CreateElementPair, size * 2, size, &[lo, hi], &[])
    }

    pub fn cas_pair(
        &mut self,
        size: u8,
        expected: NodeId,
        desired: NodeId,
        addr: NodeId,
    ) -> NodeId {
        self.emit(
            Opcode::CasPair,
            size * 2,
            size,
            &[expected, desired, addr],
            &[],
        )
    }

    pub fn syscall(&mut self, a0: NodeId, a1: NodeId, a2: NodeId) -> NodeId {
        self.emit(Opcode::Syscall, 8, 8, &[a0, a1, a2], &[])
    }

    pub fn jump(&mut self, target: NodeId) -> NodeId {
        self.emit(Opcode::Jump, 0, 0, &[target], &[])
    }

    pub fn cond_jump(&mut self, cond: NodeId, if_true: NodeId, if_false: NodeId) -> NodeId {
        self.emit(Opcode::CondJump, 0, 0, &[cond, if_true, if_false], &[])
    }

    pub fn exit_function(&mut self, next_rip: NodeId) -> NodeId {
        self.emit(Opcode::ExitFunction, 0, 0, &[next_rip], &[])
    }

    pub fn break_(&mut self, reason: u64) -> NodeId {
        self.emit(Opcode::Break, 0, 0, &[], &[reason])
    }

    /// Closes the current block. `guest_len` is the number of guest bytes it covers.
    pub fn end_block(&mut self, guest_len: u64) -> NodeId {
        self.emit(Opcode::EndBlock, 0, 0, &[], &[guest_len])
    }

    pub fn view(&self) -> IrView<'_> {
        self.ir.view()
    }

    pub fn ir_mut(&mut self) -> &mut IrContainer {
        &mut self.ir
    }

    #[must_use]
    pub fn finish(self) -> IrContainer {
        self.ir
    }
}
