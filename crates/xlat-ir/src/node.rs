use bitflags::bitflags;

/// Index of a node in the list arena.
///
/// After compaction the ID of a node equals its position in program order, so operand
/// references can be checked for the forward-only invariant by plain integer comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The IR header is always the first node of a container.
    pub const HEADER: NodeId = NodeId(0);

    /// Raw encoding used for "no node" inside op payloads.
    pub(crate) const NONE_RAW: u32 = u32::MAX;

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<NodeId> {
        (raw != Self::NONE_RAW).then_some(NodeId(raw))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%ssa{}", self.0)
    }
}

/// Byte offset of an op payload inside the data arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataOffset(pub u32);

/// Physical storage class a value wants to live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RegisterClass {
    General = 0,
    Float = 1,
    GeneralPair = 2,
}

impl RegisterClass {
    pub const COUNT: usize = 3;
    pub const ALL: [RegisterClass; Self::COUNT] = [
        RegisterClass::General,
        RegisterClass::Float,
        RegisterClass::GeneralPair,
    ];

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::General),
            1 => Some(Self::Float),
            2 => Some(Self::GeneralPair),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Condition used by `Select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    Eq = 0,
    Ne = 1,
    Ult = 2,
    Uge = 3,
    Slt = 4,
    Sge = 5,
}

impl CondCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Eq,
            1 => Self::Ne,
            2 => Self::Ult,
            3 => Self::Uge,
            4 => Self::Slt,
            5 => Self::Sge,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct OpFlags: u8 {
        /// The op produces an SSA value.
        const HAS_DEST = 1 << 0;
        /// The op must not be removed even if its value is unused.
        const SIDE_EFFECTS = 1 << 1;
        /// The op leaves the block (jump, conditional jump, exit, break).
        const BLOCK_EXIT = 1 << 2;
        /// Header/block bookkeeping; not part of any block's code list.
        const STRUCTURAL = 1 << 3;
    }
}

/// Static shape of an opcode: how many node operands and inline immediates its payload
/// carries, and how the passes must treat it.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub args: u8,
    pub imms: u8,
    pub flags: OpFlags,
}

const fn info(name: &'static str, args: u8, imms: u8, flags: OpFlags) -> OpInfo {
    OpInfo {
        name,
        args,
        imms,
        flags,
    }
}

const DEST: OpFlags = OpFlags::HAS_DEST;
const SIDE: OpFlags = OpFlags::SIDE_EFFECTS;
const EXIT: OpFlags = OpFlags::SIDE_EFFECTS.union(OpFlags::BLOCK_EXIT);
const META: OpFlags = OpFlags::STRUCTURAL.union(OpFlags::SIDE_EFFECTS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // imms: first block, guest rip, block count
    IrHeader = 0,
    // imms: begin, last, next block
    CodeBlock,
    // imms: owning block
    BeginBlock,
    // imms: guest bytes covered by the block
    EndBlock,

    // imms: value
    Constant,
    // imms: offset, class
    LoadContext,
    // args: value; imms: offset, class
    StoreContext,
    // args: index; imms: base offset, stride, class
    LoadContextIndexed,
    // args: value, index; imms: base offset, stride, class
    StoreContextIndexed,
    // imms: flag
    LoadFlag,
    // args: value; imms: flag
    StoreFlag,
    // imms: flag mask
    InvalidateFlags,
    // args: address; imms: class
    LoadMem,
    // args: address, value; imms: class
    StoreMem,

    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
    Lshl,
    Lshr,
    // args: lhs, rhs, true value, false value; imms: condition
    Select,

    VAdd,
    VXor,

    // args: low, high
    CreateElementPair,
    // args: expected pair, desired pair, address. The result is tied to `expected`.
    CasPair,
    // args: up to three syscall arguments. The result is pinned by the host ABI.
    Syscall,

    // args: target block
    Jump,
    // args: condition, true block, false block
    CondJump,
    // args: next guest rip
    ExitFunction,
    // imms: reason
    Break,
}

impl Opcode {
    pub const COUNT: usize = Opcode::Break as usize + 1;

    pub fn from_u8(raw: u8) -> Option<Self> {
        use Opcode::*;
        const TABLE: [Opcode; Opcode::COUNT] = [
            IrHeader,
            CodeBlock,
            BeginBlock,
            EndBlock,
            Constant,
            LoadContext,
            StoreContext,
            LoadContextIndexed,
            StoreContextIndexed,
            LoadFlag,
            StoreFlag,
            InvalidateFlags,
            LoadMem,
            StoreMem,
            Add,
            Sub,
            And,
            Or,
            Xor,
            Mul,
            Lshl,
            Lshr,
            Select,
            VAdd,
            VXor,
            CreateElementPair,
            CasPair,
            Syscall,
            Jump,
            CondJump,
            ExitFunction,
            Break,
        ];
        TABLE.get(raw as usize).copied()
    }

    pub const fn info(self) -> OpInfo {
        use Opcode::*;
        match self {
            IrHeader => info("IrHeader", 0, 3, META),
            CodeBlock => info("CodeBlock", 0, 3, META),
            BeginBlock => info("BeginBlock", 0, 1, SIDE),
            EndBlock => info("EndBlock", 0, 1, SIDE),
            Constant => info("Constant", 0, 1, DEST),
            LoadContext => info("LoadContext", 0, 2, DEST),
            StoreContext => info("StoreContext", 1, 2, SIDE),
            LoadContextIndexed => info("LoadContextIndexed", 1, 3, DEST),
            StoreContextIndexed => info("StoreContextIndexed", 2, 3, SIDE),
            LoadFlag => info("LoadFlag", 0, 1, DEST),
            StoreFlag => info("StoreFlag", 1, 1, SIDE),
            InvalidateFlags => info("InvalidateFlags", 0, 1, SIDE),
            LoadMem => info("LoadMem", 1, 1, DEST),
            StoreMem => info("StoreMem", 2, 1, SIDE),
            Add => info("Add", 2, 0, DEST),
            Sub => info("Sub", 2, 0, DEST),
            And => info("And", 2, 0, DEST),
            Or => info("Or", 2, 0, DEST),
            Xor => info("Xor", 2, 0, DEST),
            Mul => info("Mul", 2, 0, DEST),
            Lshl => info("Lshl", 2, 0, DEST),
            Lshr => info("Lshr", 2, 0, DEST),
            Select => info("Select", 4, 1, DEST),
            VAdd => info("VAdd", 2, 0, DEST),
            VXor => info("VXor", 2, 0, DEST),
            CreateElementPair => info("CreateElementPair", 2, 0, DEST),
            CasPair => info("CasPair", 3, 0, DEST.union(SIDE)),
            Syscall => info("Syscall", 3, 0, DEST.union(SIDE)),
            Jump => info("Jump", 1, 0, EXIT),
            CondJump => info("CondJump", 3, 0, EXIT),
            ExitFunction => info("ExitFunction", 1, 0, EXIT),
            Break => info("Break", 0, 1, EXIT),
        }
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    #[inline]
    pub fn has_dest(self) -> bool {
        self.info().flags.contains(OpFlags::HAS_DEST)
    }

    #[inline]
    pub fn has_side_effects(self) -> bool {
        self.info().flags.contains(OpFlags::SIDE_EFFECTS)
    }

    #[inline]
    pub fn is_block_exit(self) -> bool {
        self.info().flags.contains(OpFlags::BLOCK_EXIT)
    }

    /// Operand slots that name a block rather than an SSA value.
    pub fn block_operands(self) -> &'static [usize] {
        match self {
            Opcode::Jump => &[0],
            Opcode::CondJump => &[1, 2],
            _ => &[],
        }
    }

    /// Byte length of the encoded payload for this opcode.
    #[inline]
    pub const fn encoded_len(self) -> usize {
        let info = self.info();
        OP_HEADER_LEN + info.args as usize * 4 + info.imms as usize * 8
    }
}

/// `opcode:u8, size:u8, elem_size:u8, reserved:u8`
pub(crate) const OP_HEADER_LEN: usize = 4;

const _: () = {
    assert!(Opcode::COUNT <= u8::MAX as usize);
    assert!(Opcode::Break as usize == Opcode::COUNT - 1);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_table_round_trips() {
        for raw in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_u8(raw).expect("every raw value below COUNT decodes");
            assert_eq!(op as u8, raw, "{} sits at the wrong table index", op.name());
        }
        assert!(Opcode::from_u8(Opcode::COUNT as u8).is_none());
    }

    #[test]
    fn block_exits_are_side_effecting() {
        for raw in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_u8(raw).unwrap();
            if op.is_block_exit() {
                assert!(op.has_side_effects(), "{} exits a block", op.name());
                assert!(!op.has_dest(), "{} exits a block", op.name());
            }
        }
    }
}
