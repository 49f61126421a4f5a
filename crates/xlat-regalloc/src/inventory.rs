use std::collections::HashSet;
use std::fmt;

use xlat_ir::RegisterClass;

/// A host register: class plus index within that class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalRegister {
    pub class: RegisterClass,
    pub index: u8,
}

impl PhysicalRegister {
    pub const fn new(class: RegisterClass, index: u8) -> Self {
        Self { class, index }
    }

    pub const fn gpr(index: u8) -> Self {
        Self::new(RegisterClass::General, index)
    }
}

impl fmt::Display for PhysicalRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.class {
            RegisterClass::General => "r",
            RegisterClass::Float => "v",
            RegisterClass::GeneralPair => "rp",
        };
        write!(f, "{prefix}{}", self.index)
    }
}

/// Number of allocatable registers per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterInventory {
    counts: [u32; RegisterClass::COUNT],
}

impl RegisterInventory {
    pub const fn new(general: u32, float: u32, general_pairs: u32) -> Self {
        Self {
            counts: [general, float, general_pairs],
        }
    }

    #[inline]
    pub fn count(&self, class: RegisterClass) -> u32 {
        self.counts[class.index()]
    }

    pub fn set_count(&mut self, class: RegisterClass, count: u32) {
        self.counts[class.index()] = count;
    }
}

impl Default for RegisterInventory {
    fn default() -> Self {
        Self::new(16, 16, 8)
    }
}

/// Static pairs of registers that may never hold simultaneously live values, e.g. a register pair
/// and the two general registers it is made of.
///
/// The relation is symmetric: adding `(a, b)` also records `(b, a)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictTable {
    pairs: HashSet<(PhysicalRegister, PhysicalRegister)>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `i` aliases general registers `2i` and `2i + 1`.
    pub fn pair_aliasing(inventory: &RegisterInventory) -> Self {
        let mut table = Self::new();
        for pair in 0..inventory.count(RegisterClass::GeneralPair) {
            let Ok(pair) = u8::try_from(pair) else { break };
            let Some(lo) = pair.checked_mul(2) else { break };
            let p = PhysicalRegister::new(RegisterClass::GeneralPair, pair);
            table.add(p, PhysicalRegister::gpr(lo));
            if let Some(hi) = lo.checked_add(1) {
                table.add(p, PhysicalRegister::gpr(hi));
            }
        }
        table
    }

    pub fn add(&mut self, a: PhysicalRegister, b: PhysicalRegister) {
        self.pairs.insert((a, b));
        self.pairs.insert((b, a));
    }

    #[inline]
    pub fn conflicts(&self, a: PhysicalRegister, b: PhysicalRegister) -> bool {
        !self.pairs.is_empty() && self.pairs.contains(&(a, b))
    }

    pub fn len(&self) -> usize {
        self.pairs.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
