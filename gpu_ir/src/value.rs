use crate::instruction::InstId;

/// Register file (or memory-like pseudo-file) a [`Value`] lives in.
///
/// Only [`RegFile::Gpr`], [`RegFile::Pred`] and [`RegFile::Cond`] are real,
/// allocatable files; the memory files describe where a value is loaded from
/// or stored to, and [`RegFile::Imm`] marks compile-time literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegFile {
    /// General-purpose registers. Register 63 always reads zero.
    Gpr,
    /// Predicate registers.
    Pred,
    /// Condition-code registers.
    Cond,
    /// Immediate (literal) operand, not a register at all.
    Imm,
    /// Constant bank `N` (0..16).
    MemC(u8),
    /// Vertex attribute (input) memory.
    MemA,
    /// Varying (output export) memory.
    MemV,
    /// Per-thread local memory.
    MemL,
    /// Global memory.
    MemG,
    /// Workgroup shared memory.
    MemS,
}

impl RegFile {
    /// `true` for the files the allocator assigns registers in.
    pub fn is_allocatable(self) -> bool {
        matches!(self, RegFile::Gpr | RegFile::Pred | RegFile::Cond)
    }

    pub fn is_memory(self) -> bool {
        matches!(
            self,
            RegFile::MemC(_)
                | RegFile::MemA
                | RegFile::MemV
                | RegFile::MemL
                | RegFile::MemG
                | RegFile::MemS
        )
    }

    /// Highest usable register id in this file.
    pub fn last_reg(self) -> u32 {
        match self {
            // Gpr 63 is the hardwired zero register, not allocatable.
            RegFile::Gpr => 62,
            RegFile::Pred => 6,
            RegFile::Cond => 1,
            _ => 0,
        }
    }

    /// log2 of the allocation unit in bytes. A 4-byte GPR value occupies one
    /// slot, a 16-byte one occupies four consecutive slots.
    pub fn unit_shift(self) -> u32 {
        match self {
            RegFile::Gpr => 2,
            _ => 0,
        }
    }
}

impl std::fmt::Display for RegFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegFile::Gpr => f.write_str("$r"),
            RegFile::Pred => f.write_str("$p"),
            RegFile::Cond => f.write_str("$c"),
            RegFile::Imm => f.write_str("imm"),
            RegFile::MemC(b) => write!(f, "c{b}"),
            RegFile::MemA => f.write_str("a"),
            RegFile::MemV => f.write_str("v"),
            RegFile::MemL => f.write_str("l"),
            RegFile::MemG => f.write_str("g"),
            RegFile::MemS => f.write_str("s"),
        }
    }
}

/// Source-operand modifier bits carried on a [`Ref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Modifier(u8);

impl Modifier {
    pub const NONE: Modifier = Modifier(0);
    pub const NEG: Modifier = Modifier(1);
    pub const ABS: Modifier = Modifier(2);
    pub const NOT: Modifier = Modifier(4);
    pub const SAT: Modifier = Modifier(8);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn has(self, m: Modifier) -> bool {
        self.0 & m.0 != 0
    }

    /// Toggle the negate bit.
    pub fn negated(self) -> Modifier {
        Modifier(self.0 ^ Modifier::NEG.0)
    }

    /// Toggle the bits in `m` (folding a producer's modifier into a use).
    pub fn toggled(self, m: Modifier) -> Modifier {
        Modifier(self.0 ^ m.0)
    }

    /// Clear the bits in `m`.
    pub fn without(self, m: Modifier) -> Modifier {
        Modifier(self.0 & !m.0)
    }

    /// Force-positive: absolute value discards any pending negate.
    pub fn with_abs(self) -> Modifier {
        Modifier((self.0 | Modifier::ABS.0) & !Modifier::NEG.0)
    }

    /// Apply `inner` (the producer's modifier) below `self` (the consumer's).
    /// `abs(neg(x))` is `abs(x)`, `neg(abs(x))` keeps both bits.
    pub fn compose(self, inner: Modifier) -> Modifier {
        if self.has(Modifier::ABS) {
            // Inner sign changes are swallowed by the outer abs.
            Modifier(self.0 | (inner.0 & Modifier::NOT.0))
        } else {
            Modifier(self.0 ^ inner.0)
        }
    }

    /// Evaluate the modifier on a literal, interpreting it as `f32`.
    pub fn apply_f32(self, v: f32) -> f32 {
        let mut v = v;
        if self.has(Modifier::ABS) {
            v = v.abs();
        }
        if self.has(Modifier::NEG) {
            v = -v;
        }
        v
    }

    /// Evaluate the modifier on a literal, interpreting it as a 32-bit int.
    pub fn apply_u32(self, v: u32) -> u32 {
        let mut v = v as i32;
        if self.has(Modifier::ABS) {
            v = v.wrapping_abs();
        }
        if self.has(Modifier::NEG) {
            v = v.wrapping_neg();
        }
        if self.has(Modifier::NOT) {
            v = !v;
        }
        v as u32
    }
}

impl std::ops::BitOr for Modifier {
    type Output = Modifier;
    fn bitor(self, rhs: Modifier) -> Modifier {
        Modifier(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Modifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has(Modifier::NOT) {
            f.write_str("not ")?;
        }
        if self.has(Modifier::NEG) {
            f.write_str("neg ")?;
        }
        if self.has(Modifier::ABS) {
            f.write_str("abs ")?;
        }
        if self.has(Modifier::SAT) {
            f.write_str("sat ")?;
        }
        Ok(())
    }
}

/// A literal constant payload. Stored as raw bits; the consuming opcode
/// decides the interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Imm {
    pub bits: u64,
}

impl Imm {
    pub fn f32(v: f32) -> Imm {
        Imm {
            bits: v.to_bits() as u64,
        }
    }

    pub fn u32(v: u32) -> Imm {
        Imm { bits: v as u64 }
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    pub fn as_u32(self) -> u32 {
        self.bits as u32
    }

    pub fn is_zero(self) -> bool {
        self.bits as u32 == 0
    }
}

/// Stable identity of a [`Value`] inside one `Program`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) generational_arena::Index);

/// A use of a value: which instruction, which source slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseLink {
    pub inst: InstId,
    pub slot: usize,
}

/// A source operand: the value it reads plus the modifier applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ref {
    pub value: ValueId,
    pub modifier: Modifier,
    /// Scratch marker for the allocator's phi-operand bookkeeping.
    pub(crate) flags: u8,
}

impl Ref {
    pub fn new(value: ValueId) -> Ref {
        Ref {
            value,
            modifier: Modifier::NONE,
            flags: 0,
        }
    }

    pub fn with_mod(value: ValueId, modifier: Modifier) -> Ref {
        Ref {
            value,
            modifier,
            flags: 0,
        }
    }
}

/// A half-open `[bgn, end)` span of instruction serials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub bgn: i32,
    pub end: i32,
}

/// A value's live interval: sorted, disjoint, non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    pub fn bgn(&self) -> Option<i32> {
        self.ranges.first().map(|r| r.bgn)
    }

    pub fn end(&self) -> Option<i32> {
        self.ranges.last().map(|r| r.end)
    }

    /// Insert `[bgn, end)`, merging with any ranges it touches or overlaps.
    pub fn add(&mut self, bgn: i32, end: i32) {
        if bgn == end {
            return;
        }
        debug_assert!(bgn < end);
        let mut i = 0;
        while i < self.ranges.len() && self.ranges[i].end < bgn {
            i += 1;
        }
        if i == self.ranges.len() || end < self.ranges[i].bgn {
            self.ranges.insert(i, Range { bgn, end });
            return;
        }
        // Overlaps or touches ranges[i]; widen it, then swallow followers.
        self.ranges[i].bgn = self.ranges[i].bgn.min(bgn);
        self.ranges[i].end = self.ranges[i].end.max(end);
        while i + 1 < self.ranges.len() && self.ranges[i + 1].bgn <= self.ranges[i].end {
            self.ranges[i].end = self.ranges[i].end.max(self.ranges[i + 1].end);
            self.ranges.remove(i + 1);
        }
    }

    pub fn contains(&self, pos: i32) -> bool {
        self.ranges.iter().any(|r| r.bgn <= pos && pos < r.end)
    }

    pub fn overlaps(&self, other: &RangeList) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.end <= b.bgn {
                i += 1;
            } else if b.end <= a.bgn {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Fold `other`'s ranges into `self`. The two lists are expected to be
    /// disjoint (checked by the caller before coalescing).
    pub fn unify(&mut self, other: &RangeList) {
        for r in &other.ranges {
            self.add(r.bgn, r.end);
        }
    }

    /// Trim the range starting the value's definition so that it begins at
    /// `pos`. Used when a def turns out to be the block's last instruction.
    pub fn extend_last_to(&mut self, end: i32) {
        if let Some(last) = self.ranges.last_mut() {
            if last.end < end {
                last.end = end;
            }
        }
    }
}

/// One SSA definition.
#[derive(Debug, Clone)]
pub struct Value {
    pub file: RegFile,
    /// Size in bytes: 1, 2, 4, 8 or 16.
    pub size: u8,
    /// Assigned register id. `None` until the allocator ran, or for
    /// memory/immediate files. Pre-set for pinned values (hardwired zero,
    /// fixed outputs).
    pub reg: Option<u32>,
    /// Byte offset for memory files.
    pub address: u32,
    /// Literal payload when `file == RegFile::Imm`.
    pub imm: Option<Imm>,
    /// The instruction defining this value, if any.
    pub def: Option<InstId>,
    /// Union-find pointer for coalescing; starts as the value itself.
    pub join: ValueId,
    /// Number of live [`Ref`]s pointing at this value. Always equals the
    /// use-list length.
    pub refc: u32,
    /// Ordered list of uses, for last-use scanning.
    pub uses: Vec<UseLink>,
    /// Live interval, filled in by the allocator.
    pub livei: RangeList,
}

impl Value {
    pub fn is_const(&self) -> bool {
        matches!(self.file, RegFile::Imm | RegFile::MemC(_))
    }

    pub fn is_imm(&self) -> bool {
        self.file == RegFile::Imm
    }

    /// The hardwired zero register cannot be renamed or coalesced.
    pub fn is_zero_reg(&self) -> bool {
        self.file == RegFile::Gpr && self.reg == Some(63)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn range_list_merges_overlapping_and_adjacent() {
        let mut l = RangeList::default();
        l.add(10, 14);
        l.add(20, 24);
        l.add(14, 20);
        assert_eq!(l.iter().count(), 1);
        assert_eq!(l.bgn(), Some(10));
        assert_eq!(l.end(), Some(24));
    }

    #[test]
    fn range_list_keeps_disjoint_ranges_sorted() {
        let mut l = RangeList::default();
        l.add(30, 32);
        l.add(2, 6);
        l.add(10, 12);
        let v: Vec<_> = l.iter().map(|r| (r.bgn, r.end)).collect();
        assert_eq!(v, vec![(2, 6), (10, 12), (30, 32)]);
        assert!(l.contains(11));
        assert!(!l.contains(12));
        assert!(!l.contains(7));
    }

    #[test]
    fn range_list_overlap() {
        let mut a = RangeList::default();
        a.add(0, 4);
        a.add(8, 12);
        let mut b = RangeList::default();
        b.add(4, 8);
        assert!(!a.overlaps(&b));
        b.add(11, 13);
        assert!(a.overlaps(&b));
    }

    #[test]
    fn modifier_composition() {
        let neg = Modifier::NEG;
        let abs = Modifier::ABS;
        assert_eq!(abs.compose(neg), abs);
        assert_eq!(neg.compose(neg), Modifier::NONE);
        assert_eq!(neg.compose(abs), neg | abs);
        assert_eq!(Modifier::NONE.apply_f32(-2.0), -2.0);
        assert_eq!(abs.apply_f32(-2.0), 2.0);
        assert_eq!((neg | abs).apply_f32(-2.0), -2.0);
        assert_eq!(neg.apply_u32(5), 5u32.wrapping_neg());
    }
}
