use crate::cfg::BlockId;
use crate::value::{Modifier, Ref, ValueId};
use arrayvec::ArrayVec;

pub const MAX_DEFS: usize = 5;
pub const MAX_SRCS: usize = 6;

/// Stable identity of an [`Instruction`] inside one `Program`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub(crate) generational_arena::Index);

/// Operand interpretation for typed opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    S32,
    U32,
    /// Untyped 32-bit, for bitwise ops and raw moves.
    B32,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DType::F32 => "f32",
            DType::S32 => "s32",
            DType::U32 => "u32",
            DType::B32 => "b32",
        })
    }
}

/// Comparison / execution condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondCode {
    /// Never true.
    Fl,
    Lt,
    Eq,
    Le,
    Gt,
    Ne,
    Ge,
    /// Always true.
    Tr,
}

impl CondCode {
    /// Logical complement.
    pub fn invert(self) -> CondCode {
        match self {
            CondCode::Fl => CondCode::Tr,
            CondCode::Lt => CondCode::Ge,
            CondCode::Eq => CondCode::Ne,
            CondCode::Le => CondCode::Gt,
            CondCode::Gt => CondCode::Le,
            CondCode::Ne => CondCode::Eq,
            CondCode::Ge => CondCode::Lt,
            CondCode::Tr => CondCode::Fl,
        }
    }

    /// The condition that holds after swapping the two compared operands.
    pub fn swapped(self) -> CondCode {
        match self {
            CondCode::Lt => CondCode::Gt,
            CondCode::Le => CondCode::Ge,
            CondCode::Gt => CondCode::Lt,
            CondCode::Ge => CondCode::Le,
            other => other,
        }
    }

    /// Evaluate the comparison on two already-modified literals.
    pub fn eval_f32(self, a: f32, b: f32) -> bool {
        match self {
            CondCode::Fl => false,
            CondCode::Lt => a < b,
            CondCode::Eq => a == b,
            CondCode::Le => a <= b,
            CondCode::Gt => a > b,
            CondCode::Ne => a != b,
            CondCode::Ge => a >= b,
            CondCode::Tr => true,
        }
    }

    pub fn eval_i32(self, a: i32, b: i32) -> bool {
        match self {
            CondCode::Fl => false,
            CondCode::Lt => a < b,
            CondCode::Eq => a == b,
            CondCode::Le => a <= b,
            CondCode::Gt => a > b,
            CondCode::Ne => a != b,
            CondCode::Ge => a >= b,
            CondCode::Tr => true,
        }
    }
}

impl std::fmt::Display for CondCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CondCode::Fl => "never",
            CondCode::Lt => "lt",
            CondCode::Eq => "eq",
            CondCode::Le => "le",
            CondCode::Gt => "gt",
            CondCode::Ne => "ne",
            CondCode::Ge => "ge",
            CondCode::Tr => "always",
        })
    }
}

/// Rounding mode for conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    Near,
    /// Toward zero (truncate).
    Zero,
    /// Toward negative infinity (floor).
    NegInf,
    /// Toward positive infinity (ceil).
    PosInf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexTarget {
    Tex1D,
    Tex2D,
    Tex3D,
    Cube,
    Array1D,
    Array2D,
    Shadow1D,
    Shadow2D,
}

impl TexTarget {
    /// Number of coordinate components the target consumes.
    pub fn coords(self) -> usize {
        match self {
            TexTarget::Tex1D => 1,
            TexTarget::Tex2D | TexTarget::Array1D | TexTarget::Shadow1D => 2,
            TexTarget::Tex3D | TexTarget::Cube | TexTarget::Array2D | TexTarget::Shadow2D => 3,
        }
    }

    pub fn is_shadow(self) -> bool {
        matches!(self, TexTarget::Shadow1D | TexTarget::Shadow2D)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TexInfo {
    pub unit: u8,
    pub target: TexTarget,
    /// Which result components the hardware should produce.
    pub mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CvtInfo {
    pub dst: DType,
    pub src: DType,
    pub round: Option<RoundMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpInfo {
    pub centroid: bool,
    pub flat: bool,
}

/// Opcode-specific attributes that take part in operation equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpExt {
    None,
    Tex(TexInfo),
    Cvt(CvtInfo),
    Interp(InterpInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    /// SSA merge-point pseudo-op. Sources are one value per predecessor.
    Phi,
    /// Predicated copy joining the two arms of a conditional; the allocator
    /// must place all operands and the result in the same register.
    Select,
    /// Register-group pseudo-op: all sources must land in consecutive
    /// registers, one per destination.
    Bind,
    /// Placeholder producing an undefined value.
    Undef,
    Mov,
    Ld,
    St,
    /// Vertex attribute fetch (can load several components at once).
    Vfetch,
    /// Result export (vertex varyings; deleted in fragment programs).
    Export,
    Add(DType),
    Sub(DType),
    Mul(DType),
    Mad(DType),
    Min(DType),
    Max(DType),
    Neg(DType),
    Abs(DType),
    /// Clamp to [0, 1]; lowered into the consumer's saturate flag.
    Sat,
    Cvt,
    Set(DType),
    /// Select between src0/src1 based on comparing src2 against zero.
    Slct(DType),
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr(DType),
    Rcp,
    Rsq,
    Lg2,
    Ex2,
    PreEx2,
    Sin,
    Cos,
    PreSin,
    /// Cross-lane quad operation (derivative building block). Has hidden
    /// lane-dependent effects and is excluded from CSE.
    Quadop,
    /// Linear (or flat) interpolation of a fragment input.
    Linterp,
    /// Perspective-corrected interpolation; src1 is 1/w.
    Pinterp,
    Tex,
    /// Texture fetch with LOD bias in the last coordinate slot.
    Txb,
    /// Texture fetch with explicit LOD.
    Txl,
    /// Fragment kill.
    Kil,
    Bra,
    Call,
    Ret,
    Exit,
    /// Marks the address where diverged threads will reconverge.
    Joinat,
    Join,
}

impl Opcode {
    pub fn is_flow(self) -> bool {
        matches!(
            self,
            Opcode::Bra | Opcode::Call | Opcode::Ret | Opcode::Exit | Opcode::Joinat | Opcode::Join
        )
    }

    pub fn is_pseudo(self) -> bool {
        matches!(
            self,
            Opcode::Phi | Opcode::Select | Opcode::Bind | Opcode::Undef | Opcode::Nop
        )
    }

    pub fn is_tex(self) -> bool {
        matches!(self, Opcode::Tex | Opcode::Txb | Opcode::Txl)
    }

    /// Commutative in sources 0 and 1 (for Set, only together with a
    /// condition-code swap).
    pub fn commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add(_)
                | Opcode::Mul(_)
                | Opcode::Mad(_)
                | Opcode::Min(_)
                | Opcode::Max(_)
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Set(_)
                | Opcode::Slct(_)
        )
    }

    /// Whether the hardware can execute this op under a predicate.
    pub fn predicateable(self) -> bool {
        !self.is_flow()
            && !self.is_pseudo()
            && !self.is_tex()
            && !matches!(
                self,
                Opcode::Linterp | Opcode::Pinterp | Opcode::Export | Opcode::Quadop
            )
    }

    /// Ops with effects beyond their SSA destinations; never dead.
    pub fn has_side_effects(self) -> bool {
        self.is_flow() || matches!(self, Opcode::St | Opcode::Export | Opcode::Kil)
    }

    /// Modifier bits the hardware accepts on sources of this op.
    pub fn supported_src_mods(self, slot: usize) -> Modifier {
        match self {
            Opcode::Add(DType::F32) | Opcode::Sub(DType::F32) => Modifier::NEG | Modifier::ABS,
            Opcode::Mul(DType::F32) => Modifier::NEG | Modifier::ABS,
            Opcode::Mad(DType::F32) => {
                if slot <= 1 {
                    Modifier::NEG
                } else {
                    Modifier::NEG | Modifier::ABS
                }
            }
            Opcode::Min(DType::F32) | Opcode::Max(DType::F32) => Modifier::NEG | Modifier::ABS,
            Opcode::Set(DType::F32) | Opcode::Slct(DType::F32) => Modifier::NEG | Modifier::ABS,
            Opcode::Cvt => Modifier::NEG | Modifier::ABS,
            Opcode::Rcp | Opcode::Rsq | Opcode::Lg2 | Opcode::PreEx2 | Opcode::PreSin => {
                Modifier::NEG | Modifier::ABS
            }
            Opcode::And | Opcode::Or | Opcode::Xor => Modifier::NOT,
            Opcode::Add(_) | Opcode::Sub(_) => Modifier::NEG,
            _ => Modifier::NONE,
        }
    }

    /// Whether the op has a result saturate flag.
    pub fn can_saturate(self) -> bool {
        matches!(
            self,
            Opcode::Add(DType::F32)
                | Opcode::Mul(DType::F32)
                | Opcode::Mad(DType::F32)
                | Opcode::Cvt
                | Opcode::Linterp
                | Opcode::Pinterp
        )
    }

    /// Ops CSE must never merge, even when all fields compare equal.
    pub fn volatile_for_cse(self) -> bool {
        // Quadop reads other lanes; two textually equal quadops can differ.
        matches!(self, Opcode::Quadop) || self.has_side_effects() || self.is_pseudo()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Nop => f.write_str("nop"),
            Opcode::Phi => f.write_str("phi"),
            Opcode::Select => f.write_str("select"),
            Opcode::Bind => f.write_str("bind"),
            Opcode::Undef => f.write_str("undef"),
            Opcode::Mov => f.write_str("mov"),
            Opcode::Ld => f.write_str("ld"),
            Opcode::St => f.write_str("st"),
            Opcode::Vfetch => f.write_str("vfetch"),
            Opcode::Export => f.write_str("export"),
            Opcode::Add(t) => write!(f, "add.{t}"),
            Opcode::Sub(t) => write!(f, "sub.{t}"),
            Opcode::Mul(t) => write!(f, "mul.{t}"),
            Opcode::Mad(t) => write!(f, "mad.{t}"),
            Opcode::Min(t) => write!(f, "min.{t}"),
            Opcode::Max(t) => write!(f, "max.{t}"),
            Opcode::Neg(t) => write!(f, "neg.{t}"),
            Opcode::Abs(t) => write!(f, "abs.{t}"),
            Opcode::Sat => f.write_str("sat"),
            Opcode::Cvt => f.write_str("cvt"),
            Opcode::Set(t) => write!(f, "set.{t}"),
            Opcode::Slct(t) => write!(f, "slct.{t}"),
            Opcode::And => f.write_str("and"),
            Opcode::Or => f.write_str("or"),
            Opcode::Xor => f.write_str("xor"),
            Opcode::Not => f.write_str("not"),
            Opcode::Shl => f.write_str("shl"),
            Opcode::Shr(t) => write!(f, "shr.{t}"),
            Opcode::Rcp => f.write_str("rcp"),
            Opcode::Rsq => f.write_str("rsq"),
            Opcode::Lg2 => f.write_str("lg2"),
            Opcode::Ex2 => f.write_str("ex2"),
            Opcode::PreEx2 => f.write_str("pre.ex2"),
            Opcode::Sin => f.write_str("sin"),
            Opcode::Cos => f.write_str("cos"),
            Opcode::PreSin => f.write_str("pre.sin"),
            Opcode::Quadop => f.write_str("quadop"),
            Opcode::Linterp => f.write_str("linterp"),
            Opcode::Pinterp => f.write_str("pinterp"),
            Opcode::Tex => f.write_str("tex"),
            Opcode::Txb => f.write_str("txb"),
            Opcode::Txl => f.write_str("txl"),
            Opcode::Kil => f.write_str("kil"),
            Opcode::Bra => f.write_str("bra"),
            Opcode::Call => f.write_str("call"),
            Opcode::Ret => f.write_str("ret"),
            Opcode::Exit => f.write_str("exit"),
            Opcode::Joinat => f.write_str("joinat"),
            Opcode::Join => f.write_str("join"),
        }
    }
}

/// One IR instruction. Lives in exactly one basic block (as a doubly linked
/// list node) until deleted.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ext: OpExt,
    pub defs: ArrayVec<ValueId, MAX_DEFS>,
    /// Fixed source slots; cleared slots stay `None` so the predicate and
    /// indirect indices remain stable.
    pub srcs: [Option<Ref>; MAX_SRCS],
    /// Source slot holding the execution predicate, if predicated.
    pub predicate: Option<usize>,
    /// Source slot holding the indirect address register, if any.
    pub indirect: Option<usize>,
    /// Execution condition, applied to the predicate source.
    pub cc: CondCode,
    /// Comparison condition for Set/Slct.
    pub set_cond: CondCode,
    pub saturate: bool,
    /// Quad-op lane mask / selection.
    pub lanes: u8,
    pub quadop: u8,
    /// Ends its basic block.
    pub terminator: bool,
    /// Reconvergence point; kept even when otherwise dead.
    pub is_join: bool,
    /// Never removed by DCE.
    pub fixed: bool,
    /// Branch/call target.
    pub target: Option<BlockId>,
    /// Position in final program order, assigned by the allocator.
    pub serial: i32,
    pub bb: Option<BlockId>,
    pub prev: Option<InstId>,
    pub next: Option<InstId>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Instruction {
        Instruction {
            opcode,
            ext: OpExt::None,
            defs: ArrayVec::new(),
            srcs: [None; MAX_SRCS],
            predicate: None,
            indirect: None,
            cc: CondCode::Tr,
            set_cond: CondCode::Tr,
            saturate: false,
            lanes: 0xf,
            quadop: 0,
            terminator: false,
            is_join: false,
            fixed: false,
            target: None,
            serial: -1,
            bb: None,
            prev: None,
            next: None,
        }
    }

    pub fn src(&self, slot: usize) -> Option<&Ref> {
        self.srcs.get(slot).and_then(|s| s.as_ref())
    }

    /// Iterate occupied source slots.
    pub fn src_iter(&self) -> impl Iterator<Item = (usize, &Ref)> {
        self.srcs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
    }

    /// Source slots that are neither the predicate nor the indirect address.
    pub fn operand_iter(&self) -> impl Iterator<Item = (usize, &Ref)> {
        let pred = self.predicate;
        let ind = self.indirect;
        self.src_iter()
            .filter(move |(i, _)| Some(*i) != pred && Some(*i) != ind)
    }

    pub fn is_predicated(&self) -> bool {
        self.predicate.is_some()
    }

    /// The count of occupied source slots.
    pub fn num_srcs(&self) -> usize {
        self.srcs.iter().filter(|s| s.is_some()).count()
    }

    /// Instructions the optimizer may never delete outright.
    pub fn must_keep(&self) -> bool {
        self.fixed || self.terminator || self.is_join || self.opcode.has_side_effects()
    }

    /// Operation equality for CSE: same opcode, same opcode-specific
    /// attributes, ignoring operands.
    pub fn operation_eq(&self, other: &Instruction) -> bool {
        !self.opcode.volatile_for_cse()
            && self.opcode == other.opcode
            && self.ext == other.ext
            && self.cc == other.cc
            && self.set_cond == other.set_cond
            && self.saturate == other.saturate
            && self.lanes == other.lanes
            && self.quadop == other.quadop
    }

    /// Sinking a modifier into source `slot` is legal when the op supports
    /// the bits and the instruction is not predicated (the predicate slot
    /// shares hardware encoding space with source modifiers).
    pub fn can_take_src_mod(&self, slot: usize, m: Modifier) -> bool {
        if self.is_predicated() {
            return false;
        }
        let sup = self.opcode.supported_src_mods(slot);
        (!m.has(Modifier::NEG) || sup.has(Modifier::NEG))
            && (!m.has(Modifier::ABS) || sup.has(Modifier::ABS))
            && (!m.has(Modifier::NOT) || sup.has(Modifier::NOT))
            && !m.has(Modifier::SAT)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cond_code_inversion_round_trips() {
        for cc in [
            CondCode::Fl,
            CondCode::Lt,
            CondCode::Eq,
            CondCode::Le,
            CondCode::Gt,
            CondCode::Ne,
            CondCode::Ge,
            CondCode::Tr,
        ] {
            assert_eq!(cc.invert().invert(), cc);
            assert_eq!(cc.swapped().swapped(), cc);
        }
        assert_eq!(CondCode::Lt.invert(), CondCode::Ge);
        assert_eq!(CondCode::Lt.swapped(), CondCode::Gt);
    }

    #[test]
    fn quadop_is_never_cse_candidate() {
        let a = Instruction::new(Opcode::Quadop);
        let b = Instruction::new(Opcode::Quadop);
        assert!(!a.operation_eq(&b));
        let c = Instruction::new(Opcode::Add(DType::F32));
        let d = Instruction::new(Opcode::Add(DType::F32));
        assert!(c.operation_eq(&d));
    }

    #[test]
    fn mad_rejects_abs_on_mul_pair() {
        let i = Instruction::new(Opcode::Mad(DType::F32));
        assert!(i.can_take_src_mod(0, Modifier::NEG));
        assert!(!i.can_take_src_mod(0, Modifier::ABS));
        assert!(i.can_take_src_mod(2, Modifier::ABS));
    }
}
