//! The abstract shader instruction stream handed to the compiler by the
//! front end: declarations, a vec4 immediate table and register-based
//! instructions with swizzles, sign modes and write masks.

use crate::instruction::TexTarget;
use arrayvec::ArrayVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
    Geometry,
}

/// Vector component selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comp {
    #[default]
    X,
    Y,
    Z,
    W,
}

impl Comp {
    pub fn from_index(i: usize) -> Comp {
        match i & 3 {
            0 => Comp::X,
            1 => Comp::Y,
            2 => Comp::Z,
            _ => Comp::W,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Comp::X => 0,
            Comp::Y => 1,
            Comp::Z => 2,
            Comp::W => 3,
        }
    }
}

pub const SWZ_XYZW: [Comp; 4] = [Comp::X, Comp::Y, Comp::Z, Comp::W];

/// Per-operand sign treatment applied after the swizzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignMode {
    #[default]
    Keep,
    Negate,
    /// Force positive.
    Abs,
    /// Force negative.
    NegAbs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrcFile {
    Temp,
    Input,
    Const(u8),
    Immediate,
    Address,
    Predicate,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstFile {
    Temp,
    Output,
    Address,
    Predicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcOperand {
    pub file: SrcFile,
    pub index: u32,
    pub swizzle: [Comp; 4],
    pub sign: SignMode,
    /// Address-register index for indirect addressing.
    pub indirect: Option<u32>,
}

impl SrcOperand {
    pub fn new(file: SrcFile, index: u32) -> SrcOperand {
        SrcOperand {
            file,
            index,
            swizzle: SWZ_XYZW,
            sign: SignMode::Keep,
            indirect: None,
        }
    }

    pub fn temp(index: u32) -> SrcOperand {
        Self::new(SrcFile::Temp, index)
    }

    pub fn input(index: u32) -> SrcOperand {
        Self::new(SrcFile::Input, index)
    }

    pub fn cbuf(bank: u8, index: u32) -> SrcOperand {
        Self::new(SrcFile::Const(bank), index)
    }

    pub fn imm(index: u32) -> SrcOperand {
        Self::new(SrcFile::Immediate, index)
    }

    pub fn swz(mut self, swizzle: [Comp; 4]) -> SrcOperand {
        self.swizzle = swizzle;
        self
    }

    /// Broadcast one component to all four.
    pub fn scalar(mut self, c: Comp) -> SrcOperand {
        self.swizzle = [c; 4];
        self
    }

    pub fn sign(mut self, sign: SignMode) -> SrcOperand {
        self.sign = sign;
        self
    }

    pub fn indirect(mut self, addr_reg: u32) -> SrcOperand {
        self.indirect = Some(addr_reg);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstOperand {
    pub file: DstFile,
    pub index: u32,
    pub write_mask: u8,
    pub indirect: Option<u32>,
}

impl DstOperand {
    pub fn new(file: DstFile, index: u32) -> DstOperand {
        DstOperand {
            file,
            index,
            write_mask: 0xf,
            indirect: None,
        }
    }

    pub fn temp(index: u32) -> DstOperand {
        Self::new(DstFile::Temp, index)
    }

    pub fn output(index: u32) -> DstOperand {
        Self::new(DstFile::Output, index)
    }

    pub fn mask(mut self, write_mask: u8) -> DstOperand {
        self.write_mask = write_mask;
        self
    }

    pub fn indirect(mut self, addr_reg: u32) -> DstOperand {
        self.indirect = Some(addr_reg);
        self
    }
}

/// Source-level opcodes. Anything else the front end could conceivably send
/// is reported as unsupported, never silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOp {
    Mov,
    Add,
    Sub,
    Mul,
    Mad,
    Min,
    Max,
    Abs,
    Flr,
    Trunc,
    Ceil,
    Frc,
    Dp3,
    Dp4,
    Rcp,
    Rsq,
    Ex2,
    Lg2,
    Pow,
    Sin,
    Cos,
    Lrp,
    Cmp,
    Seq,
    Sge,
    Sgt,
    Sle,
    Slt,
    Sne,
    And,
    Or,
    Xor,
    Not,
    Shl,
    IShr,
    UShr,
    UAdd,
    UMul,
    Ddx,
    Ddy,
    Tex,
    Txb,
    Txl,
    Txp,
    Kil,
    If,
    Else,
    Endif,
    BgnLoop,
    EndLoop,
    Brk,
    Cont,
    Ret,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInst {
    pub op: SourceOp,
    pub dst: Option<DstOperand>,
    pub srcs: ArrayVec<SrcOperand, 3>,
    /// Texture unit and target for Tex/Txb/Txl/Txp.
    pub tex: Option<(u8, TexTarget)>,
    pub saturate: bool,
}

impl SourceInst {
    pub fn new(op: SourceOp) -> SourceInst {
        SourceInst {
            op,
            dst: None,
            srcs: ArrayVec::new(),
            tex: None,
            saturate: false,
        }
    }

    pub fn dst(mut self, dst: DstOperand) -> SourceInst {
        self.dst = Some(dst);
        self
    }

    pub fn src(mut self, src: SrcOperand) -> SourceInst {
        self.srcs.push(src);
        self
    }

    pub fn tex(mut self, unit: u8, target: TexTarget) -> SourceInst {
        self.tex = Some((unit, target));
        self
    }

    pub fn sat(mut self) -> SourceInst {
        self.saturate = true;
        self
    }
}

/// What a declared input/output means to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    Position,
    Color(u8),
    TexCoord(u8),
    Generic(u8),
    PointSize,
    Depth,
    ClipDistance(u8),
    Face,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpMode {
    Flat,
    Linear,
    #[default]
    Perspective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclClass {
    Input,
    Output,
    SystemValue,
    Temp,
    Const(u8),
    Address,
    Predicate,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decl {
    pub class: DeclClass,
    /// Declared register range, inclusive.
    pub first: u32,
    pub last: u32,
    pub semantic: Option<Semantic>,
    pub interp: InterpMode,
    pub centroid: bool,
}

impl Decl {
    pub fn new(class: DeclClass, first: u32, last: u32) -> Decl {
        Decl {
            class,
            first,
            last,
            semantic: None,
            interp: InterpMode::Perspective,
            centroid: false,
        }
    }

    pub fn semantic(mut self, semantic: Semantic) -> Decl {
        self.semantic = Some(semantic);
        self
    }

    pub fn interp(mut self, interp: InterpMode) -> Decl {
        self.interp = interp;
        self
    }

    pub fn centroid(mut self) -> Decl {
        self.centroid = true;
        self
    }
}

/// One vec4 immediate; raw bits, components interpreted per consuming op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmVec(pub [u32; 4]);

impl ImmVec {
    pub fn from_f32(v: [f32; 4]) -> ImmVec {
        ImmVec([
            v[0].to_bits(),
            v[1].to_bits(),
            v[2].to_bits(),
            v[3].to_bits(),
        ])
    }

    pub fn splat_f32(v: f32) -> ImmVec {
        Self::from_f32([v; 4])
    }
}

/// The complete front-end hand-off for one shader.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceShader {
    pub kind: ShaderKind,
    pub decls: Vec<Decl>,
    pub immediates: Vec<ImmVec>,
    pub insns: Vec<SourceInst>,
    /// Enabled user clip planes (vertex stage only).
    pub clip_plane_mask: u8,
    /// Declared depth output present (fragment stage only).
    pub writes_depth: bool,
}

impl SourceShader {
    pub fn new(kind: ShaderKind) -> SourceShader {
        SourceShader {
            kind,
            decls: Vec::new(),
            immediates: Vec::new(),
            insns: Vec::new(),
            clip_plane_mask: 0,
            writes_depth: false,
        }
    }
}
