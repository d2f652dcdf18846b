//! A shader-program compiler back-end.
//!
//! The pipeline takes an abstract source instruction stream ([`SourceShader`]),
//! builds an SSA control-flow graph over an arena-backed [`Program`], runs the
//! machine-independent optimization passes, allocates registers with a
//! coalescing linear scan, and encodes fixed-width instruction words plus the
//! relocation table and header the driver-side loader consumes.
//!
//! [`compile`] runs the whole pipeline; the phase modules ([`builder`],
//! [`passes`], [`regalloc`], [`emit`]) are public for callers that want to
//! stop in the middle or inspect the IR between phases.

mod compile;
mod error;
mod instruction;
mod program;
mod source;
mod value;

pub mod builder;
pub mod cfg;
pub mod emit;
pub mod outputter;
pub mod passes;
pub mod regalloc;

pub use compile::{
    compile, compile_with_dumps, CompileOpts, CompileOptsBuilder, CompiledProgram, DumpPoint,
};
pub use error::CompileError;
pub use instruction::{
    CondCode, CvtInfo, DType, InstId, Instruction, InterpInfo, OpExt, Opcode, RoundMode, TexInfo,
    TexTarget, MAX_DEFS, MAX_SRCS,
};
pub use program::{MaxReg, Program, MAX_BLOCKS, MAX_INSNS, MAX_VALUES};
pub use source::{
    Comp, Decl, DeclClass, DstFile, DstOperand, ImmVec, InterpMode, Semantic, ShaderKind, SignMode,
    SourceInst, SourceOp, SrcFile, SrcOperand, SourceShader, SWZ_XYZW,
};
pub use value::{Imm, Modifier, Range, RangeList, Ref, RegFile, UseLink, Value, ValueId};
