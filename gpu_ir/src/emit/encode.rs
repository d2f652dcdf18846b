//! Instruction word packing.
//!
//! Every instruction becomes a 64-bit pair `[w0, w1]`. `w0` always starts
//! with the opcode number in its low byte; the rest of the pair depends on
//! the opcode's format family:
//!
//!   alu      w0: op | dst<<8 | s0<<14 | s1<<20 | s2<<26
//!            w1: exec | dtype<<8 | mod0<<10 | mod1<<13 | mod2<<16
//!                | setcond<<19
//!   quadop   w1: exec | qop<<8 | lanes<<16
//!   imm mov  w0: op | dst<<8 | 1<<14 | join<<15 | pred<<26 | cc<<29
//!            w1: the 32 immediate bits
//!   memory   w0: op | data<<8 | ptr<<14 | space<<20 | bank<<23
//!            w1: exec | bytes<<8 | address<<16
//!   tex      w0: op | dst<<8 | coord<<14
//!            w1: exec | mask<<8 | unit<<12 | target<<16
//!   cvt      w0: op | dst<<8 | src<<14 | mod<<20
//!            w1: exec | dst type<<8 | src type<<10 | round<<12
//!   interp   w0: op | dst<<8 | w<<14
//!            w1: exec | centroid<<8 | flat<<9 | address<<16
//!   flow     w0: op | pred<<8 | cc<<11 | join<<14
//!            w1: signed byte offset to the target (or a relocated call
//!                address)
//!
//! `exec` is the shared low byte of `w1`: predicate register (7 when
//! unpredicated), condition code, saturate bit, join bit. Register number
//! 63 doubles as "no register" in every 6-bit field.

use super::{RelocKind, Relocation, INSN_BYTES};
use crate::error::CompileError;
use crate::instruction::{
    CondCode, CvtInfo, DType, InstId, InterpInfo, OpExt, Opcode, RoundMode, TexInfo, TexTarget,
};
use crate::program::Program;
use crate::value::{Modifier, Ref, RegFile, ValueId};

/// Opcode number of the sentinel appended after the last real instruction.
pub(super) const TRAP_OP: u32 = 0xff;

const NO_REG: u32 = 63;
const NO_PRED: u32 = 7;

fn op_id(op: Opcode) -> Result<u32, CompileError> {
    Ok(match op {
        Opcode::Mov => 1,
        Opcode::Ld => 2,
        Opcode::St => 3,
        Opcode::Vfetch => 4,
        Opcode::Export => 5,
        Opcode::Add(_) => 6,
        Opcode::Sub(_) => 7,
        Opcode::Mul(_) => 8,
        Opcode::Mad(_) => 9,
        Opcode::Min(_) => 10,
        Opcode::Max(_) => 11,
        Opcode::Neg(_) => 12,
        Opcode::Abs(_) => 13,
        Opcode::Sat => 14,
        Opcode::Cvt => 15,
        Opcode::Set(_) => 16,
        Opcode::Slct(_) => 17,
        Opcode::And => 18,
        Opcode::Or => 19,
        Opcode::Xor => 20,
        Opcode::Not => 21,
        Opcode::Shl => 22,
        Opcode::Shr(_) => 23,
        Opcode::Rcp => 24,
        Opcode::Rsq => 25,
        Opcode::Lg2 => 26,
        Opcode::Ex2 => 27,
        Opcode::PreEx2 => 28,
        Opcode::Sin => 29,
        Opcode::Cos => 30,
        Opcode::PreSin => 31,
        Opcode::Quadop => 32,
        Opcode::Linterp => 33,
        Opcode::Pinterp => 34,
        Opcode::Tex => 35,
        Opcode::Txb => 36,
        Opcode::Txl => 37,
        Opcode::Kil => 38,
        Opcode::Bra => 40,
        Opcode::Call => 41,
        Opcode::Ret => 42,
        Opcode::Exit => 43,
        Opcode::Joinat => 44,
        Opcode::Join => 45,
        Opcode::Nop | Opcode::Phi | Opcode::Select | Opcode::Bind | Opcode::Undef => {
            return Err(CompileError::Internal("pseudo op survived pre-emission"))
        }
    })
}

fn cc_code(cc: CondCode) -> u32 {
    match cc {
        CondCode::Fl => 0,
        CondCode::Lt => 1,
        CondCode::Eq => 2,
        CondCode::Le => 3,
        CondCode::Gt => 4,
        CondCode::Ne => 5,
        CondCode::Ge => 6,
        CondCode::Tr => 7,
    }
}

fn dtype_code(t: DType) -> u32 {
    match t {
        DType::F32 => 0,
        DType::S32 => 1,
        DType::U32 => 2,
        DType::B32 => 3,
    }
}

fn mod_bits(m: Modifier) -> u32 {
    let mut bits = 0;
    if m.has(Modifier::NEG) {
        bits |= 1;
    }
    if m.has(Modifier::ABS) {
        bits |= 2;
    }
    if m.has(Modifier::NOT) {
        bits |= 4;
    }
    bits
}

fn target_code(t: TexTarget) -> u32 {
    match t {
        TexTarget::Tex1D => 0,
        TexTarget::Tex2D => 1,
        TexTarget::Tex3D => 2,
        TexTarget::Cube => 3,
        TexTarget::Array1D => 4,
        TexTarget::Array2D => 5,
        TexTarget::Shadow1D => 6,
        TexTarget::Shadow2D => 7,
    }
}

fn round_code(r: Option<RoundMode>) -> u32 {
    match r {
        None => 0,
        Some(RoundMode::Near) => 1,
        Some(RoundMode::Zero) => 2,
        Some(RoundMode::NegInf) => 3,
        Some(RoundMode::PosInf) => 4,
    }
}

/// Memory space field of the memory family, with the constant bank when the
/// space has banks.
fn space_code(f: RegFile) -> Result<(u32, u32), CompileError> {
    Ok(match f {
        RegFile::MemC(bank) => (0, bank as u32),
        RegFile::MemA => (1, 0),
        RegFile::MemV => (2, 0),
        RegFile::MemL => (3, 0),
        RegFile::MemG => (4, 0),
        RegFile::MemS => (5, 0),
        _ => return Err(CompileError::Internal("memory op on a register operand")),
    })
}

pub(super) struct Encoder<'a> {
    p: &'a Program,
    words: Vec<u32>,
    relocs: Vec<Relocation>,
}

impl<'a> Encoder<'a> {
    pub(super) fn new(p: &'a Program) -> Encoder<'a> {
        Encoder {
            p,
            words: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// Byte position of the instruction being encoded next.
    fn pos(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    pub(super) fn finish(mut self) -> (Vec<u32>, Vec<Relocation>) {
        self.words.push(TRAP_OP);
        self.words.push(0);
        (self.words, self.relocs)
    }

    fn push(&mut self, w0: u32, w1: u32) {
        self.words.push(w0);
        self.words.push(w1);
    }

    fn reg(&self, v: ValueId) -> u32 {
        self.p[v].reg.unwrap_or(NO_REG)
    }

    fn def_reg(&self, i: InstId) -> u32 {
        match self.p[i].defs.first() {
            Some(&d) => self.reg(d),
            None => NO_REG,
        }
    }

    fn pred_reg(&self, i: InstId) -> u32 {
        self.p[i]
            .predicate
            .and_then(|s| self.p[i].src(s))
            .map_or(NO_PRED, |r| self.reg(r.value))
    }

    /// The shared low byte of `w1`.
    fn exec(&self, i: InstId) -> u32 {
        let inst = &self.p[i];
        self.pred_reg(i)
            | cc_code(inst.cc) << 3
            | (inst.saturate as u32) << 6
            | (inst.is_join as u32) << 7
    }

    /// Up to three register operands with their modifiers, in slot order.
    fn operands(&self, i: InstId) -> [(u32, u32); 3] {
        let mut out = [(NO_REG, 0); 3];
        for (n, (_, r)) in self.p[i].operand_iter().take(3).enumerate() {
            out[n] = (self.reg(r.value), mod_bits(r.modifier));
        }
        out
    }

    pub(super) fn instruction(&mut self, i: InstId) -> Result<(), CompileError> {
        let op = self.p[i].opcode;
        match op {
            op if op.is_flow() => self.flow(i),
            Opcode::Ld | Opcode::St | Opcode::Vfetch | Opcode::Export => self.memory(i),
            op if op.is_tex() => self.tex(i),
            Opcode::Cvt => self.cvt(i),
            Opcode::Linterp | Opcode::Pinterp => self.interp(i),
            Opcode::Quadop => self.quadop(i),
            Opcode::Mov if self.mov_imm(i).is_some() => self.imm_mov(i),
            _ => self.alu(i),
        }
    }

    fn mov_imm(&self, i: InstId) -> Option<&Ref> {
        let r = self.p[i].src(0)?;
        self.p[r.value].is_imm().then_some(r)
    }

    fn alu(&mut self, i: InstId) -> Result<(), CompileError> {
        let inst = &self.p[i];
        let [(s0, m0), (s1, m1), (s2, m2)] = self.operands(i);
        let dtype = match inst.opcode {
            Opcode::Add(t)
            | Opcode::Sub(t)
            | Opcode::Mul(t)
            | Opcode::Mad(t)
            | Opcode::Min(t)
            | Opcode::Max(t)
            | Opcode::Neg(t)
            | Opcode::Abs(t)
            | Opcode::Set(t)
            | Opcode::Slct(t)
            | Opcode::Shr(t) => t,
            _ => DType::B32,
        };
        let w0 = op_id(inst.opcode)?
            | self.def_reg(i) << 8
            | s0 << 14
            | s1 << 20
            | s2 << 26;
        let w1 = self.exec(i)
            | dtype_code(dtype) << 8
            | m0 << 10
            | m1 << 13
            | m2 << 16
            | cc_code(inst.set_cond) << 19;
        self.push(w0, w1);
        Ok(())
    }

    fn quadop(&mut self, i: InstId) -> Result<(), CompileError> {
        let [(s0, _), (s1, _), _] = self.operands(i);
        let w0 = op_id(Opcode::Quadop)? | self.def_reg(i) << 8 | s0 << 14 | s1 << 20;
        let w1 = self.exec(i)
            | (self.p[i].quadop as u32) << 8
            | (self.p[i].lanes as u32) << 16;
        self.push(w0, w1);
        Ok(())
    }

    fn imm_mov(&mut self, i: InstId) -> Result<(), CompileError> {
        let r = self
            .mov_imm(i)
            .ok_or(CompileError::Internal("immediate operand vanished"))?;
        let imm = self.p[r.value]
            .imm
            .ok_or(CompileError::Internal("immediate value without bits"))?;
        let bits = r.modifier.apply_u32(imm.as_u32());
        let w0 = op_id(Opcode::Mov)?
            | self.def_reg(i) << 8
            | 1 << 14
            | (self.p[i].is_join as u32) << 15
            | self.pred_reg(i) << 26
            | cc_code(self.p[i].cc) << 29;
        self.push(w0, bits);
        Ok(())
    }

    fn memory(&mut self, i: InstId) -> Result<(), CompileError> {
        let inst = &self.p[i];
        let mem = inst
            .src(0)
            .ok_or(CompileError::Internal("memory op without an address operand"))?
            .value;
        let (space, bank) = space_code(self.p[mem].file)?;

        // Loads name their first destination, stores and exports the value
        // being written.
        let data = match inst.opcode {
            Opcode::Ld | Opcode::Vfetch => self.def_reg(i),
            _ => inst.src(1).map_or(NO_REG, |r| self.reg(r.value)),
        };
        let ptr = inst
            .indirect
            .and_then(|s| inst.src(s))
            .map_or(NO_REG, |r| self.reg(r.value));
        let bytes = match inst.opcode {
            Opcode::Ld | Opcode::Vfetch => {
                inst.defs.iter().map(|&d| self.p[d].size as u32).sum()
            }
            _ => self.p[mem].size as u32,
        };
        let address = self.p[mem].address;

        if let RegFile::MemC(_) = self.p[mem].file {
            // The constant buffer's placement is only known at load time.
            self.relocs.push(Relocation {
                offset: self.pos() + 4,
                kind: RelocKind::Data,
                addend: address,
                mask: 0xffff_0000,
                shift: 16,
            });
        }

        let w0 = op_id(inst.opcode)? | data << 8 | ptr << 14 | space << 20 | bank << 23;
        let w1 = self.exec(i) | bytes << 8 | (address & 0xffff) << 16;
        self.push(w0, w1);
        Ok(())
    }

    fn tex(&mut self, i: InstId) -> Result<(), CompileError> {
        let OpExt::Tex(TexInfo { unit, target, mask }) = self.p[i].ext else {
            return Err(CompileError::Internal("texture op without texture info"));
        };
        let [(coord, _), _, _] = self.operands(i);
        let w0 = op_id(self.p[i].opcode)? | self.def_reg(i) << 8 | coord << 14;
        let w1 = self.exec(i)
            | (mask as u32) << 8
            | (unit as u32) << 12
            | target_code(target) << 16;
        self.push(w0, w1);
        Ok(())
    }

    fn cvt(&mut self, i: InstId) -> Result<(), CompileError> {
        let OpExt::Cvt(CvtInfo { dst, src, round }) = self.p[i].ext else {
            return Err(CompileError::Internal("cvt without conversion info"));
        };
        let [(s0, m0), _, _] = self.operands(i);
        let w0 = op_id(Opcode::Cvt)? | self.def_reg(i) << 8 | s0 << 14 | m0 << 20;
        let w1 = self.exec(i)
            | dtype_code(dst) << 8
            | dtype_code(src) << 10
            | round_code(round) << 12;
        self.push(w0, w1);
        Ok(())
    }

    fn interp(&mut self, i: InstId) -> Result<(), CompileError> {
        let inst = &self.p[i];
        let info = match inst.ext {
            OpExt::Interp(info) => info,
            _ => InterpInfo {
                centroid: false,
                flat: false,
            },
        };
        let mem = inst
            .src(0)
            .ok_or(CompileError::Internal("interp without an input operand"))?
            .value;
        let w = inst.src(1).map_or(NO_REG, |r| self.reg(r.value));
        let w0 = op_id(inst.opcode)? | self.def_reg(i) << 8 | w << 14;
        let w1 = self.exec(i)
            | (info.centroid as u32) << 8
            | (info.flat as u32) << 9
            | (self.p[mem].address & 0xffff) << 16;
        self.push(w0, w1);
        Ok(())
    }

    fn flow(&mut self, i: InstId) -> Result<(), CompileError> {
        let inst = &self.p[i];
        let w0 = op_id(inst.opcode)?
            | self.pred_reg(i) << 8
            | cc_code(inst.cc) << 11
            | (inst.is_join as u32) << 14;

        let w1 = match (inst.opcode, inst.target) {
            (Opcode::Call, Some(t)) => {
                // Subroutine entry points move with the code base.
                self.relocs.push(Relocation {
                    offset: self.pos() + 4,
                    kind: RelocKind::Code,
                    addend: self.p[t].emit_pos,
                    mask: 0xffff_ffff,
                    shift: 0,
                });
                0
            }
            (_, Some(t)) => {
                let delta = self.p[t].emit_pos as i64 - self.pos() as i64;
                debug_assert_eq!(delta % INSN_BYTES as i64, 0);
                delta as i32 as u32
            }
            (_, None) => 0,
        };
        self.push(w0, w1);
        Ok(())
    }
}
