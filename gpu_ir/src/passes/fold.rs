//! Algebraic simplification and constant folding.
//!
//! Immediates are recognized either directly or through the Mov that loads
//! them, so this runs before load folding. MUL+ADD fusion into MAD lives
//! here too because it wants to see modifiers before they are lowered.

use crate::cfg::BlockId;
use crate::error::CompileError;
use crate::instruction::{CvtInfo, DType, InstId, OpExt, Opcode};
use crate::program::Program;
use crate::value::{Imm, Modifier, Ref, RegFile, ValueId};

fn op_dtype(op: Opcode) -> Option<DType> {
    match op {
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
        | Opcode::Shr(t) => Some(t),
        Opcode::Rcp | Opcode::Rsq => Some(DType::F32),
        _ => None,
    }
}

/// The literal behind source `slot`: an immediate operand, the hardwired
/// zero register, or the result of a Mov that loads an immediate.
fn find_immediate(p: &Program, i: InstId, slot: usize) -> Option<(Imm, Modifier)> {
    let r = p[i].src(slot)?;
    let v = r.value;
    if p[v].is_imm() {
        return Some((p[v].imm.unwrap(), r.modifier));
    }
    if p[v].is_zero_reg() {
        return Some((Imm::u32(0), r.modifier));
    }
    let def = p[v].def?;
    if p[def].opcode == Opcode::Mov {
        let inner = p[def].src(0)?;
        if p[inner.value].is_imm() && p[inner.value].size == 4 {
            return Some((p[inner.value].imm.unwrap(), r.modifier));
        }
    }
    None
}

fn apply_mod(bits: u32, dtype: DType, m: Modifier) -> u32 {
    match dtype {
        DType::F32 => m.apply_f32(f32::from_bits(bits)).to_bits(),
        _ => m.apply_u32(bits),
    }
}

/// Both operands constant: evaluate and rewrite into a Mov (or, for MAD,
/// into an ADD of the remaining operand).
fn constant_expression(
    p: &mut Program,
    i: InstId,
    imm0: (Imm, Modifier),
    imm1: (Imm, Modifier),
) -> Result<(), CompileError> {
    if p[i].defs.is_empty() {
        return Ok(());
    }
    let op = p[i].opcode;
    let Some(dtype) = op_dtype(op) else {
        return Ok(());
    };
    let u0 = apply_mod(imm0.0.as_u32(), dtype, imm0.1);
    let u1 = apply_mod(imm1.0.as_u32(), dtype, imm1.1);
    let (f0, f1) = (f32::from_bits(u0), f32::from_bits(u1));

    let bits = match op {
        Opcode::Mad(DType::F32) => {
            let Some(r2) = p[i].src(2) else { return Ok(()) };
            if p[r2.value].file != RegFile::Gpr {
                return Ok(());
            }
            (f0 * f1).to_bits()
        }
        Opcode::Mul(DType::F32) => (f0 * f1).to_bits(),
        Opcode::Mul(DType::U32) | Opcode::Mul(DType::B32) => u0.wrapping_mul(u1),
        Opcode::Add(DType::F32) => (f0 + f1).to_bits(),
        Opcode::Add(DType::U32) | Opcode::Add(DType::B32) => u0.wrapping_add(u1),
        Opcode::Sub(DType::F32) => (f0 - f1).to_bits(),
        _ => return Ok(()),
    };

    let val = p.new_imm(Imm::u32(bits))?;

    if op == Opcode::Mad(DType::F32) {
        let r2 = *p[i].src(2).unwrap();
        p.set_src(i, 2, None);
        p.set_src(i, 0, Some(r2));
        p.set_src(i, 1, Some(Ref::new(val)));
        p[i].opcode = Opcode::Add(DType::F32);
        if bits == 0 {
            p.set_src(i, 1, None);
            p[i].opcode = Opcode::Mov;
        }
    } else {
        p.set_src(i, 0, Some(Ref::new(val)));
        p.set_src(i, 1, None);
        p[i].opcode = Opcode::Mov;
    }
    Ok(())
}

/// One constant operand: strength-reduce where the identity is exact.
fn constant_operand(
    p: &mut Program,
    i: InstId,
    imm: Imm,
    s: usize,
) -> Result<(), CompileError> {
    if p[i].defs.is_empty() {
        return Ok(());
    }
    let t = s ^ 1;
    let op = p[i].opcode;
    let Some(dtype) = op_dtype(op) else {
        return Ok(());
    };
    let smod = p[i].src(s).map(|r| r.modifier).unwrap_or_default();
    let u = apply_mod(imm.as_u32(), dtype, smod);
    let f = f32::from_bits(u);

    if u == 0 && matches!(op, Opcode::Mul(_)) {
        // x * 0 is zero, whatever x holds.
        let val = p.new_imm(Imm::u32(0))?;
        p.set_src(i, t, None);
        p.set_src(i, 1, None);
        p.set_src(i, 0, Some(Ref::new(val)));
        p[i].opcode = Opcode::Mov;
        return Ok(());
    }

    match op {
        Opcode::Mul(DType::F32) => {
            if f == 1.0 || f == -1.0 {
                let mut rt = *p[i].src(t).unwrap();
                if f == -1.0 {
                    rt.modifier = rt.modifier.negated();
                }
                let new_op = if rt.modifier.is_none() {
                    if p[i].saturate {
                        Opcode::Sat
                    } else {
                        Opcode::Mov
                    }
                } else if rt.modifier == Modifier::NEG {
                    Opcode::Neg(DType::F32)
                } else if rt.modifier == Modifier::ABS {
                    Opcode::Abs(DType::F32)
                } else {
                    return Ok(());
                };
                p[i].opcode = new_op;
                p[i].saturate = false;
                p.set_src(i, 1, None);
                p.set_src(i, 0, Some(Ref::new(rt.value)));
            } else if f == 2.0 || f == -2.0 {
                let mut rt = *p[i].src(t).unwrap();
                if f == -2.0 {
                    rt.modifier = rt.modifier.negated();
                }
                p[i].opcode = Opcode::Add(DType::F32);
                p.set_src(i, s, Some(rt));
                p.set_src(i, t, Some(rt));
            }
        }
        Opcode::Add(DType::F32) => {
            if u == 0 {
                let rt = *p[i].src(t).unwrap();
                let m = rt.modifier;
                if m.is_none() {
                    p[i].opcode = if p[i].saturate {
                        Opcode::Sat
                    } else {
                        Opcode::Mov
                    };
                    p[i].saturate = false;
                    p.set_src(i, 1, None);
                    p.set_src(i, 0, Some(Ref::new(rt.value)));
                } else if m == Modifier::NEG {
                    p[i].opcode = Opcode::Neg(DType::F32);
                    p.set_src(i, 1, None);
                    p.set_src(i, 0, Some(Ref::new(rt.value)));
                } else if m == Modifier::ABS {
                    p[i].opcode = Opcode::Abs(DType::F32);
                    p.set_src(i, 1, None);
                    p.set_src(i, 0, Some(Ref::new(rt.value)));
                } else if m == (Modifier::NEG | Modifier::ABS) {
                    p[i].opcode = Opcode::Cvt;
                    p[i].ext = OpExt::Cvt(CvtInfo {
                        dst: DType::F32,
                        src: DType::F32,
                        round: None,
                    });
                    p.set_src(i, 1, None);
                    p.set_src(i, 0, Some(rt));
                }
            }
        }
        Opcode::Add(DType::U32) | Opcode::Add(DType::B32) => {
            if u == 0 {
                let rt = *p[i].src(t).unwrap();
                p[i].opcode = Opcode::Mov;
                p.set_src(i, 1, None);
                p.set_src(i, 0, Some(Ref::new(rt.value)));
            }
        }
        Opcode::Mul(DType::U32) | Opcode::Mul(DType::B32) => {
            if u == 1 {
                let rt = *p[i].src(t).unwrap();
                p[i].opcode = Opcode::Mov;
                p.set_src(i, 1, None);
                p.set_src(i, 0, Some(Ref::new(rt.value)));
            } else if u.is_power_of_two() {
                let rt = *p[i].src(t).unwrap();
                let shift = p.new_imm(Imm::u32(u.trailing_zeros()))?;
                p[i].opcode = Opcode::Shl;
                p.set_src(i, 0, Some(Ref::new(rt.value)));
                p.set_src(i, 1, Some(Ref::new(shift)));
            }
        }
        Opcode::Rcp => {
            let val = p.new_imm(Imm::f32(1.0 / f))?;
            p[i].opcode = Opcode::Mov;
            p.set_src(i, 0, Some(Ref::new(val)));
        }
        Opcode::Rsq => {
            let val = p.new_imm(Imm::f32(1.0 / f.sqrt()))?;
            p[i].opcode = Opcode::Mov;
            p.set_src(i, 0, Some(Ref::new(val)));
        }
        _ => {}
    }
    Ok(())
}

/// min(x, x) and max(x, x) are x.
fn fold_min_max(p: &mut Program, i: InstId) {
    let (Some(r0), Some(r1)) = (p[i].src(0).copied(), p[i].src(1).copied()) else {
        return;
    };
    if r0.value != r1.value || !r0.modifier.is_none() || !r1.modifier.is_none() {
        return;
    }
    if p[r0.value].file != RegFile::Gpr {
        return;
    }
    let d = p[i].defs[0];
    p.delete_inst(i);
    p.replace_value(d, r0.value);
}

/// Fuse ADD(MUL(a, b), c) into MAD when the multiply has no other user and
/// everything sits in the same block with at most negate modifiers.
fn fuse_mad(p: &mut Program, i: InstId) {
    let (Some(r0), Some(r1)) = (p[i].src(0).copied(), p[i].src(1).copied()) else {
        return;
    };
    let is_single_use_mul = |p: &Program, v: ValueId| -> bool {
        match p[v].def {
            Some(d) => p[d].opcode == Opcode::Mul(DType::F32) && p[v].refc == 1,
            None => false,
        }
    };
    let s = if is_single_use_mul(p, r0.value) {
        0
    } else if is_single_use_mul(p, r1.value) {
        1
    } else {
        return;
    };

    let bb = p[i].bb;
    for r in [r0, r1] {
        if let Some(d) = p[r.value].def {
            if p[d].bb != bb {
                return;
            }
        }
        // Constant folding may have left immediates behind.
        if p[r.value].file != RegFile::Gpr {
            return;
        }
    }

    let rs = if s == 0 { r0 } else { r1 };
    let rt = if s == 0 { r1 } else { r0 };
    let mul = p[rs.value].def.unwrap();
    let m0 = *p[mul].src(0).unwrap();
    let m1 = *p[mul].src(1).unwrap();

    let all = rs.modifier | rt.modifier | m0.modifier | m1.modifier;
    if !all.without(Modifier::NEG).is_none() {
        return;
    }

    p[i].opcode = Opcode::Mad(DType::F32);
    p.set_src(i, 0, Some(Ref::with_mod(m0.value, m0.modifier.toggled(rs.modifier))));
    p.set_src(i, 1, Some(Ref::with_mod(m1.value, m1.modifier)));
    p.set_src(i, 2, Some(Ref::with_mod(rt.value, rt.modifier)));
    // The multiply is now unused; DCE sweeps it.
}

pub fn run(p: &mut Program, root: BlockId) -> Result<(), CompileError> {
    for b in p.pass_order(root) {
        for i in p.block_insns(b) {
            if !p.contains_inst(i) {
                continue;
            }
            let imm0 = find_immediate(p, i, 0);
            let imm1 = find_immediate(p, i, 1);
            match (imm0, imm1) {
                (Some(a), Some(bm)) => constant_expression(p, i, a, bm)?,
                (Some(a), None) => constant_operand(p, i, a.0, 0)?,
                (None, Some(bm)) => constant_operand(p, i, bm.0, 1)?,
                (None, None) => {}
            }
            if !p.contains_inst(i) {
                continue;
            }
            match p[i].opcode {
                Opcode::Min(_) | Opcode::Max(_) => fold_min_max(p, i),
                Opcode::Add(DType::F32) => fuse_mad(p, i),
                _ => {}
            }
        }
    }
    Ok(())
}
