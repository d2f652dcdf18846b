//! Lower standalone Neg/Abs/Sat instructions into source modifiers and
//! result flags of their consumers. Runs before load folding so it never has
//! to reason about modifiers on memory operands.

use crate::cfg::BlockId;
use crate::instruction::{DType, InstId, Opcode};
use crate::program::Program;
use crate::value::Modifier;

fn sink_mods(p: &mut Program, i: InstId) {
    for j in 0..3 {
        let Some(r) = p[i].src(j).copied() else {
            continue;
        };
        let Some(mi) = p[r.value].def else { continue };
        if p[mi].defs.is_empty() || p[p[mi].defs[0]].refc > 1 || p[mi].is_predicated() {
            continue;
        }
        let mut m = match p[mi].opcode {
            Opcode::Neg(_) => Modifier::NEG,
            Opcode::Abs(_) => Modifier::ABS,
            _ => continue,
        };
        let inner = p[mi].src(0).map(|s| s.modifier).unwrap_or_default();
        m = m | inner;

        let mut new_op = None;
        if matches!(p[i].opcode, Opcode::Abs(_)) || r.modifier.has(Modifier::ABS) {
            // The outer abs swallows every inner sign change.
            m = m.without(Modifier::NEG | Modifier::ABS);
        } else if matches!(p[i].opcode, Opcode::Neg(_)) && m.has(Modifier::NEG) {
            // neg(neg(x)) is x, neg(neg(abs(x))) is abs(x).
            new_op = Some(if m.has(Modifier::ABS) {
                match p[i].opcode {
                    Opcode::Neg(t) => Opcode::Abs(t),
                    _ => unreachable!(),
                }
            } else {
                Opcode::Mov
            });
            m = Modifier::NONE;
        }

        let check = Opcode::supported_src_mods(new_op.unwrap_or(p[i].opcode), j);
        if (m.has(Modifier::NEG) && !check.has(Modifier::NEG))
            || (m.has(Modifier::ABS) && !check.has(Modifier::ABS))
        {
            continue;
        }
        if p[i].is_predicated() && !m.is_none() {
            continue;
        }

        if let Some(op) = new_op {
            p[i].opcode = op;
        }
        let inner_val = p[mi].src(0).unwrap().value;
        p.set_src(
            i,
            j,
            Some(crate::value::Ref::with_mod(
                inner_val,
                r.modifier.toggled(m),
            )),
        );
    }
}

/// Fold a Sat instruction into the saturate flag of the Add/Mul/Mad that
/// feeds it, transferring the Sat's result value to the producer.
fn sink_sat(p: &mut Program, i: InstId) {
    let Some(r) = p[i].src(0).copied() else { return };
    let Some(mi) = p[r.value].def else { return };
    if p[p[mi].defs[0]].refc > 1 {
        return;
    }
    if !matches!(
        p[mi].opcode,
        Opcode::Add(DType::F32) | Opcode::Mul(DType::F32) | Opcode::Mad(DType::F32)
    ) {
        return;
    }
    let old = p[mi].defs[0];
    let new = p[i].defs[0];
    p.delete_inst(i);
    p[mi].saturate = true;
    p[mi].defs[0] = new;
    p[new].def = Some(mi);
    p[old].def = None;
}

pub fn run(p: &mut Program, root: BlockId) {
    for b in p.pass_order(root) {
        for i in p.block_insns(b) {
            if !p.contains_inst(i) {
                continue;
            }
            if let Opcode::Sub(t) = p[i].opcode {
                if let Some(r) = p[i].src(1).copied() {
                    p.set_src(
                        i,
                        1,
                        Some(crate::value::Ref::with_mod(r.value, r.modifier.negated())),
                    );
                    p[i].opcode = Opcode::Add(t);
                }
            }

            sink_mods(p, i);

            if p[i].opcode == Opcode::Sat && !p[i].defs.is_empty() {
                sink_sat(p, i);
            }
        }
    }
}
