//! If/else flattening. After allocation every conditional has a real else
//! block, so a diamond can be collapsed by predicating both arms and
//! deleting the branch, provided each arm is short and every instruction in
//! it accepts a predicate.

use super::is_noop;
use crate::cfg::{BlockId, EdgeKind};
use crate::error::CompileError;
use crate::instruction::{CondCode, Opcode, MAX_SRCS};
use crate::program::Program;
use crate::value::{Ref, ValueId};

/// Arms longer than this keep their branches.
const FLATTEN_LIMIT: usize = 12;

pub(super) fn run(p: &mut Program, root: BlockId) -> Result<(), CompileError> {
    let seq = p.new_pass_seq();
    visit(p, seq, root)
}

/// Whether `b` heads a plain if/else/endif diamond: both arms fall forward
/// into the same merge block and have no other successor. An arm that
/// breaks out of a loop has a fake out-edge instead and keeps its branch.
fn is_if_else_endif(p: &Program, b: BlockId) -> bool {
    if p[b].out.len() != 2 {
        return false;
    }
    let (t, e) = (p[b].out[0].0, p[b].out[1].0);
    if p[t].out.len() != 1 || p[e].out.len() != 1 {
        return false;
    }
    let (t0, tk) = p[t].out[0];
    let (e0, ek) = p[e].out[0];
    t0 == e0 && tk == EdgeKind::Forward && ek == EdgeKind::Forward
}

fn same_phys(p: &Program, a: ValueId, b: ValueId) -> bool {
    p[a].file == p[b].file && p[a].reg.is_some() && p[a].reg == p[b].reg
}

/// A branch is fine (it is deleted, or turned conditional, by
/// `predicate_block`); anything else must take the predicate and must not
/// overwrite the predicate's register inside the arm.
fn may_predicate(p: &Program, i: crate::instruction::InstId, pred: ValueId) -> bool {
    if p[i].opcode == Opcode::Bra {
        return !p[i].is_predicated();
    }
    if p[i].is_predicated() || !p[i].opcode.predicateable() {
        return false;
    }
    match p[i].defs.first() {
        Some(&d) => !same_phys(p, d, pred),
        None => true,
    }
}

/// Predicate every instruction in `b` and drop the trailing branch to the
/// merge block, leaving pure fall-through.
fn predicate_block(
    p: &mut Program,
    b: BlockId,
    pred: ValueId,
    cc: CondCode,
) -> Result<(), CompileError> {
    let mut last = None;
    for i in p.block_insns(b) {
        last = Some(i);
        if is_noop(p, i) {
            continue;
        }
        let s = (0..MAX_SRCS)
            .find(|&s| p[i].src(s).is_none())
            .ok_or(CompileError::Internal("no free slot for a predicate"))?;
        p.set_src(i, s, Some(Ref::new(pred)));
        p[i].predicate = Some(s);
        p[i].cc = cc;
    }
    if let Some(l) = last {
        if p[l].opcode == Opcode::Bra {
            p.delete_inst(l);
        }
    }
    Ok(())
}

fn visit(p: &mut Program, seq: u32, b: BlockId) -> Result<(), CompileError> {
    p[b].pass_seq = seq;

    if is_if_else_endif(p, b) {
        let exit = p[b]
            .exit
            .ok_or(CompileError::Internal("conditional block without a branch"))?;
        let pred = p[exit]
            .predicate
            .and_then(|s| p[exit].src(s))
            .map(|r| r.value);
        if let Some(pred) = pred {
            let (t, e) = (p[b].out[0].0, p[b].out[1].0);

            let then_arm = p.block_insns(t);
            let else_arm = p.block_insns(e);
            let ok = then_arm.iter().chain(&else_arm).all(|&i| may_predicate(p, i, pred));

            if ok && then_arm.len() < FLATTEN_LIMIT && else_arm.len() < FLATTEN_LIMIT {
                let cc = p[exit].cc;
                predicate_block(p, t, pred, cc.invert())?;
                predicate_block(p, e, pred, cc)?;

                p.delete_inst(exit);
                if let Some(x) = p[b].exit {
                    if p[x].opcode == Opcode::Joinat {
                        p.delete_inst(x);
                    }
                }

                // The merge point no longer reconverges anything.
                let merge = p[t].out[0].0;
                if let Some(first) = p[merge].entry {
                    p[first].is_join = false;
                    if p[first].opcode == Opcode::Join {
                        p.delete_inst(first);
                    }
                }
            }
        }
    }

    for o in 0..p[b].out.len() {
        let s = p[b].out[o].0;
        if p[s].pass_seq < seq {
            visit(p, seq, s)?;
        }
    }
    Ok(())
}
