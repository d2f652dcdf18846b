//! Register allocation.
//!
//! Phase order per root: phi-operand isolation through fresh Movs (with
//! else-block synthesis where a conditional falls straight through), live
//! sets iterated to the loop-nesting bound, serial numbering in emission
//! order, interval building, coalescing (phi first, then the mandatory
//! select/bind joins, then best-effort copy elimination), constrained
//! vector allocation, and finally linear scan. There is no spilling; a full
//! file fails the compile.

mod coalesce;
mod intervals;
mod linear_scan;

#[cfg(test)]
mod test;

use crate::cfg::{BlockId, EdgeKind};
use crate::error::CompileError;
use crate::instruction::{InstId, Opcode, MAX_SRCS};
use crate::program::Program;
use crate::value::Ref;

/// Marks a phi operand already routed through a dedicated Mov.
const REF_FLAG_PHI_MOV: u8 = 1;

pub fn allocate(p: &mut Program) -> Result<(), CompileError> {
    for root in p.roots.clone() {
        allocate_root(p, root)?;
    }
    // Members of a join class read their register off the representative.
    for v in p.value_ids() {
        let r = coalesce::rep(p, v);
        if r != v {
            p[v].reg = p[r].reg;
        }
    }
    Ok(())
}

fn allocate_root(p: &mut Program, root: BlockId) -> Result<(), CompileError> {
    let seq = p.new_pass_seq();
    generate_phi_movs(p, seq, root)?;

    let live = intervals::build_live_sets(p, root);
    let insns = order_instructions(p, root);
    intervals::build_intervals(p, &live, root);

    coalesce::join_values(p, &insns, coalesce::JOIN_PHI)?;
    coalesce::join_values(p, &insns, coalesce::JOIN_SELECT | coalesce::JOIN_BIND)?;
    coalesce::join_values(p, &insns, coalesce::JOIN_MOV)?;

    linear_scan::allocate_constrained(p, &insns)?;
    linear_scan::linear_scan(p, &insns)
}

/// Number every instruction by final program order so live intervals can be
/// plain serial ranges.
fn order_instructions(p: &mut Program, root: BlockId) -> Vec<InstId> {
    let mut insns = Vec::new();
    for b in p.emission_order(root) {
        for i in p.block_insns(b) {
            p[i].serial = insns.len() as i32;
            insns.push(i);
        }
    }
    insns
}

/// A merge block with several predecessors needs its own else block when a
/// predecessor branches two ways; the phi copy cannot go into a block whose
/// other successor must not execute it.
fn needs_else_block(p: &Program, b: BlockId, pred: BlockId) -> bool {
    let forward_outs = p[pred]
        .out
        .iter()
        .filter(|(_, k)| matches!(k, EdgeKind::Forward | EdgeKind::Fake))
        .count();
    p[b].num_in() > 1 && forward_outs == 2
}

/// The phi source slot whose definition reaches `pred`, preferring the
/// latest definition on the path. `None` when only the loop-carried def of
/// the phi itself flows in over the back edge.
fn phi_operand_for_block(p: &mut Program, phi: InstId, pred: BlockId) -> Option<usize> {
    let mut best: Option<(usize, BlockId)> = None;
    for s in 0..MAX_SRCS {
        let Some(r) = p[phi].src(s).copied() else { continue };
        // A slot already rerouted through a Mov is judged by the original.
        let v = if r.flags & REF_FLAG_PHI_MOV != 0 {
            let mv = p[r.value].def?;
            p[mv].src(0)?.value
        } else {
            r.value
        };
        let Some(db) = p[v].def.and_then(|d| p[d].bb) else { continue };
        if !p.reachable_by(pred, db, None) {
            continue;
        }
        let replace = match best {
            Some((_, bb)) => !p.reachable_by(bb, db, None),
            None => true,
        };
        if replace {
            best = Some((s, db));
        }
    }
    let (slot, best_bb) = best?;
    let phi_bb = p[phi].bb?;
    if p.reachable_by(pred, phi_bb, None) && !p.reachable_by(best_bb, phi_bb, None) {
        return None;
    }
    Some(slot)
}

/// Reroute every phi operand through a fresh Mov at the end of the
/// predecessor it flows in from. This breaks liveness conflicts between phi
/// operands (the copies are what coalescing later tries to erase) and keeps
/// loop-carried values alive to the bottom of the loop.
fn generate_phi_movs(p: &mut Program, seq: u32, b: BlockId) -> Result<(), CompileError> {
    p[b].pass_seq = seq;

    for n in 0..p[b].num_in() {
        let (pred, in_kind) = p[b].ins[n];
        let mut pn = pred;

        if needs_else_block(p, b, pred) {
            pn = p.new_block()?;
            for o in 0..p[pred].out.len() {
                if p[pred].out[o].0 == b {
                    p[pred].out[o].0 = pn;
                }
            }
            if let Some(exit) = p[pred].exit {
                if p[exit].target == Some(b) {
                    p[exit].target = Some(pn);
                }
            }
            p[b].ins[n] = (pn, in_kind);
            p[pn].out.push((b, EdgeKind::Forward));
            p[pn].ins.push((pred, EdgeKind::Forward));
        }

        for phi in p.block_phis(b) {
            let mut slot = phi_operand_for_block(p, phi, pred);
            let val = match slot {
                Some(s) => {
                    let r = *p[phi].src(s).unwrap();
                    if r.flags & REF_FLAG_PHI_MOV != 0 {
                        // Encountered twice (loop back edge); reroute the
                        // original value through one more copy.
                        slot = None;
                        let mv = p[r.value].def.ok_or(CompileError::Internal(
                            "phi operand marker without defining mov",
                        ))?;
                        p[mv].src(0).unwrap().value
                    } else {
                        r.value
                    }
                }
                None => p[phi].defs[0],
            };
            let slot = match slot {
                Some(s) => s,
                None => (0..MAX_SRCS)
                    .find(|&s| match p[phi].src(s) {
                        Some(r) => r.value == val,
                        None => true,
                    })
                    .ok_or(CompileError::Internal("phi source slots exhausted"))?,
            };

            let mv = p.new_inst(Opcode::Mov)?;
            let d = p.new_value_like(val)?;
            p.add_def(mv, d);
            p.set_src(mv, 0, Some(Ref::new(val)));
            match p[pn].exit {
                Some(exit) if p[exit].target.is_some() => p.insert_before(exit, mv),
                _ => p.append(pn, mv),
            }

            p.set_src(phi, slot, Some(Ref::new(d)));
            if let Some(r) = p[phi].srcs[slot].as_mut() {
                r.flags |= REF_FLAG_PHI_MOV;
            }
        }

        if pn != pred && p[pn].exit.is_some() {
            let br = p.new_inst(Opcode::Bra)?;
            p[br].target = Some(b);
            p[br].terminator = true;
            p.append(pn, br);
        }
    }

    for o in 0..p[b].out.len() {
        let succ = p[b].out[o].0;
        if p[succ].pass_seq < seq {
            generate_phi_movs(p, seq, succ)?;
        }
    }
    Ok(())
}
