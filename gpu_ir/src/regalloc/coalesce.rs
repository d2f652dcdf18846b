//! Copy coalescing over the `join` union-find.
//!
//! Joined values share one representative; only the representative keeps a
//! live interval and receives a register. Phi and Mov joins are best-effort
//! (a failed join just leaves a real copy in place), Select and Bind joins
//! are hardware requirements and failing one is a compiler bug.

use crate::error::CompileError;
use crate::instruction::{InstId, Opcode};
use crate::program::Program;
use crate::value::ValueId;

pub(super) const JOIN_PHI: u8 = 1 << 0;
pub(super) const JOIN_SELECT: u8 = 1 << 1;
pub(super) const JOIN_MOV: u8 = 1 << 2;
pub(super) const JOIN_BIND: u8 = 1 << 3;

/// Representative of `v`'s join class, with path compression.
pub(super) fn rep(p: &mut Program, v: ValueId) -> ValueId {
    let mut r = v;
    while p[r].join != r {
        r = p[r].join;
    }
    let mut c = v;
    while p[c].join != r {
        let next = p[c].join;
        p[c].join = r;
        c = next;
    }
    r
}

/// Whether joining `a` and `b` cannot violate an existing assignment. When
/// one side already sits in a register, every other value sharing that
/// register must stay disjoint from the side being pulled in.
fn join_allowed(p: &mut Program, a: ValueId, b: ValueId) -> bool {
    if p[a].file != p[b].file || p[a].size != p[b].size {
        return false;
    }
    let ra = rep(p, a);
    let rb = rep(p, b);
    if p[ra].reg == p[rb].reg {
        return true;
    }
    if p[ra].reg.is_some() && p[rb].reg.is_some() {
        return false;
    }
    let (ra, rb) = if p[rb].reg.is_some() { (rb, ra) } else { (ra, rb) };
    if p[ra].reg == Some(63) {
        // The hardwired zero register takes no new members.
        return false;
    }
    for v in p.value_ids() {
        let rv = rep(p, v);
        if rv == ra || p[rv].reg != p[ra].reg {
            continue;
        }
        if p[rv].livei.overlaps(&p[rb].livei) {
            return false;
        }
    }
    true
}

fn do_join(p: &mut Program, a: ValueId, b: ValueId) {
    let ra = rep(p, a);
    let rb = rep(p, b);
    if ra == rb {
        return;
    }
    if let Some(id) = p[rb].reg {
        p[ra].reg = Some(id);
    }
    let absorbed = std::mem::take(&mut p[rb].livei);
    p[ra].livei.unify(&absorbed);
    p[rb].join = ra;
}

fn try_join(p: &mut Program, a: ValueId, b: ValueId) -> bool {
    let ra = rep(p, a);
    let rb = rep(p, b);
    if ra == rb {
        return true;
    }
    if !join_allowed(p, a, b) {
        return false;
    }
    if p[ra].livei.overlaps(&p[rb].livei) {
        return false;
    }
    do_join(p, a, b);
    true
}

/// Hard join: interval overlap is tolerated (the hardware forces the
/// sharing), but a register-assignment conflict is a bug.
fn join_required(p: &mut Program, a: ValueId, b: ValueId) -> Result<(), CompileError> {
    if !join_allowed(p, a, b) {
        return Err(CompileError::Internal(
            "conflicting register constraint on bind/select operands",
        ));
    }
    do_join(p, a, b);
    Ok(())
}

pub(super) fn join_values(
    p: &mut Program,
    insns: &[InstId],
    mask: u8,
) -> Result<(), CompileError> {
    for &i in insns {
        if !p.contains_inst(i) {
            continue;
        }
        match p[i].opcode {
            Opcode::Phi if mask & JOIN_PHI != 0 => {
                let def = p[i].defs[0];
                let srcs: Vec<ValueId> = p[i].operand_iter().map(|(_, r)| r.value).collect();
                for s in srcs {
                    // Best effort; a leftover copy is merely slower.
                    let _ = try_join(p, def, s);
                }
            }
            Opcode::Select if mask & JOIN_SELECT != 0 => {
                let def = p[i].defs[0];
                let srcs: Vec<ValueId> = p[i].operand_iter().map(|(_, r)| r.value).collect();
                for s in srcs {
                    join_required(p, def, s)?;
                }
            }
            Opcode::Bind if mask & JOIN_BIND != 0 => {
                for c in 0..p[i].defs.len() {
                    let d = p[i].defs[c];
                    let Some(r) = p[i].src(c).copied() else { continue };
                    join_required(p, d, r.value)?;
                }
            }
            Opcode::Mov if mask & JOIN_MOV != 0 => {
                if p[i].defs.is_empty() {
                    continue;
                }
                let Some(r) = p[i].src(0).copied() else { continue };
                let single = p[r.value]
                    .def
                    .is_some_and(|d| p[d].defs.len() < 2);
                if single {
                    try_join(p, p[i].defs[0], r.value);
                }
            }
            _ => {}
        }
    }
    Ok(())
}
