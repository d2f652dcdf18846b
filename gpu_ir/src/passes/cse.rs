//! Local common subexpression elimination. Quadratic over each block, which
//! is fine at shader sizes.

use crate::cfg::BlockId;
use crate::instruction::InstId;
use crate::program::Program;

fn defs_compatible(p: &Program, a: InstId, b: InstId) -> bool {
    let (da, db) = (&p[a].defs, &p[b].defs);
    if da.len() != db.len() || da.is_empty() {
        return false;
    }
    da.iter()
        .zip(db.iter())
        .all(|(&x, &y)| p[x].file == p[y].file && p[x].size == p[y].size)
}

fn srcs_equal(p: &Program, a: InstId, b: InstId) -> bool {
    for s in 0..crate::instruction::MAX_SRCS {
        match (p[a].src(s), p[b].src(s)) {
            (None, None) => {}
            (Some(ra), Some(rb)) => {
                if ra.modifier != rb.modifier || ra.value != rb.value {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

pub fn run(p: &mut Program, root: BlockId) {
    for b in p.pass_order(root) {
        let mut replaced = true;
        while replaced {
            replaced = false;
            let insns = p.block_insns(b);
            'outer: for (n, &ir) in insns.iter().enumerate() {
                if !p.contains_inst(ir) || p[ir].fixed {
                    continue;
                }
                for &ik in &insns[..n] {
                    if !p.contains_inst(ik) {
                        continue;
                    }
                    if !p[ir].operation_eq(&p[ik])
                        || p[ir].predicate != p[ik].predicate
                        || p[ir].indirect != p[ik].indirect
                        || !defs_compatible(p, ir, ik)
                        || !srcs_equal(p, ir, ik)
                    {
                        continue;
                    }
                    let pairs: Vec<_> = p[ir]
                        .defs
                        .iter()
                        .copied()
                        .zip(p[ik].defs.iter().copied())
                        .collect();
                    p.delete_inst(ir);
                    for (old, new) in pairs {
                        p.replace_value(old, new);
                    }
                    replaced = true;
                    continue 'outer;
                }
            }
        }
    }
}
