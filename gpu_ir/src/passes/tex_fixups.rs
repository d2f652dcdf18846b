//! Late texture cleanups.
//!
//! `tex_mask` drops unused components from texture fetches and compacts
//! their result lists. `run` patches two register-allocation hazards: an
//! indexed wide load must keep its pointer live across the whole access,
//! and a Bind's operands must be copies so the allocator is free to place
//! the vector without tearing earlier values apart.

use crate::cfg::BlockId;
use crate::error::CompileError;
use crate::instruction::{InstId, OpExt, Opcode, MAX_SRCS};
use crate::program::Program;
use crate::value::{Ref, ValueId};
use arrayvec::ArrayVec;

/// Trim dead results from texture instructions and update the fetch mask.
pub fn tex_mask(p: &mut Program) {
    let texes: Vec<InstId> = p
        .inst_ids()
        .into_iter()
        .filter(|&i| p[i].opcode.is_tex())
        .collect();

    for i in texes {
        let mut mask = 0u8;
        let mut live: ArrayVec<ValueId, { crate::instruction::MAX_DEFS }> = ArrayVec::new();
        let mut dead: ArrayVec<ValueId, { crate::instruction::MAX_DEFS }> = ArrayVec::new();
        for (c, &d) in p[i].defs.iter().enumerate() {
            if p[d].refc > 0 {
                mask |= 1 << c;
                live.push(d);
            } else {
                dead.push(d);
            }
        }
        if mask == 0 {
            // Fully dead fetches are left for DCE.
            continue;
        }
        // Results stay packed from the first register, so dead components
        // tail the list rather than vanish.
        live.extend(dead.iter().copied());
        p[i].defs = live;
        if let OpExt::Tex(ref mut info) = p[i].ext {
            info.mask = mask;
        }
    }
}

/// A wide indexed load consumes its pointer mid-access. Append a dummy use
/// so the pointer's live range covers the load's whole result range.
fn extend_pointer_liveness(p: &mut Program, i: InstId) -> Result<(), CompileError> {
    let Some(ind) = p[i].indirect else { return Ok(()) };
    let mem = match p[i].src(0) {
        Some(r) => r.value,
        None => return Ok(()),
    };
    if p[mem].size < 8 {
        return Ok(());
    }
    let ptr = p[i].src(ind).unwrap().value;
    let hold = p.new_inst(Opcode::Undef)?;
    p.set_src(hold, 0, Some(Ref::new(ptr)));
    p.insert_after(i, hold);
    Ok(())
}

/// Feed every Bind operand through its own Mov so the sources become
/// coalescable copies instead of arbitrary long-lived values.
fn isolate_bind_srcs(p: &mut Program, i: InstId) -> Result<(), CompileError> {
    for s in 0..MAX_SRCS {
        let Some(r) = p[i].src(s).copied() else { continue };
        let mv = p.new_inst(Opcode::Mov)?;
        let d = p.new_value_like(r.value)?;
        p.add_def(mv, d);
        p.set_src(mv, 0, Some(r));
        p.insert_before(i, mv);
        p.set_src(i, s, Some(Ref::new(d)));
    }
    Ok(())
}

pub fn run(p: &mut Program, root: BlockId) -> Result<(), CompileError> {
    for b in p.pass_order(root) {
        for i in p.block_insns(b) {
            if !p.contains_inst(i) {
                continue;
            }
            match p[i].opcode {
                Opcode::Ld | Opcode::Vfetch => extend_pointer_liveness(p, i)?,
                Opcode::Bind => isolate_bind_srcs(p, i)?,
                _ => {}
            }
        }
    }
    Ok(())
}
