//! Fold constant-bank loads and immediate Movs directly into the source
//! slots of their consumers, after normalizing commutative operand order so
//! the foldable operand sits where the hardware accepts it.

use crate::cfg::BlockId;
use crate::instruction::{InstId, Opcode, MAX_SRCS};
use crate::program::Program;
use crate::value::{Ref, RegFile, ValueId};

fn is_cspace_load(p: &Program, v: ValueId) -> bool {
    match p[v].def {
        Some(i) => {
            p[i].opcode == Opcode::Ld
                && matches!(p[i].src(0).map(|r| p[r.value].file), Some(RegFile::MemC(_)))
        }
        None => false,
    }
}

fn is_imm32_load(p: &Program, v: ValueId) -> bool {
    match p[v].def {
        Some(i) => {
            p[i].opcode == Opcode::Mov
                && matches!(p[i].src(0), Some(r) if p[r.value].is_imm() && p[r.value].size == 4)
        }
        None => false,
    }
}

/// Move a foldable operand into source 1 of commutative operations (the
/// slot the encodings reserve for memory and immediate operands).
fn check_swap_src_0_1(p: &mut Program, i: InstId) {
    let op = p[i].opcode;
    if !op.commutative() && !matches!(op, Opcode::Set(_) | Opcode::Slct(_)) {
        return;
    }
    let (Some(r0), Some(r1)) = (p[i].src(0).copied(), p[i].src(1).copied()) else {
        return;
    };
    if p[r1.value].file != RegFile::Gpr {
        return;
    }

    let swap = if is_cspace_load(p, r0.value) {
        !is_cspace_load(p, r1.value)
    } else if is_imm32_load(p, r0.value) {
        !is_cspace_load(p, r1.value) && !is_imm32_load(p, r1.value)
    } else {
        false
    };
    if !swap {
        return;
    }

    p.set_src(i, 0, Some(r1));
    p.set_src(i, 1, Some(r0));
    match op {
        Opcode::Set(_) => p[i].set_cond = p[i].set_cond.swapped(),
        Opcode::Slct(_) => p[i].set_cond = p[i].set_cond.invert(),
        _ => {}
    }
}

/// Whether `i` can read source `slot` straight from memory / an immediate.
fn can_fold_into(p: &Program, i: InstId, slot: usize, imm: bool) -> bool {
    let op = p[i].opcode;
    if op.is_pseudo() || op.is_flow() || op.is_tex() {
        return false;
    }
    if matches!(
        op,
        Opcode::Ld
            | Opcode::St
            | Opcode::Vfetch
            | Opcode::Export
            | Opcode::Linterp
            | Opcode::Pinterp
            | Opcode::Quadop
            | Opcode::Kil
    ) {
        return false;
    }
    if imm {
        // One immediate, and only where the encodings place it.
        if slot != 1 && !(slot == 0 && op == Opcode::Mov) {
            return false;
        }
    } else if slot > 2 || (slot == 2 && !matches!(op, Opcode::Mad(_))) {
        return false;
    }
    // At most one non-register operand per instruction.
    for (s, r) in p[i].operand_iter() {
        if s != slot && !matches!(p[r.value].file, RegFile::Gpr | RegFile::Pred) {
            return false;
        }
    }
    true
}

pub fn run(p: &mut Program, root: BlockId) {
    for b in p.pass_order(root) {
        for i in p.block_insns(b) {
            if !p.contains_inst(i) {
                continue;
            }
            check_swap_src_0_1(p, i);

            for s in 0..3 {
                let Some(r) = p[i].src(s).copied() else { continue };
                let Some(ld) = p[r.value].def else { continue };
                if p[ld].opcode != Opcode::Ld && p[ld].opcode != Opcode::Mov {
                    continue;
                }
                let imm = p[ld].opcode == Opcode::Mov;
                let mem = match p[ld].src(0) {
                    Some(m) => *m,
                    None => continue,
                };
                let foldable = if imm {
                    p[mem.value].is_imm() && p[mem.value].size == 4
                } else {
                    matches!(p[mem.value].file, RegFile::MemC(_))
                };
                if !foldable || !mem.modifier.is_none() {
                    continue;
                }
                if !can_fold_into(p, i, s, imm) {
                    continue;
                }
                if p[ld].indirect.is_some()
                    && (p[i].indirect.is_some()
                        || !(0..MAX_SRCS).any(|n| n != s && p[i].src(n).is_none()))
                {
                    continue;
                }

                p.set_src(i, s, Some(Ref::with_mod(mem.value, r.modifier)));
                if let Some(ind) = p[ld].indirect {
                    let ptr = p[ld].src(ind).unwrap().value;
                    let free = (0..MAX_SRCS).find(|&n| p[i].src(n).is_none()).unwrap();
                    p[i].indirect = Some(free);
                    p.set_src(i, free, Some(Ref::new(ptr)));
                }
                if p.inst_refcount(ld) == 0 {
                    p.delete_inst(ld);
                }
            }
        }
    }
}
