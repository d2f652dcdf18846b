//! Combine adjacent constant-bank loads and attribute fetches into wider
//! ones. Two 4-byte loads of c0[0x10] and c0[0x14] become one 8-byte load
//! feeding two results.

use crate::cfg::BlockId;
use crate::error::CompileError;
use crate::instruction::{InstId, Opcode};
use crate::program::Program;
use crate::value::{RegFile, ValueId};
use arrayvec::ArrayVec;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Space {
    Const(u8),
    Attr,
}

struct MemRecord {
    space: Space,
    /// Indirect pointer value, if the access is indexed.
    base: Option<ValueId>,
    inst: InstId,
    ofst: u32,
    size: u32,
}

const MEM_RECORD_LIMIT: usize = 1024;

fn load_space(p: &Program, i: InstId) -> Option<Space> {
    let mem = p[i].src(0)?.value;
    match p[i].opcode {
        Opcode::Ld => match p[mem].file {
            RegFile::MemC(bank) => Some(Space::Const(bank)),
            _ => None,
        },
        Opcode::Vfetch => Some(Space::Attr),
        _ => None,
    }
}

/// Widen the recorded load to also produce `ld`'s results, then delete `ld`.
/// The loads cover adjacent, non-overlapping addresses.
fn combine_load(p: &mut Program, rec: &mut MemRecord, ld: InstId) -> Result<(), CompileError> {
    let fv = rec.inst;
    let mem = p[ld].src(0).unwrap().value;
    let msize = p[mem].size as u32;
    let maddr = p[mem].address;
    let size = rec.size + msize;
    debug_assert!(rec.size < 16);

    let mut defs: Vec<ValueId> = p[fv].defs.iter().copied().collect();
    let ld_defs: Vec<ValueId> = p[ld].defs.iter().copied().collect();

    if rec.ofst > maddr {
        // The new load is the lower half.
        if (size == 8 && maddr & 3 != 0) || (size > 8 && maddr & 7 != 0) {
            return Ok(());
        }
        rec.ofst = maddr;
        let mut all = ld_defs;
        all.extend(defs);
        defs = all;
    } else {
        if (size == 8 && rec.ofst & 3 != 0) || (size > 8 && rec.ofst & 7 != 0) {
            return Ok(());
        }
        defs.extend(ld_defs);
    }

    let mut dv: ArrayVec<ValueId, { crate::instruction::MAX_DEFS }> = ArrayVec::new();
    for d in defs {
        dv.push(d);
    }
    p[fv].defs = dv;
    let fv_defs: Vec<ValueId> = p[fv].defs.iter().copied().collect();
    for d in fv_defs {
        p[d].def = Some(fv);
    }

    // The memory operand may be shared (CSE), give the widened load its own.
    let old_mem = p[fv].src(0).unwrap().value;
    let mem_val = if p[old_mem].refc > 1 {
        let nv = p.new_value_like(old_mem)?;
        p[nv].address = p[old_mem].address;
        p.set_src(fv, 0, Some(crate::value::Ref::new(nv)));
        nv
    } else {
        old_mem
    };
    p[mem_val].address = rec.ofst;
    p[mem_val].size = size as u8;
    rec.size = size;

    // Keep the combined results out of the deleted instruction's def list.
    p[ld].defs.clear();
    p.delete_inst(ld);
    Ok(())
}

pub fn run(p: &mut Program, root: BlockId) -> Result<(), CompileError> {
    let mut total = 0usize;
    for b in p.pass_order(root) {
        let mut records: Vec<MemRecord> = Vec::new();
        for ld in p.block_insns(b) {
            if !p.contains_inst(ld) {
                continue;
            }
            let Some(space) = load_space(p, ld) else { continue };
            if p[ld].defs.first().is_some_and(|&d| p[d].refc == 0) {
                continue;
            }
            let mem = p[ld].src(0).unwrap().value;
            let ofst = p[mem].address;
            let msize = p[mem].size as u32;
            let base = p[ld]
                .indirect
                .and_then(|s| p[ld].src(s))
                .map(|r| r.value);

            let found = records.iter().position(|it| {
                if it.space != space || it.base != base {
                    return false;
                }
                if (it.ofst >> 4) != (ofst >> 4) {
                    return false;
                }
                if it.ofst + it.size != ofst && it.ofst.wrapping_sub(msize) != ofst {
                    return false;
                }
                // Only an attribute fetch can load exactly 12 bytes.
                if p[ld].opcode == Opcode::Ld && it.size + msize == 12 {
                    return false;
                }
                // The combined load must not straddle a word-pair boundary.
                if it.ofst < ofst {
                    it.ofst & 0xf != 4
                } else {
                    ofst & 0xf != 4
                }
            });

            match found {
                Some(n) => {
                    combine_load(p, &mut records[n], ld)?;
                    total += 1;
                }
                None if records.len() < MEM_RECORD_LIMIT => {
                    records.push(MemRecord {
                        space,
                        base,
                        inst: ld,
                        ofst,
                        size: msize,
                    });
                }
                None => {}
            }
        }
    }
    let _ = total;
    Ok(())
}
