//! Machine-code emission.
//!
//! Runs after allocation: flattens short if/else diamonds into predicated
//! straight-line code, lays the blocks out in final order (eliding branches
//! that would jump to the next instruction), strips everything without a
//! hardware encoding, and packs each surviving instruction into one
//! fixed-width word pair. Address-dependent fields that need the final code
//! or data base go into a relocation table for the loader.

mod encode;
mod flatten;
mod header;

#[cfg(test)]
mod test;

use crate::cfg::BlockId;
use crate::error::CompileError;
use crate::instruction::{InstId, Opcode};
use crate::program::Program;
use crate::source::{ShaderKind, SourceShader};
use crate::value::ValueId;

pub use header::HEADER_WORDS;

/// Every encoded instruction occupies one 64-bit word pair.
pub const INSN_BYTES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Patched with the final code segment base.
    Code,
    /// Patched with the final data (constant buffer) base.
    Data,
}

/// A loader patch: `word[offset/4]` gets `(base + addend)`, shifted and
/// masked into place, once the segment base is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u32,
    pub kind: RelocKind,
    pub addend: u32,
    pub mask: u32,
    /// Left shift when positive, right shift when negative.
    pub shift: i8,
}

impl Relocation {
    pub fn apply(&self, words: &mut [u32], code_base: u32, data_base: u32) {
        let base = match self.kind {
            RelocKind::Code => code_base,
            RelocKind::Data => data_base,
        };
        let v = base.wrapping_add(self.addend);
        let v = if self.shift >= 0 {
            v << self.shift
        } else {
            v >> -self.shift
        };
        let w = &mut words[(self.offset / 4) as usize];
        *w = (*w & !self.mask) | (v & self.mask);
    }
}

/// The encoder's hand-off to the driver-side program object.
#[derive(Debug, Clone)]
pub struct EncodedProgram {
    pub words: Vec<u32>,
    pub relocs: Vec<Relocation>,
    pub header: [u32; HEADER_WORDS],
    pub max_gpr: i32,
}

pub fn encode(p: &mut Program, src: &SourceShader) -> Result<EncodedProgram, CompileError> {
    for root in p.roots.clone() {
        flatten::run(p, root)?;
    }
    let order = pre_emission(p)?;

    let mut has_kil = false;
    let mut enc = encode::Encoder::new(p);
    for &b in &order {
        for i in p.block_insns(b) {
            has_kil |= p[i].opcode == Opcode::Kil;
            enc.instruction(i)?;
        }
    }
    let (words, relocs) = enc.finish();

    let early_z = p.kind == ShaderKind::Fragment && !src.writes_depth && !has_kil;
    let header = header::build(p, src, early_z);

    Ok(EncodedProgram {
        words,
        relocs,
        header,
        max_gpr: p.max_reg.gpr,
    })
}

fn same_phys(p: &Program, a: ValueId, b: ValueId) -> bool {
    p[a].file == p[b].file && p[a].reg.is_some() && p[a].reg == p[b].reg
}

/// Whether `i` has no hardware effect: a pseudo-op, a def the allocator
/// never gave a register (nothing kept it live), or a copy whose source and
/// destination landed in the same physical register.
pub(super) fn is_noop(p: &Program, i: InstId) -> bool {
    let inst = &p[i];
    if inst.opcode.is_pseudo() && inst.opcode != Opcode::Select {
        return true;
    }
    if inst.fixed {
        return false;
    }
    if inst.terminator || inst.is_join {
        return false;
    }
    if let Some(&d) = inst.defs.first() {
        if p[d].reg.is_none() {
            return true;
        }
    }
    if !matches!(inst.opcode, Opcode::Mov | Opcode::Select) {
        return false;
    }
    let d = inst.defs[0];
    let Some(s0) = inst.src(0) else { return false };
    if inst.opcode == Opcode::Select {
        match inst.src(1) {
            Some(s1) if same_phys(p, d, s1.value) => {}
            _ => return false,
        }
    }
    same_phys(p, d, s0.value)
}

/// Final block layout. Walks every root in emission order, assigning each
/// block its byte position and deleting what will not be encoded. An
/// unconditional branch to the block laid out right after it is dead weight;
/// removing one shrinks the program, which is why positions of the already
/// placed blocks are patched in the same sweep.
fn pre_emission(p: &mut Program) -> Result<Vec<BlockId>, CompileError> {
    let fragprog = p.kind == ShaderKind::Fragment;
    let mut list: Vec<BlockId> = Vec::new();

    for root in p.roots.clone() {
        for b in p.emission_order(root) {
            p[b].emit_pos = 0;
            p[b].emit_size = 0;

            let mut j = list.len() as i32 - 1;
            while j >= 0 && p[list[j as usize]].emit_size == 0 {
                j -= 1;
            }
            while j >= 0 {
                let prev = list[j as usize];
                if let Some(exit) = p[prev].exit {
                    if p[exit].opcode == Opcode::Bra
                        && !p[exit].is_predicated()
                        && p[exit].target == Some(b)
                    {
                        p[prev].emit_size -= INSN_BYTES;
                        for k in (j as usize + 1)..list.len() {
                            let later = list[k];
                            p[later].emit_pos -= INSN_BYTES;
                        }
                        p.delete_inst(exit);
                    }
                }
                p[b].emit_pos = p[prev].emit_pos + p[prev].emit_size;
                if p[prev].emit_size > 0 {
                    break;
                }
                j -= 1;
            }
            list.push(b);

            let mut size = 0;
            for i in p.block_insns(b) {
                if is_noop(p, i) || (fragprog && p[i].opcode == Opcode::Export) {
                    p.delete_inst(i);
                } else {
                    size += INSN_BYTES;
                }
            }
            p[b].emit_size = size;
        }
    }
    Ok(list)
}
