//! Register assignment: constrained vector allocation first, then the
//! general linear scan over live-interval start order.

use super::coalesce;
use crate::error::CompileError;
use crate::instruction::{InstId, Opcode};
use crate::program::Program;
use crate::value::{RegFile, ValueId};

fn file_slot(f: RegFile) -> usize {
    match f {
        RegFile::Gpr => 0,
        RegFile::Pred => 1,
        RegFile::Cond => 2,
        _ => unreachable!("value in non-allocatable file reached the allocator"),
    }
}

/// Occupancy bitmap per allocatable file. A set bit is a taken allocation
/// unit (one GPR slot is 4 bytes, predicates and condition codes 1 unit).
#[derive(Clone)]
pub(super) struct RegSet {
    bits: [[u32; 2]; 3],
}

impl RegSet {
    pub(super) fn new() -> RegSet {
        RegSet { bits: [[0; 2]; 3] }
    }

    fn span(f: RegFile, bytes: u32) -> u32 {
        (bytes >> f.unit_shift()).max(1)
    }

    pub(super) fn occupy(&mut self, p: &mut Program, v: ValueId) {
        let Some(id) = p[v].reg else { return };
        let f = p[v].file;
        let m = (1u32 << Self::span(f, p[v].size as u32)) - 1;
        self.bits[file_slot(f)][(id / 32) as usize] |= m << (id % 32);
        p.max_reg.note(f, id);
    }

    pub(super) fn release(&mut self, p: &Program, v: ValueId) {
        let Some(id) = p[v].reg else { return };
        let f = p[v].file;
        let m = (1u32 << Self::span(f, p[v].size as u32)) - 1;
        self.bits[file_slot(f)][(id / 32) as usize] &= !(m << (id % 32));
    }

    /// Merge another set's occupancy (intersecting the free registers).
    pub(super) fn intersect_free(&mut self, other: &RegSet) {
        for f in 0..3 {
            for w in 0..2 {
                self.bits[f][w] |= other.bits[f][w];
            }
        }
    }

    /// Drop occupancy information outside `umask`. Used by the constrained
    /// allocator, where component `c` only conflicts at positions `c` modulo
    /// the vector stride.
    pub(super) fn keep_only(&mut self, umask: u32) {
        for f in 0..3 {
            for w in 0..2 {
                self.bits[f][w] &= umask;
            }
        }
    }

    /// Claim the first free aligned run wide enough for all `defs` together
    /// and hand out consecutive ids. A three-element vector pads to four.
    /// Returns false when the file is exhausted.
    pub(super) fn assign(&mut self, p: &mut Program, defs: &[ValueId]) -> bool {
        let n = defs.len() as u32;
        let k = if n == 3 { 4 } else { n };
        let f = p[defs[0]].file;
        let fs = file_slot(f);
        let last = f.last_reg();
        let s = Self::span(f, k * p[defs[0]].size as u32);
        let m = (1u32 << s) - 1;

        let mut found = None;
        for w in 0..2u32 {
            if w * 32 > last {
                break;
            }
            if self.bits[fs][w as usize] == u32::MAX {
                continue;
            }
            let mut id = 0;
            while id < 32 {
                if self.bits[fs][w as usize] & (m << id) == 0 {
                    found = Some((w, id));
                    break;
                }
                id += s;
            }
            if found.is_some() {
                break;
            }
        }
        let Some((w, id)) = found else { return false };
        if w * 32 + id + s - 1 > last {
            return false;
        }

        self.bits[fs][w as usize] |= m << id;
        let base = w * 32 + id;
        p.max_reg.note(f, base + s - 1);

        let mut next = base;
        for &d in defs {
            if !p[d].livei.is_empty() {
                p[d].reg = Some(next);
                next += 1;
            }
        }
        true
    }
}

/// Representatives with a live interval, ordered by interval start.
pub(super) fn collect_register_values(
    p: &Program,
    insns: &[InstId],
    assigned_only: bool,
) -> Vec<ValueId> {
    let mut vals = Vec::new();
    for &i in insns {
        if !p.contains_inst(i) {
            continue;
        }
        for &d in p[i].defs.iter() {
            // Joined members lost their interval to the representative.
            if p[d].livei.is_empty() {
                continue;
            }
            if assigned_only && p[d].reg.is_none() {
                continue;
            }
            vals.push(d);
        }
    }
    vals.sort_by_key(|&v| p[v].livei.bgn());
    vals
}

fn vector_size(p: &Program, i: InstId) -> usize {
    match p[i].opcode {
        Opcode::Bind => p[i].defs.len(),
        op if op.is_tex() => p[i].defs.len(),
        _ => 1,
    }
}

/// Allocate vector results (texture fetches, register-group binds) whose
/// components need consecutive registers. The components' intervals differ,
/// so each gets its own conflict set; the sets are reduced to the position
/// the component would occupy inside a candidate run, combined, and the run
/// is claimed in one step or not at all.
pub(super) fn allocate_constrained(
    p: &mut Program,
    insns: &[InstId],
) -> Result<(), CompileError> {
    let mut regvals = collect_register_values(p, insns, true);

    for &i in insns {
        if !p.contains_inst(i) {
            continue;
        }
        let vsize = vector_size(p, i);
        if vsize <= 1 {
            continue;
        }
        debug_assert!(vsize <= 4);

        let mut defs: Vec<ValueId> = Vec::with_capacity(vsize);
        for c in 0..vsize {
            let d = p[i].defs[c];
            defs.push(coalesce::rep(p, d));
        }
        if p[defs[0]].reg.is_some() {
            continue;
        }

        let mut combined: Option<RegSet> = None;
        for (c, &d) in defs.iter().enumerate() {
            let mut set = RegSet::new();
            for &val in &regvals {
                if p[val].reg.is_some() && p[val].livei.overlaps(&p[d].livei) {
                    set.occupy(p, val);
                }
            }
            let mut stride_mask = 0x1111_1111u32;
            if vsize == 2 {
                stride_mask |= stride_mask << 2;
            }
            set.keep_only(stride_mask << c);

            if !p[d].livei.is_empty() {
                regvals.push(d);
            }
            match combined {
                Some(ref mut first) => first.intersect_free(&set),
                None => combined = Some(set),
            }
        }

        let mut set = combined.expect("vector with no components");
        if !set.assign(p, &defs) {
            return Err(CompileError::RegisterAllocation {
                file: p[defs[0]].file,
            });
        }
    }
    Ok(())
}

pub(super) fn linear_scan(p: &mut Program, insns: &[InstId]) -> Result<(), CompileError> {
    let unhandled = collect_register_values(p, insns, false);
    let mut active: Vec<ValueId> = Vec::new();
    let mut inactive: Vec<ValueId> = Vec::new();
    let mut free = RegSet::new();

    for (n, &cur) in unhandled.iter().enumerate() {
        let pos = p[cur].livei.bgn().expect("collected value has an interval");

        let prev_active = std::mem::take(&mut active);
        for v in prev_active {
            if p[v].livei.end().unwrap() <= pos {
                free.release(p, v);
            } else if !p[v].livei.contains(pos) {
                free.release(p, v);
                inactive.push(v);
            } else {
                active.push(v);
            }
        }
        let prev_inactive = std::mem::take(&mut inactive);
        for v in prev_inactive {
            if p[v].livei.end().unwrap() <= pos {
                // Fully handled.
            } else if p[v].livei.contains(pos) {
                free.occupy(p, v);
                active.push(v);
            } else {
                inactive.push(v);
            }
        }

        // Candidate registers: free now, minus everything that will clash
        // later (lifetime holes, and pinned values not reached yet).
        let mut f = free.clone();
        for &v in &inactive {
            if p[v].livei.overlaps(&p[cur].livei) {
                f.occupy(p, v);
            }
        }
        for &v in &unhandled[n + 1..] {
            if p[v].reg.is_some() && p[v].livei.overlaps(&p[cur].livei) {
                f.occupy(p, v);
            }
        }

        if p[cur].reg.is_none() && !f.assign(p, &[cur]) {
            return Err(CompileError::RegisterAllocation { file: p[cur].file });
        }
        active.push(cur);
        free.occupy(p, cur);
    }
    Ok(())
}
